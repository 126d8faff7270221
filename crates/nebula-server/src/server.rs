//! The relay server: a framed stream listener and a reliable UDP host
//! feeding one session registry.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use nebula_config::NetworkConfig;
use nebula_multiplayer::{PeerSessions, PollStats, SessionRegistry, StreamAcceptor};
use nebula_net::{MessageRegistry, SocketEngine, StreamListener};
use nebula_rudp::Host;

use crate::error::ServerError;
use crate::relay::Relay;
use crate::settings;

pub struct Server {
    listener: StreamListener,
    host: Host,
    sessions: Arc<SessionRegistry>,
    peers: PeerSessions,
}

impl Server {
    pub fn bind(engine: &SocketEngine, network: &NetworkConfig) -> Result<Self, ServerError> {
        let sessions = Arc::new(SessionRegistry::new());
        let acceptor = StreamAcceptor::new(sessions.clone(), settings::socket_config(network));
        let listener = StreamListener::bind(
            engine,
            settings::stream_addr(network)?,
            Arc::new(acceptor),
        )?;
        let host = Host::bind(settings::udp_addr(network)?, settings::host_config(network))?;
        let peers = PeerSessions::new(sessions.clone(), MessageRegistry::shared());
        Ok(Self {
            listener,
            host,
            sessions,
            peers,
        })
    }

    pub fn stream_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn udp_addr(&self) -> SocketAddr {
        self.host.local_addr()
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// One tick: drain host events (waiting up to `timeout` for the first),
    /// poll the registry, then flush whatever the handlers queued.
    pub fn step(&mut self, timeout: Duration) -> Result<PollStats, ServerError> {
        let mut wait = timeout;
        while let Some(event) = self.host.service(wait)? {
            self.peers.handle_event(event);
            wait = Duration::ZERO;
        }

        let mut relay = Relay {
            host: &mut self.host,
            sessions: self.sessions.as_ref(),
        };
        let stats = self.sessions.poll(&mut relay);
        self.host.flush();
        Ok(stats)
    }

    /// Run until an unrecoverable error.
    pub fn run(&mut self, tick: Duration) -> Result<(), ServerError> {
        loop {
            self.step(tick)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::PROTOCOL_VERSION;
    use nebula_net::NetMessage;
    use nebula_net::messages::{Chat, Hello, Ping, Pong};
    use nebula_net::{FrameHeader, encode_frame};
    use nebula_rudp::{Event, HostConfig, Packet, PeerId};
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::time::Instant;

    const WAIT: Duration = Duration::from_secs(10);

    fn server() -> Server {
        let network = NetworkConfig {
            bind_address: "127.0.0.1".into(),
            stream_port: 0,
            udp_port: 0,
            ..NetworkConfig::default()
        };
        Server::bind(SocketEngine::global(), &network).unwrap()
    }

    fn step_until(server: &mut Server, mut done: impl FnMut(&Server) -> bool) {
        let deadline = Instant::now() + WAIT;
        while !done(server) {
            assert!(Instant::now() < deadline, "timed out");
            server.step(Duration::from_millis(2)).unwrap();
        }
    }

    struct TcpClient(TcpStream);

    impl TcpClient {
        fn connect(server: &mut Server) -> Self {
            let before = server.sessions().len();
            let stream = TcpStream::connect(server.stream_addr().unwrap()).unwrap();
            stream.set_read_timeout(Some(WAIT)).unwrap();
            step_until(server, |s| s.sessions().len() == before + 1);
            Self(stream)
        }

        fn send(&mut self, message: &dyn NetMessage) {
            self.0.write_all(&encode_frame(message).unwrap()).unwrap();
        }

        fn hello(&mut self, name: &str) {
            self.send(&Hello {
                protocol_version: PROTOCOL_VERSION,
                name: name.into(),
            });
        }

        /// Read one frame while the server keeps stepping on this thread.
        fn recv(&mut self, server: &mut Server) -> Box<dyn NetMessage> {
            self.0.set_nonblocking(true).unwrap();
            let mut frame = Vec::new();
            let mut buf = [0u8; 256];
            let deadline = Instant::now() + WAIT;
            loop {
                if frame.len() >= FrameHeader::LEN {
                    let header = FrameHeader::parse(&frame).unwrap();
                    let total = FrameHeader::LEN + usize::from(header.length);
                    if frame.len() >= total {
                        self.0.set_nonblocking(false).unwrap();
                        return MessageRegistry::shared()
                            .create_message(&frame[..total])
                            .unwrap();
                    }
                }
                assert!(Instant::now() < deadline, "no frame");
                server.step(Duration::from_millis(2)).unwrap();
                match self.0.read(&mut buf) {
                    Ok(0) => panic!("server closed the connection"),
                    Ok(n) => frame.extend_from_slice(&buf[..n]),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                    Err(e) => panic!("read failed: {e}"),
                }
            }
        }
    }

    #[test]
    fn test_ping_answered_over_stream() {
        let mut server = server();
        let mut client = TcpClient::connect(&mut server);
        client.send(&Ping { nonce: 41 });
        let reply = client.recv(&mut server);
        assert_eq!(reply.downcast_ref::<Pong>().unwrap().nonce, 41);
    }

    #[test]
    fn test_chat_relayed_between_stream_clients() {
        let mut server = server();
        let mut alice = TcpClient::connect(&mut server);
        let mut bob = TcpClient::connect(&mut server);
        alice.hello("alice");
        bob.hello("bob");
        step_until(&mut server, |s| {
            let mut ready = 0;
            s.sessions().for_each(|session| ready += usize::from(session.is_ready()));
            ready == 2
        });

        alice.send(&Chat {
            sender: 999,
            text: "hi bob".into(),
        });
        let relayed = bob.recv(&mut server);
        let chat = relayed.downcast_ref::<Chat>().unwrap();
        assert_eq!(chat.text, "hi bob");
        // The relay stamps the real sender instead of trusting the client.
        assert_ne!(chat.sender, 999);
    }

    #[test]
    fn test_hello_records_name() {
        let mut server = server();
        let mut client = TcpClient::connect(&mut server);
        client.hello("carol");
        step_until(&mut server, |s| {
            let mut names = Vec::new();
            s.sessions().for_each(|session| names.push(session.name()));
            names == vec!["carol".to_string()]
        });
    }

    #[test]
    fn test_wrong_protocol_version_ends_session() {
        let mut server = server();
        let mut client = TcpClient::connect(&mut server);
        client.send(&Hello {
            protocol_version: PROTOCOL_VERSION + 1,
            name: "old".into(),
        });
        step_until(&mut server, |s| s.sessions().is_empty());
    }

    #[test]
    fn test_chat_relayed_from_udp_to_stream() {
        let mut server = server();
        let mut tcp = TcpClient::connect(&mut server);
        tcp.hello("tcp");

        let mut udp = Host::bind("127.0.0.1:0".parse().unwrap(), HostConfig::default()).unwrap();
        let to_server: PeerId = udp.connect(server.udp_addr(), 1, 0).unwrap();
        let deadline = Instant::now() + WAIT;
        let mut connected = false;
        while !connected {
            assert!(Instant::now() < deadline, "udp connect timed out");
            server.step(Duration::from_millis(2)).unwrap();
            if let Some(Event::Connect { .. }) = udp.service(Duration::from_millis(2)).unwrap() {
                connected = true;
            }
        }

        for message in [
            encode_frame(&Hello {
                protocol_version: PROTOCOL_VERSION,
                name: "udp".into(),
            })
            .unwrap(),
            encode_frame(&Chat {
                sender: 0,
                text: "from udp".into(),
            })
            .unwrap(),
        ] {
            udp.send(to_server, 0, Packet::reliable(message)).unwrap();
        }
        udp.flush();

        let relayed = tcp.recv(&mut server);
        assert_eq!(relayed.downcast_ref::<Chat>().unwrap().text, "from udp");
    }
}
