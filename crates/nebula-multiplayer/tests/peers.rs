//! UDP peers becoming registry sessions.

use std::sync::Arc;
use std::time::{Duration, Instant};

use nebula_multiplayer::{Dispatch, PeerSessions, Session, SessionEndpoint, SessionRegistry};
use nebula_net::messages::{Chat, Hello, Ping};
use nebula_net::{MessageKind, MessageRegistry, NetMessage, encode_frame};
use nebula_rudp::{Event, Host, HostConfig, Packet, PeerId};

struct Server {
    host: Host,
    sessions: Arc<SessionRegistry>,
    peers: PeerSessions,
}

impl Server {
    fn new() -> Self {
        let host = Host::bind("127.0.0.1:0".parse().unwrap(), HostConfig::default()).unwrap();
        let sessions = Arc::new(SessionRegistry::new());
        let peers = PeerSessions::new(sessions.clone(), MessageRegistry::shared());
        Self {
            host,
            sessions,
            peers,
        }
    }

    fn service(&mut self) {
        if let Some(event) = self.host.service(Duration::from_millis(1)).unwrap() {
            self.peers.handle_event(event);
        }
    }
}

fn client() -> Host {
    Host::bind("127.0.0.1:0".parse().unwrap(), HostConfig::default()).unwrap()
}

/// Service both sides until `done` holds.
fn pump(server: &mut Server, client: &mut Host, mut done: impl FnMut(&Server, &[Event]) -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut events = Vec::new();
    while !done(server, &events) {
        assert!(Instant::now() < deadline, "gave up waiting; client: {events:?}");
        server.service();
        if let Some(event) = client.service(Duration::from_millis(1)).unwrap() {
            events.push(event);
        }
    }
}

fn connect(server: &mut Server, client: &mut Host) -> PeerId {
    let peer = client.connect(server.host.local_addr(), 1, 0).unwrap();
    pump(server, client, |server, events| {
        server.peers.len() == 1 && events.iter().any(|e| matches!(e, Event::Connect { .. }))
    });
    peer
}

fn send(client: &mut Host, peer: PeerId, message: &dyn NetMessage) {
    client
        .send(peer, 0, Packet::reliable(encode_frame(message).unwrap()))
        .unwrap();
}

#[test]
fn test_connect_registers_session_and_messages_reach_inbox() {
    let mut server = Server::new();
    let mut client = client();
    let to_server = connect(&mut server, &mut client);

    // Registration takes effect at the next poll.
    assert_eq!(server.sessions.pending(), (1, 0));
    server.sessions.poll(&mut |_: &Arc<Session>, _: Box<dyn NetMessage>| Dispatch::Handled);
    assert_eq!(server.sessions.len(), 1);

    send(
        &mut client,
        to_server,
        &Hello {
            protocol_version: 1,
            name: "ada".into(),
        },
    );
    send(
        &mut client,
        to_server,
        &Chat {
            sender: 0,
            text: "hello".into(),
        },
    );
    let mut received: Vec<String> = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(10);
    while received.len() < 2 {
        assert!(Instant::now() < deadline, "received only {received:?}");
        server.service();
        client.service(Duration::from_millis(1)).unwrap();
        server
            .sessions
            .poll(&mut |session: &Arc<Session>, message: Box<dyn NetMessage>| {
                assert!(matches!(session.endpoint(), SessionEndpoint::Peer(_)));
                if let Some(hello) = message.downcast_ref::<Hello>() {
                    session.set_name(hello.name.clone());
                    received.push(format!("hello {}", hello.name));
                } else if let Some(chat) = message.downcast_ref::<Chat>() {
                    received.push(format!("{}: {}", session.name(), chat.text));
                } else {
                    return Dispatch::Unhandled(message);
                }
                Dispatch::Handled
            });
    }
    assert_eq!(received, vec!["hello ada", "ada: hello"]);
}

#[test]
fn test_reply_through_session_send() {
    let mut server = Server::new();
    let mut client = client();
    let to_server = connect(&mut server, &mut client);
    server.sessions.poll(&mut |_: &Arc<Session>, _: Box<dyn NetMessage>| Dispatch::Handled);

    send(&mut client, to_server, &Ping { nonce: 9 });
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut pong = None;
    while pong.is_none() {
        assert!(Instant::now() < deadline, "no pong");
        server.service();
        let host = &mut server.host;
        server
            .sessions
            .poll(&mut |session: &Arc<Session>, message: Box<dyn NetMessage>| {
                let Some(ping) = message.downcast_ref::<Ping>() else {
                    return Dispatch::Unhandled(message);
                };
                session
                    .send(host, 0, Box::new(nebula_net::messages::Pong { nonce: ping.nonce }))
                    .unwrap();
                Dispatch::Handled
            });
        if let Some(Event::Receive { packet, .. }) = client.service(Duration::from_millis(1)).unwrap()
        {
            let message = MessageRegistry::shared().create_message(packet.data()).unwrap();
            pong = message
                .downcast_ref::<nebula_net::messages::Pong>()
                .map(|pong| pong.nonce);
        }
    }
    assert_eq!(pong, Some(9));
}

#[test]
fn test_disconnect_deregisters_session() {
    let mut server = Server::new();
    let mut client = client();
    let to_server = connect(&mut server, &mut client);
    server.sessions.poll(&mut |_: &Arc<Session>, _: Box<dyn NetMessage>| Dispatch::Handled);
    assert_eq!(server.sessions.len(), 1);

    let mut session = None;
    server.sessions.for_each(|s| session = Some(s.clone()));
    let session = session.unwrap();
    assert!(session.is_active());

    client.disconnect(to_server, 0).unwrap();
    pump(&mut server, &mut client, |server, _| server.peers.is_empty());

    assert!(!session.is_active());
    assert_eq!(server.sessions.pending(), (0, 1));
    server.sessions.poll(&mut |_: &Arc<Session>, _: Box<dyn NetMessage>| Dispatch::Handled);
    assert!(server.sessions.is_empty());
}

#[test]
fn test_truncated_frame_is_dropped() {
    let mut server = Server::new();
    let mut client = client();
    let to_server = connect(&mut server, &mut client);
    server.sessions.poll(&mut |_: &Arc<Session>, _: Box<dyn NetMessage>| Dispatch::Handled);

    // Header promises 8 body bytes but carries one.
    client
        .send(to_server, 0, Packet::reliable(vec![Chat::KIND, 0x00, 0x08, 0x00]))
        .unwrap();
    send(&mut client, to_server, &Ping { nonce: 3 });

    let mut nonces = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(10);
    while nonces.is_empty() {
        assert!(Instant::now() < deadline, "ping never arrived");
        server.service();
        client.service(Duration::from_millis(1)).unwrap();
        server
            .sessions
            .poll(&mut |_: &Arc<Session>, message: Box<dyn NetMessage>| {
                nonces.push(message.downcast_ref::<Ping>().map(|p| p.nonce));
                Dispatch::Handled
            });
    }
    assert_eq!(nonces, vec![Some(3)]);
}
