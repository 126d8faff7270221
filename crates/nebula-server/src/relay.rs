//! Message handling for the relay: chat fan-out, ping replies and
//! handshakes.

use std::sync::Arc;

use nebula_multiplayer::{Dispatch, Session, SessionHandler, SessionId, SessionRegistry};
use nebula_net::NetMessage;
use nebula_net::messages::{Chat, Hello, Ping, Pong};
use nebula_rudp::Host;
use tracing::{debug, info, warn};

/// Version a client must announce in [`Hello`].
pub const PROTOCOL_VERSION: u16 = 1;

/// Reliable channel relayed messages go out on for UDP sessions.
pub const RELAY_CHANNEL: u8 = 0;

/// Handles one poll's worth of messages.
pub struct Relay<'a> {
    pub host: &'a mut Host,
    pub sessions: &'a SessionRegistry,
}

impl Relay<'_> {
    fn send(&mut self, to: &Session, message: Box<dyn NetMessage>) {
        if let Err(e) = to.send(self.host, RELAY_CHANNEL, message) {
            debug!(session = %to.id(), error = %e, "send failed");
        }
    }

    fn hello(&mut self, session: &Arc<Session>, hello: &Hello) {
        if hello.protocol_version != PROTOCOL_VERSION {
            warn!(
                session = %session.id(),
                version = hello.protocol_version,
                "protocol mismatch, closing session"
            );
            if let Err(e) = session.close(self.host) {
                debug!(session = %session.id(), error = %e, "close failed");
            }
            self.sessions.deregister(session.id());
            return;
        }
        info!(session = %session.id(), name = %hello.name, "session ready");
        session.set_name(hello.name.clone());
        session.set_ready(true);
    }

    /// Forward to every other ready session, stamped with the sender's id.
    fn chat(&mut self, from: &Arc<Session>, chat: &Chat) {
        let relayed = Chat {
            sender: session_tag(from.id()),
            text: chat.text.clone(),
        };
        debug!(session = %from.id(), text = %relayed.text, "chat");
        let mut targets = Vec::new();
        self.sessions.for_each(|session| {
            if session.id() != from.id() && session.is_active() && session.is_ready() {
                targets.push(session.clone());
            }
        });
        for target in targets {
            self.send(&target, Box::new(relayed.clone()));
        }
    }
}

impl SessionHandler for Relay<'_> {
    fn handle(&mut self, session: &Arc<Session>, message: Box<dyn NetMessage>) -> Dispatch {
        if let Some(hello) = message.downcast_ref::<Hello>() {
            self.hello(session, hello);
        } else if let Some(ping) = message.downcast_ref::<Ping>() {
            self.send(session, Box::new(Pong { nonce: ping.nonce }));
        } else if !session.is_ready() {
            debug!(session = %session.id(), kind = message.kind(), "message before hello");
            return Dispatch::Unhandled(message);
        } else if let Some(chat) = message.downcast_ref::<Chat>() {
            self.chat(session, chat);
        } else {
            return Dispatch::Unhandled(message);
        }
        Dispatch::Handled
    }
}

/// `Chat::sender` for sessions whose id does not fit the 32-bit wire field.
pub const UNATTRIBUTED_SENDER: u32 = u32::MAX;

/// Wire identity of a session in relayed chat. Ids at or past
/// [`UNATTRIBUTED_SENDER`] all map to it rather than wrapping onto live ids.
fn session_tag(id: SessionId) -> u32 {
    u32::try_from(id.0)
        .ok()
        .filter(|&tag| tag != UNATTRIBUTED_SENDER)
        .unwrap_or(UNATTRIBUTED_SENDER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_tag_keeps_small_ids() {
        assert_eq!(session_tag(SessionId(1)), 1);
        assert_eq!(session_tag(SessionId(u64::from(u32::MAX) - 1)), u32::MAX - 1);
    }

    #[test]
    fn test_session_tag_never_wraps() {
        let wrapped = u64::from(u32::MAX) + 2;
        assert_eq!(session_tag(SessionId(wrapped)), UNATTRIBUTED_SENDER);
        assert_eq!(session_tag(SessionId(u64::from(u32::MAX))), UNATTRIBUTED_SENDER);
        assert_eq!(session_tag(SessionId(u64::MAX)), UNATTRIBUTED_SENDER);
    }
}
