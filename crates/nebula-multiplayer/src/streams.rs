//! Turns accepted stream connections into registry sessions.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock, Weak};

use nebula_net::{
    CloseReason, ListenHandler, MessageSocket, MessageSocketConfig, MessageSocketHandler,
    SocketEngine, SocketId,
};
use tracing::{info, warn};

use crate::registry::SessionRegistry;
use crate::session::{Session, SessionId};

/// [`ListenHandler`] that wraps every accepted socket in a
/// [`MessageSocket`] and registers it as a session. The session is
/// deregistered when the remote closes or the connection breaks.
pub struct StreamAcceptor {
    sessions: Arc<SessionRegistry>,
    config: MessageSocketConfig,
}

impl StreamAcceptor {
    pub fn new(sessions: Arc<SessionRegistry>, config: MessageSocketConfig) -> Self {
        Self { sessions, config }
    }
}

impl ListenHandler for StreamAcceptor {
    fn on_accept(&self, engine: &SocketEngine, id: SocketId, peer: SocketAddr) {
        let closer = Arc::new(SessionCloser {
            sessions: Arc::downgrade(&self.sessions),
            session: OnceLock::new(),
        });
        let socket = match MessageSocket::from_accepted(
            engine,
            id,
            closer.clone(),
            self.config.clone(),
        ) {
            Ok(socket) => socket,
            Err(e) => {
                warn!(socket = ?id, %peer, error = %e, "failed to wrap accepted socket");
                return;
            }
        };

        let session = Arc::new(Session::from_stream(socket.clone()));
        let _ = closer.session.set(session.id());
        info!(socket = ?id, %peer, session = %session.id(), "stream session opened");
        self.sessions.register(session.clone());
        // Closed before the id was known: the callback found nothing to remove.
        if socket.is_closed() {
            self.sessions.deregister(session.id());
        }
    }
}

struct SessionCloser {
    sessions: Weak<SessionRegistry>,
    session: OnceLock<SessionId>,
}

impl MessageSocketHandler for SessionCloser {
    fn on_close(&self, reason: CloseReason) {
        let (Some(sessions), Some(&id)) = (self.sessions.upgrade(), self.session.get()) else {
            return;
        };
        info!(session = %id, %reason, "stream session closed");
        sessions.deregister(id);
    }
}
