//! Turns reliable-UDP host events into registry sessions.

use std::collections::HashMap;
use std::sync::Arc;

use nebula_net::MessageRegistry;
use nebula_rudp::{Event, PeerId};
use tracing::{debug, info, warn};

use crate::registry::SessionRegistry;
use crate::session::{PeerInbox, Session};

struct PeerEntry {
    session: Arc<Session>,
    inbox: Arc<PeerInbox>,
}

/// Keeps one session per connected peer. Feed it every event returned by
/// [`nebula_rudp::Host::service`]; each packet must hold exactly one frame.
pub struct PeerSessions {
    sessions: Arc<SessionRegistry>,
    messages: Arc<MessageRegistry>,
    peers: HashMap<PeerId, PeerEntry>,
}

impl PeerSessions {
    pub fn new(sessions: Arc<SessionRegistry>, messages: Arc<MessageRegistry>) -> Self {
        Self {
            sessions,
            messages,
            peers: HashMap::new(),
        }
    }

    /// Apply one host event. Returns the session it concerned, if any.
    pub fn handle_event(&mut self, event: Event) -> Option<Arc<Session>> {
        match event {
            Event::Connect { peer, data } => {
                let inbox = Arc::new(PeerInbox::new());
                let session = Arc::new(Session::from_peer(peer, inbox.clone()));
                info!(%peer, session = %session.id(), data, "peer session opened");
                self.sessions.register(session.clone());
                if let Some(stale) = self.peers.insert(
                    peer,
                    PeerEntry {
                        session: session.clone(),
                        inbox,
                    },
                ) {
                    self.sessions.deregister(stale.session.id());
                }
                Some(session)
            }
            Event::Receive {
                peer,
                channel,
                packet,
            } => {
                let Some(entry) = self.peers.get(&peer) else {
                    debug!(%peer, channel, "packet from peer without session");
                    return None;
                };
                match self.messages.create_message(packet.data()) {
                    Ok(message) => entry.inbox.push(message),
                    Err(e) => warn!(
                        %peer,
                        channel,
                        len = packet.data().len(),
                        error = %e,
                        "dropping undecodable packet"
                    ),
                }
                Some(entry.session.clone())
            }
            Event::Disconnect { peer, cause, data } => {
                let entry = self.peers.remove(&peer)?;
                info!(%peer, session = %entry.session.id(), %cause, data, "peer session closed");
                self.sessions.deregister(entry.session.id());
                Some(entry.session)
            }
        }
    }

    pub fn session(&self, peer: PeerId) -> Option<&Arc<Session>> {
        self.peers.get(&peer).map(|entry| &entry.session)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
