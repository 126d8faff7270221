//! Thread-safe set of live sessions, drained by the simulation thread.
//!
//! Registration and removal can happen on any thread (accept callbacks,
//! the host service loop) and only take effect at the start of the next
//! [`SessionRegistry::poll`], so the set a poll iterates is stable for the
//! whole pass. Removal also flips the session inactive straight away, which
//! stops a poll already in progress from handing out more of its messages.

use std::collections::BTreeMap;
use std::sync::Arc;

use nebula_net::NetMessage;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::session::{Session, SessionId};

/// What a [`SessionHandler`] did with a message.
#[derive(Debug)]
pub enum Dispatch {
    Handled,
    /// Not recognised; the registry logs and drops it.
    Unhandled(Box<dyn NetMessage>),
}

/// Receives every message drained during a poll.
pub trait SessionHandler {
    fn handle(&mut self, session: &Arc<Session>, message: Box<dyn NetMessage>) -> Dispatch;
}

impl<F> SessionHandler for F
where
    F: FnMut(&Arc<Session>, Box<dyn NetMessage>) -> Dispatch,
{
    fn handle(&mut self, session: &Arc<Session>, message: Box<dyn NetMessage>) -> Dispatch {
        self(session, message)
    }
}

#[derive(Default)]
struct Pending {
    add: Vec<Arc<Session>>,
    remove: Vec<SessionId>,
}

/// Outcome of one [`SessionRegistry::poll`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollStats {
    pub added: usize,
    pub removed: usize,
    pub handled: usize,
    pub unhandled: usize,
}

#[derive(Default)]
pub struct SessionRegistry {
    live: Mutex<BTreeMap<SessionId, Arc<Session>>>,
    pending: Mutex<Pending>,
    poll_lock: Mutex<()>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `session` for addition at the next poll. Registering a session
    /// that is already live or queued does nothing, and so does registering
    /// one that was deregistered: ended sessions stay ended.
    pub fn register(&self, session: Arc<Session>) {
        if !session.is_active() {
            debug!(session = %session.id(), "ignoring registration of ended session");
            return;
        }
        let id = session.id();
        let mut pending = self.pending.lock();
        if pending.add.iter().any(|s| s.id() == id) || self.live.lock().contains_key(&id) {
            return;
        }
        trace!(session = %id, "session queued");
        pending.add.push(session);
    }

    /// Mark the session inactive now and queue its removal for the next poll.
    /// Unknown or already removed ids are ignored.
    pub fn deregister(&self, id: SessionId) {
        let mut pending = self.pending.lock();
        let session = pending
            .add
            .iter()
            .find(|s| s.id() == id)
            .cloned()
            .or_else(|| self.live.lock().get(&id).cloned());
        let Some(session) = session else {
            return;
        };
        if session.deactivate() {
            trace!(session = %id, "session removal queued");
            pending.remove.push(id);
        }
    }

    /// Apply queued changes, then drain every live session's inbox through
    /// `handler` in id order.
    pub fn poll(&self, handler: &mut impl SessionHandler) -> PollStats {
        let _guard = self.poll_lock.lock();
        let mut stats = PollStats::default();

        let Pending { add, remove } = std::mem::take(&mut *self.pending.lock());
        let sessions: Vec<Arc<Session>> = {
            let mut live = self.live.lock();
            for session in add {
                debug!(session = %session.id(), "session added");
                live.insert(session.id(), session);
                stats.added += 1;
            }
            for id in remove {
                if live.remove(&id).is_some() {
                    debug!(session = %id, "session removed");
                    stats.removed += 1;
                }
            }
            live.values().cloned().collect()
        };

        for session in &sessions {
            while session.is_active() {
                let Some(message) = session.try_pop() else {
                    break;
                };
                match handler.handle(session, message) {
                    Dispatch::Handled => stats.handled += 1,
                    Dispatch::Unhandled(message) => {
                        warn!(
                            session = %session.id(),
                            kind = message.kind(),
                            message = %message.to_display_string(),
                            "unhandled message"
                        );
                        stats.unhandled += 1;
                    }
                }
            }
        }
        stats
    }

    /// Number of live sessions, not counting queued changes.
    pub fn len(&self) -> usize {
        self.live.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.lock().is_empty()
    }

    /// Live session by id.
    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.live.lock().get(&id).cloned()
    }

    /// Visit live sessions in id order. Safe to call from inside a poll
    /// handler.
    pub fn for_each(&self, mut f: impl FnMut(&Arc<Session>)) {
        let sessions: Vec<Arc<Session>> = self.live.lock().values().cloned().collect();
        for session in &sessions {
            f(session);
        }
    }

    /// Queued (additions, removals) waiting for the next poll.
    pub fn pending(&self) -> (usize, usize) {
        let pending = self.pending.lock();
        (pending.add.len(), pending.remove.len())
    }
}
