//! Session layer shared by the server and clients.
//!
//! Every connected client is a [`Session`], whether it arrived over a framed
//! stream socket or as a reliable-UDP peer. Sessions live in a
//! [`SessionRegistry`] that the simulation thread polls once per tick.
//! [`StreamAcceptor`] and [`PeerSessions`] keep the registry in step with
//! the two transports.

pub mod peers;
pub mod registry;
pub mod session;
pub mod streams;

pub use peers::PeerSessions;
pub use registry::{Dispatch, PollStats, SessionHandler, SessionRegistry};
pub use session::{
    IdGenerator, MessageSource, PeerInbox, SendError, Session, SessionEndpoint, SessionId,
};
pub use streams::StreamAcceptor;
