//! Stream transport for the engine: a readiness-driven socket engine, an
//! asynchronous stream socket, and a framed message socket with a
//! declarative message schema.

pub mod engine;
pub mod error;
pub mod framing;
pub mod messages;
pub mod platform;
pub mod registry;
pub mod resolve;
pub mod schema;
pub mod stream;

pub use engine::{ConnState, OpMask, Protocol, SocketEngine, SocketHandler, SocketId};
pub use error::{CloseReason, NetError};
pub use framing::{
    FrameConfig, FrameDecoder, FrameError, FrameHeader, MessageSocket, MessageSocketConfig,
    MessageSocketHandler, NoopHandler, encode_frame, encode_frame_into,
};
pub use platform::SocketOptions;
pub use registry::{DecodeFn, MessageRegistry, RegistryError, UnknownMessage};
pub use resolve::{Resolver, SystemResolver};
pub use schema::{CodecError, Encode, MessageKind, NetMessage, Reader, WireInt, Writer};
pub use stream::{ListenHandler, StreamHandler, StreamListener, StreamSocket};
