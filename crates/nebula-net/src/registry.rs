//! Runtime map from wire kind byte to decoder.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use tracing::{trace, warn};

use crate::framing::FrameHeader;
use crate::messages::{Chat, Command, Hello, Ping, Pong, UnitPositions};
use crate::schema::{CodecError, MessageKind, NetMessage, Reader, Writer};

/// Decodes a complete body into a message.
pub type DecodeFn = fn(&[u8]) -> Result<Box<dyn NetMessage>, CodecError>;

/// Errors from registering message kinds.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// Two different types claim the same kind byte.
    #[error("message kind {kind:#04x} is already registered to {existing}")]
    DuplicateKind { kind: u8, existing: &'static str },
}

/// A frame whose kind has no registered decoder. Carries the raw body so it
/// can still be logged or relayed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownMessage {
    pub kind: u8,
    pub body: Vec<u8>,
}

impl NetMessage for UnknownMessage {
    fn kind(&self) -> u8 {
        self.kind
    }

    fn encoded_len(&self) -> usize {
        self.body.len()
    }

    fn serialize(&self, w: &mut Writer<'_>) -> Result<usize, CodecError> {
        w.put_bytes(&self.body)?;
        Ok(w.position())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Clone, Copy)]
struct Entry {
    name: &'static str,
    decode: DecodeFn,
}

/// Wire-kind registry used by the framing layer and session glue.
#[derive(Clone, Default)]
pub struct MessageRegistry {
    kinds: HashMap<u8, Entry>,
}

impl std::fmt::Debug for MessageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.kinds.iter().map(|(k, e)| (*k, e.name)).collect();
        kinds.sort_unstable();
        f.debug_struct("MessageRegistry").field("kinds", &kinds).finish()
    }
}

fn decode_as<M: MessageKind>(body: &[u8]) -> Result<Box<dyn NetMessage>, CodecError> {
    let mut reader = Reader::new(body);
    let message = M::deserialize(&mut reader)?;
    reader.finish()?;
    Ok(Box::new(message))
}

impl MessageRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in kind.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.install_builtin();
        registry
    }

    /// Process-wide registry with the built-in kinds, built on first use.
    pub fn shared() -> Arc<MessageRegistry> {
        static SHARED: OnceLock<Arc<MessageRegistry>> = OnceLock::new();
        Arc::clone(SHARED.get_or_init(|| Arc::new(MessageRegistry::with_builtin())))
    }

    /// Add the built-in kinds. Kinds already present are left alone, so this
    /// can be called more than once.
    pub fn install_builtin(&mut self) {
        self.install::<Ping>();
        self.install::<Pong>();
        self.install::<Hello>();
        self.install::<Chat>();
        self.install::<Command>();
        self.install::<UnitPositions>();
    }

    fn install<M: MessageKind>(&mut self) {
        self.kinds.entry(M::KIND).or_insert(Entry {
            name: std::any::type_name::<M>(),
            decode: decode_as::<M>,
        });
    }

    /// Map `kind` to `decode`. A kind may only be registered once.
    pub fn register_kind(
        &mut self,
        kind: u8,
        name: &'static str,
        decode: DecodeFn,
    ) -> Result<(), RegistryError> {
        if let Some(existing) = self.kinds.get(&kind) {
            return Err(RegistryError::DuplicateKind {
                kind,
                existing: existing.name,
            });
        }
        self.kinds.insert(kind, Entry { name, decode });
        Ok(())
    }

    /// Register a `net_message!` type under its own kind byte.
    pub fn register<M: MessageKind>(&mut self) -> Result<(), RegistryError> {
        self.register_kind(M::KIND, std::any::type_name::<M>(), decode_as::<M>)
    }

    pub fn contains(&self, kind: u8) -> bool {
        self.kinds.contains_key(&kind)
    }

    /// Type name registered for `kind`.
    pub fn name(&self, kind: u8) -> Option<&'static str> {
        self.kinds.get(&kind).map(|entry| entry.name)
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    /// Decode a body. Unknown kinds become [`UnknownMessage`].
    pub fn decode(&self, kind: u8, body: &[u8]) -> Result<Box<dyn NetMessage>, CodecError> {
        match self.kinds.get(&kind) {
            Some(entry) => {
                let message = (entry.decode)(body)?;
                trace!(kind, name = entry.name, bytes = body.len(), "decoded message");
                Ok(message)
            }
            None => {
                warn!(kind, bytes = body.len(), "unknown message kind");
                Ok(Box::new(UnknownMessage {
                    kind,
                    body: body.to_vec(),
                }))
            }
        }
    }

    /// Decode one complete frame: header, then exactly `length` body bytes.
    pub fn create_message(&self, frame: &[u8]) -> Result<Box<dyn NetMessage>, CodecError> {
        let header = FrameHeader::parse(frame)?;
        let body = &frame[FrameHeader::LEN..];
        let length = usize::from(header.length);
        if body.len() < length {
            return Err(CodecError::Truncated {
                needed: length,
                remaining: body.len(),
            });
        }
        if body.len() > length {
            return Err(CodecError::TrailingBytes(body.len() - length));
        }
        self.decode(header.kind, body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::encode_frame;

    crate::net_message! {
        struct Custom = 0x60 {
            int value: u8 = 1,
        }
    }

    crate::net_message! {
        struct Impostor = 0x10 {}
    }

    #[test]
    fn test_builtin_kinds_are_present() {
        let registry = MessageRegistry::with_builtin();
        for kind in [Ping::KIND, Pong::KIND, Hello::KIND, Chat::KIND, Command::KIND, UnitPositions::KIND] {
            assert!(registry.contains(kind), "kind {kind:#04x} missing");
        }
        assert!(!registry.contains(crate::messages::Close::KIND));
    }

    #[test]
    fn test_install_builtin_is_idempotent() {
        let mut registry = MessageRegistry::with_builtin();
        let before = registry.len();
        registry.install_builtin();
        assert_eq!(registry.len(), before);
    }

    #[test]
    fn test_duplicate_kind_is_rejected() {
        let mut registry = MessageRegistry::with_builtin();
        let err = registry.register::<Impostor>().unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateKind { kind: 0x10, .. }));
        assert!(err.to_string().contains("Chat"));

        registry.register::<Custom>().unwrap();
        assert!(registry.register::<Custom>().is_err());
    }

    #[test]
    fn test_unknown_kind_is_kept_raw() {
        let registry = MessageRegistry::new();
        let message = registry.decode(0x99, &[1, 2, 3]).unwrap();
        let unknown = message.downcast_ref::<UnknownMessage>().unwrap();
        assert_eq!(unknown.kind, 0x99);
        assert_eq!(unknown.body, vec![1, 2, 3]);
    }

    #[test]
    fn test_create_message_from_frame() {
        let registry = MessageRegistry::with_builtin();
        let frame = encode_frame(&Chat {
            sender: 7,
            text: "hi".into(),
        })
        .unwrap();
        let message = registry.create_message(&frame).unwrap();
        let chat = message.downcast_ref::<Chat>().unwrap();
        assert_eq!(chat.sender, 7);
        assert_eq!(chat.text, "hi");
    }

    #[test]
    fn test_create_message_rejects_short_and_long_frames() {
        let registry = MessageRegistry::with_builtin();
        let frame = encode_frame(&Ping { nonce: 1 }).unwrap();
        assert!(matches!(
            registry.create_message(&frame[..2]),
            Err(CodecError::Truncated { .. })
        ));
        assert!(matches!(
            registry.create_message(&frame[..frame.len() - 1]),
            Err(CodecError::Truncated { .. })
        ));
        let mut long = frame.clone();
        long.push(0);
        assert!(matches!(
            registry.create_message(&long),
            Err(CodecError::TrailingBytes(1))
        ));
    }

    #[test]
    fn test_body_with_trailing_bytes_fails_decode() {
        let registry = MessageRegistry::with_builtin();
        assert!(matches!(
            registry.decode(Ping::KIND, &[0, 0, 0, 1, 0xFF]),
            Err(CodecError::TrailingBytes(1))
        ));
    }

    #[test]
    fn test_shared_registry_is_built_once() {
        let a = MessageRegistry::shared();
        let b = MessageRegistry::shared();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(a.contains(Chat::KIND));
    }
}
