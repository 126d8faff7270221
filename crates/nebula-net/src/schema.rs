//! Declarative message schema and big-endian codec.
//!
//! A message kind is declared once with [`net_message!`](crate::net_message)
//! (or a nested record with [`net_record!`](crate::net_record)); the macro
//! emits the struct and its `encoded_len`/`serialize`/`deserialize`/
//! `to_display_string` operations. Fields are encoded in declaration order:
//!
//! - `int name: T = W` writes the low `W` bytes of the integer big-endian.
//!   On decode unsigned types zero-extend and signed types sign-extend.
//! - `nested name: T` delegates to `T`'s [`Encode`] impl.
//! - `array name: T` is a `Vec<T>` that consumes the rest of the enclosing
//!   body, so it must be the last field.
//!
//! ```
//! use nebula_net::net_message;
//!
//! net_message! {
//!     /// Score update.
//!     pub struct Score = 0x40 {
//!         int player: u32 = 2,
//!         int points: i32 = 3,
//!         nested label: String,
//!     }
//! }
//!
//! let score = Score { player: 1, points: -5, label: "p1".into() };
//! assert_eq!(score.to_display_string(), r#"Score { player: 1, points: -5, label: "p1" }"#);
//! ```

use std::any::Any;
use std::fmt;

/// Errors produced while encoding or decoding a message body.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// A read would cross the end of the body.
    #[error("truncated body: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    /// A write would cross the end of the output buffer.
    #[error("output buffer too small: needed {needed} bytes, {remaining} remaining")]
    Overflow { needed: usize, remaining: usize },

    /// A string field is not valid UTF-8.
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,

    /// A string does not fit its 16-bit length prefix.
    #[error("string of {0} bytes exceeds the 16-bit length prefix")]
    StringTooLong(usize),

    /// The body has bytes left after the last field.
    #[error("{0} trailing bytes after the last field")]
    TrailingBytes(usize),

    /// An array element decoded from zero bytes.
    #[error("array element consumed no input")]
    EmptyElement,
}

// ---------------------------------------------------------------------------
// Cursors
// ---------------------------------------------------------------------------

/// Write cursor over a byte slice.
#[derive(Debug)]
pub struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes written so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn claim(&mut self, n: usize) -> Result<&mut [u8], CodecError> {
        if n > self.remaining() {
            return Err(CodecError::Overflow {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let start = self.pos;
        self.pos += n;
        Ok(&mut self.buf[start..self.pos])
    }

    pub fn put_u8(&mut self, value: u8) -> Result<(), CodecError> {
        self.claim(1)?[0] = value;
        Ok(())
    }

    /// Write the low `width` bytes of `value`, most significant first.
    pub fn put_uint(&mut self, value: u64, width: usize) -> Result<(), CodecError> {
        let bytes = value.to_be_bytes();
        self.claim(width)?.copy_from_slice(&bytes[8 - width..]);
        Ok(())
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) -> Result<(), CodecError> {
        self.claim(bytes.len())?.copy_from_slice(bytes);
        Ok(())
    }
}

/// Read cursor over a byte slice. Every read is bounds checked.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn get_bytes(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if n > self.remaining() {
            return Err(CodecError::Truncated {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let start = self.pos;
        self.pos += n;
        Ok(&self.buf[start..self.pos])
    }

    pub fn get_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.get_bytes(1)?[0])
    }

    /// Read a `width`-byte big-endian unsigned value.
    pub fn get_uint(&mut self, width: usize) -> Result<u64, CodecError> {
        let bytes = self.get_bytes(width)?;
        Ok(bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
    }

    /// Fail if anything is left unread.
    pub fn finish(&self) -> Result<(), CodecError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(CodecError::TrailingBytes(n)),
        }
    }
}

// ---------------------------------------------------------------------------
// Field codecs
// ---------------------------------------------------------------------------

/// Integer that can travel at an arbitrary wire width of 1 to 8 bytes.
pub trait WireInt: Copy {
    /// Native width in bytes.
    const WIDTH: usize;

    /// Two's-complement bits, sign-extended to 64 bits.
    fn to_wire(self) -> u64;

    /// Rebuild from the low `width` bytes of `raw`.
    fn from_wire(raw: u64, width: usize) -> Self;
}

macro_rules! wire_uint {
    ($($t:ty),*) => {$(
        impl WireInt for $t {
            const WIDTH: usize = std::mem::size_of::<$t>();

            fn to_wire(self) -> u64 {
                self as u64
            }

            fn from_wire(raw: u64, _width: usize) -> Self {
                raw as $t
            }
        }
    )*};
}

macro_rules! wire_sint {
    ($($t:ty),*) => {$(
        impl WireInt for $t {
            const WIDTH: usize = std::mem::size_of::<$t>();

            fn to_wire(self) -> u64 {
                self as i64 as u64
            }

            fn from_wire(raw: u64, width: usize) -> Self {
                let shift = 64 - 8 * width as u32;
                (((raw << shift) as i64) >> shift) as $t
            }
        }
    )*};
}

wire_uint!(u8, u16, u32, u64);
wire_sint!(i8, i16, i32, i64);

/// A value with a body encoding: primitives, strings and `net_record!` types.
pub trait Encode: Sized {
    fn encoded_len(&self) -> usize;
    fn encode(&self, w: &mut Writer<'_>) -> Result<(), CodecError>;
    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError>;
}

macro_rules! encode_native_int {
    ($($t:ty),*) => {$(
        impl Encode for $t {
            fn encoded_len(&self) -> usize {
                <$t as WireInt>::WIDTH
            }

            fn encode(&self, w: &mut Writer<'_>) -> Result<(), CodecError> {
                w.put_uint(self.to_wire(), <$t as WireInt>::WIDTH)
            }

            fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
                let width = <$t as WireInt>::WIDTH;
                Ok(<$t>::from_wire(r.get_uint(width)?, width))
            }
        }
    )*};
}

encode_native_int!(u8, u16, u32, u64, i8, i16, i32, i64);

impl Encode for bool {
    fn encoded_len(&self) -> usize {
        1
    }

    fn encode(&self, w: &mut Writer<'_>) -> Result<(), CodecError> {
        w.put_u8(u8::from(*self))
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(r.get_u8()? != 0)
    }
}

/// `u16` byte length followed by UTF-8.
impl Encode for String {
    fn encoded_len(&self) -> usize {
        2 + self.len()
    }

    fn encode(&self, w: &mut Writer<'_>) -> Result<(), CodecError> {
        let len = u16::try_from(self.len()).map_err(|_| CodecError::StringTooLong(self.len()))?;
        w.put_uint(u64::from(len), 2)?;
        w.put_bytes(self.as_bytes())
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let len = r.get_uint(2)? as usize;
        let bytes = r.get_bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8)
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// A decoded message of any kind, as carried by the framing layer and
/// session inboxes.
pub trait NetMessage: fmt::Debug + Send + 'static {
    /// Wire kind byte.
    fn kind(&self) -> u8;

    /// Body length in bytes, excluding the frame header.
    fn encoded_len(&self) -> usize;

    /// Write the body and return the advanced write position.
    fn serialize(&self, w: &mut Writer<'_>) -> Result<usize, CodecError>;

    /// `"Kind { field: value, ... }"`.
    fn to_display_string(&self) -> String {
        format!("{self:?}")
    }

    /// Control kinds are handled by the framing socket and never written.
    fn is_control(&self) -> bool {
        false
    }

    fn as_any(&self) -> &dyn Any;
}

impl dyn NetMessage {
    /// Borrow as a concrete kind.
    pub fn downcast_ref<T: NetMessage>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    pub fn is<T: NetMessage>(&self) -> bool {
        self.as_any().is::<T>()
    }
}

/// A concrete message kind with a fixed wire kind byte.
pub trait MessageKind: NetMessage + Sized {
    const KIND: u8;

    fn deserialize(r: &mut Reader<'_>) -> Result<Self, CodecError>;
}

/// Encode a message body into a fresh buffer.
pub fn encode_body(message: &dyn NetMessage) -> Result<Vec<u8>, CodecError> {
    let mut body = vec![0u8; message.encoded_len()];
    let written = message.serialize(&mut Writer::new(&mut body))?;
    body.truncate(written);
    Ok(body)
}

// ---------------------------------------------------------------------------
// Declaration macros
// ---------------------------------------------------------------------------

#[doc(hidden)]
#[macro_export]
macro_rules! __net_field_type {
    (int $t:ty) => { $t };
    (nested $t:ty) => { $t };
    (array $t:ty) => { ::std::vec::Vec<$t> };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __net_field {
    (len int, $value:expr, $width:literal) => {{
        const {
            assert!($width >= 1 && $width <= 8, "integer wire width must be 1..=8");
        }
        $width
    }};
    (len nested, $value:expr) => {
        $crate::schema::Encode::encoded_len(&$value)
    };
    (len array, $value:expr) => {
        $value
            .iter()
            .map($crate::schema::Encode::encoded_len)
            .sum::<usize>()
    };

    (encode int, $value:expr, $w:ident, $width:literal) => {
        $w.put_uint($crate::schema::WireInt::to_wire($value), $width)?
    };
    (encode nested, $value:expr, $w:ident) => {
        $crate::schema::Encode::encode(&$value, $w)?
    };
    (encode array, $value:expr, $w:ident) => {
        for item in &$value {
            $crate::schema::Encode::encode(item, $w)?;
        }
    };

    (decode int, $t:ty, $r:ident, $width:literal) => {
        <$t as $crate::schema::WireInt>::from_wire($r.get_uint($width)?, $width)
    };
    (decode nested, $t:ty, $r:ident) => {
        <$t as $crate::schema::Encode>::decode($r)?
    };
    (decode array, $t:ty, $r:ident) => {{
        let mut items = ::std::vec::Vec::new();
        while !$r.is_empty() {
            let before = $r.remaining();
            items.push(<$t as $crate::schema::Encode>::decode($r)?);
            if $r.remaining() == before {
                return Err($crate::schema::CodecError::EmptyElement);
            }
        }
        items
    }};
}

/// Declare a record type usable as a `nested` or `array` field.
#[macro_export]
macro_rules! net_record {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $(
                $(#[$fmeta:meta])*
                $mode:ident $field:ident : $t:ty $(= $width:literal)?
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq)]
        $vis struct $name {
            $(
                $(#[$fmeta])*
                pub $field: $crate::__net_field_type!($mode $t),
            )*
        }

        impl $crate::schema::Encode for $name {
            fn encoded_len(&self) -> usize {
                0 $( + $crate::__net_field!(len $mode, self.$field $(, $width)?) )*
            }

            #[allow(unused_variables)]
            fn encode(
                &self,
                w: &mut $crate::schema::Writer<'_>,
            ) -> ::std::result::Result<(), $crate::schema::CodecError> {
                $( $crate::__net_field!(encode $mode, self.$field, w $(, $width)?); )*
                Ok(())
            }

            #[allow(unused_variables)]
            fn decode(
                r: &mut $crate::schema::Reader<'_>,
            ) -> ::std::result::Result<Self, $crate::schema::CodecError> {
                Ok(Self {
                    $( $field: $crate::__net_field!(decode $mode, $t, r $(, $width)?), )*
                })
            }
        }
    };
}

/// Declare a message kind: the struct, its body codec and its
/// [`NetMessage`](crate::schema::NetMessage) impl.
#[macro_export]
macro_rules! net_message {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident = $kind:literal {
            $($body:tt)*
        }
    ) => {
        $crate::net_record! {
            $(#[$meta])*
            $vis struct $name { $($body)* }
        }

        impl $name {
            pub const KIND: u8 = $kind;

            pub fn encoded_len(&self) -> usize {
                $crate::schema::Encode::encoded_len(self)
            }

            pub fn serialize(
                &self,
                w: &mut $crate::schema::Writer<'_>,
            ) -> ::std::result::Result<usize, $crate::schema::CodecError> {
                $crate::schema::Encode::encode(self, w)?;
                Ok(w.position())
            }

            pub fn deserialize(
                r: &mut $crate::schema::Reader<'_>,
            ) -> ::std::result::Result<Self, $crate::schema::CodecError> {
                $crate::schema::Encode::decode(r)
            }

            pub fn to_display_string(&self) -> ::std::string::String {
                ::std::format!("{self:?}")
            }
        }

        impl $crate::schema::NetMessage for $name {
            fn kind(&self) -> u8 {
                $kind
            }

            fn encoded_len(&self) -> usize {
                $crate::schema::Encode::encoded_len(self)
            }

            fn serialize(
                &self,
                w: &mut $crate::schema::Writer<'_>,
            ) -> ::std::result::Result<usize, $crate::schema::CodecError> {
                $name::serialize(self, w)
            }

            fn as_any(&self) -> &dyn ::std::any::Any {
                self
            }
        }

        impl $crate::schema::MessageKind for $name {
            const KIND: u8 = $kind;

            fn deserialize(
                r: &mut $crate::schema::Reader<'_>,
            ) -> ::std::result::Result<Self, $crate::schema::CodecError> {
                $name::deserialize(r)
            }
        }
    };
}
