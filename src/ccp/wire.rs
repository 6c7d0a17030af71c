// src/ccp/wire.rs

//! Positional binary codec primitives.
//!
//! Bodies are not self-describing: every field is written in a fixed order and
//! read back in the same order, so a reader must know the variant before it
//! starts. Integers are big-endian and fixed width, booleans are one byte,
//! strings and collections carry a `u32` length prefix. Maps are written in
//! key order.

use std::collections::{BTreeMap, BTreeSet};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::error::Error;

/// Low-level failures while reading a body
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("unexpected end of body: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },
    #[error("invalid boolean byte {0:#04x}")]
    InvalidBool(u8),
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,
    #[error("{0} trailing bytes after body")]
    TrailingBytes(usize),
    #[error("unknown {kind} tag '{tag}'")]
    UnknownTag { kind: &'static str, tag: String },
    #[error("{0}")]
    Invalid(String),
}

pub type WireResult<T> = std::result::Result<T, WireError>;

impl From<WireError> for Error {
    fn from(err: WireError) -> Self {
        match err {
            WireError::UnknownTag { tag, .. } => Error::unknown_type(tag),
            other => Error::codec(None, other.to_string()),
        }
    }
}

/// Appends a value's fields to a body
pub trait Encode {
    fn encode(&self, buf: &mut BytesMut);
}

/// Reads a value's fields from the front of a body
pub trait Decode: Sized {
    fn decode(buf: &mut Bytes) -> WireResult<Self>;
}

fn ensure(buf: &Bytes, needed: usize) -> WireResult<()> {
    if buf.remaining() < needed {
        return Err(WireError::Truncated {
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

/// Fails if anything is left after a complete body
pub fn expect_end(buf: &Bytes) -> WireResult<()> {
    match buf.remaining() {
        0 => Ok(()),
        n => Err(WireError::TrailingBytes(n)),
    }
}

pub fn put_str(buf: &mut BytesMut, value: &str) {
    buf.put_u32(value.len() as u32);
    buf.put_slice(value.as_bytes());
}

fn read_len(buf: &mut Bytes) -> WireResult<usize> {
    Ok(u32::decode(buf)? as usize)
}

macro_rules! fixed_width {
    ($ty:ty, $width:expr, $put:ident, $get:ident) => {
        impl Encode for $ty {
            fn encode(&self, buf: &mut BytesMut) {
                buf.$put(*self);
            }
        }

        impl Decode for $ty {
            fn decode(buf: &mut Bytes) -> WireResult<Self> {
                ensure(buf, $width)?;
                Ok(buf.$get())
            }
        }
    };
}

fixed_width!(u8, 1, put_u8, get_u8);
fixed_width!(i32, 4, put_i32, get_i32);
fixed_width!(u32, 4, put_u32, get_u32);
fixed_width!(i64, 8, put_i64, get_i64);
fixed_width!(u64, 8, put_u64, get_u64);

impl Encode for f32 {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.to_bits());
    }
}

impl Decode for f32 {
    fn decode(buf: &mut Bytes) -> WireResult<Self> {
        Ok(f32::from_bits(u32::decode(buf)?))
    }
}

impl Encode for bool {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(u8::from(*self));
    }
}

impl Decode for bool {
    fn decode(buf: &mut Bytes) -> WireResult<Self> {
        match u8::decode(buf)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(WireError::InvalidBool(other)),
        }
    }
}

impl Encode for String {
    fn encode(&self, buf: &mut BytesMut) {
        put_str(buf, self);
    }
}

impl Decode for String {
    fn decode(buf: &mut Bytes) -> WireResult<Self> {
        let len = read_len(buf)?;
        ensure(buf, len)?;
        let raw = buf.split_to(len);
        String::from_utf8(raw.to_vec()).map_err(|_| WireError::InvalidUtf8)
    }
}

impl<T: Encode> Encode for Option<T> {
    fn encode(&self, buf: &mut BytesMut) {
        match self {
            Some(value) => {
                true.encode(buf);
                value.encode(buf);
            }
            None => false.encode(buf),
        }
    }
}

impl<T: Decode> Decode for Option<T> {
    fn decode(buf: &mut Bytes) -> WireResult<Self> {
        if bool::decode(buf)? {
            Ok(Some(T::decode(buf)?))
        } else {
            Ok(None)
        }
    }
}

impl<T: Encode> Encode for Vec<T> {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.len() as u32);
        for item in self {
            item.encode(buf);
        }
    }
}

impl<T: Decode> Decode for Vec<T> {
    fn decode(buf: &mut Bytes) -> WireResult<Self> {
        let count = read_len(buf)?;
        // A hostile count must not drive the allocation.
        let mut items = Vec::with_capacity(count.min(buf.remaining()));
        for _ in 0..count {
            items.push(T::decode(buf)?);
        }
        Ok(items)
    }
}

impl<T: Encode> Encode for BTreeSet<T> {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.len() as u32);
        for item in self {
            item.encode(buf);
        }
    }
}

impl<T: Decode + Ord> Decode for BTreeSet<T> {
    fn decode(buf: &mut Bytes) -> WireResult<Self> {
        let count = read_len(buf)?;
        let mut items = BTreeSet::new();
        for _ in 0..count {
            items.insert(T::decode(buf)?);
        }
        Ok(items)
    }
}

impl<K: Encode, V: Encode> Encode for BTreeMap<K, V> {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.len() as u32);
        for (key, value) in self {
            key.encode(buf);
            value.encode(buf);
        }
    }
}

impl<K: Decode + Ord, V: Decode> Decode for BTreeMap<K, V> {
    fn decode(buf: &mut Bytes) -> WireResult<Self> {
        let count = read_len(buf)?;
        let mut entries = BTreeMap::new();
        for _ in 0..count {
            let key = K::decode(buf)?;
            let value = V::decode(buf)?;
            entries.insert(key, value);
        }
        Ok(entries)
    }
}

/// Declares a closed, fieldless enum whose wire form is its tag string.
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $($(#[$vmeta:meta])* $variant:ident => $wire:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
            serde::Serialize, serde::Deserialize,
        )]
        $vis enum $name {
            $($(#[$vmeta])* #[serde(rename = $wire)] $variant),+
        }

        impl $name {
            /// Every member of the closed set
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// Tag written on the wire
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $wire),+
                }
            }

            /// Looks a tag up in the closed set
            pub fn from_wire(tag: &str) -> Option<Self> {
                match tag {
                    $($wire => Some($name::$variant),)+
                    _ => None,
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::error::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Self::from_wire(s).ok_or_else(|| $crate::error::Error::unknown_type(s))
            }
        }

        impl $crate::ccp::wire::Encode for $name {
            fn encode(&self, buf: &mut bytes::BytesMut) {
                $crate::ccp::wire::put_str(buf, self.as_str());
            }
        }

        impl $crate::ccp::wire::Decode for $name {
            fn decode(buf: &mut bytes::Bytes) -> $crate::ccp::wire::WireResult<Self> {
                let tag = <String as $crate::ccp::wire::Decode>::decode(buf)?;
                Self::from_wire(&tag).ok_or($crate::ccp::wire::WireError::UnknownTag {
                    kind: stringify!($name),
                    tag,
                })
            }
        }
    };
}

pub(crate) use wire_enum;

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded<T: Encode>(value: &T) -> Bytes {
        let mut buf = BytesMut::new();
        value.encode(&mut buf);
        buf.freeze()
    }

    #[test]
    fn test_fixed_width_is_big_endian() {
        let body = encoded(&0x0102_0304_i32);
        assert_eq!(&body[..], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_string_has_length_prefix() {
        let body = encoded(&"ccp".to_string());
        assert_eq!(&body[..], &[0, 0, 0, 3, b'c', b'c', b'p']);
    }

    #[test]
    fn test_truncated_string_is_rejected() {
        let mut body = Bytes::from_static(&[0, 0, 0, 9, b'a']);
        assert_eq!(
            String::decode(&mut body),
            Err(WireError::Truncated {
                needed: 9,
                remaining: 1
            })
        );
    }

    #[test]
    fn test_invalid_bool_is_rejected() {
        let mut body = Bytes::from_static(&[2]);
        assert_eq!(bool::decode(&mut body), Err(WireError::InvalidBool(2)));
    }

    #[test]
    fn test_float_keeps_exact_bits() {
        let mut body = encoded(&1.25_f32);
        assert_eq!(f32::decode(&mut body).unwrap().to_bits(), 1.25_f32.to_bits());
    }

    #[test]
    fn test_map_decodes_in_key_order() {
        let mut map = BTreeMap::new();
        map.insert("b".to_string(), 2_i64);
        map.insert("a".to_string(), 1_i64);
        let mut body = encoded(&map);
        let decoded = BTreeMap::<String, i64>::decode(&mut body).unwrap();
        assert_eq!(decoded, map);
        assert!(expect_end(&body).is_ok());
    }

    #[test]
    fn test_hostile_count_fails_without_allocating() {
        let mut body = Bytes::from_static(&[0xff, 0xff, 0xff, 0xff]);
        assert!(matches!(
            Vec::<u64>::decode(&mut body),
            Err(WireError::Truncated { .. })
        ));
    }

    #[test]
    fn test_trailing_bytes_detected() {
        let body = Bytes::from_static(&[0]);
        assert_eq!(expect_end(&body), Err(WireError::TrailingBytes(1)));
    }
}
