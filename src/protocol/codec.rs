//! Decoders and Encoders
//!
//! A decoder turns an envelope's payload into a concrete request value; an
//! encoder turns a handler's response into bytes for the wire. Both are
//! plain values implementing [`Decoder<T>`] / [`Encoder<T>`] for every shape
//! they understand, so a server can check at registration time that its
//! codecs support a handler's request and response types.
//!
//! | Codec | Decodes | Encodes |
//! |---|---|---|
//! | [`RawCodec`] | `Bytes`, `Vec<u8>`, `String` (UTF-8) | `Bytes`, `Vec<u8>`, `String` |
//! | [`TextCodec`] | any `T: FromStr` | any `T: Display` |
//! | [`JsonCodec`] | any `T: DeserializeOwned` | any `T: Serialize` |
//! | [`BinaryCodec`] | any `T: BinaryRecord` | any `T: BinaryRecord` |
//!
//! [`LineEncoder`] wraps any encoder and appends the record terminator.

use crate::protocol::parser::LINE_TERMINATOR;
use bytes::{Buf, BufMut, Bytes};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Display;
use std::str::FromStr;
use thiserror::Error;

/// Errors produced while converting between payloads and values.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Payload is not valid UTF-8.
    #[error("invalid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    /// Payload is well-formed text but not a valid value.
    #[error("malformed payload: {0}")]
    Malformed(String),

    /// JSON (de)serialization failed.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    /// Binary payload does not have the record's fixed width.
    #[error("expected {expected} bytes, got {len}")]
    Size { len: usize, expected: usize },
}

/// Converts a payload into a `T`.
pub trait Decoder<T>: Send + Sync + 'static {
    fn decode(&self, payload: &Bytes) -> Result<T, CodecError>;
}

/// Converts a `T` into wire bytes.
pub trait Encoder<T>: Send + Sync + 'static {
    fn encode(&self, value: &T) -> Result<Vec<u8>, CodecError>;
}

/// Byte-identity codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl Decoder<Bytes> for RawCodec {
    fn decode(&self, payload: &Bytes) -> Result<Bytes, CodecError> {
        Ok(payload.clone())
    }
}

impl Decoder<Vec<u8>> for RawCodec {
    fn decode(&self, payload: &Bytes) -> Result<Vec<u8>, CodecError> {
        Ok(payload.to_vec())
    }
}

impl Decoder<String> for RawCodec {
    fn decode(&self, payload: &Bytes) -> Result<String, CodecError> {
        Ok(std::str::from_utf8(payload)?.to_owned())
    }
}

impl Encoder<Bytes> for RawCodec {
    fn encode(&self, value: &Bytes) -> Result<Vec<u8>, CodecError> {
        Ok(value.to_vec())
    }
}

impl Encoder<Vec<u8>> for RawCodec {
    fn encode(&self, value: &Vec<u8>) -> Result<Vec<u8>, CodecError> {
        Ok(value.clone())
    }
}

impl Encoder<String> for RawCodec {
    fn encode(&self, value: &String) -> Result<Vec<u8>, CodecError> {
        Ok(value.as_bytes().to_vec())
    }
}

/// UTF-8 text through `FromStr` and `Display`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextCodec;

impl<T> Decoder<T> for TextCodec
where
    T: FromStr,
    T::Err: Display,
{
    fn decode(&self, payload: &Bytes) -> Result<T, CodecError> {
        let text = std::str::from_utf8(payload)?;
        text.parse()
            .map_err(|e: T::Err| CodecError::Malformed(e.to_string()))
    }
}

impl<T: Display> Encoder<T> for TextCodec {
    fn encode(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        Ok(value.to_string().into_bytes())
    }
}

/// JSON through serde.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl<T: DeserializeOwned> Decoder<T> for JsonCodec {
    fn decode(&self, payload: &Bytes) -> Result<T, CodecError> {
        Ok(serde_json::from_slice(payload)?)
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec {
    fn encode(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(value)?)
    }
}

/// A value with a fixed-width, big-endian (network order) wire layout.
///
/// Implemented for the integer and float primitives, `bool` and tuples of up
/// to four records. Request structs usually implement it by delegating to a
/// tuple of their fields.
pub trait BinaryRecord: Sized {
    /// Encoded width in bytes.
    const SIZE: usize;

    /// Reads one value. `buf` holds at least [`Self::SIZE`] bytes.
    fn read_from(buf: &mut impl Buf) -> Result<Self, CodecError>;

    fn write_to(&self, buf: &mut impl BufMut);
}

macro_rules! binary_number {
    ($($ty:ty => $get:ident, $put:ident;)*) => {
        $(
            impl BinaryRecord for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                fn read_from(buf: &mut impl Buf) -> Result<Self, CodecError> {
                    Ok(buf.$get())
                }

                fn write_to(&self, buf: &mut impl BufMut) {
                    buf.$put(*self);
                }
            }
        )*
    };
}

binary_number! {
    u8 => get_u8, put_u8;
    i8 => get_i8, put_i8;
    u16 => get_u16, put_u16;
    i16 => get_i16, put_i16;
    u32 => get_u32, put_u32;
    i32 => get_i32, put_i32;
    u64 => get_u64, put_u64;
    i64 => get_i64, put_i64;
    f32 => get_f32, put_f32;
    f64 => get_f64, put_f64;
}

impl BinaryRecord for bool {
    const SIZE: usize = 1;

    fn read_from(buf: &mut impl Buf) -> Result<Self, CodecError> {
        match buf.get_u8() {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(CodecError::Malformed(format!("invalid bool byte {other:#04x}"))),
        }
    }

    fn write_to(&self, buf: &mut impl BufMut) {
        buf.put_u8(u8::from(*self));
    }
}

macro_rules! binary_tuple {
    ($($name:ident $field:ident),+) => {
        impl<$($name: BinaryRecord),+> BinaryRecord for ($($name,)+) {
            const SIZE: usize = 0 $(+ $name::SIZE)+;

            fn read_from(buf: &mut impl Buf) -> Result<Self, CodecError> {
                Ok(($($name::read_from(&mut *buf)?,)+))
            }

            fn write_to(&self, buf: &mut impl BufMut) {
                let ($($field,)+) = self;
                $($field.write_to(&mut *buf);)+
            }
        }
    };
}

binary_tuple!(A a, B b);
binary_tuple!(A a, B b, C c);
binary_tuple!(A a, B b, C c, D d);

/// Fixed-width binary records through [`BinaryRecord`].
///
/// Pairs with [`FixedSizeParser`](crate::protocol::FixedSizeParser) sized to
/// the request's [`BinaryRecord::SIZE`].
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryCodec;

impl<T: BinaryRecord> Decoder<T> for BinaryCodec {
    fn decode(&self, payload: &Bytes) -> Result<T, CodecError> {
        if payload.len() != T::SIZE {
            return Err(CodecError::Size {
                len: payload.len(),
                expected: T::SIZE,
            });
        }
        T::read_from(&mut payload.clone())
    }
}

impl<T: BinaryRecord> Encoder<T> for BinaryCodec {
    fn encode(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::with_capacity(T::SIZE);
        value.write_to(&mut out);
        Ok(out)
    }
}

/// Appends a line terminator to whatever the wrapped encoder produces.
///
/// # Example
///
/// ```
/// use netkit::protocol::{Encoder, LineEncoder, TextCodec};
///
/// let encoder = LineEncoder::new(TextCodec);
/// assert_eq!(encoder.encode(&42u32).unwrap(), b"42\n");
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct LineEncoder<E> {
    inner: E,
}

impl<E> LineEncoder<E> {
    pub fn new(inner: E) -> Self {
        Self { inner }
    }

    /// The wrapped encoder.
    pub fn inner(&self) -> &E {
        &self.inner
    }
}

impl<T, E: Encoder<T>> Encoder<T> for LineEncoder<E> {
    fn encode(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        let mut out = self.inner.encode(value)?;
        out.push(LINE_TERMINATOR);
        Ok(out)
    }
}
