//! Wire Protocol Building Blocks
//!
//! This module holds everything between raw socket bytes and typed values:
//!
//! - `envelope`: the [`Envelope`] unit of work and [`TypeTag`] dispatch keys
//! - `parser`: pluggable [`Parser`]s that frame a byte stream into envelopes
//! - `codec`: pluggable [`Decoder`]s and [`Encoder`]s for payloads
//!
//! ## Example
//!
//! ```
//! use netkit::protocol::{Decoder, Encoder, LineEncoder, LineParser, TextCodec};
//! use bytes::BytesMut;
//!
//! let parser = LineParser::of::<String>();
//! let mut buf = BytesMut::from(&b"21\n"[..]);
//! let record = parser.frame(&mut buf, false).unwrap().unwrap();
//!
//! let n: u32 = TextCodec.decode(&record).unwrap();
//! let wire = LineEncoder::new(TextCodec).encode(&(n * 2)).unwrap();
//! assert_eq!(wire, b"42\n");
//! ```

pub mod codec;
pub mod envelope;
pub mod parser;

// Re-export commonly used types for convenience
pub use codec::{
    BinaryCodec, BinaryRecord, CodecError, Decoder, Encoder, JsonCodec, LineEncoder, RawCodec, TextCodec,
};
pub use envelope::{Envelope, Message, TypeTag};
pub use parser::{
    envelopes, read_frame, FixedSizeParser, LineParser, ParseError, Parser, LINE_TERMINATOR,
    MAX_RECORD_LEN,
};
