//! Record Parsers
//!
//! A parser turns a connection's byte stream into a lazy sequence of
//! [`Envelope`]s. Parsers are configured once per server and shared by all
//! connections; the per-connection state (the partially received record)
//! lives in the connection's read buffer.
//!
//! ## How Framing Works
//!
//! Every shipped parser is built from a pure framing function over the read
//! buffer that returns either:
//! - `Ok(Some(record))` - a complete record was split off the buffer
//! - `Ok(None)` - need more data (or, at end of stream, nothing is left)
//! - `Err(ParseError)` - the stream cannot be framed any further
//!
//! The async driver ([`read_frame`]) calls the framing function, reads more
//! bytes when it asks for them, and repeats. Because framing only ever looks
//! at the accumulated buffer, the output does not depend on how the peer's
//! bytes were split across reads.
//!
//! ## Stream End
//!
//! A clean end of stream yields `Ok(None)` from [`Parser::next_envelope`];
//! a read error or an unframeable record yields `Err(_)`. The
//! [`envelopes`] adapter surfaces the error once and then ends.

use crate::connection::Connection;
use crate::protocol::envelope::{Envelope, Message, TypeTag};
use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;
use futures::Stream;
use std::num::NonZeroUsize;
use thiserror::Error;

/// Default upper bound for a single line (64 KB).
pub const MAX_RECORD_LEN: usize = 64 * 1024;

/// Record terminator for line-delimited protocols.
pub const LINE_TERMINATOR: u8 = b'\n';

/// Reasons a connection's envelope sequence ended abnormally.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The transport failed while reading.
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),

    /// A record grew past the configured maximum without a terminator.
    #[error("record too long: {len} bytes (max: {max})")]
    RecordTooLong { len: usize, max: usize },

    /// The stream ended in the middle of a fixed-size record.
    #[error("stream ended inside a record: got {len} of {expected} bytes")]
    Truncated { len: usize, expected: usize },
}

/// Produces envelopes from a connection.
///
/// Implementations must tolerate partial reads: a record split across any
/// number of reads produces the same envelope as one delivered whole.
pub trait Parser: Send + Sync + 'static {
    /// Reads until the next complete envelope is available.
    ///
    /// Returns `Ok(None)` once the peer has closed the stream and no
    /// further records remain.
    fn next_envelope<'a>(
        &'a self,
        conn: &'a mut Connection,
    ) -> BoxFuture<'a, Result<Option<Envelope>, ParseError>>;
}

/// Drives a framing function against a connection until it yields a record.
///
/// `frame` receives the read buffer and an end-of-stream flag; it is called
/// again after every read that made progress.
pub async fn read_frame<F>(conn: &mut Connection, mut frame: F) -> Result<Option<Bytes>, ParseError>
where
    F: FnMut(&mut BytesMut, bool) -> Result<Option<Bytes>, ParseError>,
{
    loop {
        if let Some(record) = frame(conn.buffer_mut(), false)? {
            return Ok(Some(record));
        }

        let n = conn.read_more().await?;
        if n == 0 {
            return frame(conn.buffer_mut(), true);
        }
    }
}

/// Exposes a parser as a lazy, non-restartable stream of envelopes.
///
/// The stream ends after a clean end of stream, or after yielding the
/// first error.
pub fn envelopes<'a, P>(
    parser: &'a P,
    conn: &'a mut Connection,
) -> impl Stream<Item = Result<Envelope, ParseError>> + Send + 'a
where
    P: Parser + ?Sized,
{
    futures::stream::unfold(Some(conn), move |state| async move {
        let conn = state?;
        match parser.next_envelope(conn).await {
            Ok(Some(envelope)) => Some((Ok(envelope), Some(conn))),
            Ok(None) => None,
            Err(e) => Some((Err(e), None)),
        }
    })
}

/// Newline-delimited records, all tagged with one fixed [`TypeTag`].
///
/// A trailing `\r` is stripped from each record, and a final record with no
/// terminator is still delivered when the stream ends.
#[derive(Debug, Clone)]
pub struct LineParser {
    tag: TypeTag,
    max_len: usize,
}

impl LineParser {
    /// Creates a line parser that tags every record with `tag`.
    pub fn new(tag: TypeTag) -> Self {
        Self {
            tag,
            max_len: MAX_RECORD_LEN,
        }
    }

    /// Creates a line parser for requests of shape `T`.
    pub fn of<T: Message>() -> Self {
        Self::new(TypeTag::of::<T>())
    }

    /// Sets the longest accepted line, excluding the terminator.
    pub fn with_max_record_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }

    /// The tag attached to every envelope.
    pub fn tag(&self) -> TypeTag {
        self.tag
    }

    /// Splits one line off the front of `buf`.
    pub fn frame(&self, buf: &mut BytesMut, eof: bool) -> Result<Option<Bytes>, ParseError> {
        match buf.iter().position(|&b| b == LINE_TERMINATOR) {
            Some(pos) => {
                let len = content_len(&buf[..pos]);
                if len > self.max_len {
                    return Err(ParseError::RecordTooLong {
                        len,
                        max: self.max_len,
                    });
                }
                let mut line = buf.split_to(pos + 1);
                line.truncate(pos);
                Ok(Some(strip_cr(line)))
            }
            None if content_len(buf) > self.max_len => Err(ParseError::RecordTooLong {
                len: content_len(buf),
                max: self.max_len,
            }),
            None if eof && !buf.is_empty() => Ok(Some(strip_cr(buf.split()))),
            None => Ok(None),
        }
    }
}

impl Parser for LineParser {
    fn next_envelope<'a>(
        &'a self,
        conn: &'a mut Connection,
    ) -> BoxFuture<'a, Result<Option<Envelope>, ParseError>> {
        Box::pin(async move {
            let record = read_frame(conn, |buf, eof| self.frame(buf, eof)).await?;
            Ok(record.map(|payload| Envelope::new(self.tag, payload)))
        })
    }
}

/// Length of a line without its trailing `\r`, if any.
fn content_len(line: &[u8]) -> usize {
    match line.last() {
        Some(b'\r') => line.len() - 1,
        _ => line.len(),
    }
}

fn strip_cr(mut line: BytesMut) -> Bytes {
    if line.last() == Some(&b'\r') {
        line.truncate(line.len() - 1);
    }
    line.freeze()
}

/// Fixed-length binary records, all tagged with one fixed [`TypeTag`].
#[derive(Debug, Clone)]
pub struct FixedSizeParser {
    tag: TypeTag,
    size: NonZeroUsize,
}

impl FixedSizeParser {
    /// Creates a parser that splits the stream into `size`-byte records.
    pub fn new(tag: TypeTag, size: NonZeroUsize) -> Self {
        Self { tag, size }
    }

    /// Creates a fixed-size parser for requests of shape `T`.
    pub fn of<T: Message>(size: NonZeroUsize) -> Self {
        Self::new(TypeTag::of::<T>(), size)
    }

    /// The record size in bytes.
    pub fn size(&self) -> usize {
        self.size.get()
    }

    /// Splits one record off the front of `buf`.
    pub fn frame(&self, buf: &mut BytesMut, eof: bool) -> Result<Option<Bytes>, ParseError> {
        let size = self.size.get();
        if buf.len() >= size {
            return Ok(Some(buf.split_to(size).freeze()));
        }
        if eof && !buf.is_empty() {
            return Err(ParseError::Truncated {
                len: buf.len(),
                expected: size,
            });
        }
        Ok(None)
    }
}

impl Parser for FixedSizeParser {
    fn next_envelope<'a>(
        &'a self,
        conn: &'a mut Connection,
    ) -> BoxFuture<'a, Result<Option<Envelope>, ParseError>> {
        Box::pin(async move {
            let record = read_frame(conn, |buf, eof| self.frame(buf, eof)).await?;
            Ok(record.map(|payload| Envelope::new(self.tag, payload)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::net::SocketAddr;

    fn peer() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    fn mock_conn(chunks: &[&[u8]]) -> Connection {
        let mut builder = tokio_test::io::Builder::new();
        for chunk in chunks {
            builder.read(chunk);
        }
        Connection::new(builder.build(), tokio::io::sink(), peer())
    }

    /// Frames `input` delivered as the given chunks, draining after each one.
    fn frame_chunks(parser: &LineParser, chunks: &[&[u8]]) -> Vec<Bytes> {
        let mut buf = BytesMut::new();
        let mut out = Vec::new();
        for chunk in chunks {
            buf.extend_from_slice(chunk);
            while let Some(record) = parser.frame(&mut buf, false).unwrap() {
                out.push(record);
            }
        }
        while let Some(record) = parser.frame(&mut buf, true).unwrap() {
            out.push(record);
        }
        out
    }

    #[test]
    fn test_frame_single_line() {
        let parser = LineParser::new(TypeTag::named("line"));
        let mut buf = BytesMut::from(&b"ping\n"[..]);
        assert_eq!(parser.frame(&mut buf, false).unwrap().unwrap(), "ping");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_frame_incomplete() {
        let parser = LineParser::new(TypeTag::named("line"));
        let mut buf = BytesMut::from(&b"pin"[..]);
        assert!(parser.frame(&mut buf, false).unwrap().is_none());
        assert_eq!(&buf[..], b"pin");
    }

    #[test]
    fn test_frame_strips_carriage_return() {
        let parser = LineParser::new(TypeTag::named("line"));
        let mut buf = BytesMut::from(&b"ping\r\n"[..]);
        assert_eq!(parser.frame(&mut buf, false).unwrap().unwrap(), "ping");
    }

    #[test]
    fn test_frame_empty_line() {
        let parser = LineParser::new(TypeTag::named("line"));
        let mut buf = BytesMut::from(&b"\nnext\n"[..]);
        assert_eq!(parser.frame(&mut buf, false).unwrap().unwrap(), "");
        assert_eq!(parser.frame(&mut buf, false).unwrap().unwrap(), "next");
    }

    #[test]
    fn test_frame_final_unterminated_line_at_eof() {
        let parser = LineParser::new(TypeTag::named("line"));
        let mut buf = BytesMut::from(&b"last"[..]);
        assert!(parser.frame(&mut buf, false).unwrap().is_none());
        assert_eq!(parser.frame(&mut buf, true).unwrap().unwrap(), "last");
        assert!(parser.frame(&mut buf, true).unwrap().is_none());
    }

    #[test]
    fn test_frame_record_too_long() {
        let parser = LineParser::new(TypeTag::named("line")).with_max_record_len(4);
        let mut buf = BytesMut::from(&b"abcdef"[..]);
        assert!(matches!(
            parser.frame(&mut buf, false),
            Err(ParseError::RecordTooLong { len: 6, max: 4 })
        ));

        let mut buf = BytesMut::from(&b"abcde\n"[..]);
        assert!(matches!(
            parser.frame(&mut buf, false),
            Err(ParseError::RecordTooLong { len: 5, max: 4 })
        ));

        let mut buf = BytesMut::from(&b"abcd\n"[..]);
        assert_eq!(parser.frame(&mut buf, false).unwrap().unwrap(), "abcd");
    }

    #[test]
    fn test_frame_max_length_ignores_carriage_return() {
        let parser = LineParser::new(TypeTag::named("line")).with_max_record_len(4);

        let mut buf = BytesMut::from(&b"abcd\r\n"[..]);
        assert_eq!(parser.frame(&mut buf, false).unwrap().unwrap(), "abcd");

        // The `\n` has not arrived yet.
        let mut buf = BytesMut::from(&b"abcd\r"[..]);
        assert!(parser.frame(&mut buf, false).unwrap().is_none());
        buf.extend_from_slice(b"\n");
        assert_eq!(parser.frame(&mut buf, false).unwrap().unwrap(), "abcd");

        let mut buf = BytesMut::from(&b"abcde\r\n"[..]);
        assert!(matches!(
            parser.frame(&mut buf, false),
            Err(ParseError::RecordTooLong { len: 5, max: 4 })
        ));
    }

    #[test]
    fn test_framing_is_chunk_boundary_independent() {
        let parser = LineParser::new(TypeTag::named("line"));
        let input: &[u8] = b"first\r\nsecond\n\nfourth line\nlast";
        let whole = frame_chunks(&parser, &[input]);
        assert_eq!(whole.len(), 5);

        for split in 0..=input.len() {
            let (a, b) = input.split_at(split);
            assert_eq!(frame_chunks(&parser, &[a, b]), whole, "split at {}", split);
        }

        let bytewise: Vec<&[u8]> = input.chunks(1).collect();
        assert_eq!(frame_chunks(&parser, &bytewise), whole);

        let threes: Vec<&[u8]> = input.chunks(3).collect();
        assert_eq!(frame_chunks(&parser, &threes), whole);
    }

    #[test]
    fn test_fixed_size_frame() {
        let parser = FixedSizeParser::new(TypeTag::named("rec"), NonZeroUsize::new(3).unwrap());
        let mut buf = BytesMut::from(&b"abcdefg"[..]);
        assert_eq!(parser.frame(&mut buf, false).unwrap().unwrap(), "abc");
        assert_eq!(parser.frame(&mut buf, false).unwrap().unwrap(), "def");
        assert!(parser.frame(&mut buf, false).unwrap().is_none());
        assert!(matches!(
            parser.frame(&mut buf, true),
            Err(ParseError::Truncated { len: 1, expected: 3 })
        ));
    }

    #[tokio::test]
    async fn test_line_parser_over_chunked_reads() {
        let parser = LineParser::new(TypeTag::named("line"));
        let mut conn = mock_conn(&[b"pi", b"ng\nfo", b"o\n", b"bar"]);

        let mut tags = Vec::new();
        let mut payloads = Vec::new();
        while let Some(env) = parser.next_envelope(&mut conn).await.unwrap() {
            tags.push(env.tag());
            payloads.push(env.payload().clone());
        }

        assert_eq!(payloads, vec!["ping", "foo", "bar"]);
        assert!(tags.iter().all(|t| *t == TypeTag::named("line")));
    }

    #[tokio::test]
    async fn test_envelopes_stream_ends_cleanly() {
        let parser = LineParser::of::<String>();
        let mut conn = mock_conn(&[b"a\nb\n"]);

        let items: Vec<_> = envelopes(&parser, &mut conn).collect().await;
        assert_eq!(items.len(), 2);
        for item in &items {
            assert_eq!(item.as_ref().unwrap().tag(), TypeTag::of::<String>());
        }
    }

    #[tokio::test]
    async fn test_envelopes_stream_surfaces_read_error_once() {
        let parser = LineParser::new(TypeTag::named("line"));
        let reader = tokio_test::io::Builder::new()
            .read(b"ok\n")
            .read_error(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"))
            .build();
        let mut conn = Connection::new(reader, tokio::io::sink(), peer());

        let items: Vec<_> = envelopes(&parser, &mut conn).collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap().payload().as_ref(), b"ok");
        assert!(matches!(items[1], Err(ParseError::Io(_))));
    }

    #[tokio::test]
    async fn test_fixed_size_parser_over_chunked_reads() {
        let parser = FixedSizeParser::new(TypeTag::named("rec"), NonZeroUsize::new(4).unwrap());
        let mut conn = mock_conn(&[b"ab", b"cdef", b"gh"]);

        let first = parser.next_envelope(&mut conn).await.unwrap().unwrap();
        let second = parser.next_envelope(&mut conn).await.unwrap().unwrap();
        assert_eq!(first.payload().as_ref(), b"abcd");
        assert_eq!(second.payload().as_ref(), b"efgh");
        assert!(parser.next_envelope(&mut conn).await.unwrap().is_none());
    }
}
