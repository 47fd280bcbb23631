//! Connections and Connection Handles
//!
//! A [`Connection`] is owned by exactly one pipeline task. It holds the read
//! side of the transport together with a 4 KB read buffer, and a
//! [`ConnectionHandle`] for the write side.
//!
//! The handle is cheap to clone: handlers receive one through their
//! [`Context`](crate::handlers::Context) so they can write out-of-band data,
//! while the pipeline uses the same handle to send responses. Writes are
//! serialized by an async mutex, so two writes never interleave on the wire.

use crate::connection::stats::ConnectionStats;
use bytes::{Bytes, BytesMut};
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::trace;

/// Capacity of a connection's read buffer.
pub const READ_BUFFER_SIZE: usize = 4096;

/// Spare capacity below which the read buffer is grown before a read.
const MIN_READ_CAPACITY: usize = 1024;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Shared, serialized access to a connection's write side.
#[derive(Clone)]
pub struct ConnectionHandle {
    peer: SocketAddr,
    writer: Arc<Mutex<BoxedWriter>>,
    stats: Arc<ConnectionStats>,
}

impl ConnectionHandle {
    /// The remote peer's address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Writes `data` in full and flushes it.
    pub async fn write_all(&self, data: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(data).await?;
        writer.flush().await?;
        self.stats.bytes_written(data.len());
        trace!(client = %self.peer, bytes = data.len(), "Sent data");
        Ok(())
    }

    /// Shuts down the write side, signalling end of stream to the peer.
    async fn shutdown(&self) -> io::Result<()> {
        self.writer.lock().await.shutdown().await
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

/// An accepted, buffered, bidirectional byte stream.
pub struct Connection {
    reader: BoxedReader,
    buffer: BytesMut,
    handle: ConnectionHandle,
    stats: Arc<ConnectionStats>,
}

impl Connection {
    /// Wraps an arbitrary reader/writer pair.
    pub fn new<R, W>(reader: R, writer: W, peer: SocketAddr) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let stats = Arc::new(ConnectionStats::new());
        Self {
            reader: Box::new(reader),
            buffer: BytesMut::with_capacity(READ_BUFFER_SIZE),
            handle: ConnectionHandle {
                peer,
                writer: Arc::new(Mutex::new(Box::new(writer))),
                stats: Arc::clone(&stats),
            },
            stats,
        }
    }

    /// Wraps an accepted TCP stream.
    pub fn from_tcp(stream: TcpStream, peer: SocketAddr) -> Self {
        let (reader, writer) = stream.into_split();
        Self::new(reader, writer, peer)
    }

    /// Records traffic on `stats` instead of a private counter set.
    pub fn with_stats(mut self, stats: Arc<ConnectionStats>) -> Self {
        self.handle.stats = Arc::clone(&stats);
        self.stats = stats;
        self
    }

    /// The remote peer's address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.handle.peer
    }

    /// A handle to the write side of this connection.
    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    /// Bytes received but not yet consumed.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Reads more bytes from the transport into the read buffer.
    ///
    /// Returns the number of bytes read; `0` means the peer closed the stream.
    pub async fn read_more(&mut self) -> io::Result<usize> {
        if self.buffer.capacity() - self.buffer.len() < MIN_READ_CAPACITY {
            self.buffer.reserve(READ_BUFFER_SIZE);
        }

        let n = self.reader.read_buf(&mut self.buffer).await?;
        if n > 0 {
            self.stats.bytes_read(n);
            trace!(client = %self.handle.peer, bytes = n, "Read data");
        }
        Ok(n)
    }

    /// Returns the next chunk of raw bytes, draining buffered data first.
    ///
    /// Returns `None` once the peer has closed the stream.
    pub async fn read_chunk(&mut self) -> io::Result<Option<Bytes>> {
        if self.buffer.is_empty() && self.read_more().await? == 0 {
            return Ok(None);
        }
        Ok(Some(self.buffer.split().freeze()))
    }

    /// Writes `data` in full and flushes it.
    ///
    /// The returned future owns a handle rather than borrowing the
    /// connection, so it stays `Send` inside a raw handler.
    pub fn write_all<'a>(&self, data: &'a [u8]) -> impl Future<Output = io::Result<()>> + Send + 'a {
        let handle = self.handle.clone();
        async move { handle.write_all(data).await }
    }

    /// Closes the connection.
    ///
    /// Consumes the connection, so it can only happen once. Handles held
    /// elsewhere see write errors afterwards.
    pub async fn close(self) -> io::Result<()> {
        self.handle.shutdown().await
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.handle.peer)
            .field("buffered", &self.buffer.len())
            .finish_non_exhaustive()
    }
}
