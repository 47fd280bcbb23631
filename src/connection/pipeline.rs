//! Per-Connection Pipeline
//!
//! Every accepted connection gets its own task running [`Pipeline::run`].
//! Messages on one connection are handled strictly one at a time; a slow
//! handler only stalls its own connection.
//!
//! ## Connection Lifecycle
//!
//! ```text
//! 1. Connection accepted, task spawned
//!        │
//!        ▼
//! 2. Raw handler (if configured) runs to completion
//!        │
//!        ▼
//! 3. ┌──────────────────────────────┐
//!    │  For each Envelope:          │
//!    │                              │
//!    │   lookup(tag)   miss -> skip │
//!    │   decode        err  -> skip │
//!    │   call handler               │
//!    │   encode        err  -> skip │
//!    │   write         err  -> stop │
//!    └──────────────────────────────┘
//!        │
//!        ▼
//! 4. Stream ended / write failed / handler panicked
//!        │
//!        ▼
//! 5. Connection closed (exactly once)
//! ```

use crate::connection::conn::{Connection, ConnectionHandle};
use crate::connection::stats::ConnectionStats;
use crate::handlers::{Context, DispatchError, HandlerRegistry};
use crate::protocol::{envelopes, Envelope, ParseError, Parser};
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, enabled, error, info, trace, warn, Level};

/// A handler given the raw connection, bypassing parsing and codecs.
pub type RawHandler = Arc<dyn for<'a> Fn(&'a mut Connection) -> BoxFuture<'a, ()> + Send + Sync>;

/// Wraps a closure as a [`RawHandler`].
///
/// ```ignore
/// let echo = raw_handler(|conn| {
///     Box::pin(async move {
///         while let Ok(Some(chunk)) = conn.read_chunk().await {
///             if conn.write_all(&chunk).await.is_err() {
///                 break;
///             }
///         }
///     })
/// });
/// ```
pub fn raw_handler<F>(f: F) -> RawHandler
where
    F: for<'a> Fn(&'a mut Connection) -> BoxFuture<'a, ()> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Reasons a connection's pipeline stopped early.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// The envelope stream ended abnormally.
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// A response could not be written; the peer is unreachable.
    #[error("write failed: {0}")]
    Write(#[source] std::io::Error),
}

/// Everything a connection task needs, shared read-only by all of them.
pub struct Pipeline<P> {
    pub(crate) registry: HandlerRegistry,
    pub(crate) raw_handler: Option<RawHandler>,
    pub(crate) handler_timeout: Option<Duration>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) stats: Arc<ConnectionStats>,
    pub(crate) parser: P,
}

impl<P: Parser> Pipeline<P> {
    pub fn new(parser: P, registry: HandlerRegistry) -> Self {
        Self {
            registry,
            raw_handler: None,
            handler_timeout: None,
            shutdown: CancellationToken::new(),
            stats: Arc::new(ConnectionStats::new()),
            parser,
        }
    }

    pub fn stats(&self) -> &Arc<ConnectionStats> {
        &self.stats
    }

    /// Serves one connection to completion, then closes it.
    pub async fn run(self: Arc<Self>, mut conn: Connection) {
        let peer = conn.peer_addr();
        self.stats.connection_opened();

        let result = AssertUnwindSafe(self.serve(&mut conn)).catch_unwind().await;

        match result {
            Ok(Ok(())) => debug!(client = %peer, "Client disconnected"),
            Ok(Err(ConnectionError::Parse(ParseError::Io(ref e))))
                if e.kind() == std::io::ErrorKind::ConnectionReset =>
            {
                debug!(client = %peer, "Connection reset by client")
            }
            Ok(Err(e)) => warn!(client = %peer, error = %e, "Connection ended with error"),
            Err(_) => error!(client = %peer, "Handler panicked, closing connection"),
        }

        if let Err(e) = conn.close().await {
            debug!(client = %peer, error = %e, "Error while closing connection");
        }
        self.stats.connection_closed();
    }

    async fn serve(&self, conn: &mut Connection) -> Result<(), ConnectionError> {
        if let Some(raw_handler) = &self.raw_handler {
            raw_handler(conn).await;
            trace!(client = %conn.peer_addr(), "Raw handler finished");
        }

        let handle = conn.handle();
        let stream = envelopes(&self.parser, conn);
        tokio::pin!(stream);

        while let Some(envelope) = stream.next().await {
            self.dispatch(envelope?, &handle).await?;
        }
        Ok(())
    }

    /// Handles one envelope. Only a failed write is an error.
    async fn dispatch(
        &self,
        envelope: Envelope,
        handle: &ConnectionHandle,
    ) -> Result<(), ConnectionError> {
        let (tag, payload) = envelope.into_parts();
        let client = handle.peer_addr();

        let Some(handler) = self.registry.lookup(tag) else {
            error!(client = %client, tag = %tag, "No handler for type");
            self.stats.message_skipped();
            return Ok(());
        };

        let request = match handler.decode(&payload) {
            Ok(request) => request,
            Err(e) => {
                self.skip(client, tag.as_str(), e);
                return Ok(());
            }
        };
        // The request moves into the handler, so it is formatted up front.
        let request_repr = enabled!(Level::INFO).then(|| format!("{request:?}"));

        let ctx = Context::new(self.shutdown.child_token(), handle.clone());
        let token = ctx.cancellation_token().clone();
        let pending = match handler.call(ctx, request) {
            Ok(pending) => pending,
            Err(e) => {
                self.skip(client, tag.as_str(), e);
                return Ok(());
            }
        };

        let response = match self.handler_timeout {
            Some(limit) => match tokio::time::timeout(limit, pending).await {
                Ok(response) => response,
                Err(_) => {
                    token.cancel();
                    warn!(client = %client, tag = %tag, timeout = ?limit, "Handler timed out");
                    self.stats.message_skipped();
                    return Ok(());
                }
            },
            None => pending.await,
        };

        if let Some(request) = request_repr {
            info!(
                client = %client,
                tag = %tag,
                request = %request,
                response = ?response,
                "Incoming request"
            );
        }

        let out = match handler.encode(&*response) {
            Ok(out) => out,
            Err(e) => {
                self.skip(client, tag.as_str(), e);
                return Ok(());
            }
        };

        handle.write_all(&out).await.map_err(ConnectionError::Write)?;
        self.stats.message_handled();
        Ok(())
    }

    fn skip(&self, client: std::net::SocketAddr, tag: &str, e: DispatchError) {
        error!(client = %client, tag = %tag, error = %e, "Message skipped");
        self.stats.message_skipped();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::TypedHandler;
    use crate::protocol::{LineEncoder, LineParser, TextCodec, TypeTag};
    use std::fmt;
    use std::io;
    use std::pin::Pin;
    use std::str::FromStr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::task::Poll;
    use tokio::io::{AsyncReadExt, AsyncWrite};
    use tracing::instrument::WithSubscriber;
    use tracing::Dispatch;

    fn peer() -> std::net::SocketAddr {
        "127.0.0.1:7000".parse().unwrap()
    }

    fn pipeline() -> Arc<Pipeline<LineParser>> {
        let mut registry = HandlerRegistry::new();
        registry.insert(
            TypeTag::named("num"),
            Arc::new(TypedHandler::<i64, i64, _, _, _>::new(
                |_ctx: Context, n: i64| async move {
                    if n < 0 {
                        panic!("negative input");
                    }
                    n * 2
                },
                Arc::new(TextCodec),
                Arc::new(LineEncoder::new(TextCodec)),
            )),
        );
        Arc::new(Pipeline::new(LineParser::new(TypeTag::named("num")), registry))
    }

    /// Runs `input` through a pipeline and returns everything written back.
    async fn run(pipeline: Arc<Pipeline<LineParser>>, input: &'static [u8]) -> Vec<u8> {
        let (client, server) = tokio::io::duplex(1024);
        let (server_read, server_write) = tokio::io::split(server);
        let (mut client_read, mut client_write) = tokio::io::split(client);

        let conn = Connection::new(server_read, server_write, peer());
        let task = tokio::spawn(pipeline.run(conn));

        tokio::io::AsyncWriteExt::write_all(&mut client_write, input).await.unwrap();
        tokio::io::AsyncWriteExt::shutdown(&mut client_write).await.unwrap();

        let mut out = Vec::new();
        client_read.read_to_end(&mut out).await.unwrap();
        task.await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_decode_error_does_not_block_next_message() {
        let pipeline = pipeline();
        let out = run(Arc::clone(&pipeline), b"1\nnot-a-number\n3\n").await;
        assert_eq!(out, b"2\n6\n");
        assert_eq!(pipeline.stats().messages_handled.load(Ordering::Relaxed), 2);
        assert_eq!(pipeline.stats().messages_skipped.load(Ordering::Relaxed), 1);
        assert_eq!(pipeline.stats().active_connections.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_missing_handler_skips_message() {
        let pipeline = Arc::new(Pipeline::new(
            LineParser::new(TypeTag::named("unknown")),
            HandlerRegistry::new(),
        ));
        let out = run(Arc::clone(&pipeline), b"1\n2\n").await;
        assert!(out.is_empty());
        assert_eq!(pipeline.stats().messages_skipped.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_panicking_handler_closes_connection() {
        let pipeline = pipeline();
        let out = run(Arc::clone(&pipeline), b"5\n-1\n7\n").await;
        assert_eq!(out, b"10\n");
        assert_eq!(pipeline.stats().connections_accepted.load(Ordering::Relaxed), 1);
        assert_eq!(pipeline.stats().active_connections.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_raw_handler_runs_before_typed_loop() {
        let mut pipeline = Pipeline::new(LineParser::new(TypeTag::named("num")), {
            let mut registry = HandlerRegistry::new();
            registry.insert(
                TypeTag::named("num"),
                Arc::new(TypedHandler::<i64, i64, _, _, _>::new(
                    |_ctx: Context, n: i64| async move { n + 1 },
                    Arc::new(TextCodec),
                    Arc::new(LineEncoder::new(TextCodec)),
                )),
            );
            registry
        });
        // Consumes exactly the first line, leaving the rest to the parser.
        let raw = raw_handler(|conn| {
            Box::pin(async move {
                while !conn.buffer_mut().contains(&b'\n') {
                    if conn.read_more().await.unwrap_or(0) == 0 {
                        return;
                    }
                }
                let pos = conn.buffer_mut().iter().position(|&b| b == b'\n').unwrap_or(0);
                let greeting = conn.buffer_mut().split_to(pos + 1);
                let _ = conn.write_all(&greeting).await;
            })
        });
        pipeline.raw_handler = Some(raw);

        let out = run(Arc::new(pipeline), b"hello\n41\n").await;
        assert_eq!(out, b"hello\n42\n");
    }

    /// Writer that fails every write as if the peer had gone away.
    struct BrokenPipe;

    impl AsyncWrite for BrokenPipe {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut std::task::Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut std::task::Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_write_failure_ends_connection() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut registry = HandlerRegistry::new();
        registry.insert(
            TypeTag::named("num"),
            Arc::new(TypedHandler::<i64, i64, _, _, _>::new(
                move |_ctx: Context, n: i64| {
                    counter.fetch_add(1, Ordering::Relaxed);
                    async move { n }
                },
                Arc::new(TextCodec),
                Arc::new(LineEncoder::new(TextCodec)),
            )),
        );
        let pipeline = Arc::new(Pipeline::new(LineParser::new(TypeTag::named("num")), registry));

        let conn = Connection::new(&b"1\n2\n3\n"[..], BrokenPipe, peer());
        Arc::clone(&pipeline).run(conn).await;

        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert_eq!(pipeline.stats().messages_handled.load(Ordering::Relaxed), 0);
        assert_eq!(pipeline.stats().connections_accepted.load(Ordering::Relaxed), 1);
        assert_eq!(pipeline.stats().active_connections.load(Ordering::Relaxed), 0);
    }

    static TRACED_FORMATS: AtomicUsize = AtomicUsize::new(0);

    /// Request that counts how often it is formatted.
    struct Traced(i64);

    impl fmt::Debug for Traced {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            TRACED_FORMATS.fetch_add(1, Ordering::Relaxed);
            write!(f, "Traced({})", self.0)
        }
    }

    impl FromStr for Traced {
        type Err = std::num::ParseIntError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            s.parse().map(Traced)
        }
    }

    /// Collects formatted log output in memory.
    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl LogBuffer {
        fn dispatch(&self, level: Level) -> Dispatch {
            let buffer = self.clone();
            let subscriber = tracing_subscriber::fmt()
                .with_max_level(level)
                .with_ansi(false)
                .with_writer(move || buffer.clone())
                .finish();
            Dispatch::new(subscriber)
        }

        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    /// Runs `input` through a pipeline on the current task.
    async fn run_inline(pipeline: Arc<Pipeline<LineParser>>, input: &'static [u8]) -> Vec<u8> {
        let (mut client, server) = tokio::io::duplex(1024);
        pipeline.run(Connection::new(input, server, peer())).await;

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_request_formatted_only_when_info_enabled() {
        let mut registry = HandlerRegistry::new();
        registry.insert(
            TypeTag::named("traced"),
            Arc::new(TypedHandler::<Traced, i64, _, _, _>::new(
                |_ctx: Context, req: Traced| async move { req.0 },
                Arc::new(TextCodec),
                Arc::new(LineEncoder::new(TextCodec)),
            )),
        );
        let pipeline = Arc::new(Pipeline::new(LineParser::new(TypeTag::named("traced")), registry));

        let quiet = LogBuffer::default();
        let out = run_inline(Arc::clone(&pipeline), b"4\n")
            .with_subscriber(quiet.dispatch(Level::WARN))
            .await;
        assert_eq!(out, b"4\n");
        assert_eq!(TRACED_FORMATS.load(Ordering::Relaxed), 0);

        let logs = LogBuffer::default();
        let out = run_inline(Arc::clone(&pipeline), b"5\n")
            .with_subscriber(logs.dispatch(Level::INFO))
            .await;
        assert_eq!(out, b"5\n");
        assert_eq!(TRACED_FORMATS.load(Ordering::Relaxed), 1);
        assert!(logs.contents().contains("Traced(5)"));
        assert!(logs.contents().contains("Incoming request"));
    }
}
