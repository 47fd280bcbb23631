//! TCP Server
//!
//! The [`Server`] owns the configuration of one protocol endpoint: where to
//! listen, how to frame and decode requests, how to encode responses, and
//! which handler serves each request shape.
//!
//! ## Lifecycle
//!
//! ```text
//! Created ──configure──> listen_and_serve() ──bind──> Listening
//!                                                       │
//!                                     accept() ─────────┤ (loop)
//!                                                       │
//!                                            spawn Pipeline::run(conn)
//! ```
//!
//! Registration happens on the builder before serving starts; once
//! [`Server::serve`] is called, the handler table is frozen and shared
//! read-only by every connection task.
//!
//! ## Example
//!
//! ```no_run
//! use netkit::protocol::{LineEncoder, LineParser, TextCodec};
//! use netkit::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), netkit::ServerError> {
//!     Server::new(LineParser::of::<String>(), LineEncoder::new(TextCodec), TextCodec)
//!         .with_addr("127.0.0.1:6969")
//!         .handle_fn(|_ctx, line: String| line.to_uppercase())
//!         .listen_and_serve()
//!         .await
//! }
//! ```

use crate::connection::{raw_handler, Connection, ConnectionStats, Pipeline, RawHandler};
use crate::handlers::{Context, HandlerRegistry, TypedHandler};
use crate::protocol::{Decoder, Encoder, Message, Parser, TypeTag};
use futures::future::BoxFuture;
use std::fmt::Debug;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;
use tracing::{error, info, warn, Dispatch};

/// The port used when no bind address is configured
pub const DEFAULT_PORT: u16 = 6969;

/// The host used when no bind address (or only a `:port`) is configured
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Pause after a failed accept, so persistent failures do not spin.
const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(10);

/// Errors that stop a server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listening socket could not be created.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
}

/// A source of accepted TCP connections.
pub trait Listener: Send + 'static {
    fn accept(&mut self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl Listener for TcpListener {
    fn accept(&mut self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
        TcpListener::accept(self)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

/// Server configuration and handler table.
///
/// `P` frames the byte stream, `D` decodes request payloads and `E`
/// encodes responses. Every registered handler must have a request type
/// that `D` can decode and a response type that `E` can encode.
pub struct Server<P, D, E> {
    addr: Option<String>,
    parser: P,
    decoder: Arc<D>,
    encoder: Arc<E>,
    registry: HandlerRegistry,
    raw_handler: Option<RawHandler>,
    handler_timeout: Option<Duration>,
    logger: Dispatch,
    shutdown: CancellationToken,
    stats: Arc<ConnectionStats>,
    replaced: Vec<TypeTag>,
}

impl<P, D, E> Server<P, D, E>
where
    P: Parser,
    D: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    /// Creates a server with no handlers.
    ///
    /// The server logs nothing until a logger is passed with
    /// [`Server::with_logger`]; the process-wide default is never consulted.
    pub fn new(parser: P, encoder: E, decoder: D) -> Self {
        Self {
            addr: None,
            parser,
            decoder: Arc::new(decoder),
            encoder: Arc::new(encoder),
            registry: HandlerRegistry::new(),
            raw_handler: None,
            handler_timeout: None,
            logger: Dispatch::none(),
            shutdown: CancellationToken::new(),
            stats: Arc::new(ConnectionStats::new()),
            replaced: Vec::new(),
        }
    }

    /// Sets the `host:port` to listen on. A bare `:port` means all interfaces.
    pub fn with_addr(mut self, addr: impl Into<String>) -> Self {
        self.addr = Some(addr.into());
        self
    }

    /// Runs `handler` on every new connection before the typed loop starts.
    pub fn with_raw_handler<F>(mut self, handler: F) -> Self
    where
        F: for<'a> Fn(&'a mut Connection) -> BoxFuture<'a, ()> + Send + Sync + 'static,
    {
        self.raw_handler = Some(raw_handler(handler));
        self
    }

    /// Sets the logger for the accept loop and every connection task.
    pub fn with_logger(mut self, logger: impl Into<Dispatch>) -> Self {
        self.logger = logger.into();
        self
    }

    /// Gives each handler call at most `timeout`; late messages are skipped.
    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = Some(timeout);
        self
    }

    /// Registers an async handler under an explicit tag.
    ///
    /// A later registration for the same tag replaces the earlier one and is
    /// reported through the server's logger once serving starts.
    pub fn route<Req, Res, F, Fut>(mut self, tag: TypeTag, handler: F) -> Self
    where
        Req: Debug + Send + 'static,
        Res: Debug + Send + 'static,
        F: Fn(Context, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Res> + Send + 'static,
        D: Decoder<Req>,
        E: Encoder<Res>,
    {
        let typed = TypedHandler::<Req, Res, F, D, E>::new(
            handler,
            Arc::clone(&self.decoder),
            Arc::clone(&self.encoder),
        );
        if self.registry.insert(tag, Arc::new(typed)).is_some() {
            self.replaced.push(tag);
        }
        self
    }

    /// Registers an async handler under its request type's tag.
    pub fn handle<Req, Res, F, Fut>(self, handler: F) -> Self
    where
        Req: Message + Debug + Send,
        Res: Debug + Send + 'static,
        F: Fn(Context, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Res> + Send + 'static,
        D: Decoder<Req>,
        E: Encoder<Res>,
    {
        self.route(TypeTag::of::<Req>(), handler)
    }

    /// Registers a synchronous handler under its request type's tag.
    pub fn handle_fn<Req, Res, F>(self, handler: F) -> Self
    where
        Req: Message + Debug + Send,
        Res: Debug + Send + 'static,
        F: Fn(Context, Req) -> Res + Send + Sync + 'static,
        D: Decoder<Req>,
        E: Encoder<Res>,
    {
        self.handle::<Req, Res, _, _>(move |ctx, req| std::future::ready(handler(ctx, req)))
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Counters shared with every connection this server will accept.
    pub fn stats(&self) -> Arc<ConnectionStats> {
        Arc::clone(&self.stats)
    }

    /// Cancelling this token stops the accept loop and cancels every
    /// in-flight handler context.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// The address [`Server::listen_and_serve`] binds to.
    pub fn bind_address(&self) -> String {
        normalize_addr(self.addr.as_deref())
    }

    /// Binds the configured address and serves until shut down.
    ///
    /// A bind failure is returned before any connection is accepted.
    pub async fn listen_and_serve(self) -> Result<(), ServerError> {
        let addr = self.bind_address();
        let listener = match TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(source) => {
                tracing::dispatcher::with_default(&self.logger, || {
                    error!(addr = %addr, error = %source, "Failed to bind listener");
                });
                return Err(ServerError::Bind { addr, source });
            }
        };
        self.serve(listener).await
    }

    /// Accepts connections from `listener` until shut down.
    ///
    /// Accept errors are logged and the loop continues.
    pub async fn serve<L: Listener>(mut self, mut listener: L) -> Result<(), ServerError> {
        let logger = self.logger.clone();
        let task_logger = self.logger.clone();
        let shutdown = self.shutdown.clone();
        let replaced = std::mem::take(&mut self.replaced);
        let pipeline = Arc::new(self.into_pipeline());

        let accept_loop = async move {
            for tag in replaced {
                warn!(tag = %tag, "Handler re-registered, previous one replaced");
            }
            match listener.local_addr() {
                Ok(addr) => info!(addr = %addr, "Listening"),
                Err(_) => info!("Listening"),
            }

            loop {
                let accepted = tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("Shutdown requested, no longer accepting connections");
                        break;
                    }
                    accepted = listener.accept() => accepted,
                };

                match accepted {
                    Ok((stream, addr)) => {
                        info!(client = %addr, "Accepted connection");
                        let conn = Connection::from_tcp(stream, addr)
                            .with_stats(Arc::clone(pipeline.stats()));
                        let task = Arc::clone(&pipeline).run(conn);
                        tokio::spawn(task.with_subscriber(task_logger.clone()));
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(ACCEPT_ERROR_PAUSE).await;
                    }
                }
            }
            Ok(())
        };

        accept_loop.with_subscriber(logger).await
    }

    fn into_pipeline(self) -> Pipeline<P> {
        Pipeline {
            registry: self.registry,
            raw_handler: self.raw_handler,
            handler_timeout: self.handler_timeout,
            shutdown: self.shutdown,
            stats: self.stats,
            parser: self.parser,
        }
    }
}

fn normalize_addr(addr: Option<&str>) -> String {
    match addr {
        None | Some("") => format!("{DEFAULT_HOST}:{DEFAULT_PORT}"),
        Some(addr) if addr.starts_with(':') => format!("{DEFAULT_HOST}{addr}"),
        Some(addr) => addr.to_string(),
    }
}
