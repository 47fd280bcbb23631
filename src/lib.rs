//! # netkit - A Small TCP Server Framework
//!
//! netkit lets many small line-oriented protocol exercises share one
//! connection-handling, parsing and dispatch skeleton. A server is assembled
//! from four pluggable pieces: a parser that frames the byte stream into
//! envelopes, a decoder and an encoder for payloads, and a table of typed
//! handlers keyed by request type.
//!
//! ## Features
//!
//! - **Pluggable framing**: Line-delimited and fixed-size parsers, or your own
//! - **Pluggable codecs**: Raw bytes, `FromStr`/`Display` text, JSON via serde, big-endian binary
//! - **Typed handlers**: `Fn(Context, Req) -> Res`, type-checked at registration
//! - **Async I/O**: Built on Tokio, one task per connection
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                               Server                                    │
//! │                                                                         │
//! │  ┌─────────────┐    ┌─────────────┐                                     │
//! │  │ Accept Loop │───>│  Pipeline   │  (one task per connection)          │
//! │  │ (Listener)  │    │             │                                     │
//! │  └─────────────┘    └──────┬──────┘                                     │
//! │                            │                                            │
//! │        raw handler? ──> Parser ──> Envelope { tag, payload }            │
//! │                                          │                              │
//! │                                          ▼                              │
//! │                     ┌──────────────────────────────────────┐            │
//! │                     │          HandlerRegistry             │            │
//! │                     │   tag ──> decode ─> handler ─> encode│            │
//! │                     └──────────────────────────────────────┘            │
//! │                                          │                              │
//! │                                          ▼                              │
//! │                                    write response                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use netkit::protocol::{LineEncoder, LineParser, RawCodec};
//! use netkit::{Context, Server};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), netkit::ServerError> {
//!     Server::new(LineParser::of::<String>(), LineEncoder::new(RawCodec), RawCodec)
//!         .handle(|_ctx: Context, line: String| async move {
//!             if line == "ping" { "pong".to_string() } else { line }
//!         })
//!         .listen_and_serve()
//!         .await
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`protocol`]: Envelopes, type tags, parsers and codecs
//! - [`handlers`]: Handler context and the type-erased handler registry
//! - [`connection`]: Buffered connections and the per-connection pipeline
//! - [`server`]: Server configuration and the accept loop
//!
//! ## Design Highlights
//!
//! ### Erasure Once, at Registration
//!
//! Handlers are wrapped into a uniform calling convention by a generic
//! adapter when they are registered. Dispatching a message is a hash lookup
//! and a virtual call; there is no per-message reflection.
//!
//! ### Failure Scoping
//!
//! Decode, dispatch and encode failures skip one message. A failed write or
//! a broken stream ends one connection. Only a bind failure stops the server.

pub mod connection;
pub mod handlers;
pub mod protocol;
pub mod server;

// Re-export commonly used types for convenience
pub use connection::{Connection, ConnectionHandle, ConnectionStats};
pub use handlers::{Context, HandlerRegistry};
pub use protocol::{Envelope, Message, TypeTag};
pub use server::{Listener, Server, ServerError, DEFAULT_HOST, DEFAULT_PORT};

/// Version of netkit
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
