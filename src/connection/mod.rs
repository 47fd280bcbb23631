//! Connection Module
//!
//! This module manages individual client connections.
//! Each client connection is served by its own async task, allowing
//! the server to handle many concurrent clients without one slow client
//! holding up the others.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Accept Loop                             │
//! │                    (server.rs)                              │
//! └──────────────────────┬──────────────────────────────────────┘
//!                        │
//!                        │ accept()
//!                        ▼
//!           ┌────────────────────────┐
//!           │   For each client...   │
//!           └────────────┬───────────┘
//!                        │
//!                        │ spawn task
//!                        ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Pipeline                               │
//! │                                                             │
//! │  ┌──────────┐   ┌──────────┐   ┌──────────┐   ┌──────────┐  │
//! │  │ Raw hook │──>│  Parser  │──>│ Dispatch │──>│  Write   │  │
//! │  └──────────┘   └──────────┘   └──────────┘   └──────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Buffered reads**: A 4 KB `BytesMut` buffer amortizes read syscalls
//! - **Shared write handle**: Handlers can write out-of-band through their context
//! - **Guaranteed release**: A connection is closed exactly once, even after a panic
//! - **Statistics**: Tracks connection, message and byte counters

pub mod conn;
pub mod pipeline;
pub mod stats;

// Re-export commonly used types
pub use conn::{Connection, ConnectionHandle, READ_BUFFER_SIZE};
pub use pipeline::{raw_handler, ConnectionError, Pipeline, RawHandler};
pub use stats::ConnectionStats;
