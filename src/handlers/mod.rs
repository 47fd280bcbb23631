//! Handler Module
//!
//! Typed request handlers, the per-message [`Context`] they receive, and the
//! [`HandlerRegistry`] that routes envelopes to them by [`TypeTag`].
//!
//! ## Dispatch
//!
//! ```text
//! Envelope { tag, payload }
//!       │
//!       ▼
//! ┌─────────────────┐
//! │ HandlerRegistry │  lookup(tag)
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │ ErasedHandler   │  decode -> call(Context, req) -> encode
//! └─────────────────┘
//! ```
//!
//! [`TypeTag`]: crate::protocol::TypeTag

pub mod context;
pub mod registry;

pub use context::Context;
pub use registry::{DispatchError, ErasedHandler, HandlerRegistry, Payload, TypedHandler};
