//! Handler Registry
//!
//! Handlers are strongly typed functions from `(Context, Req)` to `Res`. The
//! registry stores them behind one uniform, type-erased calling convention
//! so that a single table can serve every request shape.
//!
//! ## Architecture
//!
//! ```text
//!  registration (once)                         dispatch (per message)
//!
//!  Fn(Context, Req) -> Res  ──TypedHandler──>  Arc<dyn ErasedHandler>
//!      + Decoder<Req>                               │
//!      + Encoder<Res>                               ├─ decode(payload) -> Box<dyn Payload>
//!                                                   ├─ call(ctx, req)   -> Box<dyn Payload>
//!                                                   └─ encode(res)      -> Vec<u8>
//! ```
//!
//! All type checking happens when the [`TypedHandler`] is built: a handler
//! whose shape does not match "one request in, one response out" does not
//! compile, and the server's codecs must support both shapes. The erased
//! entry only ever sees payloads it produced itself.

use crate::handlers::context::Context;
use crate::protocol::{CodecError, Decoder, Encoder, TypeTag};
use bytes::Bytes;
use futures::future::BoxFuture;
use std::any::{type_name, Any};
use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use thiserror::Error;

/// A value crossing the type-erased dispatch boundary.
pub trait Payload: Any + Debug + Send {
    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

impl<T: Any + Debug + Send> Payload for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

/// Per-message dispatch failures. None of them affect the connection.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unable to decode request: {0}")]
    Decode(#[source] CodecError),

    #[error("unable to encode response: {0}")]
    Encode(#[source] CodecError),

    /// An erased payload reached a handler built for another shape.
    #[error("payload is not a `{expected}`")]
    ShapeMismatch { expected: &'static str },
}

/// Uniform calling convention for registered handlers.
pub trait ErasedHandler: Send + Sync {
    fn decode(&self, payload: &Bytes) -> Result<Box<dyn Payload>, DispatchError>;

    fn call(
        &self,
        ctx: Context,
        request: Box<dyn Payload>,
    ) -> Result<BoxFuture<'static, Box<dyn Payload>>, DispatchError>;

    fn encode(&self, response: &dyn Payload) -> Result<Vec<u8>, DispatchError>;

    /// Name of the request shape, for logs.
    fn request_type(&self) -> &'static str;
}

/// Adapter from a typed handler and its codecs to [`ErasedHandler`].
pub struct TypedHandler<Req, Res, F, D, E> {
    func: F,
    decoder: Arc<D>,
    encoder: Arc<E>,
    _shape: PhantomData<fn(Req) -> Res>,
}

impl<Req, Res, F, D, E> TypedHandler<Req, Res, F, D, E> {
    pub fn new(func: F, decoder: Arc<D>, encoder: Arc<E>) -> Self {
        Self {
            func,
            decoder,
            encoder,
            _shape: PhantomData,
        }
    }
}

impl<Req, Res, F, Fut, D, E> ErasedHandler for TypedHandler<Req, Res, F, D, E>
where
    Req: Debug + Send + 'static,
    Res: Debug + Send + 'static,
    F: Fn(Context, Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Res> + Send + 'static,
    D: Decoder<Req>,
    E: Encoder<Res>,
{
    fn decode(&self, payload: &Bytes) -> Result<Box<dyn Payload>, DispatchError> {
        let request = self.decoder.decode(payload).map_err(DispatchError::Decode)?;
        Ok(Box::new(request))
    }

    fn call(
        &self,
        ctx: Context,
        request: Box<dyn Payload>,
    ) -> Result<BoxFuture<'static, Box<dyn Payload>>, DispatchError> {
        let request = request
            .into_any()
            .downcast::<Req>()
            .map_err(|_| DispatchError::ShapeMismatch {
                expected: type_name::<Req>(),
            })?;

        let response = (self.func)(ctx, *request);
        Ok(Box::pin(async move { Box::new(response.await) as Box<dyn Payload> }))
    }

    fn encode(&self, response: &dyn Payload) -> Result<Vec<u8>, DispatchError> {
        let response = Payload::as_any(response)
            .downcast_ref::<Res>()
            .ok_or(DispatchError::ShapeMismatch {
                expected: type_name::<Res>(),
            })?;
        self.encoder.encode(response).map_err(DispatchError::Encode)
    }

    fn request_type(&self) -> &'static str {
        type_name::<Req>()
    }
}

/// Table from [`TypeTag`] to handler.
///
/// Filled while the server is being configured and read-only once it
/// serves, so lookups from many connection tasks need no locking.
#[derive(Default)]
pub struct HandlerRegistry {
    routes: HashMap<TypeTag, Arc<dyn ErasedHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `tag`, replacing and returning any previous one.
    pub fn insert(
        &mut self,
        tag: TypeTag,
        handler: Arc<dyn ErasedHandler>,
    ) -> Option<Arc<dyn ErasedHandler>> {
        self.routes.insert(tag, handler)
    }

    pub fn lookup(&self, tag: TypeTag) -> Option<&Arc<dyn ErasedHandler>> {
        self.routes.get(&tag)
    }

    pub fn contains(&self, tag: TypeTag) -> bool {
        self.routes.contains_key(&tag)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Registered tags, in no particular order.
    pub fn tags(&self) -> impl Iterator<Item = TypeTag> + '_ {
        self.routes.keys().copied()
    }
}

impl Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (tag, handler) in &self.routes {
            map.entry(&tag.as_str(), &handler.request_type());
        }
        map.finish()
    }
}
