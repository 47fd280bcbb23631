//! Message Envelopes and Type Tags
//!
//! An [`Envelope`] is the unit of work handed from the parsing stage to the
//! dispatch stage: the raw bytes of one record plus the [`TypeTag`] that
//! selects the request shape and handler for it.
//!
//! ## Type Tags
//!
//! A tag is either derived from a concrete Rust type through the
//! [`Message`] trait, or built from an explicit string key:
//!
//! ```text
//! TypeTag::of::<Ping>()        ->  "my_crate::Ping"
//! TypeTag::of::<Box<Ping>>()   ->  "my_crate::Ping"   (indirection unwrapped)
//! TypeTag::named("ping")       ->  "ping"
//! ```

use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

/// Stable identifier for a request shape, used as the dispatch key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeTag(&'static str);

impl TypeTag {
    /// Tag derived from the fully-qualified name of `T`.
    pub fn of<T: Message + ?Sized>() -> Self {
        T::type_tag()
    }

    /// Tag built from an explicit key.
    pub const fn named(name: &'static str) -> Self {
        TypeTag(name)
    }

    /// Returns the tag's key.
    pub fn as_str(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// A request shape that can be routed by type.
///
/// The default tag is the type's fully-qualified name. Smart pointers and
/// references forward to the pointee, so `Box<T>`, `Arc<T>` and `&T` all
/// share `T`'s tag.
///
/// # Example
///
/// ```
/// use netkit::protocol::{Message, TypeTag};
///
/// #[derive(Debug)]
/// struct Ping;
/// impl Message for Ping {}
///
/// assert_eq!(TypeTag::of::<Ping>(), TypeTag::of::<Box<Ping>>());
/// ```
pub trait Message: 'static {
    /// The dispatch key for this shape.
    fn type_tag() -> TypeTag {
        TypeTag(std::any::type_name::<Self>())
    }
}

impl<T: Message + ?Sized> Message for Box<T> {
    fn type_tag() -> TypeTag {
        T::type_tag()
    }
}

impl<T: Message + ?Sized> Message for Arc<T> {
    fn type_tag() -> TypeTag {
        T::type_tag()
    }
}

impl<T: Message + ?Sized> Message for &'static T {
    fn type_tag() -> TypeTag {
        T::type_tag()
    }
}

impl Message for String {}
impl Message for Bytes {}
impl Message for Vec<u8> {}

/// One parsed unit of input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    tag: TypeTag,
    payload: Bytes,
}

impl Envelope {
    /// Creates an envelope for `payload` routed by `tag`.
    pub fn new(tag: TypeTag, payload: impl Into<Bytes>) -> Self {
        Self {
            tag,
            payload: payload.into(),
        }
    }

    /// The dispatch key.
    pub fn tag(&self) -> TypeTag {
        self.tag
    }

    /// The raw record bytes, without any framing.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Consumes the envelope, returning its parts.
    pub fn into_parts(self) -> (TypeTag, Bytes) {
        (self.tag, self.payload)
    }
}
