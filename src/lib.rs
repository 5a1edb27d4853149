//! Asynchronous random access over expensive-to-fetch byte resources.
//!
//! A [`ResourceConnection`] exposes a resource (an in-memory blob, a local
//! file, an HTTP range server) as a total size plus fetch-by-byte-range
//! operations. An [`AsyncBuffer`] caches every fetched fragment in a sorted
//! chunk list, satisfying later requests from cache and fetching only the
//! missing gaps. [`AsyncView`] windows address a buffer relatively, and
//! [`AsyncDecoder`] / [`AsyncTypedArray`] decode binary primitives lazily on
//! top: variable-width integers, null-terminated and length-prefixed UTF-8
//! strings, and fixed-width little-endian numeric arrays.

mod buffer;
pub mod connection;
mod decoder;
mod errors;
mod lock;
mod selector;
mod typed;
mod view;

pub use buffer::{AsyncBuffer, BufferConfig, ClearedReport, NotifyFn};
pub use connection::{
    AutoConnection, FileConnection, HttpRangeConnection, MemoryConnection, ResourceConnection,
};
pub use decoder::{AsyncDecoder, DEFAULT_DECODER_CHUNK};
pub use errors::{FragError, Result};
pub use lock::{AsyncLock, AsyncLockGuard};
pub use selector::AsyncViewSelector;
pub use typed::{
    AsyncTypedArray, ElementKind, ElementType, Scalar, TypedArrayCursor, DEFAULT_CURSOR_CHUNK,
};
pub use view::AsyncView;
