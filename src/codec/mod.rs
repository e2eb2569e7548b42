//! The base codec: a synchronous structural serializer over an
//! index-referenced JSON node array.
//!
//! A serialization is either a JSON array of *nodes* (node 0 is the root)
//! or a bare negative integer for the sentinel primitive forms. Container
//! nodes hold node indices, never inline values, so shared references and
//! cycles flatten to one node per distinct referent. Arrays whose first
//! element is a string are *tagged nodes* `[name, index…]`, covering the
//! built-in structural types and every user-registered custom type.
//!
//! [`Reducers`] and [`Revivers`] are the extension point: a reducer claims
//! a value and emits its payload, a reviver rebuilds the value from the
//! reconstructed payload. The async type names `Promise`, `AsyncIterable`
//! and `ReadableStream` are reserved for the encoder's built-in reducers;
//! shadowing them is undefined behavior.

use std::sync::Arc;

use crate::error::DecodeError;
use crate::value::Value;

mod flatten;
mod unflatten;

pub use flatten::flatten;
pub use unflatten::unflatten;

/// Reserved tag for single-shot asynchronous results.
pub const TAG_PROMISE: &str = "Promise";
/// Reserved tag for asynchronous sequences.
pub const TAG_ASYNC_ITERABLE: &str = "AsyncIterable";
/// Reserved tag for pull-based streams.
pub const TAG_READABLE_STREAM: &str = "ReadableStream";

pub(crate) const TAG_DATE: &str = "Date";
pub(crate) const TAG_BIGINT: &str = "BigInt";
pub(crate) const TAG_REGEXP: &str = "RegExp";
pub(crate) const TAG_MAP: &str = "Map";
pub(crate) const TAG_SET: &str = "Set";

// Sentinel code points, usable wherever a node index is expected.
// -1 and -2 are reserved.
pub(crate) const SENTINEL_NAN: i64 = -3;
pub(crate) const SENTINEL_POS_INFINITY: i64 = -4;
pub(crate) const SENTINEL_NEG_INFINITY: i64 = -5;
pub(crate) const SENTINEL_NEG_ZERO: i64 = -6;

// Chunk statuses for promise ids.
pub(crate) const STATUS_FULFILLED: u8 = 0;
pub(crate) const STATUS_REJECTED: u8 = 1;

// Chunk statuses for sequence and pull-stream ids.
pub(crate) const STATUS_YIELD: u8 = 0;
pub(crate) const STATUS_ERROR: u8 = 1;
pub(crate) const STATUS_RETURN: u8 = 2;

pub type ReducerFn = Arc<dyn Fn(&Value) -> Option<Value> + Send + Sync>;

pub type ReviverFn = Arc<dyn Fn(Value) -> Result<Value, DecodeError> + Send + Sync>;

/// An ordered name → reducer registry.
///
/// During flatten every value is offered to the reducers in registration
/// order; the first to return `Some(payload)` claims it and the codec emits
/// `[name, payload]` with the payload recursively flattened.
#[derive(Clone, Default)]
pub struct Reducers {
    entries: Vec<(String, ReducerFn)>,
}

impl Reducers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(mut self, name: impl Into<String>, reducer: F) -> Self
    where
        F: Fn(&Value) -> Option<Value> + Send + Sync + 'static,
    {
        self.entries.push((name.into(), Arc::new(reducer)));
        self
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&str, &ReducerFn)> {
        self.entries.iter().map(|(name, f)| (name.as_str(), f))
    }
}

/// A name → reviver registry, the decode-side mirror of [`Reducers`].
#[derive(Clone, Default)]
pub struct Revivers {
    entries: Vec<(String, ReviverFn)>,
}

impl Revivers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(mut self, name: impl Into<String>, reviver: F) -> Self
    where
        F: Fn(Value) -> Result<Value, DecodeError> + Send + Sync + 'static,
    {
        self.entries.push((name.into(), Arc::new(reviver)));
        self
    }

    pub(crate) fn get(&self, name: &str) -> Option<&ReviverFn> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, f)| f)
    }
}
