//! The value graph model.
//!
//! [`Value`] is a cloneable sum type covering every form the wire protocol
//! can carry. Containers are shared and interiorly mutable so one node can
//! appear at several positions in a graph (and graphs may be cyclic); the
//! encoder tracks them by identity and emits each distinct referent once.
//!
//! Asynchronous leaves come in three kinds:
//!
//!  - [`Promise`], a single-shot asynchronous result (fulfilled or rejected),
//!  - [`AsyncSequence`], a lazy, possibly-infinite sequence with a terminal
//!    return value or error,
//!  - [`PullStream`], a pull-based record stream with an explicit close.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use num_bigint::BigInt;
use time::OffsetDateTime;

use crate::error::EncodeError;
use crate::signal::Deferred;

/// A value that can be encoded onto, or was decoded from, a frame stream.
#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    BigInt(BigInt),
    Date(OffsetDateTime),
    Regex(Regex),
    Array(Array),
    Object(Object),
    Map(Map),
    Set(Set),
    Opaque(Opaque),
    Promise(Promise),
    Sequence(AsyncSequence),
    Stream(PullStream),
}

impl Value {
    /// Wrap a host value that only a user-registered reducer can encode.
    pub fn opaque<T: Any + Send + Sync>(value: T) -> Self {
        Self::Opaque(Opaque::new(value))
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Array> {
        match self {
            Self::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Object> {
        match self {
            Self::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_opaque(&self) -> Option<&Opaque> {
        match self {
            Self::Opaque(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_promise(&self) -> Option<&Promise> {
        match self {
            Self::Promise(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_sequence(&self) -> Option<&AsyncSequence> {
        match self {
            Self::Sequence(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_stream(&self) -> Option<&PullStream> {
        match self {
            Self::Stream(s) => Some(s),
            _ => None,
        }
    }

    /// Object field lookup.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.as_object().and_then(|o| o.get(key))
    }

    /// A short name for the value's kind, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Int(_) => "integer",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::BigInt(_) => "bigint",
            Self::Date(_) => "date",
            Self::Regex(_) => "regex",
            Self::Array(_) => "array",
            Self::Object(_) => "object",
            Self::Map(_) => "map",
            Self::Set(_) => "set",
            Self::Opaque(_) => "opaque value",
            Self::Promise(_) => "promise",
            Self::Sequence(_) => "async sequence",
            Self::Stream(_) => "pull stream",
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Self::Int(i as i64)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<Object> for Value {
    fn from(o: Object) -> Self {
        Self::Object(o)
    }
}

impl From<Array> for Value {
    fn from(a: Array) -> Self {
        Self::Array(a)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("Null"),
            Self::Bool(b) => write!(f, "Bool({b})"),
            Self::Int(i) => write!(f, "Int({i})"),
            Self::Float(x) => write!(f, "Float({x})"),
            Self::String(s) => write!(f, "String({s:?})"),
            Self::BigInt(i) => write!(f, "BigInt({i})"),
            Self::Date(d) => write!(f, "Date({d})"),
            Self::Regex(r) => write!(f, "Regex(/{}/{})", r.source, r.flags),
            Self::Array(a) => write!(f, "Array({:?})", a.to_vec()),
            Self::Object(o) => write!(f, "Object({:?})", o.entries()),
            Self::Map(m) => write!(f, "Map({:?})", m.entries()),
            Self::Set(s) => write!(f, "Set({:?})", s.to_vec()),
            Self::Opaque(_) => f.write_str("Opaque"),
            Self::Promise(_) => f.write_str("Promise"),
            Self::Sequence(_) => f.write_str("AsyncSequence"),
            Self::Stream(_) => f.write_str("PullStream"),
        }
    }
}

/// Deep structural equality.
///
/// Floats compare by bit pattern so `-0 != +0` and `NaN == NaN`, which is
/// what round-trip assertions need. Opaque and asynchronous leaves compare
/// by identity.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits(),
            (Self::String(a), Self::String(b)) => a == b,
            (Self::BigInt(a), Self::BigInt(b)) => a == b,
            (Self::Date(a), Self::Date(b)) => a == b,
            (Self::Regex(a), Self::Regex(b)) => a == b,
            (Self::Array(a), Self::Array(b)) => a.to_vec() == b.to_vec(),
            (Self::Object(a), Self::Object(b)) => a.entries() == b.entries(),
            (Self::Map(a), Self::Map(b)) => a.entries() == b.entries(),
            (Self::Set(a), Self::Set(b)) => a.to_vec() == b.to_vec(),
            (Self::Opaque(a), Self::Opaque(b)) => a.ptr_eq(b),
            (Self::Promise(a), Self::Promise(b)) => a.ptr_eq(b),
            (Self::Sequence(a), Self::Sequence(b)) => a.ptr_eq(b),
            (Self::Stream(a), Self::Stream(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

/// A regular-expression literal, carried as source text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Regex {
    pub source: String,
    pub flags: String,
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// A shared, ordered sequence of values.
#[derive(Clone, Default)]
pub struct Array(Arc<RwLock<Vec<Value>>>);

impl Array {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_vec(values: Vec<Value>) -> Self {
        Self(Arc::new(RwLock::new(values)))
    }

    pub fn push(&self, value: Value) {
        write(&self.0).push(value);
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        read(&self.0).get(index).cloned()
    }

    pub fn len(&self) -> usize {
        read(&self.0).len()
    }

    pub fn is_empty(&self) -> bool {
        read(&self.0).is_empty()
    }

    /// A snapshot of the current contents.
    pub fn to_vec(&self) -> Vec<Value> {
        read(&self.0).clone()
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn key(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

/// A shared keyed collection with string keys, preserving insertion order.
#[derive(Clone, Default)]
pub struct Object(Arc<RwLock<Vec<(String, Value)>>>);

impl Object {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<(String, Value)>) -> Self {
        Self(Arc::new(RwLock::new(entries)))
    }

    /// Replaces in place when the key exists, appends otherwise.
    pub fn insert(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        let mut entries = write(&self.0);
        match entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => *slot = value,
            None => entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        read(&self.0)
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    pub fn len(&self) -> usize {
        read(&self.0).len()
    }

    pub fn is_empty(&self) -> bool {
        read(&self.0).is_empty()
    }

    /// A snapshot of the current entries.
    pub fn entries(&self) -> Vec<(String, Value)> {
        read(&self.0).clone()
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn key(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

/// A shared keyed collection with arbitrary value keys, preserving
/// insertion order.
#[derive(Clone, Default)]
pub struct Map(Arc<RwLock<Vec<(Value, Value)>>>);

impl Map {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: Value, value: Value) {
        write(&self.0).push((key, value));
    }

    pub fn entries(&self) -> Vec<(Value, Value)> {
        read(&self.0).clone()
    }

    pub fn len(&self) -> usize {
        read(&self.0).len()
    }

    pub fn is_empty(&self) -> bool {
        read(&self.0).is_empty()
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn key(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

/// A shared set-like collection, preserving insertion order.
#[derive(Clone, Default)]
pub struct Set(Arc<RwLock<Vec<Value>>>);

impl Set {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, value: Value) {
        write(&self.0).push(value);
    }

    pub fn to_vec(&self) -> Vec<Value> {
        read(&self.0).clone()
    }

    pub fn len(&self) -> usize {
        read(&self.0).len()
    }

    pub fn is_empty(&self) -> bool {
        read(&self.0).is_empty()
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn key(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

/// A host value with no native wire form.
///
/// Only a user-registered reducer can encode it; encoding an unclaimed
/// opaque fails with [`EncodeError::Unsupported`], which is the path the
/// encoder's `coerce_error` hook salvages.
#[derive(Clone)]
pub struct Opaque(Arc<dyn Any + Send + Sync>);

impl Opaque {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }

    pub fn is<T: Any>(&self) -> bool {
        self.0.is::<T>()
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn key(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

type PromiseFuture = Shared<BoxFuture<'static, Result<Value, Value>>>;

/// A single-shot asynchronous result.
///
/// Clones share one completion, so awaiting from several places observes
/// the same settlement, and the encoder can recognize the same promise at
/// several graph positions by identity.
#[derive(Clone)]
pub struct Promise(Arc<PromiseInner>);

struct PromiseInner {
    result: PromiseFuture,
}

impl Promise {
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = Result<Value, Value>> + Send + 'static,
    {
        Self(Arc::new(PromiseInner {
            result: future.boxed().shared(),
        }))
    }

    pub fn resolved(value: Value) -> Self {
        Self::new(futures::future::ready(Ok(value)))
    }

    pub fn rejected(cause: Value) -> Self {
        Self::new(futures::future::ready(Err(cause)))
    }

    /// A pending promise plus its settle side.
    pub fn deferred() -> (Self, Deferred) {
        let deferred = Deferred::new();
        let promise = Self::new(deferred.subscribe());
        (promise, deferred)
    }

    /// Await the settlement.
    pub async fn wait(&self) -> Result<Value, Value> {
        self.0.result.clone().await
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn key(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

/// One observation from an asynchronous sequence.
#[derive(Clone, Debug, PartialEq)]
pub enum Chunk {
    /// One produced item; more may follow.
    Yield(Value),
    /// Terminal: the sequence's final return value.
    Return(Value),
    /// Terminal: the thrown cause.
    Error(Value),
}

/// One consumer observation from a [`SequenceReader`].
#[derive(Clone, Debug, PartialEq)]
pub enum SeqStep {
    Item(Value),
    Done(Value),
}

pub(crate) type ChunkStream = BoxStream<'static, Chunk>;

pub(crate) type CloseHook =
    Box<dyn FnOnce() -> BoxFuture<'static, Result<(), EncodeError>> + Send>;

/// The single-consumption half of a sequence: its chunk stream plus an
/// optional cooperative cancellation hook.
pub(crate) struct SequenceBody {
    pub(crate) chunks: ChunkStream,
    pub(crate) close: Option<CloseHook>,
}

/// A lazy, possibly-infinite asynchronous sequence.
///
/// The body is taken exactly once, by the encoder or by [`reader`]; a
/// second take observes `None`. Clones share the body, which is how the
/// encoder deduplicates a sequence appearing at several graph positions.
///
/// [`reader`]: AsyncSequence::reader
#[derive(Clone)]
pub struct AsyncSequence(Arc<SequenceInner>);

struct SequenceInner {
    body: Mutex<Option<SequenceBody>>,
}

impl AsyncSequence {
    pub fn new(chunks: impl Stream<Item = Chunk> + Send + 'static) -> Self {
        Self::from_body(SequenceBody {
            chunks: chunks.boxed(),
            close: None,
        })
    }

    /// Like [`AsyncSequence::new`], with a cancellation hook that runs once
    /// on any exit path.
    pub fn with_close<C, F>(chunks: impl Stream<Item = Chunk> + Send + 'static, close: C) -> Self
    where
        C: FnOnce() -> F + Send + 'static,
        F: Future<Output = Result<(), EncodeError>> + Send + 'static,
    {
        Self::from_body(SequenceBody {
            chunks: chunks.boxed(),
            close: Some(Box::new(move || close().boxed())),
        })
    }

    /// Adapt a stream of results: `Ok` items yield, the first `Err` is the
    /// terminal error, and a clean end returns `Null`.
    pub fn from_results(
        results: impl Stream<Item = Result<Value, Value>> + Send + 'static,
    ) -> Self {
        let chunks = stream::unfold(Some(results.boxed()), |state| async move {
            let mut results = state?;
            match results.next().await {
                Some(Ok(value)) => Some((Chunk::Yield(value), Some(results))),
                Some(Err(cause)) => Some((Chunk::Error(cause), None)),
                None => Some((Chunk::Return(Value::Null), None)),
            }
        });
        Self::new(chunks)
    }

    pub(crate) fn from_body(body: SequenceBody) -> Self {
        Self(Arc::new(SequenceInner {
            body: Mutex::new(Some(body)),
        }))
    }

    pub(crate) fn take_body(&self) -> Option<SequenceBody> {
        self.0
            .body
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Whether the body has already been taken.
    pub fn is_consumed(&self) -> bool {
        self.0
            .body
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Take the consumer surface. `None` if the sequence was already
    /// consumed (by a prior reader or by an encoder).
    pub fn reader(&self) -> Option<SequenceReader> {
        self.take_body().map(|body| SequenceReader {
            chunks: Some(body.chunks),
            close: body.close,
        })
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn key(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

/// Step-at-a-time consumer surface for an [`AsyncSequence`].
pub struct SequenceReader {
    chunks: Option<ChunkStream>,
    close: Option<CloseHook>,
}

impl SequenceReader {
    /// The next observation: an item, the terminal return value, or the
    /// thrown cause as the error. Past the terminal, reports `Done(Null)`.
    pub async fn next(&mut self) -> Result<SeqStep, Value> {
        let Some(chunks) = self.chunks.as_mut() else {
            return Ok(SeqStep::Done(Value::Null));
        };
        match chunks.next().await {
            Some(Chunk::Yield(value)) => Ok(SeqStep::Item(value)),
            Some(Chunk::Return(value)) => {
                self.chunks = None;
                Ok(SeqStep::Done(value))
            }
            Some(Chunk::Error(cause)) => {
                self.chunks = None;
                Err(cause)
            }
            None => {
                self.chunks = None;
                Ok(SeqStep::Done(Value::Null))
            }
        }
    }

    /// Stop consuming and run the cancellation hook.
    pub async fn cancel(mut self) -> Result<(), EncodeError> {
        self.chunks = None;
        match self.close.take() {
            Some(close) => close().await,
            None => Ok(()),
        }
    }
}

/// A pull-based record stream.
///
/// Wire-compatible with [`AsyncSequence`] (same chunk statuses); differs
/// only in its consumer surface, where the terminal return payload is
/// ignored and exhaustion reads as a close.
#[derive(Clone)]
pub struct PullStream(AsyncSequence);

impl PullStream {
    pub fn new(chunks: impl Stream<Item = Chunk> + Send + 'static) -> Self {
        Self(AsyncSequence::new(chunks))
    }

    pub fn with_close<C, F>(chunks: impl Stream<Item = Chunk> + Send + 'static, close: C) -> Self
    where
        C: FnOnce() -> F + Send + 'static,
        F: Future<Output = Result<(), EncodeError>> + Send + 'static,
    {
        Self(AsyncSequence::with_close(chunks, close))
    }

    /// A stream over a fixed set of records.
    pub fn from_values(values: Vec<Value>) -> Self {
        let chunks = stream::iter(values)
            .map(Chunk::Yield)
            .chain(stream::once(async { Chunk::Return(Value::Null) }));
        Self::new(chunks)
    }

    pub(crate) fn from_sequence(sequence: AsyncSequence) -> Self {
        Self(sequence)
    }

    pub(crate) fn take_body(&self) -> Option<SequenceBody> {
        self.0.take_body()
    }

    /// Whether the body has already been taken.
    pub fn is_consumed(&self) -> bool {
        self.0.is_consumed()
    }

    /// Take the consumer surface. `None` if already consumed.
    pub fn reader(&self) -> Option<StreamReader> {
        self.0.reader().map(|inner| StreamReader { inner })
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.0.ptr_eq(&other.0)
    }

    pub(crate) fn key(&self) -> usize {
        self.0.key()
    }
}

/// Pull-at-a-time consumer surface for a [`PullStream`].
pub struct StreamReader {
    inner: SequenceReader,
}

impl StreamReader {
    /// The next record, `None` once the stream closes, or the thrown cause.
    pub async fn pull(&mut self) -> Result<Option<Value>, Value> {
        match self.inner.next().await? {
            SeqStep::Item(value) => Ok(Some(value)),
            SeqStep::Done(_) => Ok(None),
        }
    }

    /// Stop pulling and run the cancellation hook.
    pub async fn cancel(self) -> Result<(), EncodeError> {
        self.inner.cancel().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_equality_is_bitwise() {
        assert_ne!(Value::Float(0.0), Value::Float(-0.0));
        assert_eq!(Value::Float(f64::NAN), Value::Float(f64::NAN));
    }

    #[test]
    fn object_insert_replaces_in_place() {
        let object = Object::new();
        object.insert("a", Value::from(1));
        object.insert("b", Value::from(2));
        object.insert("a", Value::from(3));
        assert_eq!(
            object.entries(),
            vec![
                ("a".to_string(), Value::from(3)),
                ("b".to_string(), Value::from(2)),
            ]
        );
    }

    #[test]
    fn sequence_body_is_single_consumption() {
        let sequence = AsyncSequence::new(stream::iter(vec![Chunk::Return(Value::Null)]));
        assert!(sequence.reader().is_some());
        assert!(sequence.reader().is_none());
    }

    #[tokio::test]
    async fn reader_surfaces_terminal_return() {
        let sequence = AsyncSequence::new(stream::iter(vec![
            Chunk::Yield(Value::from(1)),
            Chunk::Return(Value::from("done")),
        ]));
        let mut reader = sequence.reader().unwrap();
        assert_eq!(reader.next().await, Ok(SeqStep::Item(Value::from(1))));
        assert_eq!(
            reader.next().await,
            Ok(SeqStep::Done(Value::from("done")))
        );
        assert_eq!(reader.next().await, Ok(SeqStep::Done(Value::Null)));
    }

    #[tokio::test]
    async fn promise_clones_share_one_settlement() {
        let (promise, deferred) = Promise::deferred();
        let clone = promise.clone();
        deferred.resolve(Value::from("hi"));
        assert_eq!(promise.wait().await, Ok(Value::from("hi")));
        assert_eq!(clone.wait().await, Ok(Value::from("hi")));
        assert!(promise.ptr_eq(&clone));
    }
}
