//! Decoding: reconstructs the value graph from a frame stream.
//!
//! [`decode`] pulls the header frame, rebuilds the root shape with the
//! built-in asynchronous revivers, and returns it immediately; asynchronous
//! leaves are live handles over per-id controllers. There is no spawned
//! dispatcher task: whichever consumer finds its controller buffer empty
//! checks the upstream out of the shared demux state and drives it, pushing
//! each parsed chunk to its controller and moving on. Either side may be
//! first — frames can arrive before a consumer starts draining, and a
//! consumer can start draining before its first frame arrives.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use futures::stream::{BoxStream, Stream, StreamExt};
use serde_json::Value as Json;
use tracing::warn;

use crate::codec::{
    unflatten, Revivers, STATUS_RETURN, TAG_ASYNC_ITERABLE, TAG_PROMISE, TAG_READABLE_STREAM,
};
use crate::error::DecodeError;
use crate::framing;
use crate::signal::Signal;
use crate::value::{AsyncSequence, Promise, PullStream, Value};

mod controller;

use controller::{promise_ticket, ControllerChunks};

/// Options for [`decode`].
#[derive(Clone, Default)]
pub struct DecodeOptions {
    revivers: Revivers,
}

impl DecodeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_revivers(mut self, revivers: Revivers) -> Self {
        self.revivers = revivers;
        self
    }

    pub fn with_reviver<F>(mut self, name: impl Into<String>, reviver: F) -> Self
    where
        F: Fn(Value) -> Result<Value, DecodeError> + Send + Sync + 'static,
    {
        self.revivers = self.revivers.register(name, reviver);
        self
    }
}

type FrameStream = BoxStream<'static, Result<String, DecodeError>>;

/// One pending observation for a controller's consumer.
enum Entry {
    Chunk(u8, Value),
    Caught(DecodeError),
}

/// Decoder-side state for one chunk-stream id: the FIFO of not-yet-consumed
/// chunks and the consumer's wake signal.
#[derive(Default)]
struct Controller {
    buffer: VecDeque<Entry>,
    wake: Signal,
}

struct DemuxInner {
    /// `None` while a consumer has the upstream checked out for driving, or
    /// once the upstream is finished (`done` distinguishes the two).
    upstream: Option<FrameStream>,
    controllers: HashMap<u64, Controller>,
    retired: HashSet<u64>,
    failure: Option<DecodeError>,
    done: bool,
}

struct DemuxShared {
    revivers: Revivers,
    inner: Mutex<DemuxInner>,
}

/// Parse one body frame into `(id, status, payload)`.
///
/// Runs without the demux lock: unflattening the payload may revive nested
/// placeholders, and those revivers must be free to touch the shared state.
fn parse_frame(revivers: &Revivers, line: &str) -> Result<(u64, u8, Value), DecodeError> {
    let doc: Json =
        serde_json::from_str(line).map_err(|cause| DecodeError::MalformedFrame(cause.to_string()))?;
    let Json::Array(parts) = doc else {
        return Err(DecodeError::MalformedFrame(
            "body frame must be an array".to_string(),
        ));
    };
    if parts.len() != 3 {
        return Err(DecodeError::MalformedFrame(format!(
            "body frame must have three elements, found {}",
            parts.len()
        )));
    }
    let id = parts[0]
        .as_u64()
        .filter(|id| *id > 0)
        .ok_or_else(|| DecodeError::MalformedFrame("chunk-stream id must be positive".to_string()))?;
    let status = parts[1]
        .as_u64()
        .filter(|status| *status <= STATUS_RETURN as u64)
        .ok_or_else(|| DecodeError::MalformedFrame("unknown chunk status".to_string()))?
        as u8;
    let value = unflatten(&parts[2], revivers)?;
    Ok((id, status, value))
}

/// The upstream is over: record the cause (if any) and wake every consumer.
/// Controllers opened later observe `done` and synthesize the same outcome.
fn finish(inner: &mut DemuxInner, failure: Option<DecodeError>) {
    inner.done = true;
    inner.upstream = None;
    if inner.failure.is_none() {
        if let Some(ref error) = failure {
            warn!(%error, "frame stream failed");
        }
        inner.failure = failure;
    }
    for controller in inner.controllers.values_mut() {
        controller.wake.notify();
    }
}

/// The user revivers plus the three built-in asynchronous revivers. Each
/// built-in turns its id payload into a live handle over that id's
/// controller.
fn effective_revivers(user: Revivers, shared: Weak<DemuxShared>) -> Revivers {
    let on_promise = shared.clone();
    let on_sequence = shared.clone();
    let on_stream = shared;

    user.register(TAG_PROMISE, move |payload| {
        let id = stream_id(&payload)?;
        let shared = on_promise.upgrade().ok_or(DecodeError::Closed)?;
        Ok(Value::Promise(Promise::new(promise_ticket(shared, id))))
    })
    .register(TAG_ASYNC_ITERABLE, move |payload| {
        let id = stream_id(&payload)?;
        let shared = on_sequence.upgrade().ok_or(DecodeError::Closed)?;
        Ok(Value::Sequence(AsyncSequence::new(ControllerChunks::new(
            shared, id,
        ))))
    })
    .register(TAG_READABLE_STREAM, move |payload| {
        let id = stream_id(&payload)?;
        let shared = on_stream.upgrade().ok_or(DecodeError::Closed)?;
        Ok(Value::Stream(PullStream::from_sequence(AsyncSequence::new(
            ControllerChunks::new(shared, id),
        ))))
    })
}

fn stream_id(payload: &Value) -> Result<u64, DecodeError> {
    payload
        .as_int()
        .and_then(|id| u64::try_from(id).ok())
        .filter(|id| *id > 0)
        .ok_or_else(|| {
            DecodeError::BadNode("chunk-stream id must be a positive integer".to_string())
        })
}

/// Decode a stream of whole-line frames into the reconstructed root value.
///
/// Asynchronous leaves in the result are live: consuming them drives the
/// remaining frames as needed.
pub async fn decode<S>(frames: S, options: DecodeOptions) -> Result<Value, DecodeError>
where
    S: Stream<Item = Result<String, DecodeError>> + Send + 'static,
{
    let mut frames = frames.boxed();
    let header = match frames.next().await {
        Some(Ok(line)) => line,
        Some(Err(error)) => return Err(error),
        None => return Err(DecodeError::Interrupted),
    };
    let doc: Json = serde_json::from_str(&header)
        .map_err(|cause| DecodeError::MalformedFrame(cause.to_string()))?;

    let shared = Arc::new_cyclic(|weak: &Weak<DemuxShared>| DemuxShared {
        revivers: effective_revivers(options.revivers, weak.clone()),
        inner: Mutex::new(DemuxInner {
            upstream: Some(frames),
            controllers: HashMap::new(),
            retired: HashSet::new(),
            failure: None,
            done: false,
        }),
    });
    unflatten(&doc, &shared.revivers)
}

/// Like [`decode`], for a raw text transport with arbitrary chunk
/// boundaries: routes the input through the line-framing adapter first.
pub async fn decode_raw<S>(chunks: S, options: DecodeOptions) -> Result<Value, DecodeError>
where
    S: Stream<Item = Result<String, DecodeError>> + Send + 'static,
{
    decode(framing::lines(chunks), options).await
}

fn lock_inner(shared: &DemuxShared) -> std::sync::MutexGuard<'_, DemuxInner> {
    shared.inner.lock().unwrap_or_else(PoisonError::into_inner)
}
