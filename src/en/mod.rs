//! Encoding: walks a value graph through the base codec and streams the
//! asynchronous leaves behind it as body frames.
//!
//! [`encode`] yields one header frame (the flattened root) followed by body
//! frames `[id, status, payload]`, one line each. Every asynchronous value
//! discovered during flatten is assigned a fresh chunk-stream id and
//! registered as a producer with the merge engine; a chunk payload is
//! flattened under the same reducer map, so nested asynchronous values get
//! their own ids mid-stream.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use futures::stream::{self, Stream, StreamExt};
use serde_json::{json, Value as Json};
use tracing::debug;

use crate::codec::{
    flatten, Reducers, STATUS_ERROR, STATUS_FULFILLED, STATUS_REJECTED, STATUS_RETURN,
    STATUS_YIELD, TAG_ASYNC_ITERABLE, TAG_PROMISE, TAG_READABLE_STREAM,
};
use crate::error::EncodeError;
use crate::resource::Resource;
use crate::value::{Chunk, Promise, SequenceBody, Value};

mod merge;

use merge::{MergeHandle, MergeStream, Source};

pub type CoerceErrorFn = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

/// Options for [`encode`].
#[derive(Clone, Default)]
pub struct EncodeOptions {
    reducers: Reducers,
    coerce_error: Option<CoerceErrorFn>,
}

impl EncodeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reducers(mut self, reducers: Reducers) -> Self {
        self.reducers = reducers;
        self
    }

    pub fn with_reducer<F>(mut self, name: impl Into<String>, reducer: F) -> Self
    where
        F: Fn(&Value) -> Option<Value> + Send + Sync + 'static,
    {
        self.reducers = self.reducers.register(name, reducer);
        self
    }

    /// Salvage hook for thrown values the current reducers cannot encode.
    pub fn with_coerce_error<F>(mut self, coerce: F) -> Self
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        self.coerce_error = Some(Arc::new(coerce));
        self
    }
}

struct Session {
    reducers: Reducers,
    coerce_error: Option<CoerceErrorFn>,
    merge: MergeHandle,
    next_id: AtomicU64,
}

impl Session {
    fn assign_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// The user reducers plus the three built-in asynchronous reducers. Each
/// built-in claims its kind, assigns an id, registers a producer, and emits
/// the id as the placeholder payload.
fn effective_reducers(user: Reducers, session: Weak<Session>) -> Reducers {
    let on_promise = session.clone();
    let on_sequence = session.clone();
    let on_stream = session;

    user.register(TAG_PROMISE, move |value| {
        let promise = value.as_promise()?;
        let session = on_promise.upgrade()?;
        let id = session.assign_id();
        debug!(id, "promise producer registered");
        session
            .merge
            .add(promise_source(promise.clone(), id, Arc::downgrade(&session)));
        Some(Value::Int(id as i64))
    })
    .register(TAG_ASYNC_ITERABLE, move |value| {
        let sequence = value.as_sequence()?;
        let session = on_sequence.upgrade()?;
        let body = sequence.take_body()?;
        let id = session.assign_id();
        debug!(id, "sequence producer registered");
        session
            .merge
            .add(sequence_source(body, id, Arc::downgrade(&session)));
        Some(Value::Int(id as i64))
    })
    .register(TAG_READABLE_STREAM, move |value| {
        let pull_stream = value.as_stream()?;
        let session = on_stream.upgrade()?;
        let body = pull_stream.take_body()?;
        let id = session.assign_id();
        debug!(id, "pull-stream producer registered");
        session
            .merge
            .add(sequence_source(body, id, Arc::downgrade(&session)));
        Some(Value::Int(id as i64))
    })
}

fn frame_line(id: u64, status: u8, payload: Json) -> Result<String, EncodeError> {
    let mut line = serde_json::to_string(&json!([id, status, payload]))?;
    line.push('\n');
    Ok(line)
}

fn encode_chunk(
    session: &Weak<Session>,
    id: u64,
    status: u8,
    value: &Value,
) -> Result<String, EncodeError> {
    let session = session.upgrade().ok_or(EncodeError::Closed)?;
    let payload = flatten(value, &session.reducers)?;
    frame_line(id, status, payload)
}

/// Encode a thrown cause, retrying through `coerce_error` when the cause
/// itself has no wire form.
fn encode_caught(
    session: &Weak<Session>,
    id: u64,
    status: u8,
    cause: &Value,
) -> Result<String, EncodeError> {
    let session = session.upgrade().ok_or(EncodeError::Closed)?;
    match flatten(cause, &session.reducers) {
        Ok(payload) => frame_line(id, status, payload),
        Err(error) => match &session.coerce_error {
            Some(coerce) => {
                let payload = flatten(&coerce(cause), &session.reducers)?;
                frame_line(id, status, payload)
            }
            None => Err(error),
        },
    }
}

fn promise_source(promise: Promise, id: u64, session: Weak<Session>) -> Source {
    let step = stream::once(async move {
        match promise.wait().await {
            Ok(value) => encode_chunk(&session, id, STATUS_FULFILLED, &value),
            Err(cause) => encode_caught(&session, id, STATUS_REJECTED, &cause),
        }
    });
    Resource::new(step.boxed())
}

fn sequence_source(body: SequenceBody, id: u64, session: Weak<Session>) -> Source {
    let SequenceBody { chunks, close } = body;
    let frames = stream::unfold(Some(chunks), move |state| {
        let session = session.clone();
        async move {
            let mut chunks = state?;
            let (frame, rest) = match chunks.next().await {
                Some(Chunk::Yield(value)) => (
                    encode_chunk(&session, id, STATUS_YIELD, &value),
                    Some(chunks),
                ),
                Some(Chunk::Return(value)) => {
                    (encode_chunk(&session, id, STATUS_RETURN, &value), None)
                }
                Some(Chunk::Error(cause)) => {
                    (encode_caught(&session, id, STATUS_ERROR, &cause), None)
                }
                // a raw stream that ends without a terminal closes cleanly
                None => (encode_chunk(&session, id, STATUS_RETURN, &Value::Null), None),
            };
            match frame {
                Ok(line) => Some((Ok(line), rest)),
                Err(error) => Some((Err(error), None)),
            }
        }
    });
    let mut source = Resource::new(frames.boxed());
    if let Some(close) = close {
        source.on_dispose(close);
    }
    source
}

enum Phase {
    Header(Option<Value>),
    Body(MergeStream),
    Done,
}

/// The frame stream produced by [`encode`]: the header frame, then body
/// frames until every producer has reached its terminal.
pub struct EncodeStream {
    session: Arc<Session>,
    phase: Phase,
}

impl EncodeStream {
    /// Cancel the session early. Every live producer is destroyed; cleanup
    /// failures come back aggregated.
    pub async fn close(mut self) -> Result<(), EncodeError> {
        match &mut self.phase {
            Phase::Body(merge) => merge.close().await,
            _ => {
                self.phase = Phase::Done;
                Ok(())
            }
        }
    }
}

impl Stream for EncodeStream {
    type Item = Result<String, EncodeError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            match &mut this.phase {
                Phase::Header(root) => {
                    let Some(root) = root.take() else {
                        this.phase = Phase::Done;
                        continue;
                    };
                    match flatten(&root, &this.session.reducers) {
                        Ok(doc) => {
                            let mut line = doc.to_string();
                            line.push('\n');
                            this.phase = Phase::Body(this.session.merge.stream());
                            return Poll::Ready(Some(Ok(line)));
                        }
                        Err(error) => {
                            this.phase = Phase::Done;
                            return Poll::Ready(Some(Err(error)));
                        }
                    }
                }
                Phase::Body(merge) => return merge.poll_next_unpin(cx),
                Phase::Done => return Poll::Ready(None),
            }
        }
    }
}

/// Encode a value graph as a stream of newline-terminated text frames.
pub fn encode(root: Value, options: EncodeOptions) -> EncodeStream {
    let EncodeOptions {
        reducers,
        coerce_error,
    } = options;
    let session = Arc::new_cyclic(|weak: &Weak<Session>| Session {
        reducers: effective_reducers(reducers, weak.clone()),
        coerce_error,
        merge: MergeHandle::new(),
        next_id: AtomicU64::new(0),
    });
    EncodeStream {
        session,
        phase: Phase::Header(Some(root)),
    }
}
