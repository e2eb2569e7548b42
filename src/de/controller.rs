//! Consumer surfaces over the per-id controllers.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future;
use futures::stream::{Stream, StreamExt};
use tracing::{debug, warn};

use super::{finish, lock_inner, parse_frame, DemuxInner, DemuxShared, Entry};
use crate::codec::{STATUS_ERROR, STATUS_FULFILLED, STATUS_REJECTED, STATUS_RETURN, STATUS_YIELD};
use crate::error::DecodeError;
use crate::value::{Chunk, Value};

/// The next entry for `id`: drain the controller's buffer, or check the
/// upstream out of the shared state and drive it until something lands
/// there. Creates the controller on first reference.
///
/// The upstream only remembers the waker of whichever consumer drove it
/// last, so a consumer taking an entry wakes the other waiters; one of them
/// re-registers and becomes the new driver.
fn poll_entry(shared: &Arc<DemuxShared>, id: u64, cx: &mut Context<'_>) -> Poll<Entry> {
    'demux: loop {
        let mut upstream = {
            let mut inner = lock_inner(shared);
            if let Some(entry) = inner.controllers.entry(id).or_default().buffer.pop_front() {
                wake_all_except(&mut inner, id);
                return Poll::Ready(entry);
            }
            if inner.done {
                let failure = inner.failure.clone().unwrap_or(DecodeError::Interrupted);
                return Poll::Ready(Entry::Caught(failure));
            }
            inner.controllers.entry(id).or_default().wake.register(cx);
            match inner.upstream.take() {
                Some(upstream) => upstream,
                // another consumer is mid-drive; it pushes to our
                // controller or hands the upstream back before parking
                None => return Poll::Pending,
            }
        };

        // the demux lock is released while polling the transport and
        // parsing frames: reviving a nested placeholder (and dropping a
        // discarded payload) must be free to take it again
        loop {
            match upstream.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(line))) => match parse_frame(&shared.revivers, &line) {
                    Ok((frame_id, status, value)) => {
                        let mut inner = lock_inner(shared);
                        let discarded = if inner.retired.contains(&frame_id) {
                            warn!(frame_id, "discarding frame for retired stream");
                            Some(value)
                        } else {
                            debug!(frame_id, status, "frame dispatched");
                            let controller = inner.controllers.entry(frame_id).or_default();
                            controller.buffer.push_back(Entry::Chunk(status, value));
                            controller.wake.notify();
                            None
                        };
                        if frame_id == id {
                            inner.upstream = Some(upstream);
                            drop(inner);
                            drop(discarded);
                            continue 'demux;
                        }
                        drop(inner);
                        drop(discarded);
                    }
                    Err(error) => {
                        finish(&mut lock_inner(shared), Some(error));
                        continue 'demux;
                    }
                },
                Poll::Ready(Some(Err(error))) => {
                    finish(&mut lock_inner(shared), Some(error));
                    continue 'demux;
                }
                Poll::Ready(None) => {
                    finish(&mut lock_inner(shared), None);
                    continue 'demux;
                }
                Poll::Pending => {
                    lock_inner(shared).upstream = Some(upstream);
                    return Poll::Pending;
                }
            }
        }
    }
}

fn wake_all_except(inner: &mut DemuxInner, id: u64) {
    for (other, controller) in inner.controllers.iter_mut() {
        if *other != id {
            controller.wake.notify();
        }
    }
}

/// Remove the controller and remember the id so late frames are discarded
/// instead of resurrecting it. Remaining waiters are woken so one of them
/// takes over driving.
fn retire(shared: &DemuxShared, id: u64) {
    let mut inner = lock_inner(shared);
    inner.controllers.remove(&id);
    inner.retired.insert(id);
    for controller in inner.controllers.values_mut() {
        controller.wake.notify();
    }
    debug!(id, "controller retired");
}

/// Resolution of a revived promise: exactly one chunk, fulfilled or
/// rejected. Transport failures surface as an opaque [`DecodeError`] cause.
pub(super) async fn promise_ticket(shared: Arc<DemuxShared>, id: u64) -> Result<Value, Value> {
    let entry = future::poll_fn(|cx| poll_entry(&shared, id, cx)).await;
    retire(&shared, id);
    match entry {
        Entry::Chunk(STATUS_FULFILLED, value) => Ok(value),
        Entry::Chunk(STATUS_REJECTED, cause) => Err(cause),
        Entry::Chunk(status, _) => Err(Value::opaque(DecodeError::MalformedFrame(format!(
            "unexpected status {status} for promise stream {id}"
        )))),
        Entry::Caught(error) => Err(Value::opaque(error)),
    }
}

/// The chunk stream backing a revived sequence or pull-stream: one
/// [`Chunk`] per entry, ending after the terminal. Termination — including
/// being dropped mid-stream — retires the controller; frames still in
/// flight for the id are then discarded on arrival.
pub(super) struct ControllerChunks {
    shared: Arc<DemuxShared>,
    id: u64,
    done: bool,
}

impl ControllerChunks {
    pub(super) fn new(shared: Arc<DemuxShared>, id: u64) -> Self {
        Self {
            shared,
            id,
            done: false,
        }
    }

    fn finish(&mut self) {
        if !self.done {
            self.done = true;
            retire(&self.shared, self.id);
        }
    }
}

impl Stream for ControllerChunks {
    type Item = Chunk;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        let entry = match poll_entry(&this.shared, this.id, cx) {
            Poll::Ready(entry) => entry,
            Poll::Pending => return Poll::Pending,
        };
        let chunk = match entry {
            Entry::Chunk(STATUS_YIELD, value) => Chunk::Yield(value),
            Entry::Chunk(STATUS_RETURN, value) => {
                this.finish();
                Chunk::Return(value)
            }
            Entry::Chunk(STATUS_ERROR, cause) => {
                this.finish();
                Chunk::Error(cause)
            }
            Entry::Chunk(status, _) => {
                this.finish();
                Chunk::Error(Value::opaque(DecodeError::MalformedFrame(format!(
                    "unexpected status {status} for stream {}",
                    this.id
                ))))
            }
            Entry::Caught(error) => {
                this.finish();
                Chunk::Error(Value::opaque(error))
            }
        };
        Poll::Ready(Some(chunk))
    }
}

impl Drop for ControllerChunks {
    fn drop(&mut self) {
        self.finish();
    }
}
