//! The merge engine: multiplexes an open-ended collection of asynchronous
//! producers into one ordered sequence of body frames.
//!
//! Sources can be added at any time, including while iteration is running
//! (a producer that discovers a nested asynchronous value registers it
//! mid-stream). Each source is wrapped in a managed iterator that keeps at
//! most one step in flight; per-source ordering is therefore preserved,
//! while cross-source interleaving follows completion order.
//!
//! On every exit from the consumer, all still-live iterators are destroyed
//! concurrently and their cleanup failures are aggregated.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::collections::VecDeque;

use futures::future::{self, BoxFuture, FutureExt};
use futures::stream::{BoxStream, Stream, StreamExt};
use tracing::debug;

use crate::error::{CompositeError, EncodeError};
use crate::resource::Resource;
use crate::signal::Signal;

pub(crate) type SourceStream = BoxStream<'static, Result<String, EncodeError>>;

/// A producer's frame stream plus its cancellation hooks.
pub(crate) type Source = Resource<SourceStream>;

enum IterState {
    Idle,
    Pending,
    Done,
}

/// Pull-driven wrapper around one source: at most one step in flight, one
/// observation per pull, idempotent destruction.
struct ManagedIterator {
    body: Option<Source>,
    state: IterState,
}

impl ManagedIterator {
    fn started(body: Source) -> Self {
        Self {
            body: Some(body),
            state: IterState::Pending,
        }
    }

    fn pull(&mut self) {
        if matches!(self.state, IterState::Idle) {
            self.state = IterState::Pending;
        }
    }

    /// `Some(Ok)` is a yield, `Some(Err)` a terminal error, `None` a
    /// terminal return.
    fn poll_step(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<String, EncodeError>>> {
        if !matches!(self.state, IterState::Pending) {
            return Poll::Pending;
        }
        let Some(body) = self.body.as_mut() else {
            self.state = IterState::Done;
            return Poll::Ready(None);
        };
        match body.get_mut().poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                self.state = IterState::Idle;
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(error))) => {
                self.state = IterState::Done;
                Poll::Ready(Some(Err(error)))
            }
            Poll::Ready(None) => {
                self.state = IterState::Done;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn destroy(&mut self) -> Option<BoxFuture<'static, Result<(), CompositeError>>> {
        self.state = IterState::Done;
        self.body.take().map(|body| body.dispose().boxed())
    }
}

/// State shared with [`MergeHandle`]s. Only the intake queue lives here, so
/// a producer may register a nested source from inside its own step without
/// deadlocking against the consumer.
struct SharedState {
    queued: Vec<Source>,
    closed: bool,
    taken: bool,
    flush: Signal,
}

enum Event {
    Item { slot: usize, frame: String },
    Error(EncodeError),
}

/// Registration handle: sources may be added before or during iteration.
#[derive(Clone)]
pub(crate) struct MergeHandle {
    shared: Arc<Mutex<SharedState>>,
}

impl MergeHandle {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(SharedState {
                queued: Vec::new(),
                closed: false,
                taken: false,
                flush: Signal::new(),
            })),
        }
    }

    pub fn add(&self, source: Source) {
        let mut shared = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
        if shared.closed {
            // the session is over; dropping the body cancels cooperatively
            return;
        }
        shared.queued.push(source);
        shared.flush.notify();
    }

    /// The single-consumer view over all sources.
    ///
    /// # Panics
    ///
    /// A second call is a programmer error and panics.
    pub fn stream(&self) -> MergeStream {
        let mut shared = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
        if shared.taken {
            panic!("merge engine consumed twice");
        }
        shared.taken = true;
        MergeStream {
            shared: Arc::clone(&self.shared),
            live: Vec::new(),
            live_count: 0,
            buffer: VecDeque::new(),
            finishing: Vec::new(),
            closing: None,
            finished: false,
        }
    }
}

struct Closing {
    terminal: Option<EncodeError>,
    cleanup: BoxFuture<'static, Vec<EncodeError>>,
}

/// The consumer view. Ends after the last source's terminal, or with a
/// single error once cleanup has run.
pub(crate) struct MergeStream {
    shared: Arc<Mutex<SharedState>>,
    live: Vec<Option<ManagedIterator>>,
    live_count: usize,
    buffer: VecDeque<Event>,
    finishing: Vec<BoxFuture<'static, Result<(), CompositeError>>>,
    closing: Option<Closing>,
    finished: bool,
}

impl MergeStream {
    fn intake(&mut self, cx: &mut Context<'_>) {
        let sources: Vec<Source> = {
            let mut shared = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
            shared.flush.register(cx);
            std::mem::take(&mut shared.queued)
        };
        for source in sources {
            let slot = self.live.len();
            self.live.push(Some(ManagedIterator::started(source)));
            self.live_count += 1;
            debug!(slot, "merge source started");
        }
    }

    fn poll_children(&mut self, cx: &mut Context<'_>) {
        for slot in 0..self.live.len() {
            let step = match self.live[slot].as_mut() {
                Some(iterator) => iterator.poll_step(cx),
                None => continue,
            };
            match step {
                Poll::Ready(Some(Ok(frame))) => self.buffer.push_back(Event::Item { slot, frame }),
                Poll::Ready(Some(Err(error))) => {
                    self.buffer.push_back(Event::Error(error));
                    self.retire(slot);
                }
                Poll::Ready(None) => self.retire(slot),
                Poll::Pending => {}
            }
        }

        // drive disposal of naturally finished iterators
        let mut index = 0;
        while index < self.finishing.len() {
            match self.finishing[index].as_mut().poll(cx) {
                Poll::Ready(Ok(())) => {
                    self.finishing.swap_remove(index);
                }
                Poll::Ready(Err(composite)) => {
                    self.finishing.swap_remove(index);
                    self.buffer
                        .push_back(Event::Error(EncodeError::Cleanup(composite)));
                }
                Poll::Pending => index += 1,
            }
        }
    }

    fn repull(&mut self, slot: usize, cx: &mut Context<'_>) {
        let step = match self.live.get_mut(slot).and_then(Option::as_mut) {
            Some(iterator) => {
                iterator.pull();
                iterator.poll_step(cx)
            }
            None => return,
        };
        match step {
            Poll::Ready(Some(Ok(frame))) => self.buffer.push_back(Event::Item { slot, frame }),
            Poll::Ready(Some(Err(error))) => {
                self.buffer.push_back(Event::Error(error));
                self.retire(slot);
            }
            Poll::Ready(None) => self.retire(slot),
            Poll::Pending => {}
        }
    }

    fn retire(&mut self, slot: usize) {
        if let Some(mut iterator) = self.live[slot].take() {
            self.live_count -= 1;
            if let Some(disposal) = iterator.destroy() {
                self.finishing.push(disposal);
            }
        }
    }

    fn destroy_all(&mut self) -> Vec<BoxFuture<'static, Result<(), CompositeError>>> {
        let mut disposals: Vec<_> = self.finishing.drain(..).collect();
        {
            let mut shared = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
            shared.closed = true;
            for source in shared.queued.drain(..) {
                disposals.push(source.dispose().boxed());
            }
        }
        for slot in 0..self.live.len() {
            if let Some(mut iterator) = self.live[slot].take() {
                self.live_count -= 1;
                if let Some(disposal) = iterator.destroy() {
                    disposals.push(disposal);
                }
            }
        }
        self.buffer.clear();
        disposals
    }

    /// Cancel iteration: destroy every live iterator and surface their
    /// aggregated cleanup failures to the caller. A terminal error already
    /// waiting on its cleanup is surfaced too, never dropped.
    pub async fn close(&mut self) -> Result<(), EncodeError> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        let mut terminal = None;
        let mut errors = Vec::new();
        if let Some(mut closing) = self.closing.take() {
            terminal = closing.terminal.take();
            errors.extend(closing.cleanup.await);
        }
        let disposals = self.destroy_all();
        errors.extend(collect_cleanup(disposals).await);
        match fold_errors(terminal, errors) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl Stream for MergeStream {
    type Item = Result<String, EncodeError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if this.finished {
                return Poll::Ready(None);
            }
            if let Some(closing) = this.closing.as_mut() {
                let cleanup_errors = match closing.cleanup.as_mut().poll(cx) {
                    Poll::Ready(errors) => errors,
                    Poll::Pending => return Poll::Pending,
                };
                let terminal = closing.terminal.take();
                this.closing = None;
                this.finished = true;
                return match fold_errors(terminal, cleanup_errors) {
                    Some(error) => Poll::Ready(Some(Err(error))),
                    None => Poll::Ready(None),
                };
            }

            this.intake(cx);
            this.poll_children(cx);

            match this.buffer.pop_front() {
                Some(Event::Item { slot, frame }) => {
                    this.repull(slot, cx);
                    return Poll::Ready(Some(Ok(frame)));
                }
                Some(Event::Error(error)) => {
                    let disposals = this.destroy_all();
                    this.closing = Some(Closing {
                        terminal: Some(error),
                        cleanup: collect_cleanup(disposals).boxed(),
                    });
                }
                None => {
                    // a child's final step may have queued a nested source
                    let queue_empty = {
                        let shared = this.shared.lock().unwrap_or_else(PoisonError::into_inner);
                        shared.queued.is_empty()
                    };
                    if !queue_empty {
                        continue;
                    }
                    if this.live_count == 0 && this.finishing.is_empty() {
                        this.finished = true;
                        return Poll::Ready(None);
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}

impl Drop for MergeStream {
    fn drop(&mut self) {
        // Cannot await here: dropping the disposal futures drops every
        // source body, which is the cooperative cancellation path. Close
        // hooks only run through the async close().
        let _ = self.destroy_all();
    }
}

async fn collect_cleanup(
    disposals: Vec<BoxFuture<'static, Result<(), CompositeError>>>,
) -> Vec<EncodeError> {
    let mut errors = Vec::new();
    for result in future::join_all(disposals).await {
        if let Err(composite) = result {
            errors.extend(composite.into_errors());
        }
    }
    errors
}

fn fold_errors(terminal: Option<EncodeError>, cleanup: Vec<EncodeError>) -> Option<EncodeError> {
    if cleanup.is_empty() {
        return terminal;
    }
    let mut all = Vec::with_capacity(cleanup.len() + 1);
    all.extend(terminal);
    all.extend(cleanup);
    Some(EncodeError::Cleanup(CompositeError::new(all)))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::stream;

    use super::*;

    fn source_of(frames: Vec<&str>) -> Source {
        let frames: Vec<Result<String, EncodeError>> =
            frames.into_iter().map(|f| Ok(f.to_string())).collect();
        Resource::new(stream::iter(frames).boxed())
    }

    fn pending_source() -> Source {
        Resource::new(stream::pending::<Result<String, EncodeError>>().boxed())
    }

    #[tokio::test]
    async fn preserves_per_source_order() {
        let merge = MergeHandle::new();
        merge.add(source_of(vec!["a1", "a2", "a3"]));
        merge.add(source_of(vec!["b1", "b2"]));
        let frames: Vec<String> = merge
            .stream()
            .map(|frame| frame.unwrap())
            .collect::<Vec<_>>()
            .await;

        let a: Vec<&String> = frames.iter().filter(|f| f.starts_with('a')).collect();
        let b: Vec<&String> = frames.iter().filter(|f| f.starts_with('b')).collect();
        assert_eq!(a, ["a1", "a2", "a3"]);
        assert_eq!(b, ["b1", "b2"]);
        assert_eq!(frames.len(), 5);
    }

    #[tokio::test]
    async fn empty_merge_completes() {
        let merge = MergeHandle::new();
        let frames: Vec<_> = merge.stream().collect().await;
        assert!(frames.is_empty());
    }

    #[tokio::test]
    async fn source_error_terminates_after_cleanup() {
        let cancelled = Arc::new(AtomicUsize::new(0));
        let merge = MergeHandle::new();
        merge.add(Resource::new(
            stream::iter(vec![Err(EncodeError::Unsupported("opaque value"))]).boxed(),
        ));
        let mut still_live = pending_source();
        {
            let cancelled = Arc::clone(&cancelled);
            still_live.on_dispose(Box::new(move || {
                async move {
                    cancelled.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
                .boxed()
            }));
        }
        merge.add(still_live);

        let results: Vec<_> = merge.stream().collect().await;
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(EncodeError::Unsupported(_))));
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_cancels_every_source_once() {
        let cancelled = Arc::new(AtomicUsize::new(0));
        let merge = MergeHandle::new();
        for _ in 0..3 {
            let mut source = pending_source();
            let cancelled = Arc::clone(&cancelled);
            source.on_dispose(Box::new(move || {
                async move {
                    cancelled.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
                .boxed()
            }));
            merge.add(source);
        }

        let mut stream = merge.stream();
        stream.close().await.unwrap();
        assert_eq!(cancelled.load(Ordering::SeqCst), 3);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn close_aggregates_cleanup_failures() {
        let merge = MergeHandle::new();
        for _ in 0..2 {
            let mut source = pending_source();
            source.on_dispose(Box::new(|| async { Err(EncodeError::Closed) }.boxed()));
            merge.add(source);
        }
        let mut stream = merge.stream();
        match stream.close().await {
            Err(EncodeError::Cleanup(composite)) => assert_eq!(composite.errors().len(), 2),
            other => panic!("expected composite cleanup error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_mid_shutdown_preserves_the_terminal_error() {
        let merge = MergeHandle::new();
        merge.add(Resource::new(
            stream::iter(vec![Err(EncodeError::Unsupported("opaque value"))]).boxed(),
        ));
        let mut slow = pending_source();
        slow.on_dispose(Box::new(|| {
            let mut polled = false;
            future::poll_fn(move |cx| {
                if polled {
                    Poll::Ready(Ok(()))
                } else {
                    polled = true;
                    cx.waker().wake_by_ref();
                    Poll::Pending
                }
            })
            .boxed()
        }));
        merge.add(slow);

        let mut stream = merge.stream();
        // the producer's error is buffered, but shutdown parks on the slow
        // disposal, so the stream is mid-closing when close() arrives
        assert!(futures::poll!(stream.next()).is_pending());
        match stream.close().await {
            Err(EncodeError::Unsupported(_)) => {}
            other => panic!("expected the producer's terminal error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn add_during_iteration_is_picked_up() {
        let merge = MergeHandle::new();
        let late = merge.clone();
        merge.add(Resource::new(
            stream::once(async move {
                late.add(source_of(vec!["nested"]));
                Ok("outer".to_string())
            })
            .boxed(),
        ));
        let frames: Vec<String> = merge
            .stream()
            .map(|frame| frame.unwrap())
            .collect::<Vec<_>>()
            .await;
        assert_eq!(frames, ["outer", "nested"]);
    }

    #[test]
    #[should_panic(expected = "merge engine consumed twice")]
    fn second_consumer_is_fatal() {
        let merge = MergeHandle::new();
        let _first = merge.stream();
        let _second = merge.stream();
    }
}
