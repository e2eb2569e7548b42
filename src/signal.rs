//! One-shot and rearmable wake primitives used by the merge engine and the
//! decoder's per-id controllers.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll, Waker};

use futures::future;

use crate::value::Value;

/// A one-shot resolvable completion.
///
/// `resolve` and `reject` are single-shot: the first settlement wins and
/// later calls are dropped. Settling before any observer attaches is safe;
/// the observer sees the stored result immediately.
pub struct Deferred {
    state: Arc<Mutex<DeferredState>>,
}

#[derive(Default)]
struct DeferredState {
    settled: Option<Result<Value, Value>>,
    waker: Option<Waker>,
}

impl Deferred {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(DeferredState::default())),
        }
    }

    pub fn resolve(&self, value: Value) {
        self.settle(Ok(value));
    }

    pub fn reject(&self, cause: Value) {
        self.settle(Err(cause));
    }

    fn settle(&self, result: Result<Value, Value>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.settled.is_none() {
            state.settled = Some(result);
            if let Some(waker) = state.waker.take() {
                waker.wake();
            }
        }
    }

    /// The completion side of this deferred.
    pub(crate) fn subscribe(&self) -> impl Future<Output = Result<Value, Value>> + Send {
        let state = Arc::clone(&self.state);
        future::poll_fn(move |cx| {
            let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
            match &state.settled {
                Some(result) => Poll::Ready(result.clone()),
                None => {
                    state.waker = Some(cx.waker().clone());
                    Poll::Pending
                }
            }
        })
    }
}

impl Default for Deferred {
    fn default() -> Self {
        Self::new()
    }
}

/// A rearmable wake signal.
///
/// One party calls [`Signal::notify`] when there may be new work; the single
/// waiting party either observes readiness or parks its waker. Consuming
/// readiness rearms the signal.
#[derive(Default)]
pub struct Signal {
    ready: bool,
    waker: Option<Waker>,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&mut self) {
        self.ready = true;
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
    }

    /// Park the caller until the next [`Signal::notify`].
    pub fn register(&mut self, cx: &Context<'_>) {
        self.waker = Some(cx.waker().clone());
    }

    /// Readiness check that rearms on success.
    pub fn poll_ready(&mut self, cx: &Context<'_>) -> Poll<()> {
        if self.ready {
            self.ready = false;
            Poll::Ready(())
        } else {
            self.register(cx);
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deferred_resolves_before_subscriber_attaches() {
        let deferred = Deferred::new();
        deferred.resolve(Value::from(1));
        assert_eq!(deferred.subscribe().await, Ok(Value::from(1)));
    }

    #[tokio::test]
    async fn deferred_first_settlement_wins() {
        let deferred = Deferred::new();
        deferred.reject(Value::from("boom"));
        deferred.resolve(Value::from(2));
        assert_eq!(deferred.subscribe().await, Err(Value::from("boom")));
    }

    #[tokio::test]
    async fn deferred_wakes_attached_subscriber() {
        let deferred = Deferred::new();
        let pending = deferred.subscribe();
        let handle = tokio::spawn(pending);
        deferred.resolve(Value::Null);
        assert_eq!(handle.await.unwrap(), Ok(Value::Null));
    }
}
