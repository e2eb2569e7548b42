//! Scoped cleanup for asynchronous resources.

use futures::future::BoxFuture;

use crate::error::{CompositeError, EncodeError};

/// An asynchronous cleanup step.
pub type Disposer = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), EncodeError>> + Send>;

/// A value with attached asynchronous cleanup.
///
/// Disposers compose: a step attached later runs before the ones already
/// present. [`Resource::dispose`] releases the value, runs every step, and
/// aggregates failures so none is lost.
pub struct Resource<T> {
    value: T,
    disposers: Vec<Disposer>,
}

impl<T> Resource<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            disposers: Vec::new(),
        }
    }

    pub fn on_dispose(&mut self, disposer: Disposer) {
        self.disposers.insert(0, disposer);
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.value
    }

    /// Release the value, then run every cleanup step in order.
    pub async fn dispose(self) -> Result<(), CompositeError> {
        let Self { value, disposers } = self;
        drop(value);
        let mut errors = Vec::new();
        for disposer in disposers {
            if let Err(error) = disposer().await {
                errors.push(error);
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(CompositeError::new(errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use futures::future::FutureExt;

    use super::*;

    #[tokio::test]
    async fn disposers_run_newest_first() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut resource = Resource::new(());
        for tag in ["first", "second"] {
            let order = Arc::clone(&order);
            resource.on_dispose(Box::new(move || {
                async move {
                    order.lock().unwrap().push(tag);
                    Ok(())
                }
                .boxed()
            }));
        }
        resource.dispose().await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["second", "first"]);
    }

    #[tokio::test]
    async fn dispose_aggregates_every_failure() {
        let ran = Arc::new(AtomicUsize::new(0));
        let mut resource = Resource::new(());
        for _ in 0..2 {
            let ran = Arc::clone(&ran);
            resource.on_dispose(Box::new(move || {
                async move {
                    ran.fetch_add(1, Ordering::SeqCst);
                    Err(EncodeError::Closed)
                }
                .boxed()
            }));
        }
        let composite = resource.dispose().await.unwrap_err();
        assert_eq!(composite.errors().len(), 2);
        assert_eq!(ran.load(Ordering::SeqCst), 2);
    }
}
