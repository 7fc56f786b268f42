//! Structured-concurrency helpers for background tasks, adapted from the
//! teacher's `lexe-tokio` task-supervision idiom: named task handles and a
//! multi-consumer, observe-once shutdown signal, slimmed down to what this
//! binary's two background loops (balance polling, autonomy scheduling)
//! actually need.

use std::{borrow::Cow, future::Future, sync::Arc};

use tokio::{sync::Semaphore, task::JoinHandle};
use tracing::{error, info, Instrument};

/// A named [`tokio::task::JoinHandle`] that logs its own completion.
#[must_use]
pub struct LxTask<T> {
    name: Cow<'static, str>,
    handle: JoinHandle<T>,
}

impl<T: Send + 'static> LxTask<T> {
    pub fn spawn<F>(name: impl Into<Cow<'static, str>>, future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        let name = name.into();
        let span = tracing::Span::current();
        let handle = tokio::spawn(future.instrument(span));
        Self { name, handle }
    }

    /// Detach the task: it keeps running, but this binary no longer joins it.
    pub fn detach(self) {
        drop(self);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Await the task, logging whether it finished cleanly or panicked.
    pub async fn logged(self) {
        let name = self.name.clone();
        match self.handle.await {
            Ok(_) => info!(%name, "background task finished"),
            Err(e) => error!(%name, error = %e, "background task panicked"),
        }
    }
}

/// A shutdown signal every background task observes at-most-once per clone.
/// Built on a zero-permit [`Semaphore`]: closing it wakes every outstanding
/// and future `recv()` call, mirroring the teacher's `NotifyOnce`.
#[derive(Clone)]
pub struct NotifyOnce {
    inner: Arc<Semaphore>,
}

impl NotifyOnce {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Semaphore::new(0)),
        }
    }

    pub fn send(&self) {
        self.inner.close();
    }

    /// Waits for a signal. Returns immediately if one has already been sent.
    pub async fn recv(&self) {
        let _ = self.inner.acquire().await;
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.is_closed()
    }
}

impl Default for NotifyOnce {
    fn default() -> Self {
        Self::new()
    }
}
