//! Cancellable background tasks.

use std::future::Future;
use tokio::task::JoinHandle;

/// Owner of a spawned task. Dropping the handle aborts the task.
#[derive(Debug)]
pub struct TaskHandle {
    inner: Option<JoinHandle<()>>,
}

impl TaskHandle {
    /// Spawn `future` on the current runtime.
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            inner: Some(tokio::spawn(future)),
        }
    }

    /// Abort the task. Idempotent.
    ///
    /// The task never resumes after this returns, although its resources are
    /// released at its next yield point.
    pub fn cancel(&mut self) {
        if let Some(handle) = self.inner.take() {
            handle.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.is_none()
    }

    /// Whether the task has run to completion or was cancelled.
    pub fn is_finished(&self) -> bool {
        self.inner.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}
