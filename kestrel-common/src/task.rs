use std::{
    borrow::Cow,
    fmt,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use tokio::task::{JoinError, JoinHandle};
use tracing::{error, warn};

/// A named wrapper around [`tokio::task::JoinHandle`].
///
/// Naming tasks makes panics and premature exits attributable in logs.
/// Polling the handle propagates panics instead of silently dropping them.
#[must_use = "tasks are detached when their handle is dropped; \
              hold and poll the handle to observe panics"]
pub struct NamedTask<T> {
    name: Cow<'static, str>,
    handle: JoinHandle<T>,
}

impl<T: Send + 'static> NamedTask<T> {
    /// Spawns a future onto the tokio runtime with an attached name.
    pub fn spawn(
        name: impl Into<Cow<'static, str>>,
        future: impl Future<Output = T> + Send + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            handle: tokio::task::spawn(future),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Aborts the underlying task.
    pub fn abort(&self) {
        self.handle.abort();
    }

    /// Waits for the task, logging (rather than returning) any join error.
    pub async fn join_and_log(self) -> Option<T> {
        let name = self.name.clone();
        match self.await {
            Ok(value) => Some(value),
            Err(join_err) if join_err.is_cancelled() => {
                warn!("Task '{name}' was cancelled");
                None
            }
            Err(join_err) => {
                error!("Task '{name}' panicked: {join_err:#}");
                None
            }
        }
    }
}

impl<T> Future for NamedTask<T> {
    type Output = Result<T, JoinError>;

    fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Self::Output> {
        Pin::new(&mut self.handle).poll(cx)
    }
}

impl<T> fmt::Debug for NamedTask<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedTask").field("name", &self.name).finish()
    }
}
