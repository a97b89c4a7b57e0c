//! Supervised background tasks.
//!
//! Handler invocations and periodic loops are spawned detached, but every
//! failure (an `Err` or a panic) is routed to the log under the task's name
//! instead of disappearing. The group can be drained on shutdown.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::task::JoinSet;

#[derive(Debug, Default)]
pub struct TaskGroup {
    tasks: Mutex<JoinSet<()>>,
}

impl TaskGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `future` under `name`. Must be called inside a Tokio runtime.
    pub fn spawn<F>(&self, name: impl Into<String>, future: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = name.into();
        let mut tasks = self.tasks.lock();
        reap(&mut tasks);
        tasks.spawn(async move {
            supervise(name, future).await;
        });
    }

    /// Tasks spawned and not yet reaped.
    pub fn len(&self) -> usize {
        let mut tasks = self.tasks.lock();
        reap(&mut tasks);
        tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Abort everything still running and wait for it to unwind.
    pub async fn shutdown(&self) {
        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        if !tasks.is_empty() {
            tracing::debug!(count = tasks.len(), "Aborting background tasks");
        }
        tasks.shutdown().await;
    }
}

fn reap(tasks: &mut JoinSet<()>) {
    while let Some(result) = tasks.try_join_next() {
        match result {
            Err(e) if !e.is_cancelled() => {
                tracing::error!(error = %e, "Background task failed to join");
            }
            _ => {}
        }
    }
}

/// Run `future` to completion, logging an error or panic under `name`.
///
/// Returns whether the future completed successfully.
pub async fn supervise<F>(name: String, future: F) -> bool
where
    F: Future<Output = anyhow::Result<()>>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            tracing::error!(task = %name, error = ?e, "Task failed");
            false
        }
        Err(panic) => {
            tracing::error!(task = %name, panic = %panic_message(&*panic), "Task panicked");
            false
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
