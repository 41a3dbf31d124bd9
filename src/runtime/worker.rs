use crate::{Error, ErrorContext, Result};
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::thread::{JoinHandle, ThreadId};
use std::time::Duration;
use tokio::runtime::{Builder, Handle};
use tokio::sync::oneshot;
use tokio_util::task::TaskTracker;

/// A named OS thread driving a current-thread tokio runtime.
pub struct BackgroundWorker {
    name: String,
    thread_id: ThreadId,
    handle: Handle,
    tracker: TaskTracker,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl BackgroundWorker {
    pub fn start(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let runtime = Builder::new_current_thread().enable_all().build()?;
        let handle = runtime.handle().clone();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let thread_name = name.clone();
        let thread = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                runtime.block_on(async {
                    let _ = shutdown_rx.await;
                });
                tracing::debug!(worker = %thread_name, "background worker stopped");
                // Dropping the runtime cancels whatever is still scheduled.
            })?;

        tracing::debug!(worker = %name, "background worker started");
        Ok(Self {
            name,
            thread_id: thread.thread().id(),
            handle,
            tracker: TaskTracker::new(),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Run `future` detached; its outcome is logged, never returned.
    pub fn spawn<F>(&self, task: &str, future: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let task = task.to_string();
        let worker = self.name.clone();
        self.tracker.spawn_on(
            async move {
                match future.await {
                    Ok(()) => tracing::debug!(worker = %worker, task = %task, "completed task"),
                    Err(e) => tracing::info!(
                        worker = %worker,
                        task = %task,
                        error = %e,
                        "exception observed on task"
                    ),
                }
            },
            &self.handle,
        );
    }

    /// Block the calling thread until `future` completes on the worker.
    /// Must not be called from the worker thread itself.
    pub fn run_blocking<F>(&self, future: F) -> Result<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if std::thread::current().id() == self.thread_id {
            return Err(Error::runtime_with_context(
                "run_blocking called from the worker thread",
                ErrorContext::new().with_source("background_worker"),
            ));
        }
        if !self.is_running() {
            return Err(Error::runtime_with_context(
                "background worker is not running",
                ErrorContext::new().with_source("background_worker"),
            ));
        }
        let join = self.handle.spawn(future);
        futures::executor::block_on(join).map_err(|e| {
            Error::runtime_with_context(
                "background task failed",
                ErrorContext::new()
                    .with_details(e.to_string())
                    .with_source("background_worker"),
            )
        })
    }

    pub fn is_running(&self) -> bool {
        self.thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    /// Wait up to `timeout` for spawned tasks, then stop the thread.
    /// Returns `false` when tasks were still running at the deadline.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        self.tracker.close();
        let tracker = self.tracker.clone();
        let drained = self
            .run_blocking(async move { tokio::time::timeout(timeout, tracker.wait()).await.is_ok() })
            .unwrap_or(false);
        if !drained {
            tracing::warn!(
                worker = %self.name,
                pending = self.tracker.len(),
                "background worker shut down with pending tasks, some events might be lost"
            );
        }

        if let Some(tx) = self
            .shutdown_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = tx.send(());
        }
        let thread = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(thread) = thread {
            if thread.join().is_err() {
                tracing::warn!(worker = %self.name, "background worker thread panicked");
            }
        }
        drained
    }
}

impl Drop for BackgroundWorker {
    fn drop(&mut self) {
        if let Some(tx) = self
            .shutdown_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = tx.send(());
        }
    }
}
