//! Single-assignment result channel between a submitter and the scheduler.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BatchError {
    #[error("batch scheduler is closed")]
    Closed,

    #[error("result dropped before it was resolved")]
    Dropped,

    #[error("batch processing failed: {0}")]
    Processor(String),

    #[error("processor returned {actual} results for {expected} items")]
    OutputMismatch { expected: usize, actual: usize },

    #[error("timed out waiting for batch result")]
    TimedOut,
}

/// Creates a linked resolver/receiver pair.
pub fn channel<T>() -> (Resolver<T>, ResultChannel<T>) {
    let (tx, rx) = oneshot::channel();
    (Resolver { tx }, ResultChannel { rx })
}

/// Write side; consumed on use so a channel is resolved at most once.
#[derive(Debug)]
pub struct Resolver<T> {
    tx: oneshot::Sender<Result<T, BatchError>>,
}

impl<T> Resolver<T> {
    /// Returns `false` when the receiver is already gone.
    pub fn resolve(self, result: Result<T, BatchError>) -> bool {
        self.tx.send(result).is_ok()
    }

    pub fn is_abandoned(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Read side. Awaiting yields the resolved value, or [`BatchError::Dropped`]
/// if the resolver went away without writing.
#[derive(Debug)]
#[must_use = "dropping a ResultChannel discards the batch outcome"]
pub struct ResultChannel<T> {
    rx: oneshot::Receiver<Result<T, BatchError>>,
}

impl<T> ResultChannel<T> {
    /// A channel that is already resolved with `err`.
    pub fn failed(err: BatchError) -> Self {
        let (resolver, channel) = channel();
        resolver.resolve(Err(err));
        channel
    }

    /// Non-blocking check; `None` while still pending.
    pub fn try_result(&mut self) -> Option<Result<T, BatchError>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(BatchError::Dropped)),
        }
    }

    pub async fn wait_timeout(self, timeout: Duration) -> Result<T, BatchError> {
        tokio::time::timeout(timeout, self)
            .await
            .unwrap_or(Err(BatchError::TimedOut))
    }
}

impl<T> Future for ResultChannel<T> {
    type Output = Result<T, BatchError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(BatchError::Dropped)))
    }
}
