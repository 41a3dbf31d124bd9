//! Batch scheduler: flush timing, bounded dispatch concurrency and draining.

use super::buffer::{BatchBuffer, BatchItem};
use super::channel::{channel, BatchError, Resolver, ResultChannel};
use crate::config::BatchSettings;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Processes one flushed cohort. On success the output must line up with
/// the input, one result per item.
#[async_trait]
pub trait BatchProcessor: Send + Sync + 'static {
    type Item: Send + 'static;
    type Output: Send + 'static;

    async fn process_batch(&self, items: Vec<Self::Item>) -> Result<Vec<Self::Output>, BatchError>;
}

/// How a [`BatchScheduler::stop`] call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Every submitted item reached the processor and its cohort finished.
    Drained,
    /// The deadline passed with cohorts still in flight; their channels may
    /// never resolve.
    TimedOut { in_flight: usize },
}

impl StopOutcome {
    pub fn is_drained(&self) -> bool {
        matches!(self, StopOutcome::Drained)
    }
}

struct Pending<I, O> {
    item: I,
    resolver: Resolver<O>,
}

struct State<I, O> {
    buffer: BatchBuffer<Pending<I, O>>,
    closed: bool,
}

type Cohort<I, O> = Vec<BatchItem<Pending<I, O>>>;

struct Shared<P: BatchProcessor> {
    state: Mutex<State<P::Item, P::Output>>,
    processor: Arc<P>,
    notify: Notify,
    flush_requested: AtomicBool,
    cancel: CancellationToken,
    tracker: TaskTracker,
    permits: Arc<Semaphore>,
    runtime: Handle,
}

impl<P: BatchProcessor> Shared<P> {
    fn lock(&self) -> MutexGuard<'_, State<P::Item, P::Output>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dispatch(self: &Arc<Self>, cohort: Cohort<P::Item, P::Output>) {
        let processor = Arc::clone(&self.processor);
        let permits = Arc::clone(&self.permits);
        self.tracker.spawn_on(
            async move {
                // Fair semaphore: cohorts beyond the ceiling wait in FIFO order.
                let _permit = permits.acquire_owned().await.ok();
                run_cohort(processor.as_ref(), cohort).await;
            },
            &self.runtime,
        );
    }
}

async fn run_cohort<P: BatchProcessor>(processor: &P, cohort: Cohort<P::Item, P::Output>) {
    let (items, resolvers): (Vec<_>, Vec<_>) = cohort
        .into_iter()
        .map(|entry| (entry.data.item, entry.data.resolver))
        .unzip();
    let expected = items.len();

    match processor.process_batch(items).await {
        Ok(outputs) if outputs.len() == expected => {
            for (resolver, output) in resolvers.into_iter().zip(outputs) {
                resolver.resolve(Ok(output));
            }
        }
        Ok(outputs) => {
            let err = BatchError::OutputMismatch {
                expected,
                actual: outputs.len(),
            };
            tracing::warn!(error = %err, "batch processor output mismatch");
            for resolver in resolvers {
                resolver.resolve(Err(err.clone()));
            }
        }
        Err(err) => {
            for resolver in resolvers {
                resolver.resolve(Err(err.clone()));
            }
        }
    }
}

/// Accumulates submitted items and hands them to a [`BatchProcessor`] when
/// either `batch_size` items are pending or the oldest has waited
/// `queue_time`. At most `concurrency` cohorts run at once.
pub struct BatchScheduler<P: BatchProcessor> {
    shared: Arc<Shared<P>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    settings: BatchSettings,
}

impl<P: BatchProcessor> BatchScheduler<P> {
    /// Spawns the flush loop on `runtime`.
    pub fn start(processor: P, settings: BatchSettings, runtime: &Handle) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                buffer: BatchBuffer::new(settings.batch_size, settings.queue_time),
                closed: false,
            }),
            processor: Arc::new(processor),
            notify: Notify::new(),
            flush_requested: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            permits: Arc::new(Semaphore::new(settings.concurrency.max(1))),
            runtime: runtime.clone(),
        });
        let worker = runtime.spawn(flush_loop(Arc::clone(&shared)));
        tracing::debug!(
            batch_size = settings.batch_size,
            queue_time_ms = settings.queue_time.as_millis() as u64,
            concurrency = settings.concurrency,
            "batch scheduler started"
        );
        Self {
            shared,
            worker: Mutex::new(Some(worker)),
            settings,
        }
    }

    /// Enqueue without waiting. After [`stop`](Self::stop) the returned
    /// channel is already failed with [`BatchError::Closed`].
    pub fn submit(&self, item: P::Item) -> ResultChannel<P::Output> {
        let (resolver, rx) = channel();
        let added = {
            let mut state = self.shared.lock();
            if state.closed {
                drop(state);
                resolver.resolve(Err(BatchError::Closed));
                return rx;
            }
            state.buffer.push(Pending { item, resolver })
        };
        // First item arms the timer; a full buffer needs an immediate flush.
        if added.count() == 1 || added.should_flush() {
            self.shared.notify.notify_one();
        }
        rx
    }

    /// Flush whatever is pending without waiting for a trigger.
    pub fn flush_now(&self) {
        self.shared.flush_requested.store(true, Ordering::Release);
        self.shared.notify.notify_one();
    }

    pub fn pending(&self) -> usize {
        self.shared.lock().buffer.len()
    }

    pub fn settings(&self) -> BatchSettings {
        self.settings
    }

    pub fn is_running(&self) -> bool {
        if self.shared.lock().closed {
            return false;
        }
        self.worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|w| !w.is_finished())
    }

    /// Stop accepting work, dispatch everything still buffered and wait up
    /// to `timeout` for in-flight cohorts.
    pub async fn stop(&self, timeout: Duration) -> StopOutcome {
        let remaining = {
            let mut state = self.shared.lock();
            state.closed = true;
            state.buffer.drain_cohorts()
        };
        self.shared.cancel.cancel();

        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            // Exits at its next wake-up; any cohort it took is already tracked.
            if let Err(e) = worker.await {
                tracing::warn!(error = %e, "batch flush loop ended abnormally");
            }
        }

        let drained: usize = remaining.iter().map(Vec::len).sum();
        for cohort in remaining {
            self.shared.dispatch(cohort);
        }
        self.shared.tracker.close();

        match tokio::time::timeout(timeout, self.shared.tracker.wait()).await {
            Ok(()) => {
                tracing::debug!(drained, "batch scheduler stopped");
                StopOutcome::Drained
            }
            Err(_) => {
                let in_flight = self.shared.tracker.len();
                tracing::warn!(
                    in_flight,
                    "batch scheduler stop timed out, some batches might be lost"
                );
                StopOutcome::TimedOut { in_flight }
            }
        }
    }
}

impl<P: BatchProcessor> Drop for BatchScheduler<P> {
    fn drop(&mut self) {
        // Cohorts already dispatched keep running on the tracker; only what
        // is still buffered is discarded.
        let discarded = {
            let mut state = self.shared.lock();
            let live = !state.closed;
            state.closed = true;
            if live {
                state.buffer.drain_cohorts()
            } else {
                Vec::new()
            }
        };
        self.shared.cancel.cancel();

        let pending: usize = discarded.iter().map(Vec::len).sum();
        if pending > 0 {
            tracing::warn!(
                pending,
                "batch scheduler dropped without stop, some batches might be lost"
            );
        }
        for entry in discarded.into_iter().flatten() {
            entry.data.resolver.resolve(Err(BatchError::Dropped));
        }
    }
}

async fn flush_loop<P: BatchProcessor>(shared: Arc<Shared<P>>) {
    loop {
        let forced = shared.flush_requested.swap(false, Ordering::AcqRel);
        let deadline = loop {
            let cohort = {
                let mut state = shared.lock();
                if state.buffer.is_empty() {
                    break None;
                }
                if !(forced || state.buffer.is_due(Instant::now())) {
                    break state.buffer.deadline();
                }
                state.buffer.take_cohort()
            };
            tracing::trace!(size = cohort.len(), forced, "flushing cohort");
            shared.dispatch(cohort);
        };

        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = shared.notify.notified() => {}
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {}
        }
    }
}
