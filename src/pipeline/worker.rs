//! Worker pool: the consumer side of C5/C6 (spec §4.3 "Worker loop"). A
//! fixed pool of tasks repeatedly claims pending queue entries — and, on a
//! slower cadence, entries that have come due for retry — runs each through
//! the pipeline, and reports the outcome back to the queue.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::errors::AppError;
use crate::fetcher::NoopProgressSink;
use crate::models::QueueEntry;
use crate::queue::DownloadQueue;

use super::Pipeline;

struct Inner {
    queue: DownloadQueue,
    pipeline: Arc<Pipeline>,
    worker_count: usize,
    poll_interval: Duration,
    retry_poll_interval: Duration,
    last_retry_poll: Mutex<Instant>,
    cancel: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<Inner>,
}

impl WorkerPool {
    pub fn new(
        queue: DownloadQueue,
        pipeline: Arc<Pipeline>,
        worker_count: usize,
        poll_interval: Duration,
        retry_poll_interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue,
                pipeline,
                worker_count: worker_count.max(1),
                poll_interval,
                retry_poll_interval,
                last_retry_poll: Mutex::new(Instant::now() - retry_poll_interval),
                cancel: CancellationToken::new(),
                handles: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Spawns `worker_count` tasks. Not idempotent by design — callers own
    /// calling this exactly once, mirroring the pool's fixed-size contract.
    pub async fn start(&self) {
        let mut handles = self.inner.handles.lock().await;
        for worker_id in 0..self.inner.worker_count {
            let inner = self.inner.clone();
            handles.push(tokio::spawn(async move { Inner::worker_loop(inner, worker_id).await }));
        }
        info!(workers = self.inner.worker_count, "worker pool started");
    }

    /// Cancels every in-flight pipeline run and waits for all workers to exit.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let handles: Vec<_> = self.inner.handles.lock().await.drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }
}

impl Inner {
    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            match self.claim_next().await {
                Ok(Some(entry)) => self.process(entry).await,
                Ok(None) => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
                Err(e) => {
                    error!(worker_id, error = %e, "worker failed to poll the download queue");
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
            }
        }
    }

    /// Pending entries are preferred; retryable entries are only checked once
    /// `retry_poll_interval` has elapsed since the last check (spec §4.3's
    /// "secondary cadence").
    async fn claim_next(&self) -> Result<Option<QueueEntry>, AppError> {
        if let Some(entry) = self.queue.next_pending().await? {
            return Ok(if self.try_claim(&entry).await? { Some(entry) } else { None });
        }

        if !self.due_for_retry_poll().await {
            return Ok(None);
        }

        for entry in self.queue.retryable().await? {
            if self.try_claim(&entry).await? {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    /// `mark_in_progress` is the CAS that actually claims the entry; a lost
    /// race (another worker got there first) surfaces as `InvalidState`,
    /// which is not an error from the pool's perspective.
    async fn try_claim(&self, entry: &QueueEntry) -> Result<bool, AppError> {
        match self.queue.mark_in_progress(entry.id).await {
            Ok(()) => Ok(true),
            Err(AppError::InvalidState { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn due_for_retry_poll(&self) -> bool {
        let mut last = self.last_retry_poll.lock().await;
        if last.elapsed() >= self.retry_poll_interval {
            *last = Instant::now();
            true
        } else {
            false
        }
    }

    async fn process(&self, entry: QueueEntry) {
        let sink = NoopProgressSink;
        match self.pipeline.run(entry.item_id, &sink, &self.cancel).await {
            Ok(()) => {
                if let Err(e) = self.queue.mark_completed(entry.id).await {
                    error!(queue_id = %entry.id, error = %e, "failed to mark queue entry completed");
                }
            }
            // Cancellation is driven by shutdown, not queue policy: leave the
            // entry's state exactly as the pipeline left it (spec §4.3).
            Err(AppError::Cancelled) => {
                warn!(queue_id = %entry.id, "pipeline run cancelled");
            }
            Err(e) => {
                if let Err(mark_err) = self.queue.mark_failed(entry.id, &e.to_string(), None).await {
                    error!(queue_id = %entry.id, error = %mark_err, "failed to record queue failure");
                }
            }
        }
    }
}
