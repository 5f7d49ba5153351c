//! Refresh scheduler (C7): a single, non-overlapping ticker that fans out
//! across enabled channels, diffs discovered items against persistence, and
//! enqueues new ones. One `tokio::select!` loop owns the cadence; there is no
//! per-channel cron (spec §4.4).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::database::Database;
use crate::errors::{AppError, ChannelFailure};
use crate::fetcher::Fetcher;
use crate::models::{DiscoveredItem, DEFAULT_PRIORITY};
use crate::queue::DownloadQueue;

struct Inner {
    db: Database,
    fetcher: Arc<dyn Fetcher>,
    queue: DownloadQueue,
    interval: Duration,
    run_immediately: bool,
    started: AtomicBool,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct RefreshScheduler {
    inner: Arc<Inner>,
}

impl RefreshScheduler {
    pub fn new(
        db: Database,
        fetcher: Arc<dyn Fetcher>,
        queue: DownloadQueue,
        interval: Duration,
        run_immediately: bool,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                db,
                fetcher,
                queue,
                interval,
                run_immediately,
                started: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                handle: Mutex::new(None),
            }),
        }
    }

    /// Idempotent: a second call while already running is a no-op (spec §4.4).
    pub async fn start(&self) -> bool {
        if self
            .inner
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        let scheduler = self.clone();
        let handle = tokio::spawn(async move { scheduler.run_loop().await });
        *self.inner.handle.lock().await = Some(handle);
        true
    }

    /// Cancels the loop and waits for any in-flight tick to finish before
    /// returning (spec §4.4: "shutdown waits for the in-flight tick").
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        if let Some(handle) = self.inner.handle.lock().await.take() {
            let _ = handle.await;
        }
        self.inner.started.store(false, Ordering::SeqCst);
    }

    async fn run_loop(&self) {
        if self.inner.run_immediately {
            self.tick().await;
        }
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.inner.interval) => {
                    self.tick().await;
                }
            }
        }
    }

    /// One full fan-out across enabled channels. Public so tests (and an
    /// operator-triggered "refresh now") can drive a tick without the
    /// interval loop.
    pub async fn tick(&self) -> Vec<ChannelFailure> {
        let channels = match self.inner.db.list_enabled_channels().await {
            Ok(channels) => channels,
            Err(e) => {
                error!(error = %e, "failed to list enabled channels for refresh tick");
                return vec![ChannelFailure {
                    channel_id: uuid::Uuid::nil(),
                    message: e.to_string(),
                    at: chrono::Utc::now(),
                }];
            }
        };

        let mut failures = Vec::new();
        let cancel = CancellationToken::new();

        for channel in channels {
            let result = self.refresh_one_channel(&channel, &cancel).await;
            if let Err(e) = result {
                failures.push(ChannelFailure {
                    channel_id: channel.id,
                    message: e.to_string(),
                    at: chrono::Utc::now(),
                });
            }
            if let Err(e) = self
                .inner
                .db
                .update_channel_last_refresh(channel.id, chrono::Utc::now())
                .await
            {
                error!(channel_id = %channel.id, error = %e, "failed to update last_refresh_at");
            }
        }

        if !failures.is_empty() {
            info!(count = failures.len(), "refresh tick completed with per-channel failures");
        }
        failures
    }

    async fn refresh_one_channel(
        &self,
        channel: &crate::models::Channel,
        cancel: &CancellationToken,
    ) -> Result<(), AppError> {
        let mut discovered = self.inner.fetcher.enumerate(&channel.url, cancel).await?;
        sort_newest_first_nulls_last(&mut discovered);
        let window = channel.effective_episode_count() as usize;
        discovered.truncate(window);

        for candidate in discovered {
            if self
                .inner
                .db
                .find_item_by_video_id(&candidate.video_id)
                .await?
                .is_some()
            {
                continue;
            }
            let item = self.inner.db.create_item(channel.id, &candidate).await?;
            match self.inner.queue.enqueue(item.id, DEFAULT_PRIORITY).await {
                Ok(_) | Err(AppError::AlreadyQueued(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

fn sort_newest_first_nulls_last(items: &mut [DiscoveredItem]) {
    items.sort_by(|a, b| match (a.published_at, b.published_at) {
        (Some(a), Some(b)) => b.cmp(&a),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    });
}
