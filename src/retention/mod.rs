//! Retention cleaner (C8): per channel, keeps the newest `episode_count_config`
//! completed items and deletes on-disk artifacts for the rest (spec §4.5).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::config::StorageConfig;
use crate::database::Database;
use crate::errors::{AppError, ChannelFailure};
use crate::events::EventBus;
use crate::models::Item;

#[derive(Clone)]
pub struct RetentionCleaner {
    db: Database,
    events: EventBus,
    storage: StorageConfig,
}

#[derive(Debug, Default)]
pub struct RetentionReport {
    pub channels_processed: usize,
    pub items_deleted: usize,
    pub bytes_freed: u64,
    pub failures: Vec<ChannelFailure>,
}

impl RetentionCleaner {
    pub fn new(db: Database, events: EventBus, storage: StorageConfig) -> Self {
        Self { db, events, storage }
    }

    /// Runs a full sweep across every channel. A single channel's error is
    /// captured and the loop continues (spec §4.5).
    pub async fn run(&self) -> RetentionReport {
        let mut report = RetentionReport::default();
        let channels = match self.db.list_enabled_channels().await {
            Ok(channels) => channels,
            Err(e) => {
                report.failures.push(ChannelFailure {
                    channel_id: Uuid::nil(),
                    message: e.to_string(),
                    at: chrono::Utc::now(),
                });
                return report;
            }
        };

        for channel in channels {
            report.channels_processed += 1;
            match self.sweep_channel(channel.id, channel.effective_episode_count() as usize).await {
                Ok((deleted, freed)) => {
                    report.items_deleted += deleted;
                    report.bytes_freed += freed;
                    if deleted > 0 {
                        self.events.channel_retention_ran(channel.id, freed);
                    }
                }
                Err(e) => report.failures.push(ChannelFailure {
                    channel_id: channel.id,
                    message: e.to_string(),
                    at: chrono::Utc::now(),
                }),
            }
        }
        report
    }

    async fn sweep_channel(&self, channel_id: Uuid, keep: usize) -> Result<(usize, u64), AppError> {
        let completed = self.db.list_completed_items_for_channel(channel_id).await?;
        let mut deleted = 0usize;
        let mut freed = 0u64;

        for item in completed.into_iter().skip(keep) {
            freed += self.delete_artifacts(&item).await;
            self.db.mark_item_deleted(item.id).await?;
            deleted += 1;
        }
        Ok((deleted, freed))
    }

    /// Deletes every on-disk artifact for `item` and returns the freed byte
    /// count computed from the recorded sizes *before* they are cleared.
    /// Per-file deletion failures are logged, never fatal.
    async fn delete_artifacts(&self, item: &Item) -> u64 {
        let mut freed = 0u64;

        if let Some(path) = &item.file_path_audio {
            freed += item.file_size_audio.unwrap_or(0).max(0) as u64;
            self.remove_relative(path).await;
        }
        if let Some(path) = &item.file_path_video {
            freed += item.file_size_video.unwrap_or(0).max(0) as u64;
            self.remove_relative(path).await;
        }
        if let Some(thumbnail) = &item.thumbnail_url {
            if !thumbnail.starts_with("http://") && !thumbnail.starts_with("https://") {
                self.remove_relative(thumbnail).await;
            }
        }
        freed
    }

    async fn remove_relative(&self, relative_path: &str) {
        let path = self.storage.download_dir.join(relative_path);
        if let Err(e) = tokio::fs::remove_file(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "failed to remove retained artifact");
            }
        }
    }
}

struct TickerInner {
    cleaner: RetentionCleaner,
    interval: Duration,
    started: AtomicBool,
    cancel: CancellationToken,
    handle: AsyncMutex<Option<JoinHandle<()>>>,
}

/// Runs [`RetentionCleaner::run`] on its own interval, independent of C7's
/// cadence (spec §4.5). Same start/shutdown idiom as [`crate::scheduler::RefreshScheduler`].
#[derive(Clone)]
pub struct RetentionTicker {
    inner: Arc<TickerInner>,
}

impl RetentionTicker {
    pub fn new(cleaner: RetentionCleaner, interval: Duration) -> Self {
        Self {
            inner: Arc::new(TickerInner {
                cleaner,
                interval,
                started: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                handle: AsyncMutex::new(None),
            }),
        }
    }

    /// Idempotent: a second call while already running is a no-op.
    pub async fn start(&self) -> bool {
        if self
            .inner
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        let ticker = self.clone();
        let handle = tokio::spawn(async move { ticker.run_loop().await });
        *self.inner.handle.lock().await = Some(handle);
        true
    }

    /// Cancels the loop and waits for any in-flight sweep to finish.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        if let Some(handle) = self.inner.handle.lock().await.take() {
            let _ = handle.await;
        }
        self.inner.started.store(false, Ordering::SeqCst);
    }

    async fn run_loop(&self) {
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.inner.interval) => {
                    let report = self.inner.cleaner.run().await;
                    if !report.failures.is_empty() {
                        warn!(
                            failures = report.failures.len(),
                            items_deleted = report.items_deleted,
                            "retention sweep completed with per-channel failures"
                        );
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DiscoveredItem, FeedType};

    async fn setup() -> (RetentionCleaner, Database, tempfile::TempDir) {
        let db = Database::connect_in_memory().await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageConfig {
            download_dir: dir.path().to_path_buf(),
            temp_dir: dir.path().join("tmp"),
        };
        let cleaner = RetentionCleaner::new(db.clone(), EventBus::new(), storage);
        (cleaner, db, dir)
    }

    async fn make_completed_item(
        db: &Database,
        channel_id: Uuid,
        video_id: &str,
        published_at: chrono::DateTime<chrono::Utc>,
        relative_path: &str,
        download_dir: &std::path::Path,
    ) -> Item {
        let item = db
            .create_item(
                channel_id,
                &DiscoveredItem {
                    video_id: video_id.to_string(),
                    title: "T".to_string(),
                    description: "D".to_string(),
                    thumbnail_url: None,
                    duration_seconds: None,
                    published_at: Some(published_at),
                },
            )
            .await
            .unwrap();
        let full_path = download_dir.join(relative_path);
        tokio::fs::create_dir_all(full_path.parent().unwrap()).await.unwrap();
        tokio::fs::write(&full_path, b"data").await.unwrap();
        db.set_item_artifacts(item.id, Some(relative_path), Some(4), None, None)
            .await
            .unwrap();
        db.complete_item(item.id).await.unwrap();
        db.get_item(item.id).await.unwrap()
    }

    #[tokio::test]
    async fn keeps_newest_n_and_deletes_the_rest() {
        let (cleaner, db, dir) = setup().await;
        let channel = db
            .create_channel("https://chan", "Chan", "", None, FeedType::Audio, 1)
            .await
            .unwrap();
        let now = chrono::Utc::now();
        let newest = make_completed_item(
            &db,
            channel.id,
            "v-new",
            now,
            "c/audio/v-new.mp3",
            dir.path(),
        )
        .await;
        let oldest = make_completed_item(
            &db,
            channel.id,
            "v-old",
            now - chrono::Duration::days(1),
            "c/audio/v-old.mp3",
            dir.path(),
        )
        .await;

        let report = cleaner.run().await;
        assert_eq!(report.items_deleted, 1);
        assert_eq!(report.bytes_freed, 4);

        let reloaded_new = db.get_item(newest.id).await.unwrap();
        assert_eq!(reloaded_new.status, crate::models::ItemStatus::Completed);
        let reloaded_old = db.get_item(oldest.id).await.unwrap();
        assert_eq!(reloaded_old.status, crate::models::ItemStatus::Deleted);

        assert!(dir.path().join("c/audio/v-new.mp3").exists());
        assert!(!dir.path().join("c/audio/v-old.mp3").exists());
    }

    #[tokio::test]
    async fn missing_file_does_not_fail_the_sweep() {
        let (cleaner, db, dir) = setup().await;
        let channel = db
            .create_channel("https://chan", "Chan", "", None, FeedType::Audio, 1)
            .await
            .unwrap();
        let now = chrono::Utc::now();
        let _newest = make_completed_item(
            &db,
            channel.id,
            "v-new",
            now,
            "c/audio/v-new.mp3",
            dir.path(),
        )
        .await;
        let oldest = make_completed_item(
            &db,
            channel.id,
            "v-old",
            now - chrono::Duration::days(1),
            "c/audio/v-old.mp3",
            dir.path(),
        )
        .await;
        // The file is already gone by the time the sweep runs (e.g. removed
        // out-of-band); deletion must still be logged-and-continue, not fail.
        tokio::fs::remove_file(dir.path().join("c/audio/v-old.mp3")).await.unwrap();

        let report = cleaner.run().await;
        assert!(report.failures.is_empty());
        assert_eq!(report.items_deleted, 1);
        let reloaded = db.get_item(oldest.id).await.unwrap();
        assert_eq!(reloaded.status, crate::models::ItemStatus::Deleted);
    }

    #[tokio::test]
    async fn ticker_start_is_idempotent_while_running() {
        let (cleaner, _db, _dir) = setup().await;
        let ticker = RetentionTicker::new(cleaner, Duration::from_secs(3600));
        assert!(ticker.start().await);
        assert!(!ticker.start().await, "second start is a no-op while running");
        ticker.shutdown().await;
    }

    #[tokio::test]
    async fn ticker_sweeps_on_its_own_cadence() {
        let (cleaner, db, dir) = setup().await;
        let channel = db
            .create_channel("https://chan", "Chan", "", None, FeedType::Audio, 1)
            .await
            .unwrap();
        let now = chrono::Utc::now();
        let newest = make_completed_item(&db, channel.id, "v-new", now, "c/audio/v-new.mp3", dir.path()).await;
        let oldest = make_completed_item(
            &db,
            channel.id,
            "v-old",
            now - chrono::Duration::days(1),
            "c/audio/v-old.mp3",
            dir.path(),
        )
        .await;

        let ticker = RetentionTicker::new(cleaner, Duration::from_millis(10));
        ticker.start().await;

        let mut deleted = false;
        for _ in 0..200 {
            if db.get_item(oldest.id).await.unwrap().status == crate::models::ItemStatus::Deleted {
                deleted = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        ticker.shutdown().await;

        assert!(deleted, "ticker did not sweep within its cadence");
        assert_eq!(
            db.get_item(newest.id).await.unwrap().status,
            crate::models::ItemStatus::Completed
        );
    }
}
