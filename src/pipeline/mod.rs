//! Ingestion pipeline (C6): drives one item through
//! `Downloading -> Processing -> Completed`, composing the fetcher (C2),
//! transcoder (C3), concurrency coordinator (C4), and persistence (C1).
//! Runs entirely under a single C4 permit (spec §4.3).

pub mod worker;

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::concurrency::ConcurrencyCoordinator;
use crate::config::{StorageConfig, TranscodeConfig};
use crate::database::Database;
use crate::errors::AppError;
use crate::events::EventBus;
use crate::fetcher::{Fetcher, NoopProgressSink, ProgressSink};
use crate::metrics::Metrics;
use crate::models::ItemStatus;
use crate::transcoder::Transcoder;

const CANCELLED_MESSAGE: &str = "Pipeline cancelled";

fn watch_url(video_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={video_id}")
}

fn extension_for_format(format: &str) -> &str {
    format
}

pub struct Pipeline {
    db: Database,
    fetcher: Arc<dyn Fetcher>,
    transcoder: Arc<dyn Transcoder>,
    concurrency: Arc<ConcurrencyCoordinator>,
    events: EventBus,
    metrics: Arc<Metrics>,
    storage: StorageConfig,
    transcode_config: TranscodeConfig,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Database,
        fetcher: Arc<dyn Fetcher>,
        transcoder: Arc<dyn Transcoder>,
        concurrency: Arc<ConcurrencyCoordinator>,
        events: EventBus,
        metrics: Arc<Metrics>,
        storage: StorageConfig,
        transcode_config: TranscodeConfig,
    ) -> Self {
        Self {
            db,
            fetcher,
            transcoder,
            concurrency,
            events,
            metrics,
            storage,
            transcode_config,
        }
    }

    /// Drive `item_id` through the full pipeline. `progress` receives
    /// adapted fetch-progress events; pass [`NoopProgressSink`] if the
    /// caller does not care.
    pub async fn run(
        &self,
        item_id: Uuid,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<(), AppError> {
        let _permit = self.concurrency.acquire(cancel).await?;

        // 1. Load.
        let item = self.db.get_item(item_id).await?;

        // 2. Load channel.
        let channel = match self.db.find_channel(item.channel_id).await? {
            Some(channel) => channel,
            None => {
                self.db.set_item_failed(item.id, "Channel not found").await?;
                return Err(AppError::not_found("channel", item.channel_id.to_string()));
            }
        };

        if cancel.is_cancelled() {
            return self.cancel_in_flight(item.id, None).await;
        }

        // 3. Download.
        self.db.set_item_status(item.id, ItemStatus::Downloading).await?;
        let temp_path = self
            .storage
            .temp_dir
            .join(format!("{}-{}.download", item.video_id, Uuid::new_v4()));

        self.metrics.download_started();
        let fetch_result = self
            .fetcher
            .fetch(&watch_url(&item.video_id), &temp_path, progress, cancel)
            .await;

        let bytes_fetched = match fetch_result {
            Ok(path) => tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0),
            Err(AppError::Cancelled) => {
                return self.cancel_in_flight(item.id, Some(&temp_path)).await;
            }
            Err(e) => {
                self.metrics.download_failed();
                self.metrics.record_error("fetch");
                self.db.set_item_failed(item.id, &e.to_string()).await?;
                remove_best_effort(&temp_path).await;
                return Err(e);
            }
        };

        if cancel.is_cancelled() {
            remove_best_effort(&temp_path).await;
            return self.cancel_in_flight(item.id, None).await;
        }

        // 4. Transcode.
        self.db.set_item_status(item.id, ItemStatus::Processing).await?;

        let mut audio_path = None;
        let mut audio_size = None;
        let mut video_path = None;
        let mut video_size = None;

        if channel.feed_type.wants_audio() {
            let relative = format!(
                "{}/audio/{}.{}",
                channel.id,
                item.video_id,
                extension_for_format(&self.transcode_config.audio_format)
            );
            let output = self.storage.download_dir.join(&relative);
            match self
                .transcoder
                .transcode_audio(&temp_path, &output, &self.transcode_config, cancel)
                .await
            {
                Ok(result) => {
                    self.metrics.record_transcode("audio", result.duration_elapsed);
                    audio_path = Some(relative);
                    audio_size = Some(result.output_file_size as i64);
                }
                Err(AppError::Cancelled) => {
                    remove_best_effort(&temp_path).await;
                    return self.cancel_in_flight(item.id, None).await;
                }
                Err(e) => {
                    self.metrics.record_error("transcode");
                    self.db.set_item_failed(item.id, &e.to_string()).await?;
                    remove_best_effort(&temp_path).await;
                    return Err(e);
                }
            }
        }

        if channel.feed_type.wants_video() {
            let relative = format!(
                "{}/video/{}.{}",
                channel.id,
                item.video_id,
                extension_for_format(&self.transcode_config.video_format)
            );
            let output = self.storage.download_dir.join(&relative);
            match self
                .transcoder
                .transcode_video(&temp_path, &output, &self.transcode_config, cancel)
                .await
            {
                Ok(result) => {
                    self.metrics.record_transcode("video", result.duration_elapsed);
                    video_path = Some(relative);
                    video_size = Some(result.output_file_size as i64);
                }
                Err(AppError::Cancelled) => {
                    remove_best_effort(&temp_path).await;
                    return self.cancel_in_flight(item.id, None).await;
                }
                Err(e) => {
                    self.metrics.record_error("transcode");
                    self.db.set_item_failed(item.id, &e.to_string()).await?;
                    remove_best_effort(&temp_path).await;
                    return Err(e);
                }
            }
        }

        self.db
            .set_item_artifacts(
                item.id,
                audio_path.as_deref(),
                audio_size,
                video_path.as_deref(),
                video_size,
            )
            .await?;

        // 5. Commit.
        self.db.set_item_downloaded_at(item.id, Utc::now()).await?;

        // 6. Cleanup.
        remove_best_effort(&temp_path).await;

        // 7. Finalize.
        self.db.complete_item(item.id).await?;
        self.metrics.download_completed(bytes_fetched);
        self.events.item_completed(channel.id);

        info!(item_id = %item.id, channel_id = %channel.id, "pipeline completed item");
        Ok(())
    }

    async fn cancel_in_flight(
        &self,
        item_id: Uuid,
        temp_path: Option<&Path>,
    ) -> Result<(), AppError> {
        let item = self.db.get_item(item_id).await?;
        if item.status != ItemStatus::Completed && item.status != ItemStatus::Deleted {
            self.db.set_item_failed(item_id, CANCELLED_MESSAGE).await?;
        }
        if let Some(path) = temp_path {
            remove_best_effort(path).await;
        }
        Err(AppError::Cancelled)
    }
}

async fn remove_best_effort(path: &Path) {
    if path.exists() {
        if let Err(e) = tokio::fs::remove_file(path).await {
            warn!(path = %path.display(), error = %e, "failed to remove temp file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::database::Database;
    use crate::fetcher::fake::FakeFetcher;
    use crate::models::{DiscoveredItem, FeedType};
    use crate::transcoder::fake::FakeTranscoder;
    use tempfile::tempdir;

    async fn setup() -> (Pipeline, Uuid, tempfile::TempDir) {
        let db = Database::connect_in_memory().await.unwrap();
        let channel = db
            .create_channel("https://chan", "Chan", "desc", None, FeedType::Both, 10)
            .await
            .unwrap();
        let item = db
            .create_item(
                channel.id,
                &DiscoveredItem {
                    video_id: "vid-1".to_string(),
                    title: "T".to_string(),
                    description: "D".to_string(),
                    thumbnail_url: None,
                    duration_seconds: Some(100),
                    published_at: None,
                },
            )
            .await
            .unwrap();

        let dir = tempdir().unwrap();
        let storage = StorageConfig {
            download_dir: dir.path().join("media"),
            temp_dir: dir.path().join("tmp"),
        };

        let fetcher: Arc<dyn Fetcher> = Arc::new(FakeFetcher::new());
        let transcoder: Arc<dyn Transcoder> = Arc::new(FakeTranscoder::new());
        let concurrency = Arc::new(ConcurrencyCoordinator::new(2));
        let events = EventBus::new();
        let metrics = Arc::new(Metrics::new());

        let pipeline = Pipeline::new(
            db,
            fetcher,
            transcoder,
            concurrency,
            events,
            metrics,
            storage,
            TranscodeConfig::default(),
        );
        (pipeline, item.id, dir)
    }

    #[tokio::test]
    async fn happy_path_completes_item_with_both_artifacts() {
        let (pipeline, item_id, _dir) = setup().await;
        let cancel = CancellationToken::new();
        let sink = NoopProgressSink;

        pipeline.run(item_id, &sink, &cancel).await.unwrap();

        let item = pipeline.db.get_item(item_id).await.unwrap();
        assert_eq!(item.status, ItemStatus::Completed);
        assert!(item.has_audio());
        assert!(item.has_video());
        assert!(item.downloaded_at.is_some());
    }

    #[tokio::test]
    async fn fetch_failure_marks_item_failed_and_leaves_no_temp_file() {
        let (pipeline, item_id, _dir) = setup().await;
        let item = pipeline.db.get_item(item_id).await.unwrap();

        // Swap in a fetcher pre-scripted to fail this item's fetch, sharing
        // every other collaborator with the happy-path pipeline.
        let fake = Arc::new(FakeFetcher::new());
        fake.fail_next_fetch_for(&watch_url(&item.video_id)).await;

        let pipeline = Pipeline::new(
            pipeline.db.clone(),
            fake,
            pipeline.transcoder.clone(),
            pipeline.concurrency.clone(),
            pipeline.events.clone(),
            pipeline.metrics.clone(),
            pipeline.storage.clone(),
            pipeline.transcode_config.clone(),
        );

        let cancel = CancellationToken::new();
        let sink = NoopProgressSink;
        let err = pipeline.run(item_id, &sink, &cancel).await.unwrap_err();
        assert!(matches!(err, AppError::FetchError(_)));

        let reloaded = pipeline.db.get_item(item_id).await.unwrap();
        assert_eq!(reloaded.status, ItemStatus::Failed);
    }

    #[tokio::test]
    async fn cancellation_before_start_marks_failed_with_cancelled_message() {
        let (pipeline, item_id, _dir) = setup().await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let sink = NoopProgressSink;

        let err = pipeline.run(item_id, &sink, &cancel).await.unwrap_err();
        assert!(matches!(err, AppError::Cancelled));
    }
}
