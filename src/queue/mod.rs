//! Download queue (C5): the state machine from spec §4.2, backed by the
//! `queue_entries` table in C1. Every operation here is a single guarded
//! update; the store's row-level locking is the only synchronisation this
//! relies on, so the service is `Clone` and safe to share across workers.

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::database::Database;
use crate::errors::AppError;
use crate::models::{clamp_priority, QueueEntry, QueueStatus, DEFAULT_MAX_ATTEMPTS};

/// Retry delay keyed by the attempt count just completed (spec §4.2).
/// Index 0 is unused; attempt counts start at 1.
const BACKOFF_TABLE: [i64; 6] = [0, 0, 300, 1800, 7200, 28_800];

fn backoff_seconds(attempts_just_completed: i64) -> i64 {
    let idx = attempts_just_completed.clamp(0, (BACKOFF_TABLE.len() - 1) as i64) as usize;
    BACKOFF_TABLE[idx]
}

#[derive(Clone)]
pub struct DownloadQueue {
    db: Database,
}

impl DownloadQueue {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn enqueue(&self, item_id: Uuid, priority: i64) -> Result<QueueEntry, AppError> {
        if let Some(existing) = self.db.queue_find_active_for_item(item_id).await? {
            let _ = existing;
            return Err(AppError::AlreadyQueued(item_id));
        }
        self.db
            .queue_insert(item_id, clamp_priority(priority), DEFAULT_MAX_ATTEMPTS)
            .await
    }

    pub async fn next_pending(&self) -> Result<Option<QueueEntry>, AppError> {
        self.db.queue_next_pending().await
    }

    pub async fn retryable(&self) -> Result<Vec<QueueEntry>, AppError> {
        self.db.queue_retryable(Utc::now()).await
    }

    /// Valid from `Pending` *or* `Retrying` (spec §9: the test suite is
    /// authoritative over the source's own doc comment).
    pub async fn mark_in_progress(&self, id: Uuid) -> Result<(), AppError> {
        let entry = self.db.queue_get(id).await?;
        let applied = self
            .db
            .queue_compare_and_set_either(
                id,
                QueueStatus::Pending,
                QueueStatus::Retrying,
                QueueStatus::InProgress,
            )
            .await?;
        if applied {
            Ok(())
        } else {
            Err(AppError::invalid_state(
                entry.item_id,
                entry.status,
                "mark_in_progress",
            ))
        }
    }

    pub async fn mark_completed(&self, id: Uuid) -> Result<(), AppError> {
        let entry = self.db.queue_get(id).await?;
        let applied = self
            .db
            .queue_compare_and_set(id, QueueStatus::InProgress, QueueStatus::Completed)
            .await?;
        if applied {
            Ok(())
        } else {
            Err(AppError::invalid_state(
                entry.item_id,
                entry.status,
                "mark_completed",
            ))
        }
    }

    /// Record a failed attempt. Valid only from `InProgress`. Transitions to
    /// `Retrying` with a backoff-table delay, or to terminal `Failed` once
    /// `max_attempts` is reached (spec §4.2).
    pub async fn mark_failed(
        &self,
        id: Uuid,
        error: &str,
        retry_at_override: Option<DateTime<Utc>>,
    ) -> Result<(), AppError> {
        let entry = self.db.queue_get(id).await?;
        if entry.status != QueueStatus::InProgress {
            return Err(AppError::invalid_state(
                entry.item_id,
                entry.status,
                "mark_failed",
            ));
        }

        let attempts = entry.attempts + 1;
        let (status, next_retry_at) = if attempts >= entry.max_attempts {
            (QueueStatus::Failed, None)
        } else {
            let retry_at = retry_at_override
                .unwrap_or_else(|| Utc::now() + Duration::seconds(backoff_seconds(attempts)));
            (QueueStatus::Retrying, Some(retry_at))
        };

        self.db
            .queue_record_failure(id, attempts, status, next_retry_at, error)
            .await
    }

    /// Valid only from `Pending` or `Retrying`; running pipelines are
    /// stopped via cancellation token, not queue state (spec §4.2).
    pub async fn cancel(&self, id: Uuid) -> Result<(), AppError> {
        let entry = self.db.queue_get(id).await?;
        let applied = self
            .db
            .queue_compare_and_set_either(
                id,
                QueueStatus::Pending,
                QueueStatus::Retrying,
                QueueStatus::Cancelled,
            )
            .await?;
        if applied {
            Ok(())
        } else {
            Err(AppError::invalid_state(entry.item_id, entry.status, "cancel"))
        }
    }

    pub async fn counts_by_status(&self) -> Result<Vec<(QueueStatus, i64)>, AppError> {
        self.db.queue_counts_by_status().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::models::{DiscoveredItem, FeedType};

    async fn setup() -> (DownloadQueue, Uuid) {
        let db = Database::connect_in_memory().await.unwrap();
        let channel = db
            .create_channel("https://x", "X", "", None, FeedType::Both, 10)
            .await
            .unwrap();
        let item = db
            .create_item(
                channel.id,
                &DiscoveredItem {
                    video_id: "vid-1".to_string(),
                    title: "t".to_string(),
                    description: "d".to_string(),
                    thumbnail_url: None,
                    duration_seconds: None,
                    published_at: None,
                },
            )
            .await
            .unwrap();
        (DownloadQueue::new(db), item.id)
    }

    #[tokio::test]
    async fn enqueue_twice_fails_with_already_queued() {
        let (queue, item_id) = setup().await;
        queue.enqueue(item_id, 5).await.unwrap();
        let err = queue.enqueue(item_id, 5).await.unwrap_err();
        assert!(matches!(err, AppError::AlreadyQueued(id) if id == item_id));
    }

    #[tokio::test]
    async fn priority_is_clamped_into_range() {
        let (queue, item_id) = setup().await;
        let entry = queue.enqueue(item_id, 99).await.unwrap();
        assert_eq!(entry.priority, 10);
    }

    #[tokio::test]
    async fn full_happy_path_transitions() {
        let (queue, item_id) = setup().await;
        let entry = queue.enqueue(item_id, 5).await.unwrap();
        queue.mark_in_progress(entry.id).await.unwrap();
        queue.mark_completed(entry.id).await.unwrap();

        let reloaded = queue.db.queue_get(entry.id).await.unwrap();
        assert_eq!(reloaded.status, QueueStatus::Completed);
    }

    #[tokio::test]
    async fn mark_completed_from_pending_is_invalid_state() {
        let (queue, item_id) = setup().await;
        let entry = queue.enqueue(item_id, 5).await.unwrap();
        let err = queue.mark_completed(entry.id).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidState { .. }));

        let reloaded = queue.db.queue_get(entry.id).await.unwrap();
        assert_eq!(reloaded.status, QueueStatus::Pending, "state unchanged on rejection");
    }

    #[tokio::test]
    async fn retry_then_success_scenario() {
        let (queue, item_id) = setup().await;
        let entry = queue.enqueue(item_id, 5).await.unwrap();
        queue.mark_in_progress(entry.id).await.unwrap();

        let before = Utc::now();
        queue.mark_failed(entry.id, "boom", None).await.unwrap();
        let retried = queue.db.queue_get(entry.id).await.unwrap();
        assert_eq!(retried.status, QueueStatus::Retrying);
        assert_eq!(retried.attempts, 1);
        let next_retry = retried.next_retry_at.unwrap();
        assert!((next_retry - before).num_seconds().abs() <= 60);

        // Retrying -> InProgress is explicitly allowed (spec §9).
        queue.mark_in_progress(entry.id).await.unwrap();
        let reclaimed = queue.db.queue_get(entry.id).await.unwrap();
        assert!(
            reclaimed.next_retry_at.is_none(),
            "next_retry_at must be cleared once the entry leaves Retrying (spec §3)"
        );

        queue.mark_completed(entry.id).await.unwrap();
        let done = queue.db.queue_get(entry.id).await.unwrap();
        assert_eq!(done.status, QueueStatus::Completed);
        assert!(done.next_retry_at.is_none());
    }

    #[tokio::test]
    async fn retry_exhaustion_after_five_failures() {
        let (queue, item_id) = setup().await;
        let entry = queue.enqueue(item_id, 5).await.unwrap();

        for attempt in 1..=5 {
            queue.mark_in_progress(entry.id).await.unwrap();
            queue.mark_failed(entry.id, "boom", None).await.unwrap();
            let reloaded = queue.db.queue_get(entry.id).await.unwrap();
            assert_eq!(reloaded.attempts, attempt);
            if attempt < 5 {
                assert_eq!(reloaded.status, QueueStatus::Retrying);
                assert!(reloaded.next_retry_at.is_some());
            } else {
                assert_eq!(reloaded.status, QueueStatus::Failed);
                assert!(reloaded.next_retry_at.is_none());
            }
        }
    }

    #[tokio::test]
    async fn cancel_rejected_once_in_progress() {
        let (queue, item_id) = setup().await;
        let entry = queue.enqueue(item_id, 5).await.unwrap();
        queue.mark_in_progress(entry.id).await.unwrap();
        let err = queue.cancel(entry.id).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn retryable_picks_up_due_entries_in_priority_order() {
        let db = Database::connect_in_memory().await.unwrap();
        let channel = db
            .create_channel("https://x", "X", "", None, FeedType::Both, 10)
            .await
            .unwrap();
        let queue = DownloadQueue::new(db.clone());

        let mut ids = Vec::new();
        for (vid, priority) in [("a", 3), ("b", 1)] {
            let item = db
                .create_item(
                    channel.id,
                    &DiscoveredItem {
                        video_id: vid.to_string(),
                        title: "t".to_string(),
                        description: "d".to_string(),
                        thumbnail_url: None,
                        duration_seconds: None,
                        published_at: None,
                    },
                )
                .await
                .unwrap();
            let entry = queue.enqueue(item.id, priority).await.unwrap();
            queue.mark_in_progress(entry.id).await.unwrap();
            queue
                .mark_failed(entry.id, "boom", Some(Utc::now() - Duration::seconds(1)))
                .await
                .unwrap();
            ids.push(entry.id);
        }

        let due = queue.retryable().await.unwrap();
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].id, ids[1], "priority 1 entry should sort first");
    }
}
