use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use super::{parse_datetime, Database};
use crate::errors::AppError;
use crate::models::{QueueEntry, QueueStatus};

fn status_from_str(s: &str) -> QueueStatus {
    match s {
        "InProgress" => QueueStatus::InProgress,
        "Retrying" => QueueStatus::Retrying,
        "Completed" => QueueStatus::Completed,
        "Failed" => QueueStatus::Failed,
        "Cancelled" => QueueStatus::Cancelled,
        _ => QueueStatus::Pending,
    }
}

pub(crate) fn status_to_str(status: QueueStatus) -> &'static str {
    match status {
        QueueStatus::Pending => "Pending",
        QueueStatus::InProgress => "InProgress",
        QueueStatus::Retrying => "Retrying",
        QueueStatus::Completed => "Completed",
        QueueStatus::Failed => "Failed",
        QueueStatus::Cancelled => "Cancelled",
    }
}

fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> Result<QueueEntry, AppError> {
    let id: String = row.try_get("id")?;
    let item_id: String = row.try_get("item_id")?;
    let status: String = row.try_get("status")?;
    let next_retry_at: Option<String> = row.try_get("next_retry_at")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(QueueEntry {
        id: Uuid::parse_str(&id).map_err(|e| AppError::ParseError(e.to_string()))?,
        item_id: Uuid::parse_str(&item_id).map_err(|e| AppError::ParseError(e.to_string()))?,
        priority: row.try_get("priority")?,
        status: status_from_str(&status),
        attempts: row.try_get("attempts")?,
        max_attempts: row.try_get("max_attempts")?,
        next_retry_at: next_retry_at.map(|s| parse_datetime(&s)).transpose()?,
        last_error: row.try_get("last_error")?,
        created_at: parse_datetime(&created_at)?,
        updated_at: parse_datetime(&updated_at)?,
    })
}

impl Database {
    pub(crate) async fn queue_insert(
        &self,
        item_id: Uuid,
        priority: i64,
        max_attempts: i64,
    ) -> Result<QueueEntry, AppError> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO queue_entries
             (id, item_id, priority, status, attempts, max_attempts, next_retry_at,
              last_error, created_at, updated_at)
             VALUES (?, ?, ?, 'Pending', 0, ?, NULL, NULL, ?, ?)",
        )
        .bind(id.to_string())
        .bind(item_id.to_string())
        .bind(priority)
        .bind(max_attempts)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;
        self.queue_get(id).await
    }

    pub(crate) async fn queue_get(&self, id: Uuid) -> Result<QueueEntry, AppError> {
        let row = sqlx::query("SELECT * FROM queue_entries WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::not_found("queue_entry", id.to_string()))?;
        row_to_entry(&row)
    }

    /// The entry, if any, whose status is still non-terminal for this item
    /// (spec §4.2 "exactly one active entry per item").
    pub(crate) async fn queue_find_active_for_item(
        &self,
        item_id: Uuid,
    ) -> Result<Option<QueueEntry>, AppError> {
        let row = sqlx::query(
            "SELECT * FROM queue_entries
             WHERE item_id = ? AND status IN ('Pending', 'InProgress', 'Retrying')
             LIMIT 1",
        )
        .bind(item_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_entry).transpose()
    }

    pub(crate) async fn queue_next_pending(&self) -> Result<Option<QueueEntry>, AppError> {
        let row = sqlx::query(
            "SELECT * FROM queue_entries
             WHERE status = 'Pending'
             ORDER BY priority ASC, created_at ASC
             LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_entry).transpose()
    }

    pub(crate) async fn queue_retryable(&self, now: DateTime<Utc>) -> Result<Vec<QueueEntry>, AppError> {
        let rows = sqlx::query(
            "SELECT * FROM queue_entries
             WHERE status = 'Retrying' AND next_retry_at <= ?
             ORDER BY priority ASC, next_retry_at ASC",
        )
        .bind(now.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_entry).collect()
    }

    /// Compare-and-set the status column; returns `true` iff a row matched
    /// `expected` and was updated. This is the only concurrency primitive the
    /// queue state machine needs: the store's own row locking serializes
    /// concurrent attempts, and whichever caller's `UPDATE ... WHERE status =
    /// ?` affects zero rows loses the race and reports `InvalidState`.
    pub(crate) async fn queue_compare_and_set(
        &self,
        id: Uuid,
        expected: QueueStatus,
        new_status: QueueStatus,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            "UPDATE queue_entries SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
        )
        .bind(status_to_str(new_status))
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .bind(status_to_str(expected))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// CAS from either of two expected statuses (used for `mark_in_progress`,
    /// which accepts both `Pending` and `Retrying`, spec §4.2 / §9, and for
    /// `cancel`). Neither caller ever lands on `Retrying`, so `next_retry_at`
    /// is always cleared here to keep spec §3's "set iff status = Retrying"
    /// invariant from going stale on the Retrying -> * transition.
    pub(crate) async fn queue_compare_and_set_either(
        &self,
        id: Uuid,
        expected_a: QueueStatus,
        expected_b: QueueStatus,
        new_status: QueueStatus,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            "UPDATE queue_entries SET status = ?, next_retry_at = NULL, updated_at = ?
             WHERE id = ? AND status IN (?, ?)",
        )
        .bind(status_to_str(new_status))
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .bind(status_to_str(expected_a))
        .bind(status_to_str(expected_b))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub(crate) async fn queue_record_failure(
        &self,
        id: Uuid,
        attempts: i64,
        status: QueueStatus,
        next_retry_at: Option<DateTime<Utc>>,
        error: &str,
    ) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE queue_entries
             SET status = ?, attempts = ?, next_retry_at = ?, last_error = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(status_to_str(status))
        .bind(attempts)
        .bind(next_retry_at.map(|d| d.to_rfc3339()))
        .bind(error)
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub(crate) async fn queue_counts_by_status(
        &self,
    ) -> Result<Vec<(QueueStatus, i64)>, AppError> {
        let rows = sqlx::query("SELECT status, COUNT(*) as n FROM queue_entries GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| -> Result<(QueueStatus, i64), AppError> {
                let status: String = row.try_get("status")?;
                let n: i64 = row.try_get("n")?;
                Ok((status_from_str(&status), n))
            })
            .collect()
    }
}
