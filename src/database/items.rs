use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use super::{parse_datetime, Database};
use crate::errors::AppError;
use crate::models::{DiscoveredItem, Item, ItemStatus};

fn status_from_str(s: &str) -> ItemStatus {
    match s {
        "Downloading" => ItemStatus::Downloading,
        "Processing" => ItemStatus::Processing,
        "Completed" => ItemStatus::Completed,
        "Failed" => ItemStatus::Failed,
        "Deleted" => ItemStatus::Deleted,
        _ => ItemStatus::Pending,
    }
}

fn status_to_str(status: ItemStatus) -> &'static str {
    match status {
        ItemStatus::Pending => "Pending",
        ItemStatus::Downloading => "Downloading",
        ItemStatus::Processing => "Processing",
        ItemStatus::Completed => "Completed",
        ItemStatus::Failed => "Failed",
        ItemStatus::Deleted => "Deleted",
    }
}

fn row_to_item(row: &sqlx::sqlite::SqliteRow) -> Result<Item, AppError> {
    let id: String = row.try_get("id")?;
    let channel_id: String = row.try_get("channel_id")?;
    let status: String = row.try_get("status")?;
    let published_at: Option<String> = row.try_get("published_at")?;
    let downloaded_at: Option<String> = row.try_get("downloaded_at")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(Item {
        id: Uuid::parse_str(&id).map_err(|e| AppError::ParseError(e.to_string()))?,
        channel_id: Uuid::parse_str(&channel_id).map_err(|e| AppError::ParseError(e.to_string()))?,
        video_id: row.try_get("video_id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        thumbnail_url: row.try_get("thumbnail_url")?,
        duration_seconds: row.try_get("duration_seconds")?,
        published_at: published_at.map(|s| parse_datetime(&s)).transpose()?,
        status: status_from_str(&status),
        file_path_audio: row.try_get("file_path_audio")?,
        file_size_audio: row.try_get("file_size_audio")?,
        file_path_video: row.try_get("file_path_video")?,
        file_size_video: row.try_get("file_size_video")?,
        downloaded_at: downloaded_at.map(|s| parse_datetime(&s)).transpose()?,
        last_error: row.try_get("last_error")?,
        created_at: parse_datetime(&created_at)?,
        updated_at: parse_datetime(&updated_at)?,
    })
}

impl Database {
    pub async fn create_item(
        &self,
        channel_id: Uuid,
        discovered: &DiscoveredItem,
    ) -> Result<Item, AppError> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO items
             (id, channel_id, video_id, title, description, thumbnail_url,
              duration_seconds, published_at, status, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'Pending', ?, ?)",
        )
        .bind(id.to_string())
        .bind(channel_id.to_string())
        .bind(&discovered.video_id)
        .bind(&discovered.title)
        .bind(&discovered.description)
        .bind(&discovered.thumbnail_url)
        .bind(discovered.duration_seconds)
        .bind(discovered.published_at.map(|d| d.to_rfc3339()))
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        self.get_item(id).await
    }

    pub async fn get_item(&self, id: Uuid) -> Result<Item, AppError> {
        let row = sqlx::query("SELECT * FROM items WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::not_found("item", id.to_string()))?;
        row_to_item(&row)
    }

    /// `video_id` is unique across *all* items regardless of channel or
    /// status (spec §9 open question: the observed behaviour is preserved).
    pub async fn find_item_by_video_id(&self, video_id: &str) -> Result<Option<Item>, AppError> {
        let row = sqlx::query("SELECT * FROM items WHERE video_id = ?")
            .bind(video_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_item).transpose()
    }

    pub async fn set_item_status(&self, id: Uuid, status: ItemStatus) -> Result<(), AppError> {
        sqlx::query("UPDATE items SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status_to_str(status))
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_item_failed(&self, id: Uuid, error: &str) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE items SET status = 'Failed', last_error = ?, updated_at = ? WHERE id = ?",
        )
        .bind(error)
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn set_item_artifacts(
        &self,
        id: Uuid,
        file_path_audio: Option<&str>,
        file_size_audio: Option<i64>,
        file_path_video: Option<&str>,
        file_size_video: Option<i64>,
    ) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE items
             SET file_path_audio = COALESCE(?, file_path_audio),
                 file_size_audio = COALESCE(?, file_size_audio),
                 file_path_video = COALESCE(?, file_path_video),
                 file_size_video = COALESCE(?, file_size_video),
                 updated_at = ?
             WHERE id = ?",
        )
        .bind(file_path_audio)
        .bind(file_size_audio)
        .bind(file_path_video)
        .bind(file_size_video)
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_item_downloaded_at(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        sqlx::query("UPDATE items SET downloaded_at = ?, updated_at = ? WHERE id = ?")
            .bind(at.to_rfc3339())
            .bind(at.to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn complete_item(&self, id: Uuid) -> Result<(), AppError> {
        sqlx::query("UPDATE items SET status = 'Completed', updated_at = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// All Completed items for a channel, newest `published_at` first with
    /// null dates last (spec §4.5, §4.6 ordering convention).
    pub async fn list_completed_items_for_channel(
        &self,
        channel_id: Uuid,
    ) -> Result<Vec<Item>, AppError> {
        let rows = sqlx::query(
            "SELECT * FROM items
             WHERE channel_id = ? AND status = 'Completed'
             ORDER BY (published_at IS NULL) ASC, published_at DESC, created_at DESC",
        )
        .bind(channel_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_item).collect()
    }

    pub async fn mark_item_deleted(&self, id: Uuid) -> Result<(), AppError> {
        sqlx::query("UPDATE items SET status = 'Deleted', updated_at = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::models::FeedType;

    fn sample_discovered(video_id: &str) -> DiscoveredItem {
        DiscoveredItem {
            video_id: video_id.to_string(),
            title: "Title".to_string(),
            description: "Desc".to_string(),
            thumbnail_url: None,
            duration_seconds: Some(120),
            published_at: Some(Utc::now()),
        }
    }

    #[tokio::test]
    async fn video_id_lookup_is_global_not_per_channel() {
        let db = Database::connect_in_memory().await.unwrap();
        let channel = db
            .create_channel("https://x", "X", "", None, FeedType::Both, 10)
            .await
            .unwrap();
        let item = db
            .create_item(channel.id, &sample_discovered("vid-1"))
            .await
            .unwrap();

        let found = db.find_item_by_video_id("vid-1").await.unwrap().unwrap();
        assert_eq!(found.id, item.id);

        db.mark_item_deleted(item.id).await.unwrap();
        let still_found = db.find_item_by_video_id("vid-1").await.unwrap();
        assert!(still_found.is_some(), "deleted items still count toward uniqueness");
    }

    #[tokio::test]
    async fn completed_items_ordered_newest_first_nulls_last() {
        let db = Database::connect_in_memory().await.unwrap();
        let channel = db
            .create_channel("https://x", "X", "", None, FeedType::Both, 10)
            .await
            .unwrap();

        let old = db
            .create_item(
                channel.id,
                &DiscoveredItem {
                    published_at: Some(Utc::now() - chrono::Duration::days(2)),
                    ..sample_discovered("vid-old")
                },
            )
            .await
            .unwrap();
        let new = db
            .create_item(
                channel.id,
                &DiscoveredItem {
                    published_at: Some(Utc::now()),
                    ..sample_discovered("vid-new")
                },
            )
            .await
            .unwrap();
        let undated = db
            .create_item(
                channel.id,
                &DiscoveredItem {
                    published_at: None,
                    ..sample_discovered("vid-undated")
                },
            )
            .await
            .unwrap();

        for id in [old.id, new.id, undated.id] {
            db.complete_item(id).await.unwrap();
        }

        let items = db.list_completed_items_for_channel(channel.id).await.unwrap();
        let ids: Vec<Uuid> = items.iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![new.id, old.id, undated.id]);
    }
}
