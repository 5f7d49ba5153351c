use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use super::{parse_datetime, Database};
use crate::errors::AppError;
use crate::models::{Channel, FeedType};

fn feed_type_from_str(s: &str) -> FeedType {
    match s {
        "audio" => FeedType::Audio,
        "video" => FeedType::Video,
        _ => FeedType::Both,
    }
}

fn feed_type_to_str(feed_type: FeedType) -> &'static str {
    match feed_type {
        FeedType::Audio => "audio",
        FeedType::Video => "video",
        FeedType::Both => "both",
    }
}

fn row_to_channel(row: &sqlx::sqlite::SqliteRow) -> Result<Channel, AppError> {
    let id: String = row.try_get("id")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;
    let last_refresh_at: Option<String> = row.try_get("last_refresh_at")?;
    let feed_type: String = row.try_get("feed_type")?;

    Ok(Channel {
        id: Uuid::parse_str(&id).map_err(|e| AppError::ParseError(e.to_string()))?,
        url: row.try_get("url")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        thumbnail_url: row.try_get("thumbnail_url")?,
        enabled: row.try_get("enabled")?,
        feed_type: feed_type_from_str(&feed_type),
        episode_count_config: row.try_get("episode_count_config")?,
        last_refresh_at: last_refresh_at.map(|s| parse_datetime(&s)).transpose()?,
        created_at: parse_datetime(&created_at)?,
        updated_at: parse_datetime(&updated_at)?,
    })
}

impl Database {
    pub async fn create_channel(
        &self,
        url: &str,
        title: &str,
        description: &str,
        thumbnail_url: Option<&str>,
        feed_type: FeedType,
        episode_count_config: i64,
    ) -> Result<Channel, AppError> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO channels
             (id, url, title, description, thumbnail_url, enabled, feed_type,
              episode_count_config, last_refresh_at, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, 1, ?, ?, NULL, ?, ?)",
        )
        .bind(id.to_string())
        .bind(url)
        .bind(title)
        .bind(description)
        .bind(thumbnail_url)
        .bind(feed_type_to_str(feed_type))
        .bind(episode_count_config)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        self.get_channel(id).await
    }

    pub async fn get_channel(&self, id: Uuid) -> Result<Channel, AppError> {
        let row = sqlx::query("SELECT * FROM channels WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::not_found("channel", id.to_string()))?;
        row_to_channel(&row)
    }

    pub async fn find_channel(&self, id: Uuid) -> Result<Option<Channel>, AppError> {
        let row = sqlx::query("SELECT * FROM channels WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_channel).transpose()
    }

    pub async fn list_enabled_channels(&self) -> Result<Vec<Channel>, AppError> {
        let rows = sqlx::query("SELECT * FROM channels WHERE enabled = 1 ORDER BY title")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_channel).collect()
    }

    pub async fn update_channel_last_refresh(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        sqlx::query("UPDATE channels SET last_refresh_at = ?, updated_at = ? WHERE id = ?")
            .bind(at.to_rfc3339())
            .bind(at.to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
