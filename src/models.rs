//! Core data model shared across persistence, the pipeline, and feed generation.
//!
//! Channels and items are stored with only a child -> parent foreign key
//! (`Item::channel_id`); nothing here carries a back-reference to avoid baking
//! the natural Channel <-> Item cycle into ownership (see DESIGN.md).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which artifacts a channel wants produced, and which enclosures its feed carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum FeedType {
    Audio,
    Video,
    Both,
}

impl FeedType {
    pub fn wants_audio(self) -> bool {
        matches!(self, FeedType::Audio | FeedType::Both)
    }

    pub fn wants_video(self) -> bool {
        matches!(self, FeedType::Video | FeedType::Both)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "PascalCase")]
#[serde(rename_all = "PascalCase")]
pub enum ItemStatus {
    Pending,
    Downloading,
    Processing,
    Completed,
    Failed,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "PascalCase")]
#[serde(rename_all = "PascalCase")]
pub enum QueueStatus {
    Pending,
    InProgress,
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

impl QueueStatus {
    /// Non-terminal statuses block a second `enqueue` for the same item.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            QueueStatus::Pending | QueueStatus::InProgress | QueueStatus::Retrying
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Channel {
    pub id: Uuid,
    pub url: String,
    pub title: String,
    pub description: String,
    pub thumbnail_url: Option<String>,
    pub enabled: bool,
    pub feed_type: FeedType,
    pub episode_count_config: i64,
    pub last_refresh_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Channel {
    /// `episode_count_config` coerced to the feed-generation default of 50
    /// whenever the configured value is zero or negative (spec §3).
    pub fn effective_episode_count(&self) -> i64 {
        if self.episode_count_config <= 0 {
            50
        } else {
            self.episode_count_config
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Item {
    pub id: Uuid,
    pub channel_id: Uuid,
    pub video_id: String,
    pub title: String,
    pub description: String,
    pub thumbnail_url: Option<String>,
    pub duration_seconds: Option<i64>,
    pub published_at: Option<DateTime<Utc>>,
    pub status: ItemStatus,
    pub file_path_audio: Option<String>,
    pub file_size_audio: Option<i64>,
    pub file_path_video: Option<String>,
    pub file_size_video: Option<i64>,
    pub downloaded_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Item {
    pub fn has_audio(&self) -> bool {
        self.file_path_audio.is_some() && self.file_size_audio.is_some()
    }

    pub fn has_video(&self) -> bool {
        self.file_path_video.is_some() && self.file_size_video.is_some()
    }

    /// Whether this item qualifies for inclusion in a feed of the given type
    /// (spec §4.6 "Filtering per feed type").
    pub fn satisfies_feed_type(&self, feed_type: FeedType) -> bool {
        match feed_type {
            FeedType::Audio => self.has_audio(),
            FeedType::Video => self.has_video(),
            FeedType::Both => self.has_audio() || self.has_video(),
        }
    }
}

/// A freshly-discovered item awaiting insertion, as reported by the fetcher's
/// `enumerate` call (spec §6, C2 contract).
#[derive(Debug, Clone)]
pub struct DiscoveredItem {
    pub video_id: String,
    pub title: String,
    pub description: String,
    pub thumbnail_url: Option<String>,
    pub duration_seconds: Option<i64>,
    pub published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct QueueEntry {
    pub id: Uuid,
    pub item_id: Uuid,
    pub priority: i64,
    pub status: QueueStatus,
    pub attempts: i64,
    pub max_attempts: i64,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub const DEFAULT_PRIORITY: i64 = 5;
pub const DEFAULT_MAX_ATTEMPTS: i64 = 5;

/// Clamp a caller-supplied priority into the valid `[1, 10]` range (spec §4.2).
pub fn clamp_priority(priority: i64) -> i64 {
    priority.clamp(1, 10)
}

/// Transient, never persisted: the rendered bytes of a feed plus the
/// content-addressed identifiers an HTTP layer needs for caching (spec §3).
#[derive(Debug, Clone)]
pub struct FeedArtifact {
    pub bytes: Vec<u8>,
    pub etag: String,
    pub last_modified: DateTime<Utc>,
}
