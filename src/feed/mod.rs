//! Feed generator (C9): builds RSS 2.0 (with the iTunes podcast extension)
//! and Atom 1.0 documents from completed items, with a content-addressed
//! ETag (spec §4.6). Two thin builder submodules share the selection,
//! ordering, and enclosure-URL conventions defined here.

mod atom;
mod rss;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::config::WebConfig;
use crate::database::Database;
use crate::errors::AppError;
use crate::models::{Channel, FeedArtifact, FeedType, Item};

const COMBINED_CHANNEL_ID: &str = "combined";
const COMBINED_TITLE: &str = "All Channels";
const COMBINED_DESCRIPTION: &str = "Combined feed from all channels";
/// Per-channel cap when assembling the combined feed (spec §4.6).
const COMBINED_PER_CHANNEL_CAP: usize = 100;
/// Overall cap on the combined feed after re-ordering (spec §4.6).
const COMBINED_TOTAL_CAP: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedFormat {
    Rss,
    Atom,
}

/// Rendering input shared by both builders; decouples feed XML from the
/// persisted `Channel` row so the combined feed can synthesize one.
struct FeedChannelMeta {
    id: String,
    title: String,
    description: String,
    thumbnail_url: Option<String>,
    link: String,
    updated_at: DateTime<Utc>,
}

impl From<&Channel> for FeedChannelMeta {
    fn from(channel: &Channel) -> Self {
        Self {
            id: channel.id.to_string(),
            title: channel.title.clone(),
            description: channel.description.clone(),
            thumbnail_url: channel.thumbnail_url.clone(),
            link: channel.url.clone(),
            updated_at: channel.updated_at,
        }
    }
}

pub struct FeedGenerator {
    db: Database,
    base_url: String,
    feed_path: String,
}

impl FeedGenerator {
    pub fn new(db: Database, web: &WebConfig) -> Self {
        Self {
            db,
            base_url: web.base_url.clone(),
            feed_path: web.feed_path.clone(),
        }
    }

    fn media_base(&self) -> String {
        media_base(&self.base_url, &self.feed_path)
    }

    /// Builds the feed for a single channel. Returns `None` if the channel
    /// does not exist (spec §4.6: "Returns null if channel missing").
    pub async fn channel_feed(
        &self,
        channel_id: Uuid,
        feed_type: FeedType,
        format: FeedFormat,
    ) -> Result<Option<FeedArtifact>, AppError> {
        let channel = match self.db.find_channel(channel_id).await? {
            Some(channel) => channel,
            None => return Ok(None),
        };

        let mut items = self.db.list_completed_items_for_channel(channel.id).await?;
        items.retain(|item| item.satisfies_feed_type(feed_type));
        items.truncate(channel.effective_episode_count() as usize);

        let meta = FeedChannelMeta::from(&channel);
        let bytes = self.render(&meta, &items, feed_type, format);
        Ok(Some(artifact_from_bytes(bytes)))
    }

    /// Aggregates up to 100 completed items across every enabled channel,
    /// re-ordered by `published_at desc` (nulls last) (spec §4.6).
    pub async fn combined_feed(
        &self,
        feed_type: FeedType,
        format: FeedFormat,
    ) -> Result<FeedArtifact, AppError> {
        let channels = self.db.list_enabled_channels().await?;

        let mut items: Vec<Item> = Vec::new();
        for channel in &channels {
            let mut channel_items = self.db.list_completed_items_for_channel(channel.id).await?;
            channel_items.retain(|item| item.satisfies_feed_type(feed_type));
            channel_items.truncate(COMBINED_PER_CHANNEL_CAP);
            items.extend(channel_items);
        }

        items.sort_by(|a, b| match (a.published_at, b.published_at) {
            (Some(a), Some(b)) => b.cmp(&a),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        });
        items.truncate(COMBINED_TOTAL_CAP);

        let meta = FeedChannelMeta {
            id: COMBINED_CHANNEL_ID.to_string(),
            title: COMBINED_TITLE.to_string(),
            description: COMBINED_DESCRIPTION.to_string(),
            thumbnail_url: None,
            link: self.base_url.clone(),
            updated_at: Utc::now(),
        };

        let bytes = self.render(&meta, &items, feed_type, format);
        Ok(artifact_from_bytes(bytes))
    }

    fn render(
        &self,
        meta: &FeedChannelMeta,
        items: &[Item],
        feed_type: FeedType,
        format: FeedFormat,
    ) -> Vec<u8> {
        let media_base = self.media_base();
        match format {
            FeedFormat::Rss => rss::build(meta, items, feed_type, &media_base),
            FeedFormat::Atom => atom::build(
                meta,
                items,
                feed_type,
                &media_base,
                &self.feed_self_url(&meta.id, feed_type),
                None,
            ),
        }
    }

    fn feed_self_url(&self, channel_id: &str, feed_type: FeedType) -> String {
        let suffix = match feed_type {
            FeedType::Audio => "audio",
            FeedType::Video => "video",
            FeedType::Both => "audio",
        };
        format!("{}/{}/{}.atom", self.media_base(), channel_id, suffix)
    }
}

fn artifact_from_bytes(bytes: Vec<u8>) -> FeedArtifact {
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let etag = format!("{:x}", hasher.finalize());
    FeedArtifact {
        bytes,
        etag,
        last_modified: Utc::now(),
    }
}

fn media_base(base_url: &str, feed_path: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let feed_path = feed_path.trim_matches('/');
    if feed_path.is_empty() {
        base.to_string()
    } else {
        format!("{base}/{feed_path}")
    }
}

fn enclosure_url(media_base: &str, relative_path: &str) -> String {
    format!("{media_base}/{}", relative_path.trim_start_matches('/'))
}

fn mime_type_for_path(path: &str) -> &'static str {
    let ext = std::path::Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "aac" => "audio/aac",
        "ogg" => "audio/ogg",
        "mp4" | "m4v" => "video/mp4",
        "webm" => "video/webm",
        _ => "application/octet-stream",
    }
}

/// For `FeedType::Both`, prefers the audio enclosure; falls back to video.
fn choose_enclosure(item: &Item, feed_type: FeedType) -> Option<(&str, i64)> {
    match feed_type {
        FeedType::Audio => item
            .file_path_audio
            .as_deref()
            .zip(item.file_size_audio),
        FeedType::Video => item
            .file_path_video
            .as_deref()
            .zip(item.file_size_video),
        FeedType::Both => item
            .file_path_audio
            .as_deref()
            .zip(item.file_size_audio)
            .or_else(|| item.file_path_video.as_deref().zip(item.file_size_video)),
    }
}

/// Lowercase alphanumeric-only distillation of a title, used to synthesize
/// an iTunes owner email address (spec §4.6). Falls back to "podcast" when
/// the title has no alphanumeric characters at all.
fn synthesize_email(title: &str) -> String {
    let local: String = title
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect();
    let local = if local.is_empty() { "podcast".to_string() } else { local };
    format!("{local}@example.com")
}

/// `H:MM:SS` for durations of an hour or more, else `M:SS`; negative or
/// missing durations render as `0:00` (spec §4.6).
fn itunes_duration(seconds: Option<i64>) -> String {
    let seconds = match seconds {
        Some(s) if s > 0 => s,
        _ => return "0:00".to_string(),
    };
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;
    if hours >= 1 {
        format!("{hours}:{minutes:02}:{secs:02}")
    } else {
        format!("{minutes}:{secs:02}")
    }
}

fn watch_url(video_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={video_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DiscoveredItem, ItemStatus};

    async fn channel_with_items(feed_type: FeedType) -> (FeedGenerator, Channel, Database) {
        let db = Database::connect_in_memory().await.unwrap();
        let channel = db
            .create_channel("https://chan", "My Show!", "desc", None, feed_type, 50)
            .await
            .unwrap();

        let item = db
            .create_item(
                channel.id,
                &DiscoveredItem {
                    video_id: "v1".to_string(),
                    title: "Episode One".to_string(),
                    description: "First episode".to_string(),
                    thumbnail_url: None,
                    duration_seconds: Some(3725),
                    published_at: Some(Utc::now()),
                },
            )
            .await
            .unwrap();
        db.set_item_artifacts(item.id, Some("c/audio/v1.mp3"), Some(1000), None, None)
            .await
            .unwrap();
        db.set_item_status(item.id, ItemStatus::Completed).await.unwrap();

        let web = WebConfig {
            host: "0.0.0.0".to_string(),
            port: 8080,
            base_url: "http://example.com/".to_string(),
            feed_path: "/feeds/".to_string(),
        };
        (FeedGenerator::new(db.clone(), &web), channel, db)
    }

    #[tokio::test]
    async fn missing_channel_returns_none() {
        let db = Database::connect_in_memory().await.unwrap();
        let web = WebConfig {
            host: "0.0.0.0".to_string(),
            port: 8080,
            base_url: "http://x".to_string(),
            feed_path: "/feeds".to_string(),
        };
        let generator = FeedGenerator::new(db, &web);
        let result = generator
            .channel_feed(Uuid::new_v4(), FeedType::Audio, FeedFormat::Rss)
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn rss_feed_contains_expected_enclosure_and_escaping() {
        let (generator, channel, _db) = channel_with_items(FeedType::Audio).await;
        let artifact = generator
            .channel_feed(channel.id, FeedType::Audio, FeedFormat::Rss)
            .await
            .unwrap()
            .unwrap();

        let xml = String::from_utf8(artifact.bytes).unwrap();
        assert!(xml.contains("<rss version=\"2.0\""));
        assert!(xml.contains("http://example.com/feeds/c/audio/v1.mp3"));
        assert!(xml.contains("audio/mpeg"));
        assert!(xml.contains("<itunes:duration>1:02:05</itunes:duration>"));
        assert_eq!(artifact.etag.len(), 64, "sha256 hex digest is 64 chars");
    }

    #[tokio::test]
    async fn atom_feed_has_enclosure_link_and_entry() {
        let (generator, channel, _db) = channel_with_items(FeedType::Audio).await;
        let artifact = generator
            .channel_feed(channel.id, FeedType::Audio, FeedFormat::Atom)
            .await
            .unwrap()
            .unwrap();

        let xml = String::from_utf8(artifact.bytes).unwrap();
        assert!(xml.contains("xmlns=\"http://www.w3.org/2005/Atom\""));
        assert!(xml.contains("rel=\"enclosure\""));
        assert!(xml.contains("yt:v1"));

        let updated_line = xml
            .lines()
            .find(|line| line.trim_start().starts_with("<updated>"))
            .expect("feed has an <updated> element");
        let value = updated_line
            .trim()
            .trim_start_matches("<updated>")
            .trim_end_matches("</updated>");
        assert!(value.ends_with('Z'), "expected Z-terminated timestamp, got {value}");
    }

    #[tokio::test]
    async fn video_only_item_excluded_from_audio_feed() {
        let db = Database::connect_in_memory().await.unwrap();
        let channel = db
            .create_channel("https://chan", "Show", "desc", None, FeedType::Both, 50)
            .await
            .unwrap();
        let item = db
            .create_item(
                channel.id,
                &DiscoveredItem {
                    video_id: "v2".to_string(),
                    title: "Video only".to_string(),
                    description: "d".to_string(),
                    thumbnail_url: None,
                    duration_seconds: Some(60),
                    published_at: Some(Utc::now()),
                },
            )
            .await
            .unwrap();
        db.set_item_artifacts(item.id, None, None, Some("c/video/v2.mp4"), Some(2000))
            .await
            .unwrap();
        db.set_item_status(item.id, ItemStatus::Completed).await.unwrap();

        let web = WebConfig {
            host: "0.0.0.0".to_string(),
            port: 8080,
            base_url: "http://x".to_string(),
            feed_path: "/feeds".to_string(),
        };
        let generator = FeedGenerator::new(db, &web);
        let artifact = generator
            .channel_feed(channel.id, FeedType::Audio, FeedFormat::Rss)
            .await
            .unwrap()
            .unwrap();
        let xml = String::from_utf8(artifact.bytes).unwrap();
        assert!(!xml.contains("v2"), "video-only item must not appear in an audio feed");
    }

    #[test]
    fn media_base_handles_trailing_and_leading_slashes() {
        assert_eq!(media_base("http://x/", "/feeds/"), "http://x/feeds");
        assert_eq!(media_base("http://x", ""), "http://x");
    }

    #[test]
    fn itunes_duration_formats_hours_minutes_and_guards_negative() {
        assert_eq!(itunes_duration(Some(3725)), "1:02:05");
        assert_eq!(itunes_duration(Some(65)), "1:05");
        assert_eq!(itunes_duration(Some(-5)), "0:00");
        assert_eq!(itunes_duration(None), "0:00");
    }

    #[test]
    fn synthesize_email_strips_non_alphanumeric_and_lowercases() {
        assert_eq!(synthesize_email("My Show!"), "myshow@example.com");
        assert_eq!(synthesize_email("???"), "podcast@example.com");
    }
}
