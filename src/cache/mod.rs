//! Feed cache (C10): a TTL-keyed in-memory map of rendered feed bytes, with
//! per-entry sliding refresh and channel-scoped invalidation (spec §4.7).

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::models::FeedArtifact;

const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);
const SLIDING_REFRESH: Duration = Duration::from_secs(2 * 60);

struct Entry {
    value: FeedArtifact,
    expires_at: Instant,
}

pub struct FeedCache {
    entries: Mutex<HashMap<String, Entry>>,
    /// Tracked separately so `invalidate_all` can enumerate keys even though
    /// `HashMap` itself would let us — kept explicit per spec §4.7's
    /// constraint that the backing store need not expose enumeration.
    known_keys: Mutex<HashSet<String>>,
}

impl FeedCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            known_keys: Mutex::new(HashSet::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<FeedArtifact> {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        let now = Instant::now();
        match entries.get_mut(key) {
            Some(entry) if entry.expires_at > now => {
                entry.expires_at = now + SLIDING_REFRESH.max(entry.expires_at - now);
                Some(entry.value.clone())
            }
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn set(&self, key: impl Into<String>, value: FeedArtifact, ttl: Duration) {
        let key = key.into();
        self.known_keys
            .lock()
            .expect("cache lock poisoned")
            .insert(key.clone());
        self.entries.lock().expect("cache lock poisoned").insert(
            key,
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Fetch-or-compute. Does not serialize concurrent callers for the same
    /// key; under a race, `factory` may run more than once and the last
    /// writer wins (spec §4.7 explicitly allows this).
    pub async fn get_or_create<F, Fut>(&self, key: &str, factory: F) -> Result<FeedArtifact, crate::errors::AppError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<FeedArtifact, crate::errors::AppError>>,
    {
        if let Some(cached) = self.get(key) {
            return Ok(cached);
        }
        let value = factory().await?;
        self.set(key, value.clone(), DEFAULT_TTL);
        Ok(value)
    }

    pub fn invalidate_channel(&self, channel_id: uuid::Uuid) {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        for suffix in ["audio", "video", "audio:atom", "video:atom"] {
            let key = format!("{channel_id}:{suffix}");
            entries.remove(&key);
        }
    }

    pub fn invalidate_all(&self) {
        let keys: Vec<String> = self
            .known_keys
            .lock()
            .expect("cache lock poisoned")
            .iter()
            .cloned()
            .collect();
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        for key in keys {
            entries.remove(&key);
        }
    }
}

impl Default for FeedCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn artifact(tag: &str) -> FeedArtifact {
        FeedArtifact {
            bytes: tag.as_bytes().to_vec(),
            etag: tag.to_string(),
            last_modified: Utc::now(),
        }
    }

    #[test]
    fn set_then_get_returns_the_value() {
        let cache = FeedCache::new();
        cache.set("k", artifact("v1"), Duration::from_secs(60));
        assert_eq!(cache.get("k").unwrap().etag, "v1");
    }

    #[test]
    fn expired_entry_is_not_returned() {
        let cache = FeedCache::new();
        cache.set("k", artifact("v1"), Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn invalidate_channel_removes_only_that_channel() {
        let cache = FeedCache::new();
        let channel_id = uuid::Uuid::new_v4();
        cache.set(format!("{channel_id}:audio"), artifact("a"), Duration::from_secs(60));
        cache.set(format!("{channel_id}:video"), artifact("v"), Duration::from_secs(60));
        cache.set("combined:audio", artifact("c"), Duration::from_secs(60));

        cache.invalidate_channel(channel_id);

        assert!(cache.get(&format!("{channel_id}:audio")).is_none());
        assert!(cache.get(&format!("{channel_id}:video")).is_none());
        assert!(cache.get("combined:audio").is_some(), "combined feeds untouched");
    }

    #[test]
    fn invalidate_channel_also_clears_atom_variants() {
        let cache = FeedCache::new();
        let channel_id = uuid::Uuid::new_v4();
        cache.set(format!("{channel_id}:audio:atom"), artifact("a"), Duration::from_secs(60));
        cache.set(format!("{channel_id}:video:atom"), artifact("v"), Duration::from_secs(60));

        cache.invalidate_channel(channel_id);

        assert!(cache.get(&format!("{channel_id}:audio:atom")).is_none());
        assert!(cache.get(&format!("{channel_id}:video:atom")).is_none());
    }

    #[test]
    fn invalidate_all_clears_every_tracked_key() {
        let cache = FeedCache::new();
        cache.set("a", artifact("a"), Duration::from_secs(60));
        cache.set("b", artifact("b"), Duration::from_secs(60));
        cache.invalidate_all();
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_none());
    }

    #[tokio::test]
    async fn get_or_create_only_invokes_factory_on_miss() {
        let cache = FeedCache::new();
        let calls = std::sync::atomic::AtomicUsize::new(0);

        for _ in 0..3 {
            cache
                .get_or_create("k", || {
                    calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    async { Ok(artifact("v1")) }
                })
                .await
                .unwrap();
        }

        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
