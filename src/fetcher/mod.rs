//! Fetcher adapter (C2): enumerate a channel's items, probe one item's
//! metadata, and fetch one item's bytes to disk, all via an external
//! subprocess. The subprocess speaks newline-delimited JSON on stdout;
//! malformed lines are skipped with a warning rather than failing the whole
//! call (spec §6).

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::errors::AppError;
use crate::models::DiscoveredItem;

/// One line of `fetch` progress as reported by the external process.
#[derive(Debug, Clone)]
pub struct FetchProgress {
    pub status: String,
    pub percent: Option<f64>,
    pub bytes_per_second: Option<u64>,
    pub eta: Option<Duration>,
}

pub trait ProgressSink: Send + Sync {
    fn report(&self, progress: FetchProgress);
}

pub type SharedProgressSink = Arc<dyn ProgressSink>;

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgressSink;

impl ProgressSink for NoopProgressSink {
    fn report(&self, _progress: FetchProgress) {}
}

impl NoopProgressSink {
    pub fn shared() -> SharedProgressSink {
        Arc::new(Self)
    }
}

#[derive(Debug, Deserialize)]
struct RawItem {
    id: String,
    title: String,
    #[serde(default)]
    description: String,
    thumbnail: Option<String>,
    duration: Option<i64>,
    timestamp: Option<DateTime<Utc>>,
}

impl From<RawItem> for DiscoveredItem {
    fn from(raw: RawItem) -> Self {
        DiscoveredItem {
            video_id: raw.id,
            title: raw.title,
            description: raw.description,
            thumbnail_url: raw.thumbnail,
            duration_seconds: raw.duration,
            published_at: raw.timestamp,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawProgress {
    status: String,
    percent: Option<f64>,
    bytes_per_second: Option<u64>,
    eta_seconds: Option<u64>,
}

/// The C2 contract. Implementations must respect `cancel`: a cancelled token
/// observed mid-call returns [`AppError::Cancelled`], never a partial success.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn enumerate(
        &self,
        channel_url: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<DiscoveredItem>, AppError>;

    async fn probe(
        &self,
        item_url: &str,
        cancel: &CancellationToken,
    ) -> Result<DiscoveredItem, AppError>;

    async fn fetch(
        &self,
        item_url: &str,
        output_path: &Path,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, AppError>;
}

/// Drives an external binary (e.g. a `yt-dlp`-style tool) as a subprocess,
/// parsing its stdout as newline-delimited JSON.
pub struct ProcessFetcher {
    binary: String,
    probe_timeout: Duration,
    fetch_timeout: Duration,
    /// Grace period between sending a kill and giving up on the child
    /// (spec §5: "suggested 5s").
    kill_grace: Duration,
}

impl ProcessFetcher {
    pub fn new(binary: impl Into<String>, probe_timeout: Duration, fetch_timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            probe_timeout,
            fetch_timeout,
            kill_grace: Duration::from_secs(5),
        }
    }

    async fn run_json_lines(
        &self,
        args: &[&str],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, AppError> {
        let mut child = Command::new(&self.binary)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| AppError::FetchError(format!("spawn {} failed: {e}", self.binary)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::FetchError("child stdout not piped".to_string()))?;
        let mut lines = BufReader::new(stdout).lines();

        let mut collected = Vec::new();
        let run = async {
            while let Some(line) = lines
                .next_line()
                .await
                .map_err(|e| AppError::FetchError(e.to_string()))?
            {
                collected.push(line);
            }
            Ok::<(), AppError>(())
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                kill_with_grace(&mut child, self.kill_grace).await;
                return Err(AppError::Cancelled);
            }
            result = tokio::time::timeout(timeout, run) => {
                match result {
                    Err(_) => {
                        kill_with_grace(&mut child, self.kill_grace).await;
                        return Err(AppError::FetchTimeout(timeout));
                    }
                    Ok(Err(e)) => return Err(e),
                    Ok(Ok(())) => {}
                }
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| AppError::FetchError(e.to_string()))?;
        if !status.success() {
            return Err(AppError::FetchError(format!(
                "{} exited with {status}",
                self.binary
            )));
        }
        Ok(collected)
    }
}

async fn kill_with_grace(child: &mut tokio::process::Child, grace: Duration) {
    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        let _ = child.kill().await;
    }
}

fn parse_items(lines: &[String]) -> Vec<DiscoveredItem> {
    lines
        .iter()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() {
                return None;
            }
            match serde_json::from_str::<RawItem>(line) {
                Ok(raw) => Some(raw.into()),
                Err(e) => {
                    warn!(error = %e, "skipping malformed fetcher output line");
                    None
                }
            }
        })
        .collect()
}

#[async_trait]
impl Fetcher for ProcessFetcher {
    async fn enumerate(
        &self,
        channel_url: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<DiscoveredItem>, AppError> {
        let lines = self
            .run_json_lines(&["enumerate", channel_url], self.fetch_timeout, cancel)
            .await?;
        Ok(parse_items(&lines))
    }

    async fn probe(
        &self,
        item_url: &str,
        cancel: &CancellationToken,
    ) -> Result<DiscoveredItem, AppError> {
        let lines = self
            .run_json_lines(&["probe", item_url], self.probe_timeout, cancel)
            .await?;
        parse_items(&lines)
            .into_iter()
            .next()
            .ok_or_else(|| AppError::ParseError("probe produced no item".to_string()))
    }

    async fn fetch(
        &self,
        item_url: &str,
        output_path: &Path,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, AppError> {
        if let Some(parent) = output_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let output_str = output_path.to_string_lossy().to_string();
        let mut child = Command::new(&self.binary)
            .args(["fetch", item_url, "-o", &output_str])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| AppError::FetchError(format!("spawn {} failed: {e}", self.binary)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::FetchError("child stdout not piped".to_string()))?;
        let mut lines = BufReader::new(stdout).lines();

        let run = async {
            while let Some(line) = lines
                .next_line()
                .await
                .map_err(|e| AppError::FetchError(e.to_string()))?
            {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<RawProgress>(line) {
                    Ok(raw) => progress.report(FetchProgress {
                        status: raw.status,
                        percent: raw.percent,
                        bytes_per_second: raw.bytes_per_second,
                        eta: raw.eta_seconds.map(Duration::from_secs),
                    }),
                    Err(e) => warn!(error = %e, "skipping malformed progress line"),
                }
            }
            Ok::<(), AppError>(())
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                kill_with_grace(&mut child, self.kill_grace).await;
                return Err(AppError::Cancelled);
            }
            result = tokio::time::timeout(self.fetch_timeout, run) => {
                match result {
                    Err(_) => {
                        kill_with_grace(&mut child, self.kill_grace).await;
                        return Err(AppError::FetchTimeout(self.fetch_timeout));
                    }
                    Ok(Err(e)) => return Err(e),
                    Ok(Ok(())) => {}
                }
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| AppError::FetchError(e.to_string()))?;
        if !status.success() {
            return Err(AppError::FetchError(format!(
                "{} exited with {status}",
                self.binary
            )));
        }
        if !output_path.exists() {
            return Err(AppError::FetchError(
                "fetch reported success but output file is missing".to_string(),
            ));
        }
        Ok(output_path.to_path_buf())
    }
}

/// An in-process fake used by pipeline/scheduler tests so they never spawn
/// real subprocesses. Behaviour is scripted per-channel/per-item.
#[cfg(any(test, feature = "test-fakes"))]
pub mod fake {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    #[derive(Default)]
    pub struct FakeFetcher {
        pub channel_items: Mutex<HashMap<String, Vec<DiscoveredItem>>>,
        pub fetch_bytes: Mutex<HashMap<String, Vec<u8>>>,
        pub fail_fetch_for: Mutex<Option<String>>,
        pub fail_enumerate_for: Mutex<Option<String>>,
    }

    impl FakeFetcher {
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn seed_channel(&self, channel_url: &str, items: Vec<DiscoveredItem>) {
            self.channel_items
                .lock()
                .await
                .insert(channel_url.to_string(), items);
        }

        pub async fn seed_bytes(&self, item_url: &str, bytes: Vec<u8>) {
            self.fetch_bytes
                .lock()
                .await
                .insert(item_url.to_string(), bytes);
        }

        pub async fn fail_next_fetch_for(&self, item_url: &str) {
            *self.fail_fetch_for.lock().await = Some(item_url.to_string());
        }

        pub async fn fail_next_enumerate_for(&self, channel_url: &str) {
            *self.fail_enumerate_for.lock().await = Some(channel_url.to_string());
        }
    }

    #[async_trait]
    impl Fetcher for FakeFetcher {
        async fn enumerate(
            &self,
            channel_url: &str,
            _cancel: &CancellationToken,
        ) -> Result<Vec<DiscoveredItem>, AppError> {
            if self.fail_enumerate_for.lock().await.take().as_deref() == Some(channel_url) {
                return Err(AppError::FetchError("scripted enumerate failure".to_string()));
            }
            Ok(self
                .channel_items
                .lock()
                .await
                .get(channel_url)
                .cloned()
                .unwrap_or_default())
        }

        async fn probe(
            &self,
            item_url: &str,
            cancel: &CancellationToken,
        ) -> Result<DiscoveredItem, AppError> {
            let all = self.enumerate(item_url, cancel).await?;
            all.into_iter()
                .next()
                .ok_or_else(|| AppError::ParseError("no item".to_string()))
        }

        async fn fetch(
            &self,
            item_url: &str,
            output_path: &Path,
            progress: &dyn ProgressSink,
            _cancel: &CancellationToken,
        ) -> Result<PathBuf, AppError> {
            if self.fail_fetch_for.lock().await.take().as_deref() == Some(item_url) {
                return Err(AppError::FetchError("scripted failure".to_string()));
            }
            progress.report(FetchProgress {
                status: "downloading".to_string(),
                percent: Some(100.0),
                bytes_per_second: None,
                eta: None,
            });
            let bytes = self
                .fetch_bytes
                .lock()
                .await
                .get(item_url)
                .cloned()
                .unwrap_or_else(|| b"fake-media-bytes".to_vec());
            if let Some(parent) = output_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(output_path, &bytes).await?;
            Ok(output_path.to_path_buf())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeFetcher;
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn fake_fetcher_enumerate_returns_seeded_items() {
        let fetcher = FakeFetcher::new();
        fetcher
            .seed_channel(
                "https://chan",
                vec![DiscoveredItem {
                    video_id: "v1".to_string(),
                    title: "T".to_string(),
                    description: "D".to_string(),
                    thumbnail_url: None,
                    duration_seconds: Some(10),
                    published_at: None,
                }],
            )
            .await;

        let cancel = CancellationToken::new();
        let items = fetcher.enumerate("https://chan", &cancel).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].video_id, "v1");
    }

    #[tokio::test]
    async fn fake_fetcher_writes_output_file() {
        let fetcher = FakeFetcher::new();
        let dir = tempdir().unwrap();
        let out = dir.path().join("v1.tmp");
        let cancel = CancellationToken::new();
        let sink = NoopProgressSink;

        let result = fetcher.fetch("https://item", &out, &sink, &cancel).await.unwrap();
        assert_eq!(result, out);
        assert!(out.exists());
    }

    #[tokio::test]
    async fn fake_fetcher_honours_scripted_failure() {
        let fetcher = FakeFetcher::new();
        let dir = tempdir().unwrap();
        let out = dir.path().join("v1.tmp");
        fetcher.fail_next_fetch_for("https://item").await;

        let cancel = CancellationToken::new();
        let sink = NoopProgressSink;
        let err = fetcher
            .fetch("https://item", &out, &sink, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::FetchError(_)));
    }
}
