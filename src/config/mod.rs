//! Layered configuration: a `Default` impl seeds a config file on first run,
//! `Config::load` reads it back, and CLI flags (see `main.rs`) override
//! individual fields afterwards. Same shape this service has always used.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub web: WebConfig,
    pub storage: StorageConfig,
    pub ingestion: IngestionConfig,
    pub transcode: TranscodeConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    pub host: String,
    pub port: u16,
    /// Scheme+host used in enclosure URLs; defaults to `http://localhost`.
    pub base_url: String,
    /// URL prefix added between `base_url` and the relative media path.
    pub feed_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub download_dir: PathBuf,
    pub temp_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionConfig {
    pub max_concurrent_downloads: usize,
    pub refresh_interval_secs: u64,
    pub retention_interval_secs: u64,
    pub run_immediately_on_start: bool,
    pub fetch_timeout_secs: u64,
    pub transcode_timeout_secs: u64,
    pub probe_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscodeConfig {
    pub audio_format: String,
    pub audio_bitrate_kbps: u32,
    pub audio_sample_rate_hz: u32,
    pub video_format: String,
    pub video_codec: VideoCodec,
    pub video_quality: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    H264,
    H265,
    Vp9,
    Av1,
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            audio_format: "mp3".to_string(),
            audio_bitrate_kbps: 128,
            audio_sample_rate_hz: 44_100,
            video_format: "mp4".to_string(),
            video_codec: VideoCodec::H264,
            video_quality: "medium".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub console: bool,
    pub file: Option<PathBuf>,
    pub rolling_interval: RollingInterval,
    pub retained_files: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RollingInterval {
    Daily,
    Hourly,
    Never,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://./castrelay.db".to_string(),
                max_connections: 10,
            },
            web: WebConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
                base_url: "http://localhost".to_string(),
                feed_path: "/feeds".to_string(),
            },
            storage: StorageConfig {
                download_dir: PathBuf::from("./data/media"),
                temp_dir: PathBuf::from("./data/tmp"),
            },
            ingestion: IngestionConfig {
                max_concurrent_downloads: 3,
                refresh_interval_secs: 3600,
                retention_interval_secs: 1800,
                run_immediately_on_start: true,
                fetch_timeout_secs: 1800,
                transcode_timeout_secs: 3600,
                probe_timeout_secs: 300,
            },
            transcode: TranscodeConfig {
                audio_format: "mp3".to_string(),
                audio_bitrate_kbps: 128,
                audio_sample_rate_hz: 44_100,
                video_format: "mp4".to_string(),
                video_codec: VideoCodec::H264,
                video_quality: "medium".to_string(),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                console: true,
                file: None,
                rolling_interval: RollingInterval::Daily,
                retained_files: 7,
            },
        }
    }
}

impl Config {
    /// Load configuration from the path named by the `CONFIG_FILE` env var
    /// (defaulting to `config.toml`). If the file does not exist, a default
    /// configuration is written out and returned, and the storage directories
    /// it names are created so the service can start cold.
    pub fn load() -> Result<Self> {
        let config_file =
            std::env::var("CONFIG_FILE").unwrap_or_else(|_| "config.toml".to_string());

        if std::path::Path::new(&config_file).exists() {
            let contents = std::fs::read_to_string(&config_file)?;
            Ok(toml::from_str(&contents)?)
        } else {
            let default_config = Self::default();
            let contents = toml::to_string_pretty(&default_config)?;
            std::fs::create_dir_all(&default_config.storage.download_dir)?;
            std::fs::create_dir_all(&default_config.storage.temp_dir)?;
            std::fs::write(&config_file, contents)?;
            Ok(default_config)
        }
    }

    pub fn max_concurrent_downloads(&self) -> usize {
        self.ingestion.max_concurrent_downloads.max(1)
    }
}
