//! Error type definitions for the ingestion/feed service.
//!
//! Mirrors the error kinds spec §7 lists by contract: each becomes a variant
//! here rather than a string, so callers can pattern-match instead of parsing
//! messages. State-machine violations are modelled as data (`InvalidState`),
//! never raised as exceptions-by-another-name.

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::QueueStatus;

/// Top-level application error type.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("database error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("{resource} not found: {id}")]
    NotFound { resource: &'static str, id: String },

    #[error("invalid queue transition: {item_id} is {current:?}, cannot {attempted}")]
    InvalidState {
        item_id: Uuid,
        current: QueueStatus,
        attempted: &'static str,
    },

    #[error("item {0} already has an active queue entry")]
    AlreadyQueued(Uuid),

    #[error("fetch failed: {0}")]
    FetchError(String),

    #[error("fetch timed out after {0:?}")]
    FetchTimeout(std::time::Duration),

    #[error("transcode failed: {0}")]
    TranscodeError(String),

    #[error("transcode timed out after {0:?}")]
    TranscodeTimeout(std::time::Duration),

    #[error("could not parse adapter output: {0}")]
    ParseError(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),

    #[error("coordinator has been disposed")]
    Disposed,

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl AppError {
    pub fn not_found(resource: &'static str, id: impl Into<String>) -> Self {
        AppError::NotFound {
            resource,
            id: id.into(),
        }
    }

    pub fn invalid_state(item_id: Uuid, current: QueueStatus, attempted: &'static str) -> Self {
        AppError::InvalidState {
            item_id,
            current,
            attempted,
        }
    }

    /// Best-effort classification of whether a pipeline-stage error should be
    /// retried through the queue's backoff table (spec §7 policy).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::FetchError(_)
                | AppError::FetchTimeout(_)
                | AppError::TranscodeError(_)
                | AppError::TranscodeTimeout(_)
                | AppError::Io(_)
        )
    }
}

/// A per-channel failure captured during a refresh or retention sweep so that
/// one channel's error never aborts the all-channels loop (spec §4.4, §4.5).
#[derive(Debug, Clone)]
pub struct ChannelFailure {
    pub channel_id: Uuid,
    pub message: String,
    pub at: DateTime<Utc>,
}
