use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use uuid::Uuid;

use crate::errors::AppError;
use crate::feed::FeedFormat;
use crate::models::{FeedArtifact, FeedType};

use super::AppState;

pub async fn health() -> &'static str {
    "ok"
}

pub async fn channel_feed(
    Path((channel_id, variant)): Path<(String, String)>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response {
    let channel_id = match Uuid::parse_str(&channel_id) {
        Ok(id) => id,
        Err(_) => return status_response(StatusCode::NOT_FOUND, "channel not found"),
    };
    let (feed_type, format) = match parse_variant(&variant) {
        Some(parsed) => parsed,
        None => return status_response(StatusCode::NOT_FOUND, "unknown feed variant"),
    };

    let key = cache_key(&channel_id.to_string(), feed_type, format);
    let generator = state.feed_generator.clone();
    let result = state
        .feed_cache
        .get_or_create(&key, || async move {
            match generator.channel_feed(channel_id, feed_type, format).await? {
                Some(artifact) => Ok(artifact),
                None => Err(AppError::not_found("channel", channel_id.to_string())),
            }
        })
        .await;

    render_artifact(result, format, &headers)
}

pub async fn combined_feed(
    Path(variant): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response {
    let (feed_type, format) = match parse_variant(&variant) {
        Some(parsed) => parsed,
        None => return status_response(StatusCode::NOT_FOUND, "unknown feed variant"),
    };

    let key = cache_key("combined", feed_type, format);
    let generator = state.feed_generator.clone();
    let result = state
        .feed_cache
        .get_or_create(&key, || async move { generator.combined_feed(feed_type, format).await })
        .await;

    render_artifact(result, format, &headers)
}

fn render_artifact(result: Result<FeedArtifact, AppError>, format: FeedFormat, headers: &HeaderMap) -> Response {
    let artifact = match result {
        Ok(artifact) => artifact,
        Err(e) => return error_response(&e),
    };

    let quoted_etag = format!("\"{}\"", artifact.etag);
    if if_none_match_satisfied(headers, &quoted_etag) {
        return Response::builder()
            .status(StatusCode::NOT_MODIFIED)
            .header(header::ETAG, quoted_etag)
            .body(Body::empty())
            .expect("static response is well-formed");
    }

    let content_type = match format {
        FeedFormat::Rss => "application/rss+xml; charset=utf-8",
        FeedFormat::Atom => "application/atom+xml; charset=utf-8",
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::ETAG, quoted_etag)
        .header(header::LAST_MODIFIED, artifact.last_modified.to_rfc2822())
        .body(Body::from(artifact.bytes))
        .expect("static response is well-formed")
}

fn if_none_match_satisfied(headers: &HeaderMap, quoted_etag: &str) -> bool {
    headers
        .get(header::IF_NONE_MATCH)
        .and_then(|value| value.to_str().ok())
        .map(|value| value == quoted_etag || value == "*")
        .unwrap_or(false)
}

fn error_response(error: &AppError) -> Response {
    let status = match error {
        AppError::NotFound { .. } => StatusCode::NOT_FOUND,
        AppError::AlreadyQueued(_) | AppError::InvalidState { .. } => StatusCode::CONFLICT,
        AppError::Storage(_) | AppError::Migration(_) | AppError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    status_response(status, &error.to_string())
}

fn status_response(status: StatusCode, message: &str) -> Response {
    (status, message.to_string()).into_response()
}

/// `"audio"`, `"video"`, or either suffixed with `.atom` (spec §6).
fn parse_variant(variant: &str) -> Option<(FeedType, FeedFormat)> {
    let (base, format) = match variant.strip_suffix(".atom") {
        Some(base) => (base, FeedFormat::Atom),
        None => (variant, FeedFormat::Rss),
    };
    let feed_type = match base {
        "audio" => FeedType::Audio,
        "video" => FeedType::Video,
        _ => return None,
    };
    Some((feed_type, format))
}

fn cache_key(scope: &str, feed_type: FeedType, format: FeedFormat) -> String {
    let variant = match feed_type {
        FeedType::Audio => "audio",
        FeedType::Video => "video",
        FeedType::Both => "audio",
    };
    match format {
        FeedFormat::Rss => format!("{scope}:{variant}"),
        FeedFormat::Atom => format!("{scope}:{variant}:atom"),
    }
}
