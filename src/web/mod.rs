//! Thin web surface (C15): `axum` routes that forward to C9 (through C10)
//! and serve static media from disk. No business logic lives here — every
//! handler is a lookup-and-render call into a collaborator built in `main`
//! (spec §6 "Served HTTP surface").

pub mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::cache::FeedCache;
use crate::config::Config;
use crate::feed::FeedGenerator;

#[derive(Clone)]
pub struct AppState {
    pub feed_generator: Arc<FeedGenerator>,
    pub feed_cache: Arc<FeedCache>,
}

pub struct WebServer {
    app: Router,
    addr: SocketAddr,
}

impl WebServer {
    pub fn new(config: &Config, feed_generator: Arc<FeedGenerator>, feed_cache: Arc<FeedCache>) -> Result<Self> {
        let state = AppState {
            feed_generator,
            feed_cache,
        };
        let app = Self::create_router(state, &config.storage.download_dir);
        let addr: SocketAddr = format!("{}:{}", config.web.host, config.web.port).parse()?;
        Ok(Self { app, addr })
    }

    fn create_router(state: AppState, download_dir: &std::path::Path) -> Router {
        Router::new()
            .route("/health", get(handlers::health))
            .route("/feed/combined/:variant", get(handlers::combined_feed))
            .route("/feed/:channel_id/:variant", get(handlers::channel_feed))
            .nest_service("/feeds", ServeDir::new(download_dir))
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    pub async fn serve(self) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(&self.addr).await?;
        axum::serve(listener, self.app).await?;
        Ok(())
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}
