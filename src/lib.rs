//! Ingests remote video channels, transcodes newly discovered items, and
//! republishes completed episodes as podcast RSS/Atom feeds.
//!
//! Module map mirrors the component boundaries this service is built from:
//! persistence (`database`, `models`), the queue state machine (`queue`),
//! the ingestion pipeline and its worker pool (`pipeline`), scheduled
//! background work (`scheduler`, `retention`), feed rendering and caching
//! (`feed`, `cache`), and the ambient stack (`config`, `errors`, `metrics`,
//! `events`, `web`).

pub mod cache;
pub mod concurrency;
pub mod config;
pub mod database;
pub mod errors;
pub mod events;
pub mod feed;
pub mod fetcher;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod pipeline;
pub mod queue;
pub mod retention;
pub mod scheduler;
pub mod transcoder;
pub mod web;
