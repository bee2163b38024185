// arr-api: Upstream media-automation API surface.
//
// Wire models for the stable field subset the orchestrator consumes,
// typed error classification at the HTTP boundary, and the reqwest-backed
// client for the three dialects (tv-sonarr, movie-radarr, tv-whisparr).

pub mod client;
pub mod error;
pub mod http;
pub mod models;

pub use client::{SearchCommand, UpstreamClient};
pub use error::UpstreamError;
pub use http::HttpUpstreamClient;
pub use models::{
    CommandResource, Dialect, EpisodeResource, MovieResource, SeasonResource, SeriesResource,
    SystemStatusResource,
};
