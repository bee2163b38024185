//! The client trait the orchestrator consumes.
//!
//! The sync engine and dispatcher hold `Arc<dyn UpstreamClient>`; the
//! production implementation is [`crate::http::HttpUpstreamClient`] and
//! tests substitute scripted fakes.

use async_trait::async_trait;

use crate::error::UpstreamError;
use crate::models::{
    CommandResource, EpisodeResource, MovieResource, SeriesResource, SystemStatusResource,
};

/// A search command to issue against an upstream.
///
/// TV dialects accept episode, season-pack, and whole-series searches;
/// the movie dialect accepts movie searches only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchCommand {
    EpisodeSearch { episode_ids: Vec<i64> },
    SeasonSearch { series_id: i64, season_number: i64 },
    SeriesSearch { series_id: i64 },
    MoviesSearch { movie_ids: Vec<i64> },
}

impl SearchCommand {
    /// Upstream command name on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            SearchCommand::EpisodeSearch { .. } => "EpisodeSearch",
            SearchCommand::SeasonSearch { .. } => "SeasonSearch",
            SearchCommand::SeriesSearch { .. } => "SeriesSearch",
            SearchCommand::MoviesSearch { .. } => "MoviesSearch",
        }
    }
}

/// Calls the orchestrator makes against one upstream instance.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Health probe; any `Ok` means the instance answers authenticated calls.
    async fn system_status(&self) -> Result<SystemStatusResource, UpstreamError>;

    /// Full series listing (TV dialects).
    async fn list_series(&self) -> Result<Vec<SeriesResource>, UpstreamError>;

    /// Episodes of one series (TV dialects).
    async fn list_episodes(&self, series_id: i64) -> Result<Vec<EpisodeResource>, UpstreamError>;

    /// Full movie listing (movie dialect).
    async fn list_movies(&self) -> Result<Vec<MovieResource>, UpstreamError>;

    /// Post a search command; returns the upstream-assigned command id.
    async fn issue_search(&self, command: SearchCommand)
    -> Result<CommandResource, UpstreamError>;
}
