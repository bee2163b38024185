//! reqwest-backed `UpstreamClient` for the three dialects.
//!
//! All dialects speak JSON under `/api/v3/` with the API key in the
//! `X-Api-Key` header. The TV dialects (sonarr, whisparr) share one wire
//! shape; the movie dialect (radarr) the other. Listing calls that do
//! not exist for a dialect are rejected locally as `Validation` rather
//! than round-tripped to a confused upstream.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::client::{SearchCommand, UpstreamClient};
use crate::error::UpstreamError;
use crate::models::{
    CommandResource, Dialect, EpisodeResource, MovieResource, SeriesResource, SystemStatusResource,
};

const API_KEY_HEADER: &str = "X-Api-Key";
/// How much of an error body to keep in the classified message.
const BODY_SNIPPET_MAX: usize = 200;

// ---------------------------------------------------------------------------
// Construction
// ---------------------------------------------------------------------------

/// HTTP client for one upstream instance.
pub struct HttpUpstreamClient {
    dialect: Dialect,
    base_url: String,
    api_key: String,
    http: reqwest::Client,
}

impl HttpUpstreamClient {
    /// Build a client with the default 60 s request timeout.
    pub fn new(dialect: Dialect, base_url: &str, api_key: &str) -> Result<Self, UpstreamError> {
        Self::with_timeout(dialect, base_url, api_key, Duration::from_secs(60))
    }

    /// Build a client with an explicit request timeout.
    ///
    /// Sync uses 60 s (incremental) / 120 s (reconcile); the dispatcher
    /// uses 30 s for search commands.
    pub fn with_timeout(
        dialect: Dialect,
        base_url: &str,
        api_key: &str,
        timeout: Duration,
    ) -> Result<Self, UpstreamError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;
        Ok(HttpUpstreamClient {
            dialect,
            base_url: base_url.trim_end_matches('/').to_owned(),
            api_key: api_key.to_owned(),
            http,
        })
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    // -----------------------------------------------------------------------
    // Request plumbing
    // -----------------------------------------------------------------------

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, UpstreamError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, "upstream GET");
        let response = self
            .http
            .get(&url)
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await
            .map_err(|e| UpstreamError::from_transport(&e))?;
        Self::decode(response).await
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<T, UpstreamError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, "upstream POST");
        let response = self
            .http
            .post(&url)
            .header(API_KEY_HEADER, &self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| UpstreamError::from_transport(&e))?;
        Self::decode(response).await
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, UpstreamError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(BODY_SNIPPET_MAX).collect();
            return Err(UpstreamError::from_status(status.as_u16(), &snippet));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| UpstreamError::Validation(format!("response body: {e}")))
    }

    fn require_tv(&self, call: &str) -> Result<(), UpstreamError> {
        if self.dialect.is_tv() {
            Ok(())
        } else {
            Err(UpstreamError::Validation(format!(
                "{call} is not available on dialect {}",
                self.dialect
            )))
        }
    }

    fn require_movie(&self, call: &str) -> Result<(), UpstreamError> {
        if self.dialect.is_tv() {
            Err(UpstreamError::Validation(format!(
                "{call} is not available on dialect {}",
                self.dialect
            )))
        } else {
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// UpstreamClient impl
// ---------------------------------------------------------------------------

#[async_trait]
impl UpstreamClient for HttpUpstreamClient {
    async fn system_status(&self) -> Result<SystemStatusResource, UpstreamError> {
        self.get_json("/api/v3/system/status").await
    }

    async fn list_series(&self) -> Result<Vec<SeriesResource>, UpstreamError> {
        self.require_tv("list_series")?;
        self.get_json("/api/v3/series").await
    }

    async fn list_episodes(&self, series_id: i64) -> Result<Vec<EpisodeResource>, UpstreamError> {
        self.require_tv("list_episodes")?;
        self.get_json(&format!("/api/v3/episode?seriesId={series_id}"))
            .await
    }

    async fn list_movies(&self) -> Result<Vec<MovieResource>, UpstreamError> {
        self.require_movie("list_movies")?;
        self.get_json("/api/v3/movie").await
    }

    async fn issue_search(
        &self,
        command: SearchCommand,
    ) -> Result<CommandResource, UpstreamError> {
        let body = match &command {
            SearchCommand::EpisodeSearch { episode_ids } => {
                self.require_tv("EpisodeSearch")?;
                serde_json::json!({ "name": command.name(), "episodeIds": episode_ids })
            }
            SearchCommand::SeasonSearch {
                series_id,
                season_number,
            } => {
                self.require_tv("SeasonSearch")?;
                serde_json::json!({
                    "name": command.name(),
                    "seriesId": series_id,
                    "seasonNumber": season_number,
                })
            }
            SearchCommand::SeriesSearch { series_id } => {
                self.require_tv("SeriesSearch")?;
                serde_json::json!({ "name": command.name(), "seriesId": series_id })
            }
            SearchCommand::MoviesSearch { movie_ids } => {
                self.require_movie("MoviesSearch")?;
                serde_json::json!({ "name": command.name(), "movieIds": movie_ids })
            }
        };
        self.post_json("/api/v3/command", &body).await
    }
}
