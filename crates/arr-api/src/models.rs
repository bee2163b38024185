//! Wire models for the upstream dialects.
//!
//! Only the stable field subset the orchestrator consumes is modelled;
//! everything else in the upstream JSON is ignored on deserialization.
//! All three dialects speak camelCase JSON under `/api/v3/`.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Dialect
// ---------------------------------------------------------------------------

/// The upstream protocol dialect of a connector.
///
/// `TvWhisparr` shares the TV wire shape with `TvSonarr`; `MovieRadarr`
/// is the movie shape. The dialect decides which listing calls are legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dialect {
    #[serde(rename = "tv-sonarr")]
    TvSonarr,
    #[serde(rename = "movie-radarr")]
    MovieRadarr,
    #[serde(rename = "tv-whisparr")]
    TvWhisparr,
}

impl Dialect {
    /// Stable lowercase label, also used as the stored column value.
    pub fn as_str(self) -> &'static str {
        match self {
            Dialect::TvSonarr => "tv-sonarr",
            Dialect::MovieRadarr => "movie-radarr",
            Dialect::TvWhisparr => "tv-whisparr",
        }
    }

    /// Parse a stored label back into a dialect.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "tv-sonarr" => Some(Dialect::TvSonarr),
            "movie-radarr" => Some(Dialect::MovieRadarr),
            "tv-whisparr" => Some(Dialect::TvWhisparr),
            _ => None,
        }
    }

    /// True for the series/season/episode hierarchies.
    pub fn is_tv(self) -> bool {
        matches!(self, Dialect::TvSonarr | Dialect::TvWhisparr)
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// TV resources
// ---------------------------------------------------------------------------

/// One season entry embedded in a series listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeasonResource {
    pub season_number: i64,
    #[serde(default)]
    pub monitored: bool,
}

/// A series as reported by the TV dialects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesResource {
    pub id: i64,
    pub title: String,
    #[serde(default)]
    pub monitored: bool,
    #[serde(default)]
    pub seasons: Vec<SeasonResource>,
}

/// An episode as reported by the TV dialects.
///
/// `quality_cutoff_not_met` is absent for episodes without a file; the
/// upstream only evaluates the cutoff once a file exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpisodeResource {
    pub id: i64,
    pub series_id: i64,
    pub season_number: i64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub monitored: bool,
    #[serde(default)]
    pub has_file: bool,
    #[serde(default)]
    pub quality_cutoff_not_met: bool,
    #[serde(default)]
    pub episode_file: Option<FileResource>,
}

// ---------------------------------------------------------------------------
// Movie resources
// ---------------------------------------------------------------------------

/// A movie as reported by the movie dialect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MovieResource {
    pub id: i64,
    pub title: String,
    #[serde(default)]
    pub monitored: bool,
    #[serde(default)]
    pub has_file: bool,
    #[serde(default)]
    pub quality_cutoff_not_met: bool,
    #[serde(default)]
    pub movie_file: Option<FileResource>,
}

// ---------------------------------------------------------------------------
// Shared sub-resources
// ---------------------------------------------------------------------------

/// The file attached to an episode or movie, carrying its quality descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileResource {
    #[serde(default)]
    pub quality: Option<QualityWrapper>,
}

/// Upstream nests the quality model one level deep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityWrapper {
    pub quality: QualityModel,
}

/// The quality descriptor the orchestrator mirrors (name only).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityModel {
    pub name: String,
}

impl EpisodeResource {
    /// Quality name of the attached file, if any.
    pub fn quality_name(&self) -> Option<&str> {
        self.episode_file
            .as_ref()
            .and_then(|f| f.quality.as_ref())
            .map(|q| q.quality.name.as_str())
    }
}

impl MovieResource {
    /// Quality name of the attached file, if any.
    pub fn quality_name(&self) -> Option<&str> {
        self.movie_file
            .as_ref()
            .and_then(|f| f.quality.as_ref())
            .map(|q| q.quality.name.as_str())
    }
}

// ---------------------------------------------------------------------------
// Commands and status
// ---------------------------------------------------------------------------

/// Response to a posted search command.
///
/// `id` is the upstream-assigned command id used for later correlation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResource {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub status: String,
}

/// Minimal system status payload used as the health probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatusResource {
    #[serde(default)]
    pub version: String,
}
