//! Typed error classification at the upstream HTTP boundary.
//!
//! Every upstream call is classified exactly once, into one of the seven
//! categories below. Callers upstack (sync retry wrapper, dispatcher,
//! health attribution) only ever see the category, never the raw wire
//! error. Classification is response-code driven:
//!
//! | Wire condition        | Category      | Retryable |
//! |-----------------------|---------------|-----------|
//! | 401 / 403             | `Auth`        | no        |
//! | 404                   | `NotFound`    | no        |
//! | 400 / 422             | `Validation`  | no        |
//! | 429                   | `RateLimited` | yes       |
//! | 5xx                   | `Server`      | yes       |
//! | certificate failure   | `Tls`         | no        |
//! | any other transport   | `Transport`   | yes       |

use thiserror::Error;

/// Classified upstream call failure.
#[derive(Debug, Clone, Error)]
pub enum UpstreamError {
    #[error("transport: {0}")]
    Transport(String),
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("request invalid: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("TLS: {0}")]
    Tls(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("server error: {0}")]
    Server(String),
}

impl UpstreamError {
    /// Whether the operation may be retried as-is.
    ///
    /// Rate-limited is retryable but callers are expected to engage the
    /// connector pause before the next attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            UpstreamError::Transport(_) | UpstreamError::RateLimited(_) | UpstreamError::Server(_)
        )
    }

    /// Stable lowercase label, stored in `failure_category` columns and
    /// carried in log fields.
    pub fn category(&self) -> &'static str {
        match self {
            UpstreamError::Transport(_) => "transport",
            UpstreamError::Auth(_) => "auth",
            UpstreamError::Validation(_) => "validation",
            UpstreamError::NotFound(_) => "not-found",
            UpstreamError::Tls(_) => "tls",
            UpstreamError::RateLimited(_) => "rate-limited",
            UpstreamError::Server(_) => "server",
        }
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16, body_snippet: &str) -> Self {
        let msg = format!("HTTP {status}: {body_snippet}");
        match status {
            401 | 403 => UpstreamError::Auth(msg),
            404 => UpstreamError::NotFound(msg),
            400 | 422 => UpstreamError::Validation(msg),
            429 => UpstreamError::RateLimited(msg),
            s if s >= 500 => UpstreamError::Server(msg),
            // Anything else non-success is treated as a validation-class
            // contract mismatch (the upstream answered, we asked wrong).
            _ => UpstreamError::Validation(msg),
        }
    }

    /// Classify a reqwest transport-layer failure (no HTTP status).
    pub fn from_transport(err: &reqwest::Error) -> Self {
        let text = chain_text(err);
        if is_certificate_failure(&text) {
            UpstreamError::Tls(text)
        } else {
            UpstreamError::Transport(text)
        }
    }
}

/// Render the full source chain; reqwest buries the TLS cause a few
/// levels down (hyper -> io -> rustls).
fn chain_text(err: &reqwest::Error) -> String {
    let mut text = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}

fn is_certificate_failure(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    lower.contains("certificate") || lower.contains("tls") || lower.contains("handshake")
}
