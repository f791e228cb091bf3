//! Error taxonomy for scraping runs

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScrapeError {
    /// An expected container or selector never appeared before the wait bound.
    #[error("element not found: `{selector}` on {url}")]
    ElementNotFound { selector: String, url: String },

    #[error("navigation to {url} timed out after {seconds}s")]
    NavigationTimeout { url: String, seconds: u64 },

    /// A detail-page rule that must resolve came back empty.
    #[error("required field `{field}` resolved empty on {url}")]
    MissingRequiredField { field: String, url: String },

    #[error("sink write failed for sheet {sheet_id}: {reason}")]
    SinkWriteFailure { sheet_id: String, reason: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("browser error: {0}")]
    Browser(String),

    #[error("client scrape exceeded {seconds}s")]
    ClientTimeout { seconds: u64 },

    #[error("cache error: {0}")]
    Cache(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl ScrapeError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn browser(err: impl std::fmt::Display) -> Self {
        Self::Browser(err.to_string())
    }
}

impl From<sqlx::Error> for ScrapeError {
    fn from(err: sqlx::Error) -> Self {
        Self::Cache(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for ScrapeError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Self::Cache(err.to_string())
    }
}

pub type Result<T, E = ScrapeError> = std::result::Result<T, E>;
