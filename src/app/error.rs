use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TributaryError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Subscription already exists: {0}")]
    Exists(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Reference not recognized by this vendor")]
    WrongVendor,

    #[error("Source no longer exists: {0}")]
    SourceGone(String),

    #[error("Media too large: {size} bytes (limit {limit})")]
    TooLarge { size: u64, limit: u64 },

    #[error("Rate limited, retry after {0:?}")]
    RetryAfter(Duration),

    #[error("Platform error: {0}")]
    Platform(String),

    #[error("Access denied: {0}")]
    Forbidden(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Operation timed out")]
    Timeout,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl TributaryError {
    /// Only a vendor-confirmed missing source suspends a subscription on its own.
    pub fn is_permanent(&self) -> bool {
        matches!(self, TributaryError::SourceGone(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, TributaryError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, TributaryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_source_gone_is_permanent() {
        assert!(TributaryError::SourceGone("thread 42".into()).is_permanent());
        assert!(!TributaryError::NotFound("x".into()).is_permanent());
        assert!(!TributaryError::Timeout.is_permanent());
        assert!(!TributaryError::RetryAfter(Duration::from_secs(1)).is_permanent());
    }

    #[test]
    fn test_too_large_message() {
        let err = TributaryError::TooLarge {
            size: 20,
            limit: 10,
        };
        assert_eq!(err.to_string(), "Media too large: 20 bytes (limit 10)");
    }
}
