use std::time::Duration;

use thiserror::Error;

/// Failure kinds a provider call can report.
///
/// `Unavailable` and `RateLimited` are transient and worth retrying,
/// `FormatChanged` and `ContentMissing` are permanent for the item asked for.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    #[error("provider rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("provider format changed: {0}")]
    FormatChanged(String),
    #[error("content missing: {0}")]
    ContentMissing(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::Unavailable(_) | ProviderError::RateLimited { .. }
        )
    }

    pub fn unavailable(reason: impl ToString) -> Self {
        ProviderError::Unavailable(reason.to_string())
    }

    pub fn format_changed(reason: impl ToString) -> Self {
        ProviderError::FormatChanged(reason.to_string())
    }

    pub fn content_missing(reason: impl ToString) -> Self {
        ProviderError::ContentMissing(reason.to_string())
    }
}
