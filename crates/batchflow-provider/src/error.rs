use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider token limit exceeded: {0}")]
    TokenLimitExceeded(String),

    #[error("provider object not found: {0}")]
    NotFound(String),

    #[error("provider request failed: {status:?}: {message}")]
    Api { status: Option<u16>, message: String },

    #[error("request to provider timed out")]
    Timeout,

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl ProviderError {
    /// True for transient provider-side failures that the job queue should
    /// retry with backoff (spec §7: `provider_http_5xx/timeouts`).
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout => true,
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.status().is_some_and(|s| s.is_server_error()),
            Self::Api { status, .. } => status.is_none_or(|s| s >= 500),
            Self::TokenLimitExceeded(_) | Self::NotFound(_) | Self::Serialization(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ProviderError>;
