use thiserror::Error;

/// Failures talking to the marketplace API, classified for the retry policy.
#[derive(Debug, Error)]
pub enum MarketplaceError {
    #[error("rate limited by marketplace (429)")]
    RateLimited,
    #[error("marketplace server error: status={status}")]
    Server { status: u16 },
    #[error("marketplace rejected request: status={status} body={body}")]
    Client { status: u16, body: String },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid response: {0}")]
    Decode(String),
}

impl MarketplaceError {
    /// 429, 5xx and transport errors are retried; 4xx and decode errors are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MarketplaceError::RateLimited
                | MarketplaceError::Server { .. }
                | MarketplaceError::Transport(_)
        )
    }

    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            429 => MarketplaceError::RateLimited,
            404 => MarketplaceError::NotFound(body),
            s if s >= 500 => MarketplaceError::Server { status: s },
            s => MarketplaceError::Client { status: s, body },
        }
    }
}
