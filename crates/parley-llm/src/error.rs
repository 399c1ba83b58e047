use std::collections::HashMap;

/// Errors that can occur when talking to an upstream chat source.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("http error: {0}")]
    Http(Box<dyn std::error::Error + Send + Sync>),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("sse error: {0}")]
    Sse(String),

    #[error("api error ({code}): {message}")]
    Api {
        code: String,
        message: String,
        metadata: HashMap<String, serde_json::Value>,
    },

    #[error("upstream timed out")]
    Timeout,

    #[error("malformed upstream payload: {0}")]
    Malformed(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the upstream answered with HTTP 404.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Api { code, .. } if code == "404")
    }
}
