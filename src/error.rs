//! Error types for the relay server

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] warp::Error),

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Upstream error: {message}")]
    Upstream { message: String },

    #[error("Upstream connect timeout after {timeout_ms}ms")]
    UpstreamConnectTimeout { timeout_ms: u64 },

    #[error("Client error: {message}")]
    Client { message: String },
}

pub type Result<T> = std::result::Result<T, RelayError>;
