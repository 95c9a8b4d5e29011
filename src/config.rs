//! Relay server configuration

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// WebSocket server bind address
    pub bind_address: String,

    /// WebSocket server port
    pub port: u16,

    /// Upstream realtime API WebSocket URL
    pub upstream_url: String,

    /// Upstream connect timeout in milliseconds; expiry is treated as a
    /// connect failure
    pub connect_timeout_ms: u64,

    /// Maximum number of concurrent relay sessions
    pub max_sessions: usize,

    /// Enable CORS for the HTTP endpoints
    pub enable_cors: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 8081,
            upstream_url: "wss://api.openai.com/v1/realtime".to_string(),
            connect_timeout_ms: 10_000,
            max_sessions: 1000,
            enable_cors: true,
        }
    }
}

/// Upstream API credential, injected once per process.
///
/// Held out of `RelayConfig` so it can never be serialized back out with the
/// rest of the configuration, and `Debug` is redacted so it never reaches the
/// logs. Clients only ever see the relayed events, never this value.
#[derive(Clone)]
pub struct Credential(String);

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// Render as an `Authorization` header value.
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.0)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}
