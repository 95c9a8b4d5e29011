//! Realtime Relay Server
//!
//! Bridges browser WebSocket clients to an upstream realtime API. Each
//! accepted connection gets its own relay session that opens the upstream
//! connection with the server-held credential, buffers client events until
//! the upstream is ready, and forwards structured events in both directions
//! until either side closes. Clients never see the credential.

pub mod config;
pub mod envelope;
pub mod error;
pub mod server;
pub mod session;
pub mod upstream;

pub use config::{Credential, RelayConfig};
pub use envelope::EventEnvelope;
pub use error::{RelayError, Result};
pub use server::RelayServer;
pub use session::{ClientFrame, RelaySession};
pub use upstream::{RealtimeUpstream, Upstream, UpstreamEvent, UpstreamState};
