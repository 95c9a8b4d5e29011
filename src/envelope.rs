//! Structured event envelope exchanged in both directions
//!
//! Every message crossing the relay is a JSON object with a `type`
//! discriminator plus event-specific fields. The relay is a transparent
//! conduit: it never enumerates event types, it only checks that a client
//! frame is a well-formed envelope before forwarding it unmodified.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Event type discriminator, e.g. `session.update` or `response.create`
    #[serde(rename = "type")]
    pub event_type: String,

    /// All remaining fields, carried through untouched
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl EventEnvelope {
    /// Parse a raw client frame. Fails if the frame is not a JSON object
    /// with a string `type` field.
    pub fn parse(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
