//! Per-connection relay session
//!
//! ## Purpose
//! One `RelaySession` runs per accepted client connection. It owns the
//! upstream adapter and the pending queue, and couples the lifetimes of the
//! two half-connections: closing either side closes the other, so a session
//! is never left half-open.
//!
//! ## Buffering discipline
//! The upstream connect is the only long suspension in a session. Client
//! frames that arrive while it is in flight are appended to a FIFO queue and
//! drained exactly once, in arrival order, the moment the upstream becomes
//! connected. Frames arriving after the drain bypass the queue entirely, so
//! a later frame can never overtake a queued one.
//!
//! Sessions share no state with each other; each one is a single task whose
//! handlers run one at a time.

use crate::envelope::EventEnvelope;
use crate::error::Result;
use crate::upstream::{Upstream, UpstreamEvent};
use std::collections::VecDeque;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Frame delivered from the client socket pump into the session.
#[derive(Debug)]
pub enum ClientFrame {
    Text(String),
    Close,
}

pub struct RelaySession<U: Upstream> {
    id: Uuid,
    upstream: U,
    pending: VecDeque<String>,
    client_tx: mpsc::UnboundedSender<String>,
    relayed_to_upstream: u64,
    relayed_to_client: u64,
    malformed: u64,
}

impl<U: Upstream> RelaySession<U> {
    pub fn new(upstream: U, client_tx: mpsc::UnboundedSender<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            upstream,
            pending: VecDeque::new(),
            client_tx,
            relayed_to_upstream: 0,
            relayed_to_client: 0,
            malformed: 0,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Drive the session to completion. Consumes the session; when this
    /// returns, the upstream adapter is closed and the client sender has been
    /// dropped, which the socket pump observes as a close.
    pub async fn run(mut self, mut client_rx: mpsc::UnboundedReceiver<ClientFrame>) {
        info!(session = %self.id, "Session started, connecting upstream");

        // Establish the upstream while buffering inbound frames. `None`
        // means the client went away before the connect resolved.
        let outcome = {
            let connect = self.upstream.connect();
            tokio::pin!(connect);
            loop {
                tokio::select! {
                    result = &mut connect => break Some(result),
                    frame = client_rx.recv() => match frame {
                        Some(ClientFrame::Text(raw)) => self.pending.push_back(raw),
                        Some(ClientFrame::Close) | None => break None,
                    },
                }
            }
        };

        let mut events = match outcome {
            Some(Ok(events)) => events,
            Some(Err(e)) => {
                // Connect failure already left the adapter closed; dropping
                // the client sender closes the other half. No retry.
                warn!(session = %self.id, error = %e, "Upstream connect failed, closing client");
                return;
            }
            None => {
                info!(session = %self.id, "Client closed before upstream was ready");
                self.upstream.disconnect().await;
                return;
            }
        };

        // Single drain of the pending queue, FIFO. Each queued frame goes
        // through the same path as a live frame.
        if !self.pending.is_empty() {
            debug!(
                session = %self.id,
                queued = self.pending.len(),
                "Upstream connected, draining queued client messages"
            );
        }
        while let Some(raw) = self.pending.pop_front() {
            if let Err(e) = self.forward_to_upstream(&raw).await {
                warn!(session = %self.id, error = %e, "Upstream send failed during drain");
                self.upstream.disconnect().await;
                self.log_session_end();
                return;
            }
        }

        // Steady state: forward both directions until either side closes.
        loop {
            tokio::select! {
                frame = client_rx.recv() => match frame {
                    Some(ClientFrame::Text(raw)) => {
                        if let Err(e) = self.forward_to_upstream(&raw).await {
                            warn!(session = %self.id, error = %e, "Upstream send failed, closing session");
                            break;
                        }
                    }
                    Some(ClientFrame::Close) | None => {
                        info!(session = %self.id, "Client closed, disconnecting upstream");
                        break;
                    }
                },
                event = events.recv() => match event {
                    Some(UpstreamEvent::Event(raw)) => {
                        debug!(session = %self.id, "Relaying upstream event to client");
                        if self.client_tx.send(raw).is_err() {
                            // Client pump is gone; treat as a client close.
                            break;
                        }
                        self.relayed_to_client += 1;
                    }
                    Some(UpstreamEvent::Closed { reason }) => {
                        info!(
                            session = %self.id,
                            reason = reason.as_deref().unwrap_or("none"),
                            "Upstream closed, closing client"
                        );
                        break;
                    }
                    None => {
                        info!(session = %self.id, "Upstream event stream ended, closing client");
                        break;
                    }
                },
            }
        }

        self.upstream.disconnect().await;
        self.log_session_end();
    }

    /// Parse and forward one client frame. A malformed frame is logged and
    /// dropped without affecting the session; only transport failures
    /// propagate.
    async fn forward_to_upstream(&mut self, raw: &str) -> Result<()> {
        let event = match EventEnvelope::parse(raw) {
            Ok(event) => event,
            Err(e) => {
                self.malformed += 1;
                warn!(session = %self.id, error = %e, "Discarding malformed client message");
                return Ok(());
            }
        };
        debug!(session = %self.id, event_type = %event.event_type, "Relaying event to upstream");
        self.upstream.send(&event).await?;
        self.relayed_to_upstream += 1;
        Ok(())
    }

    fn log_session_end(&self) {
        info!(
            session = %self.id,
            to_upstream = self.relayed_to_upstream,
            to_client = self.relayed_to_client,
            malformed = self.malformed,
            "Session ended"
        );
    }
}
