//! Upstream realtime API connection management
//!
//! ## Purpose
//! Owns the outbound WebSocket leg of a relay session: connection
//! establishment with the injected credential, the
//! `Disconnected → Connecting → Connected → Closed` lifecycle, and delivery
//! of upstream events to the session in arrival order.
//!
//! ## Architecture Role
//! One adapter per relay session, created on accept and destroyed with the
//! session. `Closed` is terminal; a session never reuses an adapter, so there
//! is no reconnect state to manage here.

use crate::config::Credential;
use crate::envelope::EventEnvelope;
use crate::error::{RelayError, Result};
use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Connection lifecycle state. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

/// Notification delivered to the session that registered for events.
#[derive(Debug)]
pub enum UpstreamEvent {
    /// A serialized event envelope produced by the upstream service
    Event(String),

    /// The upstream connection ended, remotely or due to a transport error
    Closed { reason: Option<String> },
}

/// Capability contract for the upstream leg of a session.
///
/// The relay session is written against this trait so its buffering and
/// teardown behavior can be exercised with a scripted implementation.
#[async_trait]
pub trait Upstream: Send {
    /// Establish the connection. Resolves once the upstream is ready and
    /// returns the event stream for this connection, or fails with the
    /// adapter left in the `Closed` state. Valid only from `Disconnected`.
    async fn connect(&mut self) -> Result<mpsc::UnboundedReceiver<UpstreamEvent>>;

    /// Forward one event. Valid only while `Connected`; calling this in any
    /// other state is a caller bug, surfaced as an error rather than a panic.
    async fn send(&mut self, event: &EventEnvelope) -> Result<()>;

    /// Tear down the connection. Idempotent; always leaves the adapter
    /// `Closed`.
    async fn disconnect(&mut self);

    fn state(&self) -> UpstreamState;

    fn is_connected(&self) -> bool {
        self.state() == UpstreamState::Connected
    }
}

/// Production adapter: tokio-tungstenite client against the realtime API.
pub struct RealtimeUpstream {
    url: String,
    credential: Credential,
    connect_timeout: Duration,
    state: UpstreamState,
    sink: Option<WsSink>,
    reader: Option<tokio::task::JoinHandle<()>>,
}

impl RealtimeUpstream {
    pub fn new(url: String, credential: Credential, connect_timeout: Duration) -> Self {
        Self {
            url,
            credential,
            connect_timeout,
            state: UpstreamState::Disconnected,
            sink: None,
            reader: None,
        }
    }

    fn build_request(&self) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request> {
        let mut request = self.url.as_str().into_client_request()?;
        let bearer = HeaderValue::from_str(&self.credential.bearer()).map_err(|e| {
            RelayError::Configuration {
                message: format!("Credential is not a valid header value: {}", e),
            }
        })?;
        request.headers_mut().insert(AUTHORIZATION, bearer);
        request
            .headers_mut()
            .insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));
        Ok(request)
    }
}

#[async_trait]
impl Upstream for RealtimeUpstream {
    async fn connect(&mut self) -> Result<mpsc::UnboundedReceiver<UpstreamEvent>> {
        if self.state != UpstreamState::Disconnected {
            return Err(RelayError::Upstream {
                message: format!("connect() called in {:?} state", self.state),
            });
        }
        self.state = UpstreamState::Connecting;

        let request = match self.build_request() {
            Ok(request) => request,
            Err(e) => {
                self.state = UpstreamState::Closed;
                return Err(e);
            }
        };

        let (stream, _response) = match timeout(self.connect_timeout, connect_async(request)).await
        {
            Ok(Ok(connected)) => connected,
            Ok(Err(e)) => {
                self.state = UpstreamState::Closed;
                return Err(RelayError::WebSocket(e));
            }
            Err(_) => {
                self.state = UpstreamState::Closed;
                return Err(RelayError::UpstreamConnectTimeout {
                    timeout_ms: self.connect_timeout.as_millis() as u64,
                });
            }
        };

        let (sink, mut stream) = stream.split();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        // Reader task: pushes upstream frames into the event channel in
        // arrival order and reports the close exactly once.
        let reader = tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        if events_tx.send(UpstreamEvent::Event(text)).is_err() {
                            // Session dropped its receiver; stop reading.
                            return;
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        let reason = frame.map(|f| f.reason.to_string());
                        let _ = events_tx.send(UpstreamEvent::Closed { reason });
                        return;
                    }
                    Ok(_) => {} // ping/pong/binary are not relay events
                    Err(e) => {
                        let _ = events_tx.send(UpstreamEvent::Closed {
                            reason: Some(e.to_string()),
                        });
                        return;
                    }
                }
            }
            let _ = events_tx.send(UpstreamEvent::Closed { reason: None });
        });

        self.sink = Some(sink);
        self.reader = Some(reader);
        self.state = UpstreamState::Connected;
        info!(url = %self.url, "Connected to upstream");
        Ok(events_rx)
    }

    async fn send(&mut self, event: &EventEnvelope) -> Result<()> {
        let sink = match (self.state, self.sink.as_mut()) {
            (UpstreamState::Connected, Some(sink)) => sink,
            _ => {
                return Err(RelayError::Upstream {
                    message: format!("send() called in {:?} state", self.state),
                })
            }
        };
        let text = event.to_json()?;
        sink.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn disconnect(&mut self) {
        if self.state == UpstreamState::Closed {
            return;
        }
        if let Some(mut sink) = self.sink.take() {
            if let Err(e) = sink.close().await {
                warn!(error = %e, "Error closing upstream sink");
            }
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.state = UpstreamState::Closed;
        debug!("Upstream disconnected");
    }

    fn state(&self) -> UpstreamState {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn test_upstream(url: &str) -> RealtimeUpstream {
        RealtimeUpstream::new(
            url.to_string(),
            Credential::new("test-key"),
            Duration::from_millis(2000),
        )
    }

    fn envelope(event_type: &str) -> EventEnvelope {
        EventEnvelope::parse(&json!({"type": event_type}).to_string()).unwrap()
    }

    #[tokio::test]
    async fn test_initial_state_and_send_rejected() {
        let mut upstream = test_upstream("ws://127.0.0.1:9");
        assert_eq!(upstream.state(), UpstreamState::Disconnected);
        assert!(!upstream.is_connected());

        let err = upstream.send(&envelope("ping")).await.unwrap_err();
        assert_matches!(err, RelayError::Upstream { .. });
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent_and_terminal() {
        let mut upstream = test_upstream("ws://127.0.0.1:9");
        upstream.disconnect().await;
        assert_eq!(upstream.state(), UpstreamState::Closed);

        // Re-closing an already closed adapter is a no-op.
        upstream.disconnect().await;
        assert_eq!(upstream.state(), UpstreamState::Closed);

        // Closed is terminal: connect from Closed is rejected.
        assert!(upstream.connect().await.is_err());
    }

    #[tokio::test]
    async fn test_connect_refused_leaves_adapter_closed() {
        // Bind then drop a listener so the port is known to be free.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut upstream = test_upstream(&format!("ws://{}", addr));
        assert!(upstream.connect().await.is_err());
        assert_eq!(upstream.state(), UpstreamState::Closed);
    }

    #[tokio::test]
    async fn test_connect_sends_credential_and_relays_events() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let seen_auth: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let seen_auth_server = seen_auth.clone();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let callback =
                |req: &tokio_tungstenite::tungstenite::handshake::server::Request,
                 response: tokio_tungstenite::tungstenite::handshake::server::Response| {
                    let auth = req
                        .headers()
                        .get(AUTHORIZATION)
                        .and_then(|v| v.to_str().ok())
                        .map(|v| v.to_string());
                    *seen_auth_server.lock().unwrap() = auth;
                    Ok(response)
                };
            let mut ws = tokio_tungstenite::accept_hdr_async(stream, callback)
                .await
                .unwrap();

            // Expect one event from the adapter, then emit one back.
            let received = ws.next().await.unwrap().unwrap();
            assert!(received.is_text());
            ws.send(Message::Text(r#"{"type":"pong","id":1}"#.to_string()))
                .await
                .unwrap();
        });

        let mut upstream = test_upstream(&format!("ws://{}", addr));
        let mut events = upstream.connect().await.unwrap();
        assert_eq!(upstream.state(), UpstreamState::Connected);

        upstream.send(&envelope("ping")).await.unwrap();

        let event = events.recv().await.unwrap();
        assert_matches!(event, UpstreamEvent::Event(text) => {
            assert!(text.contains("pong"));
        });

        assert_eq!(
            seen_auth.lock().unwrap().as_deref(),
            Some("Bearer test-key")
        );

        upstream.disconnect().await;
        assert_eq!(upstream.state(), UpstreamState::Closed);
        server.await.unwrap();
    }
}
