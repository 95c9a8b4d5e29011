//! Relay WebSocket server
//!
//! Accepts client WebSocket connections at the root path only, spawns one
//! relay session per accepted connection, and pumps frames between the
//! client socket and the session's channels. The acceptor keeps no
//! per-connection state beyond a live-session gauge; everything else is
//! owned by the session.

use crate::config::{Credential, RelayConfig};
use crate::error::{RelayError, Result};
use crate::session::{ClientFrame, RelaySession};
use crate::upstream::RealtimeUpstream;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::{error, info, warn};
use warp::ws::Message;
use warp::Filter;

pub struct RelayServer {
    config: RelayConfig,
    credential: Credential,
    active_sessions: Arc<AtomicUsize>,
}

impl RelayServer {
    pub fn new(config: RelayConfig, credential: Credential) -> Self {
        Self {
            config,
            credential,
            active_sessions: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::SeqCst)
    }

    /// Start the relay server and serve until the process is stopped.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.bind_address, self.config.port)
            .parse()
            .map_err(|e| RelayError::Configuration {
                message: format!("Invalid bind address: {}", e),
            })?;

        info!(
            %addr,
            upstream = %self.config.upstream_url,
            "Starting relay WebSocket server"
        );

        let enable_cors = self.config.enable_cors;
        let routes = self.routes();

        if enable_cors {
            warp::serve(routes.with(warp::cors().allow_any_origin()))
                .run(addr)
                .await;
        } else {
            warp::serve(routes).run(addr).await;
        }

        Ok(())
    }

    /// Build the warp route tree: WebSocket upgrade at `/` plus health and
    /// status endpoints. Any other path is rejected before a session or
    /// upstream adapter exists.
    pub fn routes(
        self: &Arc<Self>,
    ) -> impl Filter<Extract = (impl warp::Reply,), Error = std::convert::Infallible> + Clone {
        let ws_server = self.clone();
        let ws_route = warp::path::end()
            .and(warp::ws())
            .map(move |ws: warp::ws::Ws| {
                let server = ws_server.clone();
                ws.on_upgrade(move |socket| Self::handle_connection(server, socket))
            });

        let health_route = warp::path("health")
            .and(warp::path::end())
            .map(|| warp::reply::with_status("OK", warp::http::StatusCode::OK));

        let status_server = self.clone();
        let status_route = warp::path("status")
            .and(warp::path::end())
            .map(move || {
                warp::reply::json(&serde_json::json!({
                    "status": "running",
                    "service": "realtime-relay",
                    "version": env!("CARGO_PKG_VERSION"),
                    "sessions": status_server.active_sessions(),
                }))
            });

        let rejected = warp::path::full().map(|path: warp::path::FullPath| {
            warn!(path = %path.as_str(), "Rejected connection to unknown path");
            warp::reply::with_status("Not Found", warp::http::StatusCode::NOT_FOUND)
        });

        ws_route.or(health_route).or(status_route).or(rejected)
    }

    async fn handle_connection(server: Arc<Self>, socket: warp::ws::WebSocket) {
        let active = server.active_sessions.fetch_add(1, Ordering::SeqCst) + 1;
        if active > server.config.max_sessions {
            server.active_sessions.fetch_sub(1, Ordering::SeqCst);
            warn!(limit = server.config.max_sessions, "Session limit reached, closing connection");
            let mut socket = socket;
            let _ = socket.close().await;
            return;
        }

        let upstream = RealtimeUpstream::new(
            server.config.upstream_url.clone(),
            server.credential.clone(),
            Duration::from_millis(server.config.connect_timeout_ms),
        );

        let (client_tx, mut client_out) = mpsc::unbounded_channel::<String>();
        let (frame_tx, frame_rx) = mpsc::unbounded_channel::<ClientFrame>();

        let session = RelaySession::new(upstream, client_tx);
        let session_id = session.id();
        info!(session = %session_id, active, "Client connected");

        let session_handle = tokio::spawn(session.run(frame_rx));

        let (mut ws_sender, mut ws_receiver) = socket.split();

        // Socket pump: session output to the socket, socket frames to the
        // session. Ends when either direction closes.
        loop {
            tokio::select! {
                outbound = client_out.recv() => match outbound {
                    Some(text) => {
                        if let Err(e) = ws_sender.send(Message::text(text)).await {
                            warn!(session = %session_id, error = %e, "Failed to send to client");
                            let _ = frame_tx.send(ClientFrame::Close);
                            break;
                        }
                    }
                    None => {
                        // Session ended and dropped its sender.
                        let _ = ws_sender.send(Message::close()).await;
                        break;
                    }
                },
                inbound = ws_receiver.next() => match inbound {
                    Some(Ok(msg)) => {
                        if msg.is_text() {
                            if let Ok(text) = msg.to_str() {
                                let _ = frame_tx.send(ClientFrame::Text(text.to_string()));
                            }
                        } else if msg.is_close() {
                            let _ = frame_tx.send(ClientFrame::Close);
                            break;
                        }
                        // ping/pong/binary frames are not relay events
                    }
                    Some(Err(e)) => {
                        warn!(session = %session_id, error = %e, "Client socket error");
                        let _ = frame_tx.send(ClientFrame::Close);
                        break;
                    }
                    None => {
                        let _ = frame_tx.send(ClientFrame::Close);
                        break;
                    }
                },
            }
        }

        drop(frame_tx);
        if let Err(e) = session_handle.await {
            error!(session = %session_id, error = %e, "Session task failed");
        }
        server.active_sessions.fetch_sub(1, Ordering::SeqCst);
        info!(session = %session_id, "Connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt as _, StreamExt as _};
    use tokio_tungstenite::tungstenite;

    fn test_server(upstream_url: &str) -> Arc<RelayServer> {
        let config = RelayConfig {
            bind_address: "127.0.0.1".to_string(),
            port: 0,
            upstream_url: upstream_url.to_string(),
            connect_timeout_ms: 2000,
            max_sessions: 4,
            enable_cors: false,
        };
        Arc::new(RelayServer::new(config, Credential::new("test-key")))
    }

    #[tokio::test]
    async fn test_unknown_path_is_rejected_without_session() {
        let server = test_server("ws://127.0.0.1:9");
        let routes = server.routes();

        let response = warp::test::request().path("/other").reply(&routes).await;
        assert_eq!(response.status(), warp::http::StatusCode::NOT_FOUND);
        assert_eq!(server.active_sessions(), 0);

        // WebSocket handshake at a wrong path fails outright.
        assert!(warp::test::ws()
            .path("/other")
            .handshake(server.routes())
            .await
            .is_err());
        assert_eq!(server.active_sessions(), 0);
    }

    #[tokio::test]
    async fn test_health_and_status_endpoints() {
        let server = test_server("ws://127.0.0.1:9");
        let routes = server.routes();

        let response = warp::test::request().path("/health").reply(&routes).await;
        assert_eq!(response.status(), warp::http::StatusCode::OK);

        let response = warp::test::request().path("/status").reply(&routes).await;
        assert_eq!(response.status(), warp::http::StatusCode::OK);
        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["service"], "realtime-relay");
        assert_eq!(body["sessions"], 0);
    }

    #[tokio::test]
    async fn test_accepted_connection_relays_through_mock_upstream() {
        // Local mock standing in for the upstream realtime API.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = listener.local_addr().unwrap();
        let upstream = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let received = ws.next().await.unwrap().unwrap();
            assert!(received.is_text());
            ws.send(tungstenite::Message::Text(
                r#"{"type":"pong","id":1}"#.to_string(),
            ))
            .await
            .unwrap();
        });

        let server = test_server(&format!("ws://{}", upstream_addr));
        let mut client = warp::test::ws()
            .path("/")
            .handshake(server.routes())
            .await
            .expect("handshake");

        client.send_text(r#"{"type":"ping","id":1}"#).await;

        let reply = client.recv().await.unwrap();
        let body: serde_json::Value = serde_json::from_str(reply.to_str().unwrap()).unwrap();
        assert_eq!(body["type"], "pong");
        assert_eq!(body["id"], 1);

        upstream.await.unwrap();
    }
}
