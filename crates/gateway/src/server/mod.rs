//! WebSocket control endpoint.
//!
//! One endpoint serves every peer: `GET /extension?token=<gatewayToken>`.
//! After the upgrade, request frames dispatch to [`methods`], node peers
//! announce themselves with `node.hello`, and every subscriber receives
//! the event stream (with the ring-buffered backlog replayed first).

pub mod events;
pub mod methods;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::get;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tokio::sync::mpsc;

use oc_domain::config::{GatewayAuthMode, GatewayBind};
use oc_protocol::{Frame, NodeDescriptor, NodeHello};

use crate::nodes::ConnectedNode;
use crate::state::AppState;

/// Constant-time token comparison via SHA-256 digests.
fn token_matches(expected_hash: &[u8], provided: &str) -> bool {
    let provided_hash = Sha256::digest(provided.as_bytes());
    expected_hash.ct_eq(provided_hash.as_slice()).into()
}

/// Address to bind for the configured mode.
pub fn bind_addr(bind: GatewayBind, port: u16, tailnet_ip: Option<IpAddr>) -> SocketAddr {
    let ip = match bind {
        GatewayBind::Loopback => IpAddr::V4(Ipv4Addr::LOCALHOST),
        GatewayBind::Tailnet => tailnet_ip.unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        GatewayBind::Auto => tailnet_ip.unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST)),
    };
    SocketAddr::new(ip, port)
}

pub fn router(state: AppState) -> axum::Router {
    axum::Router::new()
        .route("/extension", get(ws_upgrade))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: Option<String>,
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let auth_mode = state.config.read().gateway.auth.mode;
    let provided = query.token.as_deref().unwrap_or("");

    let password_ok = state
        .token_hash
        .as_deref()
        .map(|h| token_matches(h, provided))
        .unwrap_or(false);
    // A tailscale-proxied request carries the authenticated identity.
    let tailscale_ok = headers.contains_key("tailscale-user-login");

    let authorized = match auth_mode {
        GatewayAuthMode::Password => password_ok,
        GatewayAuthMode::TailscaleIdentity => tailscale_ok,
        GatewayAuthMode::PasswordOrTailscale => password_ok || tailscale_ok,
    };
    if !authorized {
        return (
            axum::http::StatusCode::UNAUTHORIZED,
            "invalid or missing gateway token",
        )
            .into_response();
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state))
        .into_response()
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    // One outbound channel per connection; the writer drains it.
    let (out_tx, mut out_rx) = mpsc::channel::<Frame>(256);

    // Replay the event backlog, then forward live events.
    let (backlog, mut event_rx) = state.events.subscribe();
    for frame in backlog {
        if out_tx.send(frame).await.is_err() {
            return;
        }
    }
    let event_pump = {
        let out_tx = out_tx.clone();
        tokio::spawn(async move {
            while let Ok(frame) = event_rx.recv().await {
                if out_tx.send(frame).await.is_err() {
                    break;
                }
            }
        })
    };

    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let Ok(json) = serde_json::to_string(&frame) else {
                continue;
            };
            if ws_sink.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    // This connection's node identity, once it says node.hello.
    let mut node_id: Option<String> = None;

    while let Some(Ok(message)) = ws_stream.next().await {
        match message {
            Message::Text(text) => {
                let Ok(frame) = serde_json::from_str::<Frame>(&text) else {
                    tracing::debug!("ignoring unparseable frame");
                    continue;
                };

                if frame.method.as_deref() == Some("node.hello") {
                    node_id = register_node(&state, &frame, out_tx.clone());
                    continue;
                }
                // A channel adapter binds its connection as the outbound
                // sink for its channel id.
                if frame.method.as_deref() == Some("channel.register") {
                    let response = register_channel(&state, &frame, out_tx.clone());
                    if out_tx.send(response).await.is_err() {
                        break;
                    }
                    continue;
                }
                // A response frame from a node completes its invoke.
                if frame.method.is_none() && frame.event.is_none() && frame.id.is_some() {
                    state.nodes.complete(frame);
                    continue;
                }
                if frame.method.is_some() {
                    let response = methods::handle(&state, frame).await;
                    if out_tx.send(response).await.is_err() {
                        break;
                    }
                }
            }
            Message::Ping(_) | Message::Pong(_) => {
                if let Some(id) = &node_id {
                    state.nodes.touch(id);
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    event_pump.abort();
    writer.abort();
    if let Some(id) = node_id {
        let failed = state.nodes.remove(&id);
        tracing::info!(node_id = %id, failed_in_flight = failed, "node disconnected");
    }
}

/// An adapter connection acting as its channel's outbound sink: sends
/// become `channel.outbound` frames pushed down the adapter's socket.
struct WsChannelSink {
    channel: String,
    tx: mpsc::Sender<Frame>,
}

#[async_trait::async_trait]
impl crate::delivery::ChannelSink for WsChannelSink {
    fn channel(&self) -> &str {
        &self.channel
    }

    async fn send(
        &self,
        to: &str,
        text: &str,
        media_urls: &[String],
        reply_to: Option<&str>,
    ) -> oc_domain::error::Result<()> {
        let frame = Frame::push(
            "channel.outbound",
            serde_json::json!({
                "channel": self.channel,
                "to": to,
                "text": text,
                "mediaUrls": media_urls,
                "replyTo": reply_to,
            }),
        );
        self.tx
            .send(frame)
            .await
            .map_err(|_| oc_domain::error::Error::Transport("adapter connection closed".into()))
    }
}

fn register_channel(state: &AppState, frame: &Frame, tx: mpsc::Sender<Frame>) -> Frame {
    let id = frame.id.clone().unwrap_or_default();
    let Some(channel) = frame
        .params
        .as_ref()
        .and_then(|p| p.get("channel"))
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
    else {
        return Frame::error_response(
            id,
            oc_protocol::ErrorCode::InvalidRequest,
            "missing required param 'channel'",
        );
    };
    state.sinks.register(std::sync::Arc::new(WsChannelSink {
        channel: channel.to_owned(),
        tx,
    }));
    tracing::info!(channel, "channel adapter registered");
    Frame::response(id, serde_json::json!({"ok": true}))
}

fn register_node(
    state: &AppState,
    frame: &Frame,
    sink: mpsc::Sender<Frame>,
) -> Option<String> {
    let hello: NodeHello = frame
        .params
        .clone()
        .and_then(|p| serde_json::from_value(p).ok())?;
    let node_id = hello.node_id.clone();
    state.nodes.register(ConnectedNode {
        descriptor: NodeDescriptor {
            node_id: node_id.clone(),
            caps: hello.caps,
            permissions: hello.permissions,
            foreground: true,
        },
        sink,
        connected_at: Utc::now(),
        last_seen: Utc::now(),
    });
    Some(node_id)
}
