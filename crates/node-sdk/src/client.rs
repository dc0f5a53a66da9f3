//! Gateway connection loop for device nodes.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use oc_domain::error::{Error, Result};
use oc_protocol::{
    build_relay_ws_url, is_retryable_error, reconnect_delay_ms, ErrorCode, Frame, NodeHello,
    PermissionStatus, ReconnectPolicy,
};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Capability handlers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Result of serving one `node.invoke`.
pub struct InvokeOutcome {
    pub result: std::result::Result<Value, (ErrorCode, String)>,
}

impl InvokeOutcome {
    pub fn ok(value: Value) -> Self {
        Self { result: Ok(value) }
    }
    pub fn err(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            result: Err((code, message.into())),
        }
    }
}

/// One device capability (`system.run`, `camera.snap`, …).
#[async_trait]
pub trait CapabilityHandler: Send + Sync {
    async fn invoke(&self, cmd: &str, params: Value) -> InvokeOutcome;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Builder
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct NodeClientBuilder {
    node_id: String,
    port: u16,
    gateway_token: String,
    permissions: HashMap<String, PermissionStatus>,
    handlers: HashMap<String, Arc<dyn CapabilityHandler>>,
    policy: ReconnectPolicy,
}

impl NodeClientBuilder {
    pub fn new(node_id: impl Into<String>, port: u16, gateway_token: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            port,
            gateway_token: gateway_token.into(),
            permissions: HashMap::new(),
            handlers: HashMap::new(),
            policy: ReconnectPolicy::default(),
        }
    }

    /// Register a capability and its handler.
    pub fn capability(
        mut self,
        name: impl Into<String>,
        status: PermissionStatus,
        handler: Arc<dyn CapabilityHandler>,
    ) -> Self {
        let name = name.into();
        self.permissions.insert(name.clone(), status);
        self.handlers.insert(name, handler);
        self
    }

    pub fn reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn build(self) -> NodeClient {
        NodeClient {
            node_id: self.node_id,
            port: self.port,
            gateway_token: self.gateway_token,
            permissions: self.permissions,
            handlers: self.handlers,
            policy: self.policy,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Client
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct NodeClient {
    node_id: String,
    port: u16,
    gateway_token: String,
    permissions: HashMap<String, PermissionStatus>,
    handlers: HashMap<String, Arc<dyn CapabilityHandler>>,
    policy: ReconnectPolicy,
}

impl NodeClient {
    /// Connect and serve until a non-retryable error occurs.
    pub async fn run(&self) -> Result<()> {
        let mut attempt: u32 = 0;
        loop {
            match self.serve_once().await {
                Ok(()) => {
                    // Clean close: reconnect from scratch.
                    attempt = 0;
                }
                Err(e) => {
                    let message = e.to_string();
                    if !is_retryable_error(&message) {
                        tracing::error!(error = %message, "non-retryable gateway error, giving up");
                        return Err(e);
                    }
                    tracing::warn!(error = %message, attempt, "gateway connection lost");
                }
            }
            let delay = reconnect_delay_ms(attempt, &self.policy, rand_fraction);
            attempt = attempt.saturating_add(1);
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
        }
    }

    async fn serve_once(&self) -> Result<()> {
        let url = build_relay_ws_url(self.port, &self.gateway_token)?;
        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| Error::Transport(format!("gateway connect failed: {e}")))?;
        let (mut sink, mut source) = stream.split();

        // Publish capabilities.
        let hello = NodeHello {
            node_id: self.node_id.clone(),
            caps: self.handlers.keys().cloned().collect(),
            permissions: self.permissions.clone(),
            version: env!("CARGO_PKG_VERSION").to_owned(),
        };
        let frame = Frame::request(
            uuid_like_id(),
            "node.hello",
            serde_json::to_value(&hello)?,
        );
        sink.send(Message::Text(serde_json::to_string(&frame)?))
            .await
            .map_err(|e| Error::Transport(format!("hello send failed: {e}")))?;
        tracing::info!(node_id = %self.node_id, caps = hello.caps.len(), "node bridge up");

        while let Some(msg) = source.next().await {
            let msg = msg.map_err(|e| Error::Transport(format!("socket read failed: {e}")))?;
            match msg {
                Message::Text(text) => {
                    let Ok(frame) = serde_json::from_str::<Frame>(&text) else {
                        tracing::debug!("ignoring unparseable frame");
                        continue;
                    };
                    if let Some(reply) = self.handle_frame(frame).await {
                        sink.send(Message::Text(serde_json::to_string(&reply)?))
                            .await
                            .map_err(|e| Error::Transport(format!("reply send failed: {e}")))?;
                    }
                }
                Message::Ping(payload) => {
                    let _ = sink.send(Message::Pong(payload)).await;
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
        Ok(())
    }

    async fn handle_frame(&self, frame: Frame) -> Option<Frame> {
        let id = frame.id.clone()?;
        let method = frame.method.as_deref()?;
        if method != "node.invoke" {
            return Some(Frame::error_response(
                id,
                ErrorCode::InvalidRequest,
                format!("unsupported method '{method}'"),
            ));
        }

        let params = frame.params.unwrap_or(Value::Null);
        let cmd = params.get("cmd").and_then(Value::as_str).unwrap_or("");
        let cap = self
            .handlers
            .iter()
            .find(|(name, _)| cmd == name.as_str() || cmd.starts_with(&format!("{name}.")));
        let Some((_, handler)) = cap else {
            return Some(Frame::error_response(
                id,
                ErrorCode::Unavailable,
                format!("capability for '{cmd}' not served by this node"),
            ));
        };

        let args = params
            .get("params_json")
            .and_then(Value::as_str)
            .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
            .unwrap_or(Value::Null);

        match handler.invoke(cmd, args).await.result {
            Ok(value) => Some(Frame::response(id, value)),
            Err((code, message)) => Some(Frame::error_response(id, code, message)),
        }
    }
}

/// Jitter source for the reconnect delay.
fn rand_fraction() -> f64 {
    // A timestamp-derived fraction is enough to de-synchronize peers;
    // this is not cryptographic.
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    f64::from(nanos % 1_000_000) / 1_000_000.0
}

fn uuid_like_id() -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("node-{nanos:x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl CapabilityHandler for Echo {
        async fn invoke(&self, cmd: &str, params: Value) -> InvokeOutcome {
            InvokeOutcome::ok(serde_json::json!({"cmd": cmd, "params": params}))
        }
    }

    fn client() -> NodeClient {
        NodeClientBuilder::new("node-1", 18_792, "tok")
            .capability("canvas", PermissionStatus::Granted, Arc::new(Echo))
            .build()
    }

    #[tokio::test]
    async fn invoke_routed_to_capability_prefix() {
        let c = client();
        let frame = Frame::request(
            "r1",
            "node.invoke",
            serde_json::json!({"cmd": "canvas.draw", "params_json": "{\"x\":1}"}),
        );
        let reply = c.handle_frame(frame).await.unwrap();
        let result = reply.result.unwrap();
        assert_eq!(result["cmd"], "canvas.draw");
        assert_eq!(result["params"]["x"], 1);
    }

    #[tokio::test]
    async fn unknown_capability_is_unavailable() {
        let c = client();
        let frame = Frame::request(
            "r2",
            "node.invoke",
            serde_json::json!({"cmd": "camera.snap"}),
        );
        let reply = c.handle_frame(frame).await.unwrap();
        assert_eq!(reply.error.unwrap().code, ErrorCode::Unavailable);
    }

    #[tokio::test]
    async fn non_invoke_method_rejected() {
        let c = client();
        let frame = Frame::request("r3", "chat.send", serde_json::json!({}));
        let reply = c.handle_frame(frame).await.unwrap();
        assert_eq!(reply.error.unwrap().code, ErrorCode::InvalidRequest);
    }
}
