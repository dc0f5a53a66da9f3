//! Node registry and RPC host.
//!
//! Device nodes connect over the gateway WebSocket, publish capabilities,
//! and serve `node.invoke` requests the host forwards. The host enforces
//! capability existence, foreground scene phase for canvas/camera/screen,
//! and per-capability permission status; `system.run` routes through the
//! policy engine exactly like a local shell command.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use oc_policy::{evaluate, CommandSpec, ExecDecision, PolicyContext};
use oc_protocol::{ErrorCode, Frame, NodeDescriptor, NodeInvoke, PermissionStatus};

/// Default per-call timeout by command class, seconds.
fn default_timeout_secs(cmd: &str) -> u64 {
    if cmd.starts_with("canvas.") || cmd.starts_with("camera.") || cmd.starts_with("screen.") {
        12
    } else {
        8
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ConnectedNode {
    pub descriptor: NodeDescriptor,
    /// Outbound frames to the node's socket writer.
    pub sink: mpsc::Sender<Frame>,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Default)]
pub struct NodeRegistry {
    nodes: RwLock<HashMap<String, ConnectedNode>>,
    /// In-flight invoke waiters keyed by request id.
    pending: Mutex<HashMap<String, PendingInvoke>>,
}

struct PendingInvoke {
    node_id: String,
    reply: oneshot::Sender<Frame>,
}

impl NodeRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, node: ConnectedNode) {
        let node_id = node.descriptor.node_id.clone();
        self.nodes.write().insert(node_id.clone(), node);
        tracing::info!(node_id = %node_id, "node registered");
    }

    /// Remove a node and fail its in-flight invokes.
    pub fn remove(&self, node_id: &str) -> usize {
        self.nodes.write().remove(node_id);
        let mut pending = self.pending.lock();
        let stale: Vec<String> = pending
            .iter()
            .filter(|(_, p)| p.node_id == node_id)
            .map(|(id, _)| id.clone())
            .collect();
        let failed = stale.len();
        for id in stale {
            if let Some(p) = pending.remove(&id) {
                let _ = p.reply.send(Frame::error_response(
                    id,
                    ErrorCode::Unavailable,
                    "node disconnected",
                ));
            }
        }
        failed
    }

    pub fn touch(&self, node_id: &str) {
        if let Some(node) = self.nodes.write().get_mut(node_id) {
            node.last_seen = Utc::now();
        }
    }

    pub fn list(&self) -> Vec<NodeDescriptor> {
        self.nodes
            .read()
            .values()
            .map(|n| n.descriptor.clone())
            .collect()
    }

    pub fn describe(&self, node_id: &str) -> Option<NodeDescriptor> {
        self.nodes.read().get(node_id).map(|n| n.descriptor.clone())
    }

    /// Drop nodes unseen for `max_idle_secs`.
    pub fn prune_stale(&self, max_idle_secs: i64) -> usize {
        let cutoff = Utc::now() - chrono::Duration::seconds(max_idle_secs);
        let stale: Vec<String> = self
            .nodes
            .read()
            .iter()
            .filter(|(_, n)| n.last_seen < cutoff)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            self.remove(id);
        }
        stale.len()
    }

    /// Route a node's response frame to its waiter.
    pub fn complete(&self, frame: Frame) -> bool {
        let Some(id) = frame.id.clone() else {
            return false;
        };
        if let Some(p) = self.pending.lock().remove(&id) {
            let _ = p.reply.send(frame);
            true
        } else {
            false
        }
    }

    async fn send_invoke(
        &self,
        node_id: &str,
        frame: Frame,
    ) -> Result<oneshot::Receiver<Frame>, (ErrorCode, String)> {
        let request_id = frame.id.clone().unwrap_or_default();
        let sink = self
            .nodes
            .read()
            .get(node_id)
            .map(|n| n.sink.clone())
            .ok_or_else(|| {
                (
                    ErrorCode::Unavailable,
                    format!("node '{node_id}' not connected"),
                )
            })?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().insert(
            request_id.clone(),
            PendingInvoke {
                node_id: node_id.to_owned(),
                reply: reply_tx,
            },
        );

        if sink.send(frame).await.is_err() {
            self.pending.lock().remove(&request_id);
            return Err((
                ErrorCode::Unavailable,
                format!("node '{node_id}' sink closed"),
            ));
        }
        Ok(reply_rx)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Host
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Result of a host-gated invoke.
pub enum NodeInvokeOutcome {
    Ok(Value),
    /// The policy engine refused a `system.run` — the caller emits
    /// `exec.denied` with the decision's reason.
    PolicyDenied(Box<ExecDecision>),
    Err { code: ErrorCode, message: String },
}

pub struct NodeHost {
    pub registry: Arc<NodeRegistry>,
}

impl NodeHost {
    pub fn new(registry: Arc<NodeRegistry>) -> Self {
        Self { registry }
    }

    /// Gate and forward one `node.invoke`.
    pub async fn invoke(&self, invoke: NodeInvoke, policy: &PolicyContext) -> NodeInvokeOutcome {
        let Some(descriptor) = self.registry.describe(&invoke.node_id) else {
            return NodeInvokeOutcome::Err {
                code: ErrorCode::Unavailable,
                message: format!("node '{}' not connected", invoke.node_id),
            };
        };

        if let Some(outcome) = gate(&descriptor, &invoke.cmd) {
            return outcome;
        }

        // system.run routes through the policy engine like local shell.
        if invoke.cmd == "system.run" {
            let command = invoke
                .params_json
                .as_deref()
                .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
                .and_then(|v| {
                    v.get("command")
                        .and_then(Value::as_str)
                        .map(str::to_owned)
                });
            let Some(command) = command else {
                return NodeInvokeOutcome::Err {
                    code: ErrorCode::InvalidRequest,
                    message: "system.run requires params_json.command".into(),
                };
            };
            let decision = evaluate(&CommandSpec::Shell(command), policy);
            if !decision.allowed {
                return NodeInvokeOutcome::PolicyDenied(Box::new(decision));
            }
        }

        let request_id = uuid::Uuid::new_v4().to_string();
        let frame = Frame::request(
            request_id,
            "node.invoke",
            serde_json::json!({
                "cmd": invoke.cmd,
                "params_json": invoke.params_json,
            }),
        );
        let reply_rx = match self.registry.send_invoke(&invoke.node_id, frame).await {
            Ok(rx) => rx,
            Err((code, message)) => return NodeInvokeOutcome::Err { code, message },
        };

        let timeout_secs = invoke
            .timeout_seconds
            .unwrap_or_else(|| default_timeout_secs(&invoke.cmd));
        let reply = tokio::time::timeout(
            std::time::Duration::from_secs(timeout_secs),
            reply_rx,
        )
        .await;

        match reply {
            Ok(Ok(frame)) => match (frame.result, frame.error) {
                (Some(result), None) => NodeInvokeOutcome::Ok(result),
                (_, Some(err)) => NodeInvokeOutcome::Err {
                    code: err.code,
                    message: err.message,
                },
                (None, None) => NodeInvokeOutcome::Ok(Value::Null),
            },
            Ok(Err(_)) => NodeInvokeOutcome::Err {
                code: ErrorCode::Unavailable,
                message: "node disconnected mid-call".into(),
            },
            Err(_) => NodeInvokeOutcome::Err {
                code: ErrorCode::Unavailable,
                message: format!("node call timed out after {timeout_secs}s"),
            },
        }
    }
}

/// Capability, scene-phase, and permission gates. `None` = pass.
fn gate(descriptor: &NodeDescriptor, cmd: &str) -> Option<NodeInvokeOutcome> {
    let cap = descriptor
        .caps
        .iter()
        .find(|c| cmd == c.as_str() || cmd.starts_with(&format!("{c}.")) || c.ends_with(".*") && cmd.starts_with(c.trim_end_matches('*')));
    let Some(cap) = cap else {
        return Some(NodeInvokeOutcome::Err {
            code: ErrorCode::InvalidRequest,
            message: format!("capability for '{cmd}' not published by node"),
        });
    };

    // Canvas, camera, and screen need the app foregrounded.
    let needs_foreground = cmd.starts_with("canvas.")
        || cmd.starts_with("camera.")
        || cmd.starts_with("screen.");
    if needs_foreground && !descriptor.foreground {
        return Some(NodeInvokeOutcome::Err {
            code: ErrorCode::NodeBackgroundUnavailable,
            message: format!("'{cmd}' requires the node app in the foreground"),
        });
    }

    let status = descriptor
        .permissions
        .get(cap)
        .or_else(|| descriptor.permissions.get(cmd))
        .copied()
        .unwrap_or(PermissionStatus::Granted);
    if status != PermissionStatus::Granted {
        let (code, message) = if cmd.starts_with("camera.") {
            (ErrorCode::CameraDisabled, format!("camera disabled for '{cmd}'"))
        } else if cmd == "location.get" {
            match status {
                PermissionStatus::Undetermined => (
                    ErrorCode::LocationPermissionRequired,
                    "location permission not yet requested".into(),
                ),
                _ => (ErrorCode::LocationDisabled, "location disabled".into()),
            }
        } else {
            (
                ErrorCode::PermissionMissing,
                format!("PERMISSION_MISSING:{cap}"),
            )
        };
        return Some(NodeInvokeOutcome::Err { code, message });
    }

    None
}
