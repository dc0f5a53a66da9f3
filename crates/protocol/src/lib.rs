//! Gateway wire protocol: JSON frames, node RPC types, the relay URL
//! builder, and the peer reconnect policy.
//!
//! Every peer — control UIs, channel adapters, device nodes — speaks the
//! same framing over one WebSocket: requests carry `id` + `method`,
//! responses echo the `id` with `result` or `error`, and server pushes
//! carry `event`.

pub mod reconnect;
pub mod url;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

pub use reconnect::{is_retryable_error, reconnect_delay_ms, ReconnectPolicy};
pub use url::build_relay_ws_url;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Frame
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One protocol message. Exactly one of `method` (request), `result` /
/// `error` (response), or `event` (push) is populated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Frame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<FrameError>,
    /// Request hint: the caller expects a streamed series terminated by a
    /// final frame rather than a single response.
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "expectFinal")]
    pub expect_final: Option<bool>,
}

impl Frame {
    pub fn request(id: impl Into<String>, method: impl Into<String>, params: Value) -> Frame {
        Frame {
            id: Some(id.into()),
            method: Some(method.into()),
            params: Some(params),
            ..Default::default()
        }
    }

    pub fn response(id: impl Into<String>, result: Value) -> Frame {
        Frame {
            id: Some(id.into()),
            result: Some(result),
            ..Default::default()
        }
    }

    pub fn error_response(id: impl Into<String>, code: ErrorCode, message: impl Into<String>) -> Frame {
        Frame {
            id: Some(id.into()),
            error: Some(FrameError {
                code,
                message: message.into(),
            }),
            ..Default::default()
        }
    }

    pub fn push(event: impl Into<String>, params: Value) -> Frame {
        Frame {
            event: Some(event.into()),
            params: Some(params),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameError {
    pub code: ErrorCode,
    pub message: String,
}

/// Protocol-level error codes, shared with node RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidRequest,
    Unavailable,
    PermissionMissing,
    NodeBackgroundUnavailable,
    CameraDisabled,
    LocationDisabled,
    LocationPermissionRequired,
    A2uiHostNotConfigured,
    A2uiHostUnavailable,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Method & event names
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub mod methods {
    pub const CHAT_SEND: &str = "chat.send";
    pub const CHAT_INJECT: &str = "chat.inject";
    pub const CONFIG_GET: &str = "config.get";
    pub const CONFIG_SET: &str = "config.set";
    pub const CRON_ADD: &str = "cron.add";
    pub const CRON_LIST: &str = "cron.list";
    pub const CRON_UPDATE: &str = "cron.update";
    pub const CRON_REMOVE: &str = "cron.remove";
    pub const CRON_RUN: &str = "cron.run";
    pub const SESSIONS_LIST: &str = "sessions.list";
    pub const SESSIONS_HISTORY: &str = "sessions.history";
    pub const SESSIONS_SEND: &str = "sessions.send";
    pub const SESSIONS_PATCH: &str = "sessions.patch";
    pub const VOICEWAKE_GET: &str = "voicewake.get";
    pub const VOICEWAKE_SET: &str = "voicewake.set";
    pub const NODE_LIST: &str = "node.list";
    pub const NODE_DESCRIBE: &str = "node.describe";
    pub const NODE_INVOKE: &str = "node.invoke";
    pub const AGENT: &str = "agent";
    pub const SEND: &str = "send";
    pub const EXEC_RUN: &str = "exec.run";
    pub const EXEC_APPROVE: &str = "exec.approve";
    pub const EXEC_APPROVALS: &str = "exec.approvals";
    pub const CHANNEL_REGISTER: &str = "channel.register";
    pub const CHANNEL_INBOUND: &str = "channel.inbound";
}

pub mod events {
    pub const CHAT: &str = "chat";
    pub const EXEC_STARTED: &str = "exec.started";
    pub const EXEC_FINISHED: &str = "exec.finished";
    pub const EXEC_DENIED: &str = "exec.denied";
    pub const EXEC_APPROVAL: &str = "exec.approval";
    pub const VOICEWAKE_CHANGED: &str = "voicewake.changed";
    pub const COMPACTION_PHASE: &str = "compaction.phase";
    pub const SESSION_UPDATED: &str = "session.updated";
    pub const CRON_JOB: &str = "cron.job";
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Node RPC types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Grant state of one device capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionStatus {
    Granted,
    Denied,
    Undetermined,
}

/// A device node as reported by `node.list` / `node.describe`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub node_id: String,
    /// Capability names: `system.run`, `canvas.*`, `camera.*`,
    /// `screen.record`, `location.get`.
    pub caps: Vec<String>,
    #[serde(default)]
    pub permissions: HashMap<String, PermissionStatus>,
    /// Whether the companion app is currently foreground.
    #[serde(default)]
    pub foreground: bool,
}

/// Peer → gateway handshake published when a node opens its bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeHello {
    pub node_id: String,
    pub caps: Vec<String>,
    #[serde(default)]
    pub permissions: HashMap<String, PermissionStatus>,
    pub version: String,
}

/// `node.invoke` params.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInvoke {
    pub node_id: String,
    pub cmd: String,
    /// JSON-encoded command parameters.
    #[serde(default)]
    pub params_json: Option<String>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}
