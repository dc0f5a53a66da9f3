//! Shared application state and the chat turn executor.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use oc_cron::CronScheduler;
use oc_domain::config::Config;
use oc_domain::error::Result;
use oc_policy::{AllowlistStore, PolicyContext};
use oc_proc::ProcessSupervisor;
use oc_sessions::{PairingStore, Router, SessionStore};

use crate::agent::{AgentRunner, AuthProfileStore, TurnControls, TurnRequest};
use crate::approval::{ApprovalResolution, ApprovalStore};
use crate::delivery::{ChannelSink, DeliverySession, ThreadBindingStore};
use crate::dispatch::{Dispatcher, TurnExecutor};
use crate::nodes::{NodeHost, NodeRegistry};
use crate::server::events::EventHub;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Voice wake
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceWake {
    pub enabled: bool,
    pub phrase: String,
}

impl Default for VoiceWake {
    fn default() -> Self {
        Self {
            enabled: false,
            phrase: "hey claw".into(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// App state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Shared state handed to every protocol handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RwLock<Config>>,
    pub state_dir: PathBuf,
    pub agent_id: String,

    // Session management
    pub sessions: Arc<SessionStore>,
    pub router: Arc<Router>,
    pub pairing: Arc<PairingStore>,

    // Security
    pub allowlist: Arc<AllowlistStore>,
    pub profiles: Arc<AuthProfileStore>,
    /// Pending exec approvals awaiting a human decision.
    pub approvals: Arc<ApprovalStore>,
    /// SHA-256 of the gateway token; `None` only in tailscale-identity mode.
    pub token_hash: Option<Arc<Vec<u8>>>,

    // Runtime
    pub runner: Arc<AgentRunner>,
    pub dispatcher: Arc<Dispatcher>,
    pub cron: Arc<CronScheduler>,
    pub supervisor: Arc<ProcessSupervisor>,

    // Nodes & events
    pub nodes: Arc<NodeRegistry>,
    pub node_host: Arc<NodeHost>,
    pub events: Arc<EventHub>,

    // Delivery
    pub thread_bindings: Arc<ThreadBindingStore>,
    pub sinks: Arc<SinkRegistry>,

    // Misc
    pub voicewake: Arc<RwLock<VoiceWake>>,
    /// idempotencyKey → run id already started for it.
    pub idempotency: Arc<Mutex<HashMap<String, String>>>,
}

impl AppState {
    /// Policy inputs snapshot for one evaluation. `approval` carries a
    /// standing human decision when the command was already reviewed.
    pub fn policy_context(
        &self,
        approval: Option<oc_policy::ApprovalDecision>,
    ) -> PolicyContext {
        let config = self.config.read();
        PolicyContext {
            security: config.tools.exec.security,
            ask: config.tools.exec.ask,
            allowlist: self.allowlist.patterns(),
            safe_bins: config.tools.exec.safe_bins.clone(),
            skill_bins: Vec::new(),
            approval,
        }
    }

    /// Park `command` for human review and wait for the verdict.
    ///
    /// Emits `exec.approval` with the pending id; resolves via the
    /// `exec.approve` method. Returns `None` on deny or timeout. An
    /// `allow-always` verdict persists the command's derived pattern so
    /// the allowlist passes it next time without asking.
    pub async fn await_approval(&self, command: &str) -> Option<oc_policy::ApprovalDecision> {
        let (info, rx) = self.approvals.insert(command);
        self.events.emit(
            oc_protocol::events::EXEC_APPROVAL,
            serde_json::json!(&info),
        );
        tracing::info!(approval_id = %info.id, command, "command parked for approval");

        let resolution = tokio::time::timeout(self.approvals.timeout(), rx).await;
        match resolution {
            Ok(Ok(ApprovalResolution::Approved(decision))) => {
                if decision == oc_policy::ApprovalDecision::AllowAlways {
                    if let Some(pattern) = oc_policy::allowlist::derive_pattern(command) {
                        match self.allowlist.add(&pattern, None).await {
                            Ok(true) => {
                                tracing::info!(pattern, "allow-always persisted to allowlist")
                            }
                            Ok(false) => {}
                            Err(e) => {
                                tracing::warn!(error = %e, "failed to persist allowlist pattern")
                            }
                        }
                    }
                }
                Some(decision)
            }
            Ok(Ok(ApprovalResolution::Denied { reason })) => {
                tracing::info!(approval_id = %info.id, ?reason, "command denied by operator");
                None
            }
            Ok(Err(_)) | Err(_) => {
                self.approvals.remove_expired(&info.id);
                tracing::info!(approval_id = %info.id, "approval timed out");
                None
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Channel sink registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Outbound adapters registered per channel id.
#[derive(Default)]
pub struct SinkRegistry {
    sinks: RwLock<HashMap<String, Arc<dyn ChannelSink>>>,
}

impl SinkRegistry {
    pub fn register(&self, sink: Arc<dyn ChannelSink>) {
        self.sinks
            .write()
            .insert(sink.channel().to_owned(), sink);
    }

    pub fn get(&self, channel: &str) -> Option<Arc<dyn ChannelSink>> {
        self.sinks.read().get(channel).cloned()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Chat executor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Emits chat events to control-plane subscribers: streamed blocks go out
/// as `chat` frames with `state = "block"`, the final exactly once per
/// run id with the assembled text (or `""` when the output was only
/// directive tags).
pub struct EventChatSink {
    pub events: Arc<EventHub>,
    pub session_key: String,
    pub run_id: String,
}

#[async_trait]
impl ChannelSink for EventChatSink {
    fn channel(&self) -> &str {
        "webchat"
    }

    async fn send(
        &self,
        _to: &str,
        text: &str,
        media_urls: &[String],
        _reply_to: Option<&str>,
    ) -> Result<()> {
        self.events.emit(
            oc_protocol::events::CHAT,
            serde_json::json!({
                "state": "block",
                "runId": self.run_id,
                "sessionKey": self.session_key,
                "message": {"content": [{"type": "text", "text": text}], "mediaUrls": media_urls},
            }),
        );
        Ok(())
    }
}

/// Wires the dispatcher to the agent runner: resolves the session's
/// delivery sink, runs the turn, and broadcasts the final chat event.
pub struct ChatExecutor {
    pub runner: Arc<AgentRunner>,
    pub sessions: Arc<SessionStore>,
    pub sinks: Arc<SinkRegistry>,
    pub events: Arc<EventHub>,
}

#[async_trait]
impl TurnExecutor for ChatExecutor {
    async fn execute(&self, request: TurnRequest, controls: TurnControls) {
        let entry = self.sessions.get(&request.session_key);
        let delivery_ctx = entry.map(|e| e.delivery_context).unwrap_or_default();

        // Prefer the channel the session last spoke on; fall back to the
        // control-plane chat stream.
        let channel_sink = delivery_ctx
            .channel
            .as_deref()
            .and_then(|c| self.sinks.get(c));
        let event_sink = EventChatSink {
            events: self.events.clone(),
            session_key: request.session_key.as_str().to_owned(),
            run_id: request.run_id.clone(),
        };
        let sink: &dyn ChannelSink = match &channel_sink {
            Some(s) => s.as_ref(),
            None => &event_sink,
        };
        let to = delivery_ctx.to.clone().unwrap_or_default();

        let mut delivery = DeliverySession::new(
            sink,
            to,
            request.message_id.clone(),
            request.heartbeat,
        );
        let output = self.runner.run_turn(&request, &controls, &mut delivery).await;

        // The single `final` emission for this run id.
        self.events.emit(
            oc_protocol::events::CHAT,
            serde_json::json!({
                "state": "final",
                "runId": output.run_id,
                "sessionKey": request.session_key.as_str(),
                "message": {"content": [{"type": "text", "text": output.final_text}]},
                "error": output.error,
            }),
        );
    }
}
