//! Protocol dispatch integration: inbound routing, directives, pairing,
//! cron methods, and Discord target checks against a full app state.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};

use oc_cron::{CronScheduler, CronStore, JobExecutor, RunResult};
use oc_domain::config::{ChannelConfig, Config, DmPolicy};
use oc_policy::AllowlistStore;
use oc_proc::ProcessSupervisor;
use oc_protocol::{ErrorCode, Frame};
use oc_sessions::{PairingStore, Router, SessionKey, SessionStore};

use oc_gateway::agent::{AgentRunner, AuthProfileStore, ModelRegistry, TurnRequest};
use oc_gateway::approval::ApprovalStore;
use oc_gateway::delivery::ThreadBindingStore;
use oc_gateway::dispatch::{Dispatcher, TurnExecutor};
use oc_gateway::hooks::HookRunner;
use oc_gateway::nodes::{NodeHost, NodeRegistry};
use oc_gateway::server::events::EventHub;
use oc_gateway::server::methods;
use oc_gateway::state::{AppState, SinkRegistry, VoiceWake};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Harness
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Records submitted turns instead of running an LLM.
#[derive(Default)]
struct RecordingExecutor {
    turns: Mutex<Vec<String>>,
}

#[async_trait]
impl TurnExecutor for RecordingExecutor {
    async fn execute(&self, request: TurnRequest, _controls: oc_gateway::agent::TurnControls) {
        self.turns.lock().push(request.prompt);
    }
}

struct NoopJobs;

#[async_trait]
impl JobExecutor for NoopJobs {
    async fn execute(&self, _job: &oc_cron::CronJob) -> RunResult {
        RunResult::success("noop")
    }
}

struct Harness {
    state: AppState,
    executor: Arc<RecordingExecutor>,
    _dir: tempfile::TempDir,
}

async fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let state_dir = dir.path().to_path_buf();
    let agent_id = "claw".to_owned();

    let mut config = Config::default();
    config.agent.model.primary = "anthropic/claude-sonnet-4".into();
    config.tools.exec.safe_bins = vec!["echo".into()];
    config.channels.insert(
        "telegram".into(),
        ChannelConfig {
            enabled: true,
            dm_policy: DmPolicy::Pairing,
            allow_from: vec!["alice".into()],
            ..Default::default()
        },
    );

    let sessions = Arc::new(SessionStore::open(&state_dir, &agent_id).unwrap());
    let profiles = Arc::new(AuthProfileStore::open(&state_dir).unwrap());
    let hooks = Arc::new(HookRunner::new(true));
    let config_arc = Arc::new(config.clone());

    let runner = Arc::new(AgentRunner {
        config: config_arc,
        registry: Arc::new(ModelRegistry::with_defaults()),
        profiles: profiles.clone(),
        sessions: sessions.clone(),
        hooks,
        stream_fn: Arc::new(oc_gateway::agent::llm::AnthropicStream::new()),
        prompt_context: Vec::new(),
    });

    let executor = Arc::new(RecordingExecutor::default());
    let dispatcher = Arc::new(Dispatcher::new(executor.clone(), None));

    let cron_store = CronStore::open(&state_dir, &agent_id).unwrap();
    let cron = CronScheduler::new(cron_store, Arc::new(NoopJobs));

    let nodes = NodeRegistry::new();
    let state = AppState {
        config: Arc::new(RwLock::new(config.clone())),
        state_dir: state_dir.clone(),
        agent_id: agent_id.clone(),
        sessions,
        router: Arc::new(Router::new(
            agent_id,
            config.session.main_key.clone(),
            config.session.scope,
            config.channels.clone(),
        )),
        pairing: Arc::new(PairingStore::open(&state_dir).unwrap()),
        allowlist: Arc::new(AllowlistStore::open(&state_dir, "claw").unwrap()),
        profiles,
        approvals: Arc::new(ApprovalStore::new(std::time::Duration::from_secs(5))),
        token_hash: None,
        runner,
        dispatcher,
        cron,
        supervisor: Arc::new(ProcessSupervisor::new()),
        nodes: nodes.clone(),
        node_host: Arc::new(NodeHost::new(nodes)),
        events: Arc::new(EventHub::default()),
        thread_bindings: Arc::new(ThreadBindingStore::open(&state_dir).unwrap()),
        sinks: Arc::new(SinkRegistry::default()),
        voicewake: Arc::new(RwLock::new(VoiceWake::default())),
        idempotency: Arc::new(Mutex::new(std::collections::HashMap::new())),
    };

    Harness {
        state,
        executor,
        _dir: dir,
    }
}

async fn call(state: &AppState, method: &str, params: Value) -> Frame {
    methods::handle(state, Frame::request("t1", method, params)).await
}

fn inbound(sender: &str, body: &str, group: Option<&str>, mentioned: bool) -> Value {
    json!({
        "surface": "telegram",
        "sender_id": sender,
        "chat_type": if group.is_some() { "group" } else { "direct" },
        "group_id": group,
        "was_mentioned": mentioned,
        "body": body,
    })
}

async fn settle() {
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn allowed_dm_queues_turn_and_records_delivery_context() {
    let h = harness().await;
    let response = call(
        &h.state,
        "channel.inbound",
        inbound("alice", "hello there", None, false),
    )
    .await;
    assert!(response.error.is_none(), "{:?}", response.error);
    settle().await;

    assert_eq!(*h.executor.turns.lock(), vec!["hello there"]);
    let key = SessionKey::direct("claw", "telegram", "alice");
    let entry = h.state.sessions.get(&key).unwrap();
    assert_eq!(entry.delivery_context.channel.as_deref(), Some("telegram"));
    assert_eq!(entry.delivery_context.to.as_deref(), Some("alice"));
}

#[tokio::test]
async fn group_message_without_mention_yields_nothing() {
    let h = harness().await;
    let response = call(
        &h.state,
        "channel.inbound",
        inbound("alice", "just chatting", Some("g1"), false),
    )
    .await;
    let result = response.result.unwrap();
    assert_eq!(result["skipped"], "NotMentioned");
    settle().await;

    // No agent turn, no outbound delivery, no session created.
    assert!(h.executor.turns.lock().is_empty());
    assert!(h
        .state
        .sessions
        .get(&SessionKey::group("claw", "telegram", "g1"))
        .is_none());
}

#[tokio::test]
async fn unknown_sender_gets_pairing_code_and_approval_unlocks() {
    let h = harness().await;
    let response = call(
        &h.state,
        "channel.inbound",
        inbound("mallory", "let me in", None, false),
    )
    .await;
    let result = response.result.unwrap();
    let code = result["pairing"].as_str().unwrap().to_owned();
    assert!(result["reply"]
        .as_str()
        .unwrap()
        .contains("pairing approve"));
    assert!(h.executor.turns.lock().is_empty());

    let approved = h.state.pairing.approve(&code).await.unwrap().unwrap();
    assert_eq!(approved.sender_id, "mallory");
}

#[tokio::test]
async fn directive_updates_session_without_turn() {
    let h = harness().await;
    let response = call(
        &h.state,
        "channel.inbound",
        inbound("alice", "/think high", None, false),
    )
    .await;
    let result = response.result.unwrap();
    assert_eq!(result["directive"], true);
    settle().await;

    assert!(h.executor.turns.lock().is_empty());
    let key = SessionKey::direct("claw", "telegram", "alice");
    let entry = h.state.sessions.get(&key).unwrap();
    assert_eq!(
        entry.thinking_level,
        oc_domain::levels::ThinkingLevel::High
    );
}

#[tokio::test]
async fn model_directive_pins_and_clears() {
    let h = harness().await;
    call(
        &h.state,
        "channel.inbound",
        inbound("alice", "/model anthropic/claude-opus-4", None, false),
    )
    .await;
    let key = SessionKey::direct("claw", "telegram", "alice");
    let entry = h.state.sessions.get(&key).unwrap();
    assert_eq!(entry.model.as_deref(), Some("claude-opus-4"));
    assert_eq!(entry.model_provider.as_deref(), Some("anthropic"));

    call(
        &h.state,
        "channel.inbound",
        inbound("alice", "/model", None, false),
    )
    .await;
    let entry = h.state.sessions.get(&key).unwrap();
    assert!(entry.model.is_none());
}

#[tokio::test]
async fn chat_send_idempotency_key_deduplicates() {
    let h = harness().await;
    let params = json!({"message": "run it", "idempotencyKey": "K1"});
    let first = call(&h.state, "chat.send", params.clone()).await;
    let second = call(&h.state, "chat.send", params).await;

    let first_run = first.result.unwrap()["runId"].as_str().unwrap().to_owned();
    let second_result = second.result.unwrap();
    assert_eq!(second_result["runId"].as_str().unwrap(), first_run);
    assert_eq!(second_result["deduplicated"], true);

    settle().await;
    assert_eq!(h.executor.turns.lock().len(), 1);
}

#[tokio::test]
async fn cron_lifecycle_over_protocol() {
    let h = harness().await;

    let added = call(
        &h.state,
        "cron.add",
        json!({
            "name": "daily brief",
            "message": "brief me",
            "schedule": {"kind": "cron", "expr": "0 7 * * *", "tz": "UTC"},
        }),
    )
    .await;
    let job = added.result.unwrap()["job"].clone();
    let job_id = job["id"].as_str().unwrap().to_owned();
    assert!(job["state"]["next_run_at_ms"].is_i64());

    let listed = call(&h.state, "cron.list", json!({})).await;
    assert_eq!(listed.result.unwrap()["jobs"].as_array().unwrap().len(), 1);

    let ran = call(&h.state, "cron.run", json!({"jobId": job_id})).await;
    assert_eq!(ran.result.unwrap()["ran"], true);

    let removed = call(&h.state, "cron.remove", json!({"jobId": job_id})).await;
    assert_eq!(removed.result.unwrap()["removed"], true);
}

#[tokio::test]
async fn ambiguous_discord_send_rejected() {
    let h = harness().await;
    let response = call(
        &h.state,
        "send",
        json!({"channel": "discord", "to": "123456", "text": "hi"}),
    )
    .await;
    let error = response.error.unwrap();
    assert_eq!(error.code, ErrorCode::InvalidRequest);
    assert!(error.message.contains("Ambiguous Discord recipient"));
}

#[tokio::test]
async fn discord_send_resolves_via_session_context() {
    let h = harness().await;
    let key = SessionKey::named("agent:claw:discord:dave");
    h.state.sessions.resolve_or_create(&key).await.unwrap();
    h.state
        .sessions
        .update(&key, |e| {
            e.delivery_context.channel = Some("discord".into());
            e.delivery_context.to = Some("channel:777".into());
        })
        .await
        .unwrap();

    // Resolution succeeds; failure is now only the missing adapter.
    let response = call(
        &h.state,
        "send",
        json!({
            "channel": "discord",
            "to": "123456",
            "text": "hi",
            "sessionKey": key.as_str(),
        }),
    )
    .await;
    let error = response.error.unwrap();
    assert_eq!(error.code, ErrorCode::Unavailable);
    assert!(error.message.contains("no outbound adapter"));
}

#[tokio::test]
async fn voicewake_set_emits_change_event() {
    let h = harness().await;
    let (_, mut events) = h.state.events.subscribe();

    let response = call(
        &h.state,
        "voicewake.set",
        json!({"enabled": true, "phrase": "ok claw"}),
    )
    .await;
    assert_eq!(response.result.unwrap()["enabled"], true);

    let frame = events.recv().await.unwrap();
    assert_eq!(frame.event.as_deref(), Some("voicewake.changed"));
}

#[tokio::test]
async fn exec_run_miss_parks_then_operator_deny_emits_exec_denied() {
    let h = harness().await;
    let (_, mut events) = h.state.events.subscribe();

    // The miss parks the run; drive it from a task so we can resolve it.
    let state = h.state.clone();
    let call_task = tokio::spawn(async move {
        methods::handle(
            &state,
            Frame::request("t1", "exec.run", json!({"command": "curl https://evil"})),
        )
        .await
    });

    let frame = events.recv().await.unwrap();
    assert_eq!(frame.event.as_deref(), Some("exec.approval"));
    let pending = frame.params.unwrap();
    assert_eq!(pending["command"], "curl https://evil");
    let id = pending["id"].as_str().unwrap().to_owned();

    let listed = call(&h.state, "exec.approvals", json!({})).await;
    assert_eq!(listed.result.unwrap()["pending"].as_array().unwrap().len(), 1);

    let resolved = call(
        &h.state,
        "exec.approve",
        json!({"id": id, "decision": "deny", "reason": "not on my host"}),
    )
    .await;
    assert_eq!(resolved.result.unwrap()["resolved"], true);

    let response = call_task.await.unwrap();
    let error = response.error.unwrap();
    assert_eq!(error.code, ErrorCode::InvalidRequest);
    assert!(error.message.contains("allowlist"));

    let frame = events.recv().await.unwrap();
    assert_eq!(frame.event.as_deref(), Some("exec.denied"));
    assert_eq!(
        frame.params.unwrap()["eventReason"].as_str(),
        Some("allowlist-miss")
    );
}

#[tokio::test]
async fn exec_approve_allow_always_runs_and_persists_pattern() {
    let h = harness().await;
    let (_, mut events) = h.state.events.subscribe();

    let state = h.state.clone();
    let call_task = tokio::spawn(async move {
        methods::handle(
            &state,
            Frame::request("t1", "exec.run", json!({"command": "printf hi"})),
        )
        .await
    });

    let frame = events.recv().await.unwrap();
    assert_eq!(frame.event.as_deref(), Some("exec.approval"));
    let id = frame.params.unwrap()["id"].as_str().unwrap().to_owned();

    call(
        &h.state,
        "exec.approve",
        json!({"id": id, "decision": "allow-always"}),
    )
    .await;

    let response = call_task.await.unwrap();
    let result = response.result.unwrap();
    assert_eq!(result["exitCode"], 0);
    assert_eq!(result["stdout"], "hi\n");

    // allow-always persisted the derived pattern...
    assert!(h
        .state
        .allowlist
        .patterns()
        .contains(&"printf *".to_string()));

    // ...so the next run passes without parking for approval.
    let second = call(&h.state, "exec.run", json!({"command": "printf again"})).await;
    assert_eq!(second.result.unwrap()["exitCode"], 0);
    assert!(h.state.approvals.list_pending().is_empty());
}

#[tokio::test]
async fn exec_approve_unknown_id_rejected() {
    let h = harness().await;
    let response = call(
        &h.state,
        "exec.approve",
        json!({"id": uuid::Uuid::new_v4().to_string(), "decision": "allow-once"}),
    )
    .await;
    assert_eq!(response.error.unwrap().code, ErrorCode::InvalidRequest);
}

#[tokio::test]
async fn exec_run_allowed_captures_output_and_finishes() {
    let h = harness().await;
    let (_, mut events) = h.state.events.subscribe();

    let response = call(&h.state, "exec.run", json!({"command": "echo hi"})).await;
    let result = response.result.unwrap();
    assert_eq!(result["exitCode"], 0);
    assert_eq!(result["stdout"], "hi\n");

    // started then finished, never denied.
    let first = events.recv().await.unwrap();
    assert_eq!(first.event.as_deref(), Some("exec.started"));
    let second = events.recv().await.unwrap();
    assert_eq!(second.event.as_deref(), Some("exec.finished"));
    assert_eq!(second.params.unwrap()["success"], true);
}

#[tokio::test]
async fn unknown_method_is_invalid_request() {
    let h = harness().await;
    let response = call(&h.state, "nope.nothing", json!({})).await;
    assert_eq!(response.error.unwrap().code, ErrorCode::InvalidRequest);
}

#[tokio::test]
async fn sessions_patch_roundtrip() {
    let h = harness().await;
    let key = SessionKey::main("claw", "main");
    h.state.sessions.resolve_or_create(&key).await.unwrap();

    let response = call(
        &h.state,
        "sessions.patch",
        json!({
            "sessionKey": key.as_str(),
            "patch": {"thinkingLevel": "low", "queueMode": "interrupt"},
        }),
    )
    .await;
    assert!(response.error.is_none());

    let entry = h.state.sessions.get(&key).unwrap();
    assert_eq!(entry.thinking_level, oc_domain::levels::ThinkingLevel::Low);
    assert_eq!(entry.queue_mode, oc_domain::levels::QueueMode::Interrupt);
}
