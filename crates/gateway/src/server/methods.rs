//! Protocol method dispatch.
//!
//! Every request frame resolves to exactly one response frame; parameter
//! problems come back as `INVALID_REQUEST` with a message.

use serde_json::{json, Value};

use oc_cron::{CronDelivery, CronJob, CronSchedule, RunMode, SessionTarget};
use oc_domain::levels::QueueMode;
use oc_protocol::{events, methods, ErrorCode, Frame, NodeInvoke};
use oc_sessions::{RouteOutcome, SessionKey};

use crate::agent::TurnRequest;
use crate::delivery::resolve_discord_target;
use crate::nodes::NodeInvokeOutcome;
use crate::state::AppState;

/// Handle one request frame.
pub async fn handle(state: &AppState, frame: Frame) -> Frame {
    let id = frame.id.clone().unwrap_or_default();
    let Some(method) = frame.method.clone() else {
        return Frame::error_response(id, ErrorCode::InvalidRequest, "missing method");
    };
    let params = frame.params.unwrap_or(Value::Null);

    let result = match method.as_str() {
        methods::CHANNEL_INBOUND => channel_inbound(state, &params).await,
        methods::CHAT_SEND | methods::AGENT => chat_send(state, &params).await,
        methods::CHAT_INJECT => chat_inject(state, &params).await,
        methods::CONFIG_GET => config_get(state),
        methods::CONFIG_SET => config_set(state, &params),
        methods::CRON_ADD => cron_add(state, &params).await,
        methods::CRON_LIST => cron_list(state),
        methods::CRON_UPDATE => cron_update(state, &params).await,
        methods::CRON_REMOVE => cron_remove(state, &params).await,
        methods::CRON_RUN => cron_run(state, &params).await,
        methods::SESSIONS_LIST => sessions_list(state),
        methods::SESSIONS_HISTORY => sessions_history(state, &params),
        methods::SESSIONS_SEND => chat_send(state, &params).await,
        methods::SESSIONS_PATCH => sessions_patch(state, &params).await,
        methods::VOICEWAKE_GET => Ok(json!(&*state.voicewake.read())),
        methods::VOICEWAKE_SET => voicewake_set(state, &params),
        methods::NODE_LIST => Ok(json!({ "nodes": state.nodes.list() })),
        methods::NODE_DESCRIBE => node_describe(state, &params),
        methods::NODE_INVOKE => node_invoke(state, &params).await,
        methods::EXEC_RUN => exec_run(state, &params).await,
        methods::EXEC_APPROVE => exec_approve(state, &params),
        methods::EXEC_APPROVALS => Ok(json!({"pending": state.approvals.list_pending()})),
        methods::SEND => send_message(state, &params).await,
        other => Err((
            ErrorCode::InvalidRequest,
            format!("unknown method '{other}'"),
        )),
    };

    match result {
        Ok(value) => Frame::response(id, value),
        Err((code, message)) => Frame::error_response(id, code, message),
    }
}

type MethodResult = std::result::Result<Value, (ErrorCode, String)>;

fn need_str<'a>(params: &'a Value, field: &str) -> std::result::Result<&'a str, (ErrorCode, String)> {
    params
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            (
                ErrorCode::InvalidRequest,
                format!("missing required param '{field}'"),
            )
        })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inbound channel traffic
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An adapter delivered a user message: resolve the session, apply
/// directives, gate groups and unknown DM senders, queue the turn.
async fn channel_inbound(state: &AppState, params: &Value) -> MethodResult {
    let msg: oc_sessions::InboundMessage = serde_json::from_value(params.clone())
        .map_err(|e| (ErrorCode::InvalidRequest, format!("invalid inbound message: {e}")))?;

    let entry_activation = {
        let key = state.router.session_key(&msg);
        state.sessions.get(&key).map(|e| e.group_activation)
    };

    match state.router.route(&msg, entry_activation) {
        RouteOutcome::Skip { reason } => Ok(json!({"skipped": format!("{reason:?}")})),
        RouteOutcome::PairingReply { .. } => {
            let code = state
                .pairing
                .issue(&msg.surface, &msg.sender_id)
                .await
                .map_err(|e| (ErrorCode::Unavailable, e.to_string()))?;
            Ok(json!({
                "pairing": code,
                "reply": format!(
                    "Pairing required. Ask the operator to run: clawdbot pairing approve {code} --provider {}",
                    msg.surface
                ),
            }))
        }
        RouteOutcome::Directive { key, directive } => {
            let reply = apply_directive(state, &key, directive).await?;
            Ok(json!({"directive": true, "reply": reply}))
        }
        RouteOutcome::Turn { key } => {
            state
                .sessions
                .resolve_or_create(&key)
                .await
                .map_err(|e| (ErrorCode::Unavailable, e.to_string()))?;
            // Remember where replies go for this session.
            let surface = msg.surface.clone();
            let reply_to = msg.sender_id.clone();
            let thread = msg.thread_id.clone();
            state
                .sessions
                .update(&key, move |entry| {
                    entry.delivery_context.channel = Some(surface);
                    entry.delivery_context.to = Some(reply_to);
                    entry.delivery_context.thread_id = thread;
                })
                .await
                .map_err(|e| (ErrorCode::Unavailable, e.to_string()))?;

            let mut request = TurnRequest::new(key.clone(), &msg.body);
            request.message_id = msg.message_id.clone();
            submit_turn(state, key, request).await
        }
    }
}

/// Apply a session directive and produce the operator-visible reply.
async fn apply_directive(
    state: &AppState,
    key: &SessionKey,
    directive: oc_sessions::Directive,
) -> std::result::Result<String, (ErrorCode, String)> {
    use oc_sessions::Directive;

    state
        .sessions
        .resolve_or_create(key)
        .await
        .map_err(|e| (ErrorCode::Unavailable, e.to_string()))?;

    let emit_update = |entry: &oc_sessions::SessionEntry| {
        state.events.emit(
            events::SESSION_UPDATED,
            json!({"sessionKey": key.as_str(), "entry": entry}),
        );
    };

    let reply = match directive {
        Directive::Think(level) => {
            let entry = state
                .sessions
                .update(key, move |e| e.thinking_level = level)
                .await
                .map_err(|e| (ErrorCode::Unavailable, e.to_string()))?;
            if let Some(entry) = entry {
                emit_update(&entry);
            }
            format!("thinking level set to {level:?}").to_lowercase()
        }
        Directive::Verbose(level) => {
            state
                .sessions
                .update(key, move |e| e.verbose_level = level)
                .await
                .map_err(|e| (ErrorCode::Unavailable, e.to_string()))?;
            format!("verbose {level:?}").to_lowercase()
        }
        Directive::Elevated(level) => {
            let allowed = state.config.read().agent.bash.elevated.enabled;
            if !allowed {
                return Ok("elevated execution is disabled in config".into());
            }
            state
                .sessions
                .update(key, move |e| e.elevated_level = level)
                .await
                .map_err(|e| (ErrorCode::Unavailable, e.to_string()))?;
            format!("elevated {level:?}").to_lowercase()
        }
        Directive::Model(model_ref) => match model_ref {
            Some(model_ref) => {
                let (provider, model) = model_ref
                    .split_once('/')
                    .ok_or((
                        ErrorCode::InvalidRequest,
                        "model must be provider/model".to_owned(),
                    ))?;
                let provider = provider.to_owned();
                let model = model.to_owned();
                state
                    .sessions
                    .update(key, move |e| {
                        e.model_provider = Some(provider);
                        e.model = Some(model);
                    })
                    .await
                    .map_err(|e| (ErrorCode::Unavailable, e.to_string()))?;
                format!("model pinned to {model_ref}")
            }
            None => {
                state
                    .sessions
                    .update(key, |e| {
                        e.model_provider = None;
                        e.model = None;
                    })
                    .await
                    .map_err(|e| (ErrorCode::Unavailable, e.to_string()))?;
                "model override cleared".into()
            }
        },
        Directive::Reset => {
            state
                .sessions
                .reset(key)
                .await
                .map_err(|e| (ErrorCode::Unavailable, e.to_string()))?;
            "session reset".into()
        }
        Directive::Compact => {
            // Compaction runs inside the agent runtime; queue a turn that
            // asks for it.
            let request = TurnRequest::new(key.clone(), "/compact");
            state
                .dispatcher
                .submit(key, request, QueueMode::Followup)
                .await;
            "compaction queued".into()
        }
        Directive::Activation(activation) => {
            state
                .sessions
                .update(key, move |e| e.group_activation = activation)
                .await
                .map_err(|e| (ErrorCode::Unavailable, e.to_string()))?;
            format!("activation {activation:?}").to_lowercase()
        }
        Directive::Status => {
            let entry = state.sessions.get(key);
            match entry {
                Some(e) => format!(
                    "session {} · model {} · thinking {:?} · {} tokens",
                    key.as_str(),
                    e.model.as_deref().unwrap_or("default"),
                    e.thinking_level,
                    e.total_tokens
                ),
                None => "no session state yet".into(),
            }
        }
        Directive::WhoAmI => format!("session key: {}", key.as_str()),
        Directive::Commands => oc_sessions::commands::commands_help().to_owned(),
    };
    Ok(reply)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Chat
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn chat_send(state: &AppState, params: &Value) -> MethodResult {
    let message = need_str(params, "message")?;
    let session_key = params
        .get("sessionKey")
        .and_then(Value::as_str)
        .map(SessionKey::named)
        .unwrap_or_else(|| {
            SessionKey::main(&state.agent_id, &state.config.read().session.main_key)
        });

    let mut request = TurnRequest::new(session_key.clone(), message);
    request.model_override = params
        .get("model")
        .and_then(Value::as_str)
        .map(str::to_owned);

    // Idempotent dispatch: a retried send with the same key returns the
    // original run id instead of starting a second turn.
    if let Some(key) = params.get("idempotencyKey").and_then(Value::as_str) {
        let mut seen = state.idempotency.lock();
        if let Some(run_id) = seen.get(key) {
            return Ok(json!({"runId": run_id, "deduplicated": true}));
        }
        seen.insert(key.to_owned(), request.run_id.clone());
    }

    submit_turn(state, session_key, request).await
}

async fn submit_turn(
    state: &AppState,
    session_key: SessionKey,
    mut request: TurnRequest,
) -> MethodResult {
    let entry = state.sessions.resolve_or_create(&session_key).await;
    let queue_mode = match entry {
        Ok((entry, _)) => entry.queue_mode,
        Err(e) => return Err((ErrorCode::Unavailable, e.to_string())),
    };
    request.heartbeat = request.prompt.trim() == "HEARTBEAT_OK";

    let run_id = request.run_id.clone();
    let outcome = state.dispatcher.submit(&session_key, request, queue_mode).await;
    Ok(json!({"runId": run_id, "outcome": format!("{outcome:?}").to_lowercase()}))
}

async fn chat_inject(state: &AppState, params: &Value) -> MethodResult {
    let session_key = SessionKey::named(need_str(params, "sessionKey")?);
    let message = need_str(params, "message")?;
    // Injection is a steer without a fallback turn: delivered to the
    // active run or rejected.
    let request = TurnRequest::new(session_key.clone(), message);
    let outcome = state
        .dispatcher
        .submit(&session_key, request, QueueMode::Steer)
        .await;
    Ok(json!({"outcome": format!("{outcome:?}").to_lowercase()}))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn config_get(state: &AppState) -> MethodResult {
    serde_json::to_value(&*state.config.read())
        .map_err(|e| (ErrorCode::Unavailable, e.to_string()))
}

fn config_set(state: &AppState, params: &Value) -> MethodResult {
    let Some(new_config) = params.get("config") else {
        return Err((
            ErrorCode::InvalidRequest,
            "missing required param 'config'".into(),
        ));
    };
    let parsed: oc_domain::config::Config = serde_json::from_value(new_config.clone())
        .map_err(|e| (ErrorCode::InvalidRequest, format!("invalid config: {e}")))?;
    let issues = parsed.validate();
    if issues
        .iter()
        .any(|i| i.severity == oc_domain::config::ConfigSeverity::Error)
    {
        let summary: Vec<String> = issues.iter().map(|i| i.to_string()).collect();
        return Err((
            ErrorCode::InvalidRequest,
            format!("config rejected: {}", summary.join("; ")),
        ));
    }
    *state.config.write() = parsed;
    Ok(json!({"ok": true}))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Cron
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn cron_add(state: &AppState, params: &Value) -> MethodResult {
    let name = need_str(params, "name")?;
    let message = need_str(params, "message")?;
    let schedule: CronSchedule = params
        .get("schedule")
        .cloned()
        .ok_or_else(|| {
            (
                ErrorCode::InvalidRequest,
                "missing required param 'schedule'".into(),
            )
        })
        .and_then(|v| {
            serde_json::from_value(v)
                .map_err(|e| (ErrorCode::InvalidRequest, format!("invalid schedule: {e}")))
        })?;

    let mut job = CronJob::new(name, schedule, message);
    if let Some(target) = params.get("sessionTarget") {
        job.session_target = serde_json::from_value::<SessionTarget>(target.clone())
            .map_err(|e| (ErrorCode::InvalidRequest, format!("invalid sessionTarget: {e}")))?;
    }
    if let Some(delivery) = params.get("delivery") {
        job.delivery = serde_json::from_value::<CronDelivery>(delivery.clone())
            .map_err(|e| (ErrorCode::InvalidRequest, format!("invalid delivery: {e}")))?;
    }

    let stored = state
        .cron
        .add(job)
        .await
        .map_err(|e| (ErrorCode::Unavailable, e.to_string()))?;
    Ok(json!({"job": stored}))
}

fn cron_list(state: &AppState) -> MethodResult {
    Ok(json!({"jobs": state.cron.list()}))
}

async fn cron_update(state: &AppState, params: &Value) -> MethodResult {
    let id = parse_job_id(params)?;
    let enabled = params.get("enabled").and_then(Value::as_bool);
    let name = params
        .get("name")
        .and_then(Value::as_str)
        .map(str::to_owned);
    let updated = state
        .cron
        .update(id, move |job| {
            if let Some(enabled) = enabled {
                job.enabled = enabled;
            }
            if let Some(name) = name {
                job.name = name;
            }
        })
        .await
        .map_err(|e| (ErrorCode::Unavailable, e.to_string()))?;
    match updated {
        Some(job) => Ok(json!({"job": job})),
        None => Err((ErrorCode::InvalidRequest, format!("no job with id {id}"))),
    }
}

async fn cron_remove(state: &AppState, params: &Value) -> MethodResult {
    let id = parse_job_id(params)?;
    let removed = state
        .cron
        .remove(id)
        .await
        .map_err(|e| (ErrorCode::Unavailable, e.to_string()))?;
    Ok(json!({"removed": removed}))
}

async fn cron_run(state: &AppState, params: &Value) -> MethodResult {
    let id = parse_job_id(params)?;
    let force = params
        .get("force")
        .and_then(Value::as_bool)
        .unwrap_or(true);
    let mode = if force { RunMode::Force } else { RunMode::Due };
    let outcome = state
        .cron
        .run(id, mode)
        .await
        .map_err(|e| (ErrorCode::Unavailable, e.to_string()))?;
    Ok(json!({"ran": outcome.ran, "reason": outcome.reason}))
}

fn parse_job_id(params: &Value) -> std::result::Result<uuid::Uuid, (ErrorCode, String)> {
    need_str(params, "jobId")?
        .parse::<uuid::Uuid>()
        .map_err(|e| (ErrorCode::InvalidRequest, format!("invalid jobId: {e}")))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sessions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn sessions_list(state: &AppState) -> MethodResult {
    let sessions: Vec<Value> = state
        .sessions
        .list()
        .into_iter()
        .map(|(key, entry)| json!({"sessionKey": key.as_str(), "entry": entry}))
        .collect();
    Ok(json!({"sessions": sessions}))
}

fn sessions_history(state: &AppState, params: &Value) -> MethodResult {
    let key = SessionKey::named(need_str(params, "sessionKey")?);
    let Some(entry) = state.sessions.get(&key) else {
        return Err((
            ErrorCode::InvalidRequest,
            format!("unknown session '{}'", key.as_str()),
        ));
    };
    let transcript = std::fs::read_to_string(&entry.session_file).unwrap_or_default();
    let lines: Vec<Value> = transcript
        .lines()
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect();
    Ok(json!({"sessionKey": key.as_str(), "history": lines}))
}

async fn sessions_patch(state: &AppState, params: &Value) -> MethodResult {
    let key = SessionKey::named(need_str(params, "sessionKey")?);
    let patch = params.get("patch").cloned().unwrap_or(Value::Null);

    let thinking = patch
        .get("thinkingLevel")
        .and_then(Value::as_str)
        .and_then(oc_domain::levels::ThinkingLevel::parse);
    let queue_mode = patch
        .get("queueMode")
        .and_then(Value::as_str)
        .and_then(QueueMode::parse);
    let model = patch.get("model").and_then(Value::as_str).map(str::to_owned);
    let model_provider = patch
        .get("modelProvider")
        .and_then(Value::as_str)
        .map(str::to_owned);

    let updated = state
        .sessions
        .update(&key, move |entry| {
            if let Some(level) = thinking {
                entry.thinking_level = level;
            }
            if let Some(mode) = queue_mode {
                entry.queue_mode = mode;
            }
            if let Some(model) = model {
                entry.model = Some(model);
            }
            if let Some(provider) = model_provider {
                entry.model_provider = Some(provider);
            }
        })
        .await
        .map_err(|e| (ErrorCode::Unavailable, e.to_string()))?;

    match updated {
        Some(entry) => {
            state.events.emit(
                events::SESSION_UPDATED,
                json!({"sessionKey": key.as_str(), "entry": entry}),
            );
            Ok(json!({"ok": true}))
        }
        None => Err((
            ErrorCode::InvalidRequest,
            format!("unknown session '{}'", key.as_str()),
        )),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Voice wake / nodes / send
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn voicewake_set(state: &AppState, params: &Value) -> MethodResult {
    let enabled = params.get("enabled").and_then(Value::as_bool);
    let phrase = params.get("phrase").and_then(Value::as_str);
    {
        let mut vw = state.voicewake.write();
        if let Some(enabled) = enabled {
            vw.enabled = enabled;
        }
        if let Some(phrase) = phrase {
            vw.phrase = phrase.to_owned();
        }
    }
    let current = state.voicewake.read().clone();
    state
        .events
        .emit(events::VOICEWAKE_CHANGED, json!(&current));
    Ok(json!(&current))
}

fn node_describe(state: &AppState, params: &Value) -> MethodResult {
    let node_id = need_str(params, "nodeId")?;
    match state.nodes.describe(node_id) {
        Some(descriptor) => Ok(json!({"node": descriptor})),
        None => Err((
            ErrorCode::Unavailable,
            format!("node '{node_id}' not connected"),
        )),
    }
}

async fn node_invoke(state: &AppState, params: &Value) -> MethodResult {
    let invoke = NodeInvoke {
        node_id: need_str(params, "nodeId")?.to_owned(),
        cmd: need_str(params, "cmd")?.to_owned(),
        params_json: params
            .get("paramsJson")
            .and_then(Value::as_str)
            .map(str::to_owned),
        timeout_seconds: params.get("timeoutSeconds").and_then(Value::as_u64),
    };
    let cmd = invoke.cmd.clone();
    let is_exec = cmd == "system.run";
    let node_id = invoke.node_id.clone();
    let policy = state.policy_context(None);

    let mut outcome = state.node_host.invoke(invoke.clone(), &policy).await;
    // An approvable system.run miss parks for the operator, then retries
    // with the verdict threaded into the policy context.
    let needs_approval = matches!(&outcome, NodeInvokeOutcome::PolicyDenied(d) if d.requires_ask);
    if needs_approval {
        let command = invoke
            .params_json
            .as_deref()
            .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
            .and_then(|v| v["command"].as_str().map(str::to_owned));
        if let Some(command) = command {
            if let Some(approval) = state.await_approval(&command).await {
                let policy = state.policy_context(Some(approval));
                outcome = state.node_host.invoke(invoke, &policy).await;
            }
        }
    }

    match outcome {
        NodeInvokeOutcome::Ok(value) => {
            if is_exec {
                state
                    .events
                    .emit(events::EXEC_STARTED, json!({"cmd": cmd, "nodeId": node_id}));
                // Allowlist use tracking for the command that just ran.
                let command = params
                    .get("paramsJson")
                    .and_then(Value::as_str)
                    .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
                    .and_then(|v| v["command"].as_str().map(str::to_owned));
                if let Some(command) = command {
                    let _ = state.allowlist.record_use(&command).await;
                }
                state
                    .events
                    .emit(events::EXEC_FINISHED, json!({"cmd": cmd, "success": true}));
            }
            Ok(value)
        }
        NodeInvokeOutcome::PolicyDenied(decision) => {
            // Denied is the policy verdict, never a failed-run signal.
            state.events.emit(
                events::EXEC_DENIED,
                json!({
                    "cmd": cmd,
                    "eventReason": decision.event_reason,
                }),
            );
            Err((
                ErrorCode::InvalidRequest,
                decision
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "command denied by policy".into()),
            ))
        }
        NodeInvokeOutcome::Err { code, message } => {
            // Policy-allowed but failed runs (node timeout, disconnect)
            // finish unsuccessfully; capability/permission gate errors
            // never started a run and emit nothing.
            if is_exec && code == ErrorCode::Unavailable {
                state
                    .events
                    .emit(events::EXEC_STARTED, json!({"cmd": cmd, "nodeId": node_id}));
                state.events.emit(
                    events::EXEC_FINISHED,
                    json!({"cmd": cmd, "success": false, "error": message}),
                );
            }
            Err((code, message))
        }
    }
}

/// Policy-gated local shell execution.
///
/// `exec.denied` fires iff the policy engine refused; a policy-allowed
/// command that fails emits `exec.finished` with `success = false`. An
/// allowlist miss that only needs a human decision parks the run until
/// the operator resolves it with `exec.approve` (or the timeout denies).
async fn exec_run(state: &AppState, params: &Value) -> MethodResult {
    let command = need_str(params, "command")?.to_owned();
    let timeout_ms = params
        .get("timeoutMs")
        .and_then(Value::as_u64)
        .unwrap_or(60_000);

    let spec = oc_policy::CommandSpec::Shell(command.clone());
    let mut decision = oc_policy::evaluate(&spec, &state.policy_context(None));
    if !decision.allowed && decision.requires_ask {
        // Approvable miss: wait for the operator's verdict.
        let approval = state.await_approval(&command).await;
        decision = oc_policy::evaluate(&spec, &state.policy_context(approval));
    }
    if !decision.allowed {
        state.events.emit(
            events::EXEC_DENIED,
            json!({"command": command, "eventReason": decision.event_reason}),
        );
        return Err((
            ErrorCode::InvalidRequest,
            decision
                .error_message
                .unwrap_or_else(|| "command denied by policy".into()),
        ));
    }

    state
        .events
        .emit(events::EXEC_STARTED, json!({"command": command}));

    let exit = state
        .supervisor
        .run(oc_proc::RunOptions {
            argv: vec!["sh".into(), "-c".into(), command.clone()],
            overall_timeout: Some(std::time::Duration::from_millis(timeout_ms.max(1))),
            capture_output: true,
            ..Default::default()
        })
        .await
        .map_err(|e| (ErrorCode::Unavailable, e.to_string()))?;

    let _ = state.allowlist.record_use(&command).await;
    let success = exit.reason == oc_proc::ExitReason::Exit && exit.exit_code == Some(0);
    state.events.emit(
        events::EXEC_FINISHED,
        json!({"command": command, "success": success, "exitCode": exit.exit_code}),
    );

    Ok(json!({
        "exitCode": exit.exit_code,
        "timedOut": exit.timed_out,
        "noOutputTimedOut": exit.no_output_timed_out,
        "stdout": exit.stdout,
        "stderr": exit.stderr,
    }))
}

/// Resolve a parked exec approval.
///
/// `decision` is `allow-once`, `allow-always` (also persists the derived
/// allowlist pattern), or `deny` with an optional `reason`.
fn exec_approve(state: &AppState, params: &Value) -> MethodResult {
    let id = need_str(params, "id")?
        .parse::<uuid::Uuid>()
        .map_err(|e| (ErrorCode::InvalidRequest, format!("invalid id: {e}")))?;
    let decision = need_str(params, "decision")?;

    let resolved = match decision {
        "allow-once" => state
            .approvals
            .approve(&id, oc_policy::ApprovalDecision::AllowOnce),
        "allow-always" => state
            .approvals
            .approve(&id, oc_policy::ApprovalDecision::AllowAlways),
        "deny" => {
            let reason = params
                .get("reason")
                .and_then(Value::as_str)
                .map(str::to_owned);
            state.approvals.deny(&id, reason)
        }
        other => {
            return Err((
                ErrorCode::InvalidRequest,
                format!("decision must be allow-once, allow-always, or deny (got '{other}')"),
            ))
        }
    };
    if !resolved {
        return Err((
            ErrorCode::InvalidRequest,
            format!("no pending approval with id {id}"),
        ));
    }
    Ok(json!({"resolved": true}))
}

/// Outbound `send`: deliver text to a channel recipient.
async fn send_message(state: &AppState, params: &Value) -> MethodResult {
    let channel = need_str(params, "channel")?;
    let to = need_str(params, "to")?;
    let text = need_str(params, "text")?;

    // Discord targets resolve through the session's recorded context so a
    // bare numeric id is never guessed at.
    let resolved_to = if channel == "discord" {
        let ctx = params
            .get("sessionKey")
            .and_then(Value::as_str)
            .map(SessionKey::named)
            .and_then(|key| state.sessions.get(&key))
            .map(|entry| entry.delivery_context);
        match resolve_discord_target(to, ctx.as_ref()) {
            Ok(target) => match target {
                crate::delivery::DiscordTarget::User(id) => format!("user:{id}"),
                crate::delivery::DiscordTarget::Channel(id) => format!("channel:{id}"),
            },
            Err(e) => return Err((ErrorCode::InvalidRequest, e.to_string())),
        }
    } else {
        to.to_owned()
    };

    let Some(sink) = state.sinks.get(channel) else {
        return Err((
            ErrorCode::Unavailable,
            format!("no outbound adapter connected for channel '{channel}'"),
        ));
    };
    sink.send(&resolved_to, text, &[], None)
        .await
        .map_err(|e| (ErrorCode::Unavailable, e.to_string()))?;
    Ok(json!({"ok": true}))
}
