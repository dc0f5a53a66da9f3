use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use sha2::{Digest, Sha256};
use tracing_subscriber::EnvFilter;

use oc_cron::{
    CronDeliveryMode, CronJob, CronScheduler, CronStore, JobExecutor, RunResult, SessionTarget,
};
use oc_domain::config::{Config, ConfigSeverity};
use oc_domain::levels::QueueMode;
use oc_gateway::agent::llm::AnthropicStream;
use oc_gateway::agent::{AgentRunner, AuthProfileStore, ModelRegistry, TurnRequest};
use oc_gateway::approval::ApprovalStore;
use oc_gateway::cli::profile::apply_profile;
use oc_gateway::cli::{
    Cli, Command, GatewayCommand, GmailCommand, HooksCommand, ModelsCommand, PairingCommand,
    SkillsCommand,
};
use oc_gateway::delivery::ThreadBindingStore;
use oc_gateway::dispatch::Dispatcher;
use oc_gateway::hooks::HookRunner;
use oc_gateway::nodes::{NodeHost, NodeRegistry};
use oc_gateway::server;
use oc_gateway::server::events::EventHub;
use oc_gateway::state::{AppState, ChatExecutor, SinkRegistry, VoiceWake};
use oc_policy::AllowlistStore;
use oc_proc::ProcessSupervisor;
use oc_protocol::{build_relay_ws_url, Frame};
use oc_sessions::{PairingStore, Router, SessionKey, SessionStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = apply_profile(
        &std::env::args().collect::<Vec<_>>(),
        std::env::var("CLAWDBOT_PROFILE").ok().as_deref(),
    );
    let cli = Cli::parse_from(args);

    let state_dir = resolve_state_dir(cli.profile.as_deref())?;

    match cli.command {
        None | Some(Command::Gateway(GatewayCommand::Start)) => {
            init_tracing();
            let config = load_config(&state_dir)?;
            run_server(config, state_dir).await
        }
        Some(Command::Gateway(GatewayCommand::Stop)) => {
            if oc_gateway::cli::pid::stop(&state_dir)? {
                println!("gateway stopped");
            } else {
                println!("no gateway running");
            }
            Ok(())
        }
        Some(Command::Gateway(GatewayCommand::Restart)) => {
            oc_gateway::cli::pid::stop(&state_dir)?;
            init_tracing();
            let config = load_config(&state_dir)?;
            run_server(config, state_dir).await
        }
        Some(Command::Onboard) => onboard(&state_dir),
        Some(Command::Doctor) => {
            let config = load_config(&state_dir)?;
            let (checks, passed) = oc_gateway::cli::doctor::run(&config, &state_dir);
            for check in &checks {
                let mark = if check.ok { "ok " } else { "FAIL" };
                println!("[{mark}] {:<18} {}", check.name, check.detail);
            }
            if !passed {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Agent {
            message,
            session,
            model,
        }) => {
            let config = load_config(&state_dir)?;
            let mut params = serde_json::json!({"message": message});
            if let Some(session) = session {
                params["sessionKey"] = serde_json::json!(session);
            }
            if let Some(model) = model {
                params["model"] = serde_json::json!(model);
            }
            let reply = ws_request(&config, "chat.send", params, true).await?;
            println!("{reply}");
            Ok(())
        }
        Some(Command::Send {
            channel,
            to,
            message,
        }) => {
            let config = load_config(&state_dir)?;
            let params = serde_json::json!({"channel": channel, "to": to, "text": message});
            ws_request(&config, "send", params, false).await?;
            println!("sent");
            Ok(())
        }
        Some(Command::Pairing(cmd)) => pairing_cmd(&state_dir, cmd).await,
        Some(Command::Hooks(HooksCommand::Gmail(cmd))) => gmail_cmd(&state_dir, cmd).await,
        Some(Command::Models(cmd)) => models_cmd(&state_dir, cmd).await,
        Some(Command::Skills(cmd)) => skills_cmd(&state_dir, cmd),
    }
}

fn skills_cmd(state_dir: &std::path::Path, cmd: SkillsCommand) -> anyhow::Result<()> {
    let tools_root = state_dir.join("tools");
    match cmd {
        SkillsCommand::Install {
            archive,
            name,
            strip_components,
        } => {
            // The target must stay inside the skill root even when the
            // name smuggles path separators.
            let target = oc_store::archive::resolve_in_root(&tools_root, &name)
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            std::fs::create_dir_all(&target)?;
            oc_store::archive::safe_extract_tgz(&archive, &target, strip_components)
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            println!("installed skill '{name}' at {}", target.display());
            Ok(())
        }
        SkillsCommand::List => {
            if let Ok(entries) = std::fs::read_dir(&tools_root) {
                for entry in entries.flatten() {
                    if entry.path().is_dir() {
                        println!("{}", entry.file_name().to_string_lossy());
                    }
                }
            }
            Ok(())
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,oc_gateway=debug")),
        )
        .json()
        .init();
}

fn resolve_state_dir(profile: Option<&str>) -> anyhow::Result<PathBuf> {
    let base = oc_store::state_dir::resolve_state_dir().context("resolving state dir")?;
    match profile {
        Some(name) => {
            let dir = base.join("profiles").join(name);
            std::fs::create_dir_all(&dir)?;
            Ok(dir)
        }
        None => Ok(base),
    }
}

fn config_path(state_dir: &std::path::Path) -> PathBuf {
    state_dir.join("clawdbot.toml")
}

fn load_config(state_dir: &std::path::Path) -> anyhow::Result<Config> {
    let path = config_path(state_dir);
    if !path.exists() {
        return Ok(Config::default());
    }
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

fn save_config(state_dir: &std::path::Path, config: &Config) -> anyhow::Result<()> {
    let toml_out = toml::to_string_pretty(config).context("serializing config")?;
    std::fs::write(config_path(state_dir), toml_out)?;
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn run_server(config: Config, state_dir: PathBuf) -> anyhow::Result<()> {
    tracing::info!(state_dir = %state_dir.display(), "clawdbot gateway starting");

    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!("config validation failed");
    }

    let agent_id = "claw".to_owned();

    // ── Gateway token (read once, hashed for constant-time compare) ──
    let token_hash = match std::env::var(&config.gateway.auth.token_env) {
        Ok(token) if !token.is_empty() => Some(Arc::new(Sha256::digest(token.as_bytes()).to_vec())),
        _ => {
            tracing::warn!(
                env = %config.gateway.auth.token_env,
                "gateway token not set — only tailscale-identity peers can connect"
            );
            None
        }
    };

    // ── Stores ───────────────────────────────────────────────────────
    let sessions = Arc::new(SessionStore::open(&state_dir, &agent_id)?);
    let pairing = Arc::new(PairingStore::open(&state_dir)?);
    let allowlist = Arc::new(AllowlistStore::open(&state_dir, &agent_id)?);
    let profiles = Arc::new(AuthProfileStore::open(&state_dir)?);
    let thread_bindings = Arc::new(ThreadBindingStore::open(&state_dir)?);
    let approvals = Arc::new(ApprovalStore::new(std::time::Duration::from_secs(
        config.tools.exec.approval_timeout_secs,
    )));
    tracing::info!("durable stores ready");

    // ── Router ───────────────────────────────────────────────────────
    let router = Arc::new(Router::new(
        agent_id.clone(),
        config.session.main_key.clone(),
        config.session.scope,
        config.channels.clone(),
    ));

    // ── Agent runner ─────────────────────────────────────────────────
    // Plugin handlers register here at startup when hooks are enabled;
    // catch_errors keeps one misbehaving plugin from ending turns.
    let hooks = Arc::new(HookRunner::new(true));
    if !config.hooks.enabled {
        tracing::debug!("plugin hooks disabled by config");
    }
    let registry = Arc::new(ModelRegistry::with_defaults());
    let config = Arc::new(config);
    let runner = Arc::new(AgentRunner {
        config: config.clone(),
        registry: registry.clone(),
        profiles: profiles.clone(),
        sessions: sessions.clone(),
        hooks,
        stream_fn: Arc::new(AnthropicStream::new()),
        prompt_context: Vec::new(),
    });

    // ── Events + dispatch ────────────────────────────────────────────
    let events = Arc::new(EventHub::default());
    let sinks = Arc::new(SinkRegistry::default());
    let executor = Arc::new(ChatExecutor {
        runner: runner.clone(),
        sessions: sessions.clone(),
        sinks: sinks.clone(),
        events: events.clone(),
    });
    let dispatcher = Arc::new(Dispatcher::new(executor, config.agent.max_concurrent));

    // ── Cron scheduler ───────────────────────────────────────────────
    let cron_store = CronStore::open(&state_dir, &agent_id)?;
    let cron_executor = Arc::new(CronTurnExecutor {
        dispatcher: dispatcher.clone(),
        events: events.clone(),
        sessions: sessions.clone(),
        agent_id: agent_id.clone(),
        main_key: config.session.main_key.clone(),
        timeout_secs: config.agent.timeout_seconds.max(30),
    });
    let cron = CronScheduler::new(cron_store, cron_executor);
    let cron_task = cron.start().await?;
    tracing::info!("cron scheduler armed");

    // Relay cron lifecycle events onto the protocol stream.
    {
        let events = events.clone();
        let mut cron_events = cron.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = cron_events.recv().await {
                events.emit(
                    oc_protocol::events::CRON_JOB,
                    serde_json::to_value(&event).unwrap_or_default(),
                );
            }
        });
    }

    // ── Nodes ────────────────────────────────────────────────────────
    let nodes = NodeRegistry::new();
    let node_host = Arc::new(NodeHost::new(nodes.clone()));
    {
        let nodes = nodes.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
            loop {
                interval.tick().await;
                nodes.prune_stale(120);
            }
        });
    }

    // ── App state + bind ─────────────────────────────────────────────
    let state = AppState {
        config: Arc::new(parking_lot::RwLock::new((*config).clone())),
        state_dir: state_dir.clone(),
        agent_id,
        sessions,
        router,
        pairing,
        allowlist,
        profiles,
        approvals,
        token_hash,
        runner,
        dispatcher,
        cron,
        supervisor: Arc::new(ProcessSupervisor::new()),
        nodes,
        node_host,
        events,
        thread_bindings,
        sinks,
        voicewake: Arc::new(parking_lot::RwLock::new(VoiceWake::default())),
        idempotency: Arc::new(parking_lot::Mutex::new(std::collections::HashMap::new())),
    };

    let (bind, port) = {
        let c = state.config.read();
        (c.gateway.bind, c.gateway.port)
    };
    let addr = server::bind_addr(bind, port, None);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(addr = %addr, "gateway listening");

    oc_gateway::cli::pid::write_pid(&state_dir)?;
    let app = server::router(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower::limit::ConcurrencyLimitLayer::new(256));

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await;

    oc_gateway::cli::pid::clear_pid(&state_dir);
    cron_task.abort();
    result.context("server error")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Cron → dispatch bridge
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Runs cron job bodies by queueing an agent turn on the target session
/// and waiting for its final chat event.
struct CronTurnExecutor {
    dispatcher: Arc<Dispatcher>,
    events: Arc<EventHub>,
    sessions: Arc<SessionStore>,
    agent_id: String,
    main_key: String,
    timeout_secs: u64,
}

#[async_trait]
impl JobExecutor for CronTurnExecutor {
    async fn execute(&self, job: &CronJob) -> RunResult {
        let oc_cron::CronPayload::AgentTurn { message } = &job.payload;
        let key = match &job.session_target {
            SessionTarget::Main => SessionKey::main(&self.agent_id, &self.main_key),
            SessionTarget::Isolated => SessionKey::named(format!(
                "agent:{}:cron:{}:{}",
                self.agent_id,
                job.id,
                uuid::Uuid::new_v4()
            )),
            SessionTarget::Named { key } => SessionKey::named(key.clone()),
        };

        // Direct delivery pins the target session's outbound context to
        // the job's explicit channel/recipient before the turn runs.
        if job.delivery.mode == CronDeliveryMode::Direct {
            if let (Some(channel), Some(to)) = (&job.delivery.channel, &job.delivery.to) {
                if self.sessions.resolve_or_create(&key).await.is_ok() {
                    let channel = channel.clone();
                    let to = to.clone();
                    let _ = self
                        .sessions
                        .update(&key, move |entry| {
                            entry.delivery_context.channel = Some(channel);
                            entry.delivery_context.to = Some(to);
                        })
                        .await;
                }
            }
        }

        let mut request = TurnRequest::new(key.clone(), message.clone());
        // Silent jobs run without typing indicators or announcements.
        request.heartbeat = job.delivery.mode == CronDeliveryMode::Silent;
        let run_id = request.run_id.clone();

        let (_, mut event_rx) = self.events.subscribe();
        self.dispatcher.submit(&key, request, QueueMode::Followup).await;

        // Wait for this run's final event.
        let deadline =
            tokio::time::Instant::now() + std::time::Duration::from_secs(self.timeout_secs);
        loop {
            let frame = tokio::select! {
                frame = event_rx.recv() => frame,
                _ = tokio::time::sleep_until(deadline) => {
                    return RunResult::failure("cron turn timed out");
                }
            };
            let Ok(frame) = frame else {
                return RunResult::failure("event stream closed");
            };
            if frame.event.as_deref() != Some(oc_protocol::events::CHAT) {
                continue;
            }
            let Some(params) = frame.params else { continue };
            if params["state"] == "final" && params["runId"] == run_id.as_str() {
                return match params["error"].as_str() {
                    Some(error) => RunResult::failure(error),
                    None => RunResult::success(match job.delivery.mode {
                        CronDeliveryMode::Silent => "silent",
                        CronDeliveryMode::Announce => "announced",
                        CronDeliveryMode::Direct => "delivered",
                    }),
                };
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// CLI subcommands
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn onboard(state_dir: &std::path::Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(state_dir)?;
    let path = config_path(state_dir);
    if !path.exists() {
        save_config(state_dir, &Config::default())?;
        println!("wrote {}", path.display());
    }
    let auth = state_dir.join("auth.json");
    if !auth.exists() {
        std::fs::write(&auth, "{\"profiles\": [], \"order\": []}\n")?;
        println!("wrote {}", auth.display());
    }
    let token = uuid::Uuid::new_v4().simple().to_string();
    println!("state dir: {}", state_dir.display());
    println!("next steps:");
    println!("  export OPENCLAW_GATEWAY_TOKEN={token}");
    println!("  add an auth profile to auth.json");
    println!("  clawdbot gateway start");
    Ok(())
}

async fn pairing_cmd(state_dir: &std::path::Path, cmd: PairingCommand) -> anyhow::Result<()> {
    let store = PairingStore::open(state_dir)?;
    match cmd {
        PairingCommand::List { provider } => {
            for code in store.list(provider.as_deref()) {
                println!("{}  {}  {}", code.code, code.channel, code.sender_id);
            }
            Ok(())
        }
        PairingCommand::Approve { code, provider } => {
            let Some(paired) = store.approve(&code).await? else {
                anyhow::bail!("unknown or expired pairing code");
            };
            if paired.channel != provider {
                anyhow::bail!(
                    "code belongs to channel '{}', not '{provider}'",
                    paired.channel
                );
            }
            // Allowlist the sender in the channel config.
            let mut config = load_config(state_dir)?;
            let channel = config.channels.entry(provider.clone()).or_default();
            if !channel.allow_from.contains(&paired.sender_id) {
                channel.allow_from.push(paired.sender_id.clone());
            }
            save_config(state_dir, &config)?;
            println!("approved {} on {}", paired.sender_id, provider);
            Ok(())
        }
    }
}

async fn gmail_cmd(state_dir: &std::path::Path, cmd: GmailCommand) -> anyhow::Result<()> {
    match cmd {
        GmailCommand::Setup { account } => {
            let mut config = load_config(state_dir)?;
            config.hooks.enabled = true;
            config.hooks.gmail.account = Some(account.clone());
            save_config(state_dir, &config)?;
            println!("gmail hook bound to {account}");
            Ok(())
        }
        GmailCommand::Run => {
            let config = load_config(state_dir)?;
            let Some(account) = config.hooks.gmail.account.clone() else {
                anyhow::bail!("gmail hook not configured — run `clawdbot hooks gmail setup`");
            };
            let params = serde_json::json!({
                "message": format!("Check the {account} inbox and summarize anything new."),
            });
            let reply = ws_request(&config, "chat.send", params, true).await?;
            println!("{reply}");
            Ok(())
        }
    }
}

async fn models_cmd(state_dir: &std::path::Path, cmd: ModelsCommand) -> anyhow::Result<()> {
    match cmd {
        ModelsCommand::List => {
            let registry = ModelRegistry::with_defaults();
            for info in registry.list() {
                println!(
                    "{}/{}{}",
                    info.provider,
                    info.model,
                    if info.supports_thinking { "  [thinking]" } else { "" }
                );
            }
            Ok(())
        }
        ModelsCommand::Scan => {
            let profiles = AuthProfileStore::open(state_dir)?;
            let registry = ModelRegistry::with_defaults();
            let mut providers: Vec<String> =
                registry.list().iter().map(|m| m.provider.clone()).collect();
            providers.dedup();
            for provider in providers {
                let ready = profiles.ready_count(&provider);
                println!("{provider}: {ready} ready auth profile(s)");
            }
            Ok(())
        }
        ModelsCommand::Set { model } => {
            let registry = ModelRegistry::with_defaults();
            registry
                .resolve(&model)
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            let mut config = load_config(state_dir)?;
            config.agent.model.primary = model.clone();
            save_config(state_dir, &config)?;
            println!("primary model set to {model}");
            Ok(())
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// WS client for CLI commands
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Dial the local gateway, issue one request, optionally wait for the
/// run's final chat event, and return the printable result.
async fn ws_request(
    config: &Config,
    method: &str,
    params: serde_json::Value,
    wait_for_final: bool,
) -> anyhow::Result<String> {
    let token = std::env::var(&config.gateway.auth.token_env).unwrap_or_default();
    let url = build_relay_ws_url(config.gateway.port, &token)
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    let (stream, _) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .context("connecting to gateway (is it running?)")?;
    let (mut sink, mut source) = stream.split();

    let request_id = uuid::Uuid::new_v4().to_string();
    let frame = Frame::request(request_id.clone(), method, params);
    sink.send(tokio_tungstenite::tungstenite::Message::Text(
        serde_json::to_string(&frame)?,
    ))
    .await?;

    let mut run_id: Option<String> = None;
    while let Some(message) = source.next().await {
        let tokio_tungstenite::tungstenite::Message::Text(text) = message? else {
            continue;
        };
        let Ok(frame) = serde_json::from_str::<Frame>(&text) else {
            continue;
        };

        if frame.id.as_deref() == Some(&request_id) {
            if let Some(error) = frame.error {
                anyhow::bail!("{}: {}", serde_json::to_string(&error.code)?, error.message);
            }
            let result = frame.result.unwrap_or_default();
            if !wait_for_final {
                return Ok(serde_json::to_string_pretty(&result)?);
            }
            run_id = result["runId"].as_str().map(str::to_owned);
            continue;
        }

        if frame.event.as_deref() == Some("chat") {
            let Some(rid) = &run_id else { continue };
            let Some(params) = frame.params else { continue };
            if params["state"] == "final" && params["runId"] == rid.as_str() {
                if let Some(error) = params["error"].as_str() {
                    anyhow::bail!("{error}");
                }
                let text = params["message"]["content"][0]["text"]
                    .as_str()
                    .unwrap_or_default();
                return Ok(text.to_owned());
            }
        }
    }
    anyhow::bail!("gateway closed the connection before replying")
}
