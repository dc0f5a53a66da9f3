//! One agent turn, end to end: resolve model and credential, build the
//! system prompt, invoke the hook-wrapped runtime stream, multiplex
//! events to delivery, recover from auth/rate-limit/thinking failures
//! (one attempt per class), and finalize the payload set.

use std::sync::Arc;

use tokio::sync::mpsc;

use oc_domain::config::Config;
use oc_domain::error::{Error, Result};
use oc_domain::levels::{ThinkingLevel, VerboseLevel};
use oc_sessions::{SessionKey, SessionStore};

use crate::agent::finalize::{extract_reply_tag, friendly_error, strip_heartbeat};
use crate::agent::profiles::AuthProfileStore;
use crate::agent::registry::ModelRegistry;
use crate::agent::{AgentEvent, AgentInvocation, BlockReplyBreak, StreamFn, TurnControls};
use crate::delivery::{DeliverySession, Payload};
use crate::hooks::HookRunner;

/// Seconds of continued streaming after an abort before we log again.
const ABORT_DOUBLE_WARN_SECS: u64 = 10;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request / output
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub run_id: String,
    pub session_key: SessionKey,
    pub prompt: String,
    /// Keep-alive turn: no typing, no user-visible noise.
    pub heartbeat: bool,
    /// The triggering message id (for `[[reply_to_current]]`).
    pub message_id: Option<String>,
    /// Overrides the session/config model for this turn.
    pub model_override: Option<String>,
    pub auth_profile_id: Option<String>,
}

impl TurnRequest {
    pub fn new(session_key: SessionKey, prompt: impl Into<String>) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            session_key,
            prompt: prompt.into(),
            heartbeat: false,
            message_id: None,
            model_override: None,
            auth_profile_id: None,
        }
    }
}

/// What a finished turn produced (after delivery already streamed blocks).
#[derive(Debug, Clone, Default)]
pub struct TurnOutput {
    pub run_id: String,
    /// The assembled final text; empty when the whole output was
    /// directive tags or heartbeat noise.
    pub final_text: String,
    pub final_payloads: Vec<Payload>,
    pub error: Option<String>,
    pub compactions: u64,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Runner
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct AgentRunner {
    pub config: Arc<Config>,
    pub registry: Arc<ModelRegistry>,
    pub profiles: Arc<AuthProfileStore>,
    pub sessions: Arc<SessionStore>,
    pub hooks: Arc<HookRunner>,
    pub stream_fn: Arc<dyn StreamFn>,
    /// Extra system prompt material (skills snapshot, workspace files).
    pub prompt_context: Vec<String>,
}

/// Outcome of one stream attempt.
enum Attempt {
    Done(StreamCollected),
    RetryRotated,
    RetryThinking(ThinkingLevel),
    Fail(Error),
}

#[derive(Default)]
struct StreamCollected {
    final_text: Option<String>,
    final_media: Vec<String>,
    compactions: u64,
}

impl AgentRunner {
    /// Run one turn, streaming block payloads through `delivery`.
    pub async fn run_turn(
        &self,
        req: &TurnRequest,
        controls: &TurnControls,
        delivery: &mut DeliverySession<'_>,
    ) -> TurnOutput {
        match self.run_turn_inner(req, controls, delivery).await {
            Ok(output) => output,
            Err(e) => {
                let message = friendly_error(&e.to_string());
                tracing::warn!(run_id = %req.run_id, error = %message, "turn failed");
                TurnOutput {
                    run_id: req.run_id.clone(),
                    error: Some(message),
                    ..Default::default()
                }
            }
        }
    }

    async fn run_turn_inner(
        &self,
        req: &TurnRequest,
        controls: &TurnControls,
        delivery: &mut DeliverySession<'_>,
    ) -> Result<TurnOutput> {
        let (entry, _) = self.sessions.resolve_or_create(&req.session_key).await?;

        // Model candidates: explicit override, session pin, config primary,
        // then configured fallbacks.
        let mut candidates: Vec<String> = Vec::new();
        if let Some(m) = &req.model_override {
            candidates.push(m.clone());
        } else if let (Some(provider), Some(model)) = (&entry.model_provider, &entry.model) {
            candidates.push(format!("{provider}/{model}"));
        }
        if !self.config.agent.model.primary.is_empty() {
            candidates.push(self.config.agent.model.primary.clone());
        }
        candidates.extend(self.config.agent.model.fallbacks.iter().cloned());
        candidates.dedup();
        if candidates.is_empty() {
            return Err(Error::Config("unknown-model: no model configured".into()));
        }

        let mut last_err: Option<Error> = None;
        for (i, model_ref) in candidates.iter().enumerate() {
            let info = match self.registry.resolve(model_ref) {
                Ok(info) => info.clone(),
                Err(e) => {
                    // An unknown primary is authoritative; unknown
                    // fallbacks are skipped.
                    if i == 0 && candidates.len() == 1 {
                        return Err(e);
                    }
                    last_err = Some(e);
                    continue;
                }
            };

            match self
                .run_with_model(req, controls, delivery, &info.provider, &info.model, entry.thinking_level, entry.verbose_level)
                .await
            {
                Ok(output) => return Ok(output),
                Err(e @ Error::Auth(_)) => return Err(e),
                Err(e) => {
                    tracing::warn!(model = %model_ref, error = %e, "model attempt failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| Error::Other("no model attempt ran".into())))
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_with_model(
        &self,
        req: &TurnRequest,
        controls: &TurnControls,
        delivery: &mut DeliverySession<'_>,
        provider: &str,
        model: &str,
        thinking: ThinkingLevel,
        verbose: VerboseLevel,
    ) -> Result<TurnOutput> {
        let mut rotated = false;
        let mut thinking = thinking;
        let mut stepped_thinking = false;
        let mut explicit_profile = req.auth_profile_id.clone();

        loop {
            let profile = self.profiles.select(provider, explicit_profile.as_deref())?;
            let api_key = profile.secret().ok_or_else(|| {
                Error::Auth(format!("auth profile '{}' has no usable credential", profile.id))
            })?;

            let invocation = self.build_invocation(req, provider, model, &api_key, thinking, verbose);
            let attempt = self
                .attempt_stream(&invocation, controls, delivery, verbose)
                .await;

            match attempt {
                Attempt::Done(collected) => {
                    self.profiles.mark_good(&profile.id).await?;
                    return self.finish(req, provider, model, collected, delivery, verbose).await;
                }
                Attempt::RetryRotated => {
                    self.profiles.mark_cooldown(&profile.id).await?;
                    if rotated {
                        return Err(Error::Auth(format!(
                            "all auth profiles for '{provider}' failed or are cooling down"
                        )));
                    }
                    rotated = true;
                    explicit_profile = None;
                    tracing::info!(provider, profile = %profile.id, "rotating auth profile");
                }
                Attempt::RetryThinking(lower) => {
                    if stepped_thinking {
                        return Err(Error::Config(format!(
                            "model '{model}' rejected thinking level {thinking:?}"
                        )));
                    }
                    stepped_thinking = true;
                    tracing::info!(from = ?thinking, to = ?lower, "stepping down thinking level");
                    thinking = lower;
                }
                Attempt::Fail(e) => return Err(e),
            }
        }
    }

    async fn attempt_stream(
        &self,
        invocation: &AgentInvocation,
        controls: &TurnControls,
        delivery: &mut DeliverySession<'_>,
        verbose: VerboseLevel,
    ) -> Attempt {
        let wrapped = self.hooks.wrap_for_turn(self.stream_fn.clone());
        let (tx, mut rx) = mpsc::channel::<AgentEvent>(64);

        let stream_invocation = invocation.clone();
        let stream_controls = controls.clone();
        let handle = tokio::spawn(async move {
            wrapped
                .stream(&stream_invocation, &stream_controls, tx)
                .await
        });

        let timeout = std::time::Duration::from_millis(invocation.timeout_ms.max(1));
        let deadline = tokio::time::Instant::now() + timeout;
        let mut collected = StreamCollected::default();
        let mut stream_error: Option<String> = None;

        loop {
            tokio::select! {
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    if let Err(e) = self
                        .consume_event(event, invocation, delivery, verbose, &mut collected, &mut stream_error)
                        .await
                    {
                        tracing::warn!(error = %e, "delivery failed mid-stream");
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    controls.cancel.cancel();
                    self.warn_if_still_streaming(&handle, &invocation.run_id).await;
                    return self.classify_timeout(&invocation.provider);
                }
                _ = controls.cancel.cancelled() => {
                    self.warn_if_still_streaming(&handle, &invocation.run_id).await;
                    return Attempt::Fail(Error::Other("turn cancelled".into()));
                }
            }
        }

        match handle.await {
            Ok(Ok(())) => {
                if let Some(message) = stream_error {
                    self.classify_stream_error(&Error::Other(message), invocation)
                } else {
                    Attempt::Done(collected)
                }
            }
            Ok(Err(e)) => self.classify_stream_error(&e, invocation),
            Err(join_err) => Attempt::Fail(Error::Other(format!("stream task panicked: {join_err}"))),
        }
    }

    async fn consume_event(
        &self,
        event: AgentEvent,
        invocation: &AgentInvocation,
        delivery: &mut DeliverySession<'_>,
        verbose: VerboseLevel,
        collected: &mut StreamCollected,
        stream_error: &mut Option<String>,
    ) -> Result<()> {
        match event {
            AgentEvent::Partial { .. } => {
                // Partials only feed typing; the delivery session arms it
                // on the first block.
            }
            AgentEvent::Block { text, media_urls } => {
                if let Some(payload) = self.to_payload(&text, media_urls) {
                    delivery.push_block(payload).await?;
                }
            }
            AgentEvent::ToolResult { text, media_urls } => {
                if verbose == VerboseLevel::On {
                    if let Some(payload) = self.to_payload(&text, media_urls) {
                        delivery.push_block(payload).await?;
                    }
                }
            }
            AgentEvent::Agent { stream, data } => {
                if stream == "compaction" {
                    let phase = data.get("phase").and_then(|v| v.as_str());
                    let will_retry = data
                        .get("willRetry")
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false);
                    if phase == Some("end") && !will_retry {
                        collected.compactions += 1;
                        let key = SessionKey::named(invocation.session_key.clone());
                        self.sessions
                            .update(&key, |e| e.compaction_count += 1)
                            .await?;
                    }
                }
            }
            AgentEvent::Usage {
                input_tokens,
                output_tokens,
                total_tokens,
                context_tokens,
            } => {
                if total_tokens > 0 {
                    let key = SessionKey::named(invocation.session_key.clone());
                    self.sessions
                        .record_usage(
                            &key,
                            &invocation.provider,
                            &invocation.model,
                            input_tokens,
                            output_tokens,
                            context_tokens,
                        )
                        .await?;
                }
            }
            AgentEvent::Final { text, media_urls } => {
                collected.final_text = Some(text);
                collected.final_media = media_urls;
            }
            AgentEvent::Error { message } => {
                *stream_error = Some(message);
            }
        }
        Ok(())
    }

    /// Finalization: heartbeat stripping, directive tag extraction, and
    /// the verbose compaction notice. Block/final dedup happens in the
    /// delivery session.
    async fn finish(
        &self,
        req: &TurnRequest,
        _provider: &str,
        _model: &str,
        collected: StreamCollected,
        delivery: &mut DeliverySession<'_>,
        verbose: VerboseLevel,
    ) -> Result<TurnOutput> {
        let mut payloads: Vec<Payload> = Vec::new();
        let mut final_text = String::new();

        if collected.compactions > 0 && verbose == VerboseLevel::On {
            let count = self
                .sessions
                .get(&req.session_key)
                .map(|e| e.compaction_count)
                .unwrap_or(collected.compactions);
            payloads.push(Payload::text(format!(
                "Auto-compaction complete (count {count})"
            )));
        }

        if let Some(raw) = collected.final_text {
            match strip_heartbeat(&raw) {
                None => {
                    // Heartbeat-only output: deliver nothing.
                }
                Some(stripped) => {
                    // When the entire output was directive tags, the final
                    // text is the empty string and nothing is sent.
                    let (text, tag) = extract_reply_tag(&stripped);
                    final_text = text.clone();
                    if !text.is_empty() || !collected.final_media.is_empty() {
                        payloads.push(Payload {
                            text,
                            media_urls: collected.final_media,
                            reply_to: tag,
                        });
                    }
                }
            }
        }

        delivery.finalize(payloads.clone()).await?;
        delivery.mark_run_complete().await;

        Ok(TurnOutput {
            run_id: req.run_id.clone(),
            final_text,
            final_payloads: payloads,
            error: None,
            compactions: collected.compactions,
        })
    }

    fn to_payload(&self, text: &str, media_urls: Vec<String>) -> Option<Payload> {
        let stripped = strip_heartbeat(text)?;
        let (text, tag) = extract_reply_tag(&stripped);
        if text.is_empty() && media_urls.is_empty() {
            return None;
        }
        Some(Payload {
            text,
            media_urls,
            reply_to: tag,
        })
    }

    fn build_invocation(
        &self,
        req: &TurnRequest,
        provider: &str,
        model: &str,
        api_key: &str,
        thinking: ThinkingLevel,
        verbose: VerboseLevel,
    ) -> AgentInvocation {
        let entry = self.sessions.get(&req.session_key);
        let (session_id, session_file, elevated) = entry
            .map(|e| (e.session_id, e.session_file, e.elevated_level))
            .unwrap_or_else(|| (String::new(), String::new(), Default::default()));

        AgentInvocation {
            run_id: req.run_id.clone(),
            session_id,
            session_key: req.session_key.as_str().to_owned(),
            session_file,
            workspace_dir: None,
            prompt: req.prompt.clone(),
            system_prompt: self.build_system_prompt(),
            provider: provider.to_owned(),
            model: model.to_owned(),
            api_key: api_key.to_owned(),
            thinking_level: thinking,
            verbose_level: verbose,
            elevated_level: elevated,
            timeout_ms: self.config.agent.timeout_seconds.saturating_mul(1_000).max(1_000),
            block_reply_break: BlockReplyBreak::TextEnd,
            block_reply_chunking: true,
        }
    }

    /// System prompt: prompt-context material (skills snapshot, workspace
    /// bootstrap files), runtime info, and the user's local time.
    fn build_system_prompt(&self) -> String {
        let mut sections = self.prompt_context.clone();
        sections.push(format!(
            "runtime: clawdbot {} on {}",
            env!("CARGO_PKG_VERSION"),
            std::env::consts::OS
        ));
        let tz = self
            .config
            .agent
            .user_timezone
            .as_deref()
            .and_then(|name| name.parse::<chrono_tz::Tz>().ok())
            .unwrap_or(chrono_tz::UTC);
        sections.push(format!(
            "user time: {}",
            chrono::Utc::now().with_timezone(&tz).format("%Y-%m-%d %H:%M %Z")
        ));
        sections.join("\n\n")
    }

    /// A timeout on a multi-profile account is probably a rate limit in
    /// disguise; rotate. Single-profile accounts surface the timeout.
    fn classify_timeout(&self, provider: &str) -> Attempt {
        if self.profiles.ready_count(provider) > 1 {
            Attempt::RetryRotated
        } else {
            Attempt::Fail(Error::Timeout("LLM call timed out".into()))
        }
    }

    fn classify_stream_error(&self, error: &Error, invocation: &AgentInvocation) -> Attempt {
        let message = error.to_string();
        match error {
            Error::Auth(_) | Error::RateLimit(_) => Attempt::RetryRotated,
            Error::Timeout(_) => self.classify_timeout(&invocation.provider),
            _ if message.contains("unsupported thinking") => {
                match invocation.thinking_level.step_down() {
                    Some(lower) => Attempt::RetryThinking(lower),
                    None => Attempt::Fail(Error::Config(message)),
                }
            }
            Error::Transport(_) => Attempt::Fail(Error::Transport(friendly_error(&message))),
            _ => Attempt::Fail(Error::Other(message)),
        }
    }

    async fn warn_if_still_streaming(
        &self,
        handle: &tokio::task::JoinHandle<Result<()>>,
        run_id: &str,
    ) {
        if handle.is_finished() {
            return;
        }
        tracing::warn!(run_id, "turn aborted, stream still draining");
        let run_id = run_id.to_owned();
        let abort_check = handle.abort_handle();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(ABORT_DOUBLE_WARN_SECS)).await;
            if !abort_check.is_finished() {
                tracing::warn!(run_id, "stream still running {ABORT_DOUBLE_WARN_SECS}s after abort");
            }
        });
    }
}
