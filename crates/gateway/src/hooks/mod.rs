//! Plugin hook dispatch.
//!
//! Two dispatch styles: *sequential modifying* hooks fold partial results
//! over handlers in registration order (later non-empty fields win, and
//! `block = true` short-circuits the call site), while *fire-and-forget*
//! hooks run in parallel and may not interrupt the loop. The runner wraps
//! the runtime `StreamFn` as the outermost decorator, so hooks see the
//! full context before the inner runtime does.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use oc_domain::error::{Error, Result};

use crate::agent::{AgentEvent, AgentInvocation, StreamFn, TurnControls};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Phases
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Hooks that may rewrite the in-flight call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModifyingPhase {
    BeforeLlmCall,
    AfterLlmCall,
    BeforeResponseEmit,
}

/// Fire-and-forget lifecycle hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VoidPhase {
    ContextAssembled,
    LoopIterationStart,
    LoopIterationEnd,
    SessionStart,
    SessionEnd,
    GatewayStart,
    GatewayStop,
    BeforeToolCall,
    AfterToolCall,
}

/// Context handed to every hook.
#[derive(Debug, Clone, Default)]
pub struct HookContext {
    pub session_key: String,
    pub run_id: String,
    pub prompt: String,
    pub system_prompt: String,
    pub data: Value,
}

/// Partial result folded across modifying handlers.
#[derive(Debug, Clone, Default)]
pub struct HookOutput {
    pub messages: Option<Value>,
    pub system_prompt: Option<String>,
    pub tools: Option<Value>,
    pub content: Option<String>,
    pub block: bool,
    pub block_reason: Option<String>,
}

impl HookOutput {
    /// Overlay `later` on `self`; later non-empty fields win.
    fn fold(mut self, later: HookOutput) -> HookOutput {
        if later.messages.is_some() {
            self.messages = later.messages;
        }
        if later.system_prompt.is_some() {
            self.system_prompt = later.system_prompt;
        }
        if later.tools.is_some() {
            self.tools = later.tools;
        }
        if later.content.is_some() {
            self.content = later.content;
        }
        if later.block {
            self.block = true;
            self.block_reason = later.block_reason.or(self.block_reason);
        }
        self
    }
}

#[async_trait]
pub trait ModifyingHook: Send + Sync {
    fn name(&self) -> &str;
    fn phase(&self) -> ModifyingPhase;
    async fn call(&self, ctx: &HookContext) -> Result<HookOutput>;
}

#[async_trait]
pub trait VoidHook: Send + Sync {
    fn name(&self) -> &str;
    fn phase(&self) -> VoidPhase;
    async fn call(&self, ctx: &HookContext) -> Result<()>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Runner
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
pub struct HookRunner {
    modifying: Vec<Arc<dyn ModifyingHook>>,
    void: Vec<Arc<dyn VoidHook>>,
    /// When set, a failing handler logs a warning and the chain continues.
    pub catch_errors: bool,
}

impl HookRunner {
    pub fn new(catch_errors: bool) -> Self {
        Self {
            modifying: Vec::new(),
            void: Vec::new(),
            catch_errors,
        }
    }

    pub fn register_modifying(&mut self, hook: Arc<dyn ModifyingHook>) {
        self.modifying.push(hook);
    }

    pub fn register_void(&mut self, hook: Arc<dyn VoidHook>) {
        self.void.push(hook);
    }

    pub fn is_empty(&self) -> bool {
        self.modifying.is_empty() && self.void.is_empty()
    }

    /// Sequential modifying dispatch: fold handler outputs in
    /// registration order.
    pub async fn run_modifying(&self, phase: ModifyingPhase, ctx: &HookContext) -> Result<HookOutput> {
        let mut acc = HookOutput::default();
        for hook in self.modifying.iter().filter(|h| h.phase() == phase) {
            match hook.call(ctx).await {
                Ok(out) => acc = acc.fold(out),
                Err(e) if self.catch_errors => {
                    tracing::warn!(hook = hook.name(), error = %e, "modifying hook failed");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(acc)
    }

    /// Parallel fire-and-forget dispatch. Handler failures never reach the
    /// caller; with `catch_errors` unset they still only log (there is no
    /// result to propagate to).
    pub fn fire_parallel(self: &Arc<Self>, phase: VoidPhase, ctx: &HookContext) {
        for hook in self.void.iter().filter(|h| h.phase() == phase) {
            let hook = hook.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move {
                if let Err(e) = hook.call(&ctx).await {
                    tracing::warn!(hook = hook.name(), error = %e, "lifecycle hook failed");
                }
            });
        }
    }

    /// Wrap the runtime `StreamFn` for one turn. `before_llm_call` runs
    /// ahead of every inner call; `context_assembled` fires on the first
    /// call of the turn only.
    pub fn wrap_for_turn(self: &Arc<Self>, inner: Arc<dyn StreamFn>) -> Arc<dyn StreamFn> {
        Arc::new(HookedStream {
            hooks: self.clone(),
            inner,
            first_call_done: AtomicBool::new(false),
        })
    }
}

struct HookedStream {
    hooks: Arc<HookRunner>,
    inner: Arc<dyn StreamFn>,
    first_call_done: AtomicBool,
}

#[async_trait]
impl StreamFn for HookedStream {
    async fn stream(
        &self,
        invocation: &AgentInvocation,
        controls: &TurnControls,
        events: mpsc::Sender<AgentEvent>,
    ) -> Result<()> {
        let ctx = HookContext {
            session_key: invocation.session_key.clone(),
            run_id: invocation.run_id.clone(),
            prompt: invocation.prompt.clone(),
            system_prompt: invocation.system_prompt.clone(),
            data: Value::Null,
        };

        let out = self
            .hooks
            .run_modifying(ModifyingPhase::BeforeLlmCall, &ctx)
            .await?;
        if out.block {
            let reason = out.block_reason.as_deref().unwrap_or("unspecified");
            return Err(Error::Policy(format!("LLM call blocked by plugin: {reason}")));
        }

        if !self.first_call_done.swap(true, Ordering::SeqCst) {
            self.hooks.fire_parallel(VoidPhase::ContextAssembled, &ctx);
        }
        self.hooks.fire_parallel(VoidPhase::LoopIterationStart, &ctx);

        let mut invocation = invocation.clone();
        if let Some(system_prompt) = out.system_prompt {
            invocation.system_prompt = system_prompt;
        }

        let result = self.inner.stream(&invocation, controls, events).await;

        self.hooks.fire_parallel(VoidPhase::LoopIterationEnd, &ctx);
        let _ = self
            .hooks
            .run_modifying(ModifyingPhase::AfterLlmCall, &ctx)
            .await?;
        result
    }
}
