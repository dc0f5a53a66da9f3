//! Agent turn execution.
//!
//! The runtime is reached through one seam: [`StreamFn`], an async
//! function from an [`AgentInvocation`] to a stream of typed
//! [`AgentEvent`]s over a channel. The runner owns model resolution,
//! credential rotation, thinking-level fallback, and finalization; the
//! hook runner wraps the `StreamFn` as an outermost decorator.

pub mod finalize;
pub mod llm;
pub mod profiles;
pub mod registry;
pub mod runner;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use oc_domain::error::Result;
use oc_domain::levels::{ElevatedLevel, ThinkingLevel, VerboseLevel};

pub use profiles::{AuthProfile, AuthProfileStore, CredentialMode};
pub use registry::{ModelInfo, ModelRegistry};
pub use runner::{AgentRunner, TurnOutput, TurnRequest};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Where block replies break.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BlockReplyBreak {
    #[default]
    TextEnd,
    MessageEnd,
}

/// One event on the runtime stream.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// Incremental token stream.
    Partial {
        text: String,
        media_urls: Vec<String>,
    },
    /// A semantically complete block, pushed before the turn ends.
    Block {
        text: String,
        media_urls: Vec<String>,
    },
    /// Tool I/O, relayed to the user when verbose is on.
    ToolResult {
        text: String,
        media_urls: Vec<String>,
    },
    /// Generic runtime event (`compaction` phases and friends).
    Agent { stream: String, data: Value },
    /// Token accounting for the turn.
    Usage {
        input_tokens: u64,
        output_tokens: u64,
        total_tokens: u64,
        context_tokens: u64,
    },
    /// The turn's final assistant text.
    Final {
        text: String,
        media_urls: Vec<String>,
    },
    /// Terminal failure inside the runtime.
    Error { message: String },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Invocation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything the runtime needs for one LLM-backed turn.
#[derive(Debug, Clone)]
pub struct AgentInvocation {
    pub run_id: String,
    pub session_id: String,
    pub session_key: String,
    pub session_file: String,
    pub workspace_dir: Option<String>,
    pub prompt: String,
    pub system_prompt: String,
    pub provider: String,
    pub model: String,
    /// Resolved credential for this attempt.
    pub api_key: String,
    pub thinking_level: ThinkingLevel,
    pub verbose_level: VerboseLevel,
    pub elevated_level: ElevatedLevel,
    pub timeout_ms: u64,
    pub block_reply_break: BlockReplyBreak,
    pub block_reply_chunking: bool,
}

/// Controls handed to a running turn.
#[derive(Clone)]
pub struct TurnControls {
    pub cancel: CancellationToken,
    /// Steer channel: user messages injected into the active run.
    pub steer_rx: std::sync::Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>>,
}

/// The runtime seam. Implementations stream events until the turn ends;
/// the sender closing is the end-of-stream signal.
#[async_trait]
pub trait StreamFn: Send + Sync {
    async fn stream(
        &self,
        invocation: &AgentInvocation,
        controls: &TurnControls,
        events: mpsc::Sender<AgentEvent>,
    ) -> Result<()>;
}
