use serde::{Deserialize, Serialize};

use crate::levels::ElevatedLevel;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent runtime
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Settings for agent turn execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Wall-clock limit for one agent turn, seconds. `0` disables.
    #[serde(default = "d_timeout_seconds")]
    pub timeout_seconds: u64,

    /// Cap on concurrently running turns across all sessions.
    /// `None` = unbounded (per-session serialization still applies).
    #[serde(default)]
    pub max_concurrent: Option<usize>,

    /// IANA timezone used for user-facing timestamps in the system prompt.
    #[serde(default)]
    pub user_timezone: Option<String>,

    #[serde(default)]
    pub model: ModelConfig,

    #[serde(default)]
    pub bash: BashConfig,

    #[serde(default)]
    pub sandbox: SandboxConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: d_timeout_seconds(),
            max_concurrent: None,
            user_timezone: None,
            model: ModelConfig::default(),
            bash: BashConfig::default(),
            sandbox: SandboxConfig::default(),
        }
    }
}

/// Primary model and ordered fallbacks, as `provider/model` refs.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ModelConfig {
    #[serde(default)]
    pub primary: String,
    #[serde(default)]
    pub fallbacks: Vec<String>,
}

/// Elevated (host) shell execution.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BashConfig {
    #[serde(default)]
    pub elevated: ElevatedConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ElevatedConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Senders allowed to toggle elevated mode.
    #[serde(default)]
    pub allowed: Vec<String>,
    #[serde(default)]
    pub default_level: ElevatedLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SandboxConfig {
    #[serde(default)]
    pub mode: SandboxMode,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SandboxMode {
    #[default]
    Off,
    /// Sandbox every session except the main one.
    NonMain,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Per-agent defaults
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentsConfig {
    #[serde(default)]
    pub defaults: AgentDefaults,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentDefaults {
    #[serde(default)]
    pub subagents: SubagentDefaults,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubagentDefaults {
    /// How long a subagent announce waits before giving up, ms.
    #[serde(default = "d_announce_timeout_ms")]
    pub announce_timeout_ms: u64,
}

impl Default for SubagentDefaults {
    fn default() -> Self {
        Self {
            announce_timeout_ms: d_announce_timeout_ms(),
        }
    }
}

fn d_timeout_seconds() -> u64 {
    600
}

fn d_announce_timeout_ms() -> u64 {
    60_000
}
