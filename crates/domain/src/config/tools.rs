use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Exec policy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ToolsConfig {
    #[serde(default)]
    pub exec: ExecConfig,
}

/// Shell-execution policy inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecConfig {
    #[serde(default)]
    pub security: ExecSecurity,
    #[serde(default)]
    pub ask: ExecAsk,
    /// Extra binaries trusted without allowlist entries (skill bins).
    #[serde(default)]
    pub safe_bins: Vec<String>,
    /// How long a command waits for human approval before it is denied.
    #[serde(default = "d_approval_timeout_secs")]
    pub approval_timeout_secs: u64,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            security: ExecSecurity::default(),
            ask: ExecAsk::default(),
            safe_bins: Vec::new(),
            approval_timeout_secs: d_approval_timeout_secs(),
        }
    }
}

fn d_approval_timeout_secs() -> u64 {
    300
}

/// Overall posture of the exec tool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecSecurity {
    /// Anything goes (single-operator trust).
    Full,
    /// Commands must match the per-agent allowlist.
    #[default]
    Allowlist,
    /// Exec disabled entirely.
    Deny,
}

/// When to route a command through the human-approval flow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecAsk {
    Off,
    #[default]
    OnMiss,
    Always,
}
