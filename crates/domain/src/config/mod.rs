mod agent;
mod channels;
mod gateway;
mod plugins;
mod session;
mod tools;

pub use agent::*;
pub use channels::*;
pub use gateway::*;
pub use plugins::*;
pub use session::*;
pub use tools::*;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    /// Per-agent-id defaults (subagent announce timeouts, …).
    #[serde(default)]
    pub agents: AgentsConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub hooks: HooksConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    /// Channel connectors keyed by channel id (`"discord"`, `"telegram"`, …).
    #[serde(default)]
    pub channels: HashMap<String, ChannelConfig>,
    #[serde(default)]
    pub plugins: PluginsConfig,
    #[serde(default)]
    pub ui: UiConfig,
    #[serde(default)]
    pub talk: TalkConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Hooks / UI / Talk
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HooksConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub gmail: GmailHookConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GmailHookConfig {
    /// Gmail account the hook command acts on.
    #[serde(default)]
    pub account: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UiConfig {
    /// Accent color of the control UI, `#RRGGBB`.
    #[serde(default)]
    pub seam_color: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TalkConfig {
    /// Friendly voice name → provider voice id.
    #[serde(default)]
    pub voice_aliases: HashMap<String, String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

fn issue(severity: ConfigSeverity, field: &str, message: impl Into<String>) -> ConfigIssue {
    ConfigIssue {
        severity,
        field: field.to_owned(),
        message: message.into(),
    }
}

impl Config {
    /// Validate the configuration and return a list of issues.
    ///
    /// Returns an empty vec when everything looks good.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.session.main_key.is_empty() {
            issues.push(issue(
                ConfigSeverity::Error,
                "session.main_key",
                "must not be empty",
            ));
        }

        if self.agent.timeout_seconds == 0 {
            issues.push(issue(
                ConfigSeverity::Warning,
                "agent.timeout_seconds",
                "0 disables the turn timeout — runs can hang forever",
            ));
        }

        if let Some(max) = self.agent.max_concurrent {
            if max == 0 {
                issues.push(issue(
                    ConfigSeverity::Error,
                    "agent.max_concurrent",
                    "must be at least 1 when set",
                ));
            }
        }

        if self.agent.model.primary.is_empty() {
            issues.push(issue(
                ConfigSeverity::Warning,
                "agent.model.primary",
                "no primary model configured — turns will fail with unknown-model",
            ));
        }

        // Funnel exposure without password auth leaks the gateway to the
        // public internet.
        if self.gateway.tailscale.mode == TailscaleMode::Funnel
            && self.gateway.auth.mode == GatewayAuthMode::TailscaleIdentity
        {
            issues.push(issue(
                ConfigSeverity::Error,
                "gateway.auth.mode",
                "tailscale funnel requires password auth",
            ));
        }

        if let Some(ref color) = self.ui.seam_color {
            if !is_hex_color(color) {
                issues.push(issue(
                    ConfigSeverity::Warning,
                    "ui.seam_color",
                    format!("'{color}' is not #RRGGBB"),
                ));
            }
        }

        for (id, channel) in &self.channels {
            if channel.dm_policy == DmPolicy::Open && !channel.allow_from.iter().any(|a| a == "*") {
                issues.push(issue(
                    ConfigSeverity::Error,
                    &format!("channels.{id}.dm_policy"),
                    "open DM policy requires \"*\" in allow_from",
                ));
            }
        }

        issues
    }
}

fn is_hex_color(s: &str) -> bool {
    s.len() == 7
        && s.starts_with('#')
        && s[1..].chars().all(|c| c.is_ascii_hexdigit())
}
