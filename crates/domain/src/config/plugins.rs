use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Plugins
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginsConfig {
    #[serde(default = "d_true")]
    pub enabled: bool,
    /// Plugin ids allowed to load. Empty = all non-denied.
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
    /// Per-plugin overrides keyed by plugin id.
    #[serde(default)]
    pub entries: HashMap<String, PluginEntry>,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allow: Vec::new(),
            deny: Vec::new(),
            entries: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PluginEntry {
    #[serde(default)]
    pub enabled: Option<bool>,
}

impl PluginsConfig {
    /// Whether a plugin may load, combining the global switch, the
    /// allow/deny lists, per-entry overrides, and environment auto-enable
    /// (a channel plugin whose credential env var is set turns on without
    /// config).
    pub fn plugin_enabled(&self, id: &str, env_auto_enabled: bool) -> bool {
        if !self.enabled {
            return false;
        }
        if self.deny.iter().any(|d| d == id) {
            return false;
        }
        if let Some(entry) = self.entries.get(id) {
            if let Some(enabled) = entry.enabled {
                return enabled;
            }
        }
        if !self.allow.is_empty() {
            return self.allow.iter().any(|a| a == id);
        }
        env_auto_enabled
    }
}

/// Env vars that auto-enable a channel plugin when present and non-empty.
pub fn env_auto_enables(id: &str) -> &'static [&'static str] {
    match id {
        "telegram" => &["TELEGRAM_BOT_TOKEN"],
        "discord" => &["DISCORD_BOT_TOKEN"],
        "slack" => &["SLACK_BOT_TOKEN", "SLACK_APP_TOKEN"],
        "irc" => &["IRC_HOST", "IRC_NICK"],
        _ => &[],
    }
}


fn d_true() -> bool {
    true
}
