use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session routing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Controls how inbound messages map to session keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Session-key suffix of the default private chat
    /// (`agent:<agentId>:<mainKey>`).
    #[serde(default = "d_main_key")]
    pub main_key: String,

    /// How direct messages are scoped.
    #[serde(default)]
    pub scope: SessionScope,

    /// Override path of the session store file. `None` = the default
    /// `sessions/<agentId>.json` under the state dir.
    #[serde(default)]
    pub store: Option<std::path::PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            main_key: d_main_key(),
            scope: SessionScope::default(),
            store: None,
        }
    }
}

/// DM session scoping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionScope {
    /// One session per sender: `agent:<agentId>:<surface>:<peerId>`.
    #[default]
    PerSender,
    /// All direct messages share the main session.
    Global,
}

fn d_main_key() -> String {
    "main".into()
}
