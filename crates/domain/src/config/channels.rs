use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::levels::GroupActivation;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Channel connectors
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-channel connector settings (`channels.<id>` in the config file).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChannelConfig {
    #[serde(default)]
    pub enabled: bool,

    /// How unknown direct-message senders are handled.
    #[serde(default)]
    pub dm_policy: DmPolicy,

    /// Sender ids allowed to DM without pairing. `"*"` allows everyone
    /// (required for `dm_policy = "open"`).
    #[serde(default)]
    pub allow_from: Vec<String>,

    /// Per-group overrides keyed by group id.
    #[serde(default)]
    pub groups: HashMap<String, GroupConfig>,

    #[serde(default)]
    pub dm: DmConfig,
}

/// Gate for direct messages from senders not in the allowlist.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DmPolicy {
    /// Unknown senders get a pairing code; the operator approves via CLI.
    #[default]
    Pairing,
    /// Everyone may DM (requires `"*"` in `allow_from`).
    Open,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GroupConfig {
    #[serde(default)]
    pub activation: GroupActivation,
    /// Senders allowed to issue directive commands in this group.
    /// Empty = the configured owner only.
    #[serde(default)]
    pub owners: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DmConfig {
    #[serde(default)]
    pub allow_from: Vec<String>,
}
