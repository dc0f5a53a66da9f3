use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Gateway server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "d_port")]
    pub port: u16,

    /// Which interface to listen on.
    #[serde(default)]
    pub bind: GatewayBind,

    #[serde(default)]
    pub auth: GatewayAuthConfig,

    #[serde(default)]
    pub tailscale: TailscaleConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: d_port(),
            bind: GatewayBind::default(),
            auth: GatewayAuthConfig::default(),
            tailscale: TailscaleConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayBind {
    #[default]
    Loopback,
    /// Bind the tailnet address only.
    Tailnet,
    /// Tailnet when available, loopback otherwise.
    Auto,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GatewayAuthConfig {
    #[serde(default)]
    pub mode: GatewayAuthMode,
    /// Environment variable holding the gateway token. The token itself
    /// never appears in the config file.
    #[serde(default = "d_token_env")]
    pub token_env: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GatewayAuthMode {
    #[default]
    Password,
    TailscaleIdentity,
    PasswordOrTailscale,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TailscaleConfig {
    #[serde(default)]
    pub mode: TailscaleMode,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TailscaleMode {
    #[default]
    Off,
    Serve,
    /// Public exposure; password auth becomes mandatory.
    Funnel,
}

fn d_port() -> u16 {
    18_792
}

fn d_token_env() -> String {
    "OPENCLAW_GATEWAY_TOKEN".into()
}
