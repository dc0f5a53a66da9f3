//! Session key computation.
//!
//! Key templates:
//! - `agent:<agentId>:<mainKey>`                 (default private chat)
//! - `agent:<agentId>:<surface>:<peerId>`        (per-sender DM scope)
//! - `agent:<agentId>:<surface>:group:<groupId>` (group chats)
//!
//! Keys are created on first inbound match and never renamed.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Canonical identifier for one conversation lane.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionKey(String);

impl SessionKey {
    /// The agent's default private chat: `agent:<agentId>:<mainKey>`.
    pub fn main(agent_id: &str, main_key: &str) -> SessionKey {
        SessionKey(format!("agent:{agent_id}:{main_key}"))
    }

    /// A per-sender DM lane: `agent:<agentId>:<surface>:<peerId>`.
    pub fn direct(agent_id: &str, surface: &str, peer_id: &str) -> SessionKey {
        SessionKey(format!("agent:{agent_id}:{surface}:{peer_id}"))
    }

    /// A group lane: `agent:<agentId>:<surface>:group:<groupId>`.
    pub fn group(agent_id: &str, surface: &str, group_id: &str) -> SessionKey {
        SessionKey(format!("agent:{agent_id}:{surface}:group:{group_id}"))
    }

    /// An explicit, already-canonical key (cron `named` targets).
    pub fn named(key: impl Into<String>) -> SessionKey {
        SessionKey(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The `<agentId>` segment, when the key is in canonical form.
    pub fn agent_id(&self) -> Option<&str> {
        let rest = self.0.strip_prefix("agent:")?;
        rest.split(':').next()
    }

    pub fn is_group(&self) -> bool {
        self.0.contains(":group:")
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn main_key_format() {
        let key = SessionKey::main("claw", "main");
        assert_eq!(key.as_str(), "agent:claw:main");
        assert_eq!(key.agent_id(), Some("claw"));
        assert!(!key.is_group());
    }

    #[test]
    fn direct_key_format() {
        let key = SessionKey::direct("claw", "telegram", "12345");
        assert_eq!(key.as_str(), "agent:claw:telegram:12345");
    }

    #[test]
    fn group_key_format() {
        let key = SessionKey::group("claw", "discord", "server9");
        assert_eq!(key.as_str(), "agent:claw:discord:group:server9");
        assert!(key.is_group());
    }

    #[test]
    fn serde_is_transparent() {
        let key = SessionKey::main("claw", "main");
        assert_eq!(
            serde_json::to_string(&key).unwrap(),
            "\"agent:claw:main\""
        );
        let back: SessionKey = serde_json::from_str("\"agent:claw:main\"").unwrap();
        assert_eq!(back, key);
    }
}
