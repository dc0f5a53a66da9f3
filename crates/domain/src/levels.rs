//! Session-level enums shared between the config model, the session store,
//! and the dispatcher.

use serde::{Deserialize, Serialize};

/// Reasoning-effort level requested for a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingLevel {
    #[default]
    Off,
    Minimal,
    Low,
    Medium,
    High,
}

impl ThinkingLevel {
    /// The next lower level, used when a model rejects the requested one.
    /// `Off` has nowhere left to go.
    pub fn step_down(self) -> Option<ThinkingLevel> {
        match self {
            ThinkingLevel::High => Some(ThinkingLevel::Medium),
            ThinkingLevel::Medium => Some(ThinkingLevel::Low),
            ThinkingLevel::Low => Some(ThinkingLevel::Minimal),
            ThinkingLevel::Minimal => Some(ThinkingLevel::Off),
            ThinkingLevel::Off => None,
        }
    }

    pub fn parse(s: &str) -> Option<ThinkingLevel> {
        match s {
            "off" => Some(ThinkingLevel::Off),
            "minimal" => Some(ThinkingLevel::Minimal),
            "low" => Some(ThinkingLevel::Low),
            "medium" => Some(ThinkingLevel::Medium),
            "high" => Some(ThinkingLevel::High),
            _ => None,
        }
    }
}

/// Whether tool I/O is relayed to the user mid-turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerboseLevel {
    #[default]
    Off,
    On,
}

/// Elevated (host, non-sandboxed) shell execution for a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElevatedLevel {
    #[default]
    Off,
    Ask,
    On,
}

/// What happens when a message arrives while a turn is already streaming.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueMode {
    /// Cancel the active run and start fresh with the new message.
    Interrupt,
    /// Inject the new message into the active run; fall back to followup.
    #[default]
    Steer,
    /// Enqueue the message and drain it after the active run ends.
    Followup,
    /// Discard the message (and report the drop).
    Drop,
}

impl QueueMode {
    pub fn parse(s: &str) -> Option<QueueMode> {
        match s {
            "interrupt" => Some(QueueMode::Interrupt),
            "steer" => Some(QueueMode::Steer),
            "followup" => Some(QueueMode::Followup),
            "drop" => Some(QueueMode::Drop),
            _ => None,
        }
    }
}

/// When the agent participates in a group chat.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupActivation {
    /// Only when mentioned or replied to.
    #[default]
    Mention,
    /// Every group message starts a turn.
    Always,
}

/// Whether the session may emit outbound messages at all.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SendPolicy {
    #[default]
    Allow,
    Deny,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thinking_step_down_chain() {
        let mut level = ThinkingLevel::High;
        let mut seen = vec![level];
        while let Some(next) = level.step_down() {
            seen.push(next);
            level = next;
        }
        assert_eq!(
            seen,
            vec![
                ThinkingLevel::High,
                ThinkingLevel::Medium,
                ThinkingLevel::Low,
                ThinkingLevel::Minimal,
                ThinkingLevel::Off,
            ]
        );
        assert!(ThinkingLevel::Off.step_down().is_none());
    }

    #[test]
    fn queue_mode_parse() {
        assert_eq!(QueueMode::parse("interrupt"), Some(QueueMode::Interrupt));
        assert_eq!(QueueMode::parse("steer"), Some(QueueMode::Steer));
        assert_eq!(QueueMode::parse("nope"), None);
    }

    #[test]
    fn serde_lowercase() {
        assert_eq!(
            serde_json::to_string(&ThinkingLevel::Medium).unwrap(),
            "\"medium\""
        );
        assert_eq!(
            serde_json::from_str::<ElevatedLevel>("\"ask\"").unwrap(),
            ElevatedLevel::Ask
        );
    }
}
