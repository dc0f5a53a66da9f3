//! Inbound message routing.
//!
//! Turns a channel message into a session key plus a routing verdict:
//! start a turn, apply a directive, answer with a pairing code, or skip.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use oc_domain::config::{ChannelConfig, DmPolicy, SessionScope};
use oc_domain::levels::GroupActivation;

use crate::commands::{extract_directive, Directive};
use crate::session_key::SessionKey;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inbound message
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatType {
    Direct,
    Group,
}

/// The contract every channel adapter delivers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Channel id: `"telegram"`, `"discord"`, `"whatsapp"`, …
    pub surface: String,
    pub sender_id: String,
    /// Account/recipient the message was addressed to.
    #[serde(default)]
    pub to: Option<String>,
    pub chat_type: ChatType,
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default)]
    pub was_mentioned: bool,
    /// The message replies to one of the assistant's own messages.
    #[serde(default)]
    pub is_reply_to_bot: bool,
    pub body: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Outcome
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq)]
pub enum RouteOutcome {
    /// Queue an agent turn on this session.
    Turn { key: SessionKey },
    /// Apply a directive to this session (no agent turn).
    Directive { key: SessionKey, directive: Directive },
    /// Unknown DM sender on a pairing channel: reply with the code.
    PairingReply { code_needed: bool },
    /// Drop the message.
    Skip { reason: SkipReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    ChannelDisabled,
    NotMentioned,
    SenderNotAllowed,
    DirectiveNotOwner,
    EmptyBody,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Router
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Router {
    agent_id: String,
    main_key: String,
    scope: SessionScope,
    channels: HashMap<String, ChannelConfig>,
}

impl Router {
    pub fn new(
        agent_id: impl Into<String>,
        main_key: impl Into<String>,
        scope: SessionScope,
        channels: HashMap<String, ChannelConfig>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            main_key: main_key.into(),
            scope,
            channels,
        }
    }

    /// Compute the canonical key for a message, ignoring gating.
    pub fn session_key(&self, msg: &InboundMessage) -> SessionKey {
        match msg.chat_type {
            ChatType::Group => {
                let gid = msg.group_id.as_deref().unwrap_or("unknown");
                SessionKey::group(&self.agent_id, &msg.surface, gid)
            }
            ChatType::Direct => match self.scope {
                SessionScope::Global => SessionKey::main(&self.agent_id, &self.main_key),
                SessionScope::PerSender => {
                    SessionKey::direct(&self.agent_id, &msg.surface, &msg.sender_id)
                }
            },
        }
    }

    /// Route one message. `entry_activation` is the session's stored
    /// `/activation` override, when the session already exists.
    pub fn route(
        &self,
        msg: &InboundMessage,
        entry_activation: Option<GroupActivation>,
    ) -> RouteOutcome {
        let Some(channel) = self.channels.get(&msg.surface) else {
            return RouteOutcome::Skip {
                reason: SkipReason::ChannelDisabled,
            };
        };
        if !channel.enabled {
            return RouteOutcome::Skip {
                reason: SkipReason::ChannelDisabled,
            };
        }
        if msg.body.trim().is_empty() {
            return RouteOutcome::Skip {
                reason: SkipReason::EmptyBody,
            };
        }

        let key = self.session_key(msg);

        match msg.chat_type {
            ChatType::Group => self.route_group(msg, channel, key, entry_activation),
            ChatType::Direct => self.route_direct(msg, channel, key),
        }
    }

    fn route_group(
        &self,
        msg: &InboundMessage,
        channel: &ChannelConfig,
        key: SessionKey,
        entry_activation: Option<GroupActivation>,
    ) -> RouteOutcome {
        let group_cfg = msg
            .group_id
            .as_deref()
            .and_then(|gid| channel.groups.get(gid));

        // The stored /activation override wins over channel config.
        let activation = entry_activation
            .or_else(|| group_cfg.map(|g| g.activation))
            .unwrap_or_default();

        if activation == GroupActivation::Mention && !msg.was_mentioned && !msg.is_reply_to_bot {
            return RouteOutcome::Skip {
                reason: SkipReason::NotMentioned,
            };
        }

        if let Some(directive) = extract_directive(&msg.body) {
            // Directives are owner-only in groups.
            let is_owner = group_cfg
                .map(|g| g.owners.iter().any(|o| o == &msg.sender_id))
                .unwrap_or(false)
                || channel.allow_from.iter().any(|a| a == &msg.sender_id);
            if !is_owner {
                return RouteOutcome::Skip {
                    reason: SkipReason::DirectiveNotOwner,
                };
            }
            return RouteOutcome::Directive { key, directive };
        }

        RouteOutcome::Turn { key }
    }

    fn route_direct(
        &self,
        msg: &InboundMessage,
        channel: &ChannelConfig,
        key: SessionKey,
    ) -> RouteOutcome {
        let allowed = sender_allowed(channel, &msg.sender_id);
        if !allowed {
            return match channel.dm_policy {
                DmPolicy::Pairing => RouteOutcome::PairingReply { code_needed: true },
                DmPolicy::Open => RouteOutcome::Skip {
                    reason: SkipReason::SenderNotAllowed,
                },
            };
        }

        if let Some(directive) = extract_directive(&msg.body) {
            return RouteOutcome::Directive { key, directive };
        }
        RouteOutcome::Turn { key }
    }
}

fn sender_allowed(channel: &ChannelConfig, sender_id: &str) -> bool {
    let matches = |list: &[String]| list.iter().any(|a| a == "*" || a == sender_id);
    matches(&channel.allow_from) || matches(&channel.dm.allow_from)
}
