//! Discord-specific delivery: target resolution, thread bindings, and
//! webhook impersonation.

use std::path::Path;

use serde::{Deserialize, Serialize};

use oc_domain::error::{Error, Result};
use oc_sessions::DeliveryContext;
use oc_store::JsonStore;

/// Display-name cap Discord applies to webhook usernames. Truncation is
/// on code units (chars), not display width.
const WEBHOOK_USERNAME_MAX: usize = 80;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Target resolution
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscordTarget {
    User(String),
    Channel(String),
}

/// Resolve an outbound Discord target.
///
/// Accepts `user:<id>` and `channel:<id>` explicitly. A bare numeric id
/// is only honored when the session's last delivery context names
/// Discord — then the recorded `to` disambiguates; otherwise the id is
/// rejected as ambiguous.
pub fn resolve_discord_target(
    raw: &str,
    session_ctx: Option<&DeliveryContext>,
) -> Result<DiscordTarget> {
    if let Some(id) = raw.strip_prefix("user:") {
        return Ok(DiscordTarget::User(id.to_owned()));
    }
    if let Some(id) = raw.strip_prefix("channel:") {
        return Ok(DiscordTarget::Channel(id.to_owned()));
    }

    if raw.chars().all(|c| c.is_ascii_digit()) && !raw.is_empty() {
        if let Some(ctx) = session_ctx {
            if ctx.channel.as_deref() == Some("discord") {
                if let Some(recorded) = &ctx.to {
                    return resolve_discord_target(recorded, None).or(Ok(
                        DiscordTarget::Channel(recorded.clone()),
                    ));
                }
            }
        }
        return Err(Error::Validation(format!(
            "Ambiguous Discord recipient '{raw}': use user:<id> or channel:<id>"
        )));
    }

    Err(Error::Validation(format!(
        "unrecognized Discord target '{raw}'"
    )))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Thread bindings
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Binds a forum/thread to an agent identity, optionally with a webhook
/// for impersonated posting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadBinding {
    pub thread_id: String,
    pub agent_id: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_token: Option<String>,
    pub account_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThreadBindingFile {
    #[serde(default)]
    pub bindings: Vec<ThreadBinding>,
}

pub struct ThreadBindingStore {
    store: JsonStore<ThreadBindingFile>,
}

impl ThreadBindingStore {
    pub fn open(state_dir: &Path) -> Result<Self> {
        Ok(Self {
            store: JsonStore::load(state_dir.join("thread_bindings.json"))?,
        })
    }

    pub fn get(&self, thread_id: &str) -> Option<ThreadBinding> {
        self.store.read(|f| {
            f.bindings
                .iter()
                .find(|b| b.thread_id == thread_id)
                .cloned()
        })
    }

    pub async fn bind(&self, binding: ThreadBinding) -> Result<()> {
        self.store
            .mutate(move |f| {
                f.bindings.retain(|b| b.thread_id != binding.thread_id);
                f.bindings.push(binding);
            })
            .await
    }

    pub async fn unbind(&self, thread_id: &str) -> Result<bool> {
        let thread_id = thread_id.to_owned();
        self.store
            .mutate(move |f| {
                let before = f.bindings.len();
                f.bindings.retain(|b| b.thread_id != thread_id);
                f.bindings.len() != before
            })
            .await
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Webhook impersonation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize)]
pub struct WebhookMessage {
    pub content: String,
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

/// Build the impersonation payload: username from the agent identity or
/// the binding label, capped at 80 chars.
pub fn build_webhook_message(
    binding: &ThreadBinding,
    agent_name: Option<&str>,
    avatar_url: Option<String>,
    content: impl Into<String>,
) -> WebhookMessage {
    let name = agent_name.unwrap_or(&binding.label);
    WebhookMessage {
        content: content.into(),
        username: truncate_chars(name, WEBHOOK_USERNAME_MAX),
        avatar_url,
    }
}

/// Post via the binding's webhook into the bound thread.
pub async fn send_webhook(
    http: &reqwest::Client,
    binding: &ThreadBinding,
    message: &WebhookMessage,
) -> Result<()> {
    let (Some(id), Some(token)) = (&binding.webhook_id, &binding.webhook_token) else {
        return Err(Error::Config(format!(
            "thread binding '{}' has no webhook",
            binding.thread_id
        )));
    };
    let url = format!(
        "https://discord.com/api/webhooks/{id}/{token}?thread_id={}",
        binding.thread_id
    );
    let response = http
        .post(&url)
        .json(message)
        .send()
        .await
        .map_err(|e| Error::Transport(format!("webhook post failed: {e}")))?;
    if !response.status().is_success() {
        return Err(Error::Transport(format!(
            "webhook post returned {}",
            response.status()
        )));
    }
    Ok(())
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
