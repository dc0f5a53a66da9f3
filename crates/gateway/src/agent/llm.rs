//! Reference `StreamFn` implementation over the Anthropic Messages API.
//!
//! The gateway treats the agent runtime as a collaborator behind the
//! [`StreamFn`] seam; this adapter is the built-in implementation for
//! `provider = "anthropic"`. It issues one non-streaming call per turn
//! and emits `Final` + `Usage`, which is enough to drive the whole
//! dispatch/delivery pipeline. Richer runtimes plug in the same way.

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use oc_domain::error::{Error, Result};
use oc_domain::levels::ThinkingLevel;

use crate::agent::{AgentEvent, AgentInvocation, StreamFn, TurnControls};

const ANTHROPIC_API: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicStream {
    http: reqwest::Client,
}

impl AnthropicStream {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    fn thinking_budget(level: ThinkingLevel) -> Option<u32> {
        match level {
            ThinkingLevel::Off => None,
            ThinkingLevel::Minimal => Some(1_024),
            ThinkingLevel::Low => Some(4_096),
            ThinkingLevel::Medium => Some(16_384),
            ThinkingLevel::High => Some(32_768),
        }
    }
}

impl Default for AnthropicStream {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StreamFn for AnthropicStream {
    async fn stream(
        &self,
        invocation: &AgentInvocation,
        controls: &TurnControls,
        events: mpsc::Sender<AgentEvent>,
    ) -> Result<()> {
        if invocation.provider != "anthropic" {
            return Err(Error::Config(format!(
                "no runtime adapter for provider '{}'",
                invocation.provider
            )));
        }

        let mut body = json!({
            "model": invocation.model,
            "max_tokens": 4096,
            "system": invocation.system_prompt,
            "messages": [{"role": "user", "content": invocation.prompt}],
        });
        if let Some(budget) = Self::thinking_budget(invocation.thinking_level) {
            body["thinking"] = json!({"type": "enabled", "budget_tokens": budget});
        }

        let request = self
            .http
            .post(ANTHROPIC_API)
            .header("x-api-key", &invocation.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send();

        let response = tokio::select! {
            response = request => response,
            _ = controls.cancel.cancelled() => {
                return Err(Error::Other("turn cancelled".into()));
            }
        };

        let response = response.map_err(|e| {
            if e.is_timeout() {
                Error::Timeout(format!("LLM call timed out: {e}"))
            } else {
                Error::Transport(format!("LLM request failed: {e}"))
            }
        })?;

        let status = response.status();
        let payload: Value = response
            .json()
            .await
            .map_err(|e| Error::Transport(format!("LLM response unreadable: {e}")))?;

        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(Error::Auth(format!("credential rejected ({status})")));
        }
        if status.as_u16() == 429 {
            return Err(Error::RateLimit("provider returned 429".into()));
        }
        if status.as_u16() == 400 {
            let message = payload["error"]["message"].as_str().unwrap_or("bad request");
            if message.contains("thinking") {
                return Err(Error::Config(format!("unsupported thinking level: {message}")));
            }
            return Err(Error::Validation(message.to_owned()));
        }
        if !status.is_success() {
            return Err(Error::Transport(format!("provider returned {status}")));
        }

        let text: String = payload["content"]
            .as_array()
            .map(|blocks| {
                blocks
                    .iter()
                    .filter(|b| b["type"] == "text")
                    .filter_map(|b| b["text"].as_str())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        let input_tokens = payload["usage"]["input_tokens"].as_u64().unwrap_or(0);
        let output_tokens = payload["usage"]["output_tokens"].as_u64().unwrap_or(0);
        let _ = events
            .send(AgentEvent::Usage {
                input_tokens,
                output_tokens,
                total_tokens: input_tokens + output_tokens,
                context_tokens: input_tokens,
            })
            .await;
        let _ = events
            .send(AgentEvent::Final {
                text,
                media_urls: Vec::new(),
            })
            .await;
        Ok(())
    }
}
