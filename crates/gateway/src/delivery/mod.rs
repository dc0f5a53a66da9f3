//! Delivery pipeline: what actually gets sent on each channel.
//!
//! Block payloads streamed mid-turn are fingerprinted; the final payload
//! set is suppressed entirely once any block went out, so text never
//! reaches a channel twice. Typing indicators arm on the first visible
//! output of a non-heartbeat turn and clear on run completion.

pub mod chunk;
pub mod discord;

use std::collections::HashSet;

use async_trait::async_trait;

use oc_domain::error::Result;

use crate::agent::finalize::{is_silent_sentinel, ReplyTag};

pub use chunk::{channel_limit, chunk_markdown};
pub use discord::{resolve_discord_target, DiscordTarget, ThreadBinding, ThreadBindingStore};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Payload
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Payload {
    pub text: String,
    pub media_urls: Vec<String>,
    pub reply_to: ReplyTag,
}

impl Payload {
    pub fn text(text: impl Into<String>) -> Payload {
        Payload {
            text: text.into(),
            ..Default::default()
        }
    }

    /// Dedup key: text + media list + reply target. Must be identical for
    /// a block streamed mid-turn and the same payload in the final set.
    fn fingerprint(&self) -> String {
        let mut key = self.text.clone();
        key.push('\u{1f}');
        key.push_str(&self.media_urls.join(","));
        key.push('\u{1f}');
        match &self.reply_to {
            ReplyTag::None => {}
            ReplyTag::Current => key.push_str("current"),
            ReplyTag::Explicit(id) => key.push_str(id),
        }
        key
    }

    fn is_empty(&self) -> bool {
        self.text.trim().is_empty() && self.media_urls.is_empty()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Channel sink
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Outbound adapter contract implemented per channel.
#[async_trait]
pub trait ChannelSink: Send + Sync {
    /// Channel id (`"discord"`, `"telegram"`, …) — selects chunk limits.
    fn channel(&self) -> &str;

    /// Send one message; `reply_to` is a message id when the channel
    /// supports threading.
    async fn send(
        &self,
        to: &str,
        text: &str,
        media_urls: &[String],
        reply_to: Option<&str>,
    ) -> Result<()>;

    async fn start_typing(&self, _to: &str) {}
    async fn stop_typing(&self, _to: &str) {}
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Per-turn delivery session
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Tracks one turn's outbound state: streamed-block fingerprints, typing,
/// and the final-suppression flag.
pub struct DeliverySession<'a> {
    sink: &'a dyn ChannelSink,
    to: String,
    /// The triggering message id (resolves `[[reply_to_current]]`).
    current_message_id: Option<String>,
    heartbeat: bool,
    min_chars: usize,
    streamed: HashSet<String>,
    any_block_streamed: bool,
    typing_started: bool,
}

impl<'a> DeliverySession<'a> {
    pub fn new(
        sink: &'a dyn ChannelSink,
        to: impl Into<String>,
        current_message_id: Option<String>,
        heartbeat: bool,
    ) -> Self {
        Self {
            sink,
            to: to.into(),
            current_message_id,
            heartbeat,
            min_chars: 256,
            streamed: HashSet::new(),
            any_block_streamed: false,
            typing_started: false,
        }
    }

    /// Deliver a block payload mid-turn.
    pub async fn push_block(&mut self, payload: Payload) -> Result<()> {
        if self.should_drop(&payload) {
            return Ok(());
        }
        self.start_typing_once().await;
        self.streamed.insert(payload.fingerprint());
        self.any_block_streamed = true;
        self.send_chunked(&payload).await
    }

    /// Deliver the final payload set.
    ///
    /// Any streamed block suppresses the whole final set — the runtime
    /// re-emits streamed text in its final message and sending it again
    /// would duplicate every block.
    pub async fn finalize(&mut self, payloads: Vec<Payload>) -> Result<()> {
        if self.should_drop_final_payloads() {
            tracing::debug!(count = payloads.len(), "final payloads dropped after block stream");
            return Ok(());
        }
        for payload in payloads {
            if self.should_drop(&payload) || self.streamed.contains(&payload.fingerprint()) {
                continue;
            }
            self.start_typing_once().await;
            self.send_chunked(&payload).await?;
        }
        Ok(())
    }

    pub fn should_drop_final_payloads(&self) -> bool {
        self.any_block_streamed
    }

    /// Clear typing state at the end of the run.
    pub async fn mark_run_complete(&mut self) {
        if self.typing_started {
            self.sink.stop_typing(&self.to).await;
            self.typing_started = false;
        }
    }

    fn should_drop(&self, payload: &Payload) -> bool {
        if payload.is_empty() {
            return true;
        }
        is_silent_sentinel(&payload.text) && payload.media_urls.is_empty()
    }

    async fn start_typing_once(&mut self) {
        if !self.typing_started && !self.heartbeat {
            self.sink.start_typing(&self.to).await;
            self.typing_started = true;
        }
    }

    async fn send_chunked(&self, payload: &Payload) -> Result<()> {
        let reply_to = match &payload.reply_to {
            ReplyTag::None => None,
            ReplyTag::Current => self.current_message_id.as_deref(),
            ReplyTag::Explicit(id) => Some(id.as_str()),
        };
        let limit = channel_limit(self.sink.channel());
        let chunks = chunk_markdown(&payload.text, self.min_chars.min(limit / 2), limit);
        let last = chunks.len().saturating_sub(1);
        for (i, chunk) in chunks.iter().enumerate() {
            // Media rides on the last chunk only.
            let media: &[String] = if i == last { &payload.media_urls } else { &[] };
            self.sink.send(&self.to, chunk, media, reply_to).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeSink {
        sent: Mutex<Vec<(String, Option<String>)>>,
        typing_starts: AtomicUsize,
        typing_stops: AtomicUsize,
    }

    #[async_trait]
    impl ChannelSink for FakeSink {
        fn channel(&self) -> &str {
            "telegram"
        }
        async fn send(
            &self,
            _to: &str,
            text: &str,
            _media: &[String],
            reply_to: Option<&str>,
        ) -> Result<()> {
            self.sent
                .lock()
                .push((text.to_owned(), reply_to.map(str::to_owned)));
            Ok(())
        }
        async fn start_typing(&self, _to: &str) {
            self.typing_starts.fetch_add(1, Ordering::SeqCst);
        }
        async fn stop_typing(&self, _to: &str) {
            self.typing_stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn blocks_suppress_final_set() {
        let sink = FakeSink::default();
        let mut session = DeliverySession::new(&sink, "42", None, false);

        session.push_block(Payload::text("hi")).await.unwrap();
        session.push_block(Payload::text("done")).await.unwrap();
        session
            .finalize(vec![
                Payload::text("hi"),
                Payload::text("done"),
                Payload::text("extra"),
            ])
            .await
            .unwrap();

        let sent: Vec<String> = sink.sent.lock().iter().map(|(t, _)| t.clone()).collect();
        assert_eq!(sent, vec!["hi", "done"]);
        assert!(session.should_drop_final_payloads());
    }

    #[tokio::test]
    async fn final_without_blocks_delivers_deduped() {
        let sink = FakeSink::default();
        let mut session = DeliverySession::new(&sink, "42", None, false);

        session
            .finalize(vec![Payload::text("only"), Payload::text("only")])
            .await
            .unwrap();
        // Same fingerprint twice: second suppressed? No — dedup applies to
        // streamed blocks. Distinct final payloads pass through as-is.
        let sent: Vec<String> = sink.sent.lock().iter().map(|(t, _)| t.clone()).collect();
        assert_eq!(sent, vec!["only", "only"]);
    }

    #[tokio::test]
    async fn silent_sentinel_dropped() {
        let sink = FakeSink::default();
        let mut session = DeliverySession::new(&sink, "42", None, false);
        session
            .push_block(Payload::text("__SILENT_REPLY__"))
            .await
            .unwrap();
        session
            .finalize(vec![Payload::text("__SILENT_REPLY__")])
            .await
            .unwrap();
        assert!(sink.sent.lock().is_empty());

        // With media the sentinel is not a sentinel.
        let mut session = DeliverySession::new(&sink, "42", None, false);
        session
            .finalize(vec![Payload {
                text: "__SILENT_REPLY__".into(),
                media_urls: vec!["https://x/img.png".into()],
                reply_to: ReplyTag::None,
            }])
            .await
            .unwrap();
        assert_eq!(sink.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn typing_armed_once_and_cleared() {
        let sink = FakeSink::default();
        let mut session = DeliverySession::new(&sink, "42", None, false);
        session.push_block(Payload::text("a")).await.unwrap();
        session.push_block(Payload::text("b")).await.unwrap();
        session.mark_run_complete().await;

        assert_eq!(sink.typing_starts.load(Ordering::SeqCst), 1);
        assert_eq!(sink.typing_stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn heartbeat_never_types() {
        let sink = FakeSink::default();
        let mut session = DeliverySession::new(&sink, "42", None, true);
        session.push_block(Payload::text("alive")).await.unwrap();
        session.mark_run_complete().await;
        assert_eq!(sink.typing_starts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn reply_tags_resolved() {
        let sink = FakeSink::default();
        let mut session = DeliverySession::new(&sink, "42", Some("m100".into()), false);

        session
            .finalize(vec![
                Payload {
                    text: "threaded".into(),
                    media_urls: vec![],
                    reply_to: ReplyTag::Current,
                },
                Payload {
                    text: "explicit".into(),
                    media_urls: vec![],
                    reply_to: ReplyTag::Explicit("m7".into()),
                },
            ])
            .await
            .unwrap();

        let sent = sink.sent.lock();
        assert_eq!(sent[0], ("threaded".into(), Some("m100".into())));
        assert_eq!(sent[1], ("explicit".into(), Some("m7".into())));
    }

    #[tokio::test]
    async fn long_text_chunked_for_channel() {
        let sink = FakeSink::default();
        let mut session = DeliverySession::new(&sink, "42", None, false);
        session
            .finalize(vec![Payload::text("z".repeat(5_000))])
            .await
            .unwrap();
        let sent = sink.sent.lock();
        assert!(sent.len() >= 2);
        assert!(sent.iter().all(|(t, _)| t.chars().count() <= 4_096));
    }
}
