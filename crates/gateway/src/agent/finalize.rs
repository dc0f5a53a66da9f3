//! Text transformers applied to streamed and finalized payloads.
//!
//! Directive tags and heartbeat tokens are extracted deterministically so
//! the delivery pipeline's dedup keys match between a block streamed
//! mid-turn and the same text reappearing in the final payload set.

/// Keep-alive token emitted by heartbeat turns.
pub const HEARTBEAT_TOKEN: &str = "HEARTBEAT_OK";

/// Sentinel meaning "say nothing".
pub const SILENT_SENTINEL: &str = "__SILENT_REPLY__";

/// The reply-target a payload asked for.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ReplyTag {
    #[default]
    None,
    /// `[[reply_to_current]]` — thread onto the triggering message.
    Current,
    /// `[[reply_to:<id>]]` — an explicit message id.
    Explicit(String),
}

/// Strip `HEARTBEAT_OK` from the text. Returns `None` when the text was
/// only the heartbeat (nothing to deliver).
pub fn strip_heartbeat(text: &str) -> Option<String> {
    if !text.contains(HEARTBEAT_TOKEN) {
        return Some(text.to_owned());
    }
    let stripped = text.replace(HEARTBEAT_TOKEN, "");
    let trimmed = stripped.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_owned())
    }
}

/// Extract reply-to tags from the text. An explicit id wins over
/// `[[reply_to_current]]` when both appear.
pub fn extract_reply_tag(text: &str) -> (String, ReplyTag) {
    let mut out = text.to_owned();
    let mut tag = ReplyTag::None;

    while let Some(start) = out.find("[[reply_to:") {
        let Some(rel_end) = out[start..].find("]]") else {
            break;
        };
        let end = start + rel_end;
        let id = out[start + "[[reply_to:".len()..end].trim().to_owned();
        out.replace_range(start..end + 2, "");
        if !id.is_empty() {
            tag = ReplyTag::Explicit(id);
        }
    }

    if out.contains("[[reply_to_current]]") {
        out = out.replace("[[reply_to_current]]", "");
        if tag == ReplyTag::None {
            tag = ReplyTag::Current;
        }
    }

    (out.trim().to_owned(), tag)
}

/// Whether a payload is the silent sentinel (dropped when it carries no
/// media).
pub fn is_silent_sentinel(text: &str) -> bool {
    text.trim() == SILENT_SENTINEL
}

/// Rewrite the known noisy transport error into something a person can
/// act on.
pub fn friendly_error(message: &str) -> String {
    if message.contains("socket closed unexpectedly") {
        "LLM connection failed — the provider closed the stream. Retrying usually helps.".into()
    } else {
        message.to_owned()
    }
}
