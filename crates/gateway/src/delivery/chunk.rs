//! Channel-limit text chunking, Markdown-fence safe.
//!
//! Long text splits on the preferred break — paragraph, then newline,
//! then sentence — within a `[min, max]` window. When a split lands
//! inside a fenced code block, the fence is closed on the current chunk
//! and reopened with the same language tag on the next, so every chunk
//! parses as a closed Markdown document.

/// Per-message character limit for a channel.
pub fn channel_limit(channel: &str) -> usize {
    match channel {
        "discord" => 2_000,
        "telegram" => 4_096,
        "whatsapp" => 65_000,
        "slack" => 40_000,
        _ => 4_000,
    }
}

/// Split `text` into chunks of at most `max_chars` characters.
/// `min_chars` bounds how early a preferred break may be taken.
pub fn chunk_markdown(text: &str, min_chars: usize, max_chars: usize) -> Vec<String> {
    let max = max_chars.max(16);
    let min = min_chars.min(max / 2);
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= max {
        return vec![text.to_owned()];
    }

    // Keep headroom for fence close/reopen repairs.
    let budget = if text.contains("```") {
        max.saturating_sub(12).max(8)
    } else {
        max
    };

    let mut raw = Vec::new();
    let mut start = 0usize;
    while chars.len() - start > budget {
        let cut = start + preferred_split(&chars[start..], min, budget);
        raw.push(chars[start..cut].iter().collect::<String>());
        start = cut;
    }
    raw.push(chars[start..].iter().collect::<String>());

    repair_fences(raw)
}

/// Index to cut at within `window` (which is longer than `budget`).
fn preferred_split(window: &[char], min: usize, budget: usize) -> usize {
    let limit = budget.min(window.len());

    // Paragraph break: cut after "\n\n".
    if let Some(i) = rfind_seq(&window[..limit], &['\n', '\n'], min) {
        return i + 2;
    }
    // Line break.
    if let Some(i) = rfind_seq(&window[..limit], &['\n'], min) {
        return i + 1;
    }
    // Sentence break: cut after ". ".
    if let Some(i) = rfind_seq(&window[..limit], &['.', ' '], min) {
        return i + 2;
    }
    limit
}

/// Last occurrence of `needle` in `haystack` at index ≥ `min`.
fn rfind_seq(haystack: &[char], needle: &[char], min: usize) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    (min..=haystack.len() - needle.len())
        .rev()
        .find(|&i| &haystack[i..i + needle.len()] == needle)
}

/// Close fences left open at chunk boundaries and reopen them (same
/// language tag) on the following chunk.
fn repair_fences(raw: Vec<String>) -> Vec<String> {
    let mut out = Vec::with_capacity(raw.len());
    let mut open: Option<String> = None;

    for chunk in raw {
        let mut text = match &open {
            Some(lang) => format!("```{lang}\n{chunk}"),
            None => chunk,
        };
        open = fence_state(&text);
        if open.is_some() {
            if !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str("```");
        }
        out.push(text);
    }
    out
}

/// Fence state after scanning `text`: `Some(lang)` when a fence is open.
fn fence_state(text: &str) -> Option<String> {
    let mut open: Option<String> = None;
    for line in text.lines() {
        let trimmed = line.trim_start();
        if let Some(rest) = trimmed.strip_prefix("```") {
            open = match open {
                Some(_) => None,
                None => Some(rest.trim().to_owned()),
            };
        }
    }
    open
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Every chunk must be a closed Markdown document.
    fn assert_closed(chunks: &[String]) {
        for chunk in chunks {
            assert!(
                fence_state(chunk).is_none(),
                "chunk left a fence open: {chunk:?}"
            );
        }
    }

    #[test]
    fn short_text_untouched() {
        assert_eq!(chunk_markdown("hello", 10, 100), vec!["hello"]);
    }

    #[test]
    fn splits_prefer_paragraph_breaks() {
        let text = format!("{}\n\n{}", "a".repeat(60), "b".repeat(60));
        let chunks = chunk_markdown(&text, 20, 80);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].starts_with('a'));
        assert!(chunks[1].starts_with('b'));
    }

    #[test]
    fn falls_back_to_newline_then_sentence() {
        let text = format!("{}\n{}", "a".repeat(50), "b".repeat(50));
        let chunks = chunk_markdown(&text, 20, 80);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].trim_end(), "a".repeat(50));

        let prose = format!("{}. {}", "x".repeat(40), "y".repeat(50));
        let chunks = chunk_markdown(&prose, 20, 80);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].ends_with(". "));
    }

    #[test]
    fn fenced_block_closed_and_reopened() {
        let code = "```ts\nconst a = 1;\nconst b = 2;\nconst c = 3;\nconst d = 4;\n```";
        let chunks = chunk_markdown(code, 8, 40);
        assert!(chunks.len() >= 2, "expected a split: {chunks:?}");
        assert_closed(&chunks);
        // Continuation chunks reopen with the language tag.
        assert!(chunks[1].starts_with("```ts\n"), "got: {:?}", chunks[1]);
        assert!(chunks[0].ends_with("```"));
    }

    #[test]
    fn every_chunk_within_limit() {
        let text = "word ".repeat(500);
        let max = 120;
        for chunk in chunk_markdown(&text, 40, max) {
            assert!(chunk.chars().count() <= max);
        }
    }

    #[test]
    fn hard_split_without_any_break() {
        let text = "x".repeat(300);
        let chunks = chunk_markdown(&text, 20, 100);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.chars().count() <= 100));
        assert_eq!(chunks.join(""), text);
    }

    #[test]
    fn nested_content_reassembles() {
        let text = format!(
            "intro\n\n```python\n{}\n```\n\nafter",
            "print('line')\n".repeat(10)
        );
        let chunks = chunk_markdown(&text, 30, 90);
        assert_closed(&chunks);
        assert!(chunks.len() > 1);
    }

    #[test]
    fn channel_limits() {
        assert_eq!(channel_limit("discord"), 2_000);
        assert_eq!(channel_limit("telegram"), 4_096);
        assert_eq!(channel_limit("whatsapp"), 65_000);
        assert_eq!(channel_limit("slack"), 40_000);
        assert_eq!(channel_limit("webchat"), 4_000);
    }
}
