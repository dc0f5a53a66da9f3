//! Shell-wrapper detection, inline-command extraction, and segmentation.

use crate::wrappers::basename;

/// Shell families the engine recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellFamily {
    /// `sh`, `bash`, `zsh`, `dash`, `ash`, `ksh`, `fish`.
    Posix,
    /// `cmd.exe` / `cmd`.
    Cmd,
    /// `powershell` / `pwsh`.
    PowerShell,
}

const POSIX_SHELLS: &[&str] = &["sh", "bash", "zsh", "dash", "ash", "ksh", "fish"];

/// Classify a command head as a shell, if it is one.
pub fn shell_family(head: &str) -> Option<ShellFamily> {
    let name = basename(head).to_ascii_lowercase();
    let name = name.strip_suffix(".exe").unwrap_or(&name);
    if POSIX_SHELLS.contains(&name) {
        Some(ShellFamily::Posix)
    } else if name == "cmd" {
        Some(ShellFamily::Cmd)
    } else if name == "powershell" || name == "pwsh" {
        Some(ShellFamily::PowerShell)
    } else {
        None
    }
}

/// Extract the inline command string from a shell invocation
/// (`bash -c '…'`, `cmd /c …`, `powershell -Command …`).
///
/// Returns `None` when the invocation has no inline command (interactive
/// shell, script file, unknown flags).
pub fn extract_inline_command(family: ShellFamily, args: &[String]) -> Option<String> {
    match family {
        ShellFamily::Posix => {
            let mut i = 0;
            while i < args.len() {
                let a = &args[i];
                if a == "-c" {
                    return args.get(i + 1).cloned();
                }
                // Pre -c option soup (-l, -e, combined -lc).
                if a.starts_with('-') && a.len() > 1 && !a.contains('c') {
                    i += 1;
                    continue;
                }
                if a.starts_with('-') && a.ends_with('c') {
                    return args.get(i + 1).cloned();
                }
                return None;
            }
            None
        }
        ShellFamily::Cmd => {
            for (i, a) in args.iter().enumerate() {
                let lower = a.to_ascii_lowercase();
                if lower == "/c" || lower == "/k" {
                    // cmd joins everything after /c.
                    return Some(args[i + 1..].join(" ")).filter(|s| !s.is_empty());
                }
            }
            None
        }
        ShellFamily::PowerShell => {
            for (i, a) in args.iter().enumerate() {
                let lower = a.to_ascii_lowercase();
                if lower == "-command" || lower == "-c" {
                    return Some(args[i + 1..].join(" ")).filter(|s| !s.is_empty());
                }
            }
            None
        }
    }
}

/// Split a shell string on `;`, `&&`, `||`, and `|`, respecting single and
/// double quotes and backslash escapes. Each returned segment is trimmed.
pub fn split_segments(command: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = command.chars().peekable();
    let mut in_single = false;
    let mut in_double = false;

    while let Some(c) = chars.next() {
        match c {
            '\\' if !in_single => {
                current.push(c);
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            '\'' if !in_double => {
                in_single = !in_single;
                current.push(c);
            }
            '"' if !in_single => {
                in_double = !in_double;
                current.push(c);
            }
            ';' if !in_single && !in_double => {
                push_segment(&mut segments, &mut current);
            }
            '|' if !in_single && !in_double => {
                // `||` and `|` both end a segment.
                if chars.peek() == Some(&'|') {
                    chars.next();
                }
                push_segment(&mut segments, &mut current);
            }
            '&' if !in_single && !in_double => {
                if chars.peek() == Some(&'&') {
                    chars.next();
                    push_segment(&mut segments, &mut current);
                } else {
                    // Background `&` terminates the segment too.
                    push_segment(&mut segments, &mut current);
                }
            }
            _ => current.push(c),
        }
    }
    push_segment(&mut segments, &mut current);
    segments
}

fn push_segment(segments: &mut Vec<String>, current: &mut String) {
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        segments.push(trimmed.to_owned());
    }
    current.clear();
}

/// Tokenize one shell segment into words (quote-aware, no expansion).
pub fn tokenize(segment: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut chars = segment.chars().peekable();
    let mut in_single = false;
    let mut in_double = false;
    let mut has_token = false;

    while let Some(c) = chars.next() {
        match c {
            '\\' if !in_single => {
                if let Some(next) = chars.next() {
                    current.push(next);
                    has_token = true;
                }
            }
            '\'' if !in_double => {
                in_single = !in_single;
                has_token = true;
            }
            '"' if !in_single => {
                in_double = !in_double;
                has_token = true;
            }
            c if c.is_whitespace() && !in_single && !in_double => {
                if has_token {
                    tokens.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            _ => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if has_token {
        tokens.push(current);
    }
    tokens
}
