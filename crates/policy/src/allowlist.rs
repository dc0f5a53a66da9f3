//! Per-agent allowlist persistence.
//!
//! Stored at `allowlist/<agentId>.json` in the state dir. Every match
//! bumps the entry's `last_used_at_ms` so stale entries are visible to the
//! operator; an `allow-always` approval persists the derived pattern.

use std::path::Path;

use serde::{Deserialize, Serialize};

use oc_domain::error::Result;
use oc_store::JsonStore;

use crate::shell::tokenize;
use crate::wrappers::basename;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Model
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllowlistEntry {
    pub pattern: String,
    pub created_at_ms: i64,
    #[serde(default)]
    pub last_used_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

/// A human decision on a command the allowlist missed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalDecision {
    AllowOnce,
    AllowAlways,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AllowlistFile {
    #[serde(default)]
    pub entries: Vec<AllowlistEntry>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pattern matching
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Match a command string against an allowlist pattern.
///
/// Patterns are token sequences where a trailing `*` matches any remaining
/// arguments and a lone `*` token matches exactly one argument. The head
/// token compares by basename so `/usr/bin/git` matches a `git *` entry.
pub fn pattern_matches(pattern: &str, command: &str) -> bool {
    let pat_tokens = tokenize(pattern);
    let cmd_tokens = tokenize(command);
    if pat_tokens.is_empty() || cmd_tokens.is_empty() {
        return false;
    }

    let mut ci = 0;
    for (pi, pat) in pat_tokens.iter().enumerate() {
        if pat == "*" && pi == pat_tokens.len() - 1 {
            // Trailing wildcard swallows the rest (including nothing).
            return true;
        }
        let Some(cmd) = cmd_tokens.get(ci) else {
            return false;
        };
        let matched = if pat == "*" {
            true
        } else if ci == 0 {
            basename(cmd) == *pat || cmd == pat
        } else {
            cmd == pat
        };
        if !matched {
            return false;
        }
        ci += 1;
    }
    ci == cmd_tokens.len()
}

/// Derive a persistable pattern from an approved command: head + `*`.
pub fn derive_pattern(command: &str) -> Option<String> {
    let tokens = tokenize(command);
    let head = tokens.first()?;
    Some(format!("{} *", basename(head)))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct AllowlistStore {
    store: JsonStore<AllowlistFile>,
}

impl AllowlistStore {
    /// Open `allowlist/<agent_id>.json` under the state dir.
    pub fn open(state_dir: &Path, agent_id: &str) -> Result<Self> {
        let path = state_dir.join("allowlist").join(format!("{agent_id}.json"));
        Ok(Self {
            store: JsonStore::load(path)?,
        })
    }

    pub fn patterns(&self) -> Vec<String> {
        self.store
            .read(|f| f.entries.iter().map(|e| e.pattern.clone()).collect())
    }

    pub fn entries(&self) -> Vec<AllowlistEntry> {
        self.store.read(|f| f.entries.clone())
    }

    /// Add a pattern if not already present.
    pub async fn add(&self, pattern: &str, agent_id: Option<&str>) -> Result<bool> {
        let pattern = pattern.to_owned();
        let agent_id = agent_id.map(|s| s.to_owned());
        self.store
            .mutate(move |f| {
                if f.entries.iter().any(|e| e.pattern == pattern) {
                    return false;
                }
                f.entries.push(AllowlistEntry {
                    pattern,
                    created_at_ms: chrono::Utc::now().timestamp_millis(),
                    last_used_at_ms: None,
                    agent_id,
                });
                true
            })
            .await
    }

    /// Record a use of whichever pattern matched `command`.
    pub async fn record_use(&self, command: &str) -> Result<()> {
        let command = command.to_owned();
        self.store
            .mutate(move |f| {
                let now = chrono::Utc::now().timestamp_millis();
                for entry in &mut f.entries {
                    if pattern_matches(&entry.pattern, &command) {
                        entry.last_used_at_ms = Some(now);
                    }
                }
            })
            .await
    }

    pub async fn remove(&self, pattern: &str) -> Result<bool> {
        let pattern = pattern.to_owned();
        self.store
            .mutate(move |f| {
                let before = f.entries.len();
                f.entries.retain(|e| e.pattern != pattern);
                f.entries.len() != before
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_wildcard() {
        assert!(pattern_matches("git *", "git status"));
        assert!(pattern_matches("git *", "git"));
        assert!(pattern_matches("git *", "git commit -m 'x'"));
        assert!(!pattern_matches("git *", "got status"));
    }

    #[test]
    fn head_matches_by_basename() {
        assert!(pattern_matches("git *", "/usr/bin/git status"));
    }

    #[test]
    fn exact_pattern_requires_full_match() {
        assert!(pattern_matches("ls -la", "ls -la"));
        assert!(!pattern_matches("ls -la", "ls -la /tmp"));
        assert!(!pattern_matches("ls -la", "ls"));
    }

    #[test]
    fn mid_wildcard_matches_one_token() {
        assert!(pattern_matches("kubectl * get", "kubectl pods get"));
        assert!(!pattern_matches("kubectl * get", "kubectl get"));
    }

    #[test]
    fn derive_pattern_from_command() {
        assert_eq!(derive_pattern("curl https://x -o out"), Some("curl *".into()));
        assert_eq!(derive_pattern("/usr/local/bin/deno run x"), Some("deno *".into()));
        assert_eq!(derive_pattern(""), None);
    }

    #[tokio::test]
    async fn store_add_and_track_use() {
        let dir = tempfile::tempdir().unwrap();
        let store = AllowlistStore::open(dir.path(), "main").unwrap();

        assert!(store.add("git *", Some("main")).await.unwrap());
        assert!(!store.add("git *", Some("main")).await.unwrap());

        store.record_use("git status").await.unwrap();
        let entries = store.entries();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].last_used_at_ms.is_some());

        // Reload from disk, entry survives.
        let reopened = AllowlistStore::open(dir.path(), "main").unwrap();
        assert_eq!(reopened.patterns(), vec!["git *".to_string()]);
    }
}
