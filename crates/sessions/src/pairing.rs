//! Pairing-code exchange for unknown DM senders.
//!
//! Channels with `dm_policy = "pairing"` answer a first-contact DM with a
//! short code instead of starting a turn. The operator approves the code
//! via `clawdbot pairing approve`, which adds the sender to the channel
//! allowlist.

use std::path::Path;

use serde::{Deserialize, Serialize};

use oc_domain::error::Result;
use oc_store::JsonStore;

/// Pending codes are capped; oldest get evicted first.
const MAX_PENDING: usize = 64;

/// Codes expire after an hour.
const EXPIRY_MS: i64 = 60 * 60 * 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingCode {
    pub code: String,
    pub channel: String,
    pub sender_id: String,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PairingFile {
    #[serde(default)]
    pub codes: Vec<PairingCode>,
}

pub struct PairingStore {
    store: JsonStore<PairingFile>,
}

impl PairingStore {
    pub fn open(state_dir: &Path) -> Result<Self> {
        Ok(Self {
            store: JsonStore::load(state_dir.join("pairing.json"))?,
        })
    }

    /// Issue (or re-issue) a code for a sender. An unexpired code for the
    /// same channel+sender is reused so repeated DMs don't mint new ones.
    pub async fn issue(&self, channel: &str, sender_id: &str) -> Result<String> {
        let channel = channel.to_owned();
        let sender_id = sender_id.to_owned();
        self.store
            .mutate(move |file| {
                let now = chrono::Utc::now().timestamp_millis();
                file.codes.retain(|c| now - c.created_at_ms < EXPIRY_MS);

                if let Some(existing) = file
                    .codes
                    .iter()
                    .find(|c| c.channel == channel && c.sender_id == sender_id)
                {
                    return existing.code.clone();
                }

                while file.codes.len() >= MAX_PENDING {
                    file.codes.remove(0);
                }
                let code = new_code();
                file.codes.push(PairingCode {
                    code: code.clone(),
                    channel,
                    sender_id,
                    created_at_ms: now,
                });
                code
            })
            .await
    }

    /// Approve a code: removes it and returns the paired identity.
    pub async fn approve(&self, code: &str) -> Result<Option<PairingCode>> {
        let code = code.to_uppercase();
        self.store
            .mutate(move |file| {
                let now = chrono::Utc::now().timestamp_millis();
                file.codes.retain(|c| now - c.created_at_ms < EXPIRY_MS);
                let pos = file.codes.iter().position(|c| c.code == code)?;
                Some(file.codes.remove(pos))
            })
            .await
    }

    pub fn list(&self, channel: Option<&str>) -> Vec<PairingCode> {
        let now = chrono::Utc::now().timestamp_millis();
        self.store.read(|file| {
            file.codes
                .iter()
                .filter(|c| now - c.created_at_ms < EXPIRY_MS)
                .filter(|c| channel.map_or(true, |ch| c.channel == ch))
                .cloned()
                .collect()
        })
    }
}

fn new_code() -> String {
    let raw = uuid::Uuid::new_v4().simple().to_string();
    raw[..8].to_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn issue_is_idempotent_per_sender() {
        let dir = tempfile::tempdir().unwrap();
        let store = PairingStore::open(dir.path()).unwrap();

        let a = store.issue("telegram", "alice").await.unwrap();
        let b = store.issue("telegram", "alice").await.unwrap();
        assert_eq!(a, b);

        let c = store.issue("telegram", "bob").await.unwrap();
        assert_ne!(a, c);
        assert_eq!(store.list(Some("telegram")).len(), 2);
    }

    #[tokio::test]
    async fn approve_consumes_code() {
        let dir = tempfile::tempdir().unwrap();
        let store = PairingStore::open(dir.path()).unwrap();

        let code = store.issue("discord", "u7").await.unwrap();
        let approved = store.approve(&code).await.unwrap().unwrap();
        assert_eq!(approved.sender_id, "u7");
        assert!(store.approve(&code).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn approve_is_case_insensitive() {
        let dir = tempfile::tempdir().unwrap();
        let store = PairingStore::open(dir.path()).unwrap();
        let code = store.issue("discord", "u1").await.unwrap();
        assert!(store
            .approve(&code.to_lowercase())
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn pending_capped() {
        let dir = tempfile::tempdir().unwrap();
        let store = PairingStore::open(dir.path()).unwrap();
        for i in 0..(MAX_PENDING + 5) {
            store.issue("telegram", &format!("user{i}")).await.unwrap();
        }
        assert_eq!(store.list(None).len(), MAX_PENDING);
    }
}
