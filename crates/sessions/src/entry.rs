//! Per-session metadata record and its store.
//!
//! Stored at `sessions/<agentId>.json` as a map from session key to
//! [`SessionEntry`]. Every field mutation bumps `updated_at`; the file is
//! rewritten atomically on each change.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use oc_domain::error::Result;
use oc_domain::levels::{
    ElevatedLevel, GroupActivation, QueueMode, SendPolicy, ThinkingLevel, VerboseLevel,
};
use oc_store::JsonStore;

use crate::session_key::SessionKey;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Entry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Where the session's replies currently go.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeliveryContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

/// One conversation's durable state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEntry {
    /// Opaque id of the current run file.
    pub session_id: String,
    /// Transcript path for the current run.
    pub session_file: String,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub model_provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub thinking_level: ThinkingLevel,
    #[serde(default)]
    pub verbose_level: VerboseLevel,
    #[serde(default)]
    pub elevated_level: ElevatedLevel,
    #[serde(default)]
    pub send_policy: SendPolicy,
    #[serde(default)]
    pub queue_mode: QueueMode,
    #[serde(default)]
    pub group_activation: GroupActivation,
    #[serde(default)]
    pub compaction_count: u64,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub context_tokens: u64,
    #[serde(default)]
    pub delivery_context: DeliveryContext,
}

impl SessionEntry {
    fn new(transcript_dir: &Path) -> Self {
        let session_id = uuid::Uuid::new_v4().to_string();
        let session_file = transcript_dir
            .join(format!("{session_id}.jsonl"))
            .to_string_lossy()
            .into_owned();
        SessionEntry {
            session_id,
            session_file,
            updated_at: Utc::now(),
            model_provider: None,
            model: None,
            thinking_level: ThinkingLevel::default(),
            verbose_level: VerboseLevel::default(),
            elevated_level: ElevatedLevel::default(),
            send_policy: SendPolicy::default(),
            queue_mode: QueueMode::default(),
            group_activation: GroupActivation::default(),
            compaction_count: 0,
            input_tokens: 0,
            output_tokens: 0,
            total_tokens: 0,
            context_tokens: 0,
            delivery_context: DeliveryContext::default(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SessionStore {
    store: JsonStore<HashMap<String, SessionEntry>>,
    transcript_dir: std::path::PathBuf,
}

impl SessionStore {
    /// Open `sessions/<agent_id>.json` under the state dir.
    pub fn open(state_dir: &Path, agent_id: &str) -> Result<Self> {
        let dir = state_dir.join("sessions");
        let transcript_dir = dir.join(agent_id);
        std::fs::create_dir_all(&transcript_dir)?;
        Ok(Self {
            store: JsonStore::load(dir.join(format!("{agent_id}.json")))?,
            transcript_dir,
        })
    }

    pub fn get(&self, key: &SessionKey) -> Option<SessionEntry> {
        self.store.read(|map| map.get(key.as_str()).cloned())
    }

    pub fn list(&self) -> Vec<(SessionKey, SessionEntry)> {
        self.store.read(|map| {
            map.iter()
                .map(|(k, v)| (SessionKey::named(k.clone()), v.clone()))
                .collect()
        })
    }

    /// Resolve or create the entry for `key`. Returns `(entry, is_new)`.
    pub async fn resolve_or_create(&self, key: &SessionKey) -> Result<(SessionEntry, bool)> {
        if let Some(entry) = self.get(key) {
            return Ok((entry, false));
        }
        let key_owned = key.as_str().to_owned();
        let transcript_dir = self.transcript_dir.clone();
        let entry = self
            .store
            .mutate(move |map| {
                map.entry(key_owned)
                    .or_insert_with(|| SessionEntry::new(&transcript_dir))
                    .clone()
            })
            .await?;
        tracing::info!(session_key = %key, session_id = %entry.session_id, "session created");
        Ok((entry, true))
    }

    /// Apply `f` to the entry, bumping `updated_at`. No-op when the key is
    /// unknown. Returns the updated entry.
    pub async fn update(
        &self,
        key: &SessionKey,
        f: impl FnOnce(&mut SessionEntry) + Send,
    ) -> Result<Option<SessionEntry>> {
        let key_owned = key.as_str().to_owned();
        self.store
            .mutate(move |map| {
                let entry = map.get_mut(&key_owned)?;
                f(entry);
                entry.updated_at = Utc::now();
                Some(entry.clone())
            })
            .await
    }

    /// Mint a fresh session id for the key (the `/reset` directive).
    pub async fn reset(&self, key: &SessionKey) -> Result<Option<SessionEntry>> {
        let transcript_dir = self.transcript_dir.clone();
        self.update(key, move |entry| {
            let fresh = SessionEntry::new(&transcript_dir);
            entry.session_id = fresh.session_id;
            entry.session_file = fresh.session_file;
            entry.compaction_count = 0;
            entry.input_tokens = 0;
            entry.output_tokens = 0;
            entry.total_tokens = 0;
            entry.context_tokens = 0;
        })
        .await
    }

    /// Record token usage after a turn.
    pub async fn record_usage(
        &self,
        key: &SessionKey,
        provider: &str,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
        context_tokens: u64,
    ) -> Result<()> {
        let provider = provider.to_owned();
        let model = model.to_owned();
        self.update(key, move |entry| {
            entry.model_provider = Some(provider);
            entry.model = Some(model);
            entry.input_tokens += input_tokens;
            entry.output_tokens += output_tokens;
            entry.total_tokens += input_tokens + output_tokens;
            entry.context_tokens = context_tokens;
        })
        .await?;
        Ok(())
    }

    pub fn transcript_dir(&self) -> &Path {
        &self.transcript_dir
    }
}
