//! Auth profile store and rotation.
//!
//! `auth.json` holds one entry per credential. The rotator hands out the
//! explicitly requested profile, else walks the configured order, else
//! picks the least-recently-used ready profile. Auth failures and rate
//! limits put a profile into cooldown; a successful call clears it.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use oc_domain::error::{Error, Result};
use oc_store::JsonStore;

/// Cooldown applied after an auth failure or rate limit.
const COOLDOWN_MS: i64 = 5 * 60 * 1000;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Model
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialMode {
    Oauth,
    ApiKey,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthProfile {
    pub id: String,
    pub provider: String,
    pub mode: CredentialMode,
    /// Opaque credential material; the rotator never inspects it.
    pub credentials: Value,
    #[serde(default)]
    pub last_good: Option<i64>,
    #[serde(default)]
    pub cooldown_until: Option<i64>,
    #[serde(default)]
    pub usage_count: u64,
}

impl AuthProfile {
    fn ready(&self, now_ms: i64) -> bool {
        self.cooldown_until.map_or(true, |until| until <= now_ms)
    }

    /// The secret handed to the runtime. OAuth profiles store a current
    /// access token under `access_token`; API-key profiles under `key`.
    pub fn secret(&self) -> Option<String> {
        let field = match self.mode {
            CredentialMode::Oauth => "access_token",
            CredentialMode::ApiKey => "key",
        };
        self.credentials
            .get(field)
            .and_then(Value::as_str)
            .map(str::to_owned)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthFile {
    #[serde(default)]
    pub profiles: Vec<AuthProfile>,
    /// Preferred rotation order (profile ids); unlisted profiles follow.
    #[serde(default)]
    pub order: Vec<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store + rotation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct AuthProfileStore {
    store: JsonStore<AuthFile>,
}

impl AuthProfileStore {
    pub fn open(state_dir: &Path) -> Result<Self> {
        Ok(Self {
            store: JsonStore::load(state_dir.join("auth.json"))?,
        })
    }

    pub fn list(&self, provider: &str) -> Vec<AuthProfile> {
        self.store.read(|f| {
            f.profiles
                .iter()
                .filter(|p| p.provider == provider)
                .cloned()
                .collect()
        })
    }

    pub async fn upsert(&self, profile: AuthProfile) -> Result<()> {
        self.store
            .mutate(move |f| {
                if let Some(existing) = f.profiles.iter_mut().find(|p| p.id == profile.id) {
                    *existing = profile;
                } else {
                    f.profiles.push(profile);
                }
            })
            .await
    }

    /// Pick the next credential for `provider`.
    ///
    /// Order: `explicit_id` when given; else the configured order; else
    /// least-recently-used among ready profiles. When every profile is
    /// cooling down, the one whose cooldown expires soonest is returned —
    /// failing with a stale key beats failing with nothing.
    pub fn select(&self, provider: &str, explicit_id: Option<&str>) -> Result<AuthProfile> {
        let now = now_ms();
        self.store.read(|f| {
            let candidates: Vec<&AuthProfile> = f
                .profiles
                .iter()
                .filter(|p| p.provider == provider)
                .collect();
            if candidates.is_empty() {
                return Err(Error::Auth(format!(
                    "no auth profile configured for provider '{provider}'"
                )));
            }

            if let Some(id) = explicit_id {
                return candidates
                    .iter()
                    .find(|p| p.id == id)
                    .map(|p| (*p).clone())
                    .ok_or_else(|| Error::Auth(format!("auth profile '{id}' not found")));
            }

            for id in &f.order {
                if let Some(p) = candidates.iter().find(|p| p.id == *id && p.ready(now)) {
                    return Ok((*p).clone());
                }
            }

            let ready = candidates
                .iter()
                .filter(|p| p.ready(now))
                .min_by_key(|p| p.last_good.unwrap_or(0));
            if let Some(p) = ready {
                return Ok((*p).clone());
            }

            // All cooling down: least-bad option.
            candidates
                .iter()
                .min_by_key(|p| p.cooldown_until.unwrap_or(0))
                .map(|p| (*p).clone())
                .ok_or_else(|| Error::Auth("no auth profiles".into()))
        })
    }

    /// Count of profiles for the provider that are out of cooldown.
    pub fn ready_count(&self, provider: &str) -> usize {
        let now = now_ms();
        self.store.read(|f| {
            f.profiles
                .iter()
                .filter(|p| p.provider == provider && p.ready(now))
                .count()
        })
    }

    /// A failed call: start the cooldown clock.
    pub async fn mark_cooldown(&self, id: &str) -> Result<()> {
        let id = id.to_owned();
        self.store
            .mutate(move |f| {
                if let Some(p) = f.profiles.iter_mut().find(|p| p.id == id) {
                    p.cooldown_until = Some(now_ms() + COOLDOWN_MS);
                }
            })
            .await
    }

    /// A successful call clears cooldown and records usage.
    pub async fn mark_good(&self, id: &str) -> Result<()> {
        let id = id.to_owned();
        self.store
            .mutate(move |f| {
                if let Some(p) = f.profiles.iter_mut().find(|p| p.id == id) {
                    p.cooldown_until = None;
                    p.last_good = Some(now_ms());
                    p.usage_count += 1;
                }
            })
            .await
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(id: &str, provider: &str) -> AuthProfile {
        AuthProfile {
            id: id.into(),
            provider: provider.into(),
            mode: CredentialMode::ApiKey,
            credentials: serde_json::json!({"key": format!("sk-{id}")}),
            last_good: None,
            cooldown_until: None,
            usage_count: 0,
        }
    }

    #[tokio::test]
    async fn explicit_id_wins() {
        let dir = tempfile::tempdir().unwrap();
        let store = AuthProfileStore::open(dir.path()).unwrap();
        store.upsert(profile("a", "anthropic")).await.unwrap();
        store.upsert(profile("b", "anthropic")).await.unwrap();

        let picked = store.select("anthropic", Some("b")).unwrap();
        assert_eq!(picked.id, "b");
        assert!(store.select("anthropic", Some("zzz")).is_err());
    }

    #[tokio::test]
    async fn lru_rotation_among_ready() {
        let dir = tempfile::tempdir().unwrap();
        let store = AuthProfileStore::open(dir.path()).unwrap();
        let mut a = profile("a", "anthropic");
        a.last_good = Some(2_000);
        let mut b = profile("b", "anthropic");
        b.last_good = Some(1_000);
        store.upsert(a).await.unwrap();
        store.upsert(b).await.unwrap();

        // b used longest ago: picked first.
        assert_eq!(store.select("anthropic", None).unwrap().id, "b");
        store.mark_good("b").await.unwrap();
        assert_eq!(store.select("anthropic", None).unwrap().id, "a");
    }

    #[tokio::test]
    async fn cooldown_respected_then_cleared_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let store = AuthProfileStore::open(dir.path()).unwrap();
        store.upsert(profile("a", "anthropic")).await.unwrap();
        store.upsert(profile("b", "anthropic")).await.unwrap();

        store.mark_cooldown("a").await.unwrap();
        assert_eq!(store.ready_count("anthropic"), 1);
        assert_eq!(store.select("anthropic", None).unwrap().id, "b");

        store.mark_good("a").await.unwrap();
        assert_eq!(store.ready_count("anthropic"), 2);
        let a = store
            .list("anthropic")
            .into_iter()
            .find(|p| p.id == "a")
            .unwrap();
        assert!(a.cooldown_until.is_none());
        assert_eq!(a.usage_count, 1);
    }

    #[tokio::test]
    async fn all_cooling_returns_soonest_to_expire() {
        let dir = tempfile::tempdir().unwrap();
        let store = AuthProfileStore::open(dir.path()).unwrap();
        let mut a = profile("a", "anthropic");
        a.cooldown_until = Some(now_ms() + 100_000);
        let mut b = profile("b", "anthropic");
        b.cooldown_until = Some(now_ms() + 50_000);
        store.upsert(a).await.unwrap();
        store.upsert(b).await.unwrap();

        assert_eq!(store.select("anthropic", None).unwrap().id, "b");
    }

    #[tokio::test]
    async fn configured_order_beats_lru() {
        let dir = tempfile::tempdir().unwrap();
        let store = AuthProfileStore::open(dir.path()).unwrap();
        store.upsert(profile("a", "anthropic")).await.unwrap();
        store.upsert(profile("b", "anthropic")).await.unwrap();
        store
            .store
            .mutate(|f| f.order = vec!["b".into(), "a".into()])
            .await
            .unwrap();

        assert_eq!(store.select("anthropic", None).unwrap().id, "b");
    }

    #[test]
    fn secret_field_depends_on_mode() {
        let api = profile("a", "x");
        assert_eq!(api.secret().as_deref(), Some("sk-a"));

        let oauth = AuthProfile {
            mode: CredentialMode::Oauth,
            credentials: serde_json::json!({"access_token": "at-1", "refresh_token": "rt"}),
            ..profile("o", "x")
        };
        assert_eq!(oauth.secret().as_deref(), Some("at-1"));
    }
}
