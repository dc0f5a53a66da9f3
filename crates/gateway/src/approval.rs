//! Exec approval workflow — gates denied commands behind human review.
//!
//! When the policy engine misses the allowlist (or `ask = "always"`), the
//! run is parked here until the operator resolves it over the protocol
//! (`exec.approve`) or the timeout denies it. An `allow-always`
//! resolution also persists the command's derived allowlist pattern, so
//! the next run passes without asking.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::oneshot;
use uuid::Uuid;

use oc_policy::ApprovalDecision;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The operator's verdict on one parked command.
#[derive(Debug)]
pub enum ApprovalResolution {
    Approved(ApprovalDecision),
    Denied { reason: Option<String> },
}

/// A parked command waiting for human review.
pub struct PendingApproval {
    pub id: Uuid,
    pub command: String,
    pub created_at: DateTime<Utc>,
    pub respond: oneshot::Sender<ApprovalResolution>,
}

/// Serializable snapshot of a pending approval (protocol responses and
/// the `exec.approval` event).
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalInfo {
    pub id: Uuid,
    pub command: String,
    pub created_at: DateTime<Utc>,
}

impl From<&PendingApproval> for ApprovalInfo {
    fn from(p: &PendingApproval) -> Self {
        Self {
            id: p.id,
            command: p.command.clone(),
            created_at: p.created_at,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Thread-safe store for pending exec approvals.
///
/// Each entry holds the `oneshot::Sender` that unblocks the parked run
/// when the operator resolves it.
pub struct ApprovalStore {
    pending: RwLock<HashMap<Uuid, PendingApproval>>,
    timeout: Duration,
}

impl ApprovalStore {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: RwLock::new(HashMap::new()),
            timeout,
        }
    }

    /// The configured approval timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Park a command. Returns the snapshot for the announcement event.
    pub fn insert(&self, command: impl Into<String>) -> (ApprovalInfo, oneshot::Receiver<ApprovalResolution>) {
        let (respond, rx) = oneshot::channel();
        let pending = PendingApproval {
            id: Uuid::new_v4(),
            command: command.into(),
            created_at: Utc::now(),
            respond,
        };
        let info = ApprovalInfo::from(&pending);
        self.pending.write().insert(pending.id, pending);
        (info, rx)
    }

    /// Resolve a pending approval as approved. Returns `true` if found.
    pub fn approve(&self, id: &Uuid, decision: ApprovalDecision) -> bool {
        if let Some(pending) = self.pending.write().remove(id) {
            let _ = pending.respond.send(ApprovalResolution::Approved(decision));
            return true;
        }
        false
    }

    /// Resolve a pending approval as denied. Returns `true` if found.
    pub fn deny(&self, id: &Uuid, reason: Option<String>) -> bool {
        if let Some(pending) = self.pending.write().remove(id) {
            let _ = pending.respond.send(ApprovalResolution::Denied { reason });
            return true;
        }
        false
    }

    /// Drop a timed-out approval (called when the waiter gives up).
    pub fn remove_expired(&self, id: &Uuid) {
        self.pending.write().remove(id);
    }

    /// All currently pending approvals.
    pub fn list_pending(&self) -> Vec<ApprovalInfo> {
        self.pending
            .read()
            .values()
            .map(ApprovalInfo::from)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_store() -> ApprovalStore {
        ApprovalStore::new(Duration::from_secs(300))
    }

    #[test]
    fn insert_and_list() {
        let store = make_store();
        let (info, _rx) = store.insert("rm -rf /tmp/test");
        let list = store.list_pending();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, info.id);
        assert_eq!(list[0].command, "rm -rf /tmp/test");
    }

    #[tokio::test]
    async fn approve_resolves_channel() {
        let store = make_store();
        let (info, rx) = store.insert("curl https://x");

        assert!(store.approve(&info.id, ApprovalDecision::AllowOnce));
        let resolution = rx.await.unwrap();
        assert!(matches!(
            resolution,
            ApprovalResolution::Approved(ApprovalDecision::AllowOnce)
        ));
        assert!(store.list_pending().is_empty());
    }

    #[tokio::test]
    async fn deny_resolves_channel() {
        let store = make_store();
        let (info, rx) = store.insert("curl https://x");

        assert!(store.deny(&info.id, Some("too dangerous".into())));
        match rx.await.unwrap() {
            ApprovalResolution::Denied { reason } => {
                assert_eq!(reason.as_deref(), Some("too dangerous"));
            }
            _ => panic!("expected Denied"),
        }
    }

    #[test]
    fn resolve_nonexistent_returns_false() {
        let store = make_store();
        assert!(!store.approve(&Uuid::new_v4(), ApprovalDecision::AllowOnce));
        assert!(!store.deny(&Uuid::new_v4(), None));
    }

    #[test]
    fn remove_expired_clears_entry() {
        let store = make_store();
        let (info, _rx) = store.insert("sleep 60");
        store.remove_expired(&info.id);
        assert!(store.list_pending().is_empty());
    }

    #[test]
    fn timeout_returns_configured_duration() {
        let store = ApprovalStore::new(Duration::from_secs(60));
        assert_eq!(store.timeout(), Duration::from_secs(60));
    }
}
