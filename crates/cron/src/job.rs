//! Cron job model.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::expr::{parse_tz, CronExpr};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Schedule kinds
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CronSchedule {
    /// Fixed interval anchored at a reference instant.
    Every { every_ms: i64, anchor_ms: i64 },
    /// 5-field cron expression evaluated in a timezone.
    Cron { expr: String, tz: String },
    /// One-shot at an absolute instant; the job is deleted after firing.
    At { at_ms: i64 },
}

impl CronSchedule {
    /// Next due instant at-or-after `now_ms`. `None` = never fires again.
    pub fn next_run_at_ms(&self, now_ms: i64) -> Option<i64> {
        match self {
            CronSchedule::Every {
                every_ms,
                anchor_ms,
            } => {
                if *every_ms <= 0 {
                    return None;
                }
                if now_ms <= *anchor_ms {
                    return Some(*anchor_ms);
                }
                // Smallest k with anchor + k·every ≥ now.
                let elapsed = now_ms - anchor_ms;
                let k = (elapsed + every_ms - 1) / every_ms;
                Some(anchor_ms + k * every_ms)
            }
            CronSchedule::Cron { expr, tz } => {
                let parsed = CronExpr::parse(expr)?;
                let after = chrono::DateTime::from_timestamp_millis(now_ms - 1)?;
                parsed
                    .next_after(after, parse_tz(tz))
                    .map(|dt| dt.timestamp_millis())
            }
            CronSchedule::At { at_ms } => (*at_ms > now_ms).then_some(*at_ms),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Targets, payload, delivery
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Which session the job's turn runs in.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionTarget {
    /// The agent's main session.
    #[default]
    Main,
    /// A fresh throwaway session per run.
    Isolated,
    /// An explicit session key.
    Named { key: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CronPayload {
    AgentTurn { message: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CronDeliveryMode {
    /// Run without telling anyone.
    #[default]
    Silent,
    /// Post the result to the session's last delivery context.
    Announce,
    /// Post to an explicit channel/recipient.
    Direct,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CronDelivery {
    #[serde(default)]
    pub mode: CronDeliveryMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Job + runtime state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Scheduler-owned state. `running_at_ms` is set only while a run is
/// reserved and cleared when its result is applied; a marker that survives
/// a restart is stale and gets cleared (the job skips one replay).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CronJobState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_delivery_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_duration_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CronJob {
    pub id: Uuid,
    pub name: String,
    pub enabled: bool,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    pub schedule: CronSchedule,
    #[serde(default)]
    pub session_target: SessionTarget,
    pub payload: CronPayload,
    #[serde(default)]
    pub delivery: CronDelivery,
    #[serde(default)]
    pub state: CronJobState,
}

impl CronJob {
    pub fn new(name: impl Into<String>, schedule: CronSchedule, message: impl Into<String>) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        CronJob {
            id: Uuid::new_v4(),
            name: name.into(),
            enabled: true,
            created_at_ms: now,
            updated_at_ms: now,
            schedule,
            session_target: SessionTarget::default(),
            payload: CronPayload::AgentTurn {
                message: message.into(),
            },
            delivery: CronDelivery::default(),
            state: CronJobState::default(),
        }
    }

    /// Whether this job is deleted after a single successful fire.
    pub fn is_one_shot(&self) -> bool {
        matches!(self.schedule, CronSchedule::At { .. })
    }

    /// Disabled jobs carry no scheduling state (invariant I1).
    pub fn clear_schedule_state(&mut self) {
        self.state.next_run_at_ms = None;
        self.state.running_at_ms = None;
    }
}
