//! Single-writer scheduler over the cron store.
//!
//! All store mutations happen under the cron lock; job bodies run outside
//! it. A run is reserved by writing `running_at_ms` before release, which
//! makes two concurrent `run` calls resolve to exactly one execution, and
//! makes a crash mid-run detectable at the next startup (stale marker).

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use serde::Serialize;
use tokio::sync::{broadcast, Mutex, Notify};
use uuid::Uuid;

use oc_domain::error::Result;

use crate::job::{CronJob, CronJobState};
use crate::store::CronStore;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Executor contract
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Outcome of one job body execution.
#[derive(Debug, Clone, Default)]
pub struct RunResult {
    pub ok: bool,
    pub error: Option<String>,
    pub delivery_status: Option<String>,
}

impl RunResult {
    pub fn success(delivery_status: impl Into<String>) -> Self {
        Self {
            ok: true,
            error: None,
            delivery_status: Some(delivery_status.into()),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
            delivery_status: None,
        }
    }
}

/// Runs a job body. The gateway implements this by enqueueing an agent
/// turn on the job's target session.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job: &CronJob) -> RunResult;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Events & run modes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CronEvent {
    Added { job_id: Uuid, next_run_at_ms: Option<i64> },
    Removed { job_id: Uuid },
    Updated { job_id: Uuid, next_run_at_ms: Option<i64> },
    Started { job_id: Uuid },
    Finished { job_id: Uuid, next_run_at_ms: Option<i64> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Fire only when the job's slot is due.
    Due,
    /// Operator-requested run; bypasses the due check.
    Force,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub ran: bool,
    pub reason: Option<String>,
}

impl RunOutcome {
    fn ran() -> Self {
        Self { ran: true, reason: None }
    }
    fn skipped(reason: &str) -> Self {
        Self {
            ran: false,
            reason: Some(reason.to_owned()),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Recompute rules
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A past-due slot that was never executed must survive recomputation, or
/// an on-time recompute could advance past the slot before missed-run
/// replay picks it up.
fn preserves_past_due(state: &CronJobState, now_ms: i64) -> bool {
    match state.next_run_at_ms {
        Some(next) => {
            next <= now_ms
                && state.running_at_ms.is_none()
                && state.last_run_at_ms.map_or(true, |last| last < next)
        }
        None => false,
    }
}

/// Recompute `next_run_at_ms` for every job, preserving unexecuted
/// past-due slots. Disabled jobs lose their scheduling state (I1).
pub fn recompute_next_runs(jobs: &mut [CronJob], now_ms: i64) {
    for job in jobs.iter_mut() {
        if !job.enabled {
            job.clear_schedule_state();
            continue;
        }
        if job.state.running_at_ms.is_some() || preserves_past_due(&job.state, now_ms) {
            continue;
        }
        job.state.next_run_at_ms = job.schedule.next_run_at_ms(now_ms);
    }
}

/// Read-side variant: fills in missing slots only, never moves an
/// existing one.
pub fn recompute_next_runs_for_maintenance(jobs: &mut [CronJob], now_ms: i64) {
    for job in jobs.iter_mut() {
        if job.enabled && job.state.next_run_at_ms.is_none() && job.state.running_at_ms.is_none() {
            job.state.next_run_at_ms = job.schedule.next_run_at_ms(now_ms);
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scheduler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct CronScheduler {
    store: CronStore,
    executor: Arc<dyn JobExecutor>,
    /// The cron lock: guards check-and-reserve and apply-result.
    lock: Mutex<()>,
    events: broadcast::Sender<CronEvent>,
    rearm: Notify,
    /// Jobs whose stale running marker was cleared at startup; each skips
    /// one missed-run replay.
    skip_once: SyncMutex<HashSet<Uuid>>,
}

impl CronScheduler {
    pub fn new(store: CronStore, executor: Arc<dyn JobExecutor>) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            store,
            executor,
            lock: Mutex::new(()),
            events,
            rearm: Notify::new(),
            skip_once: SyncMutex::new(HashSet::new()),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CronEvent> {
        self.events.subscribe()
    }

    pub fn list(&self) -> Vec<CronJob> {
        self.store.jobs()
    }

    pub fn status(&self, id: &Uuid) -> Option<CronJob> {
        self.store.get(id)
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Startup sequence: clear stale running markers (adding them to the
    /// skip-once set), replay missed runs, recompute, arm the timer.
    pub async fn start(self: &Arc<Self>) -> Result<tokio::task::JoinHandle<()>> {
        let now = now_ms();

        {
            let _guard = self.lock.lock().await;
            let stale = self
                .store
                .mutate(|jobs| {
                    let mut stale = Vec::new();
                    for job in jobs.iter_mut() {
                        if job.state.running_at_ms.take().is_some() {
                            stale.push(job.id);
                        }
                    }
                    recompute_next_runs(jobs, now);
                    stale
                })
                .await?;
            if !stale.is_empty() {
                tracing::warn!(count = stale.len(), "cleared stale cron running markers");
                self.skip_once.lock().extend(stale);
            }
        }

        self.run_missed_jobs(now).await;

        let scheduler = self.clone();
        Ok(tokio::spawn(async move { scheduler.timer_loop().await }))
    }

    /// Fire every job whose slot is already due, except jobs consuming a
    /// skip-once token from a stale marker.
    async fn run_missed_jobs(self: &Arc<Self>, now_ms: i64) {
        let due: Vec<Uuid> = self
            .store
            .jobs()
            .into_iter()
            .filter(|j| j.enabled && j.state.next_run_at_ms.map_or(false, |n| n <= now_ms))
            .map(|j| j.id)
            .collect();

        for id in due {
            if self.skip_once.lock().remove(&id) {
                tracing::info!(job_id = %id, "skipping missed replay after stale running marker");
                // The slot was consumed by the interrupted run; advance it.
                let _guard = self.lock.lock().await;
                let _ = self
                    .store
                    .mutate(|jobs| {
                        if let Some(job) = jobs.iter_mut().find(|j| j.id == id) {
                            job.state.next_run_at_ms = job.schedule.next_run_at_ms(now_ms + 1);
                        }
                    })
                    .await;
                continue;
            }
            if let Err(e) = self.run(id, RunMode::Due).await {
                tracing::warn!(job_id = %id, error = %e, "missed-run replay failed");
            }
        }
    }

    async fn timer_loop(self: Arc<Self>) {
        loop {
            let now = now_ms();
            let next = self
                .store
                .jobs()
                .into_iter()
                .filter(|j| j.enabled && j.state.running_at_ms.is_none())
                .filter_map(|j| j.state.next_run_at_ms)
                .min();

            match next {
                Some(at) if at <= now => {
                    let due: Vec<Uuid> = self
                        .store
                        .jobs()
                        .into_iter()
                        .filter(|j| {
                            j.enabled
                                && j.state.running_at_ms.is_none()
                                && j.state.next_run_at_ms.map_or(false, |n| n <= now)
                        })
                        .map(|j| j.id)
                        .collect();
                    for id in due {
                        if let Err(e) = self.run(id, RunMode::Due).await {
                            tracing::warn!(job_id = %id, error = %e, "scheduled run failed");
                        }
                    }
                }
                Some(at) => {
                    let wait = std::time::Duration::from_millis((at - now).max(1) as u64);
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = self.rearm.notified() => {}
                    }
                }
                None => self.rearm.notified().await,
            }
        }
    }

    // ── CRUD ─────────────────────────────────────────────────────────

    pub async fn add(&self, mut job: CronJob) -> Result<CronJob> {
        let _guard = self.lock.lock().await;
        let now = now_ms();
        if job.enabled {
            job.state.next_run_at_ms = job.schedule.next_run_at_ms(now);
        } else {
            job.clear_schedule_state();
        }
        let stored = job.clone();
        self.store.mutate(move |jobs| jobs.push(job)).await?;
        let _ = self.events.send(CronEvent::Added {
            job_id: stored.id,
            next_run_at_ms: stored.state.next_run_at_ms,
        });
        self.rearm.notify_waiters();
        Ok(stored)
    }

    pub async fn remove(&self, id: Uuid) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let removed = self
            .store
            .mutate(move |jobs| {
                let before = jobs.len();
                jobs.retain(|j| j.id != id);
                jobs.len() != before
            })
            .await?;
        if removed {
            let _ = self.events.send(CronEvent::Removed { job_id: id });
            self.rearm.notify_waiters();
        }
        Ok(removed)
    }

    /// Mutate one job and recompute its slot.
    pub async fn update(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut CronJob) + Send,
    ) -> Result<Option<CronJob>> {
        let _guard = self.lock.lock().await;
        let now = now_ms();
        let updated = self
            .store
            .mutate(move |jobs| {
                let job = jobs.iter_mut().find(|j| j.id == id)?;
                f(job);
                job.updated_at_ms = now;
                if job.enabled {
                    if job.state.running_at_ms.is_none() && !preserves_past_due(&job.state, now) {
                        job.state.next_run_at_ms = job.schedule.next_run_at_ms(now);
                    }
                } else {
                    job.clear_schedule_state();
                }
                Some(job.clone())
            })
            .await?;
        if let Some(ref job) = updated {
            let _ = self.events.send(CronEvent::Updated {
                job_id: job.id,
                next_run_at_ms: job.state.next_run_at_ms,
            });
            self.rearm.notify_waiters();
        }
        Ok(updated)
    }

    // ── Execution ────────────────────────────────────────────────────

    /// Run one job. Under the lock: reject if already running, check
    /// due-ness (`Force` bypasses), reserve by setting `running_at_ms`,
    /// persist. The body executes after the lock is released.
    pub async fn run(&self, id: Uuid, mode: RunMode) -> Result<RunOutcome> {
        let now = now_ms();

        let reserved = {
            let _guard = self.lock.lock().await;
            let Some(job) = self.store.get(&id) else {
                return Ok(RunOutcome::skipped("not-found"));
            };
            if job.state.running_at_ms.is_some() {
                return Ok(RunOutcome::skipped("already-running"));
            }
            if !job.enabled && mode != RunMode::Force {
                return Ok(RunOutcome::skipped("disabled"));
            }
            let due = job.state.next_run_at_ms.map_or(false, |n| n <= now);
            if !due && mode != RunMode::Force {
                return Ok(RunOutcome::skipped("not-due"));
            }
            self.store
                .mutate(move |jobs| {
                    if let Some(j) = jobs.iter_mut().find(|j| j.id == id) {
                        j.state.running_at_ms = Some(now);
                    }
                })
                .await?;
            let mut job = job;
            job.state.running_at_ms = Some(now);
            job
        };

        let _ = self.events.send(CronEvent::Started { job_id: id });
        tracing::info!(job_id = %id, name = %reserved.name, "cron job started");

        let started = std::time::Instant::now();
        let result = self.executor.execute(&reserved).await;
        let duration_ms = started.elapsed().as_millis() as i64;

        let next_run_at_ms = {
            let _guard = self.lock.lock().await;
            let finish_now = now_ms();
            self.store
                .mutate(move |jobs| {
                    let Some(pos) = jobs.iter().position(|j| j.id == id) else {
                        return None;
                    };
                    if jobs[pos].is_one_shot() {
                        jobs.remove(pos);
                        return None;
                    }
                    let job = &mut jobs[pos];
                    job.state.running_at_ms = None;
                    job.state.last_run_at_ms = Some(now);
                    job.state.last_duration_ms = Some(duration_ms);
                    job.state.last_error = result.error.clone();
                    job.state.last_delivery_status = result.delivery_status.clone();
                    // Advance strictly past the executed slot.
                    job.state.next_run_at_ms =
                        job.schedule.next_run_at_ms(finish_now.max(now) + 1);
                    job.state.next_run_at_ms
                })
                .await?
        };

        let _ = self.events.send(CronEvent::Finished {
            job_id: id,
            next_run_at_ms,
        });
        tracing::info!(job_id = %id, duration_ms, next_run_at_ms, "cron job finished");
        self.rearm.notify_waiters();
        Ok(RunOutcome::ran())
    }

    /// Re-read the store and recompute all slots (config reload path).
    pub async fn force_reload(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        let now = now_ms();
        self.store
            .mutate(move |jobs| recompute_next_runs(jobs, now))
            .await?;
        self.rearm.notify_waiters();
        Ok(())
    }
}

impl std::fmt::Debug for CronScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CronScheduler").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{CronSchedule, SessionTarget};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingExecutor {
        runs: AtomicUsize,
        delay_ms: u64,
    }

    #[async_trait]
    impl JobExecutor for CountingExecutor {
        async fn execute(&self, _job: &CronJob) -> RunResult {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.delay_ms > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
            }
            RunResult::success("delivered")
        }
    }

    fn every_job(every_ms: i64, anchor_ms: i64) -> CronJob {
        CronJob::new(
            "tick",
            CronSchedule::Every {
                every_ms,
                anchor_ms,
            },
            "tick",
        )
    }

    fn scheduler_with(
        dir: &tempfile::TempDir,
        delay_ms: u64,
    ) -> (Arc<CronScheduler>, Arc<CountingExecutor>) {
        let store = CronStore::open(dir.path(), "main").unwrap();
        let executor = Arc::new(CountingExecutor {
            runs: AtomicUsize::new(0),
            delay_ms,
        });
        (CronScheduler::new(store, executor.clone()), executor)
    }

    // ── Recompute rules ──────────────────────────────────────────────

    #[test]
    fn recompute_preserves_unexecuted_past_due_slot() {
        let mut job = every_job(60_000, 60_000);
        job.state.next_run_at_ms = Some(60_000);

        let mut jobs = vec![job];
        recompute_next_runs(&mut jobs, 60_000);
        // Slot is due and never executed: a recompute must not advance it.
        assert_eq!(jobs[0].state.next_run_at_ms, Some(60_000));

        // After an execution of that slot, recompute advances normally.
        jobs[0].state.last_run_at_ms = Some(60_000);
        recompute_next_runs(&mut jobs, 60_000);
        assert_eq!(jobs[0].state.next_run_at_ms, Some(60_000));
        recompute_next_runs(&mut jobs, 60_001);
        assert_eq!(jobs[0].state.next_run_at_ms, Some(120_000));
    }

    #[test]
    fn recompute_clears_disabled_jobs() {
        let mut job = every_job(1_000, 0);
        job.enabled = false;
        job.state.next_run_at_ms = Some(5_000);
        job.state.running_at_ms = Some(4_000);

        let mut jobs = vec![job];
        recompute_next_runs(&mut jobs, 10_000);
        assert_eq!(jobs[0].state.next_run_at_ms, None);
        assert_eq!(jobs[0].state.running_at_ms, None);
    }

    #[test]
    fn maintenance_never_advances_past_due() {
        let mut job = every_job(60_000, 0);
        job.state.next_run_at_ms = Some(60_000);
        job.state.last_run_at_ms = Some(60_000); // executed, would advance

        let mut jobs = vec![job];
        recompute_next_runs_for_maintenance(&mut jobs, 500_000);
        assert_eq!(jobs[0].state.next_run_at_ms, Some(60_000));
    }

    // ── Single-fire ──────────────────────────────────────────────────

    #[tokio::test]
    async fn concurrent_runs_fire_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, executor) = scheduler_with(&dir, 50);

        let job = every_job(1, 0);
        let id = job.id;
        scheduler.add(job).await.unwrap();

        let (a, b) = tokio::join!(
            scheduler.run(id, RunMode::Force),
            scheduler.run(id, RunMode::Force),
        );
        let outcomes = [a.unwrap(), b.unwrap()];
        assert_eq!(executor.runs.load(Ordering::SeqCst), 1);
        assert_eq!(outcomes.iter().filter(|o| o.ran).count(), 1);
        let skipped = outcomes.iter().find(|o| !o.ran).unwrap();
        assert_eq!(skipped.reason.as_deref(), Some("already-running"));
    }

    #[tokio::test]
    async fn not_due_rejected_force_bypasses() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, executor) = scheduler_with(&dir, 0);

        // Far-future anchor: never due.
        let job = every_job(60_000, now_ms() + 3_600_000);
        let id = job.id;
        scheduler.add(job).await.unwrap();

        let due = scheduler.run(id, RunMode::Due).await.unwrap();
        assert!(!due.ran);
        assert_eq!(due.reason.as_deref(), Some("not-due"));

        let forced = scheduler.run(id, RunMode::Force).await.unwrap();
        assert!(forced.ran);
        assert_eq!(executor.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn execution_applies_result_and_advances() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, _) = scheduler_with(&dir, 0);

        let job = every_job(3_600_000, 0);
        let id = job.id;
        scheduler.add(job).await.unwrap();
        scheduler.run(id, RunMode::Force).await.unwrap();

        let job = scheduler.status(&id).unwrap();
        assert!(job.state.running_at_ms.is_none());
        assert!(job.state.last_run_at_ms.is_some());
        assert_eq!(job.state.last_delivery_status.as_deref(), Some("delivered"));
        assert!(job.state.last_duration_ms.is_some());
        let next = job.state.next_run_at_ms.unwrap();
        assert!(next > now_ms());
    }

    #[tokio::test]
    async fn one_shot_deleted_after_run() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, _) = scheduler_with(&dir, 0);

        let job = CronJob::new(
            "once",
            CronSchedule::At {
                at_ms: now_ms() + 60_000,
            },
            "go",
        );
        let id = job.id;
        scheduler.add(job).await.unwrap();
        scheduler.run(id, RunMode::Force).await.unwrap();
        assert!(scheduler.status(&id).is_none());
    }

    #[tokio::test]
    async fn started_precedes_finished() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, _) = scheduler_with(&dir, 10);
        let mut events = scheduler.subscribe();

        let job = every_job(1, 0);
        let id = job.id;
        scheduler.add(job).await.unwrap();
        scheduler.run(id, RunMode::Force).await.unwrap();

        // Added, Started, Finished in order.
        assert!(matches!(events.recv().await.unwrap(), CronEvent::Added { .. }));
        assert!(matches!(
            events.recv().await.unwrap(),
            CronEvent::Started { job_id } if job_id == id
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            CronEvent::Finished { job_id, .. } if job_id == id
        ));
    }

    // ── Startup ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn stale_running_marker_cleared_and_replay_skipped_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = CronStore::open(dir.path(), "main").unwrap();

        // Simulate a crash mid-run: running_at_ms persisted, slot past due.
        let mut job = every_job(60_000, 0);
        job.state.next_run_at_ms = Some(now_ms() - 10_000);
        job.state.running_at_ms = Some(now_ms() - 10_000);
        let id = job.id;
        store.mutate(|jobs| jobs.push(job)).await.unwrap();

        let executor = Arc::new(CountingExecutor {
            runs: AtomicUsize::new(0),
            delay_ms: 0,
        });
        let scheduler = CronScheduler::new(store, executor.clone());
        let handle = scheduler.start().await.unwrap();
        handle.abort();

        // The stale marker is gone, the replay was skipped, and the slot
        // advanced instead of firing.
        let job = scheduler.status(&id).unwrap();
        assert!(job.state.running_at_ms.is_none());
        assert_eq!(executor.runs.load(Ordering::SeqCst), 0);
        assert!(job.state.next_run_at_ms.unwrap() > now_ms() - 1_000);
    }

    #[tokio::test]
    async fn missed_job_replayed_on_start() {
        let dir = tempfile::tempdir().unwrap();
        let store = CronStore::open(dir.path(), "main").unwrap();

        let mut job = every_job(3_600_000, 0);
        job.state.next_run_at_ms = Some(now_ms() - 5_000);
        let id = job.id;
        store.mutate(|jobs| jobs.push(job)).await.unwrap();

        let executor = Arc::new(CountingExecutor {
            runs: AtomicUsize::new(0),
            delay_ms: 0,
        });
        let scheduler = CronScheduler::new(store, executor.clone());
        let handle = scheduler.start().await.unwrap();
        handle.abort();

        assert_eq!(executor.runs.load(Ordering::SeqCst), 1);
        let job = scheduler.status(&id).unwrap();
        assert!(job.state.last_run_at_ms.is_some());
    }
}
