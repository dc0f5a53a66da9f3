//! Per-session dispatch.
//!
//! Each session key owns one lane: a dedicated worker task that runs at
//! most one turn at a time and drains queued follow-ups FIFO. An optional
//! global semaphore caps concurrency across all lanes. New messages
//! arriving while a turn streams are handled per the session's queue
//! mode: interrupt, steer, followup, or drop.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio_util::sync::CancellationToken;

use oc_domain::levels::QueueMode;
use oc_sessions::SessionKey;

use crate::agent::{TurnControls, TurnRequest};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Contracts
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Executes one turn. The gateway wires this to the agent runner plus
/// delivery; tests substitute fakes.
#[async_trait]
pub trait TurnExecutor: Send + Sync {
    async fn execute(&self, request: TurnRequest, controls: TurnControls);
}

/// A queued turn waiting for the lane to free up.
#[derive(Debug, Clone)]
pub struct FollowupRun {
    pub request: TurnRequest,
    pub summary_line: String,
    pub enqueued_at: DateTime<Utc>,
}

/// What happened to a submitted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The lane was idle; the turn started.
    Started,
    /// Enqueued behind the active turn.
    Queued,
    /// Injected into the active run.
    Steered,
    /// The active run was cancelled; this turn runs next.
    Interrupted,
    /// Discarded because a turn was active.
    Dropped,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Lane worker
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

enum LaneMsg {
    Submit {
        request: TurnRequest,
        mode: QueueMode,
        reply: oneshot::Sender<SubmitOutcome>,
    },
    TurnDone,
}

struct ActiveTurn {
    cancel: CancellationToken,
    steer_tx: mpsc::UnboundedSender<String>,
}

struct LaneWorker {
    key: SessionKey,
    rx: mpsc::UnboundedReceiver<LaneMsg>,
    self_tx: mpsc::UnboundedSender<LaneMsg>,
    executor: Arc<dyn TurnExecutor>,
    global: Option<Arc<Semaphore>>,
    active: Option<ActiveTurn>,
    queue: VecDeque<FollowupRun>,
}

impl LaneWorker {
    async fn run(mut self) {
        while let Some(msg) = self.rx.recv().await {
            match msg {
                LaneMsg::Submit {
                    request,
                    mode,
                    reply,
                } => {
                    let outcome = self.handle_submit(request, mode);
                    let _ = reply.send(outcome);
                }
                LaneMsg::TurnDone => {
                    self.active = None;
                    // Follow-up drain: scheduled from the completion
                    // message so it fires even when the turn's callbacks
                    // outlive its future.
                    if let Some(next) = self.queue.pop_front() {
                        tracing::debug!(
                            session_key = %self.key,
                            queued = self.queue.len(),
                            "draining follow-up"
                        );
                        self.start_turn(next.request);
                    }
                }
            }
        }
    }

    fn handle_submit(&mut self, request: TurnRequest, mode: QueueMode) -> SubmitOutcome {
        if self.active.is_none() {
            self.start_turn(request);
            return SubmitOutcome::Started;
        }

        match mode {
            QueueMode::Interrupt => {
                if let Some(active) = &self.active {
                    active.cancel.cancel();
                }
                // Runs as soon as the cancelled turn reports done.
                self.queue.push_front(FollowupRun {
                    summary_line: summarize(&request.prompt),
                    request,
                    enqueued_at: Utc::now(),
                });
                SubmitOutcome::Interrupted
            }
            QueueMode::Steer => {
                let active = self.active.as_ref().expect("active checked above");
                match active.steer_tx.send(request.prompt.clone()) {
                    Ok(()) => SubmitOutcome::Steered,
                    Err(_) => {
                        // Injection failed (run draining or in
                        // compaction): fall back to followup.
                        self.enqueue(request);
                        SubmitOutcome::Queued
                    }
                }
            }
            QueueMode::Followup => {
                self.enqueue(request);
                SubmitOutcome::Queued
            }
            QueueMode::Drop => {
                tracing::info!(session_key = %self.key, "message dropped (queue mode drop)");
                SubmitOutcome::Dropped
            }
        }
    }

    fn enqueue(&mut self, request: TurnRequest) {
        self.queue.push_back(FollowupRun {
            summary_line: summarize(&request.prompt),
            request,
            enqueued_at: Utc::now(),
        });
    }

    fn start_turn(&mut self, request: TurnRequest) {
        let cancel = CancellationToken::new();
        let (steer_tx, steer_rx) = mpsc::unbounded_channel();
        self.active = Some(ActiveTurn {
            cancel: cancel.clone(),
            steer_tx,
        });

        let controls = TurnControls {
            cancel,
            steer_rx: Arc::new(tokio::sync::Mutex::new(steer_rx)),
        };
        let executor = self.executor.clone();
        let global = self.global.clone();
        let done_tx = self.self_tx.clone();
        tokio::spawn(async move {
            // The global lane bounds host-wide turn concurrency.
            let _permit = match &global {
                Some(sem) => sem.clone().acquire_owned().await.ok(),
                None => None,
            };
            executor.execute(request, controls).await;
            let _ = done_tx.send(LaneMsg::TurnDone);
        });
    }
}

fn summarize(prompt: &str) -> String {
    let line = prompt.lines().next().unwrap_or_default();
    line.chars().take(80).collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Dispatcher
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Dispatcher {
    executor: Arc<dyn TurnExecutor>,
    lanes: Mutex<HashMap<String, mpsc::UnboundedSender<LaneMsg>>>,
    global: Option<Arc<Semaphore>>,
}

impl Dispatcher {
    pub fn new(executor: Arc<dyn TurnExecutor>, max_concurrent: Option<usize>) -> Self {
        Self {
            executor,
            lanes: Mutex::new(HashMap::new()),
            global: max_concurrent.map(|n| Arc::new(Semaphore::new(n.max(1)))),
        }
    }

    /// Submit a turn to its session lane under the given queue mode.
    pub async fn submit(
        &self,
        key: &SessionKey,
        request: TurnRequest,
        mode: QueueMode,
    ) -> SubmitOutcome {
        let tx = self.lane_tx(key);
        let (reply_tx, reply_rx) = oneshot::channel();
        if tx
            .send(LaneMsg::Submit {
                request,
                mode,
                reply: reply_tx,
            })
            .is_err()
        {
            return SubmitOutcome::Dropped;
        }
        reply_rx.await.unwrap_or(SubmitOutcome::Dropped)
    }

    fn lane_tx(&self, key: &SessionKey) -> mpsc::UnboundedSender<LaneMsg> {
        let mut lanes = self.lanes.lock();
        lanes
            .entry(key.as_str().to_owned())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                let worker = LaneWorker {
                    key: key.clone(),
                    rx,
                    self_tx: tx.clone(),
                    executor: self.executor.clone(),
                    global: self.global.clone(),
                    active: None,
                    queue: VecDeque::new(),
                };
                tokio::spawn(worker.run());
                tx
            })
            .clone()
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Records execution order; each turn sleeps, steers drain into the
    /// log, cancellation ends the turn early.
    struct ScriptedExecutor {
        log: Mutex<Vec<String>>,
        turn_ms: u64,
        cancelled: AtomicUsize,
    }

    impl ScriptedExecutor {
        fn new(turn_ms: u64) -> Arc<Self> {
            Arc::new(Self {
                log: Mutex::new(Vec::new()),
                turn_ms,
                cancelled: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl TurnExecutor for ScriptedExecutor {
        async fn execute(&self, request: TurnRequest, controls: TurnControls) {
            self.log.lock().push(format!("start:{}", request.prompt));
            let work = tokio::time::sleep(Duration::from_millis(self.turn_ms));
            tokio::pin!(work);
            loop {
                let mut steer_rx = controls.steer_rx.lock().await;
                tokio::select! {
                    _ = &mut work => break,
                    _ = controls.cancel.cancelled() => {
                        self.cancelled.fetch_add(1, Ordering::SeqCst);
                        self.log.lock().push(format!("cancelled:{}", request.prompt));
                        return;
                    }
                    Some(injected) = steer_rx.recv() => {
                        self.log.lock().push(format!("steered:{injected}"));
                    }
                }
            }
            self.log.lock().push(format!("end:{}", request.prompt));
        }
    }

    fn key() -> SessionKey {
        SessionKey::main("claw", "main")
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(150)).await;
    }

    #[tokio::test]
    async fn followups_drain_fifo() {
        let executor = ScriptedExecutor::new(40);
        let dispatcher = Dispatcher::new(executor.clone(), None);

        let a = dispatcher
            .submit(&key(), TurnRequest::new(key(), "a"), QueueMode::Followup)
            .await;
        let b = dispatcher
            .submit(&key(), TurnRequest::new(key(), "b"), QueueMode::Followup)
            .await;
        let c = dispatcher
            .submit(&key(), TurnRequest::new(key(), "c"), QueueMode::Followup)
            .await;
        assert_eq!(a, SubmitOutcome::Started);
        assert_eq!(b, SubmitOutcome::Queued);
        assert_eq!(c, SubmitOutcome::Queued);

        settle().await;
        let log = executor.log.lock().clone();
        assert_eq!(
            log,
            vec!["start:a", "end:a", "start:b", "end:b", "start:c", "end:c"]
        );
    }

    #[tokio::test]
    async fn interrupt_cancels_active_and_runs_next() {
        let executor = ScriptedExecutor::new(5_000);
        let dispatcher = Dispatcher::new(executor.clone(), None);

        dispatcher
            .submit(&key(), TurnRequest::new(key(), "slow"), QueueMode::Interrupt)
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let outcome = dispatcher
            .submit(&key(), TurnRequest::new(key(), "urgent"), QueueMode::Interrupt)
            .await;
        assert_eq!(outcome, SubmitOutcome::Interrupted);

        settle().await;
        let log = executor.log.lock().clone();
        assert!(log.contains(&"cancelled:slow".to_string()));
        assert!(log.contains(&"start:urgent".to_string()));
        assert_eq!(executor.cancelled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn steer_injects_into_active_run() {
        let executor = ScriptedExecutor::new(200);
        let dispatcher = Dispatcher::new(executor.clone(), None);

        dispatcher
            .submit(&key(), TurnRequest::new(key(), "base"), QueueMode::Steer)
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let outcome = dispatcher
            .submit(&key(), TurnRequest::new(key(), "extra"), QueueMode::Steer)
            .await;
        assert_eq!(outcome, SubmitOutcome::Steered);

        settle().await;
        settle().await;
        let log = executor.log.lock().clone();
        assert!(log.contains(&"steered:extra".to_string()), "log: {log:?}");
        // Only one turn ran.
        assert_eq!(log.iter().filter(|l| l.starts_with("start:")).count(), 1);
    }

    #[tokio::test]
    async fn drop_mode_discards_while_active() {
        let executor = ScriptedExecutor::new(150);
        let dispatcher = Dispatcher::new(executor.clone(), None);

        dispatcher
            .submit(&key(), TurnRequest::new(key(), "busy"), QueueMode::Drop)
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let outcome = dispatcher
            .submit(&key(), TurnRequest::new(key(), "ignored"), QueueMode::Drop)
            .await;
        assert_eq!(outcome, SubmitOutcome::Dropped);

        settle().await;
        let log = executor.log.lock().clone();
        assert_eq!(log.iter().filter(|l| l.starts_with("start:")).count(), 1);
    }

    #[tokio::test]
    async fn lanes_are_independent() {
        let executor = ScriptedExecutor::new(80);
        let dispatcher = Dispatcher::new(executor.clone(), None);
        let key_b = SessionKey::direct("claw", "telegram", "bob");

        let a = dispatcher
            .submit(&key(), TurnRequest::new(key(), "a"), QueueMode::Followup)
            .await;
        let b = dispatcher
            .submit(&key_b, TurnRequest::new(key_b.clone(), "b"), QueueMode::Followup)
            .await;
        // Different sessions both start immediately.
        assert_eq!(a, SubmitOutcome::Started);
        assert_eq!(b, SubmitOutcome::Started);
        assert_eq!(dispatcher.lane_count(), 2);
    }

    #[tokio::test]
    async fn global_lane_caps_concurrency() {
        let executor = ScriptedExecutor::new(100);
        let dispatcher = Dispatcher::new(executor.clone(), Some(1));
        let key_b = SessionKey::direct("claw", "telegram", "bob");

        dispatcher
            .submit(&key(), TurnRequest::new(key(), "a"), QueueMode::Followup)
            .await;
        dispatcher
            .submit(&key_b, TurnRequest::new(key_b.clone(), "b"), QueueMode::Followup)
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // With one global permit, only one turn may have started.
        let started = executor
            .log
            .lock()
            .iter()
            .filter(|l| l.starts_with("start:"))
            .count();
        assert_eq!(started, 1);

        settle().await;
        let started = executor
            .log
            .lock()
            .iter()
            .filter(|l| l.starts_with("start:"))
            .count();
        assert_eq!(started, 2);
    }
}
