//! Event broadcast hub.
//!
//! Every server push goes through the hub: live subscribers get frames
//! over a broadcast channel, and the newest N frames are kept so a late
//! joiner can replay what it missed.

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;

use oc_protocol::Frame;

/// Replay buffer depth per subscription.
const DEFAULT_BUFFER: usize = 200;

pub struct EventHub {
    history: Mutex<VecDeque<Frame>>,
    tx: broadcast::Sender<Frame>,
    capacity: usize,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER)
    }
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(16));
        Self {
            history: Mutex::new(VecDeque::with_capacity(capacity)),
            tx,
            capacity,
        }
    }

    /// Broadcast an event frame and remember it for late joiners.
    pub fn emit(&self, event: &str, params: Value) {
        let frame = Frame::push(event, params);
        {
            let mut history = self.history.lock();
            if history.len() == self.capacity {
                history.pop_front();
            }
            history.push_back(frame.clone());
        }
        let _ = self.tx.send(frame);
    }

    /// Subscribe: returns the replay backlog (oldest first) and the live
    /// receiver.
    pub fn subscribe(&self) -> (Vec<Frame>, broadcast::Receiver<Frame>) {
        // Subscribe before snapshotting so no frame can fall between.
        let rx = self.tx.subscribe();
        let backlog = self.history.lock().iter().cloned().collect();
        (backlog, rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn late_joiner_replays_newest_n() {
        let hub = EventHub::new(3);
        for i in 0..5 {
            hub.emit("chat", serde_json::json!({"seq": i}));
        }
        let (backlog, _rx) = hub.subscribe();
        let seqs: Vec<i64> = backlog
            .iter()
            .map(|f| f.params.as_ref().unwrap()["seq"].as_i64().unwrap())
            .collect();
        assert_eq!(seqs, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn live_subscriber_sees_new_events() {
        let hub = EventHub::default();
        let (backlog, mut rx) = hub.subscribe();
        assert!(backlog.is_empty());

        hub.emit("session.updated", serde_json::json!({"key": "k"}));
        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.event.as_deref(), Some("session.updated"));
    }
}
