//! Liveness tracking — derives idle/active/busy from open connections and
//! busy jobs.
//!
//! The tracker is the sole producer of outbound status updates: the binary
//! wires its change stream into `TunnelClient::send_status_update`, and no
//! other component pushes a status directly. Status is recomputed after every
//! add/remove and an event is emitted only on an actual value change.

use std::collections::HashSet;
use std::sync::Mutex;

use tokio::sync::broadcast;

use crate::protocol::Liveness;

/// Emitted whenever the derived liveness actually changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub previous: Liveness,
    pub current: Liveness,
    pub connections: usize,
    pub busy_jobs: usize,
}

#[derive(Debug)]
struct TrackerInner {
    connections: HashSet<String>,
    busy_jobs: HashSet<String>,
    status: Liveness,
}

#[derive(Debug)]
pub struct StatusTracker {
    inner: Mutex<TrackerInner>,
    events: broadcast::Sender<StatusChange>,
}

impl Default for StatusTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusTracker {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Mutex::new(TrackerInner {
                connections: HashSet::new(),
                busy_jobs: HashSet::new(),
                status: Liveness::Idle,
            }),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.events.subscribe()
    }

    pub fn current(&self) -> Liveness {
        self.inner.lock().expect("tracker lock").status
    }

    pub fn connection_opened(&self, id: &str) {
        self.mutate(|inner| {
            inner.connections.insert(id.to_string());
        });
    }

    pub fn connection_closed(&self, id: &str) {
        self.mutate(|inner| {
            inner.connections.remove(id);
        });
    }

    pub fn job_started(&self, id: &str) {
        self.mutate(|inner| {
            inner.busy_jobs.insert(id.to_string());
        });
    }

    pub fn job_finished(&self, id: &str) {
        self.mutate(|inner| {
            inner.busy_jobs.remove(id);
        });
    }

    fn mutate(&self, apply: impl FnOnce(&mut TrackerInner)) {
        let mut inner = self.inner.lock().expect("tracker lock");
        apply(&mut inner);
        let derived = if !inner.busy_jobs.is_empty() {
            Liveness::Busy
        } else if !inner.connections.is_empty() {
            Liveness::Active
        } else {
            Liveness::Idle
        };
        if derived != inner.status {
            let change = StatusChange {
                previous: inner.status,
                current: derived,
                connections: inner.connections.len(),
                busy_jobs: inner.busy_jobs.len(),
            };
            inner.status = derived;
            let _ = self.events.send(change);
        }
    }
}
