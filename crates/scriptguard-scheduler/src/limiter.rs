//! Concurrency gate: caps running executions and queues the rest FIFO.
//!
//! A freed slot is handed directly to the oldest waiter, so a late arrival can
//! never overtake the queue. Waiters that give up (cancelled while queued) are
//! skipped; a slot handed to a waiter that vanished is returned immediately.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;

struct GateState {
    running: usize,
    max: usize,
    waiters: VecDeque<oneshot::Sender<()>>,
    total_admitted: u64,
}

impl GateState {
    /// Hand free slots to queued waiters, oldest first.
    fn pump(&mut self) {
        while self.running < self.max {
            let Some(waiter) = self.waiters.pop_front() else {
                break;
            };
            if waiter.send(()).is_ok() {
                self.running += 1;
                self.total_admitted += 1;
            }
        }
    }

    fn release(&mut self) {
        self.running = self.running.saturating_sub(1);
        self.pump();
    }
}

/// Snapshot of gate occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct GateStats {
    pub running: usize,
    pub queued: usize,
    pub max: usize,
    pub total_admitted: u64,
}

/// Admission gate shared by all executions. Cheap to clone.
#[derive(Clone)]
pub struct ConcurrencyGate {
    state: Arc<Mutex<GateState>>,
}

impl ConcurrencyGate {
    pub fn new(max: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(GateState {
                running: 0,
                max: max.max(1),
                waiters: VecDeque::new(),
                total_admitted: 0,
            })),
        }
    }

    /// Wait for a slot. Dropping the future while queued gives up the place.
    pub async fn acquire(&self) -> GatePermit {
        let rx = {
            let mut state = lock(&self.state);
            if state.running < state.max && state.waiters.is_empty() {
                state.running += 1;
                state.total_admitted += 1;
                return GatePermit {
                    state: self.state.clone(),
                };
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            tracing::debug!(
                "📥 Gate full ({}/{}), queued at position {}",
                state.running,
                state.max,
                state.waiters.len()
            );
            rx
        };

        let mut waiting = Waiting {
            state: self.state.clone(),
            rx: Some(rx),
        };
        if let Some(rx) = waiting.rx.as_mut() {
            // The sender lives in the queue until a slot is handed over.
            let _ = rx.await;
        }
        waiting.rx = None;
        GatePermit {
            state: self.state.clone(),
        }
    }

    /// Change the ceiling. Raising it admits queued waiters at once; lowering
    /// it lets running executions finish.
    pub fn set_max(&self, max: usize) {
        let mut state = lock(&self.state);
        state.max = max.max(1);
        state.pump();
        tracing::info!("🚦 Concurrency ceiling set to {}", state.max);
    }

    pub fn stats(&self) -> GateStats {
        let state = lock(&self.state);
        GateStats {
            running: state.running,
            queued: state.waiters.iter().filter(|w| !w.is_closed()).count(),
            max: state.max,
            total_admitted: state.total_admitted,
        }
    }

    pub fn running(&self) -> usize {
        self.stats().running
    }

    pub fn queued(&self) -> usize {
        self.stats().queued
    }
}

/// A held slot. Released on drop.
pub struct GatePermit {
    state: Arc<Mutex<GateState>>,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        lock(&self.state).release();
    }
}

/// Cleans up after an `acquire` that was dropped mid-wait.
struct Waiting {
    state: Arc<Mutex<GateState>>,
    rx: Option<oneshot::Receiver<()>>,
}

impl Drop for Waiting {
    fn drop(&mut self) {
        if let Some(mut rx) = self.rx.take() {
            rx.close();
            // A slot may have been handed over just before we closed.
            if rx.try_recv().is_ok() {
                lock(&self.state).release();
            }
        }
    }
}

fn lock(state: &Mutex<GateState>) -> MutexGuard<'_, GateState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
