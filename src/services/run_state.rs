//! Run-level scheduler state.
//!
//! One [`RunState`] exists per run. It owns the worker slots, the state of
//! every selected instance and the progress counters; workers only touch it
//! through [`RunState::acquire_slot`], [`RunState::release_slot`],
//! [`RunState::transition`] and [`RunState::record_result`].

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, OwnedSemaphorePermit, RwLock, Semaphore};
use tracing::debug;

use crate::domain::errors::{HarnessError, HarnessResult};
use crate::domain::models::{EvaluationState, FailureReason, VerdictKind};

/// Progress event for observers (the CLI progress bar).
#[derive(Debug, Clone)]
pub enum RunEvent {
    /// Dispatch is about to begin.
    Started {
        run_id: String,
        to_evaluate: usize,
        skipped: usize,
    },
    /// An instance moved to a new state.
    StateChanged {
        instance_id: String,
        state: EvaluationState,
    },
    /// An instance reached a terminal state.
    InstanceFinished {
        instance_id: String,
        verdict: Option<VerdictKind>,
        failure: Option<FailureReason>,
    },
    /// Cancellation requested; no new instances will start.
    Cancelling,
    /// All dispatched work has drained.
    Completed(RunStats),
}

/// Snapshot of run progress.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStats {
    pub total: usize,
    /// Instances with an existing verdict that were not re-evaluated.
    pub skipped: usize,
    pub queued: usize,
    pub active: usize,
    pub peak_active: usize,
    pub done: usize,
    pub failed: usize,
    /// Instances interrupted by cancellation, left without a verdict.
    pub cancelled: usize,
    pub by_kind: BTreeMap<VerdictKind, usize>,
}

impl RunStats {
    pub fn finished(&self) -> usize {
        self.done + self.failed
    }
}

/// A held worker slot. Dropping it frees the slot.
#[derive(Debug)]
pub struct WorkerSlot {
    instance_id: String,
    active: Arc<AtomicUsize>,
    _permit: OwnedSemaphorePermit,
}

impl WorkerSlot {
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
struct Inner {
    states: HashMap<String, EvaluationState>,
    skipped: usize,
    by_kind: BTreeMap<VerdictKind, usize>,
}

/// Scheduler-owned state for one run.
pub struct RunState {
    run_id: String,
    max_workers: usize,
    slots: Arc<Semaphore>,
    active: Arc<AtomicUsize>,
    peak_active: AtomicUsize,
    inner: RwLock<Inner>,
    event_tx: Option<mpsc::Sender<RunEvent>>,
}

impl RunState {
    pub fn new(run_id: impl Into<String>, max_workers: usize) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            run_id: run_id.into(),
            max_workers,
            slots: Arc::new(Semaphore::new(max_workers)),
            active: Arc::new(AtomicUsize::new(0)),
            peak_active: AtomicUsize::new(0),
            inner: RwLock::new(Inner::default()),
            event_tx: None,
        }
    }

    pub fn with_events(mut self, event_tx: mpsc::Sender<RunEvent>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Register the instances this run will evaluate, all `queued`.
    pub async fn enqueue(&self, instance_ids: &[String]) {
        let mut inner = self.inner.write().await;
        for id in instance_ids {
            inner.states.insert(id.clone(), EvaluationState::Queued);
        }
    }

    pub async fn mark_skipped(&self, count: usize) {
        self.inner.write().await.skipped += count;
    }

    /// Wait for a free worker slot for `instance_id`.
    pub async fn acquire_slot(&self, instance_id: &str) -> HarnessResult<WorkerSlot> {
        let permit = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| HarnessError::Config("worker pool is closed".to_string()))?;
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_active.fetch_max(active, Ordering::SeqCst);
        debug!(run_id = %self.run_id, instance_id, active, "worker slot acquired");
        Ok(WorkerSlot {
            instance_id: instance_id.to_string(),
            active: Arc::clone(&self.active),
            _permit: permit,
        })
    }

    pub fn release_slot(&self, slot: WorkerSlot) {
        debug!(run_id = %self.run_id, instance_id = %slot.instance_id, "worker slot released");
        drop(slot);
    }

    /// Move `instance_id` to `next`, rejecting transitions the state
    /// machine does not allow.
    pub async fn transition(&self, instance_id: &str, next: EvaluationState) -> HarnessResult<()> {
        {
            let mut inner = self.inner.write().await;
            let current = inner.states.entry(instance_id.to_string()).or_default();
            if !current.can_transition_to(&next) {
                return Err(HarnessError::InvalidStateTransition {
                    from: current.to_string(),
                    to: next.to_string(),
                });
            }
            *current = next.clone();
        }
        debug!(run_id = %self.run_id, instance_id, state = %next, "state changed");
        self.emit(RunEvent::StateChanged {
            instance_id: instance_id.to_string(),
            state: next,
        })
        .await;
        Ok(())
    }

    /// Record the verdict kind (if any) of a finished instance.
    pub async fn record_result(&self, instance_id: &str, verdict: Option<VerdictKind>) {
        let failure = {
            let mut inner = self.inner.write().await;
            if let Some(kind) = verdict {
                *inner.by_kind.entry(kind).or_default() += 1;
            }
            match inner.states.get(instance_id) {
                Some(EvaluationState::Failed(reason)) => Some(reason.clone()),
                _ => None,
            }
        };
        self.emit(RunEvent::InstanceFinished {
            instance_id: instance_id.to_string(),
            verdict,
            failure,
        })
        .await;
    }

    pub async fn state_of(&self, instance_id: &str) -> Option<EvaluationState> {
        self.inner.read().await.states.get(instance_id).cloned()
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn peak_active(&self) -> usize {
        self.peak_active.load(Ordering::SeqCst)
    }

    pub async fn stats(&self) -> RunStats {
        let inner = self.inner.read().await;
        let mut stats = RunStats {
            total: inner.states.len() + inner.skipped,
            skipped: inner.skipped,
            active: self.active(),
            peak_active: self.peak_active(),
            by_kind: inner.by_kind.clone(),
            ..RunStats::default()
        };
        for state in inner.states.values() {
            match state {
                EvaluationState::Queued => stats.queued += 1,
                EvaluationState::Done => stats.done += 1,
                EvaluationState::Failed(FailureReason::Cancelled) => stats.cancelled += 1,
                EvaluationState::Failed(_) => stats.failed += 1,
                _ => {}
            }
        }
        stats
    }

    pub async fn emit(&self, event: RunEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event).await;
        }
    }

    /// Stop handing out slots. Waiters on [`RunState::acquire_slot`] fail.
    pub fn close(&self) {
        self.slots.close();
    }
}
