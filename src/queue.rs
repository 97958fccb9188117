//! Work queue for generation units.
//!
//! Each unit moves through `Pending -> Claimed -> Completed`, or back to `Pending`
//! after a failure. Every claim carries an attempt number; operations on a claim
//! whose attempt has been superseded are ignored, so a slow worker that comes back
//! after its unit was reassigned cannot complete or fail the new attempt.

use crate::cancel::CancelToken;
use crate::generator::WorkUnit;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnitState {
    Pending,
    Claimed,
    Completed,
    /// Attempts exhausted.
    Failed,
}

/// The right to run one attempt of one unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Claim {
    pub unit: WorkUnit,
    /// 1-based.
    pub attempt: u32,
}

/// What [`WorkQueue::fail`] did with a claim.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Requeue {
    Requeued,
    Exhausted { attempts: u32 },
    /// The claim had already been superseded or completed.
    Stale,
}

#[derive(Debug)]
struct Slot {
    unit: WorkUnit,
    state: UnitState,
    attempts: u32,
    claimed_at: Option<Instant>,
}

#[derive(Debug)]
struct Inner {
    slots: Vec<Slot>,
    pending: VecDeque<usize>,
    completed: usize,
    closed: bool,
}

impl Inner {
    fn current(&mut self, claim: &Claim) -> Option<&mut Slot> {
        if self.closed {
            return None;
        }
        self.slots
            .get_mut(claim.unit.id)
            .filter(|s| s.state == UnitState::Claimed && s.attempts == claim.attempt)
    }
}

/// Shared queue of [`WorkUnit`]s with atomic claims.
#[derive(Debug)]
pub struct WorkQueue {
    inner: Mutex<Inner>,
    changed: Condvar,
}

impl WorkQueue {
    /// Units must be numbered `0..n` in order, as
    /// [`plan_work_units`](crate::generator::plan_work_units) does.
    ///
    /// # Panics
    ///
    /// Panics if unit ids are not consecutive from zero.
    #[must_use]
    pub fn new(units: Vec<WorkUnit>) -> Self {
        let slots: Vec<Slot> = units
            .into_iter()
            .enumerate()
            .map(|(i, unit)| {
                assert_eq!(unit.id, i, "work unit ids must be consecutive");
                Slot {
                    unit,
                    state: UnitState::Pending,
                    attempts: 0,
                    claimed_at: None,
                }
            })
            .collect();
        Self {
            inner: Mutex::new(Inner {
                pending: (0..slots.len()).collect(),
                slots,
                completed: 0,
                closed: false,
            }),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until a unit is available and claim it.
    ///
    /// Returns `None` once every unit is completed, the queue is closed or `cancel`
    /// fires. `poll` bounds how long a single wait lasts before cancellation is rechecked.
    pub fn claim(&self, cancel: &CancelToken, poll: Duration) -> Option<Claim> {
        let mut inner = self.lock();
        loop {
            if inner.closed || cancel.is_cancelled() || inner.completed == inner.slots.len() {
                return None;
            }
            if let Some(claim) = Self::take_pending(&mut inner) {
                return Some(claim);
            }
            inner = self
                .changed
                .wait_timeout(inner, poll)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Claim a unit if one is pending right now.
    pub fn try_claim(&self) -> Option<Claim> {
        let mut inner = self.lock();
        if inner.closed {
            return None;
        }
        Self::take_pending(&mut inner)
    }

    fn take_pending(inner: &mut Inner) -> Option<Claim> {
        let index = inner.pending.pop_front()?;
        let slot = &mut inner.slots[index];
        slot.state = UnitState::Claimed;
        slot.attempts += 1;
        slot.claimed_at = Some(Instant::now());
        Some(Claim {
            unit: slot.unit,
            attempt: slot.attempts,
        })
    }

    /// True while `claim` is the live attempt of its unit. Closing the queue
    /// supersedes every claim.
    pub fn is_current(&self, claim: &Claim) -> bool {
        self.lock().current(claim).is_some()
    }

    /// Record progress on a live claim, resetting its timeout.
    pub fn touch(&self, claim: &Claim) -> bool {
        self.lock()
            .current(claim)
            .map(|slot| slot.claimed_at = Some(Instant::now()))
            .is_some()
    }

    /// Mark a live claim completed. Returns false for stale claims.
    pub fn complete(&self, claim: &Claim) -> bool {
        let mut inner = self.lock();
        let Some(slot) = inner.current(claim) else {
            return false;
        };
        slot.state = UnitState::Completed;
        slot.claimed_at = None;
        inner.completed += 1;
        drop(inner);
        self.changed.notify_all();
        true
    }

    /// Give up on a live claim: requeue it, or mark it failed once `max_attempts`
    /// attempts have been made.
    pub fn fail(&self, claim: &Claim, max_attempts: u32) -> Requeue {
        let mut inner = self.lock();
        let Some(slot) = inner.current(claim) else {
            return Requeue::Stale;
        };
        slot.claimed_at = None;
        if slot.attempts >= max_attempts {
            slot.state = UnitState::Failed;
            return Requeue::Exhausted {
                attempts: slot.attempts,
            };
        }
        slot.state = UnitState::Pending;
        inner.pending.push_back(claim.unit.id);
        drop(inner);
        self.changed.notify_one();
        Requeue::Requeued
    }

    /// Live claims that have not made progress for longer than `timeout`.
    pub fn expired(&self, timeout: Duration) -> Vec<Claim> {
        let now = Instant::now();
        self.lock()
            .slots
            .iter()
            .filter(|s| s.state == UnitState::Claimed)
            .filter(|s| s.claimed_at.is_some_and(|at| now.duration_since(at) > timeout))
            .map(|s| Claim {
                unit: s.unit,
                attempt: s.attempts,
            })
            .collect()
    }

    /// Stop handing out claims and wake every waiting worker.
    pub fn close(&self) {
        self.lock().closed = true;
        self.changed.notify_all();
    }

    pub fn is_done(&self) -> bool {
        let inner = self.lock();
        inner.completed == inner.slots.len()
    }

    pub fn completed(&self) -> usize {
        self.lock().completed
    }

    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn state(&self, unit: usize) -> Option<UnitState> {
        self.lock().slots.get(unit).map(|s| s.state)
    }

    pub fn attempts(&self, unit: usize) -> Option<u32> {
        self.lock().slots.get(unit).map(|s| s.attempts)
    }
}
