//! Execute-and-Persist Lifecycle
//!
//! Per-request state machine driven by the coordinator:
//!
//! ```text
//! PENDING → EXECUTING → SUCCEEDED ─┬─► MATERIALIZING → PERSISTING → DONE
//!                     ↘ FAILED ─┐  └─────────────────────────────────► DONE
//!                               └────────────────────────────────────► DONE
//! ```
//!
//! A direct save skips execution: `PENDING → MATERIALIZING`.
//! `MATERIALIZING → DONE` covers a rejected working-tree write and a save
//! that asked for no durable write.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};
use tracing::{debug, warn};

/// Lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum LifecycleState {
    Pending = 0,
    Executing = 1,
    Succeeded = 2,
    Failed = 3,
    /// Synchronous working-tree write
    Materializing = 4,
    /// Durable write dispatched
    Persisting = 5,
    Done = 6,
}

impl From<u8> for LifecycleState {
    fn from(v: u8) -> Self {
        match v {
            0 => LifecycleState::Pending,
            1 => LifecycleState::Executing,
            2 => LifecycleState::Succeeded,
            3 => LifecycleState::Failed,
            4 => LifecycleState::Materializing,
            5 => LifecycleState::Persisting,
            _ => LifecycleState::Done,
        }
    }
}

impl LifecycleState {
    /// Whether `self → next` is an edge of the state machine
    pub fn can_transition(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Pending, Executing)
                | (Pending, Materializing)
                | (Executing, Succeeded)
                | (Executing, Failed)
                | (Succeeded, Materializing)
                | (Succeeded, Done)
                | (Failed, Done)
                | (Materializing, Persisting)
                | (Materializing, Done)
                | (Persisting, Done)
        )
    }
}

/// State of one request plus the path it took
#[derive(Debug)]
pub struct Lifecycle {
    state: AtomicU8,
    history: Mutex<Vec<LifecycleState>>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(LifecycleState::Pending as u8),
            history: Mutex::new(vec![LifecycleState::Pending]),
        }
    }

    /// Get current state
    pub fn current_state(&self) -> LifecycleState {
        LifecycleState::from(self.state.load(Ordering::Acquire))
    }

    pub fn is_done(&self) -> bool {
        self.current_state() == LifecycleState::Done
    }

    /// Transition to a new state. Illegal edges are refused and logged.
    pub fn transition_to(&self, new_state: LifecycleState) -> bool {
        let mut history = self.history.lock();
        let old = self.current_state();
        if !old.can_transition(new_state) {
            warn!("Refused lifecycle transition {:?} -> {:?}", old, new_state);
            return false;
        }
        self.state.store(new_state as u8, Ordering::Release);
        history.push(new_state);
        debug!("Lifecycle: {:?} -> {:?}", old, new_state);
        true
    }

    /// Every state visited, starting with `Pending`
    pub fn transitions(&self) -> Vec<LifecycleState> {
        self.history.lock().clone()
    }
}
