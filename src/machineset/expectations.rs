//! Expectations accounting for MachineSet scaling
//!
//! A reconcile that has asked for N creations (or deletions) must not ask
//! again before the informer cache shows the change, or a slow watch
//! stream turns one scale-up into two. Each MachineSet key records the
//! machine count it expects to observe and in which direction; the
//! expectation is satisfied once the observed count reaches the target, or
//! abandoned when its deadline lapses (covering lost watch events).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// How long an expectation may stay unmet before it is abandoned.
pub const EXPECTATION_TTL: Duration = Duration::from_secs(5 * 60);

/// Direction the observed machine count must move.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Creations pending: satisfied once observed ≥ target
    AtLeast,
    /// Deletions pending: satisfied once observed ≤ target
    AtMost,
}

#[derive(Clone, Debug)]
struct Expectation {
    target: usize,
    direction: Direction,
    deadline: Instant,
}

/// Pending create/delete counters per MachineSet key (`namespace/name`).
#[derive(Default)]
pub struct Expectations {
    inner: Mutex<HashMap<String, Expectation>>,
}

impl Expectations {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `key` should observe `target` machines (in the given
    /// direction) before it is allowed to scale again.
    pub fn expect(&self, key: &str, target: usize, direction: Direction) {
        let mut inner = self.inner.lock().expect("expectations lock poisoned");
        inner.insert(
            key.to_string(),
            Expectation {
                target,
                direction,
                deadline: Instant::now() + EXPECTATION_TTL,
            },
        );
    }

    /// True when `key` may scale: no expectation recorded, the observed
    /// count reached the target, or the deadline lapsed. Satisfied and
    /// expired expectations are removed on observation.
    pub fn satisfied(&self, key: &str, observed: usize) -> bool {
        let mut inner = self.inner.lock().expect("expectations lock poisoned");
        let Some(expectation) = inner.get(key) else {
            return true;
        };

        let met = match expectation.direction {
            Direction::AtLeast => observed >= expectation.target,
            Direction::AtMost => observed <= expectation.target,
        };
        if met || Instant::now() >= expectation.deadline {
            inner.remove(key);
            return true;
        }
        false
    }

    /// Drop any expectation for `key` (set deleted, or scale abandoned).
    pub fn forget(&self, key: &str) {
        let mut inner = self.inner.lock().expect("expectations lock poisoned");
        inner.remove(key);
    }
}
