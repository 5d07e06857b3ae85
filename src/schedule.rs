//! Annealing schedule
//!
//! Emits the deterministic action sequence driving streaming inference:
//! `Add` (consume one unassigned row), `Remove` (evict the oldest assigned
//! row), and `ProcessBatch` (drain the pipeline, run hyper-inference and any
//! kind-structure sweeps, log metrics).
//!
//! Two regimes share one iterator:
//!
//! - **Warm** (preloaded assignments, `row_count > 0`): the working set is
//!   already a full window over the cyclic file, so adds and removes strictly
//!   alternate starting with a remove, keeping the window width constant. The
//!   schedule is finite: exactly `row_count + floor(extra_passes * row_count)`
//!   adds and as many removes, then a final `ProcessBatch`.
//!
//! - **Cold** (`row_count == 0`): a bootstrap burst of adds establishes a
//!   minimum population, then the annealing rate pair
//!   `add_rate = 1 + extra_passes`, `remove_rate = extra_passes` runs over a
//!   signed accumulator, so adds outnumber removes `(1+e):e` and the window
//!   grows until the cyclic reader re-offers an assigned row and the caller's
//!   duplicate halt fires. This regime is an infinite iterator by design.
//!
//! Batches follow a geometric clock `batch_k = ceil(32 * 1.5^k)` counted in
//! add/remove actions, which amortizes per-batch work while the working set
//! keeps oscillating.

#![allow(missing_docs)]

/// One step of the streaming inference loop.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Action {
    Add,
    Remove,
    ProcessBatch,
}

const BATCH_BASE: f64 = 32.0;
const BATCH_GROWTH: f64 = 1.5;
const MIN_POPULATION: u64 = 32;

#[derive(Clone, Debug)]
enum Mode {
    Warm {
        adds_left: u64,
        removes_left: u64,
        next_is_add: bool,
    },
    Cold {
        bootstrap_left: u64,
        state: f64,
        add_rate: f64,
        remove_rate: f64,
    },
}

/// Geometric batch clock, counted in add/remove actions.
#[derive(Clone, Debug)]
struct BatchClock {
    size: f64,
    countdown: u64,
}

impl BatchClock {
    fn new() -> Self {
        BatchClock {
            size: BATCH_BASE,
            countdown: BATCH_BASE as u64,
        }
    }

    /// Returns true when a batch boundary fires, resetting the countdown.
    fn tick(&mut self) -> bool {
        if self.countdown == 0 {
            self.size *= BATCH_GROWTH;
            self.countdown = self.size.ceil() as u64;
            true
        } else {
            false
        }
    }

    #[inline]
    fn consume(&mut self) {
        self.countdown -= 1;
    }
}

/// Deterministic add/remove/process-batch sequence for one inference run.
#[derive(Clone, Debug)]
pub struct BatchedAnnealingSchedule {
    mode: Mode,
    batch: BatchClock,
    finished: bool,
}

impl BatchedAnnealingSchedule {
    /// Build a schedule for `extra_passes >= 0` over `row_count` preloaded
    /// assignments (0 for a cold start).
    pub fn new(extra_passes: f64, row_count: usize) -> Self {
        assert!(
            extra_passes >= 0.0 && extra_passes.is_finite(),
            "extra_passes must be finite and nonnegative"
        );
        let mode = if row_count > 0 {
            let adds = row_count as u64 + (extra_passes * row_count as f64).floor() as u64;
            Mode::Warm {
                adds_left: adds,
                removes_left: adds,
                next_is_add: false,
            }
        } else {
            Mode::Cold {
                bootstrap_left: MIN_POPULATION,
                state: 1.0 + extra_passes,
                add_rate: 1.0 + extra_passes,
                remove_rate: extra_passes,
            }
        };
        BatchedAnnealingSchedule {
            mode,
            batch: BatchClock::new(),
            finished: false,
        }
    }

    /// The next action, or `None` once a warm schedule is exhausted.
    pub fn next_action(&mut self) -> Option<Action> {
        if self.finished {
            return None;
        }
        if self.batch.tick() {
            return Some(Action::ProcessBatch);
        }
        match &mut self.mode {
            Mode::Warm {
                adds_left,
                removes_left,
                next_is_add,
            } => {
                if *adds_left == 0 && *removes_left == 0 {
                    self.finished = true;
                    return Some(Action::ProcessBatch);
                }
                self.batch.consume();
                if !*next_is_add && *removes_left > 0 {
                    *removes_left -= 1;
                    *next_is_add = true;
                    Some(Action::Remove)
                } else {
                    debug_assert!(*adds_left > 0);
                    *adds_left -= 1;
                    *next_is_add = false;
                    Some(Action::Add)
                }
            }
            Mode::Cold {
                bootstrap_left,
                state,
                add_rate,
                remove_rate,
            } => {
                self.batch.consume();
                if *bootstrap_left > 0 {
                    *bootstrap_left -= 1;
                    return Some(Action::Add);
                }
                if *state >= 0.0 {
                    *state -= *remove_rate;
                    Some(Action::Add)
                } else {
                    *state += *add_rate;
                    Some(Action::Remove)
                }
            }
        }
    }
}

impl Iterator for BatchedAnnealingSchedule {
    type Item = Action;

    fn next(&mut self) -> Option<Action> {
        self.next_action()
    }
}

// ============================================================================
// Tests
// ============================================================================
