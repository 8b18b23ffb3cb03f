//! Boost controller for transient worker growth.
//!
//! The controller is a pure state machine so the heuristic can be tested
//! without spawning anything:
//!
//! ```text
//!   Idle ──(fill >= high water, or no live workers)──▶ Boosted
//!    ▲                                                   │
//!    │                                         first boost worker retires
//!    │                                                   ▼
//!    └────────────(last boost worker retires)──────── Retiring
//! ```
//!
//! While a boost is active or retiring, further samples never start new
//! workers, which keeps the live count at or below `workers + boost_workers`.

/// Current phase of the boost heuristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoostState {
    /// No boost workers are alive.
    Idle,
    /// Boost workers are alive and none has retired yet.
    Boosted {
        /// Number of boost workers alive.
        active: usize,
    },
    /// At least one boost worker has retired; the rest are winding down.
    Retiring {
        /// Number of boost workers still alive.
        remaining: usize,
    },
}

/// State machine deciding when to start boost workers.
#[derive(Debug, Clone)]
pub struct BoostController {
    boost_workers: usize,
    high_water_mark: f64,
    state: BoostState,
}

impl BoostController {
    /// Creates a controller that boosts by `boost_workers` once the buffer
    /// fill ratio reaches `high_water_mark`.
    pub fn new(boost_workers: usize, high_water_mark: f64) -> Self {
        Self {
            boost_workers,
            high_water_mark: high_water_mark.clamp(0.0, 1.0),
            state: BoostState::Idle,
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> BoostState {
        self.state
    }

    /// Number of boost workers currently alive.
    pub fn live_boost_workers(&self) -> usize {
        match self.state {
            BoostState::Idle => 0,
            BoostState::Boosted { active } => active,
            BoostState::Retiring { remaining } => remaining,
        }
    }

    /// Feeds a buffer sample and returns how many boost workers to start.
    ///
    /// A boost starts only from `Idle`, and only when the buffer is at or
    /// above the high-water mark or nobody is draining it at all.
    pub fn sample(&mut self, fill_ratio: f64, live_workers: usize) -> usize {
        if self.boost_workers == 0 || self.state != BoostState::Idle {
            return 0;
        }

        let starved = live_workers == 0 && fill_ratio > 0.0;
        if fill_ratio >= self.high_water_mark || starved {
            self.state = BoostState::Boosted {
                active: self.boost_workers,
            };
            return self.boost_workers;
        }

        0
    }

    /// Records that one boost worker exited.
    pub fn retire_one(&mut self) {
        self.state = match self.state {
            BoostState::Idle => BoostState::Idle,
            BoostState::Boosted { active } | BoostState::Retiring { remaining: active } => {
                match active.saturating_sub(1) {
                    0 => BoostState::Idle,
                    remaining => BoostState::Retiring { remaining },
                }
            }
        };
    }
}
