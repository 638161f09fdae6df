//! Queue-depth backpressure (spec.md §4.6).
//!
//! Unlike a ratio-based watermark over `max_concurrency`, admission here is
//! driven by the absolute depth of the job queue and moves through three
//! states instead of two: `Accepting`, `Pressured` (still admitting, but
//! flagged for callers who want to shed low-priority work), and `Rejecting`.
//! Transitions use hysteresis so depth oscillating around a threshold doesn't
//! flap the state every poll.

use std::sync::atomic::{AtomicUsize, AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackpressureConfig {
    /// Depth below which a `Pressured` controller returns to `Accepting`.
    pub low_water: usize,
    /// Depth at or above which an `Accepting` controller becomes `Pressured`.
    pub high_water: usize,
    /// Depth at or above which the controller rejects new jobs outright.
    pub max_depth: usize,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            low_water: 200,
            high_water: 800,
            max_depth: 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressureLevel {
    Accepting,
    Pressured,
    Rejecting,
}

impl BackpressureLevel {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Accepting,
            1 => Self::Pressured,
            _ => Self::Rejecting,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Accepting => 0,
            Self::Pressured => 1,
            Self::Rejecting => 2,
        }
    }
}

/// Tracks queue depth and derives the current [`BackpressureLevel`].
///
/// Depth is reported by the caller via [`Self::observe_depth`] (typically
/// after each `JobQueue::stats` poll) rather than tracked incrementally,
/// since the queue itself is the source of truth for depth.
pub struct BackpressureController {
    config: BackpressureConfig,
    depth: AtomicUsize,
    level: AtomicU8,
}

impl BackpressureController {
    pub fn new(config: BackpressureConfig) -> Self {
        Self {
            config,
            depth: AtomicUsize::new(0),
            level: AtomicU8::new(BackpressureLevel::Accepting.as_u8()),
        }
    }

    /// Record the latest observed queue depth and recompute the level.
    ///
    /// Hysteresis: from `Accepting`, depth must reach `high_water` to move to
    /// `Pressured`; from `Pressured`/`Rejecting`, depth must drop to at or
    /// below `low_water` to return to `Accepting`. `max_depth` always wins.
    pub fn observe_depth(&self, depth: usize) -> BackpressureLevel {
        self.depth.store(depth, Ordering::Relaxed);

        let current = BackpressureLevel::from_u8(self.level.load(Ordering::Relaxed));
        let next = if depth >= self.config.max_depth {
            BackpressureLevel::Rejecting
        } else if depth <= self.config.low_water {
            BackpressureLevel::Accepting
        } else if depth >= self.config.high_water {
            BackpressureLevel::Pressured
        } else {
            // Between low_water and high_water: hold the current state.
            match current {
                BackpressureLevel::Rejecting => BackpressureLevel::Pressured,
                other => other,
            }
        };

        self.level.store(next.as_u8(), Ordering::Relaxed);
        next
    }

    pub fn level(&self) -> BackpressureLevel {
        BackpressureLevel::from_u8(self.level.load(Ordering::Relaxed))
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    /// Whether a new job may be admitted right now.
    pub fn should_accept(&self) -> bool {
        self.level() != BackpressureLevel::Rejecting
    }

    /// A human-readable reason for the current level, for callers that want
    /// to tell an operator or caller *why* a publish was rejected.
    pub fn reason(&self) -> String {
        let depth = self.depth();
        match self.level() {
            BackpressureLevel::Accepting => format!("depth {depth} below low water"),
            BackpressureLevel::Pressured => format!("depth {depth} at or above high water {}", self.config.high_water),
            BackpressureLevel::Rejecting => format!("depth {depth} at or above max depth {}", self.config.max_depth),
        }
    }
}
