//! Bin selection for near-simultaneous events: once the
//! queue's exact-tie batch (`EventQueue::pop_all_at_top`) is exhausted,
//! this crate decides how many *more* trailing events — each scheduled
//! only a hair later, and each carrying its own natural scheduling gap
//! `Δt = tE - tQ` — are worth folding into the same processing batch
//! rather than dispatching one event at a time.
//!
//! Membership is a relative-magnitude test against the batch's own
//! representative gap (`Δt_top`, the smallest `Δt` across the exact-tie
//! batch just popped), not an absolute real-time window: a trailing
//! candidate qualifies when its own `Δt` is still within `bin_frac` of
//! `Δt_top`, i.e. it was "about as due" as the batch it's joining.
//! [`BinOptimizer`] tracks a trailing window of inter-event real-time
//! gaps and, in `auto` mode, grows the *count* of candidates a bin will
//! admit as events arrive in a denser burst — a fixed `bin_size` can't
//! adapt to that on its own.

use std::collections::VecDeque;

/// Tracks recent inter-event real-time gaps and derives the current
/// effective bin-size count from them.
pub struct BinOptimizer {
    target_size: usize,
    bin_frac: f64,
    auto: bool,
    recent_gaps: VecDeque<f64>,
    capacity: usize,
    last_time: Option<f64>,
}

impl BinOptimizer {
    pub fn new(target_size: usize, bin_frac: f64, auto: bool) -> Self {
        let target_size = target_size.max(1);
        let capacity = (target_size * 4).max(8);
        Self {
            target_size,
            bin_frac: bin_frac.clamp(f64::EPSILON, 1.0),
            auto,
            recent_gaps: VecDeque::with_capacity(capacity),
            capacity,
            last_time: None,
        }
    }

    pub fn bin_frac(&self) -> f64 {
        self.bin_frac
    }

    /// Record an event firing at real time `t`.
    pub fn observe(&mut self, t: f64) {
        if let Some(last) = self.last_time {
            let gap = (t - last).max(0.0);
            if self.recent_gaps.len() == self.capacity {
                self.recent_gaps.pop_front();
            }
            self.recent_gaps.push_back(gap);
        }
        self.last_time = Some(t);
    }

    fn mean_gap(&self) -> f64 {
        if self.recent_gaps.is_empty() {
            return f64::INFINITY;
        }
        self.recent_gaps.iter().sum::<f64>() / self.recent_gaps.len() as f64
    }

    /// Trailing event arrival velocity, in events per unit real time.
    /// `0.0` until enough history has accumulated to say anything.
    pub fn velocity(&self) -> f64 {
        let mean = self.mean_gap();
        if mean.is_finite() && mean > 0.0 {
            1.0 / mean
        } else {
            0.0
        }
    }

    /// The number of trailing candidates a bin is willing to admit. Fixed
    /// mode always returns the configured `target_size`; `auto` mode grows
    /// it with the observed arrival velocity, so a burst of closely-spaced
    /// events (exactly the case a fixed count can't adapt to) widens the
    /// bin automatically.
    pub fn effective_bin_size(&self) -> usize {
        if !self.auto {
            return self.target_size;
        }
        let v = self.velocity();
        if v <= 0.0 {
            return self.target_size;
        }
        let scaled = (self.target_size as f64 * (1.0 + v)).round() as usize;
        scaled.max(self.target_size)
    }
}

/// Select how many of `candidate_deltas` (each a lookahead candidate's own
/// scheduled gap `Δt = tE - tQ`, in queue-popped order) qualify to join a
/// bin whose representative gap is `delta_top` — the smallest `Δt` across
/// the exact-tie batch already popped from the queue's top. A candidate
/// qualifies when `candidate_delta >= bin_frac * delta_top`; the scan
/// stops at the first disqualified candidate (trailing candidates are
/// popped in increasing scheduled-time order, so a miss means everything
/// after it would miss too) or once `bin_size` members have been admitted.
pub fn select_bin(delta_top: f64, candidate_deltas: &[f64], bin_frac: f64, bin_size: usize) -> usize {
    if candidate_deltas.is_empty() || bin_size == 0 || delta_top <= 0.0 {
        return 0;
    }
    let threshold = delta_top * bin_frac;
    let mut count = 0;
    for &delta in candidate_deltas {
        if count >= bin_size || delta < threshold {
            break;
        }
        count += 1;
    }
    count
}
