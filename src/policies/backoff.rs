//! # Respawn backoff.
//!
//! The delay before the `n`-th consecutive respawn of a worker slot is
//! `first × factor^n`, capped at `max`, then jittered. The jittered value never
//! feeds into the next computation.
//!
//! A replacement that stays up for `stable_after` resets the slot's counter, so a
//! worker that crashes once a day is respawned quickly every time while a crash
//! loop backs off.
//!
//! ```rust
//! use std::time::Duration;
//! use clustervisor::{BackoffPolicy, JitterPolicy};
//!
//! let backoff = BackoffPolicy {
//!     jitter: JitterPolicy::None,
//!     ..BackoffPolicy::default()
//! };
//! assert_eq!(backoff.next(0), Duration::from_millis(500));
//! assert_eq!(backoff.next(1), Duration::from_secs(1));
//! assert_eq!(backoff.next(20), Duration::from_secs(30));
//! ```

use std::time::Duration;

use super::JitterPolicy;

#[derive(Clone, Copy, Debug)]
pub struct BackoffPolicy {
    pub first: Duration,
    pub max: Duration,
    pub factor: f64,
    pub jitter: JitterPolicy,
    /// Uptime after which a respawned worker counts as healthy again.
    pub stable_after: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            first: Duration::from_millis(500),
            max: Duration::from_secs(30),
            factor: 2.0,
            jitter: JitterPolicy::Equal,
            stable_after: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    /// Delay before respawn number `attempt` (0-indexed) of one slot.
    pub fn next(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.first.as_secs_f64() * self.factor.powi(exp);
        let base = if secs.is_finite() && secs >= 0.0 && secs < self.max.as_secs_f64() {
            Duration::from_secs_f64(secs)
        } else {
            self.max
        };
        self.jitter.apply(base.min(self.max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain(first_ms: u64, max_ms: u64, factor: f64) -> BackoffPolicy {
        BackoffPolicy {
            first: Duration::from_millis(first_ms),
            max: Duration::from_millis(max_ms),
            factor,
            jitter: JitterPolicy::None,
            stable_after: Duration::from_secs(60),
        }
    }

    #[test]
    fn grows_then_caps() {
        let p = plain(100, 1_000, 2.0);
        assert_eq!(p.next(0), Duration::from_millis(100));
        assert_eq!(p.next(3), Duration::from_millis(800));
        assert_eq!(p.next(4), Duration::from_millis(1_000));
        assert_eq!(p.next(u32::MAX), Duration::from_millis(1_000));
    }

    #[test]
    fn first_above_max_is_capped() {
        assert_eq!(plain(5_000, 1_000, 1.0).next(0), Duration::from_millis(1_000));
    }

    #[test]
    fn jitter_stays_below_base() {
        let p = BackoffPolicy {
            jitter: JitterPolicy::Full,
            ..plain(100, 30_000, 2.0)
        };
        for attempt in 0..12 {
            let base = plain(100, 30_000, 2.0).next(attempt);
            assert!(p.next(attempt) <= base);
        }
    }
}
