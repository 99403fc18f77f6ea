// Monotone tick clock used as the ordering token and CAS witness for
// hot/cold transitions in the row cache.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// One tick is one nanosecond against a process-global anchor.
pub const TICKS_PER_SEC: u64 = 1_000_000_000;

static ANCHOR: Lazy<Instant> = Lazy::new(Instant::now);

/// Last tick handed out. `Timestamp::now` never returns the same value
/// twice, so consecutive writes on one key always observe a strictly
/// increasing timestamp chain.
static LAST_TICK: AtomicU64 = AtomicU64::new(0);

#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp {
    ticks: u64,
}

impl Timestamp {
    pub fn now() -> Self {
        let raw = ANCHOR.elapsed().as_nanos() as u64;
        let ticks = LAST_TICK
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |last| {
                Some(raw.max(last + 1))
            })
            .map(|last| raw.max(last + 1))
            .unwrap_or(raw);
        Self { ticks }
    }

    pub const fn from_ticks(ticks: u64) -> Self {
        Self { ticks }
    }

    pub const fn ticks(self) -> u64 {
        self.ticks
    }

    /// Shift backwards by `ticks`, saturating at zero. Used to derive GC
    /// retention watermarks from the current time.
    pub fn move_backward(self, ticks: u64) -> Self {
        Self {
            ticks: self.ticks.saturating_sub(ticks),
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.ticks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_strictly_monotone() {
        let mut prev = Timestamp::now();
        for _ in 0..10_000 {
            let next = Timestamp::now();
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn test_move_backward_saturates() {
        let ts = Timestamp::from_ticks(100);
        assert_eq!(ts.move_backward(40).ticks(), 60);
        assert_eq!(ts.move_backward(1000).ticks(), 0);
    }

    #[test]
    fn test_ordering() {
        assert!(Timestamp::from_ticks(2) > Timestamp::from_ticks(1));
        assert_eq!(Timestamp::from_ticks(7), Timestamp::from_ticks(7));
    }
}
