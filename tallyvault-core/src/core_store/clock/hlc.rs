/*
    hlc.rs - Hybrid logical clock

    Timestamps combine physical milliseconds with a logical counter so that
    every event a device produces or observes gets a strictly increasing
    timestamp, even when the wall clock stalls or steps backwards. Used to
    pick the displayed value among concurrent heads, never to decide
    causality.
*/

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::core_store::model::Timestamp;
use crate::errors::{handle_poison, VaultError, VaultResult};

/// HLC timestamp, ordered by wall time then logical counter
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct HlcTimestamp {
    pub wall_ms: u64,
    pub logical: u32,
}

impl HlcTimestamp {
    pub fn new(wall_ms: u64, logical: u32) -> Self {
        HlcTimestamp { wall_ms, logical }
    }

    pub fn as_timestamp(&self) -> Timestamp {
        Timestamp::from_millis(self.wall_ms)
    }
}

impl fmt::Display for HlcTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.wall_ms, self.logical)
    }
}

/// Source of physical time
pub trait TimeSource: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Reads the system clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now_ms(&self) -> u64 {
        Timestamp::now().as_millis()
    }
}

/// Settable clock for tests and simulations
#[derive(Debug, Default)]
pub struct ManualTimeSource {
    now_ms: AtomicU64,
}

impl ManualTimeSource {
    pub fn new(start_ms: u64) -> Self {
        ManualTimeSource {
            now_ms: AtomicU64::new(start_ms),
        }
    }

    pub fn set(&self, ms: u64) {
        self.now_ms.store(ms, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.now_ms.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl TimeSource for ManualTimeSource {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Per-device hybrid logical clock
pub struct HybridClock {
    last: Mutex<HlcTimestamp>,
    source: Arc<dyn TimeSource>,
    max_drift: Duration,
}

impl HybridClock {
    pub fn new(source: Arc<dyn TimeSource>, max_drift: Duration) -> Self {
        HybridClock {
            last: Mutex::new(HlcTimestamp::default()),
            source,
            max_drift,
        }
    }

    pub fn system(max_drift: Duration) -> Self {
        Self::new(Arc::new(SystemTimeSource), max_drift)
    }

    /// Physical time of the underlying source
    pub fn physical_now(&self) -> Timestamp {
        Timestamp::from_millis(self.source.now_ms())
    }

    /// Timestamp for a local event
    pub fn now(&self) -> VaultResult<HlcTimestamp> {
        let physical = self.source.now_ms();
        let mut last = self.last.lock().map_err(handle_poison)?;
        let next = if physical > last.wall_ms {
            HlcTimestamp::new(physical, 0)
        } else {
            HlcTimestamp::new(last.wall_ms, last.logical.saturating_add(1))
        };
        *last = next;
        Ok(next)
    }

    /// Fold a remote timestamp into the clock
    ///
    /// Remote timestamps further ahead of local physical time than the
    /// configured drift are rejected with `CausalViolation`, leaving the clock
    /// untouched.
    pub fn observe(&self, remote: HlcTimestamp) -> VaultResult<HlcTimestamp> {
        let physical = self.source.now_ms();
        let limit = physical.saturating_add(self.max_drift.as_millis() as u64);
        if remote.wall_ms > limit {
            return Err(VaultError::CausalViolation(format!(
                "remote timestamp {} is more than {:?} ahead of local time {}",
                remote, self.max_drift, physical
            )));
        }

        let mut last = self.last.lock().map_err(handle_poison)?;
        let wall = physical.max(last.wall_ms).max(remote.wall_ms);
        let logical = if wall == last.wall_ms && wall == remote.wall_ms {
            last.logical.max(remote.logical).saturating_add(1)
        } else if wall == last.wall_ms {
            last.logical.saturating_add(1)
        } else if wall == remote.wall_ms {
            remote.logical.saturating_add(1)
        } else {
            0
        };
        let next = HlcTimestamp::new(wall, logical);
        *last = next;
        Ok(next)
    }
}

impl fmt::Debug for HybridClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HybridClock")
            .field("max_drift", &self.max_drift)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock_at(ms: u64) -> (Arc<ManualTimeSource>, HybridClock) {
        let source = Arc::new(ManualTimeSource::new(ms));
        let clock = HybridClock::new(source.clone(), Duration::from_secs(60));
        (source, clock)
    }

    #[test]
    fn test_now_is_strictly_increasing_when_time_stalls() {
        let (_source, clock) = clock_at(1_000);
        let a = clock.now().unwrap();
        let b = clock.now().unwrap();
        assert!(b > a);
        assert_eq!(b.wall_ms, 1_000);
        assert_eq!(b.logical, 1);
    }

    #[test]
    fn test_now_survives_backwards_step() {
        let (source, clock) = clock_at(5_000);
        let a = clock.now().unwrap();
        source.set(4_000);
        let b = clock.now().unwrap();
        assert!(b > a);
    }

    #[test]
    fn test_observe_moves_past_remote() {
        let (_source, clock) = clock_at(1_000);
        let remote = HlcTimestamp::new(2_000, 7);
        let observed = clock.observe(remote).unwrap();
        assert!(observed > remote);
        assert!(clock.now().unwrap() > observed);
    }

    #[test]
    fn test_observe_rejects_excess_drift() {
        let (_source, clock) = clock_at(1_000);
        let remote = HlcTimestamp::new(1_000 + 61_000, 0);
        assert!(matches!(
            clock.observe(remote),
            Err(VaultError::CausalViolation(_))
        ));
    }
}
