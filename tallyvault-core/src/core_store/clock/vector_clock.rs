/*
    vector_clock.rs - Version vectors for per-entity causal tracking

    Maps each device to the highest sequence number of that device whose
    effects are included. Used to decide whether two operations are
    causally ordered or concurrent:
    - Happened-before
    - Concurrent
    - Happened-after

    Counters never decrease, and zero entries are never stored, so two
    clocks describing the same history compare equal.
*/

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::core_store::model::DeviceId;

/// Vector clock for tracking causal order
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VectorClock {
    /// Map from device ID to its highest included sequence number
    clock: BTreeMap<DeviceId, u64>,
}

impl VectorClock {
    /// Create a new empty vector clock
    pub fn new() -> Self {
        VectorClock {
            clock: BTreeMap::new(),
        }
    }

    /// Builder-style `observe`
    pub fn with(mut self, device: &DeviceId, counter: u64) -> Self {
        self.observe(device, counter);
        self
    }

    /// Increment the counter for a device and return the new value
    pub fn increment(&mut self, device: &DeviceId) -> u64 {
        let counter = self.clock.entry(device.clone()).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Get the counter for a device
    pub fn get(&self, device: &DeviceId) -> u64 {
        self.clock.get(device).copied().unwrap_or(0)
    }

    /// Raise the counter for a device to `counter`; lower values are ignored
    pub fn observe(&mut self, device: &DeviceId, counter: u64) {
        if counter == 0 {
            return;
        }
        let current = self.clock.entry(device.clone()).or_insert(0);
        *current = (*current).max(counter);
    }

    /// Merge two vector clocks (take maximum of each entry)
    pub fn merge(&mut self, other: &VectorClock) {
        for (device, &counter) in &other.clock {
            self.observe(device, counter);
        }
    }

    /// Every entry of self is <= the matching entry of other
    pub fn dominated_by(&self, other: &VectorClock) -> bool {
        self.clock
            .iter()
            .all(|(device, &counter)| counter <= other.get(device))
    }

    /// Returns true if all entries in self <= other and at least one is strictly less
    pub fn happened_before(&self, other: &VectorClock) -> bool {
        self.dominated_by(other) && self != other
    }

    /// Check if two clocks are concurrent (neither happened before the other)
    pub fn is_concurrent(&self, other: &VectorClock) -> bool {
        !self.dominated_by(other) && !other.dominated_by(self)
    }

    /// Compare two vector clocks; `None` means concurrent
    pub fn compare(&self, other: &VectorClock) -> Option<Ordering> {
        match (self.dominated_by(other), other.dominated_by(self)) {
            (true, true) => Some(Ordering::Equal),
            (true, false) => Some(Ordering::Less),
            (false, true) => Some(Ordering::Greater),
            (false, false) => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&DeviceId, u64)> {
        self.clock.iter().map(|(device, &counter)| (device, counter))
    }

    /// Get all device IDs in this clock
    pub fn devices(&self) -> Vec<DeviceId> {
        self.clock.keys().cloned().collect()
    }

    /// Check if clock is empty
    pub fn is_empty(&self) -> bool {
        self.clock.is_empty()
    }

    /// Get the number of devices tracked
    pub fn len(&self) -> usize {
        self.clock.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn dev(name: &str) -> DeviceId {
        DeviceId::new(name)
    }

    #[test]
    fn test_increment() {
        let mut vc = VectorClock::new();
        assert_eq!(vc.increment(&dev("laptop")), 1);
        assert_eq!(vc.increment(&dev("laptop")), 2);
        assert_eq!(vc.increment(&dev("phone")), 1);
        assert_eq!(vc.get(&dev("laptop")), 2);
    }

    #[test]
    fn test_observe_never_decreases() {
        let mut vc = VectorClock::new().with(&dev("laptop"), 5);
        vc.observe(&dev("laptop"), 3);
        assert_eq!(vc.get(&dev("laptop")), 5);
    }

    #[test]
    fn test_zero_entries_not_stored() {
        let vc = VectorClock::new().with(&dev("laptop"), 0);
        assert!(vc.is_empty());
        assert_eq!(vc, VectorClock::new());
    }

    #[test]
    fn test_merge() {
        let mut vc1 = VectorClock::new().with(&dev("a"), 3).with(&dev("b"), 1);
        let vc2 = VectorClock::new()
            .with(&dev("a"), 2)
            .with(&dev("b"), 4)
            .with(&dev("c"), 1);

        vc1.merge(&vc2);

        assert_eq!(vc1.get(&dev("a")), 3);
        assert_eq!(vc1.get(&dev("b")), 4);
        assert_eq!(vc1.get(&dev("c")), 1);
    }

    #[test]
    fn test_happened_before_with_missing_devices() {
        let vc1 = VectorClock::new().with(&dev("a"), 1);
        let vc2 = VectorClock::new().with(&dev("a"), 1).with(&dev("b"), 1);

        assert!(vc1.happened_before(&vc2));
        assert!(!vc2.happened_before(&vc1));
        assert_eq!(vc1.compare(&vc2), Some(Ordering::Less));
    }

    #[test]
    fn test_concurrent() {
        let vc1 = VectorClock::new().with(&dev("a"), 2).with(&dev("b"), 1);
        let vc2 = VectorClock::new().with(&dev("a"), 1).with(&dev("b"), 2);

        assert!(vc1.is_concurrent(&vc2));
        assert_eq!(vc1.compare(&vc2), None);
    }

    #[test]
    fn test_equal_clocks_are_not_concurrent() {
        let vc1 = VectorClock::new().with(&dev("a"), 2);
        assert!(!vc1.is_concurrent(&vc1.clone()));
        assert_eq!(vc1.compare(&vc1.clone()), Some(Ordering::Equal));
    }

    fn arb_clock() -> impl Strategy<Value = VectorClock> {
        prop::collection::btree_map(prop::sample::select(vec!["a", "b", "c"]), 0u64..5, 0..3)
            .prop_map(|entries| {
                entries
                    .into_iter()
                    .fold(VectorClock::new(), |vc, (d, n)| vc.with(&DeviceId::new(d), n))
            })
    }

    proptest! {
        #[test]
        fn prop_merge_is_commutative(a in arb_clock(), b in arb_clock()) {
            let mut ab = a.clone();
            ab.merge(&b);
            let mut ba = b.clone();
            ba.merge(&a);
            prop_assert_eq!(ab, ba);
        }

        #[test]
        fn prop_merge_dominates_inputs(a in arb_clock(), b in arb_clock()) {
            let mut merged = a.clone();
            merged.merge(&b);
            prop_assert!(a.dominated_by(&merged));
            prop_assert!(b.dominated_by(&merged));
        }
    }
}
