//! Logical clocks: per-entity version vectors and the device HLC

pub mod hlc;
pub mod vector_clock;

pub use hlc::{HlcTimestamp, HybridClock, ManualTimeSource, SystemTimeSource, TimeSource};
pub use vector_clock::VectorClock;
