//! Test utilities and helpers for TallyVault
//!
//! Fixtures for vault sessions (fast KDF, in-memory storage, devices that
//! share key material) and assertions over converged state.

pub mod assertions;
pub mod fixtures;

pub use assertions::*;
pub use fixtures::*;
