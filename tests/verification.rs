//! Verification integration tests.
//!
//! This module contains property-based and invariant tests:
//! - Invariant tests - the snapshot ring's invariants hold after every tick
//! - Property tests - random schedules and inputs with proptest

// Shared test infrastructure
#[path = "common/mod.rs"]
mod common;

// Verification test modules
mod verification {
    pub mod invariants;
    pub mod property;
}
