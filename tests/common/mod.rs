//! Common test infrastructure shared across integration tests.
//!
//! This module provides:
//! - `stubs`: a deterministic core and scripted inputs
//! - `test_utils`: a connected host/client pair and raw-stream helpers
//!
//! # Usage
//!
//! From any integration test file:
//! ```ignore
//! mod common;
//! use common::stubs::CoreStub;
//! use common::test_utils::Pair;
//! ```

#![allow(dead_code)]

pub mod stubs;
pub mod test_utils;

// Re-export commonly used items for convenience.
// Not every test binary uses all of them.
#[allow(unused_imports)]
pub use stubs::{scripted_input, CoreStub, STUB_STATE_SIZE};
#[allow(unused_imports)]
pub use test_utils::{drain_events, write_garbage, write_message, Pair, MAX_SYNC_ITERATIONS};
