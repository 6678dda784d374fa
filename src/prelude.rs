//! Convenient re-exports for common usage.
//!
//! This module provides a "prelude" that re-exports the most commonly used types
//! from Deltaplay, allowing you to import them all at once.
//!
//! # Usage
//!
//! ```rust
//! use deltaplay::prelude::*;
//! ```
//!
//! # What's Included
//!
//! - **Session types**: [`Session`], [`SessionBuilder`], [`SessionConfig`], [`StallConfig`]
//! - **Core traits**: [`CoreState`], [`NonBlockingStream`]
//! - **Stream implementations**: [`TcpNonBlockingStream`], [`MemoryStream`]
//! - **Fundamental types**: [`Frame`], [`InputWords`], [`FrameInputs`], [`Role`]
//! - **Session state**: [`SessionState`], [`AdvanceOutcome`], [`WaitReason`], [`StallReason`]
//! - **Event handling**: [`SessionEvent`], [`DisconnectReason`]
//! - **Error handling**: [`NetplayError`]
//! - **Recording**: [`Replay`], [`FinalizedInput`]
//!
//! # Example
//!
//! ```rust
//! use deltaplay::prelude::*;
//!
//! struct Idle;
//!
//! impl CoreState for Idle {
//!     fn state_size(&self) -> usize {
//!         1
//!     }
//!     fn save_state(&self, buf: &mut [u8]) -> bool {
//!         buf[0] = 0;
//!         true
//!     }
//!     fn load_state(&mut self, _buf: &[u8]) -> bool {
//!         true
//!     }
//!     fn run_frame(&mut self, _inputs: &FrameInputs) {}
//! }
//!
//! # fn main() -> Result<(), NetplayError> {
//! let (link, _remote) = MemoryStream::pair();
//! let session = SessionBuilder::new()
//!     .with_config(SessionConfig::lan())
//!     .start_session(link, &Idle)?;
//! assert_eq!(session.current_state(), SessionState::Handshaking);
//! # Ok(())
//! # }
//! ```

// Core session types
pub use crate::sessions::builder::SessionBuilder;
pub use crate::sessions::config::{SessionConfig, StallConfig};
pub use crate::sessions::session::{Session, SessionState};

// Core traits
pub use crate::{CoreState, NonBlockingStream};

// Stream implementations
pub use crate::{MemoryStream, TcpNonBlockingStream};

// Fundamental types
pub use crate::{Frame, FrameInputs, InputWords, Role};

// Advancing
pub use crate::{AdvanceOutcome, StallReason, WaitReason};

// Event handling
pub use crate::{DisconnectReason, SessionEvent};

// Error handling
pub use crate::NetplayError;

// Recording
pub use crate::{FinalizedInput, Replay};
