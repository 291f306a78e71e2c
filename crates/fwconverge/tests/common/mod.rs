//! Shared utilities for fwconverge integration tests.
//!
//! - `Harness`: an in-memory management server plus a temp directory for
//!   documents
//! - element builders for the usual network objects

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::Harness;
