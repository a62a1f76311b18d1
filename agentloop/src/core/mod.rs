//! Deterministic, pure logic for the session model.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! events and projections and return deterministic outputs suitable for tests.

pub mod completion;
pub mod projection;
pub mod selector;
pub mod types;
