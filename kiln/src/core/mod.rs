//! Deterministic, pure logic shared by the kiln engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod budget;
pub mod chunking;
pub mod control;
pub mod exports;
pub mod extract;
pub mod invariants;
pub mod stubs;
pub mod types;
