//! Multi-phase orchestration engine for AI-worker-driven code changes.
//!
//! A job drives a task through a fixed pipeline of phases (context, plan,
//! implement, verify, deliver). Each phase invokes an external model worker,
//! extracts and schema-validates its JSON reply, and records it. Implement
//! applies file changes, optionally chunk by chunk with human checkpoints;
//! verify runs shell gates plus a goal-backward audit and loops back to
//! implement on failure. Every transition is persisted so a job can be
//! resumed exactly where it stopped.
//!
//! - **[`core`]**: Pure, deterministic logic (extraction, budgets, chunking,
//!   stub and export scanning, invariants). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (filesystem, git, process execution,
//!   job records). Isolated behind traits where tests need to script them.
//!
//! Orchestration modules ([`engine`], [`session`], [`verify`]) coordinate core
//! logic with I/O to implement CLI commands.

pub mod cancel;
mod chunked;
pub mod core;
pub mod engine;
pub mod error;
pub mod events;
pub mod exit_codes;
pub mod io;
pub mod logging;
mod phase;
pub mod session;
pub mod state;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod verify;
