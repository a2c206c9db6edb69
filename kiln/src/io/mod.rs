//! I/O adapters: filesystem layout, subprocesses, git, templates and job
//! records.

pub mod artifacts;
pub mod config;
pub mod files;
pub mod gates;
pub mod git;
pub mod init;
pub mod job_store;
pub mod process;
pub mod prompt;
pub mod schema;
pub mod worker;
