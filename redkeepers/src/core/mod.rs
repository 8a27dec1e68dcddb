//! Deterministic, pure logic shared by the daemon.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures, take "now" as an argument, and return deterministic
//! outputs suitable for tests.

pub mod classifier;
pub mod clock;
pub mod commands;
pub mod contract_drift;
pub mod event_log;
pub mod fingerprint;
pub mod healing;
pub mod outcome;
pub mod policy;
pub mod queue;
pub mod retry;
pub mod routing;
pub mod scheduler;
pub mod stats;
pub mod types;
pub mod validators;
