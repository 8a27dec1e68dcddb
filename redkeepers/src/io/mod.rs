//! Side-effecting operations (filesystem, subprocesses, git, environment).
//!
//! Orchestration in the crate root combines these with the pure logic in
//! [`crate::core`]; tests swap the trait seams ([`worker::Worker`],
//! [`validation::ValidationRunner`], [`probe::ModelProbe`]) for scripted fakes.

pub mod backlog;
pub mod config;
pub mod git;
pub mod inbox;
pub mod lock;
pub mod paths;
pub mod policy;
pub mod preflight;
pub mod probe;
pub mod process;
pub mod prompt;
pub mod state;
pub mod store;
pub mod validation;
pub mod worker;
