//! Autonomous coordination daemon for a team of code-generation agents.
//!
//! The daemon keeps a durable work-item backlog under `coordination/`,
//! repeatedly picks the most valuable ready item, hands it to an agent
//! through a worker CLI, validates the result, and heals the backlog when
//! it stalls. The architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (queue state machine, scheduling,
//!   routing, classification, healing passes). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (documents, lock, processes, git,
//!   prompts). Isolated behind traits to enable mocking in tests.
//!
//! Orchestration modules ([`cycle`], [`heal`], [`looping`], [`status`])
//! coordinate core logic with I/O to implement CLI commands.

pub mod core;
pub mod cycle;
pub mod exit_codes;
pub mod heal;
pub mod io;
pub mod logging;
pub mod looping;
pub mod status;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
