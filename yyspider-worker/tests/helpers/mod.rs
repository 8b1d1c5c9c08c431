//! Test helpers for yyspider-worker integration tests
//!
//! - Coordinator: real yyspider-server instance on an ephemeral port
//! - FlakyCoordinator: scripted server that drops its first connection

pub mod coordinator;
pub mod flaky_coordinator;

pub use coordinator::{worker_config, Coordinator};
pub use flaky_coordinator::FlakyCoordinator;
