//! # yyspider coordinator
//!
//! Owns the task queue, the scraped-data store and the daily stats counters,
//! and serves them to authenticated crawl workers over the framed protocol
//! in `yyspider-common`.
//!
//! - [`connection`]: handshake and framed request loop for one client
//! - [`db_handler`]: request execution, write queues, periodic cleanup
//! - [`store`]: storage seam and its SQLite implementation
//! - [`registry`]: live connections by client name
//! - [`server`]: accept loop and background tasks
//! - [`api`]: optional status HTTP endpoint

pub mod api;
pub mod connection;
pub mod db_handler;
pub mod registry;
pub mod server;
pub mod stats;
pub mod store;
pub mod write_queue;

pub use db_handler::{CleanupReport, DbHandler};
pub use server::{Coordinator, ServerContext};
