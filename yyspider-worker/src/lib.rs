//! # yyspider worker
//!
//! Leases crawl tasks from a coordinator, fetches them and ships the results
//! back.
//!
//! - [`connection`]: one authenticated connection
//! - [`bus`]: reconnecting request channel plus the fetch and save loops
//! - [`crawler`]: HTTP fetching of leased tasks

pub mod bus;
pub mod connection;
pub mod crawler;

pub use bus::{MessageBus, WorkResult};
pub use crawler::{CrawlOutcome, Crawler};
