//! Test helpers for yyspider-server integration tests
//!
//! - TestServer: coordinator on an ephemeral port backed by a temp database
//! - RawClient: speaks the wire protocol directly, no retry logic

pub mod raw_client;
pub mod test_server;

pub use raw_client::{read_until_closed, RawClient};
pub use test_server::{TestServer, TEST_KEY};
