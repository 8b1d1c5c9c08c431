//! # yyspider Common Library
//!
//! Shared code for the coordinator server and the crawl workers:
//! - Wire codec (length-prefixed frames carrying MessagePack maps)
//! - Protocol message types (Message enum, actions, task statuses)
//! - Unframed auth handshake
//! - Configuration loading
//! - Common error type

pub mod auth;
pub mod codec;
pub mod config;
pub mod error;
pub mod protocol;

pub use codec::{FrameCodec, MessageCodec};
pub use error::{Error, Result};
pub use protocol::{Action, Document, Message, Request, Response, ResponseStatus, TaskStatus};
