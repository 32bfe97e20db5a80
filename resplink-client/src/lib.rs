//! # resplink-client
//!
//! Pipelined client for RESP2/RESP3 servers.
//!
//! This crate provides:
//! - The command queue that correlates replies to requests in wire order
//! - Pub/sub subscription tracking with replay after reconnect
//! - MULTI/EXEC transaction grouping
//! - A tokio TCP driver with corked writes and automatic reconnection
//! - A high-level async `Client`

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod pubsub;
pub mod queue;
pub mod transaction;

#[cfg(test)]
mod testing;

pub use client::Client;
pub use config::{ClientConfig, ConfigError};
pub use connection::{Connection, ConnectionEvent};
pub use error::ClientError;
pub use pubsub::{ChannelState, Delivery, Listener, PubSubKind, PubSubMessage, SubscriptionTable};
pub use queue::{CommandOptions, CommandQueue, QueueConfig, QueueEvent, ReplyFuture};
pub use transaction::{Transaction, TransactionId, TransactionOptions, TransactionReplies};

pub use resplink_protocol::{DecodeConfig, ReplyValue};
