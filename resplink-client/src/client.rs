//! High-level client API.

use crate::config::ClientConfig;
use crate::connection::{Connection, ConnectionEvent};
use crate::error::ClientError;
use crate::pubsub::{Listener, PubSubKind};
use crate::queue::{CommandOptions, QueueEvent};
use crate::transaction::{Transaction, TransactionOptions};
use bytes::Bytes;
use resplink_protocol::{BlobMode, DecodeConfig, Encoder, ReplyValue};
use std::sync::Arc;
use tokio::sync::broadcast;

/// High-level client for RESP servers.
pub struct Client {
    conn: Arc<Connection>,
}

impl Client {
    /// Connects to the server described by `config`.
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        let conn = Connection::connect(config).await?;
        Ok(Self {
            conn: Arc::new(conn),
        })
    }

    /// Returns whether the client is connected.
    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    /// Waits for every pending reply, then closes the connection.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.conn.close().await
    }

    /// Rejects every pending request and drops the connection.
    pub fn destroy(&self) {
        self.conn.destroy()
    }

    /// Returns the underlying connection.
    pub fn connection(&self) -> Arc<Connection> {
        self.conn.clone()
    }

    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.conn.events()
    }

    pub fn queue_events(&self) -> broadcast::Receiver<QueueEvent> {
        self.conn.queue_events()
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Sends a command and waits for its reply.
    pub async fn send<A: AsRef<[u8]>>(&self, args: &[A]) -> Result<ReplyValue, ClientError> {
        self.send_with(args, CommandOptions::new()).await
    }

    /// Sends a command with per-request options. The configured default
    /// request timeout applies when `options` has none.
    pub async fn send_with<A: AsRef<[u8]>>(
        &self,
        args: &[A],
        mut options: CommandOptions,
    ) -> Result<ReplyValue, ClientError> {
        if options.timeout.is_none() {
            options.timeout = self.conn.config().request_timeout();
        }
        let encoded = Encoder::encode_command(args).freeze();
        self.conn.enqueue(encoded, options)?.await
    }

    /// Pings the server.
    pub async fn ping(&self) -> Result<(), ClientError> {
        match self.send(&["PING"]).await? {
            ReplyValue::SimpleString(_) => Ok(()),
            other => Err(ClientError::UnexpectedReply(other.to_string())),
        }
    }

    /// Gets the raw value of `key`.
    pub async fn get(&self, key: impl AsRef<[u8]>) -> Result<Option<Bytes>, ClientError> {
        let options = CommandOptions::new()
            .with_decode(DecodeConfig::new().with_blob_string(BlobMode::Bytes));
        match self.send_with(&[&b"GET"[..], key.as_ref()], options).await? {
            ReplyValue::Null => Ok(None),
            ReplyValue::BlobString(blob) => Ok(Some(blob.into_bytes())),
            other => Err(ClientError::UnexpectedReply(other.to_string())),
        }
    }

    pub async fn set(
        &self,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
    ) -> Result<(), ClientError> {
        let reply = self
            .send(&[&b"SET"[..], key.as_ref(), value.as_ref()])
            .await?;
        expect_ok(reply)
    }

    /// Deletes keys, returning how many existed.
    pub async fn del(&self, keys: &[&str]) -> Result<i64, ClientError> {
        let mut args = vec!["DEL"];
        args.extend_from_slice(keys);
        expect_integer(self.send(&args).await?)
    }

    /// Publishes a message, returning the number of receivers.
    pub async fn publish(
        &self,
        channel: &str,
        message: impl AsRef<[u8]>,
    ) -> Result<i64, ClientError> {
        let reply = self
            .send(&[&b"PUBLISH"[..], channel.as_bytes(), message.as_ref()])
            .await?;
        expect_integer(reply)
    }

    /// Switches database. Reconnects restore the last selected database.
    pub async fn select(&self, database: u32) -> Result<(), ClientError> {
        expect_ok(self.conn.select(database).await?)
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Starts building a MULTI/EXEC transaction.
    pub fn multi(&self) -> Transaction {
        Transaction::new()
    }

    /// Runs a transaction. Fails with `TransactionAborted` when a watched key
    /// changed.
    pub async fn exec(&self, transaction: Transaction) -> Result<Vec<ReplyValue>, ClientError> {
        let options = TransactionOptions {
            timeout: self.conn.config().request_timeout(),
            cancel: None,
        };
        let replies = self
            .conn
            .with_queue(|queue| queue.enqueue_transaction(transaction, options))?;
        replies.exec().await
    }

    /// Sends the commands back to back without `MULTI`/`EXEC`. Returns one
    /// result per command; a server error only fails its own command.
    pub async fn pipeline(
        &self,
        commands: Transaction,
    ) -> Result<Vec<Result<ReplyValue, ClientError>>, ClientError> {
        let options = TransactionOptions {
            timeout: self.conn.config().request_timeout(),
            cancel: None,
        };
        let replies = self
            .conn
            .with_queue(|queue| queue.enqueue_pipeline(commands, options))?;
        let mut results = Vec::with_capacity(replies.len());
        for reply in replies {
            results.push(reply.await);
        }
        Ok(results)
    }

    pub async fn watch(&self, keys: &[&str]) -> Result<(), ClientError> {
        let mut args = vec!["WATCH"];
        args.extend_from_slice(keys);
        expect_ok(self.send(&args).await?)
    }

    // =========================================================================
    // Pub/Sub
    // =========================================================================

    /// Subscribes `listener` to channels. Resolves once every channel is
    /// acknowledged.
    pub async fn subscribe(&self, channels: &[&str], listener: Listener) -> Result<(), ClientError> {
        self.subscribe_kind(PubSubKind::Channels, channels, listener)
            .await
    }

    pub async fn psubscribe(&self, patterns: &[&str], listener: Listener) -> Result<(), ClientError> {
        self.subscribe_kind(PubSubKind::Patterns, patterns, listener)
            .await
    }

    pub async fn ssubscribe(&self, channels: &[&str], listener: Listener) -> Result<(), ClientError> {
        self.subscribe_kind(PubSubKind::Sharded, channels, listener)
            .await
    }

    /// Removes `listener` (or every listener when `None`) from channels. An
    /// empty `channels` means every subscribed channel.
    pub async fn unsubscribe(
        &self,
        channels: &[&str],
        listener: Option<&Listener>,
    ) -> Result<(), ClientError> {
        self.unsubscribe_kind(PubSubKind::Channels, channels, listener)
            .await
    }

    pub async fn punsubscribe(
        &self,
        patterns: &[&str],
        listener: Option<&Listener>,
    ) -> Result<(), ClientError> {
        self.unsubscribe_kind(PubSubKind::Patterns, patterns, listener)
            .await
    }

    pub async fn sunsubscribe(
        &self,
        channels: &[&str],
        listener: Option<&Listener>,
    ) -> Result<(), ClientError> {
        self.unsubscribe_kind(PubSubKind::Sharded, channels, listener)
            .await
    }

    async fn subscribe_kind(
        &self,
        kind: PubSubKind,
        names: &[&str],
        listener: Listener,
    ) -> Result<(), ClientError> {
        let names = owned(names);
        let reply = self
            .conn
            .with_queue(|queue| queue.subscribe(kind, &names, listener))?;
        reply.await.map(|_| ())
    }

    async fn unsubscribe_kind(
        &self,
        kind: PubSubKind,
        names: &[&str],
        listener: Option<&Listener>,
    ) -> Result<(), ClientError> {
        let names = owned(names);
        let names = (!names.is_empty()).then_some(names.as_slice());
        let reply = self
            .conn
            .with_queue(|queue| queue.unsubscribe(kind, names, listener))?;
        reply.await.map(|_| ())
    }
}

fn owned(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| name.to_string()).collect()
}

fn expect_ok(reply: ReplyValue) -> Result<(), ClientError> {
    if reply.as_bytes() == Some(&b"OK"[..]) {
        Ok(())
    } else {
        Err(ClientError::UnexpectedReply(reply.to_string()))
    }
}

fn expect_integer(reply: ReplyValue) -> Result<i64, ClientError> {
    reply
        .as_integer()
        .ok_or_else(|| ClientError::UnexpectedReply(reply.to_string()))
}
