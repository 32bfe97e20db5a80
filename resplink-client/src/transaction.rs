//! MULTI/EXEC transaction grouping.
//!
//! A transaction is queued as one contiguous group: `MULTI`, the member
//! commands, `EXEC`, all tagged with the same [`TransactionId`]. Member
//! replies (`QUEUED`) are held back; when the `EXEC` reply arrives each member
//! resolves with its own element of the result array.
//!
//! The same command list can also be sent as a plain pipeline: back to back,
//! without `MULTI`/`EXEC`, each command settling on its own reply.

use crate::error::ClientError;
use crate::queue::{CommandOptions, CommandQueue, Entry, ReplyFuture};
use bytes::Bytes;
use resplink_protocol::{DecodeConfig, Encoder, ErrorReply, ReplyShape, ReplyValue};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies the requests of one transaction group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId(u64);

impl TransactionId {
    pub fn next() -> Self {
        TransactionId(NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionRole {
    /// The `MULTI` marker.
    Begin,
    Member,
    /// The `EXEC` marker.
    Commit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionTag {
    pub id: TransactionId,
    pub role: TransactionRole,
}

#[derive(Debug, Clone)]
struct QueuedCommand {
    args: Bytes,
    decode: Option<DecodeConfig>,
}

/// Commands to run atomically between `MULTI` and `EXEC`.
#[derive(Debug, Clone, Default)]
pub struct Transaction {
    commands: Vec<QueuedCommand>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<A: AsRef<[u8]>>(&mut self, args: &[A]) -> &mut Self {
        self.push(Encoder::encode_command(args).freeze(), None)
    }

    /// Adds a command whose element of the `EXEC` reply is decoded with `decode`.
    pub fn add_with_decode<A: AsRef<[u8]>>(&mut self, args: &[A], decode: DecodeConfig) -> &mut Self {
        self.push(Encoder::encode_command(args).freeze(), Some(decode))
    }

    fn push(&mut self, args: Bytes, decode: Option<DecodeConfig>) -> &mut Self {
        self.commands.push(QueuedCommand { args, decode });
        self
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// Options applied to every request of a transaction.
#[derive(Debug, Clone, Default)]
pub struct TransactionOptions {
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
}

/// Futures for every request of a queued transaction.
#[must_use = "futures do nothing unless polled"]
pub struct TransactionReplies {
    begin: ReplyFuture,
    members: Vec<ReplyFuture>,
    commit: ReplyFuture,
}

impl TransactionReplies {
    /// Waits for `EXEC` and returns one reply per member. Element errors are
    /// left in place as `ReplyValue::Error`.
    pub async fn exec(self) -> Result<Vec<ReplyValue>, ClientError> {
        let Self {
            begin,
            members,
            commit,
        } = self;
        // Member replies are consumed and discarded.
        drop(members);
        begin.await?;
        match commit.await? {
            ReplyValue::Array(items) => Ok(items),
            other => Err(ClientError::UnexpectedReply(other.to_string())),
        }
    }

    /// `(MULTI, members, EXEC)` futures.
    pub fn into_parts(self) -> (ReplyFuture, Vec<ReplyFuture>, ReplyFuture) {
        (self.begin, self.members, self.commit)
    }
}

impl CommandQueue {
    /// Queues `MULTI`, the transaction's commands and `EXEC` as one group.
    /// If the group does not fit, nothing is queued.
    pub fn enqueue_transaction(
        &mut self,
        transaction: Transaction,
        options: TransactionOptions,
    ) -> Result<TransactionReplies, ClientError> {
        self.check_capacity(transaction.len() + 2)?;

        let id = TransactionId::next();
        let default_decode = self.config().default_decode;
        let commit_shape = ReplyShape::Elements {
            outer: default_decode,
            elements: transaction
                .commands
                .iter()
                .map(|command| command.decode.unwrap_or(default_decode))
                .collect::<Arc<[DecodeConfig]>>(),
        };
        tracing::debug!(
            "queueing transaction {} with {} commands",
            id.as_u64(),
            transaction.len()
        );

        let member_shape = self.shape_for(None);
        let begin = self.push_tagged(
            Encoder::encode_command(&["MULTI"]).freeze(),
            member_shape.clone(),
            TransactionTag {
                id,
                role: TransactionRole::Begin,
            },
            &options,
        );
        let members = transaction
            .commands
            .into_iter()
            .map(|command| {
                self.push_tagged(
                    command.args,
                    member_shape.clone(),
                    TransactionTag {
                        id,
                        role: TransactionRole::Member,
                    },
                    &options,
                )
            })
            .collect();
        let commit = self.push_tagged(
            Encoder::encode_command(&["EXEC"]).freeze(),
            commit_shape,
            TransactionTag {
                id,
                role: TransactionRole::Commit,
            },
            &options,
        );

        Ok(TransactionReplies {
            begin,
            members,
            commit,
        })
    }

    /// Queues the commands back to back without `MULTI`/`EXEC`. Each command
    /// keeps its own decode override. If the batch does not fit, nothing is
    /// queued.
    pub fn enqueue_pipeline(
        &mut self,
        commands: Transaction,
        options: TransactionOptions,
    ) -> Result<Vec<ReplyFuture>, ClientError> {
        self.check_capacity(commands.len())?;
        tracing::debug!("queueing pipeline of {} commands", commands.len());

        let replies = commands
            .commands
            .into_iter()
            .map(|command| {
                let command_options = CommandOptions {
                    decode: command.decode,
                    timeout: options.timeout,
                    cancel: options.cancel.clone(),
                    ..CommandOptions::new()
                };
                self.enqueue_unchecked(command.args, command_options)
            })
            .collect();
        Ok(replies)
    }

    fn push_tagged(
        &mut self,
        args: Bytes,
        shape: ReplyShape,
        tag: TransactionTag,
        options: &TransactionOptions,
    ) -> ReplyFuture {
        let (tx, rx) = oneshot::channel();
        self.push(Entry::new(args, tx, shape).with_transaction(tag), false);
        ReplyFuture::new(rx, options.timeout, options.cancel.clone())
    }
}

/// Settles a transaction once its `EXEC` reply is known.
pub(crate) fn settle_commit(
    members: Vec<Entry>,
    commit: Entry,
    result: Result<ReplyValue, ErrorReply>,
) {
    let reject_all = |members: Vec<Entry>, commit: Entry, err: ClientError| {
        for member in members {
            member.reject(&err);
        }
        commit.resolve(Err(err));
    };

    match result {
        Ok(ReplyValue::Array(elements)) => {
            if elements.len() != members.len() {
                tracing::warn!(
                    "EXEC returned {} replies for {} queued commands",
                    elements.len(),
                    members.len()
                );
                let err = ClientError::TransactionMismatch {
                    expected: members.len(),
                    actual: elements.len(),
                };
                return reject_all(members, commit, err);
            }
            for (member, element) in members.into_iter().zip(elements.iter()) {
                match element {
                    ReplyValue::Error(err) => member.resolve(Err(err.clone().into())),
                    value => member.resolve(Ok(value.clone())),
                }
            }
            commit.resolve(Ok(ReplyValue::Array(elements)));
        }
        // A watched key changed.
        Ok(ReplyValue::Null) => reject_all(members, commit, ClientError::TransactionAborted),
        Ok(other) => reject_all(
            members,
            commit,
            ClientError::UnexpectedReply(other.to_string()),
        ),
        Err(err) => reject_all(members, commit, err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueConfig;
    use resplink_protocol::{Blob, BlobMode, Decoder};

    fn cmd(args: &[&str]) -> Bytes {
        Encoder::encode_command(args).freeze()
    }

    fn feed(queue: &mut CommandQueue, input: &[u8]) {
        let mut decoder = Decoder::new();
        decoder.extend(input);
        while let Some(reply) = decoder.decode_next(&queue.reply_shape()).unwrap() {
            assert!(queue.on_reply(reply).is_none());
        }
    }

    fn send_all(queue: &mut CommandQueue) -> Vec<Bytes> {
        std::iter::from_fn(|| queue.next_to_send()).collect()
    }

    fn sample() -> Transaction {
        let mut transaction = Transaction::new();
        transaction
            .add(&["SET", "a", "1"])
            .add_with_decode(&["GET", "a"], DecodeConfig::new().with_blob_string(BlobMode::Bytes));
        transaction
    }

    #[tokio::test]
    async fn test_exec_resolves_each_member() {
        let mut queue = CommandQueue::new(QueueConfig::default());
        let (begin, members, commit) = queue
            .enqueue_transaction(sample(), TransactionOptions::default())
            .unwrap()
            .into_parts();

        assert_eq!(
            send_all(&mut queue),
            vec![
                cmd(&["MULTI"]),
                cmd(&["SET", "a", "1"]),
                cmd(&["GET", "a"]),
                cmd(&["EXEC"])
            ]
        );

        feed(&mut queue, b"+OK\r\n+QUEUED\r\n+QUEUED\r\n");
        // QUEUED replies are held.
        assert_eq!(queue.len(), 3);

        feed(&mut queue, b"*2\r\n+OK\r\n$1\r\n1\r\n");
        assert!(queue.is_empty());

        assert_eq!(begin.await.unwrap(), ReplyValue::simple("OK"));
        let mut members = members.into_iter();
        assert_eq!(
            members.next().unwrap().await.unwrap(),
            ReplyValue::simple("OK")
        );
        assert_eq!(
            members.next().unwrap().await.unwrap(),
            ReplyValue::BlobString(Blob::Bytes(Bytes::from_static(b"1")))
        );
        assert_eq!(
            commit.await.unwrap(),
            ReplyValue::Array(vec![
                ReplyValue::simple("OK"),
                ReplyValue::BlobString(Blob::Bytes(Bytes::from_static(b"1"))),
            ])
        );
    }

    #[tokio::test]
    async fn test_null_exec_aborts_group() {
        let mut queue = CommandQueue::new(QueueConfig::default());
        let replies = queue
            .enqueue_transaction(sample(), TransactionOptions::default())
            .unwrap();
        let (begin, members, commit) = replies.into_parts();
        send_all(&mut queue);

        feed(&mut queue, b"+OK\r\n+QUEUED\r\n+QUEUED\r\n*-1\r\n");

        begin.await.unwrap();
        for member in members {
            assert!(matches!(member.await, Err(ClientError::TransactionAborted)));
        }
        assert!(matches!(commit.await, Err(ClientError::TransactionAborted)));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_exec_helper_reports_abort() {
        let mut queue = CommandQueue::new(QueueConfig::default());
        let replies = queue
            .enqueue_transaction(sample(), TransactionOptions::default())
            .unwrap();
        send_all(&mut queue);
        feed(&mut queue, b"+OK\r\n+QUEUED\r\n+QUEUED\r\n_\r\n");

        assert!(matches!(
            replies.exec().await,
            Err(ClientError::TransactionAborted)
        ));
    }

    #[tokio::test]
    async fn test_execabort_rejects_held_members() {
        let mut queue = CommandQueue::new(QueueConfig::default());
        let (_, members, commit) = queue
            .enqueue_transaction(sample(), TransactionOptions::default())
            .unwrap()
            .into_parts();
        send_all(&mut queue);

        feed(
            &mut queue,
            b"+OK\r\n-ERR wrong number of arguments\r\n+QUEUED\r\n-EXECABORT Transaction discarded because of previous errors.\r\n",
        );

        let mut members = members.into_iter();
        let first = members.next().unwrap().await.unwrap_err();
        assert_eq!(first.server_code(), Some("ERR"));
        let second = members.next().unwrap().await.unwrap_err();
        assert_eq!(second.server_code(), Some("EXECABORT"));
        assert_eq!(commit.await.unwrap_err().server_code(), Some("EXECABORT"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_element_errors_reject_one_member() {
        let mut queue = CommandQueue::new(QueueConfig::default());
        let replies = queue
            .enqueue_transaction(sample(), TransactionOptions::default())
            .unwrap();
        send_all(&mut queue);
        feed(
            &mut queue,
            b"+OK\r\n+QUEUED\r\n+QUEUED\r\n*2\r\n-WRONGTYPE bad\r\n$1\r\n1\r\n",
        );

        let items = replies.exec().await.unwrap();
        assert_eq!(items.len(), 2);
        assert!(items[0].is_error());
    }

    #[tokio::test]
    async fn test_element_count_mismatch() {
        let mut queue = CommandQueue::new(QueueConfig::default());
        let (_, _, commit) = queue
            .enqueue_transaction(sample(), TransactionOptions::default())
            .unwrap()
            .into_parts();
        send_all(&mut queue);
        feed(&mut queue, b"+OK\r\n+QUEUED\r\n+QUEUED\r\n*1\r\n+OK\r\n");

        assert!(matches!(
            commit.await,
            Err(ClientError::TransactionMismatch {
                expected: 2,
                actual: 1
            })
        ));
    }

    #[test]
    fn test_group_rejected_when_queue_full() {
        let mut queue = CommandQueue::new(QueueConfig::new().with_max_length(3));
        let result = queue.enqueue_transaction(sample(), TransactionOptions::default());
        assert!(matches!(result, Err(ClientError::QueueFull { max: 3 })));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_partially_sent_group_is_flushed() {
        let mut queue = CommandQueue::new(QueueConfig::default());
        let other = queue.enqueue(cmd(&["PING"]), CommandOptions::default()).unwrap();
        let (begin, members, _) = queue
            .enqueue_transaction(sample(), TransactionOptions::default())
            .unwrap()
            .into_parts();

        // PING and MULTI are in flight when the connection breaks.
        queue.next_to_send();
        queue.next_to_send();
        queue.flush_awaiting(&ClientError::ConnectionClosed);

        assert!(other.await.is_err());
        assert!(begin.await.is_err());
        for member in members {
            assert!(matches!(member.await, Err(ClientError::ConnectionClosed)));
        }
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_pipeline_settles_each_command() {
        let mut queue = CommandQueue::new(QueueConfig::default());
        let mut commands = sample();
        commands.add(&["INCR", "a"]);
        let replies = queue
            .enqueue_pipeline(commands, TransactionOptions::default())
            .unwrap();

        assert_eq!(
            send_all(&mut queue),
            vec![cmd(&["SET", "a", "1"]), cmd(&["GET", "a"]), cmd(&["INCR", "a"])]
        );
        feed(&mut queue, b"+OK\r\n$1\r\n1\r\n-WRONGTYPE bad\r\n");
        assert!(queue.is_empty());

        let mut replies = replies.into_iter();
        assert_eq!(
            replies.next().unwrap().await.unwrap(),
            ReplyValue::simple("OK")
        );
        assert_eq!(
            replies.next().unwrap().await.unwrap(),
            ReplyValue::BlobString(Blob::Bytes(Bytes::from_static(b"1")))
        );
        let err = replies.next().unwrap().await.unwrap_err();
        assert_eq!(err.server_code(), Some("WRONGTYPE"));
    }

    #[test]
    fn test_pipeline_rejected_when_queue_full() {
        let mut queue = CommandQueue::new(QueueConfig::new().with_max_length(1));
        let result = queue.enqueue_pipeline(sample(), TransactionOptions::default());
        assert!(matches!(result, Err(ClientError::QueueFull { max: 1 })));
        assert!(queue.is_empty());
        assert!(queue.next_to_send().is_none());
    }

    #[test]
    fn test_abandoned_group_still_sent_whole() {
        let mut queue = CommandQueue::new(QueueConfig::default());
        let replies = queue
            .enqueue_transaction(sample(), TransactionOptions::default())
            .unwrap();
        drop(replies);
        assert_eq!(send_all(&mut queue).len(), 4);
    }

    #[test]
    fn test_transaction_ids_are_unique() {
        assert_ne!(TransactionId::next(), TransactionId::next());
    }
}
