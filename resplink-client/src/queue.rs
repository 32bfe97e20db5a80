//! Command queue and reply router.
//!
//! Requests move through two lists: not-yet-sent (split into a priority lane
//! and a normal lane) and awaiting-reply. Every non-push reply read from the
//! wire settles the head of awaiting-reply, so replies reach callers in the
//! exact order their requests were written.
//!
//! The queue does no I/O. The connection driver pulls bytes with
//! [`CommandQueue::drain_to_send`] and feeds decoded replies to
//! [`CommandQueue::on_reply`].

use crate::error::ClientError;
use crate::pubsub::{
    Delivery, Listener, PubSubCommand, PubSubKind, PubSubMessage, PushType, SubscriptionTable,
};
use crate::transaction::{self, TransactionId, TransactionRole, TransactionTag};
use bytes::{Bytes, BytesMut};
use pin_project_lite::pin_project;
use resplink_protocol::{
    BlobMode, DecodeConfig, Encoder, ErrorReply, Reply, ReplyShape, ReplyValue,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::time::{Instant, Sleep};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

/// Capacity of the queue event channel.
const QUEUE_EVENT_CHANNEL_CAPACITY: usize = 64;

pub(crate) type ReplySender = oneshot::Sender<Result<ReplyValue, ClientError>>;

/// Queue configuration.
#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    /// Maximum number of pending requests (sent or not). `None` is unbounded.
    pub max_length: Option<usize>,
    /// Decode configuration for requests without an override.
    pub default_decode: DecodeConfig,
    /// Negotiated protocol version (2 or 3).
    pub protocol: u8,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_length: None,
            default_decode: DecodeConfig::default(),
            protocol: 3,
        }
    }
}

impl QueueConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_length(mut self, max: usize) -> Self {
        self.max_length = Some(max);
        self
    }

    pub fn with_default_decode(mut self, config: DecodeConfig) -> Self {
        self.default_decode = config;
        self
    }

    pub fn with_protocol(mut self, protocol: u8) -> Self {
        self.protocol = protocol;
        self
    }
}

/// Decode configuration for pub/sub traffic: payloads stay raw so byte
/// listeners see exactly what was published.
pub fn push_decode() -> DecodeConfig {
    DecodeConfig::new().with_blob_string(BlobMode::Bytes)
}

/// Per-request options.
#[derive(Debug, Clone, Default)]
pub struct CommandOptions {
    /// Decode override for this request's reply.
    pub decode: Option<DecodeConfig>,
    /// Send ahead of every normally queued request.
    pub asap: bool,
    /// Reject the future locally after this long.
    pub timeout: Option<Duration>,
    /// Reject the future locally once this token is cancelled.
    pub cancel: Option<CancellationToken>,
    /// Transaction group membership.
    pub transaction: Option<TransactionTag>,
}

impl CommandOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_decode(mut self, config: DecodeConfig) -> Self {
        self.decode = Some(config);
        self
    }

    pub fn with_asap(mut self) -> Self {
        self.asap = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Events raised by the queue outside any request.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    /// The server dropped a shard channel subscription (slot migration).
    ShardedChannelMoved {
        channel: String,
        listeners: Vec<Listener>,
    },
}

/// Acknowledgements still expected by a pub/sub request.
#[derive(Debug)]
struct PendingAcks {
    command: PubSubCommand,
    remaining: usize,
}

/// A queued request.
#[derive(Debug)]
pub(crate) struct Entry {
    args: Bytes,
    sink: ReplySender,
    shape: ReplyShape,
    transaction: Option<TransactionTag>,
    pubsub: Option<PendingAcks>,
}

impl Entry {
    pub(crate) fn new(args: Bytes, sink: ReplySender, shape: ReplyShape) -> Self {
        Self {
            args,
            sink,
            shape,
            transaction: None,
            pubsub: None,
        }
    }

    pub(crate) fn with_transaction(mut self, tag: TransactionTag) -> Self {
        self.transaction = Some(tag);
        self
    }

    pub(crate) fn resolve(self, result: Result<ReplyValue, ClientError>) {
        if self.sink.send(result).is_err() {
            tracing::debug!("reply discarded: caller no longer waiting");
        }
    }

    pub(crate) fn reject(self, err: &ClientError) {
        self.resolve(Err(err.clone()));
    }

    fn in_group(&self, ids: &HashSet<TransactionId>) -> bool {
        self.transaction.is_some_and(|tag| ids.contains(&tag.id))
    }
}

/// The pending-request pipeline of one connection.
#[derive(Debug)]
pub struct CommandQueue {
    config: QueueConfig,
    priority: VecDeque<Entry>,
    normal: VecDeque<Entry>,
    awaiting: VecDeque<Entry>,
    /// Transaction members whose `QUEUED` reply arrived, waiting for `EXEC`.
    held: HashMap<TransactionId, Vec<Entry>>,
    subscriptions: SubscriptionTable,
    events: broadcast::Sender<QueueEvent>,
}

impl CommandQueue {
    pub fn new(config: QueueConfig) -> Self {
        let (events, _) = broadcast::channel(QUEUE_EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            priority: VecDeque::new(),
            normal: VecDeque::new(),
            awaiting: VecDeque::new(),
            held: HashMap::new(),
            subscriptions: SubscriptionTable::new(),
            events,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn set_protocol(&mut self, protocol: u8) {
        self.config.protocol = protocol;
    }

    /// Subscribes to queue events.
    pub fn events(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    pub fn subscriptions(&self) -> &SubscriptionTable {
        &self.subscriptions
    }

    /// Number of pending requests (unsent, in flight, or held in a transaction).
    pub fn len(&self) -> usize {
        self.priority.len()
            + self.normal.len()
            + self.awaiting.len()
            + self.held.values().map(Vec::len).sum::<usize>()
    }

    pub fn awaiting_len(&self) -> usize {
        self.awaiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn check_capacity(&self, additional: usize) -> Result<(), ClientError> {
        match self.config.max_length {
            Some(max) if self.len() + additional > max => Err(ClientError::QueueFull { max }),
            _ => Ok(()),
        }
    }

    pub(crate) fn shape_for(&self, decode: Option<DecodeConfig>) -> ReplyShape {
        ReplyShape::Uniform(decode.unwrap_or(self.config.default_decode))
    }

    /// Queues an encoded request. Fails without queueing anything when the
    /// queue is at its maximum length.
    pub fn enqueue(
        &mut self,
        args: Bytes,
        options: CommandOptions,
    ) -> Result<ReplyFuture, ClientError> {
        self.check_capacity(1)?;
        Ok(self.enqueue_unchecked(args, options))
    }

    /// Queues a request regardless of the length limit. Used for connection
    /// setup commands.
    pub(crate) fn enqueue_unchecked(&mut self, args: Bytes, options: CommandOptions) -> ReplyFuture {
        let (tx, rx) = oneshot::channel();
        let mut entry = Entry::new(args, tx, self.shape_for(options.decode));
        entry.transaction = options.transaction;
        self.push(entry, options.asap);
        ReplyFuture::new(rx, options.timeout, options.cancel)
    }

    pub(crate) fn push(&mut self, entry: Entry, asap: bool) {
        if asap {
            self.priority.push_back(entry);
        } else {
            self.normal.push_back(entry);
        }
    }

    /// Moves the next request to awaiting-reply and returns its bytes.
    ///
    /// Requests abandoned by their caller before being sent are dropped here,
    /// unless the wire needs them anyway (transaction members, pub/sub).
    pub fn next_to_send(&mut self) -> Option<Bytes> {
        loop {
            let entry = self
                .priority
                .pop_front()
                .or_else(|| self.normal.pop_front())?;
            if entry.sink.is_closed() && entry.transaction.is_none() && entry.pubsub.is_none() {
                tracing::debug!("dropping abandoned request before send");
                continue;
            }
            let args = entry.args.clone();
            self.awaiting.push_back(entry);
            return Some(args);
        }
    }

    /// Corks queued requests into one buffer of at least `max_bytes`, or
    /// until the queue runs dry.
    pub fn drain_to_send(&mut self, max_bytes: usize) -> Option<BytesMut> {
        let mut buf = BytesMut::new();
        while buf.len() < max_bytes {
            match self.next_to_send() {
                Some(args) => buf.extend_from_slice(&args),
                None => break,
            }
        }
        if buf.is_empty() {
            None
        } else {
            Some(buf)
        }
    }

    /// Shape to decode the next reply with.
    ///
    /// In RESP2 a message can arrive while an ordinary request heads the
    /// queue, so blobs stay raw until routing tells the two apart.
    pub fn reply_shape(&self) -> ReplyShape {
        match self.awaiting.front() {
            Some(entry) if entry.pubsub.is_none() => {
                if self.config.protocol == 2 && self.subscriptions.is_active() {
                    entry.shape.with_raw_blobs()
                } else {
                    entry.shape.clone()
                }
            }
            _ if self.config.protocol == 2 && self.subscriptions.is_active() => {
                ReplyShape::Uniform(push_decode())
            }
            _ => ReplyShape::Uniform(self.config.default_decode),
        }
    }

    /// Routes one decoded reply. Returns listeners to invoke for a pub/sub
    /// message; the caller runs them once it no longer holds the queue.
    pub fn on_reply(&mut self, reply: Reply) -> Option<Delivery> {
        match reply {
            Reply::Push(items) => self.on_push(items),
            Reply::Value(ReplyValue::Array(items)) if self.is_resp2_push(&items) => {
                self.on_push(items)
            }
            Reply::Value(value) => {
                let value = match self.awaiting.front() {
                    Some(entry) if self.config.protocol == 2 && entry.pubsub.is_none() => {
                        entry.shape.restore_text_blobs(value)
                    }
                    _ => value,
                };
                self.on_normal_reply(value);
                None
            }
            Reply::Error(err) => {
                self.on_error_reply(err);
                None
            }
        }
    }

    /// RESP2 has no push type: while pub/sub is in use, messages and
    /// acknowledgements arrive as plain arrays.
    fn is_resp2_push(&self, items: &[ReplyValue]) -> bool {
        if self.config.protocol != 2 {
            return false;
        }
        let ack_pending = self
            .awaiting
            .front()
            .is_some_and(|entry| entry.pubsub.is_some());
        if !ack_pending && !self.subscriptions.is_active() {
            return false;
        }
        items
            .first()
            .and_then(ReplyValue::as_bytes)
            .and_then(PushType::parse)
            .is_some()
    }

    pub fn on_normal_reply(&mut self, value: ReplyValue) {
        match self.awaiting.pop_front() {
            Some(entry) => self.settle(entry, Ok(value)),
            None => tracing::warn!("dropping reply with no pending request"),
        }
    }

    pub fn on_error_reply(&mut self, err: ErrorReply) {
        match self.awaiting.pop_front() {
            Some(entry) => self.settle(entry, Err(err)),
            None => tracing::warn!("dropping error reply with no pending request: {}", err),
        }
    }

    fn settle(&mut self, entry: Entry, result: Result<ReplyValue, ErrorReply>) {
        if let (Some(pending), Err(_)) = (&entry.pubsub, &result) {
            self.subscriptions.abort(&pending.command);
        }
        match entry.transaction {
            Some(TransactionTag {
                id,
                role: TransactionRole::Member,
            }) if result.is_ok() => {
                self.held.entry(id).or_default().push(entry);
            }
            Some(TransactionTag {
                id,
                role: TransactionRole::Commit,
            }) => {
                let members = self.held.remove(&id).unwrap_or_default();
                transaction::settle_commit(members, entry, result);
            }
            _ => entry.resolve(result.map_err(ClientError::from)),
        }
    }

    /// Routes a push. Never touches awaiting-reply except to count pub/sub
    /// acknowledgements.
    pub fn on_push(&mut self, items: Vec<ReplyValue>) -> Option<Delivery> {
        let push_type = items
            .first()
            .and_then(ReplyValue::as_bytes)
            .and_then(PushType::parse);
        match push_type {
            Some(PushType::Message(kind)) => {
                let message = parse_message(kind, items)?;
                let delivery = self.subscriptions.handle_message(message);
                if delivery.is_none() {
                    tracing::debug!("no listener for {:?} message", kind);
                }
                delivery
            }
            Some(PushType::Ack { kind, subscribe }) => {
                self.on_pubsub_ack(kind, subscribe, &items);
                None
            }
            None => {
                tracing::debug!("ignoring push: {}", ReplyValue::Push(items));
                None
            }
        }
    }

    fn on_pubsub_ack(&mut self, kind: PubSubKind, subscribe: bool, items: &[ReplyValue]) {
        let name = items
            .get(1)
            .and_then(ReplyValue::as_bytes)
            .map(|name| String::from_utf8_lossy(name).into_owned());
        let count = items.get(2).and_then(ReplyValue::as_integer).unwrap_or(0);

        let expected = self
            .awaiting
            .front()
            .and_then(|entry| entry.pubsub.as_ref())
            .is_some_and(|p| p.command.kind == kind && p.command.subscribe == subscribe);

        if !expected {
            match name {
                Some(channel) if kind == PubSubKind::Sharded && !subscribe => {
                    self.sharded_channel_moved(channel)
                }
                name => {
                    tracing::debug!("unsolicited {:?} acknowledgement", kind);
                    self.subscriptions.handle_ack(kind, subscribe, name.as_deref());
                }
            }
            return;
        }

        self.subscriptions.handle_ack(kind, subscribe, name.as_deref());
        let done = match self.awaiting.front_mut().and_then(|e| e.pubsub.as_mut()) {
            Some(pending) => {
                pending.remaining = pending.remaining.saturating_sub(1);
                pending.remaining == 0
            }
            None => false,
        };
        if done {
            if let Some(entry) = self.awaiting.pop_front() {
                entry.resolve(Ok(ReplyValue::Integer(count)));
            }
        }
    }

    fn sharded_channel_moved(&mut self, channel: String) {
        let Some(listeners) = self.subscriptions.remove(PubSubKind::Sharded, &channel) else {
            return;
        };
        tracing::debug!("shard channel {} moved", channel);
        // No receivers is fine.
        let _ = self
            .events
            .send(QueueEvent::ShardedChannelMoved { channel, listeners });
    }

    /// Rejects every in-flight request. Unsent requests stay queued, except
    /// members of a transaction that lost part of its group.
    pub fn flush_awaiting(&mut self, err: &ClientError) {
        tracing::debug!("flushing {} in-flight requests: {}", self.awaiting.len(), err);
        let mut broken = HashSet::new();
        for entry in self.awaiting.drain(..) {
            if let Some(tag) = entry.transaction {
                broken.insert(tag.id);
            }
            entry.reject(err);
        }
        for (id, members) in self.held.drain() {
            broken.insert(id);
            members.into_iter().for_each(|entry| entry.reject(err));
        }
        if !broken.is_empty() {
            reject_groups(&mut self.priority, &broken, err);
            reject_groups(&mut self.normal, &broken, err);
        }
    }

    /// Rejects every pending request.
    pub fn flush_all(&mut self, err: &ClientError) {
        self.flush_awaiting(err);
        tracing::debug!(
            "flushing {} unsent requests: {}",
            self.priority.len() + self.normal.len(),
            err
        );
        for entry in self.priority.drain(..).chain(self.normal.drain(..)) {
            entry.reject(err);
        }
    }

    // =========================================================================
    // Pub/Sub
    // =========================================================================

    pub fn subscribe(
        &mut self,
        kind: PubSubKind,
        names: &[String],
        listener: Listener,
    ) -> Result<ReplyFuture, ClientError> {
        self.check_capacity(1)?;
        let command = self.subscriptions.subscribe(kind, names, &listener);
        Ok(self.push_pubsub(command, false))
    }

    /// `names = None` means every name of `kind`; `listener = None` drops all
    /// listeners of the affected names.
    pub fn unsubscribe(
        &mut self,
        kind: PubSubKind,
        names: Option<&[String]>,
        listener: Option<&Listener>,
    ) -> Result<ReplyFuture, ClientError> {
        self.check_capacity(1)?;
        let command = self.subscriptions.unsubscribe(kind, names, listener);
        Ok(self.push_pubsub(command, false))
    }

    pub fn extend_channel_listeners(
        &mut self,
        kind: PubSubKind,
        name: &str,
        listeners: Vec<Listener>,
    ) -> Result<ReplyFuture, ClientError> {
        self.check_capacity(1)?;
        let command = self
            .subscriptions
            .extend_channel_listeners(kind, name, listeners);
        Ok(self.push_pubsub(command, false))
    }

    /// Replays the subscription table on a fresh connection, ahead of any
    /// caller-issued request.
    pub fn resubscribe(&mut self) -> Vec<ReplyFuture> {
        self.subscriptions.on_reconnect();
        self.subscriptions
            .resubscribe_commands()
            .into_iter()
            .map(|command| self.push_pubsub(Some(command), true))
            .collect()
    }

    fn push_pubsub(&mut self, command: Option<PubSubCommand>, asap: bool) -> ReplyFuture {
        let Some(command) = command else {
            return ReplyFuture::ready(Ok(ReplyValue::Null));
        };
        tracing::debug!("queueing {:?}", command.args());
        let args = Encoder::encode_command(&command.args()).freeze();
        let (tx, rx) = oneshot::channel();
        let remaining = command.acks.max(1);
        let mut entry = Entry::new(args, tx, self.shape_for(None));
        entry.pubsub = Some(PendingAcks { command, remaining });
        self.push(entry, asap);
        ReplyFuture::new(rx, None, None)
    }
}

fn reject_groups(lane: &mut VecDeque<Entry>, ids: &HashSet<TransactionId>, err: &ClientError) {
    let mut kept = VecDeque::with_capacity(lane.len());
    for entry in lane.drain(..) {
        if entry.in_group(ids) {
            entry.reject(err);
        } else {
            kept.push_back(entry);
        }
    }
    *lane = kept;
}

fn value_bytes(value: ReplyValue) -> Option<Bytes> {
    match value {
        ReplyValue::SimpleString(blob)
        | ReplyValue::BlobString(blob)
        | ReplyValue::VerbatimString { text: blob, .. } => Some(blob.into_bytes()),
        _ => None,
    }
}

/// `[message, channel, payload]`, `[pmessage, pattern, channel, payload]` or
/// `[smessage, channel, payload]`.
fn parse_message(kind: PubSubKind, items: Vec<ReplyValue>) -> Option<PubSubMessage<Bytes>> {
    let mut fields = items.into_iter().skip(1).map(value_bytes);
    let pattern = match kind {
        PubSubKind::Patterns => Some(fields.next()??),
        _ => None,
    };
    let channel = fields.next()??;
    let payload = fields.next()??;
    Some(PubSubMessage {
        kind,
        channel,
        pattern,
        payload,
    })
}

pin_project! {
    /// Resolves with the reply to one request.
    ///
    /// A timeout or cancellation rejects the future but leaves the request in
    /// place: its reply is still read off the wire and discarded. Dropping the
    /// future has the same effect.
    #[must_use = "futures do nothing unless polled"]
    pub struct ReplyFuture {
        #[pin]
        rx: oneshot::Receiver<Result<ReplyValue, ClientError>>,
        #[pin]
        sleep: Option<Sleep>,
        deadline: Option<Instant>,
        #[pin]
        cancelled: Option<WaitForCancellationFutureOwned>,
    }
}

impl fmt::Debug for ReplyFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplyFuture")
            .field("deadline", &self.deadline)
            .field("cancellable", &self.cancelled.is_some())
            .finish_non_exhaustive()
    }
}

impl ReplyFuture {
    pub(crate) fn new(
        rx: oneshot::Receiver<Result<ReplyValue, ClientError>>,
        timeout: Option<Duration>,
        cancel: Option<CancellationToken>,
    ) -> Self {
        Self {
            rx,
            sleep: None,
            deadline: timeout.map(|t| Instant::now() + t),
            cancelled: cancel.map(CancellationToken::cancelled_owned),
        }
    }

    /// A future that is already settled.
    pub fn ready(result: Result<ReplyValue, ClientError>) -> Self {
        let (tx, rx) = oneshot::channel();
        // The receiver is alive, so this cannot fail.
        let _ = tx.send(result);
        Self::new(rx, None, None)
    }
}

impl Future for ReplyFuture {
    type Output = Result<ReplyValue, ClientError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();

        if let Poll::Ready(result) = this.rx.poll(cx) {
            return Poll::Ready(result.unwrap_or(Err(ClientError::ConnectionClosed)));
        }

        if let Some(cancelled) = this.cancelled.as_pin_mut() {
            if cancelled.poll(cx).is_ready() {
                return Poll::Ready(Err(ClientError::Cancelled));
            }
        }

        // The timer is armed on first poll so futures can be built outside a runtime.
        if let Some(deadline) = this.deadline.take() {
            this.sleep.set(Some(tokio::time::sleep_until(deadline)));
        }
        if let Some(sleep) = this.sleep.as_pin_mut() {
            if sleep.poll(cx).is_ready() {
                return Poll::Ready(Err(ClientError::Timeout));
            }
        }

        Poll::Pending
    }
}
