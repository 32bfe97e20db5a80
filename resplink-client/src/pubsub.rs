//! Pub/sub subscription tracking.
//!
//! The table records, per subscription kind, every channel (or pattern) the
//! connection is subscribed to together with its listeners. It is mutated by
//! subscribe/unsubscribe requests and their acknowledgements, and read when a
//! message push is routed.

use bytes::Bytes;
use indexmap::IndexMap;
use std::fmt;
use std::sync::Arc;

/// The three independent subscription namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PubSubKind {
    /// `SUBSCRIBE` / `message`.
    Channels,
    /// `PSUBSCRIBE` / `pmessage`.
    Patterns,
    /// `SSUBSCRIBE` / `smessage`.
    Sharded,
}

impl PubSubKind {
    pub const ALL: [PubSubKind; 3] = [
        PubSubKind::Channels,
        PubSubKind::Patterns,
        PubSubKind::Sharded,
    ];

    pub fn subscribe_command(self) -> &'static str {
        match self {
            PubSubKind::Channels => "SUBSCRIBE",
            PubSubKind::Patterns => "PSUBSCRIBE",
            PubSubKind::Sharded => "SSUBSCRIBE",
        }
    }

    pub fn unsubscribe_command(self) -> &'static str {
        match self {
            PubSubKind::Channels => "UNSUBSCRIBE",
            PubSubKind::Patterns => "PUNSUBSCRIBE",
            PubSubKind::Sharded => "SUNSUBSCRIBE",
        }
    }

    fn message_type(self) -> &'static [u8] {
        match self {
            PubSubKind::Channels => b"message",
            PubSubKind::Patterns => b"pmessage",
            PubSubKind::Sharded => b"smessage",
        }
    }

    fn index(self) -> usize {
        match self {
            PubSubKind::Channels => 0,
            PubSubKind::Patterns => 1,
            PubSubKind::Sharded => 2,
        }
    }
}

/// What a push message is, judged by its first element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PushType {
    Message(PubSubKind),
    Ack { kind: PubSubKind, subscribe: bool },
}

impl PushType {
    pub(crate) fn parse(name: &[u8]) -> Option<Self> {
        for kind in PubSubKind::ALL {
            if name.eq_ignore_ascii_case(kind.message_type()) {
                return Some(PushType::Message(kind));
            }
            if name.eq_ignore_ascii_case(kind.subscribe_command().as_bytes()) {
                return Some(PushType::Ack {
                    kind,
                    subscribe: true,
                });
            }
            if name.eq_ignore_ascii_case(kind.unsubscribe_command().as_bytes()) {
                return Some(PushType::Ack {
                    kind,
                    subscribe: false,
                });
            }
        }
        None
    }
}

/// A message delivered to a listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubMessage<T> {
    pub kind: PubSubKind,
    /// Channel the message was published to.
    pub channel: T,
    /// Matching pattern, for pattern subscriptions.
    pub pattern: Option<T>,
    pub payload: T,
}

impl PubSubMessage<Bytes> {
    fn to_text(&self) -> PubSubMessage<String> {
        let text = |bytes: &Bytes| String::from_utf8_lossy(bytes).into_owned();
        PubSubMessage {
            kind: self.kind,
            channel: text(&self.channel),
            pattern: self.pattern.as_ref().map(text),
            payload: text(&self.payload),
        }
    }
}

pub type TextCallback = Arc<dyn Fn(&PubSubMessage<String>) + Send + Sync>;
pub type RawCallback = Arc<dyn Fn(&PubSubMessage<Bytes>) + Send + Sync>;

/// A subscription callback. Identity is the callback allocation, so the same
/// `Listener` value (or a clone of it) can later be used to unsubscribe.
#[derive(Clone)]
pub enum Listener {
    Text(TextCallback),
    Raw(RawCallback),
}

impl Listener {
    pub fn text(callback: impl Fn(&PubSubMessage<String>) + Send + Sync + 'static) -> Self {
        Listener::Text(Arc::new(callback))
    }

    pub fn raw(callback: impl Fn(&PubSubMessage<Bytes>) + Send + Sync + 'static) -> Self {
        Listener::Raw(Arc::new(callback))
    }

    fn same(&self, other: &Listener) -> bool {
        match (self, other) {
            (Listener::Text(a), Listener::Text(b)) => Arc::ptr_eq(a, b),
            (Listener::Raw(a), Listener::Raw(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl PartialEq for Listener {
    fn eq(&self, other: &Self) -> bool {
        self.same(other)
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Listener::Text(_) => f.write_str("Listener::Text"),
            Listener::Raw(_) => f.write_str("Listener::Raw"),
        }
    }
}

/// Per-name subscription state. Idle names have no entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Subscribing,
    Subscribed,
    Unsubscribing,
}

#[derive(Debug, Clone)]
pub struct ChannelEntry {
    pub state: ChannelState,
    pub listeners: Vec<Listener>,
}

/// A subscribe or unsubscribe request to put on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubCommand {
    pub kind: PubSubKind,
    pub subscribe: bool,
    /// Names sent with the command; empty means "all" for unsubscribe.
    pub names: Vec<String>,
    /// Acknowledgements the server will send for this command.
    pub acks: usize,
}

impl PubSubCommand {
    pub fn args(&self) -> Vec<&str> {
        let command = if self.subscribe {
            self.kind.subscribe_command()
        } else {
            self.kind.unsubscribe_command()
        };
        std::iter::once(command)
            .chain(self.names.iter().map(String::as_str))
            .collect()
    }
}

/// Listeners matched by a message, ready to be invoked outside any lock.
#[derive(Debug)]
pub struct Delivery {
    listeners: Vec<Listener>,
    message: PubSubMessage<Bytes>,
}

impl Delivery {
    pub fn message(&self) -> &PubSubMessage<Bytes> {
        &self.message
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Invokes every matched listener.
    pub fn deliver(self) {
        let mut text = None;
        for listener in &self.listeners {
            match listener {
                Listener::Raw(callback) => callback(&self.message),
                Listener::Text(callback) => {
                    callback(text.get_or_insert_with(|| self.message.to_text()))
                }
            }
        }
    }
}

/// Subscription state for all three kinds.
#[derive(Debug, Default)]
pub struct SubscriptionTable {
    kinds: [IndexMap<String, ChannelEntry>; 3],
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self, kind: PubSubKind) -> &IndexMap<String, ChannelEntry> {
        &self.kinds[kind.index()]
    }

    fn entries_mut(&mut self, kind: PubSubKind) -> &mut IndexMap<String, ChannelEntry> {
        &mut self.kinds[kind.index()]
    }

    /// Adds `listener` to each name. Returns the command needed for names
    /// that are not yet subscribed (or are being unsubscribed).
    pub fn subscribe(
        &mut self,
        kind: PubSubKind,
        names: &[String],
        listener: &Listener,
    ) -> Option<PubSubCommand> {
        let mut pending = Vec::new();
        for name in names {
            let entries = self.entries_mut(kind);
            match entries.get_mut(name) {
                Some(entry) if entry.state != ChannelState::Unsubscribing => {
                    if !entry.listeners.iter().any(|l| l.same(listener)) {
                        entry.listeners.push(listener.clone());
                    }
                }
                _ => {
                    entries.insert(
                        name.clone(),
                        ChannelEntry {
                            state: ChannelState::Subscribing,
                            listeners: vec![listener.clone()],
                        },
                    );
                    if !pending.contains(name) {
                        pending.push(name.clone());
                    }
                }
            }
        }
        subscribe_command(kind, pending)
    }

    /// Appends listeners to one name, subscribing it if needed.
    pub fn extend_channel_listeners(
        &mut self,
        kind: PubSubKind,
        name: &str,
        listeners: Vec<Listener>,
    ) -> Option<PubSubCommand> {
        let entries = self.entries_mut(kind);
        match entries.get_mut(name) {
            Some(entry) if entry.state != ChannelState::Unsubscribing => {
                for listener in listeners {
                    if !entry.listeners.iter().any(|l| l.same(&listener)) {
                        entry.listeners.push(listener);
                    }
                }
                None
            }
            _ => {
                entries.insert(
                    name.to_string(),
                    ChannelEntry {
                        state: ChannelState::Subscribing,
                        listeners,
                    },
                );
                subscribe_command(kind, vec![name.to_string()])
            }
        }
    }

    /// Removes listeners and returns the unsubscribe command, if one is needed.
    ///
    /// - `names = None, listener = None`: unsubscribe from everything of `kind`.
    /// - `names = Some(..), listener = None`: unsubscribe those names.
    /// - `listener = Some(..)`: remove just that listener; names left with no
    ///   listener are unsubscribed.
    pub fn unsubscribe(
        &mut self,
        kind: PubSubKind,
        names: Option<&[String]>,
        listener: Option<&Listener>,
    ) -> Option<PubSubCommand> {
        let entries = self.entries_mut(kind);
        let targets: Vec<String> = match names {
            Some(names) => names
                .iter()
                .filter(|name| {
                    entries
                        .get(name.as_str())
                        .is_some_and(|e| e.state != ChannelState::Unsubscribing)
                })
                .cloned()
                .collect(),
            None => entries
                .iter()
                .filter(|(_, e)| e.state != ChannelState::Unsubscribing)
                .map(|(name, _)| name.clone())
                .collect(),
        };

        let mut emptied = Vec::new();
        for name in &targets {
            let Some(entry) = entries.get_mut(name) else {
                continue;
            };
            if let Some(listener) = listener {
                entry.listeners.retain(|l| !l.same(listener));
                if !entry.listeners.is_empty() {
                    continue;
                }
            }
            entry.listeners.clear();
            entry.state = ChannelState::Unsubscribing;
            emptied.push(name.clone());
        }

        if emptied.is_empty() {
            return None;
        }
        // "All" is only sent when every subscribed name goes.
        let everything = names.is_none() && emptied.len() == targets.len();
        let acks = emptied.len();
        Some(PubSubCommand {
            kind,
            subscribe: false,
            names: if everything { Vec::new() } else { emptied },
            acks,
        })
    }

    /// Snapshot of every name and its listeners for one kind.
    pub fn listeners(&self, kind: PubSubKind) -> Vec<(String, Vec<Listener>)> {
        self.entries(kind)
            .iter()
            .map(|(name, entry)| (name.clone(), entry.listeners.clone()))
            .collect()
    }

    pub fn state(&self, kind: PubSubKind, name: &str) -> Option<ChannelState> {
        self.entries(kind).get(name).map(|entry| entry.state)
    }

    /// True while any name of any kind is tracked.
    pub fn is_active(&self) -> bool {
        self.kinds.iter().any(|entries| !entries.is_empty())
    }

    /// Matches a message against the table. Patterns match by pattern name,
    /// channels and shard channels by channel name.
    pub fn handle_message(&self, message: PubSubMessage<Bytes>) -> Option<Delivery> {
        let key = match message.kind {
            PubSubKind::Patterns => message.pattern.as_ref()?,
            _ => &message.channel,
        };
        let key = String::from_utf8_lossy(key);
        let entry = self.entries(message.kind).get(key.as_ref())?;
        if entry.listeners.is_empty() {
            return None;
        }
        Some(Delivery {
            listeners: entry.listeners.clone(),
            message,
        })
    }

    /// Applies a subscribe/unsubscribe acknowledgement for `name`.
    pub fn handle_ack(&mut self, kind: PubSubKind, subscribe: bool, name: Option<&str>) {
        let Some(name) = name else {
            return;
        };
        let entries = self.entries_mut(kind);
        match entries.get(name).map(|entry| entry.state) {
            Some(ChannelState::Subscribing) if subscribe => {
                if let Some(entry) = entries.get_mut(name) {
                    entry.state = ChannelState::Subscribed;
                }
            }
            Some(ChannelState::Unsubscribing) if !subscribe => {
                entries.shift_remove(name);
            }
            _ => {}
        }
    }

    /// Rolls back names of a request the server rejected.
    pub fn abort(&mut self, command: &PubSubCommand) {
        let entries = self.entries_mut(command.kind);
        let (state, names): (ChannelState, Vec<String>) = if command.names.is_empty() {
            (
                ChannelState::Unsubscribing,
                entries.keys().cloned().collect(),
            )
        } else {
            let state = if command.subscribe {
                ChannelState::Subscribing
            } else {
                ChannelState::Unsubscribing
            };
            (state, command.names.clone())
        };
        for name in names {
            if entries.get(&name).is_some_and(|e| e.state == state) {
                entries.shift_remove(&name);
            }
        }
    }

    /// Removes one name outright, returning its listeners.
    pub fn remove(&mut self, kind: PubSubKind, name: &str) -> Option<Vec<Listener>> {
        self.entries_mut(kind)
            .shift_remove(name)
            .map(|entry| entry.listeners)
    }

    /// Resets state for a fresh connection: names being unsubscribed are
    /// dropped, everything else goes back to `Subscribing`.
    pub fn on_reconnect(&mut self) {
        for entries in &mut self.kinds {
            entries.retain(|_, entry| entry.state != ChannelState::Unsubscribing);
            for entry in entries.values_mut() {
                entry.state = ChannelState::Subscribing;
            }
        }
    }

    /// One subscribe command per kind covering every tracked name.
    pub fn resubscribe_commands(&self) -> Vec<PubSubCommand> {
        PubSubKind::ALL
            .into_iter()
            .filter_map(|kind| {
                let names: Vec<String> = self
                    .entries(kind)
                    .iter()
                    .filter(|(_, e)| e.state != ChannelState::Unsubscribing)
                    .map(|(name, _)| name.clone())
                    .collect();
                subscribe_command(kind, names)
            })
            .collect()
    }
}

fn subscribe_command(kind: PubSubKind, names: Vec<String>) -> Option<PubSubCommand> {
    if names.is_empty() {
        return None;
    }
    Some(PubSubCommand {
        kind,
        subscribe: true,
        acks: names.len(),
        names,
    })
}
