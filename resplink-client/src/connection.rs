//! Connection management.
//!
//! A background driver task owns the socket. It writes whatever the command
//! queue has ready, feeds every chunk it reads to the decoder, and routes the
//! decoded replies back through the queue. The queue lives behind a
//! `parking_lot::Mutex` that is never held across an `.await`.

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::queue::{push_decode, CommandOptions, CommandQueue, QueueEvent, ReplyFuture};
use bytes::Bytes;
use parking_lot::Mutex;
use resplink_protocol::{Decoder, Encoder, ReplyValue};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Default capacity for the connection event channel.
const CONNECTION_EVENT_CHANNEL_CAPACITY: usize = 64;

/// Connection lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Reconnecting { attempt: u32 },
    Disconnected { reason: String },
}

struct Shared {
    config: ClientConfig,
    queue: Mutex<CommandQueue>,
    /// Database restored by the handshake on every new socket.
    database: AtomicU32,
    /// Signalled when requests are queued.
    writable: Notify,
    /// Signalled after replies are routed or requests flushed.
    drained: Notify,
    connected: AtomicBool,
    /// Set by `close`/`destroy`, or once the driver gives up.
    closing: AtomicBool,
    shutdown: CancellationToken,
    events: broadcast::Sender<ConnectionEvent>,
}

/// A pipelined connection to a RESP server.
pub struct Connection {
    shared: Arc<Shared>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Connects, runs the handshake and starts the driver task.
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        config.validate()?;
        let stream = open_stream(&config).await?;

        let mut queue = CommandQueue::new(config.queue_config());
        let handshake = queue_handshake(&mut queue, &config, config.database);
        let (events, _) = broadcast::channel(CONNECTION_EVENT_CHANNEL_CAPACITY);
        let database = AtomicU32::new(config.database);
        let shared = Arc::new(Shared {
            config,
            queue: Mutex::new(queue),
            database,
            writable: Notify::new(),
            drained: Notify::new(),
            connected: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            events,
        });

        let driver = tokio::spawn(drive(shared.clone(), stream));
        let connection = Connection {
            shared,
            driver: Mutex::new(Some(driver)),
        };

        tracing::debug!("waiting for {} handshake replies", handshake.len());
        for reply in handshake {
            if let Err(err) = reply.await {
                tracing::debug!("handshake failed: {}", err);
                connection.destroy();
                return Err(err);
            }
        }
        tracing::debug!("handshake complete");

        Ok(connection)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// Queues an encoded command and wakes the writer.
    pub fn enqueue(&self, args: Bytes, options: CommandOptions) -> Result<ReplyFuture, ClientError> {
        self.with_queue(|queue| queue.enqueue(args, options))
    }

    /// Runs `f` against the command queue, then wakes the writer.
    ///
    /// Fails with `ConnectionClosed` once the connection is closing.
    pub fn with_queue<R>(
        &self,
        f: impl FnOnce(&mut CommandQueue) -> Result<R, ClientError>,
    ) -> Result<R, ClientError> {
        if self.shared.closing.load(Ordering::SeqCst) {
            return Err(ClientError::ConnectionClosed);
        }
        let result = f(&mut self.shared.queue.lock());
        self.shared.writable.notify_one();
        result
    }

    /// Switches database. The choice is replayed after a reconnect.
    pub async fn select(&self, database: u32) -> Result<ReplyValue, ClientError> {
        let index = database.to_string();
        let options = CommandOptions {
            timeout: self.shared.config.request_timeout(),
            ..CommandOptions::new()
        };
        let reply = self
            .enqueue(
                Encoder::encode_command(&["SELECT", index.as_str()]).freeze(),
                options,
            )?
            .await?;
        self.shared.database.store(database, Ordering::SeqCst);
        tracing::debug!("selected database {}", database);
        Ok(reply)
    }

    /// Database the connection is using.
    pub fn database(&self) -> u32 {
        self.shared.database.load(Ordering::SeqCst)
    }

    /// Subscribes to connection lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.events.subscribe()
    }

    /// Subscribes to queue events (sharded channel migrations).
    pub fn queue_events(&self) -> broadcast::Receiver<QueueEvent> {
        self.shared.queue.lock().events()
    }

    /// Returns whether the socket is currently up.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Returns the number of pending requests.
    pub fn pending_count(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Stops accepting requests, waits for every pending reply, then shuts
    /// the socket down.
    pub async fn close(&self) -> Result<(), ClientError> {
        tracing::debug!("closing connection...");
        self.shared.closing.store(true, Ordering::SeqCst);

        loop {
            let drained = self.shared.drained.notified();
            let pending = self.shared.queue.lock().len();
            if pending == 0 || self.driver_finished() {
                break;
            }
            tracing::debug!("waiting for {} pending requests", pending);
            drained.await;
        }

        self.shared.shutdown.cancel();
        let driver = self.driver.lock().take();
        if let Some(driver) = driver {
            if let Err(err) = driver.await {
                tracing::warn!("connection driver failed: {}", err);
            }
        }
        tracing::debug!("connection closed");
        Ok(())
    }

    /// Rejects every pending request and tears the socket down immediately.
    pub fn destroy(&self) {
        tracing::debug!("destroying connection");
        self.shared.closing.store(true, Ordering::SeqCst);
        self.shared.shutdown.cancel();
        self.shared
            .queue
            .lock()
            .flush_all(&ClientError::ConnectionClosed);
        self.shared.drained.notify_waiters();
    }

    fn driver_finished(&self) -> bool {
        self.driver
            .lock()
            .as_ref()
            .map_or(true, JoinHandle::is_finished)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

async fn open_stream(config: &ClientConfig) -> Result<TcpStream, ClientError> {
    tracing::debug!("connecting to {}...", config.addr);
    let stream = tokio::time::timeout(
        config.connect_timeout(),
        TcpStream::connect(config.addr.as_str()),
    )
    .await
    .map_err(|_| {
        tracing::debug!("connection timeout");
        ClientError::Timeout
    })?
    .map_err(|e| {
        tracing::debug!("connection failed: {}", e);
        ClientError::from(e)
    })?;

    stream.set_nodelay(true).ok();
    Ok(stream)
}

/// Queues the setup commands for a fresh socket ahead of anything else, then
/// the subscription replay.
fn queue_handshake(
    queue: &mut CommandQueue,
    config: &ClientConfig,
    database: u32,
) -> Vec<ReplyFuture> {
    let mut commands: Vec<Vec<String>> = Vec::new();

    if config.protocol == 3 {
        let mut hello = vec!["HELLO".to_string(), "3".to_string()];
        if let Some(password) = &config.password {
            let username = config.username.as_deref().unwrap_or("default");
            hello.extend(["AUTH".to_string(), username.to_string(), password.clone()]);
        }
        if let Some(name) = &config.client_name {
            hello.extend(["SETNAME".to_string(), name.clone()]);
        }
        commands.push(hello);
    } else {
        if let Some(password) = &config.password {
            let mut auth = vec!["AUTH".to_string()];
            auth.extend(config.username.clone());
            auth.push(password.clone());
            commands.push(auth);
        }
        if let Some(name) = &config.client_name {
            commands.push(vec![
                "CLIENT".to_string(),
                "SETNAME".to_string(),
                name.clone(),
            ]);
        }
    }

    if database != 0 {
        commands.push(vec!["SELECT".to_string(), database.to_string()]);
    }

    let options = CommandOptions::new()
        .with_asap()
        .with_timeout(config.connect_timeout());
    let replies = commands
        .iter()
        .map(|args| {
            tracing::debug!("queueing handshake command {}", args[0]);
            queue.enqueue_unchecked(Encoder::encode_command(args).freeze(), options.clone())
        })
        .collect();

    // Replay futures are dropped; the acknowledgements are still consumed.
    let replayed = queue.resubscribe();
    if !replayed.is_empty() {
        tracing::debug!("replaying {} subscription commands", replayed.len());
    }

    replies
}

async fn drive(shared: Arc<Shared>, mut stream: TcpStream) {
    loop {
        shared.connected.store(true, Ordering::SeqCst);
        let _ = shared.events.send(ConnectionEvent::Connected);
        tracing::debug!("connected to {}", shared.config.addr);

        let result = run_session(&shared, stream).await;
        shared.connected.store(false, Ordering::SeqCst);

        let err = match result {
            Ok(()) => break,
            Err(err) => err,
        };
        tracing::debug!("connection lost: {}", err);
        let _ = shared.events.send(ConnectionEvent::Disconnected {
            reason: err.to_string(),
        });

        if !shared.config.reconnect || shared.closing.load(Ordering::SeqCst) {
            shared.queue.lock().flush_all(&err);
            break;
        }
        // Unsent requests survive for the next socket.
        shared.queue.lock().flush_awaiting(&err);
        shared.drained.notify_waiters();

        match reconnect(&shared).await {
            Some(next) => stream = next,
            None => break,
        }
    }

    shared.closing.store(true, Ordering::SeqCst);
    shared
        .queue
        .lock()
        .flush_all(&ClientError::ConnectionClosed);
    shared.drained.notify_waiters();
    tracing::debug!("connection driver stopped");
}

async fn reconnect(shared: &Shared) -> Option<TcpStream> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        if let Some(max) = shared.config.max_reconnect_attempts {
            if attempt > max {
                tracing::warn!("giving up after {} reconnect attempts", max);
                return None;
            }
        }
        if shared.closing.load(Ordering::SeqCst) {
            return None;
        }

        let _ = shared.events.send(ConnectionEvent::Reconnecting { attempt });
        tokio::select! {
            _ = shared.shutdown.cancelled() => return None,
            _ = tokio::time::sleep(shared.config.reconnect_delay()) => {}
        }

        match open_stream(&shared.config).await {
            Ok(stream) => {
                let database = shared.database.load(Ordering::SeqCst);
                let replies = queue_handshake(&mut shared.queue.lock(), &shared.config, database);
                tokio::spawn(async move {
                    for reply in replies {
                        if let Err(err) = reply.await {
                            tracing::warn!("handshake after reconnect failed: {}", err);
                        }
                    }
                });
                return Some(stream);
            }
            Err(err) => tracing::warn!("reconnect attempt {} failed: {}", attempt, err),
        }
    }
}

/// Runs one socket until it fails (`Err`) or shutdown is requested (`Ok`).
async fn run_session(shared: &Shared, stream: TcpStream) -> Result<(), ClientError> {
    let (mut reader, mut writer) = stream.into_split();

    let result = tokio::select! {
        result = read_loop(shared, &mut reader) => result,
        result = write_loop(shared, &mut writer) => result,
        result = ping_loop(shared) => result,
        _ = shared.shutdown.cancelled() => Ok(()),
    };

    if result.is_ok() {
        tracing::debug!("shutting down writer");
        let _ = writer.shutdown().await;
    }
    result
}

async fn write_loop(shared: &Shared, writer: &mut OwnedWriteHalf) -> Result<(), ClientError> {
    let max_bytes = shared.config.write_buffer_size;
    loop {
        let batch = shared.queue.lock().drain_to_send(max_bytes);
        match batch {
            Some(buf) => {
                tracing::debug!("writing {} bytes", buf.len());
                writer.write_all(&buf).await?;
                writer.flush().await?;
            }
            None => shared.writable.notified().await,
        }
    }
}

async fn read_loop(shared: &Shared, reader: &mut OwnedReadHalf) -> Result<(), ClientError> {
    let mut decoder = Decoder::new();
    decoder.set_push_config(push_decode());
    let mut buf = vec![0u8; shared.config.read_buffer_size()];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            tracing::debug!("read_loop: connection closed");
            return Err(ClientError::ConnectionClosed);
        }
        decoder.extend(&buf[..n]);

        let mut deliveries = Vec::new();
        let mut failure = None;
        {
            let mut queue = shared.queue.lock();
            loop {
                let shape = queue.reply_shape();
                match decoder.decode_next(&shape) {
                    Ok(Some(reply)) => deliveries.extend(queue.on_reply(reply)),
                    Ok(None) => break,
                    Err(err) => {
                        tracing::error!("protocol error, dropping connection: {}", err);
                        let err = ClientError::from(err);
                        queue.flush_all(&err);
                        decoder.reset();
                        failure = Some(err);
                        break;
                    }
                }
            }
        }

        for delivery in deliveries {
            delivery.deliver();
        }
        shared.drained.notify_waiters();

        if let Some(err) = failure {
            return Err(err);
        }
    }
}

async fn ping_loop(shared: &Shared) -> Result<(), ClientError> {
    let Some(period) = shared.config.ping_interval() else {
        return std::future::pending().await;
    };
    let mut interval = tokio::time::interval(period);
    interval.tick().await;

    loop {
        interval.tick().await;
        let reply = {
            let mut queue = shared.queue.lock();
            if !queue.is_empty() {
                continue;
            }
            queue.enqueue(
                Encoder::encode_command(&["PING"]).freeze(),
                CommandOptions::new().with_timeout(period),
            )
        };
        shared.writable.notify_one();
        match reply {
            Ok(reply) => {
                if let Err(err) = reply.await {
                    tracing::warn!("keepalive ping failed: {}", err);
                }
            }
            Err(err) => tracing::debug!("keepalive ping not queued: {}", err),
        }
    }
}
