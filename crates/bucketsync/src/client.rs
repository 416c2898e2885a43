//! The client multiplexer: one socket, many channels.
//!
//! The client owns the transport and drives every channel from a single
//! `select!` loop, so all engine state is mutated from one task: socket
//! frames fan out to channels by index, bucket commands fan in, and the
//! same loop runs the heartbeat and the send-timeout sweep. On any
//! transport failure the loop exits and the client reconnects with
//! exponential backoff, resetting every channel to the handshake.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::bucket::{Bucket, BucketShared};
use crate::channel::{Channel, ChannelOptions};
use crate::error::{Result, SyncError};
use crate::ghost::{GhostStore, MemoryGhostStore};
use crate::protocol::{
    channel_frame, heartbeat_frame, parse_channel_message, Frame, FrameReader, INDEX_PAGE_SIZE,
};
use crate::store::{BucketObject, BucketStore};

const MAX_FRAME_LENGTH: usize = 1 << 20;

/// Events the client emits about the connection as a whole.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connect,
    Disconnect,
    /// About to retry the connection; carries the attempt count.
    Reconnect { attempt: u32 },
    Authorize { user: String },
    Unauthorized,
    /// The server adjusted the requested wire-logging verbosity.
    LogLevel(u8),
    Error { message: String },
}

/// A frame queued by a channel for the socket.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundFrame {
    pub channel: usize,
    pub body: String,
}

/// Commands from bucket handles into the client loop.
#[derive(Debug)]
pub(crate) enum Command {
    Modify {
        channel: usize,
        id: String,
        data: Value,
    },
    Remove {
        channel: usize,
        id: String,
    },
    Reload {
        channel: usize,
    },
    Revisions {
        channel: usize,
        id: String,
        reply: oneshot::Sender<Vec<BucketObject>>,
    },
    HasLocalChanges {
        channel: usize,
        reply: oneshot::Sender<bool>,
    },
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub app_id: String,
    pub token: String,
    /// Identifies this client instance in every frame it sends.
    pub clientid: String,
    pub api: String,
    pub heartbeat_interval: Duration,
    /// How long a sent change may wait for acknowledgment before a resend.
    pub send_timeout: Duration,
    pub index_page_size: usize,
}

impl ClientConfig {
    pub fn new(app_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            token: token.into(),
            clientid: format!("{}-{}", env!("CARGO_PKG_NAME"), Uuid::new_v4()),
            api: "1.1".to_string(),
            heartbeat_interval: Duration::from_secs(20),
            send_timeout: Duration::from_secs(8),
            index_page_size: INDEX_PAGE_SIZE,
        }
    }
}

/// Any duplex byte stream works as a transport; TLS and websocket wrapping
/// stay outside the engine.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

#[async_trait]
pub trait Connect: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Transport>>;
}

pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl Connect for TcpConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        Ok(Box::new(stream))
    }
}

/// Cloneable handle for stopping a running client.
#[derive(Clone)]
pub struct ShutdownHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

enum DriveOutcome {
    Shutdown,
    Disconnected(String),
}

pub struct Client {
    config: ClientConfig,
    connector: Arc<dyn Connect>,
    channels: Vec<Channel>,
    names: HashMap<String, usize>,
    commands_tx: mpsc::UnboundedSender<Command>,
    commands_rx: Option<mpsc::UnboundedReceiver<Command>>,
    events_tx: mpsc::UnboundedSender<ClientEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<ClientEvent>>,
    outbound_tx: mpsc::UnboundedSender<OutboundFrame>,
    outbound_rx: Option<mpsc::UnboundedReceiver<OutboundFrame>>,
}

impl Client {
    pub fn new(config: ClientConfig, connector: Arc<dyn Connect>) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Self {
            config,
            connector,
            channels: Vec::new(),
            names: HashMap::new(),
            commands_tx,
            commands_rx: Some(commands_rx),
            events_tx,
            events_rx: Some(events_rx),
            outbound_tx,
            outbound_rx: Some(outbound_rx),
        }
    }

    /// Register a bucket backed by `store`, with in-memory ghosts.
    pub fn bucket(&mut self, name: &str, store: Arc<dyn BucketStore>) -> Bucket {
        self.bucket_with_ghosts(name, store, Arc::new(MemoryGhostStore::new()))
    }

    /// Register a bucket with an explicit ghost store.
    pub fn bucket_with_ghosts(
        &mut self,
        name: &str,
        store: Arc<dyn BucketStore>,
        ghosts: Arc<dyn GhostStore>,
    ) -> Bucket {
        debug_assert!(
            !self.names.contains_key(name),
            "bucket {name:?} registered twice"
        );
        let number = self.channels.len();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(BucketShared {
            name: name.to_string(),
            store,
            events: events_tx,
            resolver: std::sync::Mutex::new(None),
        });
        let opts = ChannelOptions {
            clientid: self.config.clientid.clone(),
            app_id: self.config.app_id.clone(),
            token: self.config.token.clone(),
            api: self.config.api.clone(),
            library: env!("CARGO_PKG_NAME").to_string(),
            library_version: env!("CARGO_PKG_VERSION").to_string(),
            index_page_size: self.config.index_page_size,
            send_timeout: self.config.send_timeout,
        };
        let channel = Channel::new(
            number,
            opts,
            shared.clone(),
            ghosts.clone(),
            self.outbound_tx.clone(),
            self.events_tx.clone(),
        );
        self.channels.push(channel);
        self.names.insert(name.to_string(), number);
        Bucket::new(shared, ghosts, number, self.commands_tx.clone(), events_rx)
    }

    /// The client's event stream; can be taken once.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<ClientEvent>> {
        self.events_rx.take()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            commands: self.commands_tx.clone(),
        }
    }

    /// Connect and run until shut down. Reconnects on every transport
    /// failure with exponential backoff (1 s doubling to 30 s, ±20 %
    /// jitter), resetting each channel to its handshake.
    pub async fn run(mut self) -> Result<()> {
        let mut commands = self
            .commands_rx
            .take()
            .ok_or_else(|| SyncError::Transport("client already running".into()))?;
        let mut outbound = self
            .outbound_rx
            .take()
            .ok_or_else(|| SyncError::Transport("client already running".into()))?;
        let mut backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_secs(1))
            .with_multiplier(2.0)
            .with_max_interval(Duration::from_secs(30))
            .with_randomization_factor(0.2)
            .with_max_elapsed_time(None)
            .build();
        let mut attempt: u32 = 0;

        loop {
            match self.connector.connect().await {
                Ok(stream) => {
                    attempt = 0;
                    backoff.reset();
                    let _ = self.events_tx.send(ClientEvent::Connect);
                    let outcome = self.drive(stream, &mut commands, &mut outbound).await;
                    let _ = self.events_tx.send(ClientEvent::Disconnect);
                    match outcome {
                        DriveOutcome::Shutdown => return Ok(()),
                        DriveOutcome::Disconnected(reason) => {
                            warn!(reason = %reason, "connection lost");
                        }
                    }
                }
                Err(err) => {
                    warn!(%err, "connect failed");
                    let _ = self.events_tx.send(ClientEvent::Error {
                        message: err.to_string(),
                    });
                }
            }

            attempt += 1;
            let _ = self.events_tx.send(ClientEvent::Reconnect { attempt });
            let delay = backoff.next_backoff().unwrap_or(Duration::from_secs(30));
            debug!(attempt, ?delay, "reconnect backoff");
            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            // Offline edits keep flowing into the channel queues while the
            // backoff timer runs.
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    cmd = commands.recv() => match cmd {
                        None | Some(Command::Shutdown) => return Ok(()),
                        Some(cmd) => self.dispatch(cmd).await,
                    },
                }
            }
        }
    }

    async fn drive(
        &mut self,
        stream: Box<dyn Transport>,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        outbound: &mut mpsc::UnboundedReceiver<OutboundFrame>,
    ) -> DriveOutcome {
        let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_LENGTH));
        let mut reader = FrameReader::default();
        // Frames queued for the previous connection are stale; every channel
        // re-establishes its state from the handshake.
        while outbound.try_recv().is_ok() {}
        for channel in &mut self.channels {
            if let Err(err) = channel.start().await {
                warn!(bucket = %channel.name(), %err, "channel start failed");
            }
        }

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweep = tokio::time::interval(Duration::from_secs(1));
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_beat = Instant::now();
        let mut beat_count: u64 = 0;

        loop {
            tokio::select! {
                line = framed.next() => match line {
                    Some(Ok(line)) => match reader.decode(&line) {
                        Ok(Some(Frame::Heartbeat(n))) => {
                            trace!(n, "heartbeat");
                            beat_count = n;
                            last_beat = Instant::now();
                        }
                        Ok(Some(Frame::Channel { channel, body })) => {
                            self.handle_channel_frame(channel, &body).await;
                        }
                        Ok(None) => {}
                        Err(err) => warn!(%err, line = %line, "ignoring malformed frame"),
                    },
                    Some(Err(err)) => return DriveOutcome::Disconnected(err.to_string()),
                    None => return DriveOutcome::Disconnected("socket closed".into()),
                },
                Some(frame) = outbound.recv() => {
                    trace!(channel = frame.channel, body = %frame.body, "send");
                    if let Err(err) = framed.send(channel_frame(frame.channel, &frame.body)).await {
                        return DriveOutcome::Disconnected(err.to_string());
                    }
                },
                cmd = commands.recv() => match cmd {
                    None | Some(Command::Shutdown) => return DriveOutcome::Shutdown,
                    Some(cmd) => self.dispatch(cmd).await,
                },
                _ = heartbeat.tick() => {
                    if last_beat.elapsed() > self.config.heartbeat_interval * 3 {
                        return DriveOutcome::Disconnected("server heartbeat missed".into());
                    }
                    if let Err(err) = framed.send(heartbeat_frame(beat_count + 1)).await {
                        return DriveOutcome::Disconnected(err.to_string());
                    }
                },
                _ = sweep.tick() => {
                    for channel in &mut self.channels {
                        if let Err(err) = channel.check_timeouts().await {
                            warn!(bucket = %channel.name(), %err, "timeout sweep failed");
                        }
                    }
                },
            }
        }
    }

    async fn handle_channel_frame(&mut self, index: usize, body: &str) {
        let Some(channel) = self.channels.get_mut(index) else {
            warn!(index, "frame for unregistered channel");
            return;
        };
        match parse_channel_message(body) {
            Ok(message) => {
                if let Err(err) = channel.handle_message(message).await {
                    warn!(bucket = %channel.name(), %err, "channel message failed");
                    let _ = self.events_tx.send(ClientEvent::Error {
                        message: err.to_string(),
                    });
                }
            }
            Err(err) => warn!(%err, "ignoring malformed channel payload"),
        }
    }

    async fn dispatch(&mut self, command: Command) {
        let (index, result) = match command {
            Command::Modify { channel, id, data } => {
                let result = match self.channels.get_mut(channel) {
                    Some(ch) => ch.local_modify(&id, data).await,
                    None => Ok(()),
                };
                (channel, result)
            }
            Command::Remove { channel, id } => {
                let result = match self.channels.get_mut(channel) {
                    Some(ch) => ch.local_remove(&id).await,
                    None => Ok(()),
                };
                (channel, result)
            }
            Command::Reload { channel } => {
                let result = match self.channels.get_mut(channel) {
                    Some(ch) => ch.reload().await,
                    None => Ok(()),
                };
                (channel, result)
            }
            Command::Revisions { channel, id, reply } => {
                let result = match self.channels.get_mut(channel) {
                    Some(ch) => ch.request_revisions(&id, reply).await,
                    None => Ok(()),
                };
                (channel, result)
            }
            Command::HasLocalChanges { channel, reply } => {
                let has = self
                    .channels
                    .get(channel)
                    .map(|ch| ch.has_local_changes())
                    .unwrap_or(false);
                let _ = reply.send(has);
                (channel, Ok(()))
            }
            Command::Shutdown => return,
        };
        if let Err(err) = result {
            warn!(channel = index, %err, "command failed");
            let _ = self.events_tx.send(ClientEvent::Error {
                message: err.to_string(),
            });
        }
    }
}
