//! Connection core shared by dial-out and accepted connections.
//!
//! A [`Connection`] is a cheap, clonable handle to one logical peer. It owns
//! the writer of the live socket (if any), the correlation table of pending
//! requests, and the lifecycle status. The role-specific tasks in
//! [`client`] and [`server`] drive the socket and feed inbound bytes through
//! [`Connection::read_until_closed`], which dispatches every decoded frame:
//!
//! 1. a frame whose id is pending resolves that request
//! 2. `$vclose` marks the coming close as intentional
//! 3. `$ping` is answered with the local timestamp
//! 4. `$identify` is answered with the local name
//! 5. anything else is surfaced as [`NodeEvent::Message`]

pub(crate) mod client;
pub(crate) mod handshake;
pub(crate) mod server;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use crate::codec::{Codec, Value};
use crate::error::{PeerwireError, Result};
use crate::node::{NodeEvent, PeerRegistry};
use crate::pending::PendingRequests;
use crate::protocol::{now_millis, Frame, FrameId, FrameIdGenerator, Marker, OutboundFrame};
use crate::queue::{MessageQueue, Processed};
use crate::writer::WriterHandle;

/// Size of the socket read buffer.
pub(crate) const READ_BUFFER_SIZE: usize = 64 * 1024;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// This node dialed out.
    Client,
    /// This node accepted the socket.
    Server,
}

/// Lifecycle status.
///
/// Dial-out connections move `Disconnected → Connecting → Connected → Ready`
/// and fall back to `Connecting` while reconnecting. Accepted connections
/// move `Connecting → Connected` once the handshake completes. Both end in
/// `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Ready,
}

/// Why a read loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseReason {
    /// This side disconnected.
    Local,
    /// The peer announced the close with `$vclose`.
    Graceful,
    /// The peer went away without announcing it.
    Dropped,
    /// The socket errored.
    Failed,
}

impl CloseReason {
    /// Whether a dial-out connection may try to reconnect after this.
    pub(crate) fn is_unexpected(self) -> bool {
        matches!(self, CloseReason::Dropped | CloseReason::Failed)
    }
}

/// Options for [`Connection::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOptions {
    /// Wait for a reply carrying the same frame id.
    pub receptive: bool,
    /// Reply deadline. `None` waits until the reply or a disconnect.
    pub timeout: Option<Duration>,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            receptive: true,
            timeout: None,
        }
    }
}

impl SendOptions {
    /// Options for a send that does not wait for a reply.
    pub fn fire_and_forget() -> Self {
        Self {
            receptive: false,
            timeout: None,
        }
    }

    /// Set the reply deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set whether a reply is expected.
    pub fn with_receptive(mut self, receptive: bool) -> Self {
        self.receptive = receptive;
        self
    }
}

/// Resolve once `closed` reads `true`.
pub(crate) async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    while !*closed.borrow_and_update() {
        if closed.changed().await.is_err() {
            return;
        }
    }
}

/// Node-wide state every connection of a node shares.
pub(crate) struct ConnectionContext {
    /// Local logical name announced during handshakes.
    pub name: String,
    pub codec: Arc<dyn Codec>,
    pub frame_ids: Arc<FrameIdGenerator>,
    pub registry: Arc<PeerRegistry>,
    pub events: mpsc::Sender<NodeEvent>,
    pub max_body_size: u32,
    /// Events discarded because the receiver fell behind.
    pub dropped_events: AtomicU64,
}

impl ConnectionContext {
    /// Queue an event without waiting. Events that find the channel full are
    /// dropped and counted.
    pub(crate) fn emit(&self, event: NodeEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                let dropped = self.dropped_events.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped.is_power_of_two() {
                    warn!(node = %self.name, connection = %event.connection(), dropped, "event receiver is full, dropping events");
                }
            }
            // Nobody listening is fine.
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

struct State {
    status: ConnectionStatus,
    peer_name: Option<String>,
    writer: Option<WriterHandle>,
}

struct Inner {
    id: ConnectionId,
    role: Role,
    ctx: Arc<ConnectionContext>,
    pending: Arc<PendingRequests>,
    state: Mutex<State>,
    /// Flips to `true` exactly once, when the connection is torn down for good.
    closed: watch::Sender<bool>,
}

/// Handle to one logical peer connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("role", &self.inner.role)
            .field("status", &self.status())
            .field("peer", &self.peer_name())
            .finish()
    }
}

impl Connection {
    /// Create a connection and the message queue its reader will use.
    pub(crate) fn new(role: Role, ctx: Arc<ConnectionContext>) -> (Self, MessageQueue) {
        let queue = MessageQueue::with_max_body(ctx.codec.clone(), ctx.max_body_size);
        let status = match role {
            Role::Client => ConnectionStatus::Disconnected,
            Role::Server => ConnectionStatus::Connecting,
        };
        let connection = Connection {
            inner: Arc::new(Inner {
                id: ConnectionId::next(),
                role,
                ctx,
                pending: queue.pending().clone(),
                state: Mutex::new(State {
                    status,
                    peer_name: None,
                    writer: None,
                }),
                closed: watch::channel(false).0,
            }),
        };
        (connection, queue)
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.state.lock().status
    }

    /// Logical name announced by the peer, once the handshake completed.
    pub fn peer_name(&self) -> Option<String> {
        self.inner.state.lock().peer_name.clone()
    }

    /// Number of requests still waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    /// Whether a socket is attached and usable for sending.
    pub fn has_socket(&self) -> bool {
        self.inner.state.lock().writer.is_some()
    }

    /// Whether the connection was torn down for good.
    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Send a value to the peer.
    ///
    /// With `receptive` set, resolves to the peer's reply, or fails with
    /// [`PeerwireError::Timeout`] once the deadline passes or with
    /// [`PeerwireError::Disconnected`] if the socket goes away first.
    /// Otherwise resolves to `None` as soon as the frame is queued.
    ///
    /// # Errors
    ///
    /// Fails immediately with [`PeerwireError::NoSocket`] if no socket is
    /// attached. Encode failures are returned without registering anything.
    pub async fn send(&self, data: impl Into<Value>, options: SendOptions) -> Result<Option<Value>> {
        let writer = self.writer().ok_or(PeerwireError::NoSocket)?;
        let body = self.inner.ctx.codec.encode(&data.into())?;
        let id = self.inner.ctx.frame_ids.next_id();

        if !options.receptive {
            writer.send(OutboundFrame::new(id, false, body)).await?;
            return Ok(None);
        }

        self.request(&writer, id, body, options.timeout).await.map(Some)
    }

    /// Register `id` and write the request on `writer`.
    ///
    /// Teardown takes the writer out of the state before it rejects the
    /// pending table, so an entry registered after that rejection is caught
    /// by the writer check below.
    async fn request(&self, writer: &WriterHandle, id: FrameId, body: Bytes, timeout: Option<Duration>) -> Result<Value> {
        let reply = self.inner.pending.register(id, timeout)?;
        if !self.is_current_writer(writer) {
            self.inner.pending.remove(id);
            debug!(connection = %self.id(), %id, "socket went away before the request was written");
            return Err(PeerwireError::Disconnected);
        }
        if let Err(e) = writer.send(OutboundFrame::new(id, true, body)).await {
            self.inner.pending.remove(id);
            return Err(e);
        }
        trace!(connection = %self.id(), %id, "request sent");
        reply.wait().await
    }

    /// Measure the round trip to the peer.
    pub async fn ping(&self) -> Result<Duration> {
        let started = Instant::now();
        self.send(Marker::Ping.value(), SendOptions::default()).await?;
        Ok(started.elapsed())
    }

    /// Ask the peer for its current logical name.
    ///
    /// If the name changed since the handshake, the registry entry is
    /// re-keyed and [`NodeEvent::PeerIdentified`] is emitted.
    pub async fn identify(&self) -> Result<String> {
        let reply = self.send(Marker::Identify.value(), SendOptions::default()).await?;
        let name = reply
            .as_ref()
            .and_then(Value::as_str)
            .ok_or_else(|| PeerwireError::Protocol("identify reply is not a string".into()))?
            .to_string();
        self.set_peer_name(name.clone());
        Ok(name)
    }

    /// Close the connection intentionally.
    ///
    /// The peer is told with `$vclose` first so it does not try to reconnect.
    /// Every pending request fails with [`PeerwireError::Disconnected`] and any
    /// scheduled reconnection is cancelled. Returns `false` if the connection
    /// was already closed.
    pub async fn disconnect(&self) -> bool {
        self.shut(true).await
    }

    /// Tear down without announcing the close.
    pub(crate) async fn close_terminal(&self) -> bool {
        self.shut(false).await
    }

    async fn shut(&self, announce: bool) -> bool {
        let first = self.inner.closed.send_if_modified(|closed| !std::mem::replace(closed, true));
        if !first {
            return false;
        }

        let (writer, peer) = {
            let mut state = self.inner.state.lock();
            state.status = ConnectionStatus::Disconnected;
            (state.writer.take(), state.peer_name.clone())
        };

        if let Some(writer) = writer {
            if announce {
                if let Ok(body) = self.inner.ctx.codec.encode(&Marker::VClose.value()) {
                    let _ = writer.send(OutboundFrame::new(FrameId::ZERO, false, body)).await;
                }
            }
            writer.close().await;
        }

        let rejected = self.inner.pending.reject_all(|| PeerwireError::Disconnected);
        if let Some(peer) = &peer {
            self.inner.ctx.registry.remove(peer, self.id());
        }

        info!(connection = %self.id(), peer = ?peer, rejected, announce, "disconnected");
        self.inner.ctx.emit(NodeEvent::Disconnected {
            connection: self.id(),
            peer,
        });
        true
    }

    /// Drop the current socket but keep the connection alive for a reconnect.
    pub(crate) async fn detach_socket(&self) {
        let writer = {
            let mut state = self.inner.state.lock();
            state.status = ConnectionStatus::Connecting;
            state.writer.take()
        };
        if let Some(writer) = writer {
            writer.close().await;
        }
        let rejected = self.inner.pending.reject_all(|| PeerwireError::Disconnected);
        debug!(connection = %self.id(), rejected, "socket detached");
    }

    /// Install a handshaken socket and register the peer under its name.
    ///
    /// Returns `false` (and closes the writer) if the connection was torn
    /// down while the handshake was running.
    pub(crate) async fn attach(&self, writer: WriterHandle, peer: String, status: ConnectionStatus) -> bool {
        {
            let mut state = self.inner.state.lock();
            if !self.is_closed() {
                state.writer = Some(writer.clone());
                state.status = status;
            }
        }
        if self.is_closed() {
            writer.close().await;
            return false;
        }

        self.set_peer_name(peer.clone());
        info!(connection = %self.id(), %peer, role = ?self.role(), "peer ready");
        self.inner.ctx.emit(NodeEvent::Ready {
            connection: self.id(),
            peer,
        });
        true
    }

    /// Record the peer's name and keep the registry keyed by it.
    fn set_peer_name(&self, name: String) {
        let previous = self.inner.state.lock().peer_name.replace(name.clone());
        let registry = &self.inner.ctx.registry;

        if let Some(old) = previous.as_deref().filter(|old| *old != name) {
            registry.remove(old, self.id());
        }
        if let Some(evicted) = registry.insert(name.clone(), self.clone()) {
            info!(connection = %self.id(), evicted = %evicted.id(), peer = %name, "evicting previous holder of name");
            // The evicted peer may have stopped reading; its close must not hold up this one.
            tokio::spawn(async move {
                evicted.disconnect().await;
            });
        }
        if previous.as_deref() != Some(name.as_str()) {
            self.inner.ctx.emit(NodeEvent::PeerIdentified {
                connection: self.id(),
                peer: name,
            });
        }
    }

    pub(crate) fn set_status(&self, status: ConnectionStatus) {
        self.inner.state.lock().status = status;
    }

    pub(crate) fn context(&self) -> &Arc<ConnectionContext> {
        &self.inner.ctx
    }

    /// Receiver that observes the final teardown.
    pub(crate) fn closed_signal(&self) -> watch::Receiver<bool> {
        self.inner.closed.subscribe()
    }

    fn writer(&self) -> Option<WriterHandle> {
        self.inner.state.lock().writer.clone()
    }

    fn is_current_writer(&self, writer: &WriterHandle) -> bool {
        self.inner
            .state
            .lock()
            .writer
            .as_ref()
            .is_some_and(|current| current.same_writer(writer))
    }

    /// Read and dispatch frames until the socket closes or the connection is
    /// torn down.
    ///
    /// Frames already buffered in `queue` (left over from the handshake) are
    /// dispatched before the first read.
    pub(crate) async fn read_until_closed<R>(&self, reader: &mut R, queue: &mut MessageQueue) -> CloseReason
    where
        R: AsyncRead + Unpin,
    {
        let mut closed = self.closed_signal();
        let mut graceful = false;
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        let items: Vec<Processed> = queue.process(&[]).collect();
        for item in items {
            self.handle(item, &mut graceful).await;
        }

        loop {
            if *closed.borrow_and_update() {
                return CloseReason::Local;
            }

            let read = tokio::select! {
                _ = closed.changed() => continue,
                read = reader.read(&mut buf) => read,
            };

            match read {
                Ok(0) => {
                    return if graceful {
                        debug!(connection = %self.id(), "peer closed gracefully");
                        CloseReason::Graceful
                    } else {
                        debug!(connection = %self.id(), "peer dropped the connection");
                        CloseReason::Dropped
                    };
                }
                Ok(n) => {
                    self.inner.ctx.emit(NodeEvent::Data {
                        connection: self.id(),
                        bytes: Bytes::copy_from_slice(&buf[..n]),
                    });
                    let items: Vec<Processed> = queue.process(&buf[..n]).collect();
                    for item in items {
                        self.handle(item, &mut graceful).await;
                    }
                }
                Err(e) if self.is_closed() => {
                    trace!(connection = %self.id(), error = %e, "read error after close ignored");
                    return CloseReason::Local;
                }
                Err(e) => {
                    warn!(connection = %self.id(), error = %e, "socket error");
                    self.inner.ctx.emit(NodeEvent::Error {
                        connection: self.id(),
                        error: PeerwireError::Io(e),
                    });
                    return if graceful {
                        CloseReason::Graceful
                    } else {
                        CloseReason::Failed
                    };
                }
            }
        }
    }

    async fn handle(&self, item: Processed, graceful: &mut bool) {
        match item {
            Processed::Frame(frame) => self.dispatch(frame, graceful).await,
            Processed::ParseFailure(error) => {
                warn!(connection = %self.id(), error = %error, "dropping undecodable frame");
                self.inner.ctx.emit(NodeEvent::Error {
                    connection: self.id(),
                    error,
                });
            }
        }
    }

    async fn dispatch(&self, frame: Frame<Value>, graceful: &mut bool) {
        let Frame { id, receptive, data } = frame;

        let data = match self.inner.pending.resolve(id, data) {
            Ok(()) => return,
            Err(data) => data,
        };

        let reply = match Marker::of(&data) {
            Some(Marker::VClose) => {
                *graceful = true;
                return;
            }
            Some(Marker::Ping) => Value::from(now_millis()),
            Some(Marker::Identify) => Value::from(self.inner.ctx.name.as_str()),
            None => {
                let Some(writer) = self.writer() else {
                    debug!(connection = %self.id(), %id, "message after socket detached dropped");
                    return;
                };
                self.inner.ctx.emit(NodeEvent::Message(InboundMessage {
                    connection: self.id(),
                    peer: self.peer_name(),
                    id,
                    receptive,
                    data,
                    writer,
                    codec: self.inner.ctx.codec.clone(),
                }));
                return;
            }
        };

        if let Some(writer) = self.writer() {
            match self.inner.ctx.codec.encode(&reply) {
                Ok(body) => {
                    if let Err(e) = writer.send(OutboundFrame::new(id, false, body)).await {
                        debug!(connection = %self.id(), error = %e, "marker reply not sent");
                    }
                }
                Err(e) => warn!(connection = %self.id(), error = %e, "marker reply not encodable"),
            }
        }
    }
}

/// An application message received from a peer.
///
/// Answer it with [`InboundMessage::reply`]; the reply travels on the socket
/// the message arrived on and reuses its frame id.
#[derive(Clone)]
pub struct InboundMessage {
    connection: ConnectionId,
    peer: Option<String>,
    id: FrameId,
    receptive: bool,
    data: Value,
    writer: WriterHandle,
    codec: Arc<dyn Codec>,
}

impl fmt::Debug for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundMessage")
            .field("connection", &self.connection)
            .field("peer", &self.peer)
            .field("id", &self.id)
            .field("receptive", &self.receptive)
            .field("data", &self.data)
            .finish()
    }
}

impl InboundMessage {
    #[inline]
    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Name of the sending peer.
    #[inline]
    pub fn peer(&self) -> Option<&str> {
        self.peer.as_deref()
    }

    #[inline]
    pub fn id(&self) -> FrameId {
        self.id
    }

    /// Whether the sender waits for a reply.
    #[inline]
    pub fn receptive(&self) -> bool {
        self.receptive
    }

    #[inline]
    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn into_data(self) -> Value {
        self.data
    }

    /// Answer the message.
    ///
    /// A no-op if the sender did not ask for a reply.
    pub async fn reply(&self, content: impl Into<Value>) -> Result<()> {
        if !self.receptive {
            return Ok(());
        }
        let body = self.codec.encode(&content.into())?;
        self.writer.send(OutboundFrame::new(self.id, false, body)).await
    }
}
