//! Node facade.
//!
//! A [`Node`] is one named participant. It can listen for peers, dial peers,
//! and address any registered peer by its logical name. Everything that
//! happens on its connections is reported through the [`NodeEvent`] channel
//! returned at construction.
//!
//! # Example
//!
//! ```no_run
//! use peerwire::{Node, NodeConfig, NodeEvent, SendOptions, Target};
//!
//! #[tokio::main]
//! async fn main() -> peerwire::Result<()> {
//!     let (server, mut server_events) = Node::new("Server", NodeConfig::default());
//!     let addr = server.listen(Target::localhost(0)).await?;
//!
//!     tokio::spawn(async move {
//!         while let Some(event) = server_events.recv().await {
//!             if let NodeEvent::Message(message) = event {
//!                 let _ = message.reply("World").await;
//!             }
//!         }
//!     });
//!
//!     let (client, _events) = Node::new("Client", NodeConfig::default());
//!     client.connect_to(addr).await?;
//!     let reply = client.send_to("Server", "Hello", SendOptions::default()).await?;
//!     assert_eq!(reply.and_then(|v| v.as_str().map(String::from)).as_deref(), Some("World"));
//!     Ok(())
//! }
//! ```

mod events;
mod registry;

pub use events::NodeEvent;
pub use registry::PeerRegistry;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use parking_lot::Mutex;
use regex::Regex;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::codec::{Codec, TaggedCodec, Value};
use crate::config::{NodeConfig, ServerConfig};
use crate::connection::client::ClientConnection;
use crate::connection::server::ServerConnection;
use crate::connection::{Connection, ConnectionContext, SendOptions};
use crate::error::{PeerwireError, Result};
use crate::protocol::FrameIdGenerator;
use crate::transport::{self, Target};

/// Pause after a failed `accept` before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Options for [`Node::broadcast`].
#[derive(Debug, Clone)]
pub struct BroadcastOptions {
    /// Wait for every peer's reply.
    pub receptive: bool,
    /// Per-peer reply deadline.
    pub timeout: Option<Duration>,
    /// Only peers whose name matches.
    pub filter: Option<Regex>,
}

impl Default for BroadcastOptions {
    fn default() -> Self {
        Self {
            receptive: true,
            timeout: None,
            filter: None,
        }
    }
}

impl BroadcastOptions {
    pub fn with_receptive(mut self, receptive: bool) -> Self {
        self.receptive = receptive;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_filter(mut self, filter: Regex) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Compile `pattern` as the name filter.
    ///
    /// # Errors
    ///
    /// [`PeerwireError::InvalidFilter`] if the pattern is not a valid regex.
    pub fn with_pattern(self, pattern: &str) -> Result<Self> {
        Ok(self.with_filter(Regex::new(pattern)?))
    }

    fn send_options(&self) -> SendOptions {
        SendOptions {
            receptive: self.receptive,
            timeout: self.timeout,
        }
    }
}

/// Builder for configuring and creating a [`Node`].
pub struct NodeBuilder {
    name: String,
    config: NodeConfig,
    codec: Arc<dyn Codec>,
}

impl NodeBuilder {
    /// Start building a node with the given logical name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: NodeConfig::default(),
            codec: Arc::new(TaggedCodec),
        }
    }

    pub fn config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a different body codec. Both peers must agree on it.
    pub fn codec(mut self, codec: impl Codec) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    /// Build the node and its event receiver.
    ///
    /// The receiver holds at most [`NodeConfig::event_capacity`] events;
    /// events that arrive while it is full are dropped.
    pub fn build(self) -> (Node, mpsc::Receiver<NodeEvent>) {
        let (events, rx) = mpsc::channel(self.config.event_capacity.max(1));
        let ctx = ConnectionContext {
            name: self.name,
            codec: self.codec,
            frame_ids: Arc::new(FrameIdGenerator::new()),
            registry: Arc::new(PeerRegistry::new()),
            events,
            max_body_size: self.config.max_body_size,
            dropped_events: AtomicU64::new(0),
        };
        let node = Node {
            ctx: Arc::new(ctx),
            config: self.config,
            listener: Mutex::new(None),
        };
        (node, rx)
    }
}

struct Listening {
    addr: SocketAddr,
    task: AbortHandle,
}

/// One named participant.
pub struct Node {
    ctx: Arc<ConnectionContext>,
    config: NodeConfig,
    listener: Mutex<Option<Listening>>,
}

impl Node {
    /// Create a node with the default codec.
    pub fn new(name: impl Into<String>, config: NodeConfig) -> (Self, mpsc::Receiver<NodeEvent>) {
        NodeBuilder::new(name).config(config).build()
    }

    pub fn builder(name: impl Into<String>) -> NodeBuilder {
        NodeBuilder::new(name)
    }

    /// This node's logical name.
    pub fn name(&self) -> &str {
        &self.ctx.name
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Dial a peer and wait for the handshake.
    ///
    /// The connection reconnects on its own after unexpected drops, as
    /// configured by [`ClientConfig`](crate::ClientConfig). The first dial
    /// is not retried.
    pub async fn connect_to(&self, target: impl Into<Target>) -> Result<Connection> {
        let target = target.into();
        info!(node = %self.name(), %target, "connecting");
        ClientConnection::connect(self.ctx.clone(), target, self.config.client.clone()).await
    }

    /// Start accepting peers on `target`.
    ///
    /// Returns the bound address, which is useful with port `0`.
    ///
    /// # Errors
    ///
    /// [`PeerwireError::AlreadyListening`] if this node already listens.
    pub async fn listen(&self, target: impl Into<Target>) -> Result<SocketAddr> {
        if self.listener.lock().is_some() {
            return Err(PeerwireError::AlreadyListening);
        }

        let listener = transport::bind(&target.into()).await?;
        let addr = listener.local_addr()?;

        let mut slot = self.listener.lock();
        if slot.is_some() {
            return Err(PeerwireError::AlreadyListening);
        }
        let task = tokio::spawn(accept_loop(listener, self.ctx.clone(), self.config.server.clone()));
        *slot = Some(Listening {
            addr,
            task: task.abort_handle(),
        });

        info!(node = %self.name(), %addr, "listening");
        Ok(addr)
    }

    /// Address this node listens on.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.lock().as_ref().map(|l| l.addr)
    }

    /// Send to the peer registered under `name`.
    ///
    /// # Errors
    ///
    /// [`PeerwireError::NotConnected`] if no such peer is registered; nothing
    /// is sent then. Otherwise as [`Connection::send`].
    pub async fn send_to(
        &self,
        name: &str,
        data: impl Into<Value>,
        options: SendOptions,
    ) -> Result<Option<Value>> {
        let connection = self
            .ctx
            .registry
            .get(name)
            .ok_or_else(|| PeerwireError::NotConnected(name.to_string()))?;
        connection.send(data, options).await
    }

    /// Send to every registered peer, optionally filtered by name.
    ///
    /// Replies come back in peer-name order. Fails with the first error if
    /// any send fails.
    pub async fn broadcast(
        &self,
        data: impl Into<Value>,
        options: BroadcastOptions,
    ) -> Result<Vec<Option<Value>>> {
        let data = data.into();
        let send_options = options.send_options();

        let mut targets = self.ctx.registry.snapshot();
        targets.retain(|(name, _)| options.filter.as_ref().map_or(true, |f| f.is_match(name)));
        targets.sort_by(|a, b| a.0.cmp(&b.0));
        debug!(node = %self.name(), peers = targets.len(), "broadcasting");

        try_join_all(
            targets
                .into_iter()
                .map(|(_, connection)| {
                    let data = data.clone();
                    async move { connection.send(data, send_options).await }
                }),
        )
        .await
    }

    /// Disconnect the peer registered under `name`.
    ///
    /// Returns `false` if no such peer is registered.
    pub async fn disconnect_from(&self, name: &str) -> bool {
        match self.ctx.registry.get(name) {
            Some(connection) => connection.disconnect().await,
            None => false,
        }
    }

    /// Connection registered under `name`.
    pub fn peer(&self, name: &str) -> Option<Connection> {
        self.ctx.registry.get(name)
    }

    /// Events dropped so far because the receiver was full.
    pub fn dropped_events(&self) -> u64 {
        self.ctx.dropped_events.load(Ordering::Relaxed)
    }

    /// Names of all registered peers, sorted.
    pub fn peers(&self) -> Vec<String> {
        self.ctx.registry.names()
    }

    /// Stop listening and disconnect every peer.
    pub async fn close(&self) {
        if let Some(listening) = self.listener.lock().take() {
            listening.task.abort();
        }
        for (name, connection) in self.ctx.registry.snapshot() {
            debug!(node = %self.name(), peer = %name, "closing");
            connection.disconnect().await;
        }
        info!(node = %self.name(), "closed");
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if let Some(listening) = self.listener.get_mut().take() {
            listening.task.abort();
        }
    }
}

async fn accept_loop(listener: TcpListener, ctx: Arc<ConnectionContext>, config: ServerConfig) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!(node = %ctx.name, %addr, "accepted");
                tokio::spawn(ServerConnection::new(ctx.clone(), stream, config.clone()).run());
            }
            Err(e) => {
                warn!(node = %ctx.name, error = %e, "accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}
