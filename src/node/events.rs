//! Lifecycle and traffic notifications.

use std::net::SocketAddr;

use bytes::Bytes;

use crate::connection::{ConnectionId, InboundMessage, Role};
use crate::error::PeerwireError;
use crate::transport::Target;

/// Everything a [`Node`](super::Node) reports through its event channel.
#[derive(Debug)]
pub enum NodeEvent {
    /// A dial (or redial) to `target` is starting.
    Connecting {
        connection: ConnectionId,
        target: Target,
    },
    /// The TCP connection is up; the handshake has not run yet.
    Connected {
        connection: ConnectionId,
        role: Role,
        addr: Option<SocketAddr>,
    },
    /// The handshake completed and the peer is registered.
    Ready {
        connection: ConnectionId,
        peer: String,
    },
    /// The connection was torn down for good.
    Disconnected {
        connection: ConnectionId,
        peer: Option<String>,
    },
    /// The peer's logical name was learned or changed.
    PeerIdentified {
        connection: ConnectionId,
        peer: String,
    },
    /// Raw bytes as read from the socket, before reassembly.
    Data {
        connection: ConnectionId,
        bytes: Bytes,
    },
    /// A transport, protocol or handshake error on one connection.
    Error {
        connection: ConnectionId,
        error: PeerwireError,
    },
    /// An application message.
    Message(InboundMessage),
}

impl NodeEvent {
    /// The connection this event concerns.
    pub fn connection(&self) -> ConnectionId {
        match self {
            NodeEvent::Connecting { connection, .. }
            | NodeEvent::Connected { connection, .. }
            | NodeEvent::Ready { connection, .. }
            | NodeEvent::Disconnected { connection, .. }
            | NodeEvent::PeerIdentified { connection, .. }
            | NodeEvent::Data { connection, .. }
            | NodeEvent::Error { connection, .. } => *connection,
            NodeEvent::Message(message) => message.connection(),
        }
    }
}
