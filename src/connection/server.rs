//! Accepted connections.
//!
//! The accepting side never dials out, so there is no reconnection: once the
//! socket is gone the connection is finished.

use std::sync::Arc;

use tokio::net::TcpStream;
use tracing::{debug, warn};

use super::handshake::{server_handshake, with_timeout};
use super::{Connection, ConnectionContext, ConnectionStatus, Role};
use crate::config::ServerConfig;
use crate::node::NodeEvent;
use crate::queue::MessageQueue;
use crate::writer::{spawn_writer_task, DEFAULT_CHANNEL_CAPACITY};

/// Task state of one accepted connection.
pub(crate) struct ServerConnection {
    connection: Connection,
    queue: MessageQueue,
    stream: TcpStream,
    config: ServerConfig,
}

impl ServerConnection {
    pub(crate) fn new(ctx: Arc<ConnectionContext>, stream: TcpStream, config: ServerConfig) -> Self {
        let (connection, queue) = Connection::new(Role::Server, ctx);
        ServerConnection {
            connection,
            queue,
            stream,
            config,
        }
    }

    /// Handshake, register, then serve until the socket closes.
    pub(crate) async fn run(self) {
        let ServerConnection {
            connection,
            mut queue,
            stream,
            config,
        } = self;
        let ctx = connection.context().clone();
        let id = connection.id();
        let addr = stream.peer_addr().ok();

        ctx.emit(NodeEvent::Connected {
            connection: id,
            role: Role::Server,
            addr,
        });

        if let Err(e) = stream.set_nodelay(true) {
            debug!(connection = %id, error = %e, "set_nodelay failed");
        }
        let (mut reader, writer) = stream.into_split();
        let (writer, _task) = spawn_writer_task(writer, DEFAULT_CHANNEL_CAPACITY);

        let handshake = with_timeout(
            config.handshake_timeout,
            server_handshake(
                &mut reader,
                &mut queue,
                &writer,
                ctx.codec.as_ref(),
                &ctx.name,
                ctx.frame_ids.next_id(),
            ),
        )
        .await;

        let peer = match handshake {
            Ok(peer) => peer,
            Err(e) => {
                warn!(connection = %id, ?addr, error = %e, "handshake failed");
                ctx.emit(NodeEvent::Error { connection: id, error: e });
                writer.close().await;
                connection.close_terminal().await;
                return;
            }
        };

        if !connection.attach(writer, peer, ConnectionStatus::Connected).await {
            return;
        }

        let reason = connection.read_until_closed(&mut reader, &mut queue).await;
        debug!(connection = %id, ?reason, "accepted connection finished");
        connection.close_terminal().await;
    }
}
