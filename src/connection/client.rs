//! Dial-out connections.
//!
//! [`ClientConnection::connect`] dials, runs the client side of the
//! handshake and hands the socket to a supervisor task. When the socket is
//! lost without a `$vclose`, the supervisor waits `retry_time` and dials again,
//! up to `maximum_retries` consecutive attempts. A successful reconnect resets
//! the budget.

use std::sync::Arc;

use tokio::net::tcp::OwnedReadHalf;
use tracing::{debug, info, warn};

use super::handshake::{client_handshake, with_timeout};
use super::{wait_closed, CloseReason, Connection, ConnectionContext, ConnectionStatus, Role};
use crate::config::{ClientConfig, Retries};
use crate::error::Result;
use crate::node::NodeEvent;
use crate::queue::MessageQueue;
use crate::transport::{self, Target};
use crate::writer::{spawn_writer_task, DEFAULT_CHANNEL_CAPACITY};

/// Task state of one dial-out connection.
pub(crate) struct ClientConnection {
    connection: Connection,
    queue: MessageQueue,
    target: Target,
    config: ClientConfig,
}

impl ClientConnection {
    /// Dial `target` and complete the handshake.
    ///
    /// The first attempt is not retried; on failure the connection is torn
    /// down and the error returned.
    pub(crate) async fn connect(
        ctx: Arc<ConnectionContext>,
        target: Target,
        config: ClientConfig,
    ) -> Result<Connection> {
        let (connection, queue) = Connection::new(Role::Client, ctx);
        let mut client = ClientConnection {
            connection: connection.clone(),
            queue,
            target,
            config,
        };

        match client.establish().await {
            Ok(reader) => {
                tokio::spawn(client.supervise(reader));
                Ok(connection)
            }
            Err(e) => {
                warn!(connection = %connection.id(), target = %client.target, error = %e, "connect failed");
                connection.close_terminal().await;
                Err(e)
            }
        }
    }

    /// One dial plus handshake.
    async fn establish(&mut self) -> Result<OwnedReadHalf> {
        let ctx = self.connection.context().clone();

        self.connection.set_status(ConnectionStatus::Connecting);
        ctx.emit(NodeEvent::Connecting {
            connection: self.connection.id(),
            target: self.target.clone(),
        });

        let stream = transport::connect(&self.target).await?;
        let addr = stream.peer_addr().ok();
        self.connection.set_status(ConnectionStatus::Connected);
        ctx.emit(NodeEvent::Connected {
            connection: self.connection.id(),
            role: Role::Client,
            addr,
        });

        let (mut reader, writer) = stream.into_split();
        let (writer, _task) = spawn_writer_task(writer, DEFAULT_CHANNEL_CAPACITY);
        self.queue.clear();

        let peer = with_timeout(
            self.config.handshake_timeout,
            client_handshake(&mut reader, &mut self.queue, &writer, ctx.codec.as_ref(), &ctx.name),
        )
        .await?;

        if !self.connection.attach(writer, peer, ConnectionStatus::Ready).await {
            return Err(crate::error::PeerwireError::Disconnected);
        }
        Ok(reader)
    }

    fn may_retry(&self, attempts: u32) -> bool {
        let interval = self.config.retry_time.filter(|d| !d.is_zero());
        let budget = match self.config.maximum_retries {
            Retries::Unlimited => true,
            Retries::Limited(max) => attempts < max,
        };
        interval.is_some() && budget
    }

    /// Read, and reconnect while the policy allows.
    async fn supervise(mut self, mut reader: OwnedReadHalf) {
        let mut closed = self.connection.closed_signal();
        let id = self.connection.id();

        loop {
            let reason = self
                .connection
                .read_until_closed(&mut reader, &mut self.queue)
                .await;
            drop(reader);

            if reason == CloseReason::Local {
                return;
            }
            if !reason.is_unexpected() || !self.may_retry(0) {
                debug!(connection = %id, ?reason, "not reconnecting");
                self.connection.close_terminal().await;
                return;
            }

            self.connection.detach_socket().await;

            let mut attempts = 0;
            reader = loop {
                let Some(delay) = self.config.retry_time else {
                    self.connection.close_terminal().await;
                    return;
                };
                attempts += 1;
                info!(connection = %id, target = %self.target, attempt = attempts, ?delay, "reconnecting");

                tokio::select! {
                    _ = wait_closed(&mut closed) => return,
                    _ = tokio::time::sleep(delay) => {}
                }

                let outcome = tokio::select! {
                    _ = wait_closed(&mut closed) => return,
                    outcome = self.establish() => outcome,
                };

                match outcome {
                    Ok(reader) => break reader,
                    Err(e) => {
                        warn!(connection = %id, attempt = attempts, error = %e, "reconnect failed");
                        self.connection.context().emit(NodeEvent::Error {
                            connection: id,
                            error: e,
                        });
                        if !self.may_retry(attempts) {
                            self.connection.close_terminal().await;
                            return;
                        }
                        self.connection.set_status(ConnectionStatus::Connecting);
                    }
                }
            };
            info!(connection = %id, attempts, "reconnected");
        }
    }
}
