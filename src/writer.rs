//! Dedicated writer task owning the write half of a socket.
//!
//! Every sender on a connection goes through a [`WriterHandle`], so frames
//! are written whole and never interleave. Frames that are already queued
//! when the task wakes up are coalesced into a single write.
//!
//! ```text
//! send()    ─┐
//! replies   ─┼─► mpsc::Sender<WriterCommand> ─► writer task ─► TcpStream
//! $vclose   ─┘
//! ```

use bytes::BytesMut;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::error::{PeerwireError, Result};
use crate::protocol::OutboundFrame;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Maximum frames coalesced into one write.
const MAX_BATCH_SIZE: usize = 64;

/// Instruction for the writer task.
#[derive(Debug)]
pub enum WriterCommand {
    /// Write a frame.
    Frame(OutboundFrame),
    /// Flush what is queued, shut the write half down and stop.
    Close,
}

/// Handle for sending frames to the writer task.
///
/// Cheap to clone. The task stops once every handle is dropped or
/// [`WriterHandle::close`] is called.
#[derive(Debug, Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<WriterCommand>,
}

impl WriterHandle {
    /// Queue a frame for writing.
    ///
    /// Returns [`PeerwireError::ConnectionClosed`] if the task has stopped.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        self.tx
            .send(WriterCommand::Frame(frame))
            .await
            .map_err(|_| PeerwireError::ConnectionClosed)
    }

    /// Ask the task to flush and shut the socket down.
    ///
    /// Frames queued before this call are still written.
    pub async fn close(&self) {
        // Already stopped is fine.
        let _ = self.tx.send(WriterCommand::Close).await;
    }

    /// Whether the writer task has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Whether both handles feed the same writer task.
    pub fn same_writer(&self, other: &WriterHandle) -> bool {
        self.tx.same_channel(&other.tx)
    }
}

/// Spawn the writer task and return a handle for sending frames.
///
/// The join handle resolves once the task stops, with the write error that
/// stopped it if any.
pub fn spawn_writer_task<W>(writer: W, capacity: usize) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let task = tokio::spawn(writer_loop(rx, writer));
    (WriterHandle { tx }, task)
}

async fn writer_loop<W>(mut rx: mpsc::Receiver<WriterCommand>, mut writer: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut batch = BytesMut::with_capacity(16 * 1024);

    while let Some(command) = rx.recv().await {
        let mut closing = false;
        let mut frames = 0;

        match command {
            WriterCommand::Frame(frame) => {
                put_frame(&mut batch, &frame);
                frames += 1;
            }
            WriterCommand::Close => closing = true,
        }

        while !closing && frames < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(WriterCommand::Frame(frame)) => {
                    put_frame(&mut batch, &frame);
                    frames += 1;
                }
                Ok(WriterCommand::Close) => closing = true,
                Err(_) => break,
            }
        }

        if !batch.is_empty() {
            trace!(frames, bytes = batch.len(), "writing batch");
            writer.write_all(&batch).await?;
            writer.flush().await?;
            batch.clear();
        }

        if closing {
            writer.shutdown().await?;
            return Ok(());
        }
    }

    Ok(())
}

fn put_frame(batch: &mut BytesMut, frame: &OutboundFrame) {
    batch.extend_from_slice(&frame.header);
    batch.extend_from_slice(&frame.body);
}
