//! Name exchange that turns an anonymous socket into a named peer.
//!
//! ```text
//! server                                   client
//!   │── [id=N, non-receptive] "server" ──────►│  stores "server"
//!   │◄──────── [id=N, non-receptive] "client" ─│  reuses id N
//!   │ checks id, stores "client"               │
//! ```
//!
//! Any frame left in the queue after the handshake frame belongs to normal
//! traffic and is dispatched by the read loop.

use std::future::Future;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

use super::READ_BUFFER_SIZE;
use crate::codec::{Codec, Value};
use crate::error::{PeerwireError, Result};
use crate::protocol::{Frame, FrameId, OutboundFrame};
use crate::queue::{MessageQueue, Processed};
use crate::writer::WriterHandle;

/// Dialing side: wait for the server's name, answer with ours under the same id.
pub(crate) async fn client_handshake<R>(
    reader: &mut R,
    queue: &mut MessageQueue,
    writer: &WriterHandle,
    codec: &dyn Codec,
    local_name: &str,
) -> Result<String>
where
    R: AsyncRead + Unpin,
{
    let frame = read_frame(reader, queue).await?;
    let peer = peer_name(frame.data)?;

    let body = codec.encode(&Value::from(local_name))?;
    writer.send(OutboundFrame::new(frame.id, false, body)).await?;

    debug!(%peer, id = %frame.id, "client handshake complete");
    Ok(peer)
}

/// Accepting side: announce our name under `id`, expect the answer under the same id.
pub(crate) async fn server_handshake<R>(
    reader: &mut R,
    queue: &mut MessageQueue,
    writer: &WriterHandle,
    codec: &dyn Codec,
    local_name: &str,
    id: FrameId,
) -> Result<String>
where
    R: AsyncRead + Unpin,
{
    let body = codec.encode(&Value::from(local_name))?;
    writer.send(OutboundFrame::new(id, false, body)).await?;

    let frame = read_frame(reader, queue).await?;
    if frame.id != id {
        return Err(PeerwireError::Handshake(format!(
            "reply id {} does not match {}",
            frame.id, id
        )));
    }
    let peer = peer_name(frame.data)?;

    debug!(%peer, %id, "server handshake complete");
    Ok(peer)
}

/// Bound a handshake. `None` waits forever.
pub(crate) async fn with_timeout<T, F>(limit: Option<Duration>, handshake: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, handshake)
            .await
            .map_err(|_| PeerwireError::HandshakeTimeout)?,
        None => handshake.await,
    }
}

fn peer_name(data: Value) -> Result<String> {
    match data {
        Value::String(name) => Ok(name),
        other => Err(PeerwireError::Handshake(format!(
            "peer name must be a string, got {other:?}"
        ))),
    }
}

/// Read until the queue yields one frame.
async fn read_frame<R>(reader: &mut R, queue: &mut MessageQueue) -> Result<Frame<Value>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut item = queue.process(&[]).next();

    while item.is_none() {
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|e| PeerwireError::Handshake(format!("socket error: {e}")))?;
        if n == 0 {
            return Err(PeerwireError::Handshake("socket closed during handshake".into()));
        }
        item = queue.process(&buf[..n]).next();
    }

    match item {
        Some(Processed::Frame(frame)) => Ok(frame),
        Some(Processed::ParseFailure(e)) => Err(PeerwireError::Handshake(format!("malformed frame: {e}"))),
        None => Err(PeerwireError::Handshake("no frame".into())),
    }
}
