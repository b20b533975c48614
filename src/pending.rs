//! Correlation table for receptive sends awaiting a reply.
//!
//! Each entry is keyed by the frame id of the request. An entry leaves the
//! table exactly once, through whichever of these happens first:
//!
//! - a reply frame with the same id arrives ([`PendingRequests::resolve`])
//! - its own timeout fires (rejects with [`PeerwireError::Timeout`])
//! - the connection is torn down ([`PendingRequests::reject_all`])
//!
//! All three paths go through the same locked removal, so a request can never
//! be settled twice. Removing an entry cancels its timer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::debug;

use crate::codec::Value;
use crate::error::{PeerwireError, Result};
use crate::protocol::FrameId;

/// A request waiting for its reply.
struct PendingRequest {
    reply: oneshot::Sender<Result<Value>>,
    timer: Option<AbortHandle>,
}

impl PendingRequest {
    fn settle(self, outcome: Result<Value>) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        // The caller may have stopped waiting; nothing to do then.
        let _ = self.reply.send(outcome);
    }
}

/// Pending requests of one connection.
#[derive(Default)]
pub struct PendingRequests {
    entries: Mutex<HashMap<FrameId, PendingRequest>>,
}

/// The receiving side of a registered request.
#[derive(Debug)]
pub struct PendingReply {
    id: FrameId,
    rx: oneshot::Receiver<Result<Value>>,
}

impl PendingReply {
    /// Id of the request this reply belongs to.
    pub fn id(&self) -> FrameId {
        self.id
    }

    /// Wait for the request to settle.
    pub async fn wait(self) -> Result<Value> {
        self.rx.await.unwrap_or(Err(PeerwireError::Disconnected))
    }
}

impl PendingRequests {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request.
    ///
    /// With a timeout, a timer task rejects the entry once the deadline
    /// passes. Must be called inside a Tokio runtime when `timeout` is set.
    ///
    /// # Errors
    ///
    /// Returns [`PeerwireError::DuplicateRequest`] if `id` is already pending.
    pub fn register(self: &Arc<Self>, id: FrameId, timeout: Option<Duration>) -> Result<PendingReply> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&id) {
            return Err(PeerwireError::DuplicateRequest(id));
        }

        let (reply, rx) = oneshot::channel();
        let timer = timeout.map(|deadline| {
            let table = Arc::downgrade(self);
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                if let Some(table) = table.upgrade() {
                    if table.reject(id, PeerwireError::Timeout) {
                        debug!(%id, ?deadline, "request timed out");
                    }
                }
            })
            .abort_handle()
        });

        entries.insert(id, PendingRequest { reply, timer });
        Ok(PendingReply { id, rx })
    }

    /// Resolve the request with this id.
    ///
    /// Hands the value back if nothing is pending under `id`, meaning the
    /// frame is not a reply.
    pub fn resolve(&self, id: FrameId, value: Value) -> std::result::Result<(), Value> {
        let entry = self.entries.lock().remove(&id);
        match entry {
            Some(entry) => {
                entry.settle(Ok(value));
                Ok(())
            }
            None => Err(value),
        }
    }

    /// Reject the request with this id. Returns `false` if it was not pending.
    pub fn reject(&self, id: FrameId, error: PeerwireError) -> bool {
        let entry = self.entries.lock().remove(&id);
        match entry {
            Some(entry) => {
                entry.settle(Err(error));
                true
            }
            None => false,
        }
    }

    /// Drop the request without settling it; its receiver sees a disconnect.
    pub fn remove(&self, id: FrameId) -> bool {
        let entry = self.entries.lock().remove(&id);
        match entry {
            Some(entry) => {
                if let Some(timer) = entry.timer {
                    timer.abort();
                }
                true
            }
            None => false,
        }
    }

    /// Reject every pending request. Returns how many were rejected.
    pub fn reject_all(&self, error: impl Fn() -> PeerwireError) -> usize {
        let drained: Vec<PendingRequest> = {
            let mut entries = self.entries.lock();
            entries.drain().map(|(_, entry)| entry).collect()
        };
        let count = drained.len();
        for entry in drained {
            entry.settle(Err(error()));
        }
        count
    }

    /// Whether a request with this id is pending.
    pub fn contains(&self, id: FrameId) -> bool {
        self.entries.lock().contains_key(&id)
    }

    /// Number of pending requests.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether no request is pending.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
