// pulse-hub/src/ws/types.rs

//! Handle types shared by the registry and the per-connection pipeline.

use crate::store::UserId;
use crate::ws::protocol::OutboundFrame;
use std::fmt;
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

/// A unique identifier for a single WebSocket connection.
pub type ConnectionId = Uuid;

/// The sending half of a connection's bounded outbound queue.
pub type Outbound = mpsc::Sender<OutboundFrame>;

/// What the registry stores per user: the connection's id and its outbound queue.
///
/// Cloning a handle is cheap and never touches the socket; all socket writes
/// happen in that connection's writer loop.
#[derive(Clone)]
pub struct ClientHandle {
    pub conn_id: ConnectionId,
    pub user_id: UserId,
    tx: Outbound,
}

/// Why a non-blocking enqueue did not happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    /// The queue is at capacity; the frame was dropped.
    Full,
    /// The writer loop has exited; the frame was dropped.
    Closed,
}

impl ClientHandle {
    pub fn new(user_id: UserId, tx: Outbound) -> Self {
        Self {
            conn_id: ConnectionId::new_v4(),
            user_id,
            tx,
        }
    }

    /// Creates a handle together with the receiving end of its queue.
    pub fn channel(user_id: UserId, capacity: usize) -> (Self, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(user_id, tx), rx)
    }

    /// Enqueues without waiting. A full or closed queue drops the frame.
    pub fn try_enqueue(&self, frame: OutboundFrame) -> Result<(), EnqueueError> {
        self.tx.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => EnqueueError::Full,
            TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }

    /// True once the writer loop has dropped its receiver.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandle")
            .field("conn_id", &self.conn_id)
            .field("user_id", &self.user_id)
            .field("queued", &(self.tx.max_capacity() - self.tx.capacity()))
            .finish()
    }
}
