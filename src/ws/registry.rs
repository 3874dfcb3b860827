//! The connection registry: which user is connected right now, and how to reach them.

use crate::store::UserId;
use crate::ws::protocol::OutboundFrame;
use crate::ws::types::{ClientHandle, ConnectionId, EnqueueError};
use dashmap::DashMap;
use std::fmt;
use tracing::{debug, warn};

/// Maps an authenticated user to their single live connection.
///
/// Implementations must keep at most one entry per user. Operations never
/// perform socket I/O; delivery always goes through a handle's outbound
/// queue.
pub trait ConnectionRegistry: Send + Sync + 'static {
    /// Stores `handle` for `user_id`, returning the entry it replaced, if any.
    /// The replaced connection is not closed here.
    fn register(&self, user_id: UserId, handle: ClientHandle) -> Option<ClientHandle>;

    /// Removes the entry for `user_id` only if it still belongs to `conn_id`.
    /// Returns whether an entry was removed.
    fn unregister(&self, user_id: UserId, conn_id: ConnectionId) -> bool;

    fn lookup(&self, user_id: UserId) -> Option<ClientHandle>;

    /// A point-in-time copy of every live handle.
    fn snapshot(&self) -> Vec<ClientHandle>;

    /// Enqueues `frame` for every registered user except `user_id`.
    ///
    /// The handle list is copied first and the enqueues happen afterwards, so a
    /// slow peer never holds up registry mutation. Full queues drop the frame.
    /// Returns the number of peers the frame was queued for.
    fn broadcast_except(&self, user_id: UserId, frame: &OutboundFrame) -> usize {
        let peers = self.snapshot();
        let mut delivered = 0;
        for peer in peers.into_iter().filter(|h| h.user_id != user_id) {
            if peer.is_closed() {
                debug!(peer = peer.user_id, "Peer writer has exited, skipping broadcast frame");
                continue;
            }
            match peer.try_enqueue(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(EnqueueError::Full) => {
                    warn!(peer = peer.user_id, "Outbound queue full, dropping broadcast frame")
                }
                Err(EnqueueError::Closed) => {
                    debug!(peer = peer.user_id, "Peer is closing, skipping broadcast frame")
                }
            }
        }
        delivered
    }

    fn online_users(&self) -> Vec<UserId> {
        self.snapshot().into_iter().map(|h| h.user_id).collect()
    }
}

/// The process-local registry.
///
/// `DashMap` gives per-shard locking; no guard is ever held across an `.await`
/// or an enqueue.
#[derive(Default)]
pub struct LocalRegistry {
    clients: DashMap<UserId, ClientHandle>,
}

impl LocalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

impl ConnectionRegistry for LocalRegistry {
    fn register(&self, user_id: UserId, handle: ClientHandle) -> Option<ClientHandle> {
        let replaced = self.clients.insert(user_id, handle);
        if let Some(old) = &replaced {
            debug!(user_id, old_conn = %old.conn_id, "Replaced existing registry entry");
        }
        replaced
    }

    fn unregister(&self, user_id: UserId, conn_id: ConnectionId) -> bool {
        self.clients
            .remove_if(&user_id, |_, handle| handle.conn_id == conn_id)
            .is_some()
    }

    fn lookup(&self, user_id: UserId) -> Option<ClientHandle> {
        self.clients.get(&user_id).map(|entry| entry.value().clone())
    }

    fn snapshot(&self) -> Vec<ClientHandle> {
        self.clients.iter().map(|entry| entry.value().clone()).collect()
    }
}

impl fmt::Debug for LocalRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalRegistry")
            .field("connections_count", &self.clients.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::protocol::{MessageFrame, StatusUpdate};

    fn status(user_id: UserId) -> OutboundFrame {
        StatusUpdate {
            user_id,
            username: format!("user{user_id}"),
            is_online: true,
            last_seen: String::new(),
        }
        .into()
    }

    #[test]
    fn registering_twice_keeps_only_the_newer_entry() {
        let registry = LocalRegistry::new();
        let (first, _rx1) = ClientHandle::channel(1, 4);
        let (second, _rx2) = ClientHandle::channel(1, 4);
        let second_id = second.conn_id;

        assert!(registry.register(1, first.clone()).is_none());
        let replaced = registry.register(1, second).unwrap();
        assert_eq!(replaced.conn_id, first.conn_id);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.lookup(1).unwrap().conn_id, second_id);
    }

    #[test]
    fn stale_unregister_leaves_the_replacement_in_place() {
        let registry = LocalRegistry::new();
        let (old, _rx1) = ClientHandle::channel(1, 4);
        let (new, _rx2) = ClientHandle::channel(1, 4);
        let new_id = new.conn_id;
        registry.register(1, old.clone());
        registry.register(1, new);

        assert!(!registry.unregister(1, old.conn_id));
        assert_eq!(registry.lookup(1).unwrap().conn_id, new_id);
        assert!(registry.unregister(1, new_id));
        assert!(registry.lookup(1).is_none());
    }

    #[test]
    fn broadcast_skips_the_subject_and_reaches_everyone_else() {
        let registry = LocalRegistry::new();
        let mut receivers = Vec::new();
        for user in 1..=3 {
            let (handle, rx) = ClientHandle::channel(user, 4);
            registry.register(user, handle);
            receivers.push((user, rx));
        }

        assert_eq!(registry.broadcast_except(2, &status(2)), 2);
        for (user, mut rx) in receivers {
            let got = rx.try_recv().ok();
            if user == 2 {
                assert!(got.is_none());
            } else {
                assert_eq!(got, Some(status(2)));
            }
        }
    }

    #[test]
    fn broadcast_skips_peers_whose_writer_has_exited() {
        let registry = LocalRegistry::new();
        let (gone, gone_rx) = ClientHandle::channel(1, 4);
        let (live, mut live_rx) = ClientHandle::channel(2, 4);
        registry.register(1, gone.clone());
        registry.register(2, live);
        drop(gone_rx);

        assert!(gone.is_closed());
        assert_eq!(registry.broadcast_except(3, &status(3)), 1);
        assert_eq!(live_rx.try_recv().ok(), Some(status(3)));
    }

    #[test]
    fn broadcast_drops_for_a_full_peer_without_blocking() {
        let registry = LocalRegistry::new();
        let (slow, mut slow_rx) = ClientHandle::channel(1, 1);
        let (fast, mut fast_rx) = ClientHandle::channel(2, 4);
        registry.register(1, slow.clone());
        registry.register(2, fast);
        slow.try_enqueue(MessageFrame::typing(9, 1, String::new()).into())
            .unwrap();

        assert_eq!(registry.broadcast_except(3, &status(3)), 1);
        assert!(matches!(slow_rx.try_recv(), Ok(OutboundFrame::Message(_))));
        assert!(slow_rx.try_recv().is_err());
        assert_eq!(fast_rx.try_recv().ok(), Some(status(3)));
    }
}
