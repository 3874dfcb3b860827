//! Online/offline tracking.
//!
//! Each user moves `Offline -> Online` when their connection is registered and
//! back to `Offline` when it is torn down. Both transitions are persisted
//! (`is_online`, `last_seen = now`) and then broadcast to every other
//! connected user as a `status_update` frame.

use crate::error::{StoreError, bounded};
use crate::store::{MessageStore, UserId};
use crate::ws::protocol::{OutboundFrame, StatusUpdate};
use crate::ws::registry::ConnectionRegistry;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

/// Persists presence transitions and broadcasts them.
#[derive(Clone)]
pub struct PresenceTracker {
    store: Arc<dyn MessageStore>,
    registry: Arc<dyn ConnectionRegistry>,
    db_timeout: Duration,
}

impl PresenceTracker {
    pub fn new(
        store: Arc<dyn MessageStore>,
        registry: Arc<dyn ConnectionRegistry>,
        db_timeout: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            db_timeout,
        }
    }

    /// Records the `Offline -> Online` transition. Returns how many peers were notified.
    pub async fn went_online(&self, user_id: UserId) -> Result<usize, StoreError> {
        self.transition(user_id, true).await
    }

    /// Records the `Online -> Offline` transition. Returns how many peers were notified.
    pub async fn went_offline(&self, user_id: UserId) -> Result<usize, StoreError> {
        self.transition(user_id, false).await
    }

    #[instrument(skip(self))]
    async fn transition(&self, user_id: UserId, online: bool) -> Result<usize, StoreError> {
        bounded(
            self.db_timeout,
            self.store.set_presence(user_id, online, Utc::now()),
        )
        .await?;

        // A newer connection for this user may have registered while the
        // offline write was in flight. Its online state must win.
        if !online && self.registry.lookup(user_id).is_some() {
            debug!("User reconnected during offline transition, restoring online flag");
            bounded(
                self.db_timeout,
                self.store.set_presence(user_id, true, Utc::now()),
            )
            .await?;
            return Ok(0);
        }

        let frame = self.status_frame(user_id, online).await?;
        let notified = self.registry.broadcast_except(user_id, &frame);
        debug!(notified, "Broadcast presence transition");
        Ok(notified)
    }

    /// Builds the broadcast payload from what the store holds right now, so the
    /// frame never carries a username or timestamp older than the durable row.
    async fn status_frame(&self, user_id: UserId, online: bool) -> Result<OutboundFrame, StoreError> {
        let profile = bounded(self.db_timeout, self.store.user_profile(user_id))
            .await?
            .ok_or(StoreError::NotFound {
                entity: "user",
                id: user_id,
            })?;

        Ok(StatusUpdate {
            user_id,
            username: profile.username,
            is_online: online,
            last_seen: profile
                .last_seen
                .map(|at| at.to_rfc3339())
                .unwrap_or_default(),
        }
        .into())
    }
}
