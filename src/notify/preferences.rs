// src/notify/preferences.rs
use crate::error::{StoreError, bounded};
use crate::notify::kinds::NotificationKind;
use crate::store::{MessageStore, NotificationPreferences, UserId};
use anyhow::{Context, Error};
use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use std::{collections::HashMap, fmt, sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tracing::{debug, error, instrument};

// --- Type Aliases ---

/// A cloneable handle on one in-flight get-or-create for a user's preferences.
/// Every waiter receives the same `Arc`ed row or the same `Arc`ed error.
type SharedLoad =
    Shared<BoxFuture<'static, Arc<Result<Arc<NotificationPreferences>, Arc<Error>>>>>;

// --- Statistics ---

/// Counters for monitoring the gate.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GateStats {
    /// Store round trips started (first request for a user while none was in flight).
    pub loads: usize,
    /// Requests that joined a round trip already in flight.
    pub coalesced: usize,
    /// Default rows created because none existed.
    pub created: usize,
    /// Round trips that ended in an error (timeouts included).
    pub failed: usize,
}

// --- Gate ---

/// Answers "may this user receive this kind of notification?".
///
/// Preferences are read from the store on every question, never cached, so a
/// toggle takes effect on the next write. A missing row is created with
/// all-true defaults. Concurrent questions about the same user (a burst of
/// likes, say) share a single round trip.
#[derive(Clone)]
pub struct PreferenceGate {
    store: Arc<dyn MessageStore>,
    in_flight: Arc<Mutex<HashMap<UserId, SharedLoad>>>,
    db_timeout: Duration,
    stats: Arc<Mutex<GateStats>>,
}

impl PreferenceGate {
    pub fn new(store: Arc<dyn MessageStore>, db_timeout: Duration) -> Self {
        Self {
            store,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            db_timeout,
            stats: Arc::new(Mutex::new(GateStats::default())),
        }
    }

    /// Whether `kind` is enabled for `user_id`.
    pub async fn should_send(
        &self,
        user_id: UserId,
        kind: NotificationKind,
    ) -> Result<bool, Arc<Error>> {
        let prefs = self.load(user_id).await?;
        Ok(prefs.allows(kind.category()))
    }

    /// Loads, creating with defaults if absent, the preferences row for `user_id`.
    #[instrument(skip(self))]
    pub async fn load(&self, user_id: UserId) -> Result<Arc<NotificationPreferences>, Arc<Error>> {
        let shared = {
            let mut map = self.in_flight.lock().await;
            if let Some(existing) = map.get(&user_id) {
                debug!("Joining in-flight preference load");
                self.stats.lock().await.coalesced += 1;
                existing.clone()
            } else {
                self.stats.lock().await.loads += 1;

                let store = Arc::clone(&self.store);
                let in_flight = Arc::clone(&self.in_flight);
                let stats = Arc::clone(&self.stats);
                let db_timeout = self.db_timeout;

                let load = async move {
                    let result = fetch_or_create(store.as_ref(), user_id, db_timeout).await;

                    // Runs whether the load succeeded, failed or timed out.
                    in_flight.lock().await.remove(&user_id);

                    let mut stats = stats.lock().await;
                    let result = match result {
                        Ok((prefs, created)) => {
                            if created {
                                stats.created += 1;
                            }
                            Ok(Arc::new(prefs))
                        }
                        Err(e) => {
                            error!(user_id, "Preference load failed: {e:#}");
                            stats.failed += 1;
                            Err(Arc::new(e))
                        }
                    };
                    Arc::new(result)
                }
                .boxed()
                .shared();

                map.insert(user_id, load.clone());
                load
            }
        };

        match &*shared.await {
            Ok(prefs) => Ok(Arc::clone(prefs)),
            Err(e) => Err(Arc::clone(e)),
        }
    }

    pub async fn stats(&self) -> GateStats {
        self.stats.lock().await.clone()
    }

    /// Number of users whose preferences are being loaded right now.
    pub async fn pending(&self) -> usize {
        self.in_flight.lock().await.len()
    }
}

impl fmt::Debug for PreferenceGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreferenceGate")
            .field("db_timeout", &self.db_timeout)
            .finish_non_exhaustive()
    }
}

/// Returns the stored row, inserting defaults first if there is none. The
/// flag reports whether this call created the row.
async fn fetch_or_create(
    store: &dyn MessageStore,
    user_id: UserId,
    db_timeout: Duration,
) -> Result<(NotificationPreferences, bool), Error> {
    let existing: Option<NotificationPreferences> =
        bounded(db_timeout, store.preferences(user_id))
            .await
            .with_context(|| format!("reading preferences for user {user_id}"))?;
    if let Some(prefs) = existing {
        return Ok((prefs, false));
    }

    let created: Result<NotificationPreferences, StoreError> = bounded(
        db_timeout,
        store.insert_preferences(NotificationPreferences::defaults(user_id)),
    )
    .await;
    let created = created.with_context(|| format!("creating preferences for user {user_id}"))?;
    Ok((created, true))
}
