//! The notification fan-out engine.
//!
//! ```text
//! publish(event) ──spawn──▶ resolve recipients (one store query)
//!                                 │
//!                       one job per recipient
//!                                 │
//!                    bounded job queue (backpressure)
//!                                 │
//!              N workers: preference gate ─▶ actor lookup ─▶ insert row
//! ```
//!
//! Callers never wait for, or see the errors of, a fan-out. Failures are
//! logged and counted. Nothing is retried.

use crate::config::HubConfig;
use crate::error::{ConfigError, FanoutError, bounded};
use crate::notify::events::{self, DomainEvent, NotificationDraft, ResolveCtx};
use crate::notify::preferences::PreferenceGate;
use crate::store::{MessageStore, NewNotification, NotificationId};
use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify, mpsc};
use tracing::{Instrument, debug, error, info, info_span, warn};

/// Outcome of a single notification write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Written(NotificationId),
    /// The recipient has this category turned off; nothing was written.
    Suppressed,
}

/// A snapshot of the engine's counters.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FanoutStats {
    pub events_published: usize,
    pub jobs_queued: usize,
    pub written: usize,
    pub suppressed: usize,
    pub failed: usize,
    /// Jobs refused because the queue was full or closed.
    pub rejected: usize,
    /// Jobs queued but not yet picked up by a worker.
    pub backlog: usize,
}

#[derive(Default)]
struct Counters {
    events_published: AtomicUsize,
    jobs_queued: AtomicUsize,
    written: AtomicUsize,
    suppressed: AtomicUsize,
    failed: AtomicUsize,
    rejected: AtomicUsize,
}

/// State shared between the engine handle and its workers. Workers hold this,
/// not the job sender, so dropping every engine handle shuts the pool down.
struct Core {
    store: Arc<dyn MessageStore>,
    gate: PreferenceGate,
    db_timeout: Duration,
    counters: Counters,
    outstanding: AtomicUsize,
    idle: Notify,
}

impl Core {
    fn begin(&self) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
    }

    fn finish(&self) {
        if self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    /// Writes one notification row, unless the recipient opted out of the category.
    async fn write(&self, draft: &NotificationDraft) -> Result<Delivery, FanoutError> {
        let allowed = self
            .gate
            .should_send(draft.recipient_id, draft.kind)
            .await
            .map_err(|e| FanoutError::Preferences(format!("{e:#}")))?;
        if !allowed {
            return Ok(Delivery::Suppressed);
        }

        // Actor display fields are resolved at write time, not at publish time.
        let actor = match draft.actor_id {
            Some(actor_id) => bounded(self.db_timeout, self.store.user_profile(actor_id)).await?,
            None => None,
        };

        let row = NewNotification {
            user_id: draft.recipient_id,
            kind: draft.kind,
            title: draft.title.clone(),
            message: draft.message.clone(),
            entity: draft.entity,
            actor_id: draft.actor_id,
            actor_username: actor.as_ref().map(|a| a.username.clone()),
            actor_profile_ref: actor.and_then(|a| a.profile_ref),
            created_at: Utc::now(),
        };
        let id = bounded(self.db_timeout, self.store.insert_notification(row)).await?;
        Ok(Delivery::Written(id))
    }
}

/// Handle on the fan-out engine. Cheap to clone.
#[derive(Clone)]
pub struct FanoutEngine {
    core: Arc<Core>,
    jobs: mpsc::Sender<NotificationDraft>,
}

impl FanoutEngine {
    /// Creates the engine and spawns its worker pool on the current runtime.
    ///
    /// Fails without spawning anything if `config` has a zero queue capacity
    /// or worker count.
    pub fn start(store: Arc<dyn MessageStore>, config: &HubConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let db_timeout = config.db_timeout();
        let core = Arc::new(Core {
            gate: PreferenceGate::new(Arc::clone(&store), db_timeout),
            store,
            db_timeout,
            counters: Counters::default(),
            outstanding: AtomicUsize::new(0),
            idle: Notify::new(),
        });

        let (jobs, rx) = mpsc::channel(config.fanout_queue_capacity);
        let rx = Arc::new(Mutex::new(rx));
        info!(workers = config.fanout_workers, "Spawning notification workers...");
        for worker in 0..config.fanout_workers {
            let core = Arc::clone(&core);
            let rx = Arc::clone(&rx);
            tokio::spawn(
                run_worker(core, rx).instrument(info_span!("notification_worker", worker)),
            );
        }

        Ok(Self { core, jobs })
    }

    /// Fans `event` out in the background. Returns immediately.
    pub fn publish(&self, event: DomainEvent) {
        self.core
            .counters
            .events_published
            .fetch_add(1, Ordering::Relaxed);
        self.core.begin();
        let engine = self.clone();
        tokio::spawn(async move {
            engine.fan_out(event).await;
            engine.core.finish();
        });
    }

    async fn fan_out(&self, event: DomainEvent) {
        let ctx = ResolveCtx {
            store: self.core.store.as_ref(),
            db_timeout: self.core.db_timeout,
        };
        let drafts = match events::resolve(ctx, &event).await {
            Ok(drafts) => drafts,
            Err(e) => {
                error!(?event, "Failed to resolve notification recipients: {e}");
                return;
            }
        };
        debug!(?event, recipients = drafts.len(), "Resolved notification recipients");

        for draft in drafts {
            self.core.begin();
            // Waits for queue space; only this background task is held up.
            match self.jobs.send(draft).await {
                Ok(()) => {
                    self.core.counters.jobs_queued.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => {
                    self.core.counters.rejected.fetch_add(1, Ordering::Relaxed);
                    self.core.finish();
                    warn!("Notification queue closed during fan-out");
                    return;
                }
            }
        }
    }

    /// Queues a single notification without waiting. A full queue rejects it.
    pub fn notify(&self, draft: NotificationDraft) -> Result<(), FanoutError> {
        self.core.begin();
        match self.jobs.try_send(draft) {
            Ok(()) => {
                self.core.counters.jobs_queued.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.core.counters.rejected.fetch_add(1, Ordering::Relaxed);
                self.core.finish();
                match e {
                    mpsc::error::TrySendError::Full(draft) => {
                        warn!(recipient = draft.recipient_id, "Notification queue full, rejecting");
                        Err(FanoutError::QueueFull)
                    }
                    mpsc::error::TrySendError::Closed(_) => Err(FanoutError::QueueClosed),
                }
            }
        }
    }

    /// Writes one notification inline, bypassing the queue.
    pub async fn create_notification(
        &self,
        draft: NotificationDraft,
    ) -> Result<Delivery, FanoutError> {
        self.core.write(&draft).await
    }

    /// The gate consulted before every write.
    pub fn preferences(&self) -> &PreferenceGate {
        &self.core.gate
    }

    pub fn backlog(&self) -> usize {
        self.jobs.max_capacity() - self.jobs.capacity()
    }

    pub fn stats(&self) -> FanoutStats {
        let c = &self.core.counters;
        FanoutStats {
            events_published: c.events_published.load(Ordering::Relaxed),
            jobs_queued: c.jobs_queued.load(Ordering::Relaxed),
            written: c.written.load(Ordering::Relaxed),
            suppressed: c.suppressed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            backlog: self.backlog(),
        }
    }

    /// Resolves once every published event has been resolved and every queued
    /// job has been processed.
    pub async fn idle(&self) {
        loop {
            let notified = self.core.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.core.outstanding.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl fmt::Debug for FanoutEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FanoutEngine")
            .field("stats", &self.stats())
            .finish()
    }
}

async fn run_worker(core: Arc<Core>, rx: Arc<Mutex<mpsc::Receiver<NotificationDraft>>>) {
    loop {
        let next = rx.lock().await.recv().await;
        let Some(draft) = next else {
            debug!("Notification queue closed, worker exiting");
            return;
        };

        match core.write(&draft).await {
            Ok(Delivery::Written(id)) => {
                core.counters.written.fetch_add(1, Ordering::Relaxed);
                debug!(id, recipient = draft.recipient_id, kind = %draft.kind, "Notification written");
            }
            Ok(Delivery::Suppressed) => {
                core.counters.suppressed.fetch_add(1, Ordering::Relaxed);
                debug!(recipient = draft.recipient_id, kind = %draft.kind, "Notification suppressed by preferences");
            }
            Err(e) => {
                core.counters.failed.fetch_add(1, Ordering::Relaxed);
                error!(recipient = draft.recipient_id, kind = %draft.kind, "Failed to create notification: {e}");
            }
        }
        core.finish();
    }
}
