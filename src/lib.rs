//! # Pulse Hub
//!
//! A real-time presence and messaging hub on Axum WebSockets, plus an
//! asynchronous notification fan-out engine.
//!
//! ## Core Features
//!
//! - **[`Hub`](ws::pipeline::Hub)**: one live connection per user, a reader and
//!   a writer loop per connection, persisted one-to-one chat, ephemeral typing
//!   indicators.
//! - **Presence**: online/offline transitions are stored and broadcast to every
//!   other connected user.
//! - **Notifications**: domain events are resolved to recipients, gated by each
//!   recipient's preferences, and written by a bounded worker pool off the
//!   request path. [`NotificationInbox`](notify::NotificationInbox) serves them
//!   back.
//! - **Pluggable storage**: everything persistent goes through the
//!   [`MessageStore`](store::MessageStore) trait. An in-memory implementation
//!   ships for tests and demos.
//!
//! ## Getting Started
//!
//! See `demos/chat_hub.rs` for a runnable server wiring the hub, the fan-out
//! engine and the upgrade route together.

pub mod config;
pub mod error;
pub mod notify;
pub mod presence;
pub mod store;
pub mod typing;
pub mod ws;

#[cfg(feature = "auth")]
pub mod auth;

/// Public prelude for convenience.
///
/// `use pulse_hub::prelude::*;`
pub mod prelude {
    pub use crate::config::HubConfig;
    pub use crate::error::{ConfigError, FanoutError, StoreError};
    pub use crate::notify::{
        Category, DomainEvent, FanoutEngine, NotificationInbox, NotificationKind,
    };
    pub use crate::store::{EntityRef, MessageStore, UserId, memory::MemoryStore};
    pub use crate::ws::{
        pipeline::Hub,
        upgrade::{AuthenticatedUser, upgrade_handler},
    };

    #[cfg(feature = "auth")]
    pub use crate::auth::{SessionValidator, WsAuth};
}
