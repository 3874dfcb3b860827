//! Notification fan-out: domain events in, preference-gated notification rows out.
//!
//! Producers call [`FanoutEngine::publish`] and move on. The engine works out
//! who should hear about the event ([`events`]), checks each recipient's
//! [`preferences`], and writes one row per recipient from a bounded worker
//! pool ([`engine`]). Users read their rows back through the [`inbox`].
//!
//! The engine never touches live connections. Notifications reach the UI on
//! its next poll.

pub mod engine;
pub mod events;
pub mod inbox;
pub mod kinds;
pub mod preferences;

pub use engine::{Delivery, FanoutEngine, FanoutStats};
pub use events::{DomainEvent, NotificationDraft};
pub use inbox::{NotificationInbox, NotificationView, UnreadSummary};
pub use kinds::{Category, NotificationKind};
pub use preferences::PreferenceGate;
