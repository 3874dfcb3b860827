//! Typing indicators: forwarded to the addressee if connected, otherwise dropped.

use crate::store::UserId;
use crate::ws::protocol::MessageFrame;
use crate::ws::registry::ConnectionRegistry;
use tracing::debug;

/// Relays a typing indicator from `sender_id` to `recipient_id`.
///
/// Never persisted, retried or acknowledged. Returns whether the frame was
/// queued for the recipient.
pub fn relay_typing(
    registry: &dyn ConnectionRegistry,
    sender_id: UserId,
    recipient_id: UserId,
    content: String,
) -> bool {
    let Some(recipient) = registry.lookup(recipient_id) else {
        debug!(sender_id, recipient_id, "Typing target offline, dropping");
        return false;
    };
    match recipient.try_enqueue(MessageFrame::typing(sender_id, recipient_id, content).into()) {
        Ok(()) => true,
        Err(reason) => {
            debug!(sender_id, recipient_id, ?reason, "Typing indicator dropped");
            false
        }
    }
}
