//! The [`Hub`]: connection lifecycle and the per-connection read/write pipeline.
//!
//! Each connection runs two loops that only talk through its bounded outbound
//! queue:
//!
//! - the **reader** decodes client frames, persists chat messages and queues
//!   them for the sender (echo) and the recipient, and relays typing
//!   indicators;
//! - the **writer** drains the queue onto the socket, one write per frame.
//!
//! Teardown (unregister, mark offline, broadcast, close) runs exactly once,
//! when the reader loop exits, whichever side failed first.

use crate::config::HubConfig;
use crate::error::{ConfigError, StoreError, bounded};
use crate::notify::{DomainEvent, FanoutEngine};
use crate::presence::PresenceTracker;
use crate::store::{ChatMessage, MessageStore, MessageType, NewMessage, UserId};
use crate::typing::relay_typing;
use crate::ws::protocol::{InboundFrame, MessageFrame, OutboundFrame};
use crate::ws::registry::{ConnectionRegistry, LocalRegistry};
use crate::ws::types::{ClientHandle, ConnectionId};
use axum::extract::ws::{Message, Utf8Bytes, WebSocket};
use chrono::Utc;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::{self, Display};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

/// How long teardown waits for the writer to flush queued frames before
/// aborting it.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Owns the registry and everything a connection needs to process frames.
pub struct Hub {
    registry: Arc<dyn ConnectionRegistry>,
    store: Arc<dyn MessageStore>,
    presence: PresenceTracker,
    notifications: Option<FanoutEngine>,
    config: HubConfig,
}

impl Hub {
    /// Creates a hub with a fresh process-local registry.
    pub fn new(store: Arc<dyn MessageStore>, config: HubConfig) -> Result<Self, ConfigError> {
        Self::with_registry(store, Arc::new(LocalRegistry::new()), config)
    }

    /// Creates a hub around an existing registry implementation. Rejects a
    /// config that fails [`HubConfig::validate`].
    pub fn with_registry(
        store: Arc<dyn MessageStore>,
        registry: Arc<dyn ConnectionRegistry>,
        config: HubConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let presence =
            PresenceTracker::new(Arc::clone(&store), Arc::clone(&registry), config.db_timeout());
        Ok(Self {
            registry,
            store,
            presence,
            notifications: None,
            config,
        })
    }

    /// Publishes a `MessageSent` event for every persisted chat message.
    pub fn with_notifications(mut self, engine: FanoutEngine) -> Self {
        self.notifications = Some(engine);
        self
    }

    pub fn registry(&self) -> &Arc<dyn ConnectionRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.registry.lookup(user_id).is_some()
    }

    pub fn online_users(&self) -> Vec<UserId> {
        self.registry.online_users()
    }

    /// Entry point for an upgraded socket.
    pub async fn handle_socket(self: Arc<Self>, socket: WebSocket, user_id: UserId) {
        let (sink, stream) = socket.split();
        self.run_connection(user_id, stream, sink).await;
    }

    /// Runs a connection to completion over any frame stream and sink.
    ///
    /// Registers the connection, records the online transition, runs the
    /// reader loop on this task and the writer loop on a spawned one, and
    /// tears everything down when the reader stops.
    #[instrument(skip_all, fields(conn_id, user_id = %user_id))]
    pub async fn run_connection<St, Si, E>(self: Arc<Self>, user_id: UserId, mut stream: St, sink: Si)
    where
        St: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
        E: Display,
        Si: Sink<Message> + Unpin + Send + 'static,
        Si::Error: Display,
    {
        let (handle, rx) = ClientHandle::channel(user_id, self.config.outbound_queue_capacity);
        tracing::Span::current().record("conn_id", tracing::field::display(handle.conn_id));

        let session = Session::open(Arc::clone(&self), handle.clone());
        if let Err(e) = self.presence.went_online(user_id).await {
            warn!("Failed to record online transition: {e}");
        }
        info!("Client connected.");

        let mut writer = tokio::spawn(run_writer(sink, rx));
        let mut writer_done = false;

        loop {
            tokio::select! {
                inbound = stream.next() => match inbound {
                    Some(Ok(Message::Text(text))) => match InboundFrame::decode(text.as_str()) {
                        Ok(frame) => {
                            debug!(message = ?frame, "Received frame from client");
                            self.handle_frame(&handle, frame).await;
                        }
                        Err(e) => {
                            warn!("Failed to decode frame, closing connection: {e}");
                            break;
                        }
                    },
                    Some(Ok(Message::Close(_))) => {
                        debug!("Received close frame from client.");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Read failed, closing connection: {e}");
                        break;
                    }
                    None => {
                        debug!("Client stream ended.");
                        break;
                    }
                },
                _ = &mut writer => {
                    writer_done = true;
                    debug!("Writer stopped, closing connection.");
                    break;
                }
            }
        }

        session.close().await;

        // Dropping the last local sender lets the writer drain and close the sink.
        drop(handle);
        if !writer_done && tokio::time::timeout(CLOSE_GRACE, &mut writer).await.is_err() {
            warn!("Writer did not finish in time, aborting.");
            writer.abort();
        }
        info!("Client disconnected.");
    }

    /// Dispatches one decoded frame from `origin`.
    pub async fn handle_frame(&self, origin: &ClientHandle, frame: InboundFrame) {
        match frame.message_type {
            MessageType::Typing => {
                relay_typing(
                    self.registry.as_ref(),
                    origin.user_id,
                    frame.recipient_id,
                    frame.content,
                );
            }
            MessageType::Chat => {
                if let Err(e) = self
                    .deliver_chat(origin, frame.recipient_id, frame.content)
                    .await
                {
                    error!(recipient_id = frame.recipient_id, "Failed to persist chat message: {e}");
                }
            }
        }
    }

    /// Persists a chat message from `origin` and queues it for both parties.
    ///
    /// Returns `Ok(None)` when the message is rejected (no recipient or empty
    /// content). The sender id always comes from `origin`, never the client.
    /// Persistence completes before any queueing, so both parties see a pair's
    /// messages in `created_at` order.
    pub async fn deliver_chat(
        &self,
        origin: &ClientHandle,
        recipient_id: UserId,
        content: String,
    ) -> Result<Option<ChatMessage>, StoreError> {
        if recipient_id == 0 || content.is_empty() {
            debug!(recipient_id, "Dropping chat frame with no recipient or content");
            return Ok(None);
        }

        let stored = bounded(
            self.config.db_timeout(),
            self.store.insert_message(NewMessage {
                sender_id: origin.user_id,
                recipient_id,
                content,
                created_at: Utc::now(),
            }),
        )
        .await?;

        let frame = OutboundFrame::from(MessageFrame::from(stored.clone()));
        if let Err(reason) = origin.try_enqueue(frame.clone()) {
            warn!(?reason, "Could not echo chat message to sender");
        }
        if recipient_id != origin.user_id {
            match self.registry.lookup(recipient_id) {
                Some(recipient) => {
                    if let Err(reason) = recipient.try_enqueue(frame) {
                        warn!(recipient_id, ?reason, "Could not queue chat message for recipient");
                    }
                }
                None => debug!(recipient_id, "Recipient offline; message kept for history"),
            }
        }

        if let Some(engine) = &self.notifications {
            engine.publish(DomainEvent::MessageSent {
                message_id: stored.id,
                sender_id: stored.sender_id,
                recipient_id: stored.recipient_id,
                content: stored.content.clone(),
            });
        }
        Ok(Some(stored))
    }

    /// The most recent messages between `user_id` and `peer`, oldest first.
    pub async fn conversation(
        &self,
        user_id: UserId,
        peer: UserId,
        limit: Option<usize>,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let limit = limit.unwrap_or(self.config.history_limit);
        bounded(
            self.config.db_timeout(),
            self.store.conversation(user_id, peer, limit),
        )
        .await
    }

    /// Marks everything `peer` sent to `reader` as read.
    pub async fn mark_conversation_read(
        &self,
        reader: UserId,
        peer: UserId,
    ) -> Result<u64, StoreError> {
        bounded(
            self.config.db_timeout(),
            self.store.mark_conversation_read(reader, peer, Utc::now()),
        )
        .await
    }

    /// Unregisters the connection and, unless it had already been replaced,
    /// records and broadcasts the offline transition.
    async fn teardown(&self, user_id: UserId, conn_id: ConnectionId) {
        if !self.registry.unregister(user_id, conn_id) {
            debug!(user_id, %conn_id, "Connection was replaced; leaving presence as is");
            return;
        }
        if let Err(e) = self.presence.went_offline(user_id).await {
            warn!(user_id, "Failed to record offline transition: {e}");
        }
    }
}

impl fmt::Debug for Hub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hub")
            .field("online", &self.registry.snapshot().len())
            .field("notifications", &self.notifications.is_some())
            .field("config", &self.config)
            .finish()
    }
}

/// A connection's registry entry, held for the lifetime of its reader loop.
///
/// [`Session::close`] runs teardown. If the reader future is dropped before
/// that (cancellation, panic), `Drop` runs the same teardown on the runtime,
/// so it happens exactly once either way.
struct Session {
    hub: Arc<Hub>,
    user_id: UserId,
    conn_id: ConnectionId,
    open: bool,
}

impl Session {
    fn open(hub: Arc<Hub>, handle: ClientHandle) -> Self {
        let user_id = handle.user_id;
        let conn_id = handle.conn_id;
        hub.registry.register(user_id, handle);
        Self {
            hub,
            user_id,
            conn_id,
            open: true,
        }
    }

    async fn close(mut self) {
        self.open = false;
        self.hub.teardown(self.user_id, self.conn_id).await;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.open {
            return;
        }
        let (user_id, conn_id) = (self.user_id, self.conn_id);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let hub = Arc::clone(&self.hub);
                runtime.spawn(async move { hub.teardown(user_id, conn_id).await });
            }
            Err(_) => {
                self.hub.registry.unregister(user_id, conn_id);
            }
        }
    }
}

/// Drains the outbound queue onto `sink`. Stops on the first failed write, or
/// once every sender is gone, and closes the sink either way.
async fn run_writer<Si>(mut sink: Si, mut rx: mpsc::Receiver<OutboundFrame>)
where
    Si: Sink<Message> + Unpin,
    Si::Error: Display,
{
    while let Some(frame) = rx.recv().await {
        let text = match frame.encode() {
            Ok(text) => text,
            Err(e) => {
                error!("Failed to serialize outbound frame: {e}");
                continue;
            }
        };
        if let Err(e) = sink.send(Message::Text(Utf8Bytes::from(text))).await {
            warn!("Write failed, closing connection: {e}");
            break;
        }
    }
    rx.close();
    if let Err(e) = sink.close().await {
        debug!("Sink close failed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NotificationKind;
    use crate::store::memory::MemoryStore;
    use futures::channel::mpsc as fmpsc;
    use once_cell::sync::Lazy;
    use serde_json::{Value, json};

    static TRACING: Lazy<()> = Lazy::new(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    });

    type Inbound = fmpsc::UnboundedSender<Result<Message, std::io::Error>>;
    type Outbound = fmpsc::UnboundedReceiver<Message>;

    /// A connection driven through in-memory channels instead of a socket.
    struct FakeClient {
        input: Inbound,
        output: Outbound,
        task: tokio::task::JoinHandle<()>,
    }

    impl FakeClient {
        fn send(&self, value: Value) {
            self.input
                .unbounded_send(Ok(Message::Text(value.to_string().into())))
                .unwrap();
        }

        fn send_raw(&self, text: &str) {
            self.input
                .unbounded_send(Ok(Message::Text(text.to_string().into())))
                .unwrap();
        }

        /// Next frame whose JSON matches `pred`, skipping everything else.
        async fn next_matching(&mut self, pred: impl Fn(&Value) -> bool) -> Value {
            let deadline = Duration::from_secs(2);
            tokio::time::timeout(deadline, async {
                loop {
                    match self.output.next().await {
                        Some(Message::Text(text)) => {
                            let value: Value = serde_json::from_str(text.as_str()).unwrap();
                            if pred(&value) {
                                return value;
                            }
                        }
                        Some(_) => {}
                        None => panic!("connection closed while waiting for a frame"),
                    }
                }
            })
            .await
            .expect("timed out waiting for frame")
        }
    }

    fn connect(hub: &Arc<Hub>, user_id: UserId) -> FakeClient {
        let (input, stream) = fmpsc::unbounded();
        let (sink, output) = fmpsc::unbounded();
        let task = tokio::spawn(Arc::clone(hub).run_connection(user_id, stream, sink));
        FakeClient {
            input,
            output,
            task,
        }
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition never became true");
    }

    async fn hub_with_users(ids: &[UserId]) -> (Arc<MemoryStore>, Arc<Hub>) {
        Lazy::force(&TRACING);
        let store = Arc::new(MemoryStore::new());
        for id in ids {
            store.add_user(*id, &format!("user{id}")).await;
        }
        let hub = Arc::new(Hub::new(store.clone(), HubConfig::default()).unwrap());
        (store, hub)
    }

    fn is_chat(v: &Value) -> bool {
        v["message_type"] == "chat"
    }

    fn is_status(user_id: UserId, online: bool) -> impl Fn(&Value) -> bool {
        move |v| v["type"] == "status_update" && v["user_id"] == user_id && v["is_online"] == online
    }

    #[tokio::test]
    async fn chat_between_online_users_is_persisted_echoed_and_delivered() {
        let (store, hub) = hub_with_users(&[1, 2]).await;
        let mut a = connect(&hub, 1);
        let mut b = connect(&hub, 2);
        wait_until(|| hub.is_online(1) && hub.is_online(2)).await;

        // A client-supplied sender id is ignored.
        a.send(json!({"message_type": "chat", "sender_id": 99, "recipient_id": 2, "content": "hi"}));

        let delivered = b.next_matching(is_chat).await;
        assert_eq!(delivered["sender_id"], 1);
        assert_eq!(delivered["recipient_id"], 2);
        assert_eq!(delivered["content"], "hi");
        assert!(delivered["created_at"].is_string());

        let echoed = a.next_matching(is_chat).await;
        assert_eq!(echoed["id"], delivered["id"]);

        let history = store.conversation(2, 1, 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].sender_id, 1);
        assert_eq!(history[0].content, "hi");
    }

    #[tokio::test]
    async fn presence_is_broadcast_to_peers_on_connect_and_disconnect() {
        let (store, hub) = hub_with_users(&[1, 2]).await;
        let mut b = connect(&hub, 2);
        wait_until(|| hub.is_online(2)).await;

        let a = connect(&hub, 1);
        let online = b.next_matching(is_status(1, true)).await;
        assert_eq!(online["username"], "user1");

        drop(a.input);
        a.task.await.unwrap();
        let offline = b.next_matching(is_status(1, false)).await;
        let profile = store.user_profile(1).await.unwrap().unwrap();
        assert!(!profile.is_online);
        assert_eq!(offline["last_seen"], profile.last_seen.unwrap().to_rfc3339());
        assert!(!hub.is_online(1));
    }

    #[tokio::test]
    async fn typing_is_relayed_but_never_persisted() {
        let (store, hub) = hub_with_users(&[1, 2]).await;
        let a = connect(&hub, 1);
        let mut b = connect(&hub, 2);
        wait_until(|| hub.is_online(1) && hub.is_online(2)).await;

        a.send(json!({"message_type": "typing", "recipient_id": 2, "content": ""}));
        let typing = b.next_matching(|v| v["message_type"] == "typing").await;
        assert_eq!(typing["sender_id"], 1);
        assert!(store.conversation(1, 2, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn undecodable_frame_tears_the_connection_down() {
        let (store, hub) = hub_with_users(&[1]).await;
        let a = connect(&hub, 1);
        wait_until(|| hub.is_online(1)).await;

        a.send_raw("{not json");
        a.task.await.unwrap();
        assert!(!hub.is_online(1));
        assert!(!store.user_profile(1).await.unwrap().unwrap().is_online);
    }

    #[tokio::test]
    async fn failed_write_tears_the_connection_down() {
        let (_store, hub) = hub_with_users(&[1, 2]).await;
        let a = connect(&hub, 1);
        wait_until(|| hub.is_online(1)).await;
        drop(a.output);

        // B coming online pushes a status frame at A, whose sink is gone.
        let _b = connect(&hub, 2);
        a.task.await.unwrap();
        assert!(!hub.is_online(1));
        assert!(hub.is_online(2));
    }

    #[tokio::test]
    async fn replaced_connection_teardown_keeps_the_new_one_online() {
        let (store, hub) = hub_with_users(&[1]).await;
        let old = connect(&hub, 1);
        wait_until(|| hub.is_online(1)).await;
        let first_conn = hub.registry().lookup(1).unwrap().conn_id;

        let _new = connect(&hub, 1);
        wait_until(|| hub.registry().lookup(1).map(|h| h.conn_id) != Some(first_conn)).await;

        drop(old.input);
        old.task.await.unwrap();
        assert!(hub.is_online(1));
        assert!(store.user_profile(1).await.unwrap().unwrap().is_online);
    }

    #[tokio::test]
    async fn rejected_chat_input_is_dropped_silently() {
        let (store, hub) = hub_with_users(&[1, 2]).await;
        let (origin, mut rx) = ClientHandle::channel(1, 8);

        assert!(hub.deliver_chat(&origin, 0, "hi".into()).await.unwrap().is_none());
        assert!(hub.deliver_chat(&origin, 2, String::new()).await.unwrap().is_none());
        assert!(rx.try_recv().is_err());
        assert!(store.conversation(1, 2, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn offline_recipient_still_gets_the_message_in_history() {
        let (_store, hub) = hub_with_users(&[1, 2]).await;
        let (origin, mut rx) = ClientHandle::channel(1, 8);

        let stored = hub
            .deliver_chat(&origin, 2, "later".into())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(rx.try_recv(), Ok(OutboundFrame::Message(f)) if f.id == Some(stored.id)));

        let history = hub.conversation(2, 1, None).await.unwrap();
        assert_eq!(history, vec![stored]);
        assert_eq!(hub.mark_conversation_read(2, 1).await.unwrap(), 1);
        assert!(hub.conversation(1, 2, None).await.unwrap()[0].read_at.is_some());
    }

    #[tokio::test]
    async fn pair_history_is_in_created_at_order() {
        let (_store, hub) = hub_with_users(&[1, 2]).await;
        let (a, _rx_a) = ClientHandle::channel(1, 64);
        let (b, _rx_b) = ClientHandle::channel(2, 64);

        for i in 0..20 {
            let origin = if i % 3 == 0 { &b } else { &a };
            let peer = if origin.user_id == 1 { 2 } else { 1 };
            hub.deliver_chat(origin, peer, format!("m{i}")).await.unwrap();
        }

        let history = hub.conversation(1, 2, Some(100)).await.unwrap();
        assert_eq!(history.len(), 20);
        assert!(history.windows(2).all(|w| w[0].created_at <= w[1].created_at));
        let contents: Vec<_> = history.iter().map(|m| m.content.clone()).collect();
        let expected: Vec<_> = (0..20).map(|i| format!("m{i}")).collect();
        assert_eq!(contents, expected);
    }

    #[tokio::test]
    async fn chat_messages_publish_a_notification_for_the_recipient() {
        let (store, _) = hub_with_users(&[1, 2]).await;
        let engine = FanoutEngine::start(store.clone(), &HubConfig::default()).unwrap();
        let hub = Hub::new(store.clone(), HubConfig::default())
            .unwrap()
            .with_notifications(engine.clone());
        let (origin, _rx) = ClientHandle::channel(1, 8);

        hub.deliver_chat(&origin, 2, "ping".into()).await.unwrap();
        engine.idle().await;

        let rows = store.all_notifications().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].user_id, 2);
        assert_eq!(rows[0].kind, NotificationKind::Message);
        assert_eq!(rows[0].actor_username.as_deref(), Some("user1"));
    }

    #[tokio::test]
    async fn zero_outbound_queue_is_refused_up_front() {
        let store = Arc::new(MemoryStore::new());
        let config = HubConfig {
            outbound_queue_capacity: 0,
            ..HubConfig::default()
        };
        assert!(matches!(
            Hub::new(store.clone(), config),
            Err(ConfigError::Zero("outbound_queue_capacity"))
        ));

        let parsed: HubConfig =
            serde_json::from_str(r#"{"outbound_queue_capacity": 0}"#).unwrap();
        assert!(Hub::new(store, parsed).is_err());
    }
}
