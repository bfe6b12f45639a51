//! Subscription manager for the shared venue WebSocket
//!
//! One connection per [`SubscriptionManager`], shared by every view that
//! subscribes through it. Local subscriptions are reference counted per
//! topic: the server sees one `SUBSCRIBE` when the first local handler is
//! added and one `UNSUBSCRIBE` when the last one is removed.
//!
//! The connection is opened lazily on the first subscription. On every
//! (re)connect the manager sends `AUTH` (when a bearer token is known) and
//! then replays the full topic set. Frames queued while disconnected are
//! discarded, never replayed; the topic table is the source of truth.
//! Disconnects are never surfaced as errors, only through
//! [`SubscriptionManager::is_connected`].

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use venue_core::{ClientFrame, ServerFrame, SyncError, SyncResult, Topic, UpdateEvent};

use crate::backoff::ReconnectState;
use crate::config::ClientConfig;

/// Callback invoked for each event on a subscribed topic
pub type EventHandler = Arc<dyn Fn(&Topic, &UpdateEvent) + Send + Sync>;

/// Identifies one local handler registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

impl std::fmt::Display for HandlerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "handler-{}", self.0)
    }
}

// ============================================================================
// Topic Registry
// ============================================================================

/// Reference-counted topic -> handlers table
///
/// Pure bookkeeping: it decides which frame (if any) a registration change
/// requires, the manager decides when to send it.
pub struct TopicRegistry {
    next_id: u64,
    topics: BTreeMap<Topic, Vec<(HandlerId, EventHandler)>>,
    admin_allowed: bool,
}

impl TopicRegistry {
    pub fn new(admin_allowed: bool) -> Self {
        Self {
            next_id: 1,
            topics: BTreeMap::new(),
            admin_allowed,
        }
    }

    /// Register a handler. Returns the `SUBSCRIBE` frame when this is the
    /// first handler for the topic.
    pub fn add(
        &mut self,
        topic: Topic,
        handler: EventHandler,
    ) -> SyncResult<(HandlerId, Option<ClientFrame>)> {
        if topic.requires_admin() && !self.admin_allowed {
            return Err(SyncError::auth(format!(
                "{} requires an admin credential",
                topic
            )));
        }

        let id = HandlerId(self.next_id);
        self.next_id += 1;

        let handlers = self.topics.entry(topic.clone()).or_default();
        let first = handlers.is_empty();
        handlers.push((id, handler));

        Ok((id, first.then_some(ClientFrame::Subscribe { topic })))
    }

    /// Remove a handler. Returns the `UNSUBSCRIBE` frame when it was the
    /// last handler for the topic.
    pub fn remove(&mut self, topic: &Topic, id: HandlerId) -> Option<ClientFrame> {
        let handlers = self.topics.get_mut(topic)?;
        let before = handlers.len();
        handlers.retain(|(handler_id, _)| *handler_id != id);
        if handlers.len() == before {
            return None;
        }

        if handlers.is_empty() {
            self.topics.remove(topic);
            Some(ClientFrame::Unsubscribe {
                topic: topic.clone(),
            })
        } else {
            None
        }
    }

    /// Handlers currently registered for a topic
    pub fn handlers(&self, topic: &Topic) -> Vec<EventHandler> {
        self.topics
            .get(topic)
            .map(|handlers| handlers.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default()
    }

    /// Number of local handlers for a topic
    pub fn ref_count(&self, topic: &Topic) -> usize {
        self.topics.get(topic).map(Vec::len).unwrap_or(0)
    }

    /// Topics with at least one local handler
    pub fn topics(&self) -> Vec<Topic> {
        self.topics.keys().cloned().collect()
    }

    /// One `SUBSCRIBE` per active topic
    pub fn replay_frames(&self) -> Vec<ClientFrame> {
        self.topics
            .keys()
            .map(|topic| ClientFrame::Subscribe {
                topic: topic.clone(),
            })
            .collect()
    }

    pub fn admin_allowed(&self) -> bool {
        self.admin_allowed
    }
}

impl std::fmt::Debug for TopicRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicRegistry")
            .field("topics", &self.topics.keys().collect::<Vec<_>>())
            .field("admin_allowed", &self.admin_allowed)
            .finish()
    }
}

// ============================================================================
// Subscription Manager
// ============================================================================

/// State shared between the manager handle and the connection task
struct Shared {
    registry: Mutex<TopicRegistry>,
    bearer_token: RwLock<Option<String>>,
    connected: watch::Sender<bool>,
}

impl Shared {
    fn set_connected(&self, connected: bool) {
        self.connected.send_if_modified(|current| {
            if *current == connected {
                false
            } else {
                *current = connected;
                true
            }
        });
    }

    /// Decode a text frame and hand it to every local handler of its topic.
    /// Handlers run outside the registry lock.
    fn dispatch(&self, text: &str) {
        let frame = match ServerFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("[Venue WS] Ignoring frame: {}", e);
                return;
            }
        };

        let Some(topic) = frame.topic else {
            debug!("[Venue WS] Control frame: {}", frame.event.event_type());
            return;
        };

        let handlers = self.registry.lock().handlers(&topic);
        if handlers.is_empty() {
            debug!("[Venue WS] No local handler for {}", topic);
            return;
        }

        for handler in handlers {
            handler(&topic, &frame.event);
        }
    }
}

struct ManagerInner {
    config: ClientConfig,
    shared: Arc<Shared>,
    outbound_tx: mpsc::UnboundedSender<ClientFrame>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<ClientFrame>>>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ManagerInner {
    fn remove(&self, topic: &Topic, id: HandlerId) {
        // Sent under the registry lock so frames leave in table order
        let mut registry = self.shared.registry.lock();
        if let Some(frame) = registry.remove(topic, id) {
            debug!("[Venue WS] Last handler for {} removed", topic);
            let _ = self.outbound_tx.send(frame);
        }
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

/// Owner of the shared socket and its topic table
#[derive(Clone)]
pub struct SubscriptionManager {
    inner: Arc<ManagerInner>,
}

impl SubscriptionManager {
    /// Create a manager. Nothing connects until the first subscription.
    pub fn new(config: ClientConfig) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        let (connected, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            registry: Mutex::new(TopicRegistry::new(config.credentials.has_admin())),
            bearer_token: RwLock::new(config.credentials.bearer_token.clone()),
            connected,
        });

        Self {
            inner: Arc::new(ManagerInner {
                config,
                shared,
                outbound_tx,
                outbound_rx: Mutex::new(Some(outbound_rx)),
                shutdown_tx,
                task: Mutex::new(None),
            }),
        }
    }

    /// Subscribe a handler to a topic.
    ///
    /// The admin topic is refused with [`SyncError::Auth`] unless an admin
    /// credential is configured; nothing is sent in that case.
    pub fn subscribe<F>(&self, topic: Topic, handler: F) -> SyncResult<Subscription>
    where
        F: Fn(&Topic, &UpdateEvent) + Send + Sync + 'static,
    {
        if topic.requires_admin() && !self.has_admin_credential() {
            return Err(SyncError::auth(format!(
                "{} requires an admin credential",
                topic
            )));
        }
        self.ensure_started()?;

        let id = {
            let mut registry = self.inner.shared.registry.lock();
            let (id, frame) = registry.add(topic.clone(), Arc::new(handler))?;
            if let Some(frame) = frame {
                debug!("[Venue WS] First handler for {}", topic);
                let _ = self.inner.outbound_tx.send(frame);
            }
            id
        };

        Ok(Subscription {
            manager: Arc::downgrade(&self.inner),
            topic,
            id,
            active: true,
        })
    }

    /// Whether the socket is currently open and authenticated
    pub fn is_connected(&self) -> bool {
        *self.inner.shared.connected.borrow()
    }

    /// Watch connection state changes
    pub fn connection_state(&self) -> watch::Receiver<bool> {
        self.inner.shared.connected.subscribe()
    }

    /// Whether the admin topic may be subscribed
    pub fn has_admin_credential(&self) -> bool {
        self.inner.shared.registry.lock().admin_allowed()
    }

    /// Store the bearer token and queue an `AUTH` frame.
    ///
    /// Holds the registry lock, as the handshake does while it reads the
    /// token and drains the queue, so a new token is never skipped.
    pub fn set_bearer_token(&self, token: impl Into<String>) {
        let token = token.into();
        let _registry = self.inner.shared.registry.lock();
        *self.inner.shared.bearer_token.write() = Some(token.clone());
        let _ = self.inner.outbound_tx.send(ClientFrame::Auth { token });
    }

    /// Number of local handlers for a topic
    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.inner.shared.registry.lock().ref_count(topic)
    }

    /// Topics with at least one local handler
    pub fn active_topics(&self) -> Vec<Topic> {
        self.inner.shared.registry.lock().topics()
    }

    /// Close the socket and stop reconnecting
    pub async fn shutdown(&self) {
        self.inner.shutdown_tx.send_replace(true);
        let task = self.inner.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.inner.shared.set_connected(false);
        info!("[Venue WS] Shut down");
    }

    fn ensure_started(&self) -> SyncResult<()> {
        let mut task = self.inner.task.lock();
        if task.is_some() {
            return Ok(());
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            SyncError::internal("subscription manager needs a running tokio runtime")
        })?;
        let outbound_rx = self
            .inner
            .outbound_rx
            .lock()
            .take()
            .ok_or_else(|| SyncError::connection("subscription manager was shut down"))?;

        let shared = Arc::clone(&self.inner.shared);
        let config = self.inner.config.clone();
        let shutdown_rx = self.inner.shutdown_tx.subscribe();

        *task = Some(runtime.spawn(async move {
            connection_loop(config, shared, outbound_rx, shutdown_rx).await;
        }));

        Ok(())
    }
}

impl std::fmt::Debug for SubscriptionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionManager")
            .field("ws_url", &self.inner.config.ws_url)
            .field("connected", &self.is_connected())
            .field("topics", &self.active_topics())
            .finish()
    }
}

/// RAII handle for one local subscription. Dropping it unsubscribes.
pub struct Subscription {
    manager: Weak<ManagerInner>,
    topic: Topic,
    id: HandlerId,
    active: bool,
}

impl Subscription {
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn id(&self) -> HandlerId {
        self.id
    }

    /// Remove this handler now
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !std::mem::replace(&mut self.active, false) {
            return;
        }
        if let Some(manager) = self.manager.upgrade() {
            manager.remove(&self.topic, self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("id", &self.id)
            .field("active", &self.active)
            .finish()
    }
}

// ============================================================================
// Connection Task
// ============================================================================

/// Why the inner read loop ended
enum LoopExit {
    Dropped,
    Shutdown,
}

/// Connect, authenticate, replay, pump frames; reconnect with backoff
async fn connection_loop(
    config: ClientConfig,
    shared: Arc<Shared>,
    mut outbound_rx: mpsc::UnboundedReceiver<ClientFrame>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut backoff = ReconnectState::default();

    loop {
        if *shutdown_rx.borrow() {
            return;
        }

        info!("[Venue WS] Connecting to {}", config.ws_url);

        match connect_async(config.ws_url.as_str()).await {
            Ok((ws_stream, _)) => {
                info!("[Venue WS] Connected");

                let (mut write, mut read) = ws_stream.split();

                // Drain stale frames and snapshot the table under one lock so
                // no subscribe/unsubscribe can slip between the two
                let mut handshake = Vec::new();
                {
                    let registry = shared.registry.lock();
                    while outbound_rx.try_recv().is_ok() {}
                    if let Some(token) = shared.bearer_token.read().clone() {
                        handshake.push(ClientFrame::Auth { token });
                    }
                    handshake.extend(registry.replay_frames());
                }

                let mut handshake_ok = true;
                for frame in handshake {
                    if let Err(e) = send_frame(&mut write, &frame).await {
                        warn!("[Venue WS] Handshake failed: {}", e);
                        handshake_ok = false;
                        break;
                    }
                }

                if handshake_ok {
                    backoff.reset();
                    shared.set_connected(true);

                    let mut ping_timer =
                        interval_at(Instant::now() + config.ping_interval, config.ping_interval);

                    let exit = loop {
                        tokio::select! {
                            _ = shutdown_rx.changed() => {
                                let _ = write.close().await;
                                break LoopExit::Shutdown;
                            }

                            msg = read.next() => {
                                match msg {
                                    Some(Ok(Message::Text(text))) => {
                                        shared.dispatch(text.as_str());
                                    }
                                    Some(Ok(Message::Ping(data))) => {
                                        if let Err(e) = write.send(Message::Pong(data)).await {
                                            warn!("[Venue WS] Failed to send pong: {}", e);
                                            break LoopExit::Dropped;
                                        }
                                    }
                                    Some(Ok(Message::Close(_))) => {
                                        info!("[Venue WS] Connection closed by server");
                                        break LoopExit::Dropped;
                                    }
                                    Some(Err(e)) => {
                                        warn!("[Venue WS] Read error: {}", e);
                                        break LoopExit::Dropped;
                                    }
                                    None => {
                                        info!("[Venue WS] Stream ended");
                                        break LoopExit::Dropped;
                                    }
                                    _ => {}
                                }
                            }

                            frame = outbound_rx.recv() => {
                                match frame {
                                    Some(frame) => {
                                        if let Err(e) = send_frame(&mut write, &frame).await {
                                            warn!("[Venue WS] Failed to send frame: {}", e);
                                            break LoopExit::Dropped;
                                        }
                                    }
                                    None => {
                                        let _ = write.close().await;
                                        break LoopExit::Shutdown;
                                    }
                                }
                            }

                            _ = ping_timer.tick() => {
                                if let Err(e) = write.send(Message::Ping(Default::default())).await {
                                    warn!("[Venue WS] Failed to send ping: {}", e);
                                    break LoopExit::Dropped;
                                }
                            }
                        }
                    };

                    shared.set_connected(false);
                    if let LoopExit::Shutdown = exit {
                        return;
                    }
                }
            }
            Err(e) => {
                warn!("[Venue WS] Connection failed: {}", e);
            }
        }

        let Some(delay) = backoff.next_delay(&config.reconnect) else {
            error!("[Venue WS] Max reconnect attempts reached");
            return;
        };
        info!(
            "[Venue WS] Reconnecting in {:?} (attempt {})",
            delay,
            backoff.attempt()
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown_rx.changed() => return,
        }
    }
}

async fn send_frame<S>(write: &mut S, frame: &ClientFrame) -> SyncResult<()>
where
    S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let json = frame.to_json()?;
    write
        .send(Message::Text(json.into()))
        .await
        .map_err(|e| SyncError::connection(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> EventHandler {
        Arc::new(|_: &Topic, _: &UpdateEvent| {})
    }

    #[test]
    fn test_first_add_and_last_remove_emit_frames() {
        let mut registry = TopicRegistry::new(false);
        let topic = Topic::market("1");

        let (card, frame) = registry.add(topic.clone(), noop()).unwrap();
        assert_eq!(
            frame,
            Some(ClientFrame::Subscribe {
                topic: topic.clone()
            })
        );

        let (detail, frame) = registry.add(topic.clone(), noop()).unwrap();
        assert_eq!(frame, None);
        assert_eq!(registry.ref_count(&topic), 2);

        assert_eq!(registry.remove(&topic, card), None);
        assert_eq!(registry.ref_count(&topic), 1);

        assert_eq!(
            registry.remove(&topic, detail),
            Some(ClientFrame::Unsubscribe {
                topic: topic.clone()
            })
        );
        assert!(registry.topics().is_empty());
    }

    #[test]
    fn test_removing_unknown_handler_is_a_no_op() {
        let mut registry = TopicRegistry::new(false);
        let topic = Topic::market("1");
        let (id, _) = registry.add(topic.clone(), noop()).unwrap();

        assert_eq!(registry.remove(&topic, HandlerId(999)), None);
        assert_eq!(registry.remove(&Topic::market("2"), id), None);
        assert_eq!(registry.ref_count(&topic), 1);
    }

    #[test]
    fn test_admin_topic_needs_credential() {
        let mut ordinary = TopicRegistry::new(false);
        let result = ordinary.add(Topic::AdminMarkets, noop());
        assert!(matches!(result, Err(SyncError::Auth(_))));
        assert!(ordinary.topics().is_empty());

        let mut admin = TopicRegistry::new(true);
        let (_, frame) = admin.add(Topic::AdminMarkets, noop()).unwrap();
        assert_eq!(
            frame,
            Some(ClientFrame::Subscribe {
                topic: Topic::AdminMarkets
            })
        );
    }

    #[test]
    fn test_replay_covers_every_topic_once() {
        let mut registry = TopicRegistry::new(true);
        registry.add(Topic::market("b"), noop()).unwrap();
        registry.add(Topic::market("a"), noop()).unwrap();
        registry.add(Topic::market("a"), noop()).unwrap();
        registry.add(Topic::AdminMarkets, noop()).unwrap();

        let frames = registry.replay_frames();
        assert_eq!(frames.len(), 3);
        assert!(frames.contains(&ClientFrame::Subscribe {
            topic: Topic::AdminMarkets
        }));
    }

    #[test]
    fn test_subscribe_outside_runtime_fails_cleanly() {
        let manager = SubscriptionManager::new(ClientConfig::default());
        let result = manager.subscribe(Topic::market("1"), |_, _| {});
        assert!(matches!(result, Err(SyncError::Internal(_))));
        assert_eq!(manager.subscriber_count(&Topic::market("1")), 0);
    }

    #[tokio::test]
    async fn test_admin_subscribe_refused_without_credential() {
        let manager = SubscriptionManager::new(ClientConfig::default());
        assert!(!manager.has_admin_credential());

        let result = manager.subscribe(Topic::AdminMarkets, |_, _| {});
        assert!(matches!(result, Err(SyncError::Auth(_))));
        assert!(manager.active_topics().is_empty());
        // Refused before any socket is opened
        assert!(manager.inner.task.lock().is_none());
    }

    #[tokio::test]
    async fn test_dropping_guard_unsubscribes() {
        let manager = SubscriptionManager::new(ClientConfig::default());
        let topic = Topic::market("7");

        let first = manager.subscribe(topic.clone(), |_, _| {}).unwrap();
        let second = manager.subscribe(topic.clone(), |_, _| {}).unwrap();
        assert_eq!(manager.subscriber_count(&topic), 2);

        drop(first);
        assert_eq!(manager.subscriber_count(&topic), 1);

        second.unsubscribe();
        assert_eq!(manager.subscriber_count(&topic), 0);
    }

    #[test]
    fn test_dispatch_reaches_every_handler_of_topic() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let (connected, _) = watch::channel(false);
        let shared = Shared {
            registry: Mutex::new(TopicRegistry::new(false)),
            bearer_token: RwLock::new(None),
            connected,
        };

        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let hits = Arc::clone(&hits);
            shared
                .registry
                .lock()
                .add(
                    Topic::market("1"),
                    Arc::new(move |_: &Topic, event: &UpdateEvent| {
                        assert_eq!(event, &UpdateEvent::NewOrder);
                        hits.fetch_add(1, Ordering::SeqCst);
                    }),
                )
                .unwrap();
        }

        shared.dispatch(r#"{"topic":"market:1","type":"NEW_ORDER"}"#);
        shared.dispatch(r#"{"topic":"market:2","type":"NEW_ORDER"}"#);
        shared.dispatch("not json");

        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
