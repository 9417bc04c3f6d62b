use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parley_core::{ClientEvent, ConnectionId, ServerEvent};
use tokio::sync::mpsc;

use crate::sessions::Outbound;

/// A connected WebSocket client.
pub struct Client {
    pub id: ConnectionId,
    tx: mpsc::Sender<String>,
    connected: AtomicBool,
    last_pong: AtomicU64,
}

impl Client {
    fn new(id: ConnectionId, tx: mpsc::Sender<String>) -> Self {
        Self {
            id,
            tx,
            connected: AtomicBool::new(true),
            last_pong: AtomicU64::new(now_secs()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn record_pong(&self) {
        self.last_pong.store(now_secs(), Ordering::Relaxed);
    }

    pub fn is_alive(&self, timeout: Duration) -> bool {
        let last = self.last_pong.load(Ordering::Relaxed);
        now_secs().saturating_sub(last) < timeout.as_secs()
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Registry of all live WebSocket connections and their send queues.
///
/// This is transport bookkeeping only: which username owns a connection is
/// the session registry's business.
pub struct ClientRegistry {
    clients: DashMap<ConnectionId, Arc<Client>>,
    max_send_queue: usize,
    client_timeout: Duration,
}

impl ClientRegistry {
    pub fn new(max_send_queue: usize, client_timeout: Duration) -> Self {
        Self {
            clients: DashMap::new(),
            max_send_queue,
            client_timeout,
        }
    }

    /// Register a new connection and return its ID + outbound receiver.
    pub fn register(&self) -> (ConnectionId, mpsc::Receiver<String>) {
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        self.clients.insert(id.clone(), Arc::new(Client::new(id.clone(), tx)));
        (id, rx)
    }

    /// Remove a connection. Dropping its sender ends the writer half.
    pub fn unregister(&self, id: &ConnectionId) {
        if let Some((_, client)) = self.clients.remove(id) {
            client.connected.store(false, Ordering::Relaxed);
        }
    }

    /// Queue a frame for one connection. Never blocks; drops the frame if the queue is full.
    ///
    /// Callers may hold the session lock, so nothing here logs above debug.
    pub fn send_to(&self, id: &ConnectionId, frame: String) -> bool {
        let Some(client) = self.clients.get(id).map(|c| Arc::clone(c.value())) else {
            return false;
        };
        if !client.is_connected() {
            return false;
        }
        match client.tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(frame)) => {
                tracing::debug!(
                    connection_id = %id,
                    frame_len = frame.len(),
                    "Send queue full, dropping frame"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Drop every send queue. Each writer then closes its socket.
    pub fn close_all(&self) -> usize {
        let ids: Vec<ConnectionId> = self.clients.iter().map(|entry| entry.key().clone()).collect();
        for id in &ids {
            self.unregister(id);
        }
        ids.len()
    }

    pub fn record_pong(&self, id: &ConnectionId) {
        if let Some(client) = self.clients.get(id) {
            client.record_pong();
        }
    }

    /// Number of connected clients.
    pub fn count(&self) -> usize {
        self.clients.len()
    }

    /// Remove clients that haven't responded to pings within the timeout.
    pub fn cleanup_dead_clients(&self) -> usize {
        let dead: Vec<ConnectionId> = self
            .clients
            .iter()
            .filter(|entry| !entry.value().is_alive(self.client_timeout))
            .map(|entry| entry.key().clone())
            .collect();

        for id in &dead {
            self.unregister(id);
            tracing::info!(connection_id = %id, "Cleaned up dead client");
        }
        dead.len()
    }
}

impl Outbound for ClientRegistry {
    fn deliver(&self, to: &ConnectionId, event: &ServerEvent) -> bool {
        match event.to_frame() {
            Ok(frame) => self.send_to(to, frame),
            Err(e) => {
                tracing::debug!(event = event.name(), error = %e, "failed to serialize event");
                false
            }
        }
    }
}

/// Drive one WebSocket: a writer half drains the outbound queue and pings,
/// a reader half parses frames into the connection's inbound event channel.
///
/// Returns once either half stops. The connection is unregistered and the
/// inbound sender is dropped, which ends the connection's dispatch loop.
pub async fn handle_ws_connection(
    socket: WebSocket,
    connection_id: ConnectionId,
    mut rx: mpsc::Receiver<String>,
    registry: Arc<ClientRegistry>,
    inbound: mpsc::Sender<ClientEvent>,
    heartbeat_interval: Duration,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer_id = connection_id.clone();
    let mut writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(heartbeat_interval);
        ping_interval.tick().await; // consume first immediate tick

        loop {
            tokio::select! {
                frame = rx.recv() => {
                    match frame {
                        Some(text) => {
                            if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                    tracing::trace!(connection_id = %writer_id, "Sent ping");
                }
            }
        }
        let _ = ws_tx.send(WsMessage::Close(None)).await;
    });

    let reader_id = connection_id.clone();
    let reader_registry = Arc::clone(&registry);
    let mut reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Text(text) => match ClientEvent::from_frame(text.as_str()) {
                    Ok(event) => {
                        if inbound.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(connection_id = %reader_id, error = %e, "Dropping unparseable frame");
                    }
                },
                WsMessage::Pong(_) => reader_registry.record_pong(&reader_id),
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }

    registry.unregister(&connection_id);
}

/// Start a background task that periodically cleans up dead clients.
pub fn start_cleanup_task(
    registry: Arc<ClientRegistry>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let removed = registry.cleanup_dead_clients();
            if removed > 0 {
                tracing::info!(removed = removed, "Dead client cleanup");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(90);

    #[test]
    fn registry_register_and_unregister() {
        let registry = ClientRegistry::new(32, TIMEOUT);
        assert_eq!(registry.count(), 0);

        let (id1, _rx1) = registry.register();
        let (id2, _rx2) = registry.register();
        assert_ne!(id1, id2);
        assert_eq!(registry.count(), 2);

        registry.unregister(&id1);
        assert_eq!(registry.count(), 1);
        registry.unregister(&id2);
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn send_to_specific_client() {
        let registry = ClientRegistry::new(32, TIMEOUT);
        let (id, mut rx) = registry.register();

        assert!(registry.send_to(&id, "frame".into()));
        assert_eq!(rx.recv().await.unwrap(), "frame");
    }

    #[test]
    fn send_to_unknown_client_fails() {
        let registry = ClientRegistry::new(32, TIMEOUT);
        assert!(!registry.send_to(&ConnectionId::new(), "frame".into()));
    }

    #[test]
    fn send_to_full_queue_drops() {
        let registry = ClientRegistry::new(2, TIMEOUT);
        let (id, _rx) = registry.register();

        assert!(registry.send_to(&id, "one".into()));
        assert!(registry.send_to(&id, "two".into()));
        assert!(!registry.send_to(&id, "three".into()));
    }

    #[tokio::test]
    async fn close_all_ends_every_queue() {
        let registry = ClientRegistry::new(8, TIMEOUT);
        let (_a, mut rx_a) = registry.register();
        let (_b, mut rx_b) = registry.register();

        assert_eq!(registry.close_all(), 2);
        assert_eq!(registry.count(), 0);
        assert!(rx_a.recv().await.is_none());
        assert!(rx_b.recv().await.is_none());
    }

    /// Counts events at WARN or above.
    #[derive(Clone, Default)]
    struct WarnCounter(Arc<std::sync::atomic::AtomicUsize>);

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for WarnCounter {
        fn on_event(&self, event: &tracing::Event<'_>, _: tracing_subscriber::layer::Context<'_, S>) {
            if *event.metadata().level() <= tracing::Level::WARN {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    #[test]
    fn dropped_frames_stay_below_persisted_levels() {
        use tracing_subscriber::layer::SubscriberExt;

        let warnings = WarnCounter::default();
        let subscriber = tracing_subscriber::registry().with(warnings.clone());
        tracing::subscriber::with_default(subscriber, || {
            let registry = ClientRegistry::new(1, TIMEOUT);
            let (id, _rx) = registry.register();
            assert!(registry.deliver(&id, &ServerEvent::UserOnline("bob".into())));
            assert!(!registry.deliver(&id, &ServerEvent::UserOnline("carol".into())));
        });
        assert_eq!(warnings.0.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn deliver_serializes_event_frames() {
        let registry = ClientRegistry::new(8, TIMEOUT);
        let (id, mut rx) = registry.register();

        assert!(registry.deliver(&id, &ServerEvent::UserOnline("bob".into())));
        let frame = rx.try_recv().unwrap();
        assert_eq!(
            ServerEvent::from_frame(&frame).unwrap(),
            ServerEvent::UserOnline("bob".into())
        );
    }

    #[test]
    fn unregister_closes_outbound_queue() {
        let registry = ClientRegistry::new(8, TIMEOUT);
        let (id, mut rx) = registry.register();
        registry.unregister(&id);
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn cleanup_dead_clients_removes_expired() {
        let registry = ClientRegistry::new(32, TIMEOUT);
        let (id, _rx) = registry.register();
        let (_live, _rx2) = registry.register();

        registry.clients.get(&id).unwrap().last_pong.store(0, Ordering::Relaxed);

        assert_eq!(registry.cleanup_dead_clients(), 1);
        assert_eq!(registry.count(), 1);
        assert!(!registry.send_to(&id, "late".into()));
    }

    #[test]
    fn pong_keeps_client_alive() {
        let registry = ClientRegistry::new(32, TIMEOUT);
        let (id, _rx) = registry.register();
        registry.clients.get(&id).unwrap().last_pong.store(0, Ordering::Relaxed);
        registry.record_pong(&id);
        assert_eq!(registry.cleanup_dead_clients(), 0);
    }
}
