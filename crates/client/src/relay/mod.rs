// Real-time relay: connection manager for the server event stream.
//
// Owns at most one live connection, tracks its state, keeps the current
// viewer count, and fans every decoded event out to registered listeners
// and to a broadcast channel for consumers that only want a stream.
//
// Each connection cycle runs on one spawned task, so the open / message /
// error / close reactions for a connection never run concurrently and
// listeners see events in transport order.

mod backoff;
mod handlers;
pub mod transport;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use checkin_common::protocol::events::InboundEvent;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, trace, warn};
use url::Url;

pub use backoff::ReconnectPolicy;
pub use handlers::HandlerHandle;
pub use transport::{Frame, RelayConnection, RelayTransport, WsConnection, WsTransport};

use handlers::HandlerRegistry;

const EVENT_BUFFER_SIZE: usize = 256;

// ── Configuration ───────────────────────────────────────────────────

/// Connection parameters for the relay.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Event stream endpoint (e.g. "wss://checkin.example.com/ws/crud01/").
    pub ws_url: Url,
    /// Real-time features are skipped entirely when false.
    pub enabled: bool,
    /// Upper bound for one open attempt.
    pub connect_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl RelayConfig {
    pub fn new(ws_url: Url) -> Self {
        Self {
            ws_url,
            enabled: true,
            connect_timeout: Duration::from_secs(10),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

// ── Connection state ────────────────────────────────────────────────

/// Current state of the relay connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

// ── Relay ───────────────────────────────────────────────────────────

/// Manages the event stream connection lifecycle.
///
/// Dropping the relay disconnects it.
pub struct RealtimeRelay<T: RelayTransport> {
    shared: Arc<Shared<T>>,
}

struct Shared<T: RelayTransport> {
    config: RelayConfig,
    transport: T,
    state_tx: watch::Sender<ConnectionState>,
    viewer_tx: watch::Sender<u64>,
    events_tx: broadcast::Sender<InboundEvent>,
    handlers: HandlerRegistry,
    connection: Mutex<Option<ConnectionHandle>>,
    next_epoch: AtomicU64,
}

/// The live connection task. Dropping it tells the task to stop.
struct ConnectionHandle {
    epoch: u64,
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl<T: RelayTransport> RealtimeRelay<T> {
    pub fn new(config: RelayConfig, transport: T) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (viewer_tx, _) = watch::channel(0);
        let (events_tx, _) = broadcast::channel(EVENT_BUFFER_SIZE);
        Self {
            shared: Arc::new(Shared {
                config,
                transport,
                state_tx,
                viewer_tx,
                events_tx,
                handlers: HandlerRegistry::default(),
                connection: Mutex::new(None),
                next_epoch: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.shared.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Latest count from a `viewer_count` event (0 until one arrives).
    pub fn viewer_count(&self) -> u64 {
        *self.shared.viewer_tx.borrow()
    }

    pub fn watch_viewer_count(&self) -> watch::Receiver<u64> {
        self.shared.viewer_tx.subscribe()
    }

    /// Whether a connection task exists (connecting, connected, or waiting
    /// to reconnect).
    pub fn has_connection(&self) -> bool {
        self.shared.lock_connection().is_some()
    }

    /// Stream of every decoded event, published after the listeners ran.
    pub fn subscribe(&self) -> broadcast::Receiver<InboundEvent> {
        self.shared.events_tx.subscribe()
    }

    /// Register a listener. It receives every decoded event, synchronously
    /// and in registration order, until the returned handle is dropped.
    pub fn register_handler<F>(&self, handler: F) -> HandlerHandle
    where
        F: Fn(&InboundEvent) + Send + Sync + 'static,
    {
        self.shared.handlers.register(handler)
    }

    pub fn handler_count(&self) -> usize {
        self.shared.handlers.len()
    }

    /// Open the event stream.
    ///
    /// No-op when real-time features are disabled or a connection is
    /// already connecting or connected. Called while a reconnect is
    /// pending, it skips the remaining backoff and connects now.
    pub fn connect(&self) {
        let shared = &self.shared;
        if !shared.config.enabled {
            info!(ws_url = %shared.config.ws_url, "real-time relay disabled by configuration");
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            error!("relay connect called outside of a tokio runtime");
            return;
        };

        let mut slot = shared.lock_connection();
        if slot.is_some() && *shared.state_tx.borrow() != ConnectionState::Disconnected {
            debug!("relay connection already active");
            return;
        }
        if slot.take().is_some() {
            debug!("cancelling pending reconnect");
        }

        let epoch = shared.next_epoch.fetch_add(1, Ordering::Relaxed);
        let (stop_tx, stop_rx) = watch::channel(false);
        shared.set_state(ConnectionState::Connecting);
        let task = runtime.spawn(run_connection(Arc::clone(shared), epoch, stop_rx));
        *slot = Some(ConnectionHandle { epoch, stop_tx, task });
        info!(ws_url = %shared.config.ws_url, epoch, "relay connecting");
    }

    /// Close the event stream without waiting for the server.
    pub fn disconnect(&self) {
        if let Some(handle) = self.shared.release_any() {
            info!(epoch = handle.epoch, "relay disconnected by client");
            handle.stop();
        }
    }

    /// Disconnect and wait until the connection task has closed the socket.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.shared.release_any() {
            let _ = handle.stop_tx.send(true);
            if let Err(error) = handle.task.await {
                warn!(%error, "relay connection task ended abnormally");
            }
        }
    }
}

impl<T: RelayTransport> Drop for RealtimeRelay<T> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl ConnectionHandle {
    fn stop(self) {
        let _ = self.stop_tx.send(true);
    }
}

impl<T: RelayTransport> Shared<T> {
    fn lock_connection(&self) -> MutexGuard<'_, Option<ConnectionHandle>> {
        self.connection.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            debug!(from = ?*current, to = ?state, "relay state change");
            *current = state;
            true
        });
    }

    /// Apply a state change on behalf of the task for `epoch`; ignored once
    /// that task no longer owns the connection slot.
    fn transition(&self, epoch: u64, state: ConnectionState) -> bool {
        let slot = self.lock_connection();
        if slot.as_ref().map(|handle| handle.epoch) != Some(epoch) {
            return false;
        }
        self.set_state(state);
        true
    }

    /// Give up the connection slot if `epoch` still owns it.
    fn release(&self, epoch: u64) {
        let mut slot = self.lock_connection();
        if slot.as_ref().map(|handle| handle.epoch) == Some(epoch) {
            slot.take();
            self.set_state(ConnectionState::Disconnected);
        }
    }

    fn release_any(&self) -> Option<ConnectionHandle> {
        let mut slot = self.lock_connection();
        let handle = slot.take();
        if handle.is_some() {
            self.set_state(ConnectionState::Disconnected);
        }
        handle
    }

    fn on_open(&self, epoch: u64) {
        if self.transition(epoch, ConnectionState::Connected) {
            info!(ws_url = %self.config.ws_url, epoch, "relay connected");
        }
    }

    fn on_message(&self, frame: Frame) {
        let event = match frame.decode() {
            Ok(event) => event,
            Err(error) => {
                warn!(%error, "dropping undecodable relay frame");
                return;
            }
        };

        if let Some(count) = event.count() {
            self.viewer_tx.send_replace(count);
        }

        let failed = self.handlers.dispatch(&event);
        if failed > 0 {
            debug!(failed, kind = ?event.kind(), "some relay listeners failed");
        }

        if self.events_tx.send(event).is_err() {
            trace!("no broadcast subscribers for relay event");
        }
    }

    fn on_error(&self, error: &anyhow::Error) {
        warn!(error = %format!("{error:#}"), "relay transport error");
    }

    fn on_close(&self, epoch: u64) {
        if self.transition(epoch, ConnectionState::Disconnected) {
            info!(epoch, "relay connection closed");
        }
    }
}

enum PumpExit {
    ClosedByServer,
    Stopped,
}

async fn run_connection<T: RelayTransport>(
    shared: Arc<Shared<T>>,
    epoch: u64,
    mut stop_rx: watch::Receiver<bool>,
) {
    let policy = shared.config.reconnect.clone();
    let mut consecutive_failures: u32 = 0;

    loop {
        shared.transition(epoch, ConnectionState::Connecting);

        let opened = tokio::select! {
            biased;
            _ = stop_rx.changed() => return,
            opened = timeout(shared.config.connect_timeout, shared.transport.open(&shared.config.ws_url)) => opened,
        };

        match opened {
            Ok(Ok(mut connection)) => {
                consecutive_failures = 0;
                shared.on_open(epoch);
                match pump(&shared, &mut connection, &mut stop_rx).await {
                    PumpExit::Stopped => {
                        connection.close().await;
                        return;
                    }
                    PumpExit::ClosedByServer => shared.on_close(epoch),
                }
            }
            Ok(Err(error)) => {
                shared.on_error(&error);
                shared.on_close(epoch);
            }
            Err(_) => {
                warn!(
                    timeout_ms = shared.config.connect_timeout.as_millis() as u64,
                    "relay connect attempt timed out"
                );
                shared.on_close(epoch);
            }
        }

        consecutive_failures = consecutive_failures.saturating_add(1);
        if !policy.should_retry(consecutive_failures) {
            shared.release(epoch);
            return;
        }

        let delay = policy.delay_for(consecutive_failures);
        info!(delay_ms = delay.as_millis() as u64, attempt = consecutive_failures, "relay reconnect scheduled");
        tokio::select! {
            biased;
            _ = stop_rx.changed() => return,
            _ = sleep(delay) => {}
        }
    }
}

async fn pump<T: RelayTransport>(
    shared: &Shared<T>,
    connection: &mut T::Connection,
    stop_rx: &mut watch::Receiver<bool>,
) -> PumpExit {
    loop {
        tokio::select! {
            biased;
            _ = stop_rx.changed() => return PumpExit::Stopped,
            frame = connection.next_frame() => match frame {
                Some(Ok(frame)) => shared.on_message(frame),
                Some(Err(error)) => shared.on_error(&error),
                None => return PumpExit::ClosedByServer,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Result};
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use tokio::sync::mpsc;

    // ── Mock transport ──────────────────────────────────────────────

    enum Script {
        Accept(mpsc::UnboundedReceiver<PeerFrame>, Arc<AtomicBool>),
        Fail(String),
        Hang,
    }

    enum PeerFrame {
        Frame(Frame),
        Error(String),
    }

    #[derive(Clone, Default)]
    struct MockTransport {
        scripts: Arc<Mutex<VecDeque<Script>>>,
        opens: Arc<AtomicUsize>,
    }

    impl MockTransport {
        fn accept_next(&self) -> MockPeer {
            let (tx, rx) = mpsc::unbounded_channel();
            let closed = Arc::new(AtomicBool::new(false));
            self.scripts.lock().unwrap().push_back(Script::Accept(rx, Arc::clone(&closed)));
            MockPeer { tx: Some(tx), closed_by_client: closed }
        }

        fn fail_next(&self, reason: &str) {
            self.scripts.lock().unwrap().push_back(Script::Fail(reason.to_string()));
        }

        fn hang_next(&self) {
            self.scripts.lock().unwrap().push_back(Script::Hang);
        }

        fn opens(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }
    }

    struct MockConnection {
        rx: mpsc::UnboundedReceiver<PeerFrame>,
        closed_by_client: Arc<AtomicBool>,
    }

    impl RelayTransport for MockTransport {
        type Connection = MockConnection;

        async fn open(&self, _url: &Url) -> Result<MockConnection> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let script = self.scripts.lock().unwrap().pop_front();
            match script {
                Some(Script::Accept(rx, closed_by_client)) => Ok(MockConnection { rx, closed_by_client }),
                Some(Script::Fail(reason)) => Err(anyhow!(reason)),
                Some(Script::Hang) => std::future::pending().await,
                None => Err(anyhow!("no connection scripted")),
            }
        }
    }

    impl RelayConnection for MockConnection {
        async fn next_frame(&mut self) -> Option<Result<Frame>> {
            match self.rx.recv().await? {
                PeerFrame::Frame(frame) => Some(Ok(frame)),
                PeerFrame::Error(reason) => Some(Err(anyhow!(reason))),
            }
        }

        async fn close(&mut self) {
            self.closed_by_client.store(true, Ordering::SeqCst);
        }
    }

    /// Server side of a scripted connection.
    struct MockPeer {
        tx: Option<mpsc::UnboundedSender<PeerFrame>>,
        closed_by_client: Arc<AtomicBool>,
    }

    impl MockPeer {
        fn send_json(&self, value: serde_json::Value) {
            self.send_raw(&value.to_string());
        }

        fn send_raw(&self, text: &str) {
            let tx = self.tx.as_ref().expect("peer already closed");
            tx.send(PeerFrame::Frame(Frame::Text(text.to_string()))).expect("connection gone");
        }

        fn send_error(&self, reason: &str) {
            let tx = self.tx.as_ref().expect("peer already closed");
            tx.send(PeerFrame::Error(reason.to_string())).expect("connection gone");
        }

        fn close(&mut self) {
            self.tx.take();
        }

        fn closed_by_client(&self) -> bool {
            self.closed_by_client.load(Ordering::SeqCst)
        }
    }

    fn test_config() -> RelayConfig {
        RelayConfig {
            ws_url: Url::parse("ws://relay.test/ws/crud01/").unwrap(),
            enabled: true,
            connect_timeout: Duration::from_secs(2),
            reconnect: ReconnectPolicy::disabled(),
        }
    }

    fn relay_with(config: RelayConfig) -> (RealtimeRelay<MockTransport>, MockTransport) {
        let transport = MockTransport::default();
        (RealtimeRelay::new(config, transport.clone()), transport)
    }

    async fn wait_for_state(relay: &RealtimeRelay<MockTransport>, target: ConnectionState) {
        let mut rx = relay.watch_state();
        timeout(Duration::from_secs(2), rx.wait_for(|state| *state == target))
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {target:?}"))
            .expect("state channel closed");
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        timeout(Duration::from_secs(2), async {
            while !condition() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    /// Listener that forwards every event into a channel.
    fn channel_listener(
        relay: &RealtimeRelay<MockTransport>,
    ) -> (HandlerHandle, mpsc::UnboundedReceiver<InboundEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = relay.register_handler(move |event: &InboundEvent| {
            let _ = tx.send(event.clone());
        });
        (handle, rx)
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<InboundEvent>) -> InboundEvent {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("listener channel closed")
    }

    // ── Connection lifecycle ────────────────────────────────────────

    #[tokio::test]
    async fn connect_happy_path() {
        let (relay, transport) = relay_with(test_config());
        let _peer = transport.accept_next();
        assert_eq!(relay.state(), ConnectionState::Disconnected);

        relay.connect();
        assert_eq!(relay.state(), ConnectionState::Connecting);

        wait_for_state(&relay, ConnectionState::Connected).await;
        assert!(relay.is_connected());
        assert!(relay.has_connection());
    }

    #[tokio::test]
    async fn connect_twice_opens_one_connection() {
        let (relay, transport) = relay_with(test_config());
        let _peer = transport.accept_next();
        let _spare = transport.accept_next();

        relay.connect();
        relay.connect();
        wait_for_state(&relay, ConnectionState::Connected).await;
        relay.connect();

        sleep(Duration::from_millis(20)).await;
        assert_eq!(transport.opens(), 1);
        assert!(relay.is_connected());
    }

    #[tokio::test]
    async fn disabled_flag_skips_connection() {
        let mut config = test_config();
        config.enabled = false;
        let (relay, transport) = relay_with(config);
        let _peer = transport.accept_next();

        relay.connect();
        sleep(Duration::from_millis(20)).await;

        assert_eq!(relay.state(), ConnectionState::Disconnected);
        assert!(!relay.has_connection());
        assert_eq!(transport.opens(), 0);
    }

    #[tokio::test]
    async fn server_close_sets_disconnected_and_allows_new_connect() {
        let (relay, transport) = relay_with(test_config());
        let mut peer = transport.accept_next();

        relay.connect();
        wait_for_state(&relay, ConnectionState::Connected).await;

        peer.close();
        wait_for_state(&relay, ConnectionState::Disconnected).await;
        wait_until(|| !relay.has_connection()).await;

        let _second = transport.accept_next();
        relay.connect();
        wait_for_state(&relay, ConnectionState::Connected).await;
        assert_eq!(transport.opens(), 2);
    }

    #[tokio::test]
    async fn transport_error_alone_keeps_connection() {
        let (relay, transport) = relay_with(test_config());
        let mut peer = transport.accept_next();
        let (_handle, mut events) = channel_listener(&relay);

        relay.connect();
        wait_for_state(&relay, ConnectionState::Connected).await;

        peer.send_error("connection reset");
        peer.send_json(json!({ "type": "viewer_count", "count": 2 }));
        assert_eq!(next_event(&mut events).await, InboundEvent::viewer_count(2));
        assert_eq!(relay.state(), ConnectionState::Connected);

        peer.close();
        wait_for_state(&relay, ConnectionState::Disconnected).await;
    }

    #[tokio::test]
    async fn failed_open_ends_disconnected() {
        let (relay, transport) = relay_with(test_config());
        transport.fail_next("connection refused");

        relay.connect();
        wait_until(|| !relay.has_connection()).await;
        assert_eq!(relay.state(), ConnectionState::Disconnected);
        assert_eq!(transport.opens(), 1);
    }

    #[tokio::test]
    async fn hung_open_times_out() {
        let mut config = test_config();
        config.connect_timeout = Duration::from_millis(50);
        let (relay, transport) = relay_with(config);
        transport.hang_next();

        relay.connect();
        assert_eq!(relay.state(), ConnectionState::Connecting);
        wait_until(|| !relay.has_connection()).await;
        assert_eq!(relay.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn disconnect_is_immediate_and_closes_socket() {
        let (relay, transport) = relay_with(test_config());
        let peer = transport.accept_next();

        relay.connect();
        wait_for_state(&relay, ConnectionState::Connected).await;

        relay.shutdown().await;
        assert_eq!(relay.state(), ConnectionState::Disconnected);
        assert!(!relay.has_connection());
        assert!(peer.closed_by_client());
    }

    #[tokio::test]
    async fn disconnect_when_idle_is_noop() {
        let (relay, _transport) = relay_with(test_config());
        relay.disconnect();
        assert_eq!(relay.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn disconnect_does_not_wait_for_server() {
        let (relay, transport) = relay_with(test_config());
        let _peer = transport.accept_next();

        relay.connect();
        relay.disconnect();
        assert_eq!(relay.state(), ConnectionState::Disconnected);
        assert!(!relay.has_connection());

        sleep(Duration::from_millis(20)).await;
        assert_eq!(relay.state(), ConnectionState::Disconnected);
    }

    // ── Message handling ────────────────────────────────────────────

    #[tokio::test]
    async fn viewer_count_event_updates_count_and_reaches_listeners() {
        let (relay, transport) = relay_with(test_config());
        let peer = transport.accept_next();
        let (_first, mut first_rx) = channel_listener(&relay);
        let (_second, mut second_rx) = channel_listener(&relay);

        relay.connect();
        wait_for_state(&relay, ConnectionState::Connected).await;

        peer.send_json(json!({ "type": "viewer_count", "count": 42 }));
        let expected = InboundEvent::viewer_count(42);
        assert_eq!(next_event(&mut first_rx).await, expected);
        assert_eq!(next_event(&mut second_rx).await, expected);
        assert_eq!(relay.viewer_count(), 42);
    }

    #[tokio::test]
    async fn viewer_count_listeners_get_the_whole_record() {
        let (relay, transport) = relay_with(test_config());
        let peer = transport.accept_next();
        let (_handle, mut events) = channel_listener(&relay);
        let mut broadcast_rx = relay.subscribe();

        relay.connect();
        wait_for_state(&relay, ConnectionState::Connected).await;

        let raw = json!({ "type": "viewer_count", "count": 3, "room": "crud01" });
        peer.send_json(raw.clone());

        assert_eq!(next_event(&mut events).await.to_value(), raw);
        assert_eq!(broadcast_rx.recv().await.unwrap().to_value(), raw);
        assert_eq!(relay.viewer_count(), 3);
    }

    #[tokio::test]
    async fn viewer_count_is_replaced_not_accumulated() {
        let (relay, transport) = relay_with(test_config());
        let peer = transport.accept_next();
        let (_handle, mut events) = channel_listener(&relay);

        relay.connect();
        wait_for_state(&relay, ConnectionState::Connected).await;

        peer.send_json(json!({ "type": "viewer_count", "count": 5 }));
        peer.send_json(json!({ "type": "viewer_count", "count": 3 }));
        next_event(&mut events).await;
        next_event(&mut events).await;
        assert_eq!(relay.viewer_count(), 3);
    }

    #[tokio::test]
    async fn unrecognized_event_reaches_listeners_and_broadcast() {
        let (relay, transport) = relay_with(test_config());
        let peer = transport.accept_next();
        let (_handle, mut events) = channel_listener(&relay);
        let mut broadcast_rx = relay.subscribe();

        relay.connect();
        wait_for_state(&relay, ConnectionState::Connected).await;

        peer.send_json(json!({ "type": "viewer_count", "count": 7 }));
        next_event(&mut events).await;

        let raw = json!({ "action": "stats", "data": { "total": 120, "checked_in": 80 } });
        peer.send_json(raw.clone());

        let delivered = next_event(&mut events).await;
        assert_eq!(delivered, InboundEvent::Unrecognized(raw.clone()));
        assert_eq!(relay.viewer_count(), 7);

        let first = broadcast_rx.recv().await.unwrap();
        assert_eq!(first, InboundEvent::viewer_count(7));
        let second = broadcast_rx.recv().await.unwrap();
        assert_eq!(second.to_value(), raw);
    }

    #[tokio::test]
    async fn malformed_frame_is_dropped_without_closing() {
        let (relay, transport) = relay_with(test_config());
        let peer = transport.accept_next();
        let (_handle, mut events) = channel_listener(&relay);

        relay.connect();
        wait_for_state(&relay, ConnectionState::Connected).await;

        peer.send_raw("{this is not json");
        peer.send_json(json!({ "type": "viewer_count" }));
        peer.send_json(json!({ "type": "viewer_count", "count": 11 }));

        assert_eq!(next_event(&mut events).await, InboundEvent::viewer_count(11));
        assert_eq!(relay.state(), ConnectionState::Connected);
        assert_eq!(relay.viewer_count(), 11);
    }

    #[tokio::test]
    async fn panicking_listener_does_not_block_later_listeners_or_broadcast() {
        let (relay, transport) = relay_with(test_config());
        let peer = transport.accept_next();
        let _boom = relay.register_handler(|_event: &InboundEvent| panic!("listener bug"));
        let (_after, mut after_rx) = channel_listener(&relay);
        let mut broadcast_rx = relay.subscribe();

        relay.connect();
        wait_for_state(&relay, ConnectionState::Connected).await;

        peer.send_json(json!({ "type": "seat_update", "seat": "B7" }));
        assert_eq!(next_event(&mut after_rx).await.kind(), Some("seat_update"));
        assert_eq!(broadcast_rx.recv().await.unwrap().kind(), Some("seat_update"));
        assert!(relay.is_connected());
    }

    #[tokio::test]
    async fn dropped_handle_stops_delivery() {
        let (relay, transport) = relay_with(test_config());
        let peer = transport.accept_next();
        let (gone, mut gone_rx) = channel_listener(&relay);
        let (_kept, mut kept_rx) = channel_listener(&relay);
        assert_eq!(relay.handler_count(), 2);

        drop(gone);
        assert_eq!(relay.handler_count(), 1);

        relay.connect();
        wait_for_state(&relay, ConnectionState::Connected).await;
        peer.send_json(json!({ "type": "viewer_count", "count": 1 }));

        next_event(&mut kept_rx).await;
        assert!(gone_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn events_arrive_in_transport_order() {
        let (relay, transport) = relay_with(test_config());
        let peer = transport.accept_next();
        let (_handle, mut events) = channel_listener(&relay);

        relay.connect();
        wait_for_state(&relay, ConnectionState::Connected).await;

        for count in 1..=20 {
            peer.send_json(json!({ "type": "viewer_count", "count": count }));
        }
        for count in 1..=20 {
            assert_eq!(next_event(&mut events).await, InboundEvent::viewer_count(count));
        }
    }

    // ── Reconnection ────────────────────────────────────────────────

    #[tokio::test]
    async fn reconnects_after_server_close() {
        let mut config = test_config();
        config.reconnect = ReconnectPolicy {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            max_attempts: u32::MAX,
        };
        let (relay, transport) = relay_with(config);
        let mut first = transport.accept_next();
        let second = transport.accept_next();
        let (_handle, mut events) = channel_listener(&relay);

        relay.connect();
        wait_for_state(&relay, ConnectionState::Connected).await;

        first.close();
        wait_until(|| transport.opens() == 2).await;
        wait_for_state(&relay, ConnectionState::Connected).await;

        second.send_json(json!({ "type": "viewer_count", "count": 4 }));
        assert_eq!(next_event(&mut events).await, InboundEvent::viewer_count(4));
    }

    #[tokio::test]
    async fn stops_after_max_attempts() {
        let mut config = test_config();
        config.reconnect = ReconnectPolicy {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(5),
            max_attempts: 2,
        };
        let (relay, transport) = relay_with(config);
        transport.fail_next("refused");
        transport.fail_next("refused");
        let _unused = transport.accept_next();

        relay.connect();
        wait_until(|| !relay.has_connection()).await;
        sleep(Duration::from_millis(30)).await;

        assert_eq!(transport.opens(), 2);
        assert_eq!(relay.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn connect_during_backoff_reconnects_immediately() {
        let mut config = test_config();
        config.reconnect = ReconnectPolicy {
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60),
            max_attempts: u32::MAX,
        };
        let (relay, transport) = relay_with(config);
        let mut first = transport.accept_next();

        relay.connect();
        wait_for_state(&relay, ConnectionState::Connected).await;

        first.close();
        wait_for_state(&relay, ConnectionState::Disconnected).await;
        assert!(relay.has_connection(), "reconnect should be pending");

        let _second = transport.accept_next();
        relay.connect();
        wait_for_state(&relay, ConnectionState::Connected).await;
        assert_eq!(transport.opens(), 2);
    }

    #[tokio::test]
    async fn disconnect_cancels_pending_reconnect() {
        let mut config = test_config();
        config.reconnect = ReconnectPolicy {
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(20),
            max_attempts: u32::MAX,
        };
        let (relay, transport) = relay_with(config);
        let mut first = transport.accept_next();
        let _second = transport.accept_next();

        relay.connect();
        wait_for_state(&relay, ConnectionState::Connected).await;
        first.close();
        wait_for_state(&relay, ConnectionState::Disconnected).await;

        relay.disconnect();
        sleep(Duration::from_millis(60)).await;
        assert_eq!(transport.opens(), 1);
        assert_eq!(relay.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn connect_outside_runtime_is_logged_not_fatal() {
        let (relay, transport) = relay_with(test_config());
        relay.connect();
        assert_eq!(relay.state(), ConnectionState::Disconnected);
        assert_eq!(transport.opens(), 0);
    }
}
