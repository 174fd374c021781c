//! # Push Channel
//!
//! The single WebSocket connection carrying server push events, shared by
//! every hook through reference-counted topic subscriptions.
//!
//! ## Connection Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Push Channel States                                │
//! │                                                                         │
//! │  ┌────────────┐  first topic   ┌────────────┐                           │
//! │  │Disconnected│ ─────────────► │ Connecting │ ◄───────────┐             │
//! │  └────────────┘                └─────┬──────┘             │             │
//! │        ▲                   success   │   failure          │             │
//! │        │                       ┌─────┴──────┐             │             │
//! │        │                       ▼            ▼             │ timer       │
//! │        │               ┌────────────┐  ┌────────────┐     │ expired     │
//! │        │               │ Connected  │  │Disconnected│     │             │
//! │        │               └─────┬──────┘  └─────┬──────┘     │             │
//! │        │                     │ closed        │ topics     │             │
//! │        │                     ▼               │ remain     │             │
//! │        │               ┌────────────┐        ▼            │             │
//! │        │               │Disconnected│──► ┌────────────┐   │             │
//! │        │               └────────────┘    │Reconnecting│ ──┘             │
//! │        │                                 └────────────┘                 │
//! │        └──────────── last topic released (from any state)               │
//! │                                                                         │
//! │  Handshake: token from ws_token_endpoint (no session → AuthRequired,    │
//! │  counted as a failed attempt), then Subscribe(all registered topics).   │
//! │  Success resets the backoff.                                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Events are published on a `broadcast` queue; the reconciler and any
//! store that wants raw events subscribe independently.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use orbit_core::{PushEvent, Topic};

use crate::auth::TokenProvider;
use crate::config::ChannelSettings;
use crate::error::{SyncError, SyncResult};
use crate::protocol::{ClientMessage, ControlMessage, ServerFrame};
use crate::transport::{Connection, Connector, ReconnectBackoff};

// =============================================================================
// Channel State
// =============================================================================

/// Connection state of the push channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Waiting out the backoff delay before the next attempt.
    Reconnecting,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelState::Disconnected => write!(f, "disconnected"),
            ChannelState::Connecting => write!(f, "connecting"),
            ChannelState::Connected => write!(f, "connected"),
            ChannelState::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

// =============================================================================
// Internal State
// =============================================================================

enum Control {
    Subscribe(Topic),
    Unsubscribe(Topic),
}

/// The running supervisor task.
struct Link {
    task: JoinHandle<()>,
    control: mpsc::UnboundedSender<Control>,
}

struct Shared {
    target: Url,
    tokens: Arc<dyn TokenProvider>,
    topics: HashMap<Topic, usize>,
    link: Option<Link>,
    closed: bool,
}

struct ChannelInner {
    settings: ChannelSettings,
    connector: Arc<dyn Connector>,
    state_tx: watch::Sender<ChannelState>,
    events_tx: broadcast::Sender<PushEvent>,
    /// Bumped on every teardown; a supervisor from an older generation no
    /// longer publishes state or events.
    generation: AtomicU64,
    shared: Mutex<Shared>,
}

impl ChannelInner {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn set_state(&self, generation: u64, state: ChannelState) {
        if self.is_current(generation) {
            self.state_tx.send_replace(state);
        }
    }

    fn active_topics(&self) -> Vec<Topic> {
        let mut topics: Vec<Topic> = self.lock().topics.keys().cloned().collect();
        topics.sort();
        topics
    }
}

// =============================================================================
// Push Channel
// =============================================================================

/// Handle to the push channel. Cloning shares the connection.
#[derive(Clone)]
pub struct PushChannel {
    inner: Arc<ChannelInner>,
}

impl PushChannel {
    pub fn new(
        settings: ChannelSettings,
        connector: Arc<dyn Connector>,
        target: Url,
        tokens: Arc<dyn TokenProvider>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ChannelState::Disconnected);
        let (events_tx, _) = broadcast::channel(settings.event_buffer.max(1));
        PushChannel {
            inner: Arc::new(ChannelInner {
                settings,
                connector,
                state_tx,
                events_tx,
                generation: AtomicU64::new(0),
                shared: Mutex::new(Shared {
                    target,
                    tokens,
                    topics: HashMap::new(),
                    link: None,
                    closed: false,
                }),
            }),
        }
    }

    /// Registers interest in `topic`.
    ///
    /// The first subscription of any topic opens the connection; the first
    /// of a given topic announces it on an open connection. Drop the
    /// returned guard to release it.
    pub fn subscribe(&self, topic: impl Into<Topic>) -> TopicSubscription {
        let topic = topic.into();
        let mut shared = self.inner.lock();

        let count = shared.topics.entry(topic.clone()).or_insert(0);
        *count += 1;
        let first = *count == 1;

        if first {
            let announced = shared
                .link
                .as_ref()
                .map(|link| link.control.send(Control::Subscribe(topic.clone())).is_ok());
            if announced.is_none() {
                self.start_locked(&mut shared);
            }
        }
        debug!(topic = %topic, refs = shared.topics.get(&topic).copied().unwrap_or(0), "Topic subscribed");

        TopicSubscription {
            channel: self.clone(),
            topic,
        }
    }

    fn release(&self, topic: &Topic) {
        let mut shared = self.inner.lock();
        let Some(count) = shared.topics.get_mut(topic) else {
            return;
        };
        *count -= 1;

        if *count == 0 {
            shared.topics.remove(topic);
            if let Some(link) = &shared.link {
                let _ = link.control.send(Control::Unsubscribe(topic.clone()));
            }
            debug!(topic = %topic, "Topic released");
        }

        if shared.topics.is_empty() && shared.link.is_some() {
            self.teardown_locked(&mut shared);
            info!("Last topic released, push channel closed");
        }
    }

    fn start_locked(&self, shared: &mut Shared) {
        if shared.closed || shared.link.is_some() || shared.topics.is_empty() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No async runtime, push channel not started");
            return;
        };

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let generation = self.inner.generation.load(Ordering::SeqCst);
        let task = runtime.spawn(supervise(
            self.inner.clone(),
            generation,
            shared.target.clone(),
            shared.tokens.clone(),
            control_rx,
        ));

        info!(url = %shared.target, "Push channel starting");
        shared.link = Some(Link {
            task,
            control: control_tx,
        });
    }

    fn teardown_locked(&self, shared: &mut Shared) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(link) = shared.link.take() {
            link.task.abort();
        }
        self.inner.state_tx.send_replace(ChannelState::Disconnected);
    }

    /// New receiver of push events.
    pub fn events(&self) -> broadcast::Receiver<PushEvent> {
        self.inner.events_tx.subscribe()
    }

    pub fn state(&self) -> ChannelState {
        *self.inner.state_tx.borrow()
    }

    /// State changes, for degraded-mode indicators.
    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.inner.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ChannelState::Connected
    }

    /// Registered topics with their subscriber counts.
    pub fn topics(&self) -> Vec<(Topic, usize)> {
        let mut topics: Vec<(Topic, usize)> = self
            .inner
            .lock()
            .topics
            .iter()
            .map(|(t, n)| (t.clone(), *n))
            .collect();
        topics.sort();
        topics
    }

    /// Points the channel at a new endpoint.
    ///
    /// The same URL is a no-op and returns false. Otherwise an open
    /// connection is torn down and reopened against the new target.
    pub fn reconfigure(&self, target: Url, tokens: Arc<dyn TokenProvider>) -> bool {
        let mut shared = self.inner.lock();
        if shared.target == target {
            debug!(url = %target, "Push channel target unchanged");
            return false;
        }

        info!(from = %shared.target, to = %target, "Push channel reconfigured");
        shared.target = target;
        shared.tokens = tokens;
        if shared.link.is_some() {
            self.teardown_locked(&mut shared);
            self.start_locked(&mut shared);
        }
        true
    }

    /// Closes the connection for good. Later subscriptions stay inert.
    pub fn shutdown(&self) {
        let mut shared = self.inner.lock();
        shared.closed = true;
        self.teardown_locked(&mut shared);
        info!("Push channel shut down");
    }
}

/// Keeps one topic registered. Dropping it releases the topic.
pub struct TopicSubscription {
    channel: PushChannel,
    topic: Topic,
}

impl TopicSubscription {
    pub fn topic(&self) -> &Topic {
        &self.topic
    }
}

impl Drop for TopicSubscription {
    fn drop(&mut self) {
        self.channel.release(&self.topic);
    }
}

// =============================================================================
// Supervisor
// =============================================================================

/// Connect, serve, back off, repeat. Aborted on teardown.
async fn supervise(
    inner: Arc<ChannelInner>,
    generation: u64,
    target: Url,
    tokens: Arc<dyn TokenProvider>,
    mut control_rx: mpsc::UnboundedReceiver<Control>,
) {
    let mut backoff = ReconnectBackoff::from_settings(&inner.settings);

    loop {
        inner.set_state(generation, ChannelState::Connecting);

        // The topic snapshot below already reflects queued changes.
        while control_rx.try_recv().is_ok() {}
        let topics = inner.active_topics();

        match open(&inner, &target, tokens.as_ref(), topics).await {
            Ok(connection) => {
                backoff.reset();
                inner.set_state(generation, ChannelState::Connected);
                info!(url = %target, "Push channel connected");

                if let Err(e) = connection_loop(&inner, generation, connection, &mut control_rx).await {
                    warn!(error = %e, "Push channel connection ended");
                }
            }
            Err(e) => {
                if matches!(e, SyncError::TokenRejected(_)) {
                    tokens.invalidate().await;
                }
                warn!(error = %e, attempt = backoff.attempts() + 1, "Push channel connect failed");
            }
        }

        inner.set_state(generation, ChannelState::Disconnected);
        let delay = backoff.next_delay();
        inner.set_state(generation, ChannelState::Reconnecting);
        debug!(?delay, attempt = backoff.attempts(), "Waiting before reconnect");
        tokio::time::sleep(delay).await;
    }
}

async fn open(
    inner: &ChannelInner,
    target: &Url,
    tokens: &dyn TokenProvider,
    topics: Vec<Topic>,
) -> SyncResult<Connection> {
    let token = tokens.push_token().await?;
    let connection = inner.connector.connect(target, &token).await?;

    if !topics.is_empty() {
        debug!(count = topics.len(), "Announcing topics");
        connection
            .outgoing
            .send(ClientMessage::subscribe(topics))
            .await
            .map_err(|_| SyncError::Disconnected)?;
    }
    Ok(connection)
}

/// Serves one open connection until it closes.
async fn connection_loop(
    inner: &ChannelInner,
    generation: u64,
    connection: Connection,
    control_rx: &mut mpsc::UnboundedReceiver<Control>,
) -> SyncResult<()> {
    let Connection {
        outgoing,
        mut incoming,
    } = connection;

    loop {
        tokio::select! {
            control = control_rx.recv() => {
                let msg = match control {
                    Some(Control::Subscribe(topic)) => ClientMessage::subscribe([topic]),
                    Some(Control::Unsubscribe(topic)) => ClientMessage::unsubscribe([topic]),
                    None => return Ok(()),
                };
                outgoing.send(msg).await.map_err(|_| SyncError::Disconnected)?;
            }

            frame = incoming.recv() => match frame {
                Some(ServerFrame::Event(event)) => {
                    if inner.is_current(generation) {
                        // No receivers is fine.
                        let _ = inner.events_tx.send(event);
                    }
                }
                Some(ServerFrame::Control(ControlMessage::Subscribed(payload))) => {
                    debug!(topics = payload.topics.len(), "Server confirmed topics");
                }
                Some(ServerFrame::Control(ControlMessage::Pong { .. })) => debug!("Received pong"),
                Some(ServerFrame::Control(ControlMessage::Error { code, message })) => {
                    warn!(%code, %message, "Push channel error frame");
                }
                None => return Err(SyncError::Disconnected),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeConnector, FakeTokenProvider};
    use orbit_core::EventKind;
    use std::time::Duration;
    use tokio::time::Instant;

    fn settings() -> ChannelSettings {
        ChannelSettings {
            initial_backoff_ms: 1000,
            max_backoff_secs: 30,
            jitter: 0.2,
            ..ChannelSettings::default()
        }
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn channel(connector: Arc<FakeConnector>, tokens: Arc<FakeTokenProvider>) -> PushChannel {
        PushChannel::new(settings(), connector, url("wss://admin.example.com/ws"), tokens)
    }

    async fn wait_for(channel: &PushChannel, state: ChannelState) {
        let mut rx = channel.watch_state();
        rx.wait_for(|s| *s == state).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_topics_are_refcounted() {
        let connector = Arc::new(FakeConnector::new());
        let ch = channel(connector.clone(), Arc::new(FakeTokenProvider::with_token("t")));
        assert_eq!(ch.state(), ChannelState::Disconnected);

        let orders_a = ch.subscribe(Topic::ORDERS);
        wait_for(&ch, ChannelState::Connected).await;
        let mut server = connector.take_server().unwrap();
        assert_eq!(
            server.received.recv().await.unwrap(),
            ClientMessage::subscribe([Topic::new(Topic::ORDERS)])
        );
        assert_eq!(connector.last_token().as_deref(), Some("t"));

        let orders_b = ch.subscribe(Topic::ORDERS);
        let activity = ch.subscribe(Topic::ACTIVITY);
        assert_eq!(
            server.received.recv().await.unwrap(),
            ClientMessage::subscribe([Topic::new(Topic::ACTIVITY)])
        );
        assert_eq!(ch.topics().len(), 2);

        drop(orders_a);
        drop(activity);
        assert_eq!(
            server.received.recv().await.unwrap(),
            ClientMessage::unsubscribe([Topic::new(Topic::ACTIVITY)])
        );
        assert!(ch.is_connected());

        drop(orders_b);
        assert_eq!(ch.state(), ChannelState::Disconnected);
        assert!(ch.topics().is_empty());
        // Supervisor aborted: the client side of the socket goes away.
        assert!(server.received.recv().await.is_none());
        assert_eq!(connector.attempt_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_are_broadcast() {
        let connector = Arc::new(FakeConnector::new());
        let ch = channel(connector.clone(), Arc::new(FakeTokenProvider::with_token("t")));
        let mut events = ch.events();

        let _sub = ch.subscribe(Topic::SALES_CHANNELS);
        wait_for(&ch, ChannelState::Connected).await;
        let server = connector.take_server().unwrap();

        server
            .push
            .send(ServerFrame::Event(PushEvent::delete(Topic::SALES_CHANNELS, "ch-1")))
            .await
            .unwrap();
        let event = events.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::Delete);
        assert_eq!(event.entity_id.as_deref(), Some("ch-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_is_monotone_capped_and_resets() {
        let connector = Arc::new(FakeConnector::new());
        connector.fail_all(true);
        let ch = channel(connector.clone(), Arc::new(FakeTokenProvider::with_token("t")));

        let _sub = ch.subscribe(Topic::DASHBOARD);
        tokio::time::sleep(Duration::from_secs(200)).await;

        let attempts = connector.attempts();
        assert!(attempts.len() >= 8, "only {} attempts", attempts.len());
        let gaps: Vec<Duration> = attempts.windows(2).map(|w| w[1] - w[0]).collect();
        for pair in gaps.windows(2) {
            assert!(pair[1] >= pair[0], "{:?} shrank to {:?}", pair[0], pair[1]);
        }
        assert!(gaps.iter().all(|g| *g <= Duration::from_secs(30)));
        assert!(gaps[0] >= Duration::from_secs(1));
        assert_eq!(*gaps.last().unwrap(), Duration::from_secs(30));

        connector.fail_all(false);
        wait_for(&ch, ChannelState::Connected).await;
        let server = connector.take_server().unwrap();
        let dropped_at = Instant::now();
        drop(server);

        wait_for(&ch, ChannelState::Reconnecting).await;
        wait_for(&ch, ChannelState::Connected).await;
        let reconnect_gap = *connector.attempts().last().unwrap() - dropped_at;
        assert!(reconnect_gap <= Duration::from_millis(1200), "{:?}", reconnect_gap);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_session_retries_until_available() {
        let connector = Arc::new(FakeConnector::new());
        let tokens = Arc::new(FakeTokenProvider::new());
        let ch = channel(connector.clone(), tokens.clone());

        let _sub = ch.subscribe(Topic::SECURITY);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(tokens.calls() >= 3);
        assert_eq!(connector.attempt_count(), 0);
        assert_ne!(ch.state(), ChannelState::Connected);

        tokens.set_token(Some("late"));
        wait_for(&ch, ChannelState::Connected).await;
        assert_eq!(connector.last_token().as_deref(), Some("late"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_token_is_invalidated() {
        let connector = Arc::new(FakeConnector::new());
        connector.reject_tokens(true);
        let tokens = Arc::new(FakeTokenProvider::with_token("expired"));
        let ch = channel(connector.clone(), tokens.clone());

        let _sub = ch.subscribe(Topic::ORDERS);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(tokens.invalidations() >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconfigure() {
        let connector = Arc::new(FakeConnector::new());
        let tokens: Arc<FakeTokenProvider> = Arc::new(FakeTokenProvider::with_token("t"));
        let ch = channel(connector.clone(), tokens.clone());

        let _sub = ch.subscribe(Topic::ORDERS);
        wait_for(&ch, ChannelState::Connected).await;
        assert!(!ch.reconfigure(url("wss://admin.example.com/ws"), tokens.clone()));
        assert_eq!(connector.attempt_count(), 1);

        assert!(ch.reconfigure(url("wss://eu.example.com/ws"), tokens.clone()));
        wait_for(&ch, ChannelState::Connected).await;
        assert_eq!(connector.attempt_count(), 2);
        assert_eq!(connector.last_url().unwrap().host_str(), Some("eu.example.com"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_is_final() {
        let connector = Arc::new(FakeConnector::new());
        let ch = channel(connector.clone(), Arc::new(FakeTokenProvider::with_token("t")));
        ch.shutdown();

        let _sub = ch.subscribe(Topic::ORDERS);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(ch.state(), ChannelState::Disconnected);
        assert_eq!(connector.attempt_count(), 0);
    }
}
