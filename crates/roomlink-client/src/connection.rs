//! Client connection manager.
//!
//! Owns the connection state machine, reconnection backoff, keepalive and
//! the outbound queue. Every connect attempt carries an id; completions from
//! a superseded attempt are dropped by id mismatch.

use std::{
    future,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use roomlink_core::{EventRegistry, Frame, ListenerId, close_codes};
use serde::Serialize;
use serde_json::Value;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::{Instant, Interval},
};

use crate::{
    config::{Backoff, ClientOptions},
    keepalive::{Keepalive, KeepaliveAction, Visibility},
    queue::{MessageQueue, QueuedMessage},
    transport::{Connector, Link, LinkEvent, Outbound},
};

/// Client view of its own link health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// An attempt is in flight.
    Connecting,
    /// Link open; emits go straight out.
    Connected,
    /// Idle after a clean close or an explicit disconnect.
    Disconnected,
    /// Waiting out a backoff delay before the next attempt.
    Reconnecting,
    /// Gave up after a failure.
    Error,
}

/// Lifecycle notifications, delivered in transition order.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientNotice {
    /// Every state transition.
    StateChange {
        from: ConnectionState,
        to: ConnectionState,
    },
    /// A link was established.
    Open,
    /// The link closed.
    Close {
        code: u16,
        reason: String,
    },
    /// Connect or transport failure.
    Error {
        message: String,
    },
    /// A reconnect attempt was scheduled.
    Reconnecting {
        attempt: u32,
        delay: Duration,
    },
}

impl ClientNotice {
    /// Event name under which this notice is emitted on the lifecycle registry.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::StateChange { .. } => notices::STATE_CHANGE,
            Self::Open => notices::OPEN,
            Self::Close { .. } => notices::CLOSE,
            Self::Error { .. } => notices::ERROR,
            Self::Reconnecting { .. } => notices::RECONNECTING,
        }
    }
}

/// Lifecycle event names.
pub mod notices {
    pub const STATE_CHANGE: &str = "state_change";
    pub const OPEN: &str = "open";
    pub const CLOSE: &str = "close";
    pub const ERROR: &str = "error";
    pub const RECONNECTING: &str = "reconnecting";
}

/// Client error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// The link went down before the wait completed.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),
    /// `disconnect` was called.
    #[error("Disconnected by client")]
    Disconnected,
}

/// What happened to an emitted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to the open link.
    Sent,
    /// Buffered until the next successful connect.
    Queued,
    /// Could not be encoded.
    Dropped,
}

/// Why a link went down.
enum LinkDown {
    Closed { code: u16, reason: String },
    Failed(String),
}

impl LinkDown {
    fn describe(&self) -> String {
        match self {
            Self::Closed { code, reason } if reason.is_empty() => format!("closed with code {code}"),
            Self::Closed { code, reason } => format!("closed with code {code}: {reason}"),
            Self::Failed(message) => message.clone(),
        }
    }

    fn notice(&self) -> ClientNotice {
        match self {
            Self::Closed { code, reason } => ClientNotice::Close {
                code: *code,
                reason: reason.clone(),
            },
            Self::Failed(message) => ClientNotice::Error {
                message: message.clone(),
            },
        }
    }
}

struct Shared {
    state: ConnectionState,
    attempt: u64,
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
    queue: MessageQueue,
    backoff: Backoff,
    link_stop: Option<oneshot::Sender<()>>,
    reconnect_timer: Option<JoinHandle<()>>,
    waiters: Vec<oneshot::Sender<Result<(), ClientError>>>,
}

struct Inner {
    options: ClientOptions,
    connector: Arc<dyn Connector>,
    events: EventRegistry<Value>,
    lifecycle: EventRegistry<ClientNotice>,
    visibility: Option<watch::Receiver<Visibility>>,
    shared: Mutex<Shared>,
    notices_tx: mpsc::UnboundedSender<ClientNotice>,
    notices_rx: Mutex<Option<mpsc::UnboundedReceiver<ClientNotice>>>,
    // Inbound events, handed off so the link loop never waits on listeners.
    dispatch_tx: mpsc::UnboundedSender<(String, Value)>,
    dispatch_rx: Mutex<Option<mpsc::UnboundedReceiver<(String, Value)>>>,
}

/// Builder for [`Client`].
pub struct ClientBuilder {
    options: ClientOptions,
    connector: Arc<dyn Connector>,
    visibility: Option<watch::Receiver<Visibility>>,
}

impl ClientBuilder {
    /// Feed foreground/background transitions into keepalive.
    #[must_use]
    pub fn visibility(mut self, rx: watch::Receiver<Visibility>) -> Self {
        self.visibility = Some(rx);
        self
    }

    #[must_use]
    pub fn build(self) -> Client {
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let shared = Shared {
            state: ConnectionState::Disconnected,
            attempt: 0,
            outbound: None,
            queue: MessageQueue::new(self.options.max_queue_size),
            backoff: Backoff::new(self.options.reconnection.clone()),
            link_stop: None,
            reconnect_timer: None,
            waiters: Vec::new(),
        };
        Client {
            inner: Arc::new(Inner {
                options: self.options,
                connector: self.connector,
                events: EventRegistry::new(),
                lifecycle: EventRegistry::new(),
                visibility: self.visibility,
                shared: Mutex::new(shared),
                notices_tx,
                notices_rx: Mutex::new(Some(notices_rx)),
                dispatch_tx,
                dispatch_rx: Mutex::new(Some(dispatch_rx)),
            }),
        }
    }
}

/// Realtime client handle. Cheap to clone.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    /// Create a client. Nothing is opened until [`Client::connect`].
    pub fn new(options: ClientOptions, connector: impl Connector + 'static) -> Self {
        Self::builder(options, connector).build()
    }

    pub fn builder(options: ClientOptions, connector: impl Connector + 'static) -> ClientBuilder {
        ClientBuilder {
            options,
            connector: Arc::new(connector),
            visibility: None,
        }
    }

    #[must_use]
    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Messages waiting for a link.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Application event registry, keyed by channel.
    #[must_use]
    pub fn events(&self) -> &EventRegistry<Value> {
        &self.inner.events
    }

    /// Lifecycle registry, keyed by the names in [`notices`].
    #[must_use]
    pub fn lifecycle(&self) -> &EventRegistry<ClientNotice> {
        &self.inner.lifecycle
    }

    /// Listen for messages on a channel.
    pub fn on<F, Fut>(&self, channel: impl Into<String>, handler: F) -> ListenerId
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.inner.events.on(channel, handler)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.inner.events.off(id)
    }

    /// Start connecting. No-op while already connecting or connected.
    ///
    /// From `error` this re-arms the reconnection budget; from `reconnecting`
    /// it skips the pending delay.
    pub fn connect(&self) {
        self.inner.start_notifier();
        self.inner.start_dispatcher();
        let mut shared = self.inner.lock();
        match shared.state {
            ConnectionState::Connecting | ConnectionState::Connected => return,
            ConnectionState::Error => shared.backoff.reset(),
            ConnectionState::Disconnected | ConnectionState::Reconnecting => {}
        }
        if let Some(timer) = shared.reconnect_timer.take() {
            timer.abort();
        }
        self.inner.begin_attempt(&mut shared);
    }

    /// Close the link and stop reconnecting.
    pub fn disconnect(&self) {
        let mut shared = self.inner.lock();
        shared.attempt += 1;
        if let Some(timer) = shared.reconnect_timer.take() {
            timer.abort();
        }
        if let Some(stop) = shared.link_stop.take() {
            let _ = stop.send(());
        }
        if let Some(outbound) = shared.outbound.take() {
            let _ = outbound.send(Outbound::Close {
                code: close_codes::NORMAL,
                reason: "client disconnect".into(),
            });
        }
        for waiter in shared.waiters.drain(..) {
            let _ = waiter.send(Err(ClientError::Disconnected));
        }
        if shared.state != ConnectionState::Disconnected {
            self.inner
                .transition(&mut shared, ConnectionState::Disconnected);
            self.inner.notify(ClientNotice::Close {
                code: close_codes::NORMAL,
                reason: "client disconnect".into(),
            });
        }
        tracing::info!("Client disconnected");
    }

    /// Resolve on the next `connected` transition (immediately if connected).
    ///
    /// # Errors
    /// Returns error if the link closes or fails first, or on `disconnect`.
    pub async fn wait_connected(&self) -> Result<(), ClientError> {
        let rx = {
            let mut shared = self.inner.lock();
            if shared.state == ConnectionState::Connected {
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            shared.waiters.push(tx);
            rx
        };
        rx.await.unwrap_or(Err(ClientError::Disconnected))
    }

    /// [`Client::connect`] then [`Client::wait_connected`].
    ///
    /// # Errors
    /// Returns error if the first attempt does not open.
    pub async fn connect_and_wait(&self) -> Result<(), ClientError> {
        self.connect();
        self.wait_connected().await
    }

    /// Send an application message, queueing it if the link is not open.
    pub fn emit(&self, channel: impl Into<String>, data: Value) -> Delivery {
        let channel = channel.into();
        let mut shared = self.inner.lock();
        if shared.state == ConnectionState::Connected {
            if let Some(outbound) = &shared.outbound {
                let text = match Frame::event(channel.clone(), data.clone()).encode() {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::error!(channel = %channel, error = %e, "Failed to encode message");
                        return Delivery::Dropped;
                    }
                };
                if outbound.send(Outbound::Text(text)).is_ok() {
                    return Delivery::Sent;
                }
            }
        }
        shared.queue.enqueue(QueuedMessage::new(channel, data));
        Delivery::Queued
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, notice: ClientNotice) {
        let _ = self.notices_tx.send(notice);
    }

    fn transition(&self, shared: &mut Shared, to: ConnectionState) {
        let from = shared.state;
        if from == to {
            return;
        }
        shared.state = to;
        tracing::debug!(?from, ?to, attempt = shared.attempt, "Connection state change");
        self.notify(ClientNotice::StateChange { from, to });
    }

    /// Deliver lifecycle notices one at a time, in the order they were raised.
    fn start_notifier(self: &Arc<Self>) {
        let Some(mut rx) = self
            .notices_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(notice) = rx.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.lifecycle.emit(notice.name(), notice).await;
            }
        });
    }

    /// Run application listeners one event at a time, in arrival order.
    fn start_dispatcher(self: &Arc<Self>) {
        let Some(mut rx) = self
            .dispatch_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some((channel, data)) = rx.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.events.emit(&channel, data).await;
            }
        });
    }

    fn begin_attempt(self: &Arc<Self>, shared: &mut Shared) {
        shared.attempt += 1;
        let id = shared.attempt;
        let (stop_tx, stop_rx) = oneshot::channel();
        if let Some(old) = shared.link_stop.replace(stop_tx) {
            let _ = old.send(());
        }
        self.transition(shared, ConnectionState::Connecting);
        tracing::debug!(attempt = id, url = %self.options.url, "Connecting");
        tokio::spawn(Arc::clone(self).run_link(id, stop_rx));
    }

    async fn run_link(self: Arc<Self>, id: u64, mut stop: oneshot::Receiver<()>) {
        let timeout = self.options.connection_timeout();
        let connect = self.connector.connect(&self.options.url);
        let opened = tokio::select! {
            _ = &mut stop => return,
            result = async {
                if timeout.is_zero() {
                    Ok(connect.await)
                } else {
                    tokio::time::timeout(timeout, connect).await
                }
            } => result,
        };

        let link = match opened {
            Ok(Ok(link)) => link,
            Ok(Err(e)) => {
                self.link_down(id, &LinkDown::Failed(e.to_string()));
                return;
            }
            Err(_) => {
                self.link_down(id, &LinkDown::Failed("connection timed out".into()));
                return;
            }
        };

        {
            let mut shared = self.lock();
            if shared.attempt != id {
                tracing::debug!(attempt = id, "Dropping link from superseded attempt");
                let _ = link.outbound.send(Outbound::Close {
                    code: close_codes::NORMAL,
                    reason: "superseded".into(),
                });
                return;
            }
            shared.backoff.reset();
            shared.outbound = Some(link.outbound.clone());
            self.transition(&mut shared, ConnectionState::Connected);
            self.notify(ClientNotice::Open);
            shared.queue.flush(&link.outbound);
            for waiter in shared.waiters.drain(..) {
                let _ = waiter.send(Ok(()));
            }
        }
        tracing::info!(attempt = id, url = %self.options.url, "Connected");

        if let Some(down) = self.pump(id, link, stop).await {
            self.link_down(id, &down);
        }
    }

    /// Read the open link until it goes down. Returns `None` when stopped.
    async fn pump(
        &self,
        id: u64,
        link: Link,
        mut stop: oneshot::Receiver<()>,
    ) -> Option<LinkDown> {
        let Link {
            outbound,
            mut inbound,
        } = link;
        let mut keepalive = Keepalive::new(self.options.ping_interval(), self.options.pong_timeout());
        keepalive.start(Instant::now());
        let mut ticker = keepalive.ticker();
        let mut visibility = self.visibility.clone();

        loop {
            tokio::select! {
                _ = &mut stop => return None,
                event = inbound.recv() => match event {
                    Some(LinkEvent::Text(text)) => {
                        self.handle_text(&text, &outbound, &mut keepalive);
                    }
                    Some(LinkEvent::Closed { code, reason }) => {
                        return Some(LinkDown::Closed { code, reason });
                    }
                    Some(LinkEvent::Error(message)) => return Some(LinkDown::Failed(message)),
                    None => {
                        return Some(LinkDown::Closed {
                            code: close_codes::ABNORMAL,
                            reason: "link dropped".into(),
                        });
                    }
                },
                () = next_tick(&mut ticker) => match keepalive.check(Instant::now()) {
                    KeepaliveAction::Ping => send_frame(&outbound, &Frame::Ping),
                    KeepaliveAction::Dead => {
                        tracing::warn!(
                            attempt = id,
                            grace_ms = u64::try_from(keepalive.grace().as_millis()).unwrap_or(u64::MAX),
                            "No pong within grace window, closing link"
                        );
                        let reason = "keepalive timeout".to_string();
                        let _ = outbound.send(Outbound::Close {
                            code: close_codes::KEEPALIVE_TIMEOUT,
                            reason: reason.clone(),
                        });
                        return Some(LinkDown::Closed {
                            code: close_codes::KEEPALIVE_TIMEOUT,
                            reason,
                        });
                    }
                },
                Some(state) = next_visibility(&mut visibility) => {
                    if state == Visibility::Foreground && keepalive.enabled() {
                        tracing::debug!(attempt = id, "Foregrounded, resyncing keepalive");
                        send_frame(&outbound, &Frame::Ping);
                        ticker = keepalive.ticker();
                    }
                }
            }
        }
    }

    fn handle_text(
        &self,
        text: &str,
        outbound: &mpsc::UnboundedSender<Outbound>,
        keepalive: &mut Keepalive,
    ) {
        match Frame::decode_str(text) {
            Frame::Event { channel, data } => {
                let _ = self.dispatch_tx.send((channel, data));
            }
            Frame::Pong => keepalive.on_pong(Instant::now()),
            Frame::Ping => send_frame(outbound, &Frame::Pong),
            Frame::Invalid => {}
        }
    }

    /// Settle state after the link for attempt `id` went down.
    fn link_down(self: &Arc<Self>, id: u64, down: &LinkDown) {
        let mut shared = self.lock();
        if shared.attempt != id {
            return;
        }
        shared.outbound = None;
        shared.link_stop = None;

        let description = down.describe();
        for waiter in shared.waiters.drain(..) {
            let _ = waiter.send(Err(ClientError::ConnectionLost(description.clone())));
        }

        let clean = matches!(down, LinkDown::Closed { code, .. } if self.options.is_clean_close(*code));
        if clean {
            tracing::info!(attempt = id, reason = %description, "Link closed cleanly");
            self.transition(&mut shared, ConnectionState::Disconnected);
            self.notify(down.notice());
            return;
        }

        if self.options.reconnection.enabled {
            if let Some(delay) = shared.backoff.next_delay() {
                let attempt = shared.backoff.attempts();
                tracing::info!(
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    reason = %description,
                    "Link lost, scheduling reconnect"
                );
                self.transition(&mut shared, ConnectionState::Reconnecting);
                self.notify(down.notice());
                self.notify(ClientNotice::Reconnecting { attempt, delay });
                self.schedule_reconnect(&mut shared, delay);
                return;
            }
            tracing::warn!(reason = %description, "Reconnection attempts exhausted");
            self.transition(&mut shared, ConnectionState::Error);
            self.notify(down.notice());
            return;
        }

        let next = match down {
            LinkDown::Closed { .. } => ConnectionState::Disconnected,
            LinkDown::Failed(_) => ConnectionState::Error,
        };
        tracing::info!(reason = %description, "Link lost, reconnection disabled");
        self.transition(&mut shared, next);
        self.notify(down.notice());
    }

    fn schedule_reconnect(self: &Arc<Self>, shared: &mut Shared, delay: Duration) {
        let id = shared.attempt;
        let inner = Arc::clone(self);
        shared.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut shared = inner.lock();
            if shared.attempt != id || shared.state != ConnectionState::Reconnecting {
                return;
            }
            shared.reconnect_timer = None;
            inner.begin_attempt(&mut shared);
        }));
    }
}

fn send_frame(outbound: &mpsc::UnboundedSender<Outbound>, frame: &Frame) {
    match frame.encode() {
        Ok(text) => {
            let _ = outbound.send(Outbound::Text(text));
        }
        Err(e) => tracing::error!(error = %e, "Failed to encode control frame"),
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => future::pending().await,
    }
}

async fn next_visibility(rx: &mut Option<watch::Receiver<Visibility>>) -> Option<Visibility> {
    let Some(receiver) = rx.as_mut() else {
        return future::pending().await;
    };
    if receiver.changed().await.is_ok() {
        Some(*receiver.borrow_and_update())
    } else {
        *rx = None;
        None
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        config::ReconnectionPolicy,
        transport::testutil::{MockConnector, RemoteEnd, Script},
    };

    fn options(reconnection: ReconnectionPolicy) -> ClientOptions {
        ClientOptions {
            url: "ws://test/ws".into(),
            reconnection,
            connection_timeout_ms: 3_000,
            ping_interval_ms: 0,
            pong_timeout_ms: 5_000,
            max_queue_size: 10,
            ..ClientOptions::default()
        }
    }

    fn policy(max_attempts: u32) -> ReconnectionPolicy {
        ReconnectionPolicy {
            enabled: true,
            max_attempts,
            initial_delay_ms: 1_000,
            max_delay_ms: 5_000,
            backoff_multiplier: 2.0,
        }
    }

    /// Record every lifecycle notice into a channel.
    fn record(client: &Client) -> mpsc::UnboundedReceiver<ClientNotice> {
        let (tx, rx) = mpsc::unbounded_channel();
        client.lifecycle().on_any(move |_, notice| {
            let _ = tx.send(notice);
            async { anyhow::Ok(()) }
        });
        rx
    }

    async fn next_notice(rx: &mut mpsc::UnboundedReceiver<ClientNotice>) -> ClientNotice {
        tokio::time::timeout(Duration::from_secs(60), rx.recv())
            .await
            .expect("notice timeout")
            .expect("notice channel closed")
    }

    async fn wait_for_state(
        rx: &mut mpsc::UnboundedReceiver<ClientNotice>,
        want: ConnectionState,
    ) {
        loop {
            if let ClientNotice::StateChange { to, .. } = next_notice(rx).await {
                if to == want {
                    return;
                }
            }
        }
    }

    async fn accepted(rx: &mut mpsc::UnboundedReceiver<RemoteEnd>) -> RemoteEnd {
        tokio::time::timeout(Duration::from_secs(60), rx.recv())
            .await
            .expect("accept timeout")
            .expect("connector dropped")
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_flushes_queue_in_order() {
        let (connector, mut remotes) = MockConnector::new(vec![]);
        let client = Client::new(options(policy(3)), connector);

        assert_eq!(client.state(), ConnectionState::Disconnected);
        for n in 0..3 {
            assert_eq!(client.emit("chat", json!(n)), Delivery::Queued);
        }
        assert_eq!(client.queued(), 3);

        client.connect_and_wait().await.unwrap();
        assert_eq!(client.state(), ConnectionState::Connected);
        assert_eq!(client.queued(), 0);
        assert_eq!(client.emit("chat", json!(3)), Delivery::Sent);

        let mut remote = accepted(&mut remotes).await;
        let frames = remote.drain_frames();
        assert_eq!(
            frames,
            (0..4).map(|n| Frame::event("chat", json!(n))).collect::<Vec<_>>()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unclean_close_notice_order() {
        let (connector, mut remotes) = MockConnector::new(vec![]);
        let client = Client::new(options(policy(3)), connector);
        let mut notices = record(&client);

        client.connect_and_wait().await.unwrap();
        wait_for_state(&mut notices, ConnectionState::Connected).await;
        assert_eq!(next_notice(&mut notices).await, ClientNotice::Open);

        let remote = accepted(&mut remotes).await;
        remote.close(close_codes::ABNORMAL);

        assert_eq!(
            next_notice(&mut notices).await,
            ClientNotice::StateChange {
                from: ConnectionState::Connected,
                to: ConnectionState::Reconnecting,
            }
        );
        assert_eq!(
            next_notice(&mut notices).await,
            ClientNotice::Close {
                code: close_codes::ABNORMAL,
                reason: String::new(),
            }
        );
        assert_eq!(
            next_notice(&mut notices).await,
            ClientNotice::Reconnecting {
                attempt: 1,
                delay: Duration::from_millis(1_000),
            }
        );

        // The scheduled attempt opens a fresh link.
        wait_for_state(&mut notices, ConnectionState::Connected).await;
        let _second = accepted(&mut remotes).await;
        client.disconnect();
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_schedule_under_repeated_failures() {
        let (connector, mut remotes) = MockConnector::new(vec![
            Script::Accept,
            Script::Refuse,
            Script::Refuse,
            Script::Refuse,
            Script::Refuse,
        ]);
        let client = Client::new(options(policy(0)), connector);
        let mut notices = record(&client);

        client.connect_and_wait().await.unwrap();
        accepted(&mut remotes).await.close(close_codes::ABNORMAL);

        let mut delays = Vec::new();
        while delays.len() < 5 {
            if let ClientNotice::Reconnecting { delay, .. } = next_notice(&mut notices).await {
                delays.push(u64::try_from(delay.as_millis()).unwrap());
            }
        }
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 5_000, 5_000]);
        client.disconnect();
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_connect_resets_backoff() {
        let (connector, mut remotes) =
            MockConnector::new(vec![Script::Accept, Script::Refuse, Script::Accept]);
        let client = Client::new(options(policy(0)), connector);
        let mut notices = record(&client);

        client.connect_and_wait().await.unwrap();
        accepted(&mut remotes).await.close(close_codes::ABNORMAL);

        let mut delays = Vec::new();
        while delays.len() < 2 {
            if let ClientNotice::Reconnecting { delay, .. } = next_notice(&mut notices).await {
                delays.push(delay);
            }
        }
        wait_for_state(&mut notices, ConnectionState::Connected).await;
        accepted(&mut remotes).await.close(close_codes::ABNORMAL);

        loop {
            if let ClientNotice::Reconnecting { attempt, delay } = next_notice(&mut notices).await {
                assert_eq!(attempt, 1);
                assert_eq!(delay, Duration::from_millis(1_000));
                break;
            }
        }
        assert_eq!(
            delays,
            vec![Duration::from_millis(1_000), Duration::from_millis(2_000)]
        );
        client.disconnect();
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_ends_in_error() {
        let (connector, mut remotes) =
            MockConnector::new(vec![Script::Accept, Script::Refuse, Script::Refuse]);
        let attempts = Arc::clone(&connector.attempts);
        let client = Client::new(options(policy(2)), connector);
        let mut notices = record(&client);

        client.connect_and_wait().await.unwrap();
        accepted(&mut remotes).await.close(close_codes::ABNORMAL);

        wait_for_state(&mut notices, ConnectionState::Error).await;
        assert_eq!(client.state(), ConnectionState::Error);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(*attempts.lock().unwrap(), 3);
        assert_eq!(client.state(), ConnectionState::Error);

        // A manual connect re-arms the budget.
        client.connect_and_wait().await.unwrap();
        assert_eq!(*attempts.lock().unwrap(), 4);
        client.disconnect();
    }

    #[tokio::test(start_paused = true)]
    async fn test_clean_close_does_not_reconnect() {
        let (connector, mut remotes) = MockConnector::new(vec![]);
        let attempts = Arc::clone(&connector.attempts);
        let client = Client::new(options(policy(3)), connector);
        let mut notices = record(&client);

        client.connect_and_wait().await.unwrap();
        accepted(&mut remotes).await.close(close_codes::NORMAL);
        wait_for_state(&mut notices, ConnectionState::Disconnected).await;

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(*attempts.lock().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_connect_without_reconnection() {
        let (connector, _remotes) = MockConnector::new(vec![Script::Refuse]);
        let client = Client::new(options(ReconnectionPolicy::disabled()), connector);

        let result = client.connect_and_wait().await;
        assert!(matches!(result, Err(ClientError::ConnectionLost(_))));
        assert_eq!(client.state(), ConnectionState::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let (connector, _remotes) = MockConnector::new(vec![Script::Hang]);
        let client = Client::new(options(ReconnectionPolicy::disabled()), connector);

        let started = Instant::now();
        let result = client.connect_and_wait().await;
        assert_eq!(
            result,
            Err(ClientError::ConnectionLost("connection timed out".into()))
        );
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(3_000), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(3_100), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending_work() {
        let (connector, mut remotes) = MockConnector::new(vec![Script::Hang, Script::Accept]);
        let attempts = Arc::clone(&connector.attempts);
        let client = Client::new(options(policy(0)), connector);

        client.connect();
        let mut waiter = tokio_test::task::spawn(client.wait_connected());
        tokio_test::assert_pending!(waiter.poll());
        client.disconnect();
        assert!(waiter.is_woken());
        tokio_test::assert_ready_eq!(waiter.poll(), Err(ClientError::Disconnected));
        drop(waiter);
        assert_eq!(client.state(), ConnectionState::Disconnected);

        // A fresh connect supersedes the hung attempt.
        client.connect_and_wait().await.unwrap();
        let _remote = accepted(&mut remotes).await;
        assert!(remotes.try_recv().is_err());
        assert_eq!(*attempts.lock().unwrap(), 2);

        // An explicit disconnect suppresses auto-reconnect.
        client.disconnect();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(*attempts.lock().unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_declares_dead_link() {
        let (connector, mut remotes) = MockConnector::new(vec![]);
        let client = Client::new(
            ClientOptions {
                ping_interval_ms: 5_000,
                pong_timeout_ms: 5_000,
                ..options(ReconnectionPolicy::disabled())
            },
            connector,
        );
        let mut notices = record(&client);

        client.connect_and_wait().await.unwrap();
        let opened = Instant::now();
        let mut remote = accepted(&mut remotes).await;

        loop {
            if let ClientNotice::Close { code, .. } = next_notice(&mut notices).await {
                assert_eq!(code, close_codes::KEEPALIVE_TIMEOUT);
                break;
            }
        }
        assert!(opened.elapsed() <= Duration::from_millis(10_000));
        assert_eq!(client.state(), ConnectionState::Disconnected);

        assert_eq!(remote.try_next(), Some(Outbound::Text(Frame::Ping.encode().unwrap())));
        assert_eq!(
            remote.try_next(),
            Some(Outbound::Close {
                code: close_codes::KEEPALIVE_TIMEOUT,
                reason: "keepalive timeout".into(),
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_pongs_keep_link_alive() {
        let (connector, mut remotes) = MockConnector::new(vec![]);
        let client = Client::new(
            ClientOptions {
                ping_interval_ms: 5_000,
                pong_timeout_ms: 5_000,
                ..options(ReconnectionPolicy::disabled())
            },
            connector,
        );

        client.connect_and_wait().await.unwrap();
        let mut remote = accepted(&mut remotes).await;
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(5_001)).await;
            assert_eq!(remote.drain_frames(), vec![Frame::Ping]);
            remote.send_frame(&Frame::Pong);
        }
        assert!(client.is_connected());
        client.disconnect();
    }

    #[tokio::test(start_paused = true)]
    async fn test_foreground_resyncs_keepalive() {
        let (connector, mut remotes) = MockConnector::new(vec![]);
        let (visibility_tx, visibility_rx) = watch::channel(Visibility::Foreground);
        let client = Client::builder(
            ClientOptions {
                ping_interval_ms: 5_000,
                pong_timeout_ms: 5_000,
                ..options(ReconnectionPolicy::disabled())
            },
            connector,
        )
        .visibility(visibility_rx)
        .build();

        client.connect_and_wait().await.unwrap();
        let mut remote = accepted(&mut remotes).await;

        visibility_tx.send(Visibility::Background).unwrap();
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert!(remote.drain_frames().is_empty());

        visibility_tx.send(Visibility::Foreground).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(remote.drain_frames(), vec![Frame::Ping]);
        client.disconnect();
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_listener_does_not_delay_close() {
        let (connector, mut remotes) = MockConnector::new(vec![]);
        let client = Client::new(options(policy(3)), connector);
        let mut notices = record(&client);
        let (started_tx, mut started) = mpsc::unbounded_channel();
        client.on("slow", move |_data| {
            let _ = started_tx.send(());
            async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                anyhow::Ok(())
            }
        });

        client.connect_and_wait().await.unwrap();
        let remote = accepted(&mut remotes).await;
        remote.send_frame(&Frame::event("slow", Value::Null));
        started.recv().await.unwrap();
        remote.close(close_codes::ABNORMAL);

        tokio::time::timeout(
            Duration::from_secs(1),
            wait_for_state(&mut notices, ConnectionState::Reconnecting),
        )
        .await
        .expect("close went unnoticed while a listener was running");
        assert_eq!(client.emit("chat", json!("later")), Delivery::Queued);
        client.disconnect();
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_dispatch() {
        let (connector, mut remotes) = MockConnector::new(vec![]);
        let client = Client::new(options(policy(3)), connector);
        let (tx, mut rx) = mpsc::unbounded_channel();
        client.on("chat", move |data| {
            let _ = tx.send(data);
            async { anyhow::Ok(()) }
        });

        client.connect_and_wait().await.unwrap();
        let mut remote = accepted(&mut remotes).await;

        let _ = remote.to_client.send(LinkEvent::Text("garbage".into()));
        remote.send_frame(&Frame::Ping);
        remote.send_frame(&Frame::event("chat", json!({"text": "hi"})));

        let got = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, json!({"text": "hi"}));
        assert_eq!(remote.drain_frames(), vec![Frame::Pong]);
        assert!(client.is_connected());
        client.disconnect();
    }
}
