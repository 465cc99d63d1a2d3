use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::{
    sync::{broadcast, mpsc, watch},
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, client::IntoClientRequest, http::StatusCode, Message},
    MaybeTlsStream, WebSocketStream,
};

use crate::{
    consts::{CHANNEL_BACKOFF_JITTER_MS, CHANNEL_STOP_GRACE_SECS, EVENT_BUFFER},
    diagnostics::{snapshot_channel, ChannelDiagnostics},
    error::{ChannelError, RefreshError, SettingsError},
    model::{ChannelEvent, ClientAction, ConnectionState, ServerMessage},
    notifications::{SeenSet, UnreadCounter},
    refresh::RefreshCoordinator,
    session::SessionStore,
    settings::ClientSettings,
    util::{redact_token_url, truncate_message, unix_now_secs},
};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub url: String,
    pub connect_timeout: Duration,
    pub ping_interval: Duration,
    pub max_missed_pongs: u32,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl ChannelConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_settings(url.into(), &ClientSettings::default())
    }

    pub fn from_settings(settings: &ClientSettings) -> Result<Self, SettingsError> {
        Ok(Self::with_settings(settings.channel_url()?, settings))
    }

    fn with_settings(url: String, settings: &ClientSettings) -> Self {
        Self {
            url,
            connect_timeout: Duration::from_secs(settings.connect_timeout_secs.max(1)),
            ping_interval: Duration::from_secs(settings.ping_interval_secs.max(1)),
            max_missed_pongs: settings.max_missed_pongs.max(1),
            backoff_initial: Duration::from_secs(settings.backoff_initial_secs.max(1)),
            backoff_max: Duration::from_secs(settings.backoff_max_secs.max(1)),
        }
    }
}

/// Exponential backoff capped at `max`, with random jitter of at most half the
/// base delay.
#[derive(Debug)]
pub(crate) struct Backoff {
    initial: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub(crate) fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            attempt: 0,
        }
    }

    pub(crate) fn next_delay(&mut self) -> Duration {
        let factor = 1u32 << self.attempt.min(16);
        let base = self.initial.saturating_mul(factor).min(self.max);
        self.attempt = self.attempt.saturating_add(1);
        let jitter_cap = CHANNEL_BACKOFF_JITTER_MS.min(base.as_millis() as u64 / 2);
        let jitter = if jitter_cap == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..jitter_cap))
        };
        (base + jitter).min(self.max)
    }

    pub(crate) fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[derive(Default)]
pub(crate) struct RuntimeState {
    pub(crate) stop_tx: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
    outbound: Option<mpsc::UnboundedSender<ClientAction>>,
    /// Bumped per spawned task; a late-exiting task only cleans up state
    /// that still belongs to it.
    channel_epoch: u64,
    /// Session generation the running task serves.
    session_generation: u64,
    pub(crate) last_connected_at: Option<u64>,
    pub(crate) last_event_at: Option<u64>,
    pub(crate) last_error: Option<String>,
    pub(crate) backoff_ms: u64,
    pub(crate) reconnect_attempts: u64,
    pub(crate) connections: u64,
    pub(crate) resync_requests: u64,
}

pub(crate) struct ChannelShared {
    config: ChannelConfig,
    session: SessionStore,
    coordinator: Option<RefreshCoordinator>,
    runtime: Mutex<RuntimeState>,
    pub(crate) state_tx: watch::Sender<ConnectionState>,
    pub(crate) unread: UnreadCounter,
    seen: Mutex<SeenSet>,
    events: broadcast::Sender<ChannelEvent>,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Dispatch {
    Handled,
    Pong,
    Reply(ClientAction),
}

/// One spawned task and the sign-in it serves.
#[derive(Debug, Clone, Copy)]
struct TaskScope {
    epoch: u64,
    generation: u64,
}

enum ConnectFailure {
    Unauthorized,
    Other(String),
}

enum SessionEnd {
    Shutdown,
    Dropped(String),
}

impl ChannelShared {
    pub(crate) fn runtime(&self) -> MutexGuard<'_, RuntimeState> {
        self.runtime.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn seen(&self) -> MutexGuard<'_, SeenSet> {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, next: ConnectionState) -> bool {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            if !current.can_transition_to(next) {
                tracing::warn!(from = %current, to = %next, "illegal connection state transition ignored");
                return false;
            }
            *current = next;
            true
        });
        if changed {
            tracing::debug!(state = %next, "connection state");
            let _ = self.events.send(ChannelEvent::StateChanged(next));
        }
        changed
    }

    /// Transitions only while `scope` is still the live task.
    fn transition_for(&self, scope: TaskScope, next: ConnectionState) -> bool {
        let runtime = self.runtime();
        if runtime.channel_epoch != scope.epoch {
            return false;
        }
        self.transition(next)
    }

    fn publish(&self, event: ChannelEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }

    /// Routes one server frame. Duplicate notifications publish nothing.
    pub(crate) fn dispatch(&self, raw: &str) -> Dispatch {
        let message = match serde_json::from_str::<ServerMessage>(raw) {
            Ok(message) => message,
            Err(error) => {
                tracing::warn!(
                    %error,
                    payload = %truncate_message(raw, 140),
                    "ignoring unreadable channel message"
                );
                return Dispatch::Handled;
            }
        };

        match message {
            ServerMessage::Notification { notification } => {
                if self.seen().should_deliver(&notification.id) {
                    tracing::debug!(id = %notification.id, kind = %notification.kind, "notification delivered");
                    self.publish(ChannelEvent::Notification(notification));
                } else {
                    tracing::debug!(id = %notification.id, "duplicate notification suppressed");
                }
                Dispatch::Handled
            }
            ServerMessage::UnreadCount { count } => {
                self.unread.set_from_server(count);
                self.publish(ChannelEvent::UnreadCount(count));
                Dispatch::Handled
            }
            ServerMessage::MarkReadResponse { notification_ids } => {
                tracing::debug!(acknowledged = notification_ids.len(), "mark_read confirmed");
                Dispatch::Reply(ClientAction::GetUnreadCount)
            }
            ServerMessage::Pong => Dispatch::Pong,
            ServerMessage::Error { message } => {
                tracing::warn!(%message, "channel error from server");
                self.publish(ChannelEvent::ServerError(message));
                Dispatch::Handled
            }
        }
    }

    fn record_error(&self, error: &str) {
        tracing::warn!(error = %truncate_message(error, 300), "notification channel error");
        self.runtime().last_error = Some(truncate_message(error, 300));
    }

    fn mark_connected(&self) {
        let now = unix_now_secs();
        let mut runtime = self.runtime();
        runtime.last_connected_at = Some(now);
        runtime.last_event_at = Some(now);
        runtime.last_error = None;
        runtime.backoff_ms = 0;
        runtime.connections = runtime.connections.saturating_add(1);
    }

    fn mark_activity(&self) {
        self.runtime().last_event_at = Some(unix_now_secs());
    }
}

/// Persistent, authenticated notification socket.
///
/// Owns the SeenSet and the unread count; subscribers only read them.
#[derive(Clone)]
pub struct NotificationChannel {
    inner: Arc<ChannelShared>,
}

impl NotificationChannel {
    pub fn new(
        config: ChannelConfig,
        session: SessionStore,
        coordinator: Option<RefreshCoordinator>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            inner: Arc::new(ChannelShared {
                config,
                session,
                coordinator,
                runtime: Mutex::new(RuntimeState::default()),
                state_tx,
                unread: UnreadCounter::default(),
                seen: Mutex::new(SeenSet::default()),
                events,
            }),
        }
    }

    /// Spawns the connection task. A no-op while a task serves the current
    /// sign-in; a task left over from an earlier sign-in is replaced.
    pub fn start(&self) -> Result<(), ChannelError> {
        if !self.inner.session.is_authenticated() {
            return Err(ChannelError::SignedOut);
        }
        let generation = self.inner.session.generation();

        let mut runtime = self.inner.runtime();
        if let Some(previous) = runtime.stop_tx.take() {
            if runtime.session_generation == generation {
                runtime.stop_tx = Some(previous);
                return Ok(());
            }
            tracing::info!("notification channel belongs to an ended session, restarting");
            let _ = previous.send(true);
            // Detached; it closes its socket and exits without touching state.
            runtime.task = None;
            self.inner.transition(ConnectionState::Disconnected);
        }
        if runtime.session_generation != generation {
            self.inner.seen().clear();
            self.inner.unread.reset();
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        runtime.channel_epoch = runtime.channel_epoch.wrapping_add(1);
        let scope = TaskScope {
            epoch: runtime.channel_epoch,
            generation,
        };
        runtime.session_generation = generation;
        runtime.stop_tx = Some(stop_tx);
        runtime.outbound = Some(outbound_tx);
        runtime.last_error = None;
        runtime.backoff_ms = 0;
        runtime.reconnect_attempts = 0;

        tracing::info!(url = %redact_token_url(&self.inner.config.url), "starting notification channel");
        let shared = Arc::clone(&self.inner);
        runtime.task = Some(tokio::spawn(run_channel_loop(
            shared,
            stop_rx,
            outbound_rx,
            scope,
        )));
        Ok(())
    }

    /// Tears the socket down, cancels any pending reconnect and waits for the
    /// task to exit.
    pub async fn stop(&self) {
        let (stop_tx, task) = {
            let mut runtime = self.inner.runtime();
            runtime.outbound = None;
            runtime.backoff_ms = 0;
            (runtime.stop_tx.take(), runtime.task.take())
        };
        if let Some(stop_tx) = stop_tx {
            let _ = stop_tx.send(true);
        }
        self.inner.transition(ConnectionState::Disconnected);

        let Some(task) = task else {
            return;
        };
        let abort = task.abort_handle();
        match tokio::time::timeout(Duration::from_secs(CHANNEL_STOP_GRACE_SECS), task).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => tracing::warn!(%error, "notification channel task failed"),
            Err(_) => {
                tracing::warn!("notification channel task did not stop in time, aborting");
                abort.abort();
            }
        }
        tracing::info!("notification channel stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.runtime().stop_tx.is_some()
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.inner.events.subscribe()
    }

    pub fn unread_count(&self) -> Option<u64> {
        self.inner.unread.get()
    }

    pub fn subscribe_unread(&self) -> watch::Receiver<Option<u64>> {
        self.inner.unread.subscribe()
    }

    /// Acknowledges `ids` to the server. The local count is left alone; the
    /// server's confirmation triggers a fresh count.
    pub fn mark_as_read(&self, ids: Vec<String>) -> Result<(), ChannelError> {
        if ids.is_empty() {
            return Ok(());
        }
        self.send_action(ClientAction::MarkRead {
            notification_ids: ids,
        })
    }

    pub fn request_unread_count(&self) -> Result<(), ChannelError> {
        self.send_action(ClientAction::GetUnreadCount)
    }

    pub fn diagnostics(&self) -> ChannelDiagnostics {
        snapshot_channel(&self.inner)
    }

    fn send_action(&self, action: ClientAction) -> Result<(), ChannelError> {
        if self.state() != ConnectionState::Connected {
            return Err(ChannelError::NotConnected);
        }
        let runtime = self.inner.runtime();
        let outbound = runtime.outbound.as_ref().ok_or(ChannelError::NotConnected)?;
        outbound
            .send(action)
            .map_err(|_| ChannelError::NotConnected)
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &ChannelShared {
        &self.inner
    }
}

async fn run_channel_loop(
    shared: Arc<ChannelShared>,
    mut stop_rx: watch::Receiver<bool>,
    mut outbound_rx: mpsc::UnboundedReceiver<ClientAction>,
    scope: TaskScope,
) {
    let mut auth_rx = shared.session.subscribe();
    let mut backoff = Backoff::new(shared.config.backoff_initial, shared.config.backoff_max);
    let mut refreshed_for_handshake = false;
    tracing::debug!(epoch = scope.epoch, "channel task started");

    loop {
        if *stop_rx.borrow() {
            break;
        }
        let Some(token) = shared.session.access_for(scope.generation) else {
            break;
        };

        shared.transition_for(scope, ConnectionState::Connecting);
        let attempt = tokio::select! {
            _ = wait_for_shutdown(&shared, scope, &mut stop_rx, &mut auth_rx) => break,
            result = connect_once(&shared.config, &token) => result,
        };

        let ws = match attempt {
            Ok(ws) => ws,
            Err(ConnectFailure::Unauthorized) => {
                shared.record_error("Channel handshake rejected the access credential");
                if refreshed_for_handshake {
                    tracing::warn!("channel handshake rejected a refreshed credential, signing out");
                    if shared.session.is_current(scope.generation) {
                        shared.session.logout();
                    }
                    break;
                }
                let Some(coordinator) = shared.coordinator.as_ref() else {
                    tracing::warn!("no refresh available for channel credential, stopping");
                    break;
                };
                match coordinator.refresh(Some(&token)).await {
                    Ok(_) => refreshed_for_handshake = true,
                    Err(RefreshError::Unavailable(_)) => {}
                    Err(error) => {
                        tracing::info!(%error, "channel credential could not be refreshed, stopping");
                        break;
                    }
                }
                if !backoff_wait(&shared, scope, &mut backoff, &mut stop_rx, &mut auth_rx).await {
                    break;
                }
                continue;
            }
            Err(ConnectFailure::Other(error)) => {
                shared.record_error(&error);
                if !backoff_wait(&shared, scope, &mut backoff, &mut stop_rx, &mut auth_rx).await {
                    break;
                }
                continue;
            }
        };

        backoff.reset();
        refreshed_for_handshake = false;
        match run_session(&shared, scope, ws, &mut stop_rx, &mut auth_rx, &mut outbound_rx).await {
            SessionEnd::Shutdown => break,
            SessionEnd::Dropped(reason) => {
                shared.record_error(&reason);
                shared.transition_for(scope, ConnectionState::Reconnecting);
                if !backoff_wait(&shared, scope, &mut backoff, &mut stop_rx, &mut auth_rx).await {
                    break;
                }
            }
        }
    }

    {
        let mut runtime = shared.runtime();
        if runtime.channel_epoch == scope.epoch {
            runtime.stop_tx = None;
            runtime.outbound = None;
            runtime.task = None;
            runtime.backoff_ms = 0;
            shared.transition(ConnectionState::Disconnected);
        }
    }
    tracing::debug!(epoch = scope.epoch, "channel task exited");
}

/// Resolves once the channel is stopped or the sign-in `scope` serves has
/// ended, including a logout immediately followed by a new login.
async fn wait_for_shutdown(
    shared: &ChannelShared,
    scope: TaskScope,
    stop_rx: &mut watch::Receiver<bool>,
    auth_rx: &mut watch::Receiver<bool>,
) {
    loop {
        auth_rx.borrow_and_update();
        if *stop_rx.borrow_and_update() || !shared.session.is_current(scope.generation) {
            return;
        }
        tokio::select! {
            changed = stop_rx.changed() => if changed.is_err() { return; },
            changed = auth_rx.changed() => if changed.is_err() { return; },
        }
    }
}

/// Sleeps for the next backoff delay. `false` when shut down meanwhile.
async fn backoff_wait(
    shared: &ChannelShared,
    scope: TaskScope,
    backoff: &mut Backoff,
    stop_rx: &mut watch::Receiver<bool>,
    auth_rx: &mut watch::Receiver<bool>,
) -> bool {
    let delay = backoff.next_delay();
    {
        let mut runtime = shared.runtime();
        if runtime.channel_epoch == scope.epoch {
            runtime.backoff_ms = delay.as_millis() as u64;
            runtime.reconnect_attempts = runtime.reconnect_attempts.saturating_add(1);
        }
    }
    tracing::debug!(delay_ms = delay.as_millis() as u64, "channel reconnect scheduled");

    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = wait_for_shutdown(shared, scope, stop_rx, auth_rx) => {
            tracing::debug!("pending reconnect cancelled");
            false
        }
    }
}

fn handshake_url(base: &str, token: &str) -> Result<String, String> {
    let mut url =
        reqwest::Url::parse(base).map_err(|error| format!("Invalid channel URL: {error}"))?;
    url.query_pairs_mut().append_pair("token", token.trim());
    Ok(url.to_string())
}

async fn connect_once(config: &ChannelConfig, token: &str) -> Result<WsStream, ConnectFailure> {
    let url = handshake_url(&config.url, token).map_err(ConnectFailure::Other)?;
    tracing::debug!(url = %redact_token_url(&url), "channel connect");
    let request = url
        .as_str()
        .into_client_request()
        .map_err(|error| ConnectFailure::Other(format!("Failed to build channel request: {error}")))?;

    match tokio::time::timeout(config.connect_timeout, connect_async(request)).await {
        Err(_) => Err(ConnectFailure::Other(format!(
            "Channel connection timed out after {} ms",
            config.connect_timeout.as_millis()
        ))),
        Ok(Err(tungstenite::Error::Http(response)))
            if matches!(response.status(), StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) =>
        {
            Err(ConnectFailure::Unauthorized)
        }
        Ok(Err(error)) => Err(ConnectFailure::Other(format!(
            "Channel connection failed: {error}"
        ))),
        Ok(Ok((ws, _))) => Ok(ws),
    }
}

async fn send_action(ws: &mut WsStream, action: &ClientAction) -> Result<(), String> {
    ws.send(Message::Text(action.to_json().into()))
        .await
        .map_err(|error| format!("Failed to send {action:?}: {error}"))
}

async fn run_session(
    shared: &ChannelShared,
    scope: TaskScope,
    mut ws: WsStream,
    stop_rx: &mut watch::Receiver<bool>,
    auth_rx: &mut watch::Receiver<bool>,
    outbound_rx: &mut mpsc::UnboundedReceiver<ClientAction>,
) -> SessionEnd {
    shared.mark_connected();
    shared.transition_for(scope, ConnectionState::Connected);
    tracing::info!("notification channel connected");

    // Actions queued for a socket that is gone are not replayed.
    while outbound_rx.try_recv().is_ok() {}

    // Events that happened while disconnected are not redelivered; resync.
    if let Err(error) = send_action(&mut ws, &ClientAction::GetUnreadCount).await {
        return SessionEnd::Dropped(error);
    }
    shared.runtime().resync_requests += 1;

    let ping_every = shared.config.ping_interval;
    let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + ping_every, ping_every);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut awaiting_pong = false;
    let mut missed_pongs: u32 = 0;

    loop {
        tokio::select! {
            _ = wait_for_shutdown(shared, scope, stop_rx, auth_rx) => {
                let _ = ws.close(None).await;
                return SessionEnd::Shutdown;
            }
            incoming = ws.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        // Frames racing a sign-out belong to the old account.
                        if *stop_rx.borrow() || !shared.session.is_current(scope.generation) {
                            let _ = ws.close(None).await;
                            return SessionEnd::Shutdown;
                        }
                        shared.mark_activity();
                        match shared.dispatch(text.as_str()) {
                            Dispatch::Handled => {}
                            Dispatch::Pong => {
                                awaiting_pong = false;
                                missed_pongs = 0;
                            }
                            Dispatch::Reply(action) => {
                                if let Err(error) = send_action(&mut ws, &action).await {
                                    return SessionEnd::Dropped(error);
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        shared.mark_activity();
                        if let Err(error) = ws.send(Message::Pong(payload)).await {
                            return SessionEnd::Dropped(format!("Failed to send pong: {error}"));
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        shared.mark_activity();
                        awaiting_pong = false;
                        missed_pongs = 0;
                    }
                    Some(Ok(Message::Close(_))) => {
                        return SessionEnd::Dropped("Channel closed by server".to_string());
                    }
                    Some(Ok(_)) => shared.mark_activity(),
                    Some(Err(error)) => return SessionEnd::Dropped(format!("Channel read error: {error}")),
                    None => return SessionEnd::Dropped("Channel ended unexpectedly".to_string()),
                }
            }
            action = outbound_rx.recv() => {
                let Some(action) = action else {
                    let _ = ws.close(None).await;
                    return SessionEnd::Shutdown;
                };
                if let Err(error) = send_action(&mut ws, &action).await {
                    return SessionEnd::Dropped(error);
                }
            }
            _ = ping.tick() => {
                if awaiting_pong {
                    missed_pongs = missed_pongs.saturating_add(1);
                    if missed_pongs >= shared.config.max_missed_pongs {
                        return SessionEnd::Dropped(format!(
                            "Channel liveness timeout after {missed_pongs} missed pongs"
                        ));
                    }
                }
                if let Err(error) = send_action(&mut ws, &ClientAction::Ping).await {
                    return SessionEnd::Dropped(error);
                }
                awaiting_pong = true;
            }
        }
    }
}
