//! EventSub connection worker
//!
//! Owns the socket, the reconnect timer and the in-flight attempt. Runs on one
//! dedicated thread with a current-thread tokio runtime, so every callback
//! (attempt completion, frame read, timer fire, watchdog tick) executes
//! sequentially on that thread.
//!
//! The loop stays alive for as long as the `WorkerHandle` holds the command
//! sender, idle or not; it exits on `Command::Shutdown`.

use std::{
    borrow::Cow,
    future::pending,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use futures_util::{future::BoxFuture, SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    sync::mpsc,
    time::{sleep, timeout, Sleep},
};
use tokio_tungstenite::{
    client_async_tls_with_config,
    tungstenite::{
        client::IntoClientRequest,
        protocol::{frame::coding::CloseCode, CloseFrame, WebSocketConfig},
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};

use super::{
    filter::{self, NotificationRequest},
    session::{
        ConnectTrigger, ConnectionState, ScheduleDecision, Session, SessionError, TransitionReason,
    },
    sinks::Sinks,
    url,
    watchdog::{Watchdog, WatchdogAction},
};
use crate::config::ConnectionConfig;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub type Attempt<S> = BoxFuture<'static, Result<WebSocketStream<S>, SessionError>>;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub enum Command {
    Connect(ConnectTrigger),
    Shutdown,
}

/// Opens one WebSocket connection per attempt. The session is already in
/// Resolving when `connect` is called; implementations move it forward.
pub trait Connect: Send + Sync + 'static {
    type Io: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn connect(
        &self,
        websocket_url: Arc<String>,
        session: Arc<Session>,
        phase_timeout: Duration,
    ) -> Attempt<Self::Io>;
}

/// Resolve, TCP connect, then TLS/WebSocket upgrade
#[derive(Debug, Clone, Copy, Default)]
pub struct TlsConnect;

impl Connect for TlsConnect {
    type Io = MaybeTlsStream<TcpStream>;

    fn connect(
        &self,
        websocket_url: Arc<String>,
        session: Arc<Session>,
        phase_timeout: Duration,
    ) -> Attempt<Self::Io> {
        Box::pin(establish(websocket_url, session, phase_timeout))
    }
}

/// Everything the worker shares with the host side. `session` belongs to
/// this worker alone; `generation` gates what it may report to the sinks.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub session: Arc<Session>,
    pub config: Arc<ConnectionConfig>,
    pub sinks: Arc<Sinks>,
    pub generation: u64,
    pub watchdog_interval: Duration,
    pub connect_timeout: Duration,
    pub liveness_ping: bool,
}

impl WorkerContext {
    fn report_status(&self, connected: bool) {
        if self.sinks.is_current(self.generation) {
            self.sinks.notify_status(connected);
        } else {
            debug!(connected, generation = self.generation, "dropping status from retired worker");
        }
    }

    /// Run one payload through the filter and forward any resulting
    /// notification. Parse errors are counted and dropped here.
    pub fn dispatch(&self, payload: &[u8]) -> Option<NotificationRequest> {
        let metrics = self.session.metrics();
        metrics.record_message();

        match filter::evaluate(
            payload,
            self.config.threshold(),
            self.config.notification_duration_secs(),
        ) {
            Ok(Some(request)) => {
                metrics.record_notification();
                if self.sinks.is_current(self.generation) {
                    self.sinks.notify(&request);
                }
                Some(request)
            }
            Ok(None) => None,
            Err(e) => {
                metrics.record_parse_error();
                warn!(error = %e, bytes = payload.len(), "discarding eventsub message");
                None
            }
        }
    }
}

// =============================================================================
// HANDLE
// =============================================================================

/// Host-side handle to the worker thread
#[derive(Debug)]
pub struct WorkerHandle {
    commands: mpsc::UnboundedSender<Command>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Build the runtime, start the worker thread and kick off the first
    /// connection attempt.
    pub fn spawn(ctx: WorkerContext) -> std::io::Result<Self> {
        Self::spawn_with(ctx, TlsConnect)
    }

    pub fn spawn_with<C: Connect>(ctx: WorkerContext, connector: C) -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let (commands, rx) = mpsc::unbounded_channel();
        let worker = Worker::new(ctx, connector, rx);

        let thread = thread::Builder::new()
            .name("eventsub-worker".to_string())
            .spawn(move || {
                runtime.block_on(worker.run());
            })?;

        Ok(Self {
            commands,
            thread: Some(thread),
        })
    }

    pub fn request(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!("eventsub worker already stopped");
        }
    }

    /// Stop the worker and wait for it to close the socket. From inside a
    /// sink callback (the worker thread itself) this only signals.
    pub fn shutdown(mut self) {
        self.request(Command::Shutdown);

        let Some(handle) = self.thread.take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            debug!("shutdown requested from worker thread, not joining");
            return;
        }
        if handle.join().is_err() {
            error!("eventsub worker thread panicked");
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            let _ = self.commands.send(Command::Shutdown);
        }
    }
}

// =============================================================================
// WORKER
// =============================================================================

struct Worker<C: Connect> {
    ctx: WorkerContext,
    connector: C,
    commands: mpsc::UnboundedReceiver<Command>,
    watchdog: Watchdog,
    reconnect: Option<Pin<Box<Sleep>>>,
    attempt: Option<Attempt<C::Io>>,
    stream: Option<WebSocketStream<C::Io>>,
}

async fn wait_reconnect(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(timer) => timer.as_mut().await,
        None => pending().await,
    }
}

async fn wait_attempt<S>(
    attempt: &mut Option<Attempt<S>>,
) -> Result<WebSocketStream<S>, SessionError> {
    match attempt {
        Some(attempt) => attempt.await,
        None => pending().await,
    }
}

async fn next_frame<S>(
    stream: &mut Option<WebSocketStream<S>>,
) -> Option<Result<Message, tokio_tungstenite::tungstenite::Error>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match stream {
        Some(stream) => stream.next().await,
        None => pending().await,
    }
}

impl<C: Connect> Worker<C> {
    fn new(ctx: WorkerContext, connector: C, commands: mpsc::UnboundedReceiver<Command>) -> Self {
        let watchdog = Watchdog::new(ctx.watchdog_interval, ctx.liveness_ping);
        Self {
            ctx,
            connector,
            commands,
            watchdog,
            reconnect: None,
            attempt: None,
            stream: None,
        }
    }

    async fn run(mut self) {
        info!(
            url = %self.ctx.config.url(),
            watchdog_secs = self.watchdog.interval().as_secs(),
            "eventsub_worker_started"
        );
        let mut ticker = self.watchdog.ticker();
        self.connect(ConnectTrigger::Startup);

        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Connect(trigger)) => self.connect(trigger),
                    Some(Command::Shutdown) | None => break,
                },
                _ = wait_reconnect(&mut self.reconnect) => {
                    self.reconnect = None;
                    self.start_attempt();
                }
                result = wait_attempt(&mut self.attempt) => {
                    self.attempt = None;
                    self.on_attempt_done(result);
                }
                frame = next_frame(&mut self.stream) => {
                    self.on_frame(frame).await;
                }
                _ = ticker.tick() => {
                    self.on_watchdog_tick().await;
                }
            }
        }

        self.close().await;
        info!(
            metrics = %self.ctx.session.metrics().summary(),
            "eventsub_worker_stopped"
        );
    }

    /// Ask the session whether to arm the reconnect timer, and arm it.
    fn connect(&mut self, trigger: ConnectTrigger) {
        match self.ctx.session.schedule(trigger) {
            ScheduleDecision::Armed { delay, .. } => {
                if self.reconnect.replace(Box::pin(sleep(delay))).is_some() {
                    warn!("replaced an armed reconnect timer");
                }
            }
            ScheduleDecision::AlreadyPending => {
                debug!(trigger = %trigger, "reconnect already pending");
            }
            ScheduleDecision::AlreadyActive(state) => {
                debug!(trigger = %trigger, state = %state, "connection already active");
            }
            ScheduleDecision::Halted { attempts } => {
                let e = SessionError::AutomationHalted { attempts };
                debug!(error = %e, trigger = %trigger, "not scheduling reconnect");
            }
        }
    }

    fn cancel_reconnect(&mut self) {
        if self.reconnect.take().is_some() {
            self.ctx.session.cancel_pending();
            debug!("reconnect timer cancelled");
        }
    }

    fn start_attempt(&mut self) {
        let url = self.ctx.config.connect_url();
        self.ctx.session.begin_attempt();
        info!(url = %url, attempt = self.ctx.session.attempt(), "connecting to eventsub");

        self.attempt = Some(self.connector.connect(
            url,
            self.ctx.session.clone(),
            self.ctx.connect_timeout,
        ));
    }

    fn on_attempt_done(&mut self, result: Result<WebSocketStream<C::Io>, SessionError>) {
        match result {
            Ok(ws) => {
                self.stream = Some(ws);
                self.watchdog.reset();
                self.ctx
                    .session
                    .transition(ConnectionState::Listening, TransitionReason::HandshakeOk);
                info!("connected to eventsub");
                self.ctx.report_status(true);
            }
            Err(e) => {
                let reason = e.reason();
                warn!(error = %e, "eventsub connection attempt failed");
                self.ctx
                    .session
                    .transition(ConnectionState::Disconnected, reason);
                self.connect(ConnectTrigger::Failure(reason));
            }
        }
    }

    async fn on_frame(
        &mut self,
        frame: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>,
    ) {
        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                self.on_read_failure(TransitionReason::ReadFailure, &e.to_string());
                return;
            }
            None => {
                self.on_read_failure(TransitionReason::ServerClose, "stream ended");
                return;
            }
        };

        self.watchdog.record_activity();
        match frame {
            Message::Text(text) => {
                self.ctx.dispatch(text.as_bytes());
            }
            Message::Binary(data) => {
                self.ctx.dispatch(&data);
            }
            Message::Ping(payload) => {
                let sent = match self.stream.as_mut() {
                    Some(ws) => ws.send(Message::Pong(payload)).await,
                    None => Ok(()),
                };
                if let Err(e) = sent {
                    self.on_read_failure(TransitionReason::ReadFailure, &e.to_string());
                }
            }
            Message::Pong(_) => {
                debug!("received pong");
            }
            Message::Close(frame) => {
                info!(?frame, "eventsub closed by server");
                self.on_read_failure(TransitionReason::ServerClose, "close frame");
            }
            Message::Frame(_) => {}
        }
    }

    /// Drop the socket, report disconnected, and go back through backoff.
    fn on_read_failure(&mut self, reason: TransitionReason, detail: &str) {
        let e = SessionError::ReadFailure(detail.to_string());
        warn!(error = %e, reason = %reason, "eventsub connection lost");

        self.stream = None;
        self.ctx
            .session
            .transition(ConnectionState::Disconnected, reason);
        self.ctx.report_status(false);
        self.connect(ConnectTrigger::Failure(reason));
    }

    async fn on_watchdog_tick(&mut self) {
        let state = self.ctx.session.state();
        match self.watchdog.check(state) {
            WatchdogAction::Healthy => {}
            WatchdogAction::Reconnect => {
                self.ctx.session.metrics().record_watchdog_trigger();
                if state == ConnectionState::Disconnected {
                    warn!("eventsub disconnected, watchdog requesting reconnect");
                }
                self.connect(ConnectTrigger::Watchdog);
            }
            WatchdogAction::SendPing => {
                let sent = match self.stream.as_mut() {
                    Some(ws) => ws.send(Message::Ping(Vec::new())).await,
                    None => Ok(()),
                };
                if let Err(e) = sent {
                    self.on_read_failure(TransitionReason::ReadFailure, &e.to_string());
                }
            }
            WatchdogAction::Stale => {
                self.on_read_failure(
                    TransitionReason::StaleConnection,
                    "no inbound frame since last ping",
                );
            }
        }
    }

    async fn close(&mut self) {
        self.cancel_reconnect();
        self.attempt = None;

        if let Some(mut ws) = self.stream.take() {
            let frame = CloseFrame {
                code: CloseCode::Normal,
                reason: Cow::Borrowed("shutdown"),
            };
            match timeout(CLOSE_TIMEOUT, ws.close(Some(frame))).await {
                Ok(Ok(())) => debug!("eventsub socket closed"),
                Ok(Err(e)) => debug!(error = %e, "eventsub close failed"),
                Err(_) => debug!("eventsub close timed out"),
            }
        }

        self.ctx
            .session
            .transition(ConnectionState::Disconnected, TransitionReason::ShutdownRequested);
        self.ctx.report_status(false);
        info!("eventsub connection closed");
    }
}

// =============================================================================
// CONNECTION ATTEMPT
// =============================================================================

/// WebSocket protocol configuration
fn ws_config() -> WebSocketConfig {
    WebSocketConfig {
        max_message_size: Some(1024 * 1024),
        max_frame_size: Some(1024 * 1024),
        accept_unmasked_frames: false,
        ..Default::default()
    }
}

/// Resolve → TCP connect → TLS/WebSocket handshake, each phase bounded by
/// `phase_timeout`. Caller has already moved the session into Resolving.
pub async fn establish(
    websocket_url: Arc<String>,
    session: Arc<Session>,
    phase_timeout: Duration,
) -> Result<WsStream, SessionError> {
    let endpoint =
        url::parse(&websocket_url).map_err(|e| SessionError::InvalidUrl(e.to_string()))?;
    let port = endpoint.port_or_default();
    let (host, path) = endpoint.host_and_path();
    debug!(host, port, path, "resolving");

    let addrs: Vec<SocketAddr> = match timeout(
        phase_timeout,
        tokio::net::lookup_host((host, port)),
    )
    .await
    {
        Ok(Ok(addrs)) => addrs.collect(),
        Ok(Err(e)) => return Err(SessionError::ResolutionFailure(e.to_string())),
        Err(_) => return Err(SessionError::Timeout(TransitionReason::ResolutionFailure)),
    };
    if addrs.is_empty() {
        return Err(SessionError::ResolutionFailure(format!(
            "no addresses for {}",
            host
        )));
    }
    debug!(host, ?addrs, "resolved");
    session.transition(ConnectionState::Connecting, TransitionReason::Resolved);

    let tcp = match timeout(phase_timeout, connect_any(&addrs)).await {
        Ok(result) => result?,
        Err(_) => return Err(SessionError::Timeout(TransitionReason::ConnectFailure)),
    };
    if let Err(e) = tcp.set_nodelay(true) {
        debug!(error = %e, "set_nodelay failed");
    }
    session.transition(ConnectionState::HandshakeInFlight, TransitionReason::TcpConnected);

    let request = websocket_url
        .as_str()
        .into_client_request()
        .map_err(|e| SessionError::HandshakeFailure(e.to_string()))?;

    match timeout(
        phase_timeout,
        client_async_tls_with_config(request, tcp, Some(ws_config()), None),
    )
    .await
    {
        Ok(Ok((ws, response))) => {
            debug!(status = %response.status(), "handshake complete");
            Ok(ws)
        }
        Ok(Err(e)) => Err(SessionError::HandshakeFailure(e.to_string())),
        Err(_) => Err(SessionError::Timeout(TransitionReason::HandshakeFailure)),
    }
}

/// Try each resolved address in order; report the last error.
async fn connect_any(addrs: &[SocketAddr]) -> Result<TcpStream, SessionError> {
    let mut last_error = None;
    for &addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!(%addr, error = %e, "tcp connect failed");
                last_error = Some(e);
            }
        }
    }
    Err(SessionError::ConnectFailure(
        last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no addresses".to_string()),
    ))
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LimiterConfig, Threshold};
    use crate::eventsub::backoff::BackoffPolicy;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::DuplexStream;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
    use tokio::task::JoinHandle as TaskHandle;
    use tokio_tungstenite::tungstenite::protocol::Role;

    fn context() -> WorkerContext {
        let config = LimiterConfig::default();
        WorkerContext {
            session: Arc::new(Session::new(config.backoff_policy())),
            config: ConnectionConfig::new(&config),
            sinks: Sinks::new(),
            generation: 0,
            watchdog_interval: config.watchdog_interval(),
            connect_timeout: Duration::from_secs(2),
            liveness_ping: true,
        }
    }

    fn redemption(cost: u64) -> String {
        format!(
            r#"{{"type":"notification","subscription":{{"type":"{}"}},"event":{{"reward":{{"cost":{}}}}}}}"#,
            filter::EVENTSUB_BET_EVENT,
            cost
        )
    }

    #[test]
    fn test_dispatch_notifies_once_per_qualifying_event() {
        let ctx = context();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        ctx.sinks.set_notification(Arc::new(move |message, duration| {
            assert_eq!(message, "Bet exceeds limit! Max: 5000");
            assert_eq!(duration, 30);
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(ctx.dispatch(redemption(7500).as_bytes()).is_some());
        assert!(ctx.dispatch(redemption(4000).as_bytes()).is_none());
        assert!(ctx.dispatch(redemption(9000).as_bytes()).is_some());
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_dispatch_reads_config_on_every_message() {
        let ctx = context();
        assert!(ctx.dispatch(redemption(7500).as_bytes()).is_some());

        ctx.config.set_threshold(true, 10_000);
        assert!(ctx.dispatch(redemption(7500).as_bytes()).is_none());

        ctx.config.set_threshold_enabled(false);
        assert_eq!(ctx.config.threshold(), Threshold::Disabled);
        assert!(ctx.dispatch(redemption(99_999).as_bytes()).is_none());

        ctx.config.set_threshold(true, 5000);
        ctx.config.set_notification_duration(60);
        let request = ctx.dispatch(redemption(7500).as_bytes()).unwrap();
        assert_eq!(request.duration_secs, 60);
    }

    #[test]
    fn test_dispatch_swallows_malformed_messages() {
        let ctx = context();
        assert!(ctx.dispatch(b"{not json").is_none());
        assert!(ctx.dispatch(br#"{"no_type":true}"#).is_none());
        // The next good message still goes through.
        assert!(ctx.dispatch(redemption(7500).as_bytes()).is_some());

        let metrics = ctx.session.metrics();
        assert_eq!(metrics.parse_errors.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.messages_received.load(Ordering::Relaxed), 3);
        assert_eq!(metrics.notifications_raised.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_establish_refused_is_connect_failure() {
        // Bind then drop to get a local port with nothing listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let session = Arc::new(Session::new(BackoffPolicy::default()));
        let url = Arc::new(format!("wss://127.0.0.1:{}/ws", port));
        let err = establish(url, session.clone(), Duration::from_secs(2))
            .await
            .unwrap_err();

        assert_eq!(err.reason(), TransitionReason::ConnectFailure);
        assert_eq!(session.state(), ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn test_establish_dropped_during_upgrade_is_handshake_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            if let Ok((socket, _)) = listener.accept().await {
                drop(socket);
            }
        });

        let session = Arc::new(Session::new(BackoffPolicy::default()));
        let url = Arc::new(format!("wss://127.0.0.1:{}/ws", port));
        let err = establish(url, session.clone(), Duration::from_secs(2))
            .await
            .unwrap_err();

        assert_eq!(err.reason(), TransitionReason::HandshakeFailure);
        assert_eq!(session.state(), ConnectionState::HandshakeInFlight);
    }

    #[tokio::test]
    async fn test_establish_rejects_unparsable_url() {
        let session = Arc::new(Session::new(BackoffPolicy::default()));
        let err = establish(Arc::new("notaurl".to_string()), session, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::InvalidUrl(_)));
    }

    // -------------------------------------------------------------------------
    // Live loop over an in-memory socket
    // -------------------------------------------------------------------------

    /// Hands the server half of a fresh in-memory pipe to the test on every
    /// attempt; the client half becomes the worker's socket.
    struct DuplexConnect {
        peers: UnboundedSender<DuplexStream>,
    }

    impl Connect for DuplexConnect {
        type Io = DuplexStream;

        fn connect(
            &self,
            _websocket_url: Arc<String>,
            session: Arc<Session>,
            _phase_timeout: Duration,
        ) -> Attempt<DuplexStream> {
            let (client, server) = tokio::io::duplex(64 * 1024);
            let handed_over = self.peers.send(server).is_ok();
            Box::pin(async move {
                if !handed_over {
                    return Err(SessionError::ConnectFailure("no peer".to_string()));
                }
                session.transition(ConnectionState::Connecting, TransitionReason::Resolved);
                session.transition(ConnectionState::HandshakeInFlight, TransitionReason::TcpConnected);
                Ok(WebSocketStream::from_raw_socket(client, Role::Client, None).await)
            })
        }
    }

    struct Running {
        commands: UnboundedSender<Command>,
        peers: UnboundedReceiver<DuplexStream>,
        task: TaskHandle<()>,
    }

    impl Running {
        fn start(ctx: WorkerContext) -> Self {
            let (peer_tx, peers) = unbounded_channel();
            let (commands, rx) = unbounded_channel();
            let worker = Worker::new(ctx, DuplexConnect { peers: peer_tx }, rx);
            Self {
                commands,
                peers,
                task: tokio::spawn(worker.run()),
            }
        }

        async fn accept(&mut self) -> WebSocketStream<DuplexStream> {
            let io = timeout(Duration::from_secs(5), self.peers.recv())
                .await
                .unwrap()
                .unwrap();
            WebSocketStream::from_raw_socket(io, Role::Server, None).await
        }

        async fn stop(self) {
            self.commands.send(Command::Shutdown).unwrap();
            timeout(Duration::from_secs(5), self.task)
                .await
                .unwrap()
                .unwrap();
        }
    }

    struct Observed {
        status: UnboundedReceiver<bool>,
        notifications: UnboundedReceiver<(String, u64)>,
    }

    impl Observed {
        async fn next_status(&mut self) -> bool {
            timeout(Duration::from_secs(5), self.status.recv())
                .await
                .unwrap()
                .unwrap()
        }
    }

    fn observe(sinks: &Sinks) -> Observed {
        let (status_tx, status) = unbounded_channel();
        sinks.set_status(Arc::new(move |connected: bool| {
            let _ = status_tx.send(connected);
        }));
        let (note_tx, notifications) = unbounded_channel();
        sinks.set_notification(Arc::new(move |message: &str, duration: u64| {
            let _ = note_tx.send((message.to_string(), duration));
        }));
        Observed {
            status,
            notifications,
        }
    }

    fn live_context(watchdog_interval: Duration) -> WorkerContext {
        WorkerContext {
            watchdog_interval,
            ..context()
        }
    }

    #[tokio::test]
    async fn test_malformed_message_keeps_listening() {
        let ctx = live_context(Duration::from_secs(3600));
        let mut seen = observe(&ctx.sinks);
        let mut worker = Running::start(ctx.clone());
        let mut server = worker.accept().await;

        assert!(seen.next_status().await);
        assert!(ctx.session.is_connected());
        assert_eq!(ctx.session.attempt(), 0);

        server.send(Message::Text("{not json".to_string())).await.unwrap();
        server.send(Message::Text(redemption(7500))).await.unwrap();

        let (message, duration) = timeout(Duration::from_secs(5), seen.notifications.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message, "Bet exceeds limit! Max: 5000");
        assert_eq!(duration, 30);

        let snap = ctx.session.snapshot();
        assert_eq!(snap.state, ConnectionState::Listening);
        assert!(!snap.reconnect_pending);
        let metrics = ctx.session.metrics();
        assert_eq!(metrics.parse_errors.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.connections_attempted.load(Ordering::Relaxed), 1);
        assert!(seen.status.try_recv().is_err());

        worker.stop().await;
        assert!(!seen.next_status().await);
    }

    #[tokio::test]
    async fn test_peer_close_reports_and_backs_off() {
        let ctx = live_context(Duration::from_secs(3600));
        let mut seen = observe(&ctx.sinks);
        let mut worker = Running::start(ctx.clone());
        let mut server = worker.accept().await;
        assert!(seen.next_status().await);

        server.close(None).await.unwrap();
        assert!(!seen.next_status().await);

        let snap = ctx.session.snapshot();
        assert_eq!(snap.state, ConnectionState::Disconnected);
        assert!(snap.reconnect_pending);
        assert_eq!(snap.attempt, 1);
        assert_eq!(snap.reconnect_delay, Some(ctx.session.policy().next_delay(0)));
        assert_eq!(
            ctx.session.metrics().read_failures.load(Ordering::Relaxed),
            1
        );

        worker.stop().await;
    }

    #[tokio::test]
    async fn test_server_ping_is_answered() {
        let ctx = live_context(Duration::from_secs(3600));
        let mut seen = observe(&ctx.sinks);
        let mut worker = Running::start(ctx.clone());
        let mut server = worker.accept().await;
        assert!(seen.next_status().await);

        server.send(Message::Ping(b"hi".to_vec())).await.unwrap();
        let reply = timeout(Duration::from_secs(5), server.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(reply, Message::Pong(b"hi".to_vec()));
        assert!(ctx.session.is_connected());

        worker.stop().await;
    }

    #[tokio::test]
    async fn test_silent_socket_goes_stale_on_second_tick() {
        let ctx = live_context(Duration::from_millis(100));
        let mut seen = observe(&ctx.sinks);
        let mut worker = Running::start(ctx.clone());
        // Held open but never read, so the heartbeat ping goes unanswered.
        let _server = worker.accept().await;
        assert!(seen.next_status().await);

        assert!(!seen.next_status().await);
        let metrics = ctx.session.metrics();
        assert_eq!(metrics.stale_connections.load(Ordering::Relaxed), 1);
        assert!(ctx.session.snapshot().reconnect_pending);

        worker.stop().await;
    }

    #[tokio::test]
    async fn test_retired_worker_leaves_new_generation_alone() {
        let first_ctx = live_context(Duration::from_secs(3600));
        let mut seen = observe(&first_ctx.sinks);
        let mut first = Running::start(first_ctx.clone());
        let _first_server = first.accept().await;
        assert!(seen.next_status().await);

        let second_ctx = WorkerContext {
            session: Arc::new(Session::new(*first_ctx.session.policy())),
            generation: first_ctx.sinks.advance_generation(),
            ..first_ctx.clone()
        };
        let mut second = Running::start(second_ctx.clone());
        let _second_server = second.accept().await;
        assert!(seen.next_status().await);

        // The retired worker closes its own socket and session only.
        first.stop().await;
        assert_eq!(first_ctx.session.state(), ConnectionState::Disconnected);
        assert!(seen.status.try_recv().is_err());

        let snap = second_ctx.session.snapshot();
        assert_eq!(snap.state, ConnectionState::Listening);
        assert_eq!(snap.attempt, 0);
        assert!(!snap.reconnect_pending);

        second.stop().await;
        assert!(!seen.next_status().await);
    }
}
