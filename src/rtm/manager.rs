//! Managed realtime connection.
//!
//! [`RtmManager`] negotiates a session, dials the returned endpoint and keeps
//! the connection alive: a read loop feeds the event stream, a write loop
//! drains the send queue, and a ping loop probes liveness. When any of them
//! fails the manager tears the connection down and reconnects with backoff,
//! unless the caller asked to disconnect.

use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::{SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::retry::{with_timeout, RetryPolicy};
use crate::rtm::error::{DisconnectCause, RtmError, SendError};
use crate::rtm::events::{classify, RtmEvent};
use crate::rtm::id::{IdGenerator, SafeId};
use crate::rtm::proto::ClientFrame;
use crate::rtm::state::{ConnectionState, ManagerState};
use crate::rtm::transport::{Connection, Dialer, FrameSink, FrameStream, TransportError, WebSocketDialer};
use crate::web_api::{
    NegotiateContext, NegotiationError, NegotiationMode, Negotiator, SessionInfo, WebApiClient,
    WebApiDefaults,
};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);
/// How long termination waits for room in a full event queue.
const FINAL_EVENT_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RtmDefaults;

impl RtmDefaults {
    pub const PING_INTERVAL: Duration = Duration::from_secs(30);
    pub const MAX_LATENCY: Duration = Duration::from_secs(60);
    pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
    pub const EVENT_CAPACITY: usize = 50;
    pub const OUTGOING_CAPACITY: usize = 20;
    pub const PING_TABLE_CAPACITY: usize = 4;
    pub const MAX_MESSAGE_LEN: usize = 16_000;
}

/// Connection manager configuration. The defaults are usable as-is.
#[derive(Clone, Debug)]
pub struct RtmOptions {
    /// Always negotiate with `rtm.start`.
    pub use_legacy_negotiation: bool,
    /// Negotiate with `rtm.start` until the first successful connect, then
    /// switch to `rtm.connect`.
    pub full_on_cold_start: bool,
    pub ping_interval: Duration,
    /// Age at which an unacknowledged probe declares the connection dead.
    pub max_latency: Duration,
    pub reconnect_policy: RetryPolicy,
    pub negotiation_timeout: Duration,
    pub dial_timeout: Duration,
    pub event_capacity: usize,
    pub outgoing_capacity: usize,
    pub ping_table_capacity: usize,
    pub max_message_len: usize,
}

impl Default for RtmOptions {
    fn default() -> Self {
        Self {
            use_legacy_negotiation: false,
            full_on_cold_start: true,
            ping_interval: RtmDefaults::PING_INTERVAL,
            max_latency: RtmDefaults::MAX_LATENCY,
            reconnect_policy: RetryPolicy::reconnect(),
            negotiation_timeout: WebApiDefaults::NEGOTIATION_TIMEOUT,
            dial_timeout: RtmDefaults::DIAL_TIMEOUT,
            event_capacity: RtmDefaults::EVENT_CAPACITY,
            outgoing_capacity: RtmDefaults::OUTGOING_CAPACITY,
            ping_table_capacity: RtmDefaults::PING_TABLE_CAPACITY,
            max_message_len: RtmDefaults::MAX_MESSAGE_LEN,
        }
    }
}

impl RtmOptions {
    pub fn with_legacy_negotiation(mut self, enabled: bool) -> Self {
        self.use_legacy_negotiation = enabled;
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn with_max_latency(mut self, max_latency: Duration) -> Self {
        self.max_latency = max_latency;
        self
    }

    pub fn with_reconnect_policy(mut self, policy: RetryPolicy) -> Self {
        self.reconnect_policy = policy;
        self
    }
}

/// Consumer side of the event queue.
///
/// Events arrive in the order their frames were read, interleaved with
/// lifecycle events. The stream ends once the manager has terminated and
/// every queued event has been received.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::Receiver<RtmEvent>,
}

impl EventStream {
    pub async fn recv(&mut self) -> Option<RtmEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<RtmEvent> {
        self.rx.try_recv().ok()
    }
}

impl Stream for EventStream {
    type Item = RtmEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Outcome of one queued frame.
#[derive(Debug)]
pub struct Delivery {
    id: u64,
    rx: oneshot::Receiver<Result<(), SendError>>,
}

impl Delivery {
    /// Id assigned to the frame; server acks reference it in `reply_to`.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Resolves once the frame was written or failed to be.
    pub async fn outcome(self) -> Result<(), SendError> {
        self.rx.await.unwrap_or(Err(SendError::Disconnected))
    }
}

struct Outgoing {
    frame: ClientFrame,
    reply: oneshot::Sender<Result<(), SendError>>,
}

impl Outgoing {
    fn resolve(self, result: Result<(), SendError>) {
        let _ = self.reply.send(result);
    }
}

struct Shared {
    options: RtmOptions,
    negotiator: Arc<dyn Negotiator>,
    dialer: Arc<dyn Dialer>,
    ids: Arc<dyn IdGenerator>,
    state: ConnectionState,
    events_tx: Mutex<Option<mpsc::Sender<RtmEvent>>>,
    outgoing_tx: mpsc::Sender<Outgoing>,
    outgoing_rx: tokio::sync::Mutex<mpsc::Receiver<Outgoing>>,
    kill: CancellationToken,
    force_ping: Notify,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn events_slot(&self) -> MutexGuard<'_, Option<mpsc::Sender<RtmEvent>>> {
        self.events_tx.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn event_sender(&self) -> Option<mpsc::Sender<RtmEvent>> {
        self.events_slot().clone()
    }

    fn take_event_sender(&self) -> Option<mpsc::Sender<RtmEvent>> {
        self.events_slot().take()
    }

    fn negotiation_mode(&self) -> NegotiationMode {
        if self.options.use_legacy_negotiation
            || (self.options.full_on_cold_start && !self.state.has_connected())
        {
            NegotiationMode::Full
        } else {
            NegotiationMode::Compact
        }
    }
}

/// Handle to a managed connection. Clones share the same connection.
#[derive(Clone)]
pub struct RtmManager {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for RtmManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtmManager")
            .field("state", &self.state())
            .field("connection_count", &self.connection_count())
            .finish_non_exhaustive()
    }
}

impl RtmManager {
    /// Creates an idle manager and the event stream it publishes to.
    pub fn new(
        negotiator: Arc<dyn Negotiator>,
        dialer: Arc<dyn Dialer>,
        options: RtmOptions,
    ) -> (Self, EventStream) {
        Self::with_id_generator(negotiator, dialer, options, Arc::new(SafeId::default()))
    }

    /// Manager speaking websocket to endpoints negotiated by `client`.
    pub fn websocket(client: WebApiClient, options: RtmOptions) -> (Self, EventStream) {
        Self::new(Arc::new(client), Arc::new(WebSocketDialer), options)
    }

    pub fn with_id_generator(
        negotiator: Arc<dyn Negotiator>,
        dialer: Arc<dyn Dialer>,
        options: RtmOptions,
        ids: Arc<dyn IdGenerator>,
    ) -> (Self, EventStream) {
        let (events_tx, events_rx) = mpsc::channel(options.event_capacity.max(1));
        let (outgoing_tx, outgoing_rx) = mpsc::channel(options.outgoing_capacity.max(1));
        let state = ConnectionState::new(options.ping_table_capacity);

        let shared = Shared {
            options,
            negotiator,
            dialer,
            ids,
            state,
            events_tx: Mutex::new(Some(events_tx)),
            outgoing_tx,
            outgoing_rx: tokio::sync::Mutex::new(outgoing_rx),
            kill: CancellationToken::new(),
            force_ping: Notify::new(),
            supervisor: Mutex::new(None),
        };

        (
            Self {
                shared: Arc::new(shared),
            },
            EventStream { rx: events_rx },
        )
    }

    /// Starts the connection supervisor on the current tokio runtime.
    ///
    /// Calling it again while running is a no-op.
    pub fn connect(&self) -> Result<(), RtmError> {
        if !self.shared.state.start() {
            return match self.shared.state.phase() {
                ManagerState::Terminated => Err(RtmError::Terminated),
                _ => Ok(()),
            };
        }

        info!(event = "rtm_manager_started");
        let handle = tokio::spawn(supervise(Arc::clone(&self.shared)));
        *self
            .shared
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    /// Disconnects for good and waits until the manager has terminated.
    ///
    /// Queued frames that were not written fail with
    /// [`SendError::Disconnected`]. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        if self.shared.state.request_disconnect() {
            info!(event = "rtm_disconnected", intentional = true, connected = false);
            fail_queued(&self.shared).await;
            if let Some(events) = self.shared.take_event_sender() {
                publish_final(
                    &events,
                    RtmEvent::Disconnected {
                        intentional: true,
                        cause: DisconnectCause::Intentional,
                    },
                )
                .await;
            }
            return;
        }

        self.shared.kill.cancel();
        let supervisor = self
            .shared
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match supervisor {
            Some(handle) => {
                if let Err(err) = handle.await {
                    warn!(event = "rtm_supervisor_failed", error = %err);
                }
            }
            None => {
                let mut phase = self.shared.state.subscribe();
                let _ = phase
                    .wait_for(|phase| *phase == ManagerState::Terminated)
                    .await;
            }
        }
    }

    /// Waits until the current connection, if any, has gone away.
    pub async fn wait_until_disconnected(&self) {
        let mut phase = self.shared.state.subscribe();
        let _ = phase
            .wait_for(|phase| *phase != ManagerState::Connected)
            .await;
    }

    /// Queues a frame for transmission, waiting for room in the queue.
    ///
    /// Frames with id `0` are assigned a fresh id.
    pub async fn send(&self, frame: ClientFrame) -> Result<Delivery, SendError> {
        let (outgoing, delivery) = self.prepare(frame)?;
        self.shared
            .outgoing_tx
            .send(outgoing)
            .await
            .map_err(|_| SendError::QueueClosed)?;
        Ok(delivery)
    }

    /// Queues a frame without waiting; fails with [`SendError::QueueFull`]
    /// when the writer is not keeping up.
    pub fn try_send(&self, frame: ClientFrame) -> Result<Delivery, SendError> {
        let (outgoing, delivery) = self.prepare(frame)?;
        self.shared
            .outgoing_tx
            .try_send(outgoing)
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => SendError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => SendError::QueueClosed,
            })?;
        Ok(delivery)
    }

    fn prepare(&self, mut frame: ClientFrame) -> Result<(Outgoing, Delivery), SendError> {
        if self.shared.state.phase() == ManagerState::Terminated {
            return Err(SendError::QueueClosed);
        }
        if frame.id() == 0 {
            frame.set_id(self.shared.ids.next());
        }
        let id = frame.id();
        let (reply, rx) = oneshot::channel();
        Ok((Outgoing { frame, reply }, Delivery { id, rx }))
    }

    /// Builds a chat message carrying a freshly assigned id.
    pub fn new_outgoing_message(
        &self,
        text: impl Into<String>,
        channel: impl Into<String>,
    ) -> ClientFrame {
        let mut frame = ClientFrame::message(channel, text);
        frame.set_id(self.shared.ids.next());
        frame
    }

    /// Sends a liveness probe now instead of waiting for the next tick.
    pub fn force_ping(&self) {
        self.shared.force_ping.notify_one();
    }

    pub fn state(&self) -> ManagerState {
        self.shared.state.phase()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.state.is_connected()
    }

    /// Number of successful connects so far.
    pub fn connection_count(&self) -> u64 {
        self.shared.state.connection_count()
    }
}

async fn supervise(shared: Arc<Shared>) {
    let Some(events) = shared.event_sender() else {
        shared.state.finish_disconnect(true);
        return;
    };

    let cause = loop {
        let (info, connection) = match connect_with_backoff(&shared, &events).await {
            Ok(connected) => connected,
            Err(cause) => break cause,
        };

        let connection_count = shared.state.mark_connected();
        info!(
            event = "rtm_connected",
            connection_count,
            team = %info.team.id,
            user = %info.user.id
        );
        publish(
            &events,
            RtmEvent::Connected {
                connection_count,
                info: Box::new(info),
            },
            &shared.kill,
        )
        .await;

        let cause = run_session(&shared, &events, connection).await;
        if shared.state.mark_disconnecting() {
            break DisconnectCause::Intentional;
        }
        if !cause.is_recoverable() {
            break cause;
        }

        warn!(event = "rtm_disconnected", intentional = false, cause = %cause);
        publish(
            &events,
            RtmEvent::Disconnected {
                intentional: false,
                cause,
            },
            &shared.kill,
        )
        .await;
        if shared.state.finish_disconnect(false) == ManagerState::Terminated {
            break DisconnectCause::Intentional;
        }

        let backoff = shared.options.reconnect_policy.delay_for_attempt(1);
        debug!(event = "rtm_reconnect_scheduled", backoff_ms = backoff.as_millis() as u64);
        if !sleep_unless_cancelled(backoff, &shared.kill).await {
            break DisconnectCause::Intentional;
        }
    };

    terminate(&shared, events, cause).await;
}

async fn terminate(shared: &Shared, events: mpsc::Sender<RtmEvent>, cause: DisconnectCause) {
    let intentional = shared.state.mark_disconnecting();
    info!(event = "rtm_terminated", intentional, cause = %cause);

    publish_final(&events, RtmEvent::Disconnected { intentional, cause }).await;

    fail_queued(shared).await;
    shared.state.finish_disconnect(true);

    // The stream ends only after the phase reads terminated.
    drop(events);
    drop(shared.take_event_sender());
}

/// Closes the send queue and fails everything still in it. Senders waiting
/// for room get [`SendError::QueueClosed`].
async fn fail_queued(shared: &Shared) {
    let mut outgoing = shared.outgoing_rx.lock().await;
    outgoing.close();
    while let Ok(queued) = outgoing.try_recv() {
        queued.resolve(Err(SendError::Disconnected));
    }
}

enum ConnectFailure {
    Negotiation(NegotiationError),
    Dial(TransportError),
    Cancelled,
}

impl std::fmt::Display for ConnectFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Negotiation(err) => write!(f, "negotiation failed: {err}"),
            Self::Dial(err) => write!(f, "dial failed: {err}"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

async fn connect_with_backoff(
    shared: &Shared,
    events: &mpsc::Sender<RtmEvent>,
) -> Result<(SessionInfo, Connection), DisconnectCause> {
    let policy = &shared.options.reconnect_policy;
    let mut attempt = 1;

    loop {
        if !shared.state.begin_connect() {
            return Err(DisconnectCause::Intentional);
        }

        let connection_count = shared.state.connection_count();
        debug!(event = "rtm_connecting", attempt, connection_count);
        publish(
            events,
            RtmEvent::Connecting {
                attempt,
                connection_count,
            },
            &shared.kill,
        )
        .await;

        let failure = match connect_once(shared).await {
            Ok(connected) => return Ok(connected),
            Err(ConnectFailure::Cancelled) => return Err(DisconnectCause::Intentional),
            Err(ConnectFailure::Negotiation(err)) if err.is_fatal() => {
                let code = err.to_string();
                warn!(event = "rtm_invalid_auth", code = %code);
                publish(events, RtmEvent::InvalidAuth { code: code.clone() }, &shared.kill).await;
                return Err(DisconnectCause::InvalidAuth(code));
            }
            Err(failure) => failure,
        };

        shared.state.mark_idle();
        if !policy.allows_attempt(attempt + 1) {
            warn!(event = "rtm_reconnect_exhausted", attempt, error = %failure);
            publish(
                events,
                RtmEvent::ConnectionError {
                    attempt,
                    backoff: Duration::ZERO,
                    error: failure.to_string(),
                },
                &shared.kill,
            )
            .await;
            return Err(DisconnectCause::RetriesExhausted);
        }

        let mut backoff = policy.delay_for_attempt(attempt);
        if let ConnectFailure::Negotiation(err) = &failure {
            if let Some(retry_after) = err.retry_after() {
                backoff = backoff.max(retry_after);
            }
        }
        warn!(
            event = "rtm_connect_failed",
            attempt,
            backoff_ms = backoff.as_millis() as u64,
            error = %failure
        );
        publish(
            events,
            RtmEvent::ConnectionError {
                attempt,
                backoff,
                error: failure.to_string(),
            },
            &shared.kill,
        )
        .await;

        if !sleep_unless_cancelled(backoff, &shared.kill).await {
            return Err(DisconnectCause::Intentional);
        }
        attempt += 1;
    }
}

async fn connect_once(shared: &Shared) -> Result<(SessionInfo, Connection), ConnectFailure> {
    let mode = shared.negotiation_mode();
    let ctx = NegotiateContext::with_timeout(shared.options.negotiation_timeout)
        .with_cancellation(shared.kill.child_token());

    let negotiated = tokio::select! {
        biased;
        _ = shared.kill.cancelled() => return Err(ConnectFailure::Cancelled),
        result = shared.negotiator.negotiate(mode, &ctx) => result,
    };
    let (info, url) = negotiated.map_err(|err| match err {
        NegotiationError::Cancelled => ConnectFailure::Cancelled,
        other => ConnectFailure::Negotiation(other),
    })?;
    debug!(event = "rtm_dialing", method = mode.method());

    let dial_timeout = shared.options.dial_timeout;
    let dialed = tokio::select! {
        biased;
        _ = shared.kill.cancelled() => return Err(ConnectFailure::Cancelled),
        result = with_timeout(dial_timeout, shared.dialer.dial(&url)) => result,
    };
    let connection = dialed
        .map_err(|_| ConnectFailure::Dial(TransportError::Timeout(dial_timeout)))?
        .map_err(ConnectFailure::Dial)?;

    Ok((info, connection))
}

/// Runs the read, write and ping loops until the first of them exits, then
/// stops and joins the other two.
async fn run_session(
    shared: &Arc<Shared>,
    events: &mpsc::Sender<RtmEvent>,
    connection: Connection,
) -> DisconnectCause {
    let session = shared.kill.child_token();
    let probe_capacity = shared.options.ping_table_capacity.max(1);
    let (probe_tx, probe_rx) = mpsc::channel(probe_capacity);
    let (pong_tx, pong_rx) = mpsc::channel(probe_capacity);

    let mut tasks = JoinSet::new();
    tasks.spawn(read_loop(
        connection.stream,
        events.clone(),
        pong_tx,
        session.clone(),
    ));
    tasks.spawn(write_loop(
        Arc::clone(shared),
        connection.sink,
        probe_rx,
        events.clone(),
        session.clone(),
    ));
    tasks.spawn(ping_loop(
        Arc::clone(shared),
        probe_tx,
        pong_rx,
        events.clone(),
        session.clone(),
    ));

    let cause = match tasks.join_next().await {
        Some(Ok(cause)) => cause,
        Some(Err(err)) => DisconnectCause::Transport(format!("session task failed: {err}")),
        None => DisconnectCause::Transport("session had no tasks".to_string()),
    };

    session.cancel();
    while let Some(joined) = tasks.join_next().await {
        if let Err(err) = joined {
            warn!(event = "rtm_session_task_failed", error = %err);
        }
    }
    cause
}

async fn read_loop(
    mut stream: FrameStream,
    events: mpsc::Sender<RtmEvent>,
    pongs: mpsc::Sender<u64>,
    session: CancellationToken,
) -> DisconnectCause {
    loop {
        let next = tokio::select! {
            biased;
            _ = session.cancelled() => return DisconnectCause::Intentional,
            next = stream.next() => next,
        };

        let frame = match next {
            Some(Ok(frame)) => frame,
            Some(Err(err)) => return DisconnectCause::Transport(err.to_string()),
            None => return DisconnectCause::Transport(TransportError::Closed.to_string()),
        };

        match classify(frame) {
            RtmEvent::Pong(pong) => {
                tokio::select! {
                    biased;
                    _ = session.cancelled() => return DisconnectCause::Intentional,
                    _ = pongs.send(pong.reply_to) => {}
                }
            }
            RtmEvent::Goodbye => {
                publish(&events, RtmEvent::Goodbye, &session).await;
                return DisconnectCause::ServerGoodbye;
            }
            event => {
                debug!(event = "rtm_frame_received", kind = event.kind());
                if !publish(&events, event, &session).await {
                    return DisconnectCause::Intentional;
                }
            }
        }
    }
}

async fn write_loop(
    shared: Arc<Shared>,
    mut sink: FrameSink,
    mut probes: mpsc::Receiver<ClientFrame>,
    events: mpsc::Sender<RtmEvent>,
    session: CancellationToken,
) -> DisconnectCause {
    let mut outgoing = shared.outgoing_rx.lock().await;
    let max_len = shared.options.max_message_len;

    let cause = loop {
        tokio::select! {
            biased;
            _ = session.cancelled() => break DisconnectCause::Intentional,
            Some(probe) = probes.recv() => {
                if let Err(cause) = transmit(&mut sink, &probe, &session).await {
                    break cause;
                }
            }
            queued = outgoing.recv() => {
                let Some(queued) = queued else {
                    break DisconnectCause::Intentional;
                };
                let id = queued.frame.id();

                let len = queued.frame.text_len();
                if len > max_len {
                    debug!(event = "rtm_message_too_long", id, len, max_len);
                    queued.resolve(Err(SendError::MessageTooLong { len, max: max_len }));
                    publish(&events, RtmEvent::MessageTooLong { id, len, max: max_len }, &session).await;
                    continue;
                }

                match transmit(&mut sink, &queued.frame, &session).await {
                    Ok(()) => queued.resolve(Ok(())),
                    Err(DisconnectCause::Intentional) => {
                        queued.resolve(Err(SendError::Disconnected));
                        break DisconnectCause::Intentional;
                    }
                    Err(cause) => {
                        let error = SendError::Transport(cause.to_string());
                        warn!(event = "rtm_send_failed", id, error = %error);
                        queued.resolve(Err(error.clone()));
                        publish(&events, RtmEvent::OutgoingError { id, error }, &session).await;
                        break cause;
                    }
                }
            }
        }
    };

    let _ = with_timeout(CLOSE_TIMEOUT, sink.close()).await;
    cause
}

/// Writes one frame. A cancelled session is reported as
/// [`DisconnectCause::Intentional`].
async fn transmit(
    sink: &mut FrameSink,
    frame: &ClientFrame,
    session: &CancellationToken,
) -> Result<(), DisconnectCause> {
    let value = frame
        .to_value()
        .map_err(|err| DisconnectCause::Transport(TransportError::Json(err).to_string()))?;

    tokio::select! {
        biased;
        _ = session.cancelled() => Err(DisconnectCause::Intentional),
        result = sink.send(value) => result.map_err(|err| DisconnectCause::Transport(err.to_string())),
    }
}

async fn ping_loop(
    shared: Arc<Shared>,
    probes: mpsc::Sender<ClientFrame>,
    mut pongs: mpsc::Receiver<u64>,
    events: mpsc::Sender<RtmEvent>,
    session: CancellationToken,
) -> DisconnectCause {
    let interval = shared.options.ping_interval;
    let max_latency = shared.options.max_latency;
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let oldest = shared.state.oldest_ping();
        let expiry = async move {
            match oldest {
                Some((_, sent_at)) => tokio::time::sleep_until(sent_at + max_latency).await,
                None => std::future::pending::<()>().await,
            }
        };

        let send_probe = tokio::select! {
            biased;
            _ = session.cancelled() => return DisconnectCause::Intentional,
            _ = expiry => {
                if let Some((id, sent_at)) = oldest {
                    shared.state.ack_ping(id);
                    let elapsed = sent_at.elapsed();
                    warn!(event = "rtm_ping_timeout", id, elapsed_ms = elapsed.as_millis() as u64);
                    return DisconnectCause::PingTimeout { id, elapsed };
                }
                false
            }
            Some(id) = pongs.recv() => {
                match shared.state.ack_ping(id) {
                    Some(sent_at) => {
                        let latency = sent_at.elapsed();
                        debug!(event = "rtm_pong", id, latency_ms = latency.as_millis() as u64);
                        publish(&events, RtmEvent::LatencyReport { latency }, &session).await;
                    }
                    None => debug!(event = "rtm_pong_unmatched", id),
                }
                false
            }
            _ = ticker.tick() => true,
            _ = shared.force_ping.notified() => true,
        };

        if !send_probe {
            continue;
        }

        let id = shared.ids.next();
        if !shared.state.record_ping(id, Instant::now()) {
            debug!(
                event = "rtm_ping_skipped",
                outstanding = shared.state.outstanding_pings()
            );
            continue;
        }
        debug!(event = "rtm_ping", id, outstanding = shared.state.outstanding_pings());
        tokio::select! {
            biased;
            _ = session.cancelled() => return DisconnectCause::Intentional,
            sent = probes.send(ClientFrame::Ping { id }) => {
                if sent.is_err() {
                    return DisconnectCause::Transport("writer stopped".to_string());
                }
            }
        }
    }
}

/// Publishes an event unless `cancel` fires first. Returns `false` when
/// cancelled. A consumer that dropped its stream is not an error.
async fn publish(
    events: &mpsc::Sender<RtmEvent>,
    event: RtmEvent,
    cancel: &CancellationToken,
) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = events.send(event) => {
            if sent.is_err() {
                debug!(event = "rtm_event_dropped", reason = "consumer closed");
            }
            true
        }
    }
}

/// Delivers a terminal event. A consumer that holds the stream without
/// reading loses the event after [`FINAL_EVENT_TIMEOUT`] instead of stalling
/// shutdown.
async fn publish_final(events: &mpsc::Sender<RtmEvent>, event: RtmEvent) {
    if with_timeout(FINAL_EVENT_TIMEOUT, events.send(event))
        .await
        .is_err()
    {
        warn!(event = "rtm_final_event_dropped", reason = "event queue full");
    }
}

async fn sleep_unless_cancelled(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
