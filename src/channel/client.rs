//! Resilient channel client and its connection worker.
//!
//! [`ChannelClient`] is a cloneable handle. All connection state lives in a
//! single background worker task: the lifecycle state machine, the heartbeat,
//! the outbound queue and the subscription registry. Handles talk to it over
//! a command channel, so state is only ever mutated on that one task.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::channel::dispatch::{
    log_frame, ClientEvent, Dispatch, InboundDispatcher, Subscription, SubscriptionId,
    SubscriptionRegistry, Topic,
};
use crate::channel::proto::{iso_timestamp, kinds, Envelope, OutboundMessage};
use crate::channel::queue::OutboundQueue;
use crate::channel::transport::{Transport, TransportEvent, TransportHandle, WsTransport};
use crate::config::ClientOptions;
use crate::reconnect::ReconnectState;

/// Connection state observed through [`ChannelClient::status`] and the
/// `status` topic.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionState {
    /// Lowercase name as shown on the `status` topic.
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a `connect()` call failed.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ConnectError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("connection timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection closed before it was established")]
    ClosedBeforeOpen,

    #[error("disconnected before the connection was established")]
    Disconnected,

    #[error("connection attempt superseded by a newer connect()")]
    Superseded,

    #[error("client worker has stopped")]
    WorkerStopped,
}

/// Errors from the non-connect parts of the handle API.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("client worker has stopped")]
    WorkerStopped,

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

type ConnectReply = oneshot::Sender<Result<(), ConnectError>>;

enum Command {
    Connect(ConnectReply),
    Disconnect(oneshot::Sender<()>),
    Send(OutboundMessage),
    Subscribe {
        topic: Topic,
        id: SubscriptionId,
        sender: mpsc::UnboundedSender<ClientEvent>,
    },
    Unsubscribe(SubscriptionId),
    SetAutoReply(bool),
    SetVerbose(bool),
}

/// Handle to the single logical connection with the backend.
///
/// Cloning shares the same connection. The worker stops once every handle
/// has been dropped.
#[derive(Clone, Debug)]
pub struct ChannelClient {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    next_subscription: Arc<AtomicU64>,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Connect(_) => f.write_str("Connect"),
            Command::Disconnect(_) => f.write_str("Disconnect"),
            Command::Send(message) => write!(f, "Send({})", message.kind),
            Command::Subscribe { topic, .. } => write!(f, "Subscribe({topic})"),
            Command::Unsubscribe(id) => write!(f, "Unsubscribe({id:?})"),
            Command::SetAutoReply(enabled) => write!(f, "SetAutoReply({enabled})"),
            Command::SetVerbose(verbose) => write!(f, "SetVerbose({verbose})"),
        }
    }
}

impl ChannelClient {
    /// Creates a websocket client. Must be called from within a tokio runtime.
    pub fn new(options: ClientOptions) -> Self {
        Self::with_transport(options, WsTransport)
    }

    /// Creates a client over a custom transport.
    pub fn with_transport<T: Transport>(options: ClientOptions, transport: T) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let worker = Worker::new(options, transport, state_tx);
        tokio::spawn(worker.run(commands_rx));

        Self {
            commands: commands_tx,
            state: state_rx,
            next_subscription: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Opens the connection, waiting until it is established or has failed.
    ///
    /// Returns immediately when already connected. Only this call reports
    /// failures as errors; later reconnect failures surface on the `status`
    /// topic.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Connect(reply_tx))
            .map_err(|_| ConnectError::WorkerStopped)?;
        reply_rx.await.map_err(|_| ConnectError::WorkerStopped)?
    }

    /// Closes the connection and stops automatic reconnects.
    ///
    /// Idempotent. The client can `connect()` again afterwards.
    pub async fn disconnect(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.commands.send(Command::Disconnect(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Sends `message`, queueing it while the transport is not open.
    ///
    /// Assigns `id` and `timestamp` if absent and returns the message id.
    pub fn send_message(&self, mut message: OutboundMessage) -> Result<String, ClientError> {
        message.ensure_identity();
        let id = message.id.clone().unwrap_or_default();
        self.command(Command::Send(message))?;
        Ok(id)
    }

    /// Subscribes to one event topic.
    pub fn subscribe(&self, topic: Topic) -> Result<Subscription, ClientError> {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = mpsc::unbounded_channel();
        self.command(Command::Subscribe { topic, id, sender })?;
        Ok(Subscription::new(id, topic, receiver))
    }

    /// Removes a subscription; its receiver then reports disconnection.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let _ = self.command(Command::Unsubscribe(id));
    }

    /// Toggles the automatic error reply to `run_workflow` requests that no
    /// subscriber receives.
    pub fn set_auto_reply(&self, enabled: bool) {
        let _ = self.command(Command::SetAutoReply(enabled));
    }

    /// Raises per-frame logging from `trace` to `debug`.
    pub fn set_verbose(&self, verbose: bool) {
        let _ = self.command(Command::SetVerbose(verbose));
    }

    /// `true` while the transport is open.
    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionState::Connected
    }

    /// Current connection state.
    pub fn status(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch channel mirroring the connection state.
    pub fn status_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Asks the backend to run a workspace. `data` is sent JSON-encoded.
    pub fn run_workspace<T: Serialize>(
        &self,
        workspace_id: &str,
        data: Option<&T>,
    ) -> Result<String, ClientError> {
        let mut message = Envelope::new(kinds::RUN_WORKSPACE).with_workspace_id(workspace_id);
        if let Some(data) = data {
            message = message.with_data(Value::String(serde_json::to_string(data)?));
        }
        self.send_message(message)
    }

    /// Asks the backend to run one workflow of a workspace.
    pub fn run_workflow(&self, workflow_id: &str, workspace_id: &str) -> Result<String, ClientError> {
        self.send_message(
            Envelope::new(kinds::RUN_WORKFLOW)
                .with_workspace_id(workspace_id)
                .with_data(Value::String(workflow_id.to_string())),
        )
    }

    /// Answers a `run_workflow` request with the workflow's canvas state.
    pub fn send_workflow_json<T: Serialize>(
        &self,
        request_id: &str,
        canvas_state: &T,
    ) -> Result<String, ClientError> {
        self.send_message(
            Envelope::new(kinds::WORKFLOW_JSON)
                .with_id(request_id)
                .with_correlation_id(request_id)
                .with_data(serde_json::to_value(canvas_state)?),
        )
    }

    /// Rejects a backend request, echoing its id.
    pub fn send_error_reply(&self, request_id: &str, data: Value) -> Result<String, ClientError> {
        self.send_message(
            Envelope::new(kinds::ERROR)
                .with_id(request_id)
                .with_correlation_id(request_id)
                .with_data(data),
        )
    }

    /// Answers a console prompt.
    pub fn send_console_input(&self, prompt_id: &str, input: &str) -> Result<String, ClientError> {
        self.send_message(Envelope::new(kinds::CONSOLE_INPUT).with_data(json!({
            "promptId": prompt_id,
            "message": input,
            "timestamp": iso_timestamp(),
        })))
    }

    /// Asks the backend to resend prompts still awaiting input.
    pub fn get_pending_prompts(&self) -> Result<String, ClientError> {
        self.send_message(Envelope::new(kinds::GET_PENDING_PROMPTS))
    }

    fn command(&self, command: Command) -> Result<(), ClientError> {
        self.commands
            .send(command)
            .map_err(|_| ClientError::WorkerStopped)
    }
}

/// How a transport session ended.
enum Failure {
    Error(String),
    Closed,
    Timeout,
    Unresponsive,
}

struct Worker<T> {
    options: ClientOptions,
    transport: T,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    session: Option<TransportHandle>,
    pending_connect: Option<ConnectReply>,
    should_reconnect: bool,
    reconnect: ReconnectState,
    queue: OutboundQueue,
    registry: SubscriptionRegistry,
    dispatcher: InboundDispatcher,
    heartbeat: Option<Interval>,
    connect_deadline: Option<Instant>,
    reconnect_at: Option<Instant>,
    last_pong: Option<Instant>,
}

impl<T: Transport> Worker<T> {
    fn new(options: ClientOptions, transport: T, state_tx: watch::Sender<ConnectionState>) -> Self {
        Self {
            reconnect: ReconnectState::new(options.reconnect.clone()),
            queue: OutboundQueue::new(options.queue_capacity, options.overflow_policy),
            dispatcher: InboundDispatcher {
                auto_reply_unhandled: options.auto_reply_unhandled_run_workflow,
                verbose: options.verbose,
            },
            options,
            transport,
            state: ConnectionState::Disconnected,
            state_tx,
            session: None,
            pending_connect: None,
            should_reconnect: false,
            registry: SubscriptionRegistry::default(),
            heartbeat: None,
            connect_deadline: None,
            reconnect_at: None,
            last_pong: None,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                maybe_command = commands.recv() => {
                    match maybe_command {
                        Some(command) => self.handle_command(command),
                        None => {
                            self.disconnect();
                            debug!(event = "channel_worker_stopped");
                            return;
                        }
                    }
                }
                event = next_transport_event(&mut self.session) => {
                    self.handle_transport_event(event);
                }
                _ = sleep_until_opt(self.connect_deadline) => {
                    self.connect_deadline = None;
                    if self.state == ConnectionState::Connecting {
                        self.end_session(Failure::Timeout);
                    }
                }
                _ = sleep_until_opt(self.reconnect_at) => {
                    self.reconnect_at = None;
                    if self.should_reconnect && self.state != ConnectionState::Connected {
                        info!(
                            event = "channel_reconnecting",
                            attempt = self.reconnect.attempt_count(),
                            max_attempts = self.reconnect.policy().max_attempts
                        );
                        self.begin_connect(None);
                    }
                }
                _ = tick_opt(&mut self.heartbeat) => self.on_heartbeat(),
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect(reply) => {
                if self.state == ConnectionState::Connected && self.session.is_some() {
                    debug!(event = "channel_already_connected");
                    let _ = reply.send(Ok(()));
                    return;
                }
                if let Some(previous) = self.pending_connect.take() {
                    let _ = previous.send(Err(ConnectError::Superseded));
                }
                self.begin_connect(Some(reply));
            }
            Command::Disconnect(ack) => {
                self.disconnect();
                let _ = ack.send(());
            }
            Command::Send(message) => self.send(message),
            Command::Subscribe { topic, id, sender } => self.registry.add(topic, id, sender),
            Command::Unsubscribe(id) => {
                self.registry.remove(id);
            }
            Command::SetAutoReply(enabled) => self.dispatcher.auto_reply_unhandled = enabled,
            Command::SetVerbose(verbose) => {
                self.options.verbose = verbose;
                self.dispatcher.verbose = verbose;
            }
        }
    }

    fn begin_connect(&mut self, reply: Option<ConnectReply>) {
        self.session = None;
        self.stop_heartbeat();
        self.reconnect_at = None;
        self.should_reconnect = true;
        self.pending_connect = reply;
        self.set_state(ConnectionState::Connecting);

        info!(event = "channel_connecting", url = %self.options.url);
        self.session = Some(self.transport.open(&self.options.url));
        // An unrepresentable deadline means the attempt never times out.
        self.connect_deadline = Instant::now().checked_add(self.options.connect_timeout);
    }

    fn handle_transport_event(&mut self, event: Option<TransportEvent>) {
        match event {
            Some(TransportEvent::Opened) => self.on_open(),
            Some(TransportEvent::Frame(text)) => self.on_frame(&text),
            Some(TransportEvent::Error(message)) => self.end_session(Failure::Error(message)),
            Some(TransportEvent::Closed) | None => self.end_session(Failure::Closed),
        }
    }

    fn on_open(&mut self) {
        if self.state != ConnectionState::Connecting {
            return;
        }
        self.connect_deadline = None;
        self.reconnect.reset();
        self.set_state(ConnectionState::Connected);
        info!(event = "channel_connected", url = %self.options.url);

        self.start_heartbeat();
        self.flush();
        self.settle(Ok(()));
    }

    fn on_frame(&mut self, text: &str) {
        match self.dispatcher.dispatch(text, &mut self.registry) {
            Dispatch::Pong => self.last_pong = Some(Instant::now()),
            Dispatch::Reply(reply) => self.send(reply),
            Dispatch::Routed | Dispatch::Dropped => {}
        }
    }

    /// Tears down the current session after its first terminal event.
    ///
    /// The session is dropped here, so later events from the same attempt are
    /// never observed.
    fn end_session(&mut self, failure: Failure) {
        let previous = self.state;
        self.session = None;
        self.stop_heartbeat();
        self.connect_deadline = None;

        match previous {
            ConnectionState::Connecting => {
                let err = match failure {
                    Failure::Error(message) => ConnectError::Transport(message),
                    Failure::Closed => ConnectError::ClosedBeforeOpen,
                    Failure::Timeout | Failure::Unresponsive => {
                        ConnectError::Timeout(self.options.connect_timeout)
                    }
                };
                warn!(event = "channel_connect_failed", error = %err);
                self.set_state(ConnectionState::Error);
                self.settle(Err(err));
            }
            ConnectionState::Connected => {
                match failure {
                    Failure::Error(message) => {
                        warn!(event = "channel_transport_error", error = %message);
                        self.set_state(ConnectionState::Error);
                    }
                    Failure::Unresponsive => {
                        warn!(event = "channel_unresponsive", "no pong within timeout");
                    }
                    Failure::Closed | Failure::Timeout => {
                        info!(event = "channel_closed");
                    }
                }
                self.set_state(ConnectionState::Disconnected);
            }
            ConnectionState::Disconnected | ConnectionState::Error => return,
        }

        if self.should_reconnect {
            if let Some(delay) = self.reconnect.next_delay() {
                self.reconnect_at = Instant::now().checked_add(delay);
            }
        }
    }

    fn disconnect(&mut self) {
        self.should_reconnect = false;
        self.reconnect_at = None;
        self.connect_deadline = None;
        self.stop_heartbeat();
        if self.session.take().is_some() {
            info!(event = "channel_disconnected");
        }
        self.settle(Err(ConnectError::Disconnected));
        self.set_state(ConnectionState::Disconnected);
    }

    fn settle(&mut self, outcome: Result<(), ConnectError>) {
        if let Some(reply) = self.pending_connect.take() {
            let _ = reply.send(outcome);
        }
    }

    fn set_state(&mut self, next: ConnectionState) {
        if self.state == next {
            return;
        }
        debug!(event = "channel_state", from = %self.state, to = %next);
        self.state = next;
        self.state_tx.send_replace(next);
        self.registry.emit(ClientEvent::Status(next));
    }

    fn send(&mut self, mut message: OutboundMessage) {
        message.ensure_identity();

        if self.state == ConnectionState::Connected {
            if let Some(session) = &self.session {
                let text = match message.to_text() {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(event = "outbound_encode_failed", kind = %message.kind, error = %err);
                        return;
                    }
                };
                if session.send(text).is_ok() {
                    log_frame(self.options.verbose, "frame_sent", &message.kind);
                    return;
                }
            }
        }

        log_frame(self.options.verbose, "frame_queued", &message.kind);
        if let Some((dropped, error)) = self.queue.push(message) {
            warn!(
                event = "outbound_queue_overflow",
                kind = %dropped.kind,
                capacity = error.capacity
            );
            self.registry.emit(ClientEvent::Dropped {
                message: dropped,
                error,
            });
        }
    }

    fn flush(&mut self) {
        let pending = self.queue.drain();
        if pending.is_empty() {
            return;
        }
        debug!(event = "outbound_queue_flush", count = pending.len());
        for message in pending {
            self.send(message);
        }
    }

    fn start_heartbeat(&mut self) {
        self.stop_heartbeat();
        let period = self.options.heartbeat_interval;
        if period.is_zero() {
            return;
        }
        let Some(first_tick) = Instant::now().checked_add(period) else {
            return;
        };
        let mut interval = tokio::time::interval_at(first_tick, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.heartbeat = Some(interval);
        self.last_pong = Some(Instant::now());
    }

    fn stop_heartbeat(&mut self) {
        self.heartbeat = None;
        self.last_pong = None;
    }

    fn on_heartbeat(&mut self) {
        if let (Some(timeout), Some(last_pong)) = (self.options.pong_timeout, self.last_pong) {
            if last_pong.elapsed() > timeout {
                self.end_session(Failure::Unresponsive);
                return;
            }
        }
        self.send(Envelope::new(kinds::PING));
    }
}

async fn next_transport_event(session: &mut Option<TransportHandle>) -> Option<TransportEvent> {
    match session {
        Some(session) => session.next_event().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn tick_opt(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use serde_json::{json, Value};
    use tokio::sync::mpsc;

    use super::{ChannelClient, ConnectError, ConnectionState};
    use crate::channel::dispatch::{ClientEvent, Topic, TryRecvError};
    use crate::channel::proto::Envelope;
    use crate::channel::queue::OverflowPolicy;
    use crate::channel::transport::{Transport, TransportEvent, TransportHandle};
    use crate::config::ClientOptions;
    use crate::reconnect::ReconnectPolicy;

    /// Remote end of a fake session.
    struct FakePeer {
        events: mpsc::UnboundedSender<TransportEvent>,
        sent: mpsc::UnboundedReceiver<String>,
    }

    impl FakePeer {
        fn push(&self, event: TransportEvent) {
            self.events.send(event).expect("client session alive");
        }

        fn frame(&self, text: &str) {
            self.push(TransportEvent::Frame(text.to_string()));
        }

        fn drain_sent(&mut self) -> Vec<Envelope> {
            let mut frames = Vec::new();
            while let Ok(text) = self.sent.try_recv() {
                frames.push(Envelope::from_text(&text).expect("client frame is json"));
            }
            frames
        }
    }

    /// Transport whose sessions replay scripted events. Unscripted opens
    /// succeed immediately.
    #[derive(Clone)]
    struct FakeTransport {
        opens: Arc<AtomicUsize>,
        script: Arc<Mutex<VecDeque<Vec<TransportEvent>>>>,
        peers: mpsc::UnboundedSender<FakePeer>,
    }

    impl Transport for FakeTransport {
        fn open(&self, _url: &str) -> TransportHandle {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            let (events_tx, events_rx) = mpsc::unbounded_channel();

            let initial = self
                .script
                .lock()
                .expect("script lock")
                .pop_front()
                .unwrap_or_else(|| vec![TransportEvent::Opened]);
            for event in initial {
                let _ = events_tx.send(event);
            }
            let _ = self.peers.send(FakePeer {
                events: events_tx,
                sent: outbound_rx,
            });
            TransportHandle::new(outbound_tx, events_rx)
        }
    }

    struct Harness {
        client: ChannelClient,
        opens: Arc<AtomicUsize>,
        peers: mpsc::UnboundedReceiver<FakePeer>,
    }

    impl Harness {
        fn opens(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }

        async fn peer(&mut self) -> FakePeer {
            self.peers.recv().await.expect("transport opened")
        }
    }

    /// Lets the worker drain commands already sent before the next frame.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    fn quiet_options() -> ClientOptions {
        ClientOptions::new("ws://fake.test/ws")
            .with_reconnect(ReconnectPolicy::disabled())
            .with_heartbeat_interval(Duration::from_secs(3600))
    }

    fn harness(options: ClientOptions, script: Vec<Vec<TransportEvent>>) -> Harness {
        let opens = Arc::new(AtomicUsize::new(0));
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        let transport = FakeTransport {
            opens: Arc::clone(&opens),
            script: Arc::new(Mutex::new(script.into())),
            peers: peers_tx,
        };
        Harness {
            client: ChannelClient::with_transport(options, transport),
            opens,
            peers: peers_rx,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn queued_messages_flush_in_send_order() {
        let mut h = harness(quiet_options(), vec![]);

        let first = h
            .client
            .run_workspace::<Value>("ws-123abc", None)
            .expect("queue first");
        let second = h
            .client
            .run_workspace::<Value>("ws-123abc", None)
            .expect("queue second");
        assert_ne!(first, second);
        assert_eq!(h.opens(), 0);

        h.client.connect().await.expect("connect");
        let mut peer = h.peer().await;
        let frames = peer.drain_sent();

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].id.as_deref(), Some(first.as_str()));
        assert_eq!(frames[1].id.as_deref(), Some(second.as_str()));
        for frame in &frames {
            assert_eq!(frame.kind, "run_workspace");
            assert_eq!(frame.workspace_id.as_deref(), Some("ws-123abc"));
            assert!(frame.timestamp.is_some());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn connect_is_idempotent_when_connected() {
        let h = harness(quiet_options(), vec![]);

        h.client.connect().await.expect("first connect");
        h.client.connect().await.expect("second connect");

        assert_eq!(h.opens(), 1);
        assert!(h.client.is_connected());
        assert_eq!(h.client.status(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_settles_once_when_error_and_close_fire_together() {
        let h = harness(
            quiet_options(),
            vec![vec![
                TransportEvent::Error("connection refused".to_string()),
                TransportEvent::Closed,
            ]],
        );
        let mut status = h.client.subscribe(Topic::Status).expect("subscribe");

        let err = h.client.connect().await.expect_err("connect fails");
        assert_eq!(err, ConnectError::Transport("connection refused".to_string()));
        assert_eq!(h.client.status(), ConnectionState::Error);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(
            status.try_recv(),
            Ok(ClientEvent::Status(ConnectionState::Connecting))
        );
        assert_eq!(
            status.try_recv(),
            Ok(ClientEvent::Status(ConnectionState::Error))
        );
        assert_eq!(status.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test(start_paused = true)]
    async fn close_before_open_is_reported_explicitly() {
        let h = harness(quiet_options(), vec![vec![TransportEvent::Closed]]);
        assert_eq!(
            h.client.connect().await,
            Err(ConnectError::ClosedBeforeOpen)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn connect_times_out_when_never_opened() {
        let h = harness(
            quiet_options().with_connect_timeout(Duration::from_secs(10)),
            vec![vec![]],
        );
        assert_eq!(
            h.client.connect().await,
            Err(ConnectError::Timeout(Duration::from_secs(10)))
        );
        assert_eq!(h.client.status(), ConnectionState::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_stop_after_max_attempts() {
        let options = quiet_options().with_reconnect(ReconnectPolicy {
            max_attempts: 5,
            interval: Duration::from_secs(3),
        });
        let mut script = vec![vec![TransportEvent::Opened]];
        script.extend((0..5).map(|_| vec![TransportEvent::Closed]));
        let mut h = harness(options, script);

        h.client.connect().await.expect("initial connect");
        let peer = h.peer().await;
        peer.push(TransportEvent::Closed);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(h.opens(), 6);
        assert!(!h.client.is_connected());

        h.client.connect().await.expect("manual connect");
        assert_eq!(h.opens(), 7);
        assert!(h.client.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_flushes_messages_queued_while_down() {
        let options = quiet_options().with_reconnect(ReconnectPolicy {
            max_attempts: 5,
            interval: Duration::from_secs(3),
        });
        let mut h = harness(options, vec![]);
        let mut status = h.client.subscribe(Topic::Status).expect("subscribe");

        h.client.connect().await.expect("connect");
        let first = h.peer().await;
        first.push(TransportEvent::Closed);

        loop {
            match status.recv().await {
                Some(ClientEvent::Status(ConnectionState::Disconnected)) => break,
                Some(_) => continue,
                None => panic!("status subscription closed"),
            }
        }
        h.client.get_pending_prompts().expect("queue while down");

        let mut second = h.peer().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        let frames = second.drain_sent();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].kind, "get_pending_prompts");
        assert_eq!(h.opens(), 2);
        assert!(h.client.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_frame_does_not_block_next_frame() {
        let mut h = harness(quiet_options(), vec![]);
        let mut console = h.client.subscribe(Topic::Console).expect("subscribe");
        let mut raw = h.client.subscribe(Topic::Message).expect("subscribe");

        h.client.connect().await.expect("connect");
        let peer = h.peer().await;
        peer.frame("{not json");
        peer.frame(r#"{"type":"message","data":{"message":"hello"}}"#);

        assert_eq!(
            console.recv().await,
            Some(ClientEvent::Console(json!({"message": "hello"})))
        );
        assert!(matches!(raw.try_recv(), Ok(ClientEvent::Message(envelope)) if envelope.kind == "message"));
        assert_eq!(raw.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test(start_paused = true)]
    async fn unhandled_run_workflow_gets_exactly_one_reply() {
        let mut h = harness(quiet_options(), vec![]);
        h.client.connect().await.expect("connect");
        let mut peer = h.peer().await;

        peer.frame(r#"{"type":"run_workflow","id":"req-1","data":"gf-001"}"#);
        let text = peer.sent.recv().await.expect("reply frame");
        let reply = Envelope::from_text(&text).expect("json reply");
        assert_eq!(reply.kind, "workflow_output");
        let message = reply
            .data
            .as_ref()
            .and_then(|data| data["message"].as_str())
            .expect("console message");
        assert!(message.contains("req-1"));
        assert!(message.contains("gf-001"));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(peer.drain_sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn run_workflow_listener_or_disabled_flag_suppresses_reply() {
        let mut h = harness(quiet_options(), vec![]);
        h.client.connect().await.expect("connect");
        let mut peer = h.peer().await;

        let mut listener = h.client.subscribe(Topic::RunWorkflow).expect("subscribe");
        settle().await;
        peer.frame(r#"{"type":"run_workflow","id":"req-2","data":"gf-002"}"#);
        assert!(matches!(
            listener.recv().await,
            Some(ClientEvent::RunWorkflow(request)) if request.request_id.as_deref() == Some("req-2")
        ));

        h.client.unsubscribe(listener.id());
        h.client.set_auto_reply(false);
        settle().await;
        peer.frame(r#"{"type":"run_workflow","id":"req-3","data":"gf-003"}"#);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(peer.drain_sent().is_empty());

        h.client.set_auto_reply(true);
        settle().await;
        peer.frame(r#"{"type":"run_workflow","id":"req-4","data":"gf-004"}"#);
        tokio::time::sleep(Duration::from_millis(10)).await;
        let frames = peer.drain_sent();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].correlation_id.as_deref(), Some("req-4"));
    }

    #[tokio::test(start_paused = true)]
    async fn pong_emits_nothing() {
        let mut h = harness(quiet_options(), vec![]);
        let mut subscriptions: Vec<_> = Topic::ALL
            .into_iter()
            .map(|topic| h.client.subscribe(topic).expect("subscribe"))
            .collect();

        h.client.connect().await.expect("connect");
        for subscription in &mut subscriptions {
            while subscription.try_recv().is_ok() {}
        }

        let peer = h.peer().await;
        peer.frame(r#"{"type":"pong"}"#);
        tokio::time::sleep(Duration::from_millis(10)).await;

        for subscription in &mut subscriptions {
            assert_eq!(
                subscription.try_recv(),
                Err(TryRecvError::Empty),
                "topic {}",
                subscription.topic()
            );
        }
        assert!(h.client.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_while_connecting_rejects_and_stays_down() {
        let options = quiet_options()
            .with_reconnect(ReconnectPolicy::default())
            .with_heartbeat_interval(Duration::from_secs(30));
        let mut h = harness(options, vec![vec![]]);

        let connecting = tokio::spawn({
            let client = h.client.clone();
            async move { client.connect().await }
        });
        let mut peer = h.peer().await;
        assert_eq!(h.client.status(), ConnectionState::Connecting);

        h.client.disconnect().await;
        assert_eq!(
            connecting.await.expect("connect task"),
            Err(ConnectError::Disconnected)
        );

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(h.opens(), 1);
        assert_eq!(h.client.status(), ConnectionState::Disconnected);
        assert!(peer.drain_sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn huge_durations_disable_timers_instead_of_panicking() {
        let options = quiet_options()
            .with_connect_timeout(Duration::MAX)
            .with_heartbeat_interval(Duration::MAX);
        let mut h = harness(options, vec![vec![], vec![TransportEvent::Opened]]);

        let pending = tokio::spawn({
            let client = h.client.clone();
            async move { client.connect().await }
        });
        let _stalled = h.peer().await;
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(h.client.status(), ConnectionState::Connecting);

        h.client.connect().await.expect("second connect");
        assert_eq!(
            pending.await.expect("connect task"),
            Err(ConnectError::Superseded)
        );
        let mut peer = h.peer().await;
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert!(peer.drain_sent().is_empty());
        assert!(h.client.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn try_recv_tells_empty_from_removed() {
        let h = harness(quiet_options(), vec![]);
        let mut status = h.client.subscribe(Topic::Status).expect("subscribe");
        settle().await;
        assert_eq!(status.try_recv(), Err(TryRecvError::Empty));

        h.client.unsubscribe(status.id());
        settle().await;
        assert_eq!(status.try_recv(), Err(TryRecvError::Disconnected));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_is_idempotent_and_allows_reconnect() {
        let h = harness(quiet_options(), vec![]);
        h.client.disconnect().await;
        h.client.disconnect().await;
        assert_eq!(h.client.status(), ConnectionState::Disconnected);

        h.client.connect().await.expect("connect");
        h.client.disconnect().await;
        h.client.disconnect().await;
        assert_eq!(h.client.status(), ConnectionState::Disconnected);

        h.client.connect().await.expect("reconnect");
        assert_eq!(h.opens(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_pings_while_connected() {
        let options = quiet_options().with_heartbeat_interval(Duration::from_secs(30));
        let mut h = harness(options, vec![]);
        h.client.connect().await.expect("connect");
        let mut peer = h.peer().await;

        tokio::time::sleep(Duration::from_secs(65)).await;
        let frames = peer.drain_sent();
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|frame| frame.kind == "ping"));

        h.client.disconnect().await;
        tokio::time::sleep(Duration::from_secs(65)).await;
        assert!(peer.drain_sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_replaces_heartbeat_instead_of_stacking() {
        let options = quiet_options()
            .with_heartbeat_interval(Duration::from_secs(30))
            .with_reconnect(ReconnectPolicy {
                max_attempts: 5,
                interval: Duration::from_secs(3),
            });
        let mut h = harness(options, vec![]);
        h.client.connect().await.expect("connect");
        let mut first = h.peer().await;

        // Close mid-period so a surviving timer would fire at 30 s and 60 s.
        tokio::time::sleep(Duration::from_secs(20)).await;
        first.push(TransportEvent::Closed);
        let mut second = h.peer().await;
        assert_eq!(h.opens(), 2);

        tokio::time::sleep(Duration::from_secs(65)).await;
        let pings = second.drain_sent();
        assert_eq!(pings.len(), 2);
        assert!(pings.iter().all(|frame| frame.kind == "ping"));
        assert!(first.drain_sent().is_empty());
        assert!(h.client.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_pongs_close_the_session_when_watchdog_enabled() {
        let options = quiet_options()
            .with_heartbeat_interval(Duration::from_secs(30))
            .with_pong_timeout(Duration::from_secs(45));
        let mut h = harness(options, vec![]);
        h.client.connect().await.expect("connect");
        let _peer = h.peer().await;

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(h.client.is_connected());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(h.client.status(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_reports_dropped_messages() {
        let h = harness(
            quiet_options().with_queue_capacity(1, OverflowPolicy::DropOldest),
            vec![],
        );
        let mut dropped = h.client.subscribe(Topic::Dropped).expect("subscribe");

        let first = h.client.get_pending_prompts().expect("first");
        h.client.get_pending_prompts().expect("second");

        match dropped.recv().await {
            Some(ClientEvent::Dropped { message, error }) => {
                assert_eq!(message.id.as_deref(), Some(first.as_str()));
                assert_eq!(error.capacity, 1);
            }
            other => panic!("expected dropped event, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn send_helpers_shape_envelopes() {
        let mut h = harness(quiet_options(), vec![]);
        h.client.connect().await.expect("connect");
        let mut peer = h.peer().await;

        h.client
            .run_workspace("ws-1", Some(&json!({"input": "hi"})))
            .expect("run_workspace");
        h.client.run_workflow("gf-1", "ws-1").expect("run_workflow");
        h.client
            .send_workflow_json("req-9", &json!({"nodes": []}))
            .expect("workflow_json");
        h.client
            .send_console_input("prompt-1", "yes")
            .expect("console_input");
        h.client
            .send_error_reply("req-10", json!({"error": "No workspace loaded"}))
            .expect("error reply");

        tokio::time::sleep(Duration::from_millis(10)).await;
        let frames = peer.drain_sent();
        assert_eq!(frames.len(), 5);

        assert_eq!(frames[0].kind, "run_workspace");
        assert_eq!(frames[0].data, Some(json!(r#"{"input":"hi"}"#)));

        assert_eq!(frames[1].kind, "run_workflow");
        assert_eq!(frames[1].workspace_id.as_deref(), Some("ws-1"));
        assert_eq!(frames[1].data, Some(json!("gf-1")));

        assert_eq!(frames[2].kind, "workflow_json");
        assert_eq!(frames[2].id.as_deref(), Some("req-9"));
        assert_eq!(frames[2].data, Some(json!({"nodes": []})));

        assert_eq!(frames[3].kind, "console_input");
        let data = frames[3].data.as_ref().expect("console data");
        assert_eq!(data["promptId"], "prompt-1");
        assert_eq!(data["message"], "yes");

        assert_eq!(frames[4].kind, "error");
        assert_eq!(frames[4].id.as_deref(), Some("req-10"));
    }
}
