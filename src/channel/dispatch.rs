//! Typed event surface and inbound frame routing.
//!
//! Every inbound frame is parsed into an [`Envelope`], announced on the raw
//! `message` topic, then classified into an [`InboundMessage`] and fanned out
//! to the subscribers of its topic. Malformed frames are logged and dropped.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc;
pub use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, trace, warn};

use crate::channel::client::ConnectionState;
use crate::channel::proto::{
    kinds, ConsoleEvent, Envelope, InboundMessage, OutboundMessage, RunWorkflowRequest,
};
use crate::channel::queue::QueueOverflow;

/// Event topics a caller can subscribe to.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Topic {
    Status,
    Message,
    Console,
    Connected,
    InputResolved,
    WorkflowResult,
    PendingPrompts,
    ErrorMessage,
    RunWorkflow,
    Dropped,
}

impl Topic {
    pub const ALL: [Topic; 10] = [
        Topic::Status,
        Topic::Message,
        Topic::Console,
        Topic::Connected,
        Topic::InputResolved,
        Topic::WorkflowResult,
        Topic::PendingPrompts,
        Topic::ErrorMessage,
        Topic::RunWorkflow,
        Topic::Dropped,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Topic::Status => "status",
            Topic::Message => "message",
            Topic::Console => "console",
            Topic::Connected => "connected",
            Topic::InputResolved => "input_resolved",
            Topic::WorkflowResult => "workflow_result",
            Topic::PendingPrompts => "pending_prompts",
            Topic::ErrorMessage => "error_message",
            Topic::RunWorkflow => "run_workflow",
            Topic::Dropped => "dropped",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown event topic: {0}")]
pub struct UnknownTopic(pub String);

impl FromStr for Topic {
    type Err = UnknownTopic;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        Topic::ALL
            .into_iter()
            .find(|topic| topic.as_str() == name)
            .ok_or_else(|| UnknownTopic(name.to_string()))
    }
}

/// Event delivered to subscribers.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientEvent {
    /// Connection state changed.
    Status(ConnectionState),
    /// Any successfully parsed inbound envelope, before routing.
    Message(Envelope),
    /// Console payload (`data`) of a console-family envelope.
    Console(Value),
    /// Server handshake acknowledgement.
    Connected(Envelope),
    /// Server accepted a previously sent console input.
    InputResolved(Option<Value>),
    /// Terminal result of an execution.
    WorkflowResult(Envelope),
    /// Backlog of unanswered prompts.
    PendingPrompts(Option<Value>),
    /// Application error reported by the backend.
    ErrorMessage(Envelope),
    /// Backend asks the client for a workflow definition.
    RunWorkflow(RunWorkflowRequest),
    /// Outbound message discarded by a full queue.
    Dropped {
        message: OutboundMessage,
        error: QueueOverflow,
    },
}

impl ClientEvent {
    pub fn topic(&self) -> Topic {
        match self {
            ClientEvent::Status(_) => Topic::Status,
            ClientEvent::Message(_) => Topic::Message,
            ClientEvent::Console(_) => Topic::Console,
            ClientEvent::Connected(_) => Topic::Connected,
            ClientEvent::InputResolved(_) => Topic::InputResolved,
            ClientEvent::WorkflowResult(_) => Topic::WorkflowResult,
            ClientEvent::PendingPrompts(_) => Topic::PendingPrompts,
            ClientEvent::ErrorMessage(_) => Topic::ErrorMessage,
            ClientEvent::RunWorkflow(_) => Topic::RunWorkflow,
            ClientEvent::Dropped { .. } => Topic::Dropped,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct SubscriptionId(pub(crate) u64);

/// Receiving end of one topic subscription.
///
/// Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    topic: Topic,
    receiver: mpsc::UnboundedReceiver<ClientEvent>,
}

impl Subscription {
    pub(crate) fn new(
        id: SubscriptionId,
        topic: Topic,
        receiver: mpsc::UnboundedReceiver<ClientEvent>,
    ) -> Self {
        Self {
            id,
            topic,
            receiver,
        }
    }

    /// Handle for [`ChannelClient::unsubscribe`](crate::channel::ChannelClient::unsubscribe).
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Topic this subscription receives.
    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// Waits for the next event. `None` once the client has shut down or the
    /// subscription was removed.
    pub async fn recv(&mut self) -> Option<ClientEvent> {
        self.receiver.recv().await
    }

    /// Returns an already delivered event without waiting.
    ///
    /// [`TryRecvError::Empty`] means nothing is pending yet;
    /// [`TryRecvError::Disconnected`] means the client has shut down or the
    /// subscription was removed.
    pub fn try_recv(&mut self) -> Result<ClientEvent, TryRecvError> {
        self.receiver.try_recv()
    }
}

/// Topic → ordered subscriber list. Owned by the client worker.
#[derive(Debug, Default)]
pub(crate) struct SubscriptionRegistry {
    topics: HashMap<Topic, Vec<(SubscriptionId, mpsc::UnboundedSender<ClientEvent>)>>,
}

impl SubscriptionRegistry {
    pub(crate) fn add(
        &mut self,
        topic: Topic,
        id: SubscriptionId,
        sender: mpsc::UnboundedSender<ClientEvent>,
    ) {
        self.topics.entry(topic).or_default().push((id, sender));
    }

    pub(crate) fn remove(&mut self, id: SubscriptionId) -> bool {
        let mut removed = false;
        for subscribers in self.topics.values_mut() {
            let before = subscribers.len();
            subscribers.retain(|(existing, _)| *existing != id);
            removed |= subscribers.len() != before;
        }
        removed
    }

    /// Delivers `event` to its topic and returns how many subscribers got it.
    ///
    /// Subscribers whose receiver was dropped are pruned.
    pub(crate) fn emit(&mut self, event: ClientEvent) -> usize {
        let Some(subscribers) = self.topics.get_mut(&event.topic()) else {
            return 0;
        };
        subscribers.retain(|(_, sender)| sender.send(event.clone()).is_ok());
        subscribers.len()
    }
}

/// Result of routing one inbound frame.
#[derive(Debug, PartialEq)]
pub(crate) enum Dispatch {
    /// Frame was malformed and dropped.
    Dropped,
    /// Heartbeat acknowledgement.
    Pong,
    Routed,
    /// Frame requires this reply to be sent.
    Reply(OutboundMessage),
}

#[derive(Debug)]
pub(crate) struct InboundDispatcher {
    pub(crate) auto_reply_unhandled: bool,
    pub(crate) verbose: bool,
}

impl InboundDispatcher {
    pub(crate) fn dispatch(&self, text: &str, registry: &mut SubscriptionRegistry) -> Dispatch {
        let envelope = match Envelope::from_text(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(
                    event = "inbound_parse_failed",
                    error = %err,
                    frame_len = text.len(),
                    "dropping malformed frame"
                );
                return Dispatch::Dropped;
            }
        };
        log_frame(self.verbose, "frame_received", &envelope.kind);

        if envelope.kind == kinds::PONG {
            return Dispatch::Pong;
        }
        registry.emit(ClientEvent::Message(envelope.clone()));

        match InboundMessage::from(envelope) {
            InboundMessage::Pong => return Dispatch::Pong,
            InboundMessage::Connected(envelope) => {
                registry.emit(ClientEvent::Connected(envelope));
            }
            InboundMessage::Console {
                data: Some(data), ..
            } => {
                registry.emit(ClientEvent::Console(data));
            }
            InboundMessage::Console { kind, data: None } => {
                debug!(event = "console_frame_without_data", kind = %kind);
            }
            InboundMessage::InputResolved(data) => {
                registry.emit(ClientEvent::InputResolved(data));
            }
            InboundMessage::WorkflowResult(envelope) => {
                registry.emit(ClientEvent::WorkflowResult(envelope));
            }
            InboundMessage::PendingPrompts(data) => {
                registry.emit(ClientEvent::PendingPrompts(data));
            }
            InboundMessage::Error(envelope) => {
                registry.emit(ClientEvent::ErrorMessage(envelope));
            }
            InboundMessage::RunWorkflow(request) => {
                let listeners = registry.emit(ClientEvent::RunWorkflow(request.clone()));
                if listeners == 0 && self.auto_reply_unhandled {
                    warn!(
                        event = "run_workflow_unhandled",
                        request_id = request.request_id.as_deref().unwrap_or_default(),
                        workflow_id = request.workflow_id.as_deref().unwrap_or_default(),
                        "no run_workflow listener; replying with error"
                    );
                    return Dispatch::Reply(unhandled_run_workflow_reply(&request));
                }
            }
            InboundMessage::Unknown(kind) => {
                debug!(event = "unknown_message_type", kind = %kind);
            }
        }
        Dispatch::Routed
    }
}

/// `workflow_output` error sent back when nobody answers a `run_workflow`.
pub(crate) fn unhandled_run_workflow_reply(request: &RunWorkflowRequest) -> OutboundMessage {
    let request_id = request.request_id.as_deref().unwrap_or("<none>");
    let workflow_id = request.workflow_id.as_deref().unwrap_or("<none>");

    let mut console = ConsoleEvent::error(format!(
        "No handler available for run_workflow request {request_id} (workflow {workflow_id})"
    ));
    console.details = Some(json!({
        "requestId": request_id,
        "workflowId": workflow_id,
    }));

    let mut reply = Envelope::new(kinds::WORKFLOW_OUTPUT)
        .with_data(serde_json::to_value(&console).unwrap_or_default());
    if let Some(id) = &request.request_id {
        reply = reply.with_correlation_id(id.clone());
    }
    reply
}

pub(crate) fn log_frame(verbose: bool, event: &'static str, kind: &str) {
    if verbose {
        debug!(event = event, kind = kind);
    } else {
        trace!(event = event, kind = kind);
    }
}
