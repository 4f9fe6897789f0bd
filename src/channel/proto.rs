use std::collections::BTreeMap;

use chrono::{SecondsFormat, Utc};
use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Envelope `type` values used on the wire.
pub mod kinds {
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const CONNECTED: &str = "connected";
    pub const MESSAGE: &str = "message";
    pub const CONSOLE_PROMPT: &str = "console_prompt";
    pub const CONSOLE_INPUT: &str = "console_input";
    pub const CONSOLE_INPUT_RESOLVED: &str = "console_input_resolved";
    pub const WORKFLOW_OUTPUT: &str = "workflow_output";
    pub const WORKFLOW_RESULT: &str = "workflow_result";
    pub const WORKFLOW_JSON: &str = "workflow_json";
    pub const PENDING_PROMPTS: &str = "pending_prompts";
    pub const GET_PENDING_PROMPTS: &str = "get_pending_prompts";
    pub const ERROR: &str = "error";
    pub const RUN_WORKFLOW: &str = "run_workflow";
    pub const RUN_WORKSPACE: &str = "run_workspace";
}

/// One JSON protocol frame, inbound or outbound.
///
/// Fields the client does not model are kept in `extra` so observers of raw
/// frames see the full object. Only `type` must be a string; the optional
/// identity fields accept numbers and read any other JSON shape as absent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub correlation_id: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub workspace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub prompt_id: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Reads a string or number as text. Other JSON values become `None`.
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(text)) => Some(text),
        Some(Value::Number(number)) => Some(number.to_string()),
        _ => None,
    })
}

/// Client-produced envelope.
pub type OutboundMessage = Envelope;

impl Envelope {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_workspace_id(mut self, workspace_id: impl Into<String>) -> Self {
        self.workspace_id = Some(workspace_id.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_prompt_id(mut self, prompt_id: impl Into<String>) -> Self {
        self.prompt_id = Some(prompt_id.into());
        self
    }

    /// Assigns `id` and `timestamp` when absent. Existing values are kept.
    pub fn ensure_identity(&mut self) {
        if self.id.is_none() {
            self.id = Some(generate_message_id());
        }
        if self.timestamp.is_none() {
            self.timestamp = Some(iso_timestamp());
        }
    }

    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Payload of a backend `run_workflow` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunWorkflowRequest {
    /// Envelope `id`; replies must echo it.
    pub request_id: Option<String>,
    pub workflow_id: Option<String>,
}

/// Inbound envelope classified by its `type`.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Pong,
    Connected(Envelope),
    /// `message`, `console_prompt`, `console_input` or `workflow_output`.
    Console {
        kind: String,
        data: Option<Value>,
    },
    InputResolved(Option<Value>),
    WorkflowResult(Envelope),
    PendingPrompts(Option<Value>),
    Error(Envelope),
    RunWorkflow(RunWorkflowRequest),
    /// Any type this client does not know about.
    Unknown(String),
}

impl From<Envelope> for InboundMessage {
    fn from(envelope: Envelope) -> Self {
        match envelope.kind.as_str() {
            kinds::PONG => Self::Pong,
            kinds::CONNECTED => Self::Connected(envelope),
            kinds::MESSAGE | kinds::CONSOLE_PROMPT | kinds::CONSOLE_INPUT
            | kinds::WORKFLOW_OUTPUT => Self::Console {
                kind: envelope.kind,
                data: envelope.data,
            },
            kinds::CONSOLE_INPUT_RESOLVED => Self::InputResolved(envelope.data),
            kinds::WORKFLOW_RESULT => Self::WorkflowResult(envelope),
            kinds::PENDING_PROMPTS => Self::PendingPrompts(envelope.data),
            kinds::ERROR => Self::Error(envelope),
            kinds::RUN_WORKFLOW => Self::RunWorkflow(RunWorkflowRequest {
                request_id: envelope.id,
                workflow_id: envelope.data.map(value_to_id),
            }),
            _ => Self::Unknown(envelope.kind),
        }
    }
}

fn value_to_id(value: Value) -> String {
    match value {
        Value::String(text) => text,
        other => other.to_string(),
    }
}

/// Console line shown to the operator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConsoleEvent {
    pub id: String,
    /// Epoch milliseconds.
    pub timestamp: i64,
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
}

impl ConsoleEvent {
    pub fn error(message: impl Into<String>) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            id: now.to_string(),
            timestamp: now,
            kind: "error".to_string(),
            message: message.into(),
            details: None,
            results: None,
            prompt_id: None,
            node_id: None,
            node_name: None,
        }
    }
}

const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const ID_SUFFIX_LEN: usize = 9;

/// Generates `<epoch millis>-<9 base36 chars>`.
///
/// Unique in practice, not guaranteed.
pub fn generate_message_id() -> String {
    let mut rng = rand::rng();
    let suffix: String = (0..ID_SUFFIX_LEN)
        .map(|_| BASE36[rng.random_range(0..BASE36.len())] as char)
        .collect();
    format!("{}-{suffix}", Utc::now().timestamp_millis())
}

/// Current UTC time as ISO-8601 with millisecond precision.
pub fn iso_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
