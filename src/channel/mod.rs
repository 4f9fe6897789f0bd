//! Backend message channel.
//!
//! - `client`: connection lifecycle, heartbeat, outbound queue flush and typed
//!   send helpers.
//! - `dispatch`: inbound routing and the subscription registry.
//! - `proto`: wire envelopes shared with the backend.
//! - `queue`: buffer for messages sent while disconnected.
//! - `transport`: transport sessions, including the websocket one.

/// Channel client handle and connection worker.
pub mod client;
/// Inbound dispatcher and event topics.
pub mod dispatch;
/// Protocol envelopes.
pub mod proto;
/// Outbound queue.
pub mod queue;
/// Transport sessions.
pub mod transport;

pub use client::{ChannelClient, ClientError, ConnectError, ConnectionState};
pub use dispatch::{ClientEvent, Subscription, SubscriptionId, Topic, TryRecvError};
pub use proto::{ConsoleEvent, Envelope, InboundMessage, OutboundMessage, RunWorkflowRequest};
