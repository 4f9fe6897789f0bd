//! Client for driving yaLLMa3 workspace execution on a remote backend.
//!
//! The crate is organized around a single resilient message channel:
//! - `channel`: websocket client, protocol envelopes and typed events.
//! - `reconnect`: fixed-interval reconnect policy with an attempt cap.
//! - `config`: client options and the operator config file.

/// Backend message channel.
pub mod channel;
/// Client options and operator config loading.
pub mod config;
/// Reconnect policy shared by channel clients.
pub mod reconnect;
