//! Transport sessions the channel client drives.
//!
//! A session reports its lifecycle as a stream of [`TransportEvent`]s and
//! accepts serialized frames through [`TransportHandle::send`]. Dropping the
//! handle terminates the session.

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

/// Lifecycle and data notifications from one transport session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// The session is open and frames may be sent.
    Opened,
    /// A text frame arrived.
    Frame(String),
    /// The session failed. No further events follow.
    Error(String),
    /// The session closed. No further events follow.
    Closed,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport session is closed")]
    SessionClosed,
}

/// Owned end of a transport session.
#[derive(Debug)]
pub struct TransportHandle {
    outbound: mpsc::UnboundedSender<String>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    task: Option<AbortHandle>,
}

impl TransportHandle {
    /// Builds a handle from raw channel ends.
    ///
    /// `outbound` receives every frame passed to [`send`](Self::send) and
    /// `events` is polled by the client for lifecycle notifications.
    pub fn new(
        outbound: mpsc::UnboundedSender<String>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Self {
        Self {
            outbound,
            events,
            task: None,
        }
    }

    /// Ties a background task to this handle; it is aborted on drop.
    pub fn with_task(mut self, task: AbortHandle) -> Self {
        self.task = Some(task);
        self
    }

    pub fn send(&self, frame: String) -> Result<(), TransportError> {
        self.outbound
            .send(frame)
            .map_err(|_| TransportError::SessionClosed)
    }

    /// Next lifecycle event, or `None` once the session side has gone away.
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        self.events.recv().await
    }
}

impl Drop for TransportHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Opens transport sessions to a backend endpoint.
pub trait Transport: Send + Sync + 'static {
    /// Starts opening a session. Must be called from within a tokio runtime.
    fn open(&self, url: &str) -> TransportHandle;
}

/// Websocket transport backed by `tokio-tungstenite`.
#[derive(Clone, Copy, Debug, Default)]
pub struct WsTransport;

impl Transport for WsTransport {
    fn open(&self, url: &str) -> TransportHandle {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let url = url.to_string();

        let task = tokio::spawn(async move {
            run_ws_session(url, outbound_rx, events_tx).await;
        });

        TransportHandle::new(outbound_tx, events_rx).with_task(task.abort_handle())
    }
}

async fn run_ws_session(
    url: String,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
) {
    let mut socket = match connect_async(url.as_str()).await {
        Ok((socket, _)) => socket,
        Err(err) => {
            let _ = events_tx.send(TransportEvent::Error(err.to_string()));
            return;
        }
    };
    let _ = events_tx.send(TransportEvent::Opened);

    loop {
        tokio::select! {
            maybe_outbound = outbound_rx.recv() => {
                match maybe_outbound {
                    Some(frame) => {
                        if let Err(err) = socket.send(Message::Text(frame.into())).await {
                            let _ = events_tx.send(TransportEvent::Error(err.to_string()));
                            return;
                        }
                    }
                    None => {
                        debug!(event = "ws_session_released", url = %url);
                        let _ = socket.close(None).await;
                        return;
                    }
                }
            }
            maybe_inbound = socket.next() => {
                match maybe_inbound {
                    Some(Ok(Message::Text(text))) => {
                        let _ = events_tx.send(TransportEvent::Frame(text.as_str().to_owned()));
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        let text = String::from_utf8_lossy(&bytes).into_owned();
                        let _ = events_tx.send(TransportEvent::Frame(text));
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if let Err(err) = socket.send(Message::Pong(payload)).await {
                            let _ = events_tx.send(TransportEvent::Error(err.to_string()));
                            return;
                        }
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                    Some(Ok(Message::Close(_))) | None => {
                        let _ = events_tx.send(TransportEvent::Closed);
                        return;
                    }
                    Some(Err(err)) => {
                        let _ = events_tx.send(TransportEvent::Error(err.to_string()));
                        return;
                    }
                }
            }
        }
    }
}
