//! Wire protocol and WebSocket client for whiteboard sessions.
//!
//! Every frame is a JSON text message tagged by `event`:
//! ```json
//! { "event": "whiteboard.snapshot.request", "sessionId": "s1", "participantId": "alice" }
//! { "event": "whiteboard.op.publish", "sessionId": "s1", "op": { "tool": "pen", ... } }
//! { "event": "whiteboard.clear", "sessionId": "s1", "clearEpoch": 1 }
//! ```

use crate::canvas::SnapshotData;
use crate::stroke::{StrokeDraft, StrokeOp};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Messages sent to the session store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum ClientMessage {
    /// Join a session and ask for its current snapshot.
    #[serde(rename = "whiteboard.snapshot.request", rename_all = "camelCase")]
    SnapshotRequest {
        session_id: String,
        participant_id: String,
    },
    /// Submit an operation for acceptance.
    #[serde(rename = "whiteboard.op.publish", rename_all = "camelCase")]
    Publish { session_id: String, op: StrokeDraft },
    /// Clear the board. `clear_epoch` is the epoch the client currently sees.
    #[serde(rename = "whiteboard.clear", rename_all = "camelCase")]
    Clear { session_id: String, clear_epoch: u64 },
    /// Ask the store to write the session to durable storage.
    #[serde(rename = "whiteboard.persist", rename_all = "camelCase")]
    Persist { session_id: String },
    /// Leave the session.
    #[serde(rename = "whiteboard.leave", rename_all = "camelCase")]
    Leave { session_id: String },
}

/// Why a published operation was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    Validation,
    SessionNotFound,
}

/// Messages received from the session store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum ServerMessage {
    /// Current canvas; also confirms the subscription.
    #[serde(rename = "whiteboard.snapshot.response", rename_all = "camelCase")]
    SnapshotResponse {
        session_id: String,
        snapshot: SnapshotData,
        /// Last operation contained in the snapshot (`None` for an empty log).
        sequence_number: Option<u64>,
        clear_epoch: u64,
    },
    /// An accepted operation.
    #[serde(rename = "whiteboard.op.broadcast", rename_all = "camelCase")]
    Broadcast { session_id: String, op: StrokeOp },
    /// A shape operation was accepted.
    #[serde(rename = "whiteboard.op.ack", rename_all = "camelCase")]
    Ack {
        session_id: String,
        client_op_id: u64,
        sequence_number: u64,
    },
    /// A published operation was refused.
    #[serde(rename = "whiteboard.op.reject", rename_all = "camelCase")]
    Reject {
        session_id: String,
        client_op_id: u64,
        reason: RejectReason,
        message: String,
    },
    /// The board was cleared; `clear_epoch` is the new epoch.
    #[serde(rename = "whiteboard.clear", rename_all = "camelCase")]
    Clear { session_id: String, clear_epoch: u64 },
    #[serde(rename = "presence.participant.joined", rename_all = "camelCase")]
    ParticipantJoined {
        session_id: String,
        participant_id: String,
    },
    #[serde(rename = "presence.participant.left", rename_all = "camelCase")]
    ParticipantLeft {
        session_id: String,
        participant_id: String,
    },
    /// The parent session was deleted.
    #[serde(rename = "whiteboard.session.closed", rename_all = "camelCase")]
    SessionClosed { session_id: String },
    /// Non-fatal degradation, e.g. durable storage unavailable.
    #[serde(rename = "whiteboard.warning", rename_all = "camelCase")]
    Warning { session_id: String, message: String },
    /// Malformed request.
    #[serde(rename = "whiteboard.error")]
    Error { message: String },
}

impl ServerMessage {
    /// Session this message belongs to, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            ServerMessage::SnapshotResponse { session_id, .. }
            | ServerMessage::Broadcast { session_id, .. }
            | ServerMessage::Ack { session_id, .. }
            | ServerMessage::Reject { session_id, .. }
            | ServerMessage::Clear { session_id, .. }
            | ServerMessage::ParticipantJoined { session_id, .. }
            | ServerMessage::ParticipantLeft { session_id, .. }
            | ServerMessage::SessionClosed { session_id }
            | ServerMessage::Warning { session_id, .. } => Some(session_id),
            ServerMessage::Error { .. } => None,
        }
    }
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Events from the WebSocket client
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Connected to server
    Connected,
    /// Disconnected from server
    Disconnected,
    /// A decoded server message
    Message(ServerMessage),
    /// Error occurred
    Error { message: String },
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("Already connected")]
    AlreadyConnected,
    #[error("Not connected")]
    NotConnected,
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

mod native_client {
    use super::*;
    use std::io::ErrorKind;
    use std::net::TcpStream;
    use std::sync::mpsc::{Receiver, Sender, TryRecvError, channel};
    use std::thread::{self, JoinHandle};
    use std::time::Duration;
    use tungstenite::stream::MaybeTlsStream;
    use tungstenite::{Message, WebSocket, connect};
    use url::Url;

    type Socket = WebSocket<MaybeTlsStream<TcpStream>>;

    /// Short enough that queued commands are not starved by a quiet socket.
    const READ_TIMEOUT: Duration = Duration::from_millis(20);
    const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

    /// Commands sent to the WebSocket thread.
    enum WsCommand {
        Send(String),
        Close,
    }

    /// Body of the transport thread. Every exit ends with either `Error` or
    /// `Disconnected`.
    fn run(url: &str, commands: &Receiver<WsCommand>, events: &Sender<TransportEvent>) {
        log::info!("Transport thread: connecting to {}", url);
        let mut socket = match connect(url) {
            Ok((socket, response)) => {
                log::info!("Transport connected, status: {}", response.status());
                socket
            }
            Err(e) => {
                report(events, format!("Connection failed: {}", e));
                return;
            }
        };

        if let Err(e) = set_timeouts(&mut socket) {
            report(events, format!("Could not configure socket: {}", e));
            return;
        }
        if events.send(TransportEvent::Connected).is_err() {
            return;
        }

        match serve(&mut socket, commands, events) {
            Ok(()) => {
                log::info!("Transport thread exiting");
                let _ = events.send(TransportEvent::Disconnected);
            }
            Err(message) => report(events, message),
        }
    }

    fn report(events: &Sender<TransportEvent>, message: String) {
        log::error!("Transport: {}", message);
        // The receiver is gone once the transport was dropped
        let _ = events.send(TransportEvent::Error { message });
    }

    fn set_timeouts(socket: &mut Socket) -> std::io::Result<()> {
        if let MaybeTlsStream::Plain(tcp) = socket.get_mut() {
            tcp.set_read_timeout(Some(READ_TIMEOUT))?;
            tcp.set_write_timeout(Some(WRITE_TIMEOUT))?;
        }
        Ok(())
    }

    fn is_timeout(e: &std::io::Error) -> bool {
        matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
    }

    /// Alternate between draining commands and reading one frame. `Ok` is a
    /// clean shutdown, `Err` a failure worth showing.
    fn serve(socket: &mut Socket, commands: &Receiver<WsCommand>, events: &Sender<TransportEvent>) -> Result<(), String> {
        loop {
            loop {
                match commands.try_recv() {
                    Ok(WsCommand::Send(text)) => {
                        socket
                            .send(Message::Text(text))
                            .map_err(|e| format!("Send failed: {}", e))?;
                    }
                    Ok(WsCommand::Close) => {
                        log::info!("Transport close requested");
                        return match socket.close(None) {
                            Ok(()) | Err(tungstenite::Error::ConnectionClosed) => Ok(()),
                            Err(e) => Err(format!("Close failed: {}", e)),
                        };
                    }
                    Err(TryRecvError::Disconnected) => return Ok(()),
                    Err(TryRecvError::Empty) => break,
                }
            }

            match socket.read() {
                Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(msg) => {
                        if events.send(TransportEvent::Message(msg)).is_err() {
                            return Ok(());
                        }
                    }
                    Err(e) => log::warn!("Failed to parse server message: {}", e),
                },
                Ok(Message::Ping(data)) => {
                    socket
                        .send(Message::Pong(data))
                        .map_err(|e| format!("Pong failed: {}", e))?;
                }
                Ok(Message::Close(_)) => {
                    log::info!("Transport received close frame");
                    return Ok(());
                }
                Ok(_) => {}
                Err(tungstenite::Error::Io(ref e)) if is_timeout(e) => {}
                Err(tungstenite::Error::ConnectionClosed) => return Ok(()),
                Err(e) => return Err(format!("Read failed: {}", e)),
            }
        }
    }

    /// WebSocket client for native platforms.
    ///
    /// Uses a background thread for non-blocking operation.
    pub struct NativeTransport {
        state: ConnectionState,
        events: Vec<TransportEvent>,
        /// Channel to send commands to the WebSocket thread.
        cmd_tx: Option<Sender<WsCommand>>,
        /// Channel to receive events from the WebSocket thread.
        event_rx: Option<Receiver<TransportEvent>>,
        /// Handle to the WebSocket thread.
        _thread: Option<JoinHandle<()>>,
    }

    impl NativeTransport {
        /// Create a new disconnected client.
        pub fn new() -> Self {
            Self {
                state: ConnectionState::Disconnected,
                events: Vec::new(),
                cmd_tx: None,
                event_rx: None,
                _thread: None,
            }
        }

        /// Connect to a session store.
        pub fn connect(&mut self, url: &str) -> Result<(), TransportError> {
            if self.cmd_tx.is_some() {
                return Err(TransportError::AlreadyConnected);
            }

            let parsed_url = Url::parse(url).map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
            if parsed_url.scheme() != "ws" && parsed_url.scheme() != "wss" {
                return Err(TransportError::InvalidUrl(format!(
                    "unsupported scheme: {}",
                    parsed_url.scheme()
                )));
            }

            self.state = ConnectionState::Connecting;

            let (cmd_tx, cmd_rx) = channel::<WsCommand>();
            let (event_tx, event_rx) = channel::<TransportEvent>();

            let url = url.to_string();

            let handle = thread::spawn(move || run(&url, &cmd_rx, &event_tx));

            self.cmd_tx = Some(cmd_tx);
            self.event_rx = Some(event_rx);
            self._thread = Some(handle);

            Ok(())
        }

        /// Disconnect from the server.
        pub fn disconnect(&mut self) {
            if let Some(tx) = self.cmd_tx.take() {
                let _ = tx.send(WsCommand::Close);
            }
            self.event_rx = None;
            self._thread = None;
            self.state = ConnectionState::Disconnected;
        }

        /// Queue a message for sending.
        pub fn send(&self, msg: &ClientMessage) -> Result<(), TransportError> {
            let tx = self.cmd_tx.as_ref().ok_or(TransportError::NotConnected)?;
            let json = serde_json::to_string(msg)?;
            tx.send(WsCommand::Send(json))
                .map_err(|_| TransportError::NotConnected)
        }

        /// Poll for pending events (non-blocking).
        pub fn poll_events(&mut self) -> Vec<TransportEvent> {
            if let Some(ref rx) = self.event_rx {
                while let Ok(event) = rx.try_recv() {
                    match &event {
                        TransportEvent::Connected => self.state = ConnectionState::Connected,
                        TransportEvent::Disconnected => self.state = ConnectionState::Disconnected,
                        TransportEvent::Error { .. } => self.state = ConnectionState::Error,
                        TransportEvent::Message(_) => {}
                    }
                    self.events.push(event);
                }
            }

            std::mem::take(&mut self.events)
        }

        /// Get current connection state.
        pub fn state(&self) -> ConnectionState {
            self.state
        }

        /// Check if connected.
        pub fn is_connected(&self) -> bool {
            self.state == ConnectionState::Connected
        }
    }

    impl Default for NativeTransport {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Drop for NativeTransport {
        fn drop(&mut self) {
            self.disconnect();
        }
    }
}

pub use native_client::NativeTransport;
