//! WebSocket endpoint.
//!
//! One connection follows at most one session at a time. Client messages are
//! handled in order; fanned-out messages from the session channel are
//! forwarded as they arrive.

use crate::broadcast::Fanout;
use crate::error::StoreError;
use crate::store::SessionStore;
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use inkcast_core::{ClientMessage, RejectReason, ServerMessage, StrokeDraft};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(store): State<Arc<SessionStore>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, store))
}

/// Per-connection state.
struct Connection {
    connection_id: String,
    participant_id: String,
    session_id: Option<String>,
    receiver: Option<broadcast::Receiver<Fanout>>,
}

impl Connection {
    fn new() -> Self {
        let connection_id = Uuid::new_v4().to_string();
        Self {
            participant_id: connection_id.clone(),
            connection_id,
            session_id: None,
            receiver: None,
        }
    }

    fn is_in(&self, session_id: &str) -> bool {
        self.session_id.as_deref() == Some(session_id)
    }

    /// Handle one client message, returning direct replies.
    async fn handle(&mut self, store: &SessionStore, msg: ClientMessage) -> Vec<ServerMessage> {
        match msg {
            ClientMessage::SnapshotRequest {
                session_id,
                participant_id,
            } => self.join(store, session_id, participant_id).await,
            ClientMessage::Publish { session_id, op } => self.publish(store, session_id, op).await,
            ClientMessage::Clear {
                session_id,
                clear_epoch,
            } => {
                if !self.is_in(&session_id) {
                    return vec![not_joined(&session_id)];
                }
                match store.clear(&session_id, clear_epoch).await {
                    Ok(_) => Vec::new(),
                    Err(e) => vec![ServerMessage::Error {
                        message: e.to_string(),
                    }],
                }
            }
            ClientMessage::Persist { session_id } => {
                if self.is_in(&session_id) {
                    // Failures are reported to the whole session as a warning
                    if let Err(e) = store.persist(&session_id).await {
                        debug!("Persist request for {} failed: {}", session_id, e);
                    }
                }
                Vec::new()
            }
            ClientMessage::Leave { session_id } => {
                if self.is_in(&session_id) {
                    self.leave(store).await;
                }
                Vec::new()
            }
        }
    }

    async fn join(&mut self, store: &SessionStore, session_id: String, participant_id: String) -> Vec<ServerMessage> {
        // Already subscribed: the client lost track and wants a fresh snapshot
        if self.is_in(&session_id) && self.receiver.is_some() {
            return self.resync(store).await;
        }
        if self.session_id.is_some() {
            self.leave(store).await;
        }

        let participant_id = if participant_id.trim().is_empty() {
            self.connection_id.clone()
        } else {
            participant_id
        };

        match store.join(&session_id, &participant_id).await {
            Ok(joined) => {
                info!(
                    "Connection {} joined {} as {}",
                    self.connection_id, session_id, participant_id
                );
                self.participant_id = participant_id;
                self.session_id = Some(session_id.clone());
                self.receiver = Some(joined.receiver);
                vec![joined.snapshot.into_message(session_id)]
            }
            Err(e) => {
                warn!("Failed to join {}: {}", session_id, e);
                vec![ServerMessage::Error {
                    message: format!("Could not open session {}: {}", session_id, e),
                }]
            }
        }
    }

    async fn publish(&mut self, store: &SessionStore, session_id: String, op: StrokeDraft) -> Vec<ServerMessage> {
        let client_op_id = op.client_op_id;
        if !self.is_in(&session_id) {
            return vec![ServerMessage::Reject {
                session_id: session_id.clone(),
                client_op_id,
                reason: RejectReason::SessionNotFound,
                message: format!("Not joined to session {}", session_id),
            }];
        }

        match store.accept(&session_id, &self.participant_id, op).await {
            Ok(op) if op.tool().is_shape() => match op.sequence_number() {
                Some(sequence_number) => vec![ServerMessage::Ack {
                    session_id,
                    client_op_id,
                    sequence_number,
                }],
                None => Vec::new(),
            },
            Ok(_) => Vec::new(),
            Err(StoreError::StaleEpoch { op_epoch, current }) => {
                debug!(
                    "Dropping operation {} from epoch {} in {} (current {})",
                    client_op_id, op_epoch, session_id, current
                );
                Vec::new()
            }
            Err(StoreError::Validation(e)) => {
                debug!("Rejecting operation {} from {}: {}", client_op_id, self.participant_id, e);
                vec![ServerMessage::Reject {
                    session_id,
                    client_op_id,
                    reason: RejectReason::Validation,
                    message: e.to_string(),
                }]
            }
            Err(StoreError::SessionNotFound(_)) => {
                // The session went away under us
                self.session_id = None;
                self.receiver = None;
                vec![ServerMessage::Reject {
                    session_id: session_id.clone(),
                    client_op_id,
                    reason: RejectReason::SessionNotFound,
                    message: format!("Session {} is not open", session_id),
                }]
            }
            Err(e) => {
                error!("Failed to accept operation in {}: {}", session_id, e);
                vec![ServerMessage::Error {
                    message: e.to_string(),
                }]
            }
        }
    }

    /// Send a fresh snapshot on the existing subscription.
    async fn resync(&mut self, store: &SessionStore) -> Vec<ServerMessage> {
        let Some(session_id) = self.session_id.clone() else {
            return Vec::new();
        };
        match store.snapshot(&session_id).await {
            Ok(snapshot) => vec![snapshot.into_message(session_id)],
            Err(e) => {
                warn!("Failed to resync {} in {}: {}", self.connection_id, session_id, e);
                self.session_id = None;
                self.receiver = None;
                vec![ServerMessage::Error {
                    message: format!("Could not resync session {}: {}", session_id, e),
                }]
            }
        }
    }

    async fn leave(&mut self, store: &SessionStore) {
        self.receiver = None;
        if let Some(session_id) = self.session_id.take() {
            match store.leave(&session_id, &self.participant_id).await {
                Ok(true) => debug!("Session {} released", session_id),
                Ok(false) => {}
                Err(e) => debug!("Leave of {} ignored: {}", session_id, e),
            }
        }
    }
}

fn not_joined(session_id: &str) -> ServerMessage {
    ServerMessage::Error {
        message: format!("Not joined to session {}", session_id),
    }
}

async fn next_fanout(receiver: &mut Option<broadcast::Receiver<Fanout>>) -> Result<Fanout, RecvError> {
    match receiver {
        Some(rx) => rx.recv().await,
        // Not in a session, just wait forever
        None => std::future::pending().await,
    }
}

async fn send(sender: &mut SplitSink<WebSocket, Message>, msg: &ServerMessage) -> Result<(), axum::Error> {
    match serde_json::to_string(msg) {
        Ok(json) => sender.send(Message::Text(json.into())).await,
        Err(e) => {
            error!("Failed to encode message: {}", e);
            Ok(())
        }
    }
}

async fn send_all(sender: &mut SplitSink<WebSocket, Message>, msgs: &[ServerMessage]) -> Result<(), axum::Error> {
    for msg in msgs {
        send(sender, msg).await?;
    }
    Ok(())
}

/// Handle a WebSocket connection
async fn handle_socket(socket: WebSocket, store: Arc<SessionStore>) {
    let mut conn = Connection::new();
    info!("New connection: {}", conn.connection_id);

    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            // Handle incoming messages from client
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let replies = match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(client_msg) => conn.handle(&store, client_msg).await,
                            Err(e) => {
                                warn!("Invalid message from {}: {}", conn.connection_id, e);
                                vec![ServerMessage::Error {
                                    message: format!("Invalid message: {}", e),
                                }]
                            }
                        };
                        if send_all(&mut sender, &replies).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        break;
                    }
                    Some(Ok(_)) => {} // Ignore binary and ping/pong
                    Some(Err(e)) => {
                        warn!("WebSocket error for {}: {}", conn.connection_id, e);
                        break;
                    }
                }
            }

            // Forward the session's fan-out
            fanout = next_fanout(&mut conn.receiver) => {
                match fanout {
                    Ok(msg) => {
                        if send(&mut sender, &msg).await.is_err() {
                            break;
                        }
                        if matches!(*msg, ServerMessage::SessionClosed { .. }) {
                            conn.session_id = None;
                            conn.receiver = None;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Connection {} lagged by {} messages, resyncing", conn.connection_id, skipped);
                        let replies = conn.resync(&store).await;
                        if send_all(&mut sender, &replies).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Closed) => {
                        conn.receiver = None;
                    }
                }
            }
        }
    }

    // Cleanup on disconnect
    conn.leave(&store).await;
    info!("Connection closed: {}", conn.connection_id);
}
