//! Client-side whiteboard session lifecycle.
//!
//! [`SessionController`] is a single-threaded state machine. It consumes
//! server messages, local drawing input and clock ticks, and queues outgoing
//! [`ClientMessage`]s for whatever transport drives it.
//!
//! Two canvases are kept:
//! - `baseline`: the last snapshot plus every accepted operation, in order.
//! - `view`: what the participant sees. It is the baseline plus this
//!   participant's operations the store has not echoed back yet, unless
//!   undo/redo replaced it with an older local snapshot.

use crate::canvas::{SnapshotData, Surface, SurfaceError};
use crate::history::History;
use crate::reorder::{DEFAULT_GAP_TIMEOUT, DEFAULT_REORDER_WINDOW, ReorderBuffer, ReorderOutcome};
use crate::stroke::{StrokeOp, ValidationError};
use crate::sync::{ClientMessage, RejectReason, ServerMessage, TransportError};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Default time to wait for a shape acknowledgement.
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// Session errors.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Invalid operation: {0}")]
    Validation(#[from] ValidationError),
    #[error("Operation rejected: {0}")]
    Rejected(String),
    #[error("Session not found: {0}")]
    SessionNotFound(String),
    #[error("No acknowledgement for operation {client_op_id}")]
    PublishTimeout { client_op_id: u64 },
    #[error("Operation from epoch {op_epoch} is stale, session is at {current}")]
    StaleEpoch { op_epoch: u64, current: u64 },
    #[error("Transport disconnected")]
    TransportDisconnected,
    #[error("Session is not live")]
    NotLive,
    #[error("Session is closed")]
    Closed,
    #[error("Participant id must not be empty")]
    MissingParticipant,
    #[error(transparent)]
    Surface(#[from] SurfaceError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Lifecycle of one participant's view of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Whiteboard never opened.
    Inactive,
    /// Waiting for a snapshot. Remote updates are buffered, not shown.
    Loading,
    /// Snapshot applied; live operations flow.
    Live,
    /// Terminal and read-only.
    Closed,
}

/// Client tuning knobs.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// How long a shape waits for its acknowledgement.
    pub publish_timeout: Duration,
    /// Operations buffered behind a missing sequence number before resync.
    pub reorder_window: usize,
    /// How long a missing sequence number is waited for before resync.
    pub gap_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
            reorder_window: DEFAULT_REORDER_WINDOW,
            gap_timeout: DEFAULT_GAP_TIMEOUT,
        }
    }
}

/// Things the embedding UI may want to react to.
#[derive(Debug)]
pub enum SessionEvent {
    /// Snapshot rendered; live from here on.
    Live { sequence_number: Option<u64> },
    /// A remote operation was drawn.
    Applied { sequence_number: u64 },
    /// One of our own operations came back accepted.
    Confirmed { client_op_id: u64, sequence_number: u64 },
    /// A shape was acknowledged by the store.
    ShapeAcknowledged { client_op_id: u64, sequence_number: u64 },
    /// A shape failed and was removed from the view.
    ShapeReverted { client_op_id: u64, error: SessionError },
    /// The board was cleared.
    Cleared { clear_epoch: u64 },
    /// A snapshot was requested because continuity was lost.
    Resyncing,
    Connected,
    Disconnected,
    ParticipantJoined { participant_id: String },
    ParticipantLeft { participant_id: String },
    /// The store reported a non-fatal problem.
    Warning { message: String },
    /// The session ended.
    Closed,
}

/// An own operation the accepted stream has not echoed back yet.
#[derive(Debug, Clone)]
struct Unconfirmed {
    op: StrokeOp,
    /// Sequence number from the store's acknowledgement.
    acked: Option<u64>,
}

#[derive(Debug, Clone)]
struct PendingShape {
    client_op_id: u64,
    deadline: Instant,
}

/// One participant's whiteboard session.
pub struct SessionController<S: Surface> {
    session_id: String,
    participant_id: String,
    config: ClientConfig,
    state: LifecycleState,
    connected: bool,
    clear_epoch: u64,
    baseline: S,
    view: S,
    history: History,
    history_seeded: bool,
    reorder: ReorderBuffer,
    /// Broadcasts received before the snapshot arrived.
    preload: Vec<StrokeOp>,
    /// Own operations not yet seen in the accepted stream.
    unconfirmed: Vec<Unconfirmed>,
    pending_shapes: Vec<PendingShape>,
    next_client_op: u64,
    stroke_open: bool,
    outgoing: Vec<ClientMessage>,
}

impl<S: Surface> SessionController<S> {
    pub fn new(
        session_id: impl Into<String>,
        participant_id: impl Into<String>,
        surface: S,
        config: ClientConfig,
    ) -> Self {
        let reorder = ReorderBuffer::new(config.reorder_window, config.gap_timeout);
        Self {
            session_id: session_id.into(),
            participant_id: participant_id.into(),
            config,
            state: LifecycleState::Inactive,
            connected: false,
            clear_epoch: 0,
            view: surface.clone(),
            baseline: surface,
            history: History::default(),
            history_seeded: false,
            reorder,
            preload: Vec::new(),
            unconfirmed: Vec::new(),
            pending_shapes: Vec::new(),
            next_client_op: 1,
            stroke_open: false,
            outgoing: Vec::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Closed sessions accept no input.
    pub fn is_read_only(&self) -> bool {
        self.state == LifecycleState::Closed
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn clear_epoch(&self) -> u64 {
        self.clear_epoch
    }

    /// What the participant sees.
    pub fn view(&self) -> &S {
        &self.view
    }

    /// Snapshot plus accepted operations only.
    pub fn baseline(&self) -> &S {
        &self.baseline
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    /// Shapes still waiting for acknowledgement.
    pub fn pending_shapes(&self) -> usize {
        self.pending_shapes.len()
    }

    // --- Lifecycle ---

    /// Own echoes are recognized by participant id, so it must be set.
    pub fn check_participant(&self) -> SessionResult<()> {
        if self.participant_id.trim().is_empty() {
            return Err(SessionError::MissingParticipant);
        }
        Ok(())
    }

    /// Open the whiteboard: request the snapshot and subscribe.
    pub fn open(&mut self) -> SessionResult<()> {
        self.check_participant()?;
        match self.state {
            LifecycleState::Closed => Err(SessionError::Closed),
            LifecycleState::Inactive => {
                self.state = LifecycleState::Loading;
                self.request_snapshot();
                Ok(())
            }
            LifecycleState::Loading | LifecycleState::Live => Ok(()),
        }
    }

    /// Close the session. Pending publishes are discarded; accepted
    /// operations stay accepted.
    pub fn close(&mut self) -> Vec<SessionEvent> {
        if self.state == LifecycleState::Closed {
            return Vec::new();
        }
        let was_open = self.state != LifecycleState::Inactive;
        self.state = LifecycleState::Closed;
        self.pending_shapes.clear();
        self.unconfirmed.clear();
        self.preload.clear();
        self.stroke_open = false;
        self.outgoing
            .retain(|msg| !matches!(msg, ClientMessage::Publish { .. } | ClientMessage::SnapshotRequest { .. }));
        if was_open && self.connected {
            self.outgoing.push(ClientMessage::Leave {
                session_id: self.session_id.clone(),
            });
        }
        log::info!("Session {} closed for {}", self.session_id, self.participant_id);
        vec![SessionEvent::Closed]
    }

    /// Transport came up.
    pub fn on_connected(&mut self) -> Vec<SessionEvent> {
        self.connected = true;
        if self.state == LifecycleState::Loading {
            self.request_snapshot();
        }
        vec![SessionEvent::Connected]
    }

    /// Transport went away. Remote updates freeze until a fresh snapshot.
    pub fn on_disconnected(&mut self) -> Vec<SessionEvent> {
        self.connected = false;
        self.outgoing.clear();
        if self.state == LifecycleState::Live {
            self.state = LifecycleState::Loading;
        }
        self.preload.clear();
        vec![SessionEvent::Disconnected]
    }

    fn request_snapshot(&mut self) {
        if !self.connected {
            return;
        }
        let already_queued = self
            .outgoing
            .iter()
            .any(|msg| matches!(msg, ClientMessage::SnapshotRequest { .. }));
        if !already_queued {
            self.outgoing.push(ClientMessage::SnapshotRequest {
                session_id: self.session_id.clone(),
                participant_id: self.participant_id.clone(),
            });
        }
    }

    fn resync(&mut self, events: &mut Vec<SessionEvent>) {
        log::warn!("Session {} lost continuity, requesting snapshot", self.session_id);
        self.state = LifecycleState::Loading;
        self.preload.clear();
        self.request_snapshot();
        events.push(SessionEvent::Resyncing);
    }

    fn ensure_live(&self) -> SessionResult<()> {
        match self.state {
            LifecycleState::Live => Ok(()),
            LifecycleState::Closed => Err(SessionError::Closed),
            LifecycleState::Loading if !self.connected => Err(SessionError::TransportDisconnected),
            _ => Err(SessionError::NotLive),
        }
    }

    // --- Local input ---

    /// Draw and publish an operation.
    ///
    /// Free-hand segments are fire-and-forget. Shapes wait for an
    /// acknowledgement and are committed to history right away. Returns the
    /// client operation id.
    pub fn draw(&mut self, op: StrokeOp, now: Instant) -> SessionResult<u64> {
        self.ensure_live()?;

        let client_op_id = self.next_client_op;
        self.next_client_op += 1;
        let op = op.addressed(
            self.session_id.clone(),
            self.participant_id.clone(),
            self.clear_epoch,
            client_op_id,
        );

        self.view.apply(&op);
        self.outgoing.push(ClientMessage::Publish {
            session_id: self.session_id.clone(),
            op: op.clone().into(),
        });

        let is_shape = op.tool().is_shape();
        self.unconfirmed.push(Unconfirmed { op, acked: None });
        if is_shape {
            self.pending_shapes.push(PendingShape {
                client_op_id,
                deadline: now + self.config.publish_timeout,
            });
            self.commit()?;
        } else {
            self.stroke_open = true;
        }
        Ok(client_op_id)
    }

    /// Finish a free-hand stroke, committing it to history.
    pub fn end_stroke(&mut self) -> SessionResult<()> {
        if !self.stroke_open {
            return Ok(());
        }
        self.stroke_open = false;
        self.commit()
    }

    fn commit(&mut self) -> SessionResult<()> {
        let snapshot = self.view.snapshot()?;
        self.history.commit(snapshot);
        self.outgoing.push(ClientMessage::Persist {
            session_id: self.session_id.clone(),
        });
        Ok(())
    }

    /// Ask the store to clear the board. The local canvas clears when the
    /// store's clear comes back.
    pub fn clear(&mut self) -> SessionResult<()> {
        self.ensure_live()?;
        self.outgoing.push(ClientMessage::Clear {
            session_id: self.session_id.clone(),
            clear_epoch: self.clear_epoch,
        });
        Ok(())
    }

    /// Step the local view back. Returns false at the start of history.
    pub fn undo(&mut self) -> SessionResult<bool> {
        if self.is_read_only() {
            return Err(SessionError::Closed);
        }
        match self.history.undo() {
            Some(snapshot) => {
                self.view.restore(snapshot)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Step the local view forward. Returns false at the end of history.
    pub fn redo(&mut self) -> SessionResult<bool> {
        if self.is_read_only() {
            return Err(SessionError::Closed);
        }
        match self.history.redo() {
            Some(snapshot) => {
                self.view.restore(snapshot)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // --- Incoming ---

    /// Handle a message from the store.
    pub fn handle_message(&mut self, msg: ServerMessage, now: Instant) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        if self.state == LifecycleState::Closed {
            return events;
        }
        if let ServerMessage::Error { message } = msg {
            events.push(SessionEvent::Warning { message });
            return events;
        }
        if msg.session_id() != Some(self.session_id.as_str()) {
            log::debug!("Ignoring message for another session");
            return events;
        }

        match msg {
            ServerMessage::SnapshotResponse {
                snapshot,
                sequence_number,
                clear_epoch,
                ..
            } => self.on_snapshot(&snapshot, sequence_number, clear_epoch, now, &mut events),
            ServerMessage::Broadcast { op, .. } => self.on_broadcast(op, now, &mut events),
            ServerMessage::Ack {
                client_op_id,
                sequence_number,
                ..
            } => {
                if let Some(mine) = self.unconfirmed.iter_mut().find(|u| u.op.client_op_id() == client_op_id) {
                    mine.acked = Some(sequence_number);
                }
                let before = self.pending_shapes.len();
                self.pending_shapes.retain(|p| p.client_op_id != client_op_id);
                if self.pending_shapes.len() != before {
                    events.push(SessionEvent::ShapeAcknowledged {
                        client_op_id,
                        sequence_number,
                    });
                }
            }
            ServerMessage::Reject {
                client_op_id,
                reason,
                message,
                ..
            } => {
                let error = match reason {
                    RejectReason::Validation => SessionError::Rejected(message),
                    RejectReason::SessionNotFound => SessionError::SessionNotFound(self.session_id.clone()),
                };
                self.revert(client_op_id, error, &mut events);
                if reason == RejectReason::SessionNotFound {
                    self.resync(&mut events);
                }
            }
            ServerMessage::Clear { clear_epoch, .. } => self.on_clear(clear_epoch, &mut events),
            ServerMessage::ParticipantJoined { participant_id, .. } => {
                events.push(SessionEvent::ParticipantJoined { participant_id });
            }
            ServerMessage::ParticipantLeft { participant_id, .. } => {
                events.push(SessionEvent::ParticipantLeft { participant_id });
            }
            ServerMessage::SessionClosed { .. } => events.extend(self.close()),
            ServerMessage::Warning { message, .. } => events.push(SessionEvent::Warning { message }),
            ServerMessage::Error { .. } => {}
        }
        events
    }

    fn on_snapshot(
        &mut self,
        snapshot: &SnapshotData,
        sequence_number: Option<u64>,
        clear_epoch: u64,
        now: Instant,
        events: &mut Vec<SessionEvent>,
    ) {
        if let Err(e) = self.baseline.restore(snapshot) {
            log::error!("Failed to restore snapshot for {}: {}", self.session_id, e);
            events.push(SessionEvent::Warning {
                message: format!("Unreadable snapshot: {}", e),
            });
            return;
        }

        self.clear_epoch = clear_epoch;
        self.reorder.reset(sequence_number.map_or(0, |seq| seq + 1));
        // Segments are either in the snapshot already or lost for good, and
        // so is anything acknowledged at or below the snapshot cursor
        self.unconfirmed.retain(|u| {
            u.op.tool().is_shape()
                && u.op.clear_epoch() == clear_epoch
                && u.acked.is_none_or(|seq| sequence_number.is_none_or(|cursor| seq > cursor))
        });
        self.pending_shapes
            .retain(|p| self.unconfirmed.iter().any(|u| u.op.client_op_id() == p.client_op_id));
        self.rebuild_view();

        self.state = LifecycleState::Live;
        events.push(SessionEvent::Live { sequence_number });

        for op in std::mem::take(&mut self.preload) {
            if self.state != LifecycleState::Live {
                break;
            }
            self.on_broadcast(op, now, events);
        }

        if !self.history_seeded {
            match self.view.snapshot() {
                Ok(initial) => {
                    self.history.reset(initial);
                    self.history_seeded = true;
                }
                Err(e) => log::warn!("Could not seed history: {}", e),
            }
        }
    }

    fn on_broadcast(&mut self, op: StrokeOp, now: Instant, events: &mut Vec<SessionEvent>) {
        match self.state {
            LifecycleState::Loading => {
                self.preload.push(op);
                return;
            }
            LifecycleState::Live => {}
            _ => return,
        }
        if op.clear_epoch() != self.clear_epoch {
            log::debug!(
                "Dropping operation from epoch {} (current {})",
                op.clear_epoch(),
                self.clear_epoch
            );
            return;
        }

        match self.reorder.push(op, now) {
            ReorderOutcome::Ready(ops) => {
                for op in ops {
                    self.apply_accepted(op, events);
                }
            }
            ReorderOutcome::Gap { expected } => {
                log::warn!("Gap at sequence {} in session {}", expected, self.session_id);
                self.resync(events);
            }
        }
    }

    fn apply_accepted(&mut self, op: StrokeOp, events: &mut Vec<SessionEvent>) {
        let Some(sequence_number) = op.sequence_number() else {
            return;
        };
        self.baseline.apply(&op);

        let own = self
            .unconfirmed
            .iter()
            .position(|mine| op.is_own(&self.participant_id, mine.op.client_op_id()));
        match own {
            Some(index) => {
                self.unconfirmed.remove(index);
                events.push(SessionEvent::Confirmed {
                    client_op_id: op.client_op_id(),
                    sequence_number,
                });
            }
            None => {
                self.view.apply(&op);
                events.push(SessionEvent::Applied { sequence_number });
            }
        }
    }

    fn on_clear(&mut self, clear_epoch: u64, events: &mut Vec<SessionEvent>) {
        if clear_epoch <= self.clear_epoch {
            return;
        }
        let op_epoch = std::mem::replace(&mut self.clear_epoch, clear_epoch);
        for pending in self.pending_shapes.drain(..) {
            events.push(SessionEvent::ShapeReverted {
                client_op_id: pending.client_op_id,
                error: SessionError::StaleEpoch {
                    op_epoch,
                    current: clear_epoch,
                },
            });
        }
        self.baseline.clear();
        self.view.clear();
        self.unconfirmed.clear();
        self.stroke_open = false;
        self.reorder.reset(0);
        self.preload.retain(|op| op.clear_epoch() == clear_epoch);

        match self.view.snapshot() {
            Ok(blank) => self.history.reset(blank),
            Err(e) => log::warn!("Could not reset history after clear: {}", e),
        }
        events.push(SessionEvent::Cleared { clear_epoch });
    }

    fn revert(&mut self, client_op_id: u64, error: SessionError, events: &mut Vec<SessionEvent>) {
        self.pending_shapes.retain(|p| p.client_op_id != client_op_id);
        let before = self.unconfirmed.len();
        self.unconfirmed.retain(|u| u.op.client_op_id() != client_op_id);
        if self.unconfirmed.len() != before {
            self.rebuild_view();
        }
        events.push(SessionEvent::ShapeReverted { client_op_id, error });
    }

    fn rebuild_view(&mut self) {
        self.view = self.baseline.clone();
        for mine in &self.unconfirmed {
            self.view.apply(&mine.op);
        }
    }

    /// Expire shape acknowledgements and detect stalled gaps.
    pub fn tick(&mut self, now: Instant) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        if self.state == LifecycleState::Closed {
            return events;
        }

        let expired: Vec<u64> = self
            .pending_shapes
            .iter()
            .filter(|p| now >= p.deadline)
            .map(|p| p.client_op_id)
            .collect();
        for client_op_id in expired {
            log::warn!("Shape {} was not acknowledged in time", client_op_id);
            self.revert(client_op_id, SessionError::PublishTimeout { client_op_id }, &mut events);
        }

        if self.state == LifecycleState::Live && self.reorder.gap_expired(now) {
            self.resync(&mut events);
        }
        events
    }

    /// Take pending outgoing messages (drains the queue).
    pub fn take_outgoing(&mut self) -> Vec<ClientMessage> {
        std::mem::take(&mut self.outgoing)
    }

    /// Check if there are pending outgoing messages.
    pub fn has_outgoing(&self) -> bool {
        !self.outgoing.is_empty()
    }
}
