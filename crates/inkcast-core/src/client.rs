//! Drives a [`SessionController`] over a [`NativeTransport`].

use crate::canvas::Surface;
use crate::session::{ClientConfig, SessionController, SessionEvent, SessionResult};
use crate::sync::{ConnectionState, NativeTransport, TransportEvent};
use std::time::Instant;

/// A whiteboard session connected to a session store.
///
/// Call [`ClientSession::pump`] regularly (for example once per frame) to
/// exchange messages and advance timers.
pub struct ClientSession<S: Surface> {
    url: String,
    transport: NativeTransport,
    controller: SessionController<S>,
}

impl<S: Surface> ClientSession<S> {
    pub fn new(
        url: impl Into<String>,
        session_id: impl Into<String>,
        participant_id: impl Into<String>,
        surface: S,
        config: ClientConfig,
    ) -> Self {
        Self {
            url: url.into(),
            transport: NativeTransport::new(),
            controller: SessionController::new(session_id, participant_id, surface, config),
        }
    }

    /// Connect and open the whiteboard.
    pub fn connect(&mut self) -> SessionResult<()> {
        self.controller.check_participant()?;
        self.transport.connect(&self.url)?;
        self.controller.open()
    }

    /// Drop the current connection and dial again.
    pub fn reconnect(&mut self) -> SessionResult<()> {
        log::info!("Reconnecting to {}", self.url);
        self.transport.disconnect();
        self.controller.on_disconnected();
        self.transport.connect(&self.url)?;
        Ok(())
    }

    /// Exchange pending messages and advance timers.
    pub fn pump(&mut self, now: Instant) -> Vec<SessionEvent> {
        let mut events = Vec::new();

        for event in self.transport.poll_events() {
            match event {
                TransportEvent::Connected => events.extend(self.controller.on_connected()),
                TransportEvent::Disconnected => events.extend(self.controller.on_disconnected()),
                TransportEvent::Error { message } => {
                    log::warn!("Transport error: {}", message);
                    // Release the dead connection so reconnect can dial again
                    self.transport.disconnect();
                    events.push(SessionEvent::Warning { message });
                    events.extend(self.controller.on_disconnected());
                }
                TransportEvent::Message(msg) => events.extend(self.controller.handle_message(msg, now)),
            }
        }

        events.extend(self.controller.tick(now));
        self.flush();
        events
    }

    fn flush(&mut self) {
        if !self.controller.is_connected() {
            return;
        }
        for msg in self.controller.take_outgoing() {
            if let Err(e) = self.transport.send(&msg) {
                log::warn!("Failed to send message: {}", e);
            }
        }
    }

    /// Close the session and the connection.
    pub fn close(&mut self) -> Vec<SessionEvent> {
        let events = self.controller.close();
        self.flush();
        self.transport.disconnect();
        events
    }

    pub fn controller(&self) -> &SessionController<S> {
        &self.controller
    }

    pub fn controller_mut(&mut self) -> &mut SessionController<S> {
        &mut self.controller
    }

    pub fn transport_state(&self) -> ConnectionState {
        self.transport.state()
    }
}
