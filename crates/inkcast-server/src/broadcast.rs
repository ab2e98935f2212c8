//! Per-session fan-out.
//!
//! Each session owns one tokio broadcast channel. Every subscriber gets an
//! independent receiver buffering up to `capacity` messages; a subscriber that
//! falls further behind lags instead of blocking the others.

use inkcast_core::ServerMessage;
use std::sync::Arc;
use tokio::sync::broadcast;

/// A message as fanned out to subscribers.
pub type Fanout = Arc<ServerMessage>;

/// Channel statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub messages_sent: u64,
    pub subscribers: usize,
}

/// Broadcast channel for one session.
pub struct SessionChannel {
    sender: broadcast::Sender<Fanout>,
    capacity: usize,
    messages_sent: u64,
}

impl SessionChannel {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            capacity,
            messages_sent: 0,
        }
    }

    /// Add a subscriber. It sees every message sent after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Fanout> {
        self.sender.subscribe()
    }

    /// Send to every current subscriber. Returns how many there were.
    pub fn send(&mut self, msg: ServerMessage) -> usize {
        self.messages_sent += 1;
        // No subscribers is not an error
        self.sender.send(Arc::new(msg)).unwrap_or(0)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            messages_sent: self.messages_sent,
            subscribers: self.sender.receiver_count(),
        }
    }
}
