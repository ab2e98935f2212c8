//! Auto-save bookkeeping for session persistence.
//!
//! Tracks whether a session has changes that have not reached durable
//! storage yet, and whether enough time has passed to write them.

use std::time::{Duration, Instant};

/// Default auto-save interval in seconds.
pub const DEFAULT_AUTOSAVE_INTERVAL_SECS: u64 = 30;

/// Dirty flag plus save interval for one session.
#[derive(Debug, Clone)]
pub struct AutoSave {
    /// Auto-save interval.
    interval: Duration,
    /// Last successful save.
    last_save: Option<Instant>,
    /// Whether there are unsaved changes.
    dirty: bool,
    /// Whether the last save attempt failed.
    degraded: bool,
}

impl AutoSave {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_save: None,
            dirty: false,
            degraded: false,
        }
    }

    /// Set the auto-save interval.
    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Mark the session as having unsaved changes.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Record a successful write.
    pub fn mark_saved(&mut self, now: Instant) {
        self.last_save = Some(now);
        self.dirty = false;
        self.degraded = false;
    }

    /// Record a failed write. The session stays dirty.
    pub fn mark_failed(&mut self) {
        self.degraded = true;
    }

    /// Whether the last write failed and the session lives only in memory.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Check if a save is due.
    pub fn should_save(&self, now: Instant) -> bool {
        if !self.dirty {
            return false;
        }

        match self.last_save {
            Some(last) => now.saturating_duration_since(last) >= self.interval,
            None => true,
        }
    }
}

impl Default for AutoSave {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_AUTOSAVE_INTERVAL_SECS))
    }
}
