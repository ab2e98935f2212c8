//! Authoritative session state.
//!
//! ```text
//! publish ──► accept ──► stamp seq ──► log ──► canvas ──► SessionChannel ──► subscribers
//!                │                                            ▲
//!                └── per-session Mutex ───────────────────────┘
//! ```
//!
//! Every mutation of a session happens under its own `tokio::sync::Mutex`,
//! and fan-out happens before that lock is released, so the channel carries
//! operations in sequence order. Different sessions never contend.

use crate::broadcast::{ChannelStats, Fanout, SessionChannel};
use crate::config::ServerConfig;
use crate::error::{StoreError, StoreResult};
use crate::presence::Roster;
use dashmap::{DashMap, DashSet};
use inkcast_core::storage::AutoSave;
use inkcast_core::{
    ServerMessage, SessionRecord, SnapshotData, Storage, StorageError, StrokeDraft, StrokeOp, Surface,
};
use inkcast_render::RasterSurface;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, OwnedMutexGuard, broadcast};
use tracing::{debug, info, warn};

/// Snapshot handed to a joiner.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub data: SnapshotData,
    /// Last operation contained in `data`.
    pub sequence_number: Option<u64>,
    pub clear_epoch: u64,
}

impl SessionSnapshot {
    pub fn into_message(self, session_id: impl Into<String>) -> ServerMessage {
        ServerMessage::SnapshotResponse {
            session_id: session_id.into(),
            snapshot: self.data,
            sequence_number: self.sequence_number,
            clear_epoch: self.clear_epoch,
        }
    }
}

/// A new subscription plus the snapshot it starts from.
pub struct Joined {
    pub receiver: broadcast::Receiver<Fanout>,
    pub snapshot: SessionSnapshot,
}

/// In-memory state of one open session.
pub struct SessionState {
    session_id: String,
    clear_epoch: u64,
    next_sequence: u64,
    /// Accepted operations of the current epoch.
    log: Vec<StrokeOp>,
    canvas: RasterSurface,
    channel: SessionChannel,
    roster: Roster,
    autosave: AutoSave,
    /// Set once the session has left the map; waiters must look it up again.
    released: bool,
}

impl SessionState {
    fn blank(session_id: &str, config: &ServerConfig) -> Self {
        Self {
            session_id: session_id.to_string(),
            clear_epoch: 0,
            next_sequence: 0,
            log: Vec::new(),
            canvas: RasterSurface::new(config.canvas_width, config.canvas_height),
            channel: SessionChannel::new(config.broadcast_capacity),
            roster: Roster::new(),
            autosave: AutoSave::new(config.persist_interval),
            released: false,
        }
    }

    fn from_record(record: SessionRecord, config: &ServerConfig) -> StoreResult<Self> {
        let mut state = Self::blank(&record.session_id, config);
        state.canvas.restore(&record.snapshot)?;
        for op in record.ops_after_snapshot() {
            state.canvas.apply(op);
        }

        let logged_next = record
            .log
            .last()
            .and_then(StrokeOp::sequence_number)
            .map_or(0, |seq| seq + 1);
        state.clear_epoch = record.clear_epoch;
        state.next_sequence = record.next_sequence.max(logged_next);
        state.log = record.log;
        Ok(state)
    }

    fn to_record(&self) -> StoreResult<SessionRecord> {
        Ok(SessionRecord {
            session_id: self.session_id.clone(),
            clear_epoch: self.clear_epoch,
            next_sequence: self.next_sequence,
            log: self.log.clone(),
            snapshot: self.snapshot_data()?,
            snapshot_sequence: self.last_sequence(),
        })
    }

    fn last_sequence(&self) -> Option<u64> {
        self.next_sequence.checked_sub(1)
    }

    fn snapshot_data(&self) -> StoreResult<SnapshotData> {
        if self.next_sequence == 0 {
            return Ok(SnapshotData::empty());
        }
        Ok(self.canvas.snapshot()?)
    }

    fn snapshot(&self) -> StoreResult<SessionSnapshot> {
        Ok(SessionSnapshot {
            data: self.snapshot_data()?,
            sequence_number: self.last_sequence(),
            clear_epoch: self.clear_epoch,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn clear_epoch(&self) -> u64 {
        self.clear_epoch
    }

    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    pub fn log(&self) -> &[StrokeOp] {
        &self.log
    }

    pub fn canvas(&self) -> &RasterSurface {
        &self.canvas
    }

    pub fn participants(&self) -> usize {
        self.roster.len()
    }

    pub fn channel_stats(&self) -> ChannelStats {
        self.channel.stats()
    }

    pub fn is_dirty(&self) -> bool {
        self.autosave.is_dirty()
    }

    /// Whether the last write to storage failed.
    pub fn is_degraded(&self) -> bool {
        self.autosave.is_degraded()
    }
}

/// All open sessions.
pub struct SessionStore {
    sessions: DashMap<String, Arc<Mutex<SessionState>>>,
    /// Permanently deleted sessions. They are never opened again.
    deleted: DashSet<String>,
    storage: Arc<dyn Storage>,
    config: ServerConfig,
}

impl SessionStore {
    pub fn new(storage: Arc<dyn Storage>, config: ServerConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            deleted: DashSet::new(),
            storage,
            config,
        }
    }

    /// Number of sessions held in memory.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    /// Lock an open session.
    async fn lock(&self, session_id: &str) -> StoreResult<OwnedMutexGuard<SessionState>> {
        let entry = self
            .sessions
            .get(session_id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))?;
        let state = entry.lock_owned().await;
        if state.released {
            return Err(StoreError::SessionNotFound(session_id.to_string()));
        }
        Ok(state)
    }

    /// Lock a session, opening it first if needed.
    async fn lock_or_open(&self, session_id: &str) -> StoreResult<OwnedMutexGuard<SessionState>> {
        loop {
            if self.deleted.contains(session_id) {
                return Err(StoreError::SessionNotFound(session_id.to_string()));
            }
            let existing = self.sessions.get(session_id).map(|e| Arc::clone(e.value()));
            let entry = match existing {
                Some(entry) => entry,
                None => {
                    let state = match self.load(session_id).await? {
                        Some(state) => state,
                        None => SessionState::blank(session_id, &self.config),
                    };
                    // Someone else may have opened it while we were loading
                    Arc::clone(
                        self.sessions
                            .entry(session_id.to_string())
                            .or_insert_with(|| Arc::new(Mutex::new(state)))
                            .value(),
                    )
                }
            };

            let mut state = Arc::clone(&entry).lock_owned().await;
            if self.deleted.contains(session_id) {
                // Loaded while a delete was in flight
                state.released = true;
                self.sessions.remove_if(session_id, |_, e| Arc::ptr_eq(e, &entry));
                return Err(StoreError::SessionNotFound(session_id.to_string()));
            }
            if !state.released {
                return Ok(state);
            }
        }
    }

    /// Open a session, restoring it from storage if a record exists.
    pub async fn open(&self, session_id: &str) -> StoreResult<()> {
        self.lock_or_open(session_id).await.map(|_| ())
    }

    /// Read a session record from storage.
    pub async fn load(&self, session_id: &str) -> StoreResult<Option<SessionState>> {
        match self.storage.load(session_id).await {
            Ok(record) => {
                let state = SessionState::from_record(record, &self.config)?;
                info!(
                    "Loaded session {} (epoch {}, {} operations)",
                    session_id,
                    state.clear_epoch,
                    state.log.len()
                );
                Ok(Some(state))
            }
            Err(StorageError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Subscribe a participant and take the snapshot under the same lock, so
    /// no accepted operation falls between the two.
    pub async fn join(&self, session_id: &str, participant_id: &str) -> StoreResult<Joined> {
        let mut state = self.lock_or_open(session_id).await?;
        let snapshot = state.snapshot()?;

        if state.roster.join(participant_id) {
            state.channel.send(ServerMessage::ParticipantJoined {
                session_id: session_id.to_string(),
                participant_id: participant_id.to_string(),
            });
            info!("{} joined session {}", participant_id, session_id);
        }
        let receiver = state.channel.subscribe();

        Ok(Joined { receiver, snapshot })
    }

    /// Stamp, append, materialize and fan out an operation.
    pub async fn accept(&self, session_id: &str, author_id: &str, draft: StrokeDraft) -> StoreResult<StrokeOp> {
        let mut state = self.lock(session_id).await?;
        let submitted = StrokeOp::try_from(draft)?;

        if submitted.clear_epoch() != state.clear_epoch {
            return Err(StoreError::StaleEpoch {
                op_epoch: submitted.clear_epoch(),
                current: state.clear_epoch,
            });
        }

        let sequence_number = state.next_sequence;
        let op = StrokeOp::new(
            submitted.tool(),
            submitted.color(),
            submitted.stroke_width(),
            submitted.origin(),
            submitted.endpoint(),
        )?
        .addressed(session_id, author_id, state.clear_epoch, submitted.client_op_id())
        .stamped(sequence_number);

        state.next_sequence += 1;
        state.canvas.apply(&op);
        state.log.push(op.clone());
        state.autosave.mark_dirty();
        state.channel.send(ServerMessage::Broadcast {
            session_id: session_id.to_string(),
            op: op.clone(),
        });

        Ok(op)
    }

    /// Current snapshot of an open session.
    pub async fn snapshot(&self, session_id: &str) -> StoreResult<SessionSnapshot> {
        self.lock(session_id).await?.snapshot()
    }

    /// Reset the whiteboard. Returns the new epoch, or `None` if the request
    /// named an epoch that was already superseded.
    pub async fn clear(&self, session_id: &str, clear_epoch: u64) -> StoreResult<Option<u64>> {
        let mut state = self.lock(session_id).await?;
        if clear_epoch != state.clear_epoch {
            debug!(
                "Ignoring clear of epoch {} in session {} (current {})",
                clear_epoch, session_id, state.clear_epoch
            );
            return Ok(None);
        }

        state.clear_epoch += 1;
        state.next_sequence = 0;
        state.log.clear();
        state.canvas.clear();
        state.autosave.mark_dirty();

        let new_epoch = state.clear_epoch;
        state.channel.send(ServerMessage::Clear {
            session_id: session_id.to_string(),
            clear_epoch: new_epoch,
        });
        info!("Cleared session {} (epoch {})", session_id, new_epoch);
        Ok(Some(new_epoch))
    }

    /// Write a session to storage if it has unsaved changes. Returns whether
    /// anything was written.
    pub async fn persist(&self, session_id: &str) -> StoreResult<bool> {
        let mut state = self.lock(session_id).await?;
        self.persist_locked(&mut state).await
    }

    async fn persist_locked(&self, state: &mut SessionState) -> StoreResult<bool> {
        if !state.autosave.is_dirty() {
            return Ok(false);
        }

        let record = state.to_record()?;
        match self.storage.save(&state.session_id, &record).await {
            Ok(()) => {
                if state.autosave.is_degraded() {
                    info!("Session {} is being saved again", state.session_id);
                }
                state.autosave.mark_saved(Instant::now());
                debug!("Persisted session {} at sequence {:?}", state.session_id, record.snapshot_sequence);
                Ok(true)
            }
            Err(e) => {
                warn!("Failed to persist session {}: {}", state.session_id, e);
                if !state.autosave.is_degraded() {
                    state.channel.send(ServerMessage::Warning {
                        session_id: state.session_id.clone(),
                        message: format!("Whiteboard changes are not being saved: {}", e),
                    });
                }
                state.autosave.mark_failed();
                Err(e.into())
            }
        }
    }

    /// Persist every session whose autosave interval has elapsed.
    pub async fn persist_due(&self, now: Instant) -> usize {
        self.flush(Some(now)).await
    }

    /// Persist every dirty session.
    pub async fn persist_all(&self) -> usize {
        self.flush(None).await
    }

    async fn flush(&self, due_at: Option<Instant>) -> usize {
        let entries: Vec<_> = self
            .sessions
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();

        let mut saved = 0;
        for entry in entries {
            let mut state = entry.lock().await;
            if state.released {
                continue;
            }
            if let Some(now) = due_at {
                if !state.autosave.should_save(now) {
                    continue;
                }
            }
            if let Ok(true) = self.persist_locked(&mut state).await {
                saved += 1;
            }
        }
        saved
    }

    /// Remove a participant. Returns true if the session was released.
    pub async fn leave(&self, session_id: &str, participant_id: &str) -> StoreResult<bool> {
        let mut state = self.lock(session_id).await?;
        if state.roster.leave(participant_id) {
            state.channel.send(ServerMessage::ParticipantLeft {
                session_id: session_id.to_string(),
                participant_id: participant_id.to_string(),
            });
            info!("{} left session {}", participant_id, session_id);
        }

        if state.roster.is_empty() {
            return self.release_locked(session_id, state).await;
        }
        Ok(false)
    }

    /// Drop an empty session from memory once it is safely persisted.
    /// Returns false if participants remain or the write failed.
    pub async fn release(&self, session_id: &str) -> StoreResult<bool> {
        let state = self.lock(session_id).await?;
        if !state.roster.is_empty() {
            return Ok(false);
        }
        self.release_locked(session_id, state).await
    }

    async fn release_locked(&self, session_id: &str, mut state: OwnedMutexGuard<SessionState>) -> StoreResult<bool> {
        if let Err(e) = self.persist_locked(&mut state).await {
            warn!("Keeping session {} in memory: {}", session_id, e);
            return Ok(false);
        }
        state.released = true;
        self.sessions.remove(session_id);
        info!("Released session {}", session_id);
        Ok(true)
    }

    /// Permanently delete a session and its record. The id is refused from
    /// then on.
    pub async fn delete(&self, session_id: &str) -> StoreResult<()> {
        self.deleted.insert(session_id.to_string());

        // Hold the session until the record is gone
        let entry = self.sessions.get(session_id).map(|e| Arc::clone(e.value()));
        let held = match entry {
            Some(entry) => {
                let mut state = entry.lock_owned().await;
                state.released = true;
                state.channel.send(ServerMessage::SessionClosed {
                    session_id: session_id.to_string(),
                });
                Some(state)
            }
            None => None,
        };
        self.sessions.remove(session_id);

        match self.storage.delete(session_id).await {
            Ok(()) | Err(StorageError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        drop(held);
        info!("Deleted session {}", session_id);
        Ok(())
    }

    /// Run a closure against an open session.
    pub async fn inspect<R>(&self, session_id: &str, f: impl FnOnce(&SessionState) -> R) -> StoreResult<R> {
        let state = self.lock(session_id).await?;
        Ok(f(&state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inkcast_core::storage::{BoxFuture, StorageResult};
    use inkcast_core::{MemoryStorage, Rgb, Tool};
    use kurbo::Point;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn config() -> ServerConfig {
        ServerConfig {
            canvas_width: 64,
            canvas_height: 64,
            broadcast_capacity: 16,
            ..ServerConfig::default()
        }
    }

    fn store_with(storage: Arc<dyn Storage>) -> SessionStore {
        SessionStore::new(storage, config())
    }

    fn segment(x: f64, client_op_id: u64, clear_epoch: u64) -> StrokeDraft {
        let op = StrokeOp::new(Tool::Pen, Rgb::black(), 2.0, Point::new(x, 10.0), Point::new(x + 10.0, 10.0))
            .unwrap()
            .addressed("s1", "", clear_epoch, client_op_id);
        StrokeDraft::from(op)
    }

    /// Storage whose writes can be switched off.
    #[derive(Default)]
    struct FlakyStorage {
        inner: MemoryStorage,
        failing: AtomicBool,
    }

    impl Storage for FlakyStorage {
        fn save<'a>(&'a self, id: &str, record: &SessionRecord) -> BoxFuture<'a, StorageResult<()>> {
            if self.failing.load(Ordering::SeqCst) {
                return Box::pin(async { Err(StorageError::Io("disk full".to_string())) });
            }
            self.inner.save(id, record)
        }
        fn load<'a>(&'a self, id: &str) -> BoxFuture<'a, StorageResult<SessionRecord>> {
            self.inner.load(id)
        }
        fn delete<'a>(&'a self, id: &str) -> BoxFuture<'a, StorageResult<()>> {
            self.inner.delete(id)
        }
        fn list(&self) -> BoxFuture<'_, StorageResult<Vec<String>>> {
            self.inner.list()
        }
        fn exists<'a>(&'a self, id: &str) -> BoxFuture<'a, StorageResult<bool>> {
            self.inner.exists(id)
        }
    }

    /// Storage whose deletes wait to be let through.
    #[derive(Default)]
    struct GatedDelete {
        inner: MemoryStorage,
        deleting: tokio::sync::Notify,
        proceed: tokio::sync::Notify,
    }

    impl Storage for GatedDelete {
        fn save<'a>(&'a self, id: &str, record: &SessionRecord) -> BoxFuture<'a, StorageResult<()>> {
            self.inner.save(id, record)
        }
        fn load<'a>(&'a self, id: &str) -> BoxFuture<'a, StorageResult<SessionRecord>> {
            self.inner.load(id)
        }
        fn delete<'a>(&'a self, id: &str) -> BoxFuture<'a, StorageResult<()>> {
            let id = id.to_string();
            Box::pin(async move {
                self.deleting.notify_one();
                self.proceed.notified().await;
                self.inner.delete(&id).await
            })
        }
        fn list(&self) -> BoxFuture<'_, StorageResult<Vec<String>>> {
            self.inner.list()
        }
        fn exists<'a>(&'a self, id: &str) -> BoxFuture<'a, StorageResult<bool>> {
            self.inner.exists(id)
        }
    }

    async fn next(rx: &mut broadcast::Receiver<Fanout>) -> ServerMessage {
        (*rx.recv().await.unwrap()).clone()
    }

    #[tokio::test]
    async fn test_join_blank_session() {
        let store = store_with(Arc::new(MemoryStorage::new()));
        let joined = store.join("s1", "alice").await.unwrap();

        assert_eq!(
            joined.snapshot,
            SessionSnapshot {
                data: SnapshotData::empty(),
                sequence_number: None,
                clear_epoch: 0,
            }
        );
        assert!(store.contains("s1"));
        assert_eq!(store.inspect("s1", |s| s.participants()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_accept_stamps_in_order() {
        let store = store_with(Arc::new(MemoryStorage::new()));
        let mut joined = store.join("s1", "alice").await.unwrap();

        for i in 0..3 {
            let op = store.accept("s1", "alice", segment(i as f64, i + 1, 0)).await.unwrap();
            assert_eq!(op.sequence_number(), Some(i));
            assert_eq!(op.author_id(), "alice");
            assert_eq!(op.session_id(), "s1");
        }

        for i in 0..3 {
            match next(&mut joined.receiver).await {
                ServerMessage::Broadcast { op, .. } => assert_eq!(op.sequence_number(), Some(i)),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(store.snapshot("s1").await.unwrap().sequence_number, Some(2));
    }

    #[tokio::test]
    async fn test_author_cannot_be_spoofed() {
        let store = store_with(Arc::new(MemoryStorage::new()));
        store.join("s1", "alice").await.unwrap();

        let mut draft = segment(0.0, 1, 0);
        draft.author_id = "mallory".to_string();
        draft.sequence_number = Some(99);
        let op = store.accept("s1", "alice", draft).await.unwrap();
        assert_eq!(op.author_id(), "alice");
        assert_eq!(op.sequence_number(), Some(0));
    }

    #[tokio::test]
    async fn test_accept_errors() {
        let store = store_with(Arc::new(MemoryStorage::new()));
        let result = store.accept("nope", "alice", segment(0.0, 1, 0)).await;
        assert!(matches!(result, Err(StoreError::SessionNotFound(_))));

        store.join("s1", "alice").await.unwrap();
        let mut bad = segment(0.0, 1, 0);
        bad.tool = "laser".to_string();
        let result = store.accept("s1", "alice", bad).await;
        assert!(matches!(result, Err(StoreError::Validation(_))));

        let result = store.accept("s1", "alice", segment(0.0, 1, 3)).await;
        assert!(matches!(result, Err(StoreError::StaleEpoch { op_epoch: 3, current: 0 })));
        assert_eq!(store.inspect("s1", |s| s.next_sequence()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_snapshot_then_live_ops_without_gap() {
        let store = store_with(Arc::new(MemoryStorage::new()));
        store.join("s1", "alice").await.unwrap();
        store.accept("s1", "alice", segment(0.0, 1, 0)).await.unwrap();
        store.accept("s1", "alice", segment(5.0, 2, 0)).await.unwrap();

        let mut late = store.join("s1", "bob").await.unwrap();
        assert_eq!(late.snapshot.sequence_number, Some(1));
        assert!(!late.snapshot.data.is_empty());

        store.accept("s1", "alice", segment(9.0, 3, 0)).await.unwrap();
        match next(&mut late.receiver).await {
            ServerMessage::Broadcast { op, .. } => assert_eq!(op.sequence_number(), Some(2)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_clear_resets_and_ignores_stale_requests() {
        let store = store_with(Arc::new(MemoryStorage::new()));
        let mut joined = store.join("s1", "alice").await.unwrap();
        store.accept("s1", "alice", segment(0.0, 1, 0)).await.unwrap();

        assert_eq!(store.clear("s1", 0).await.unwrap(), Some(1));
        // A second clear naming the old epoch was already satisfied
        assert_eq!(store.clear("s1", 0).await.unwrap(), None);

        let snapshot = store.snapshot("s1").await.unwrap();
        assert_eq!(snapshot.clear_epoch, 1);
        assert_eq!(snapshot.sequence_number, None);
        assert!(snapshot.data.is_empty());

        // Sequence numbers restart with the epoch
        let op = store.accept("s1", "alice", segment(0.0, 2, 1)).await.unwrap();
        assert_eq!(op.sequence_number(), Some(0));

        assert!(matches!(next(&mut joined.receiver).await, ServerMessage::Broadcast { .. }));
        assert_eq!(
            next(&mut joined.receiver).await,
            ServerMessage::Clear {
                session_id: "s1".to_string(),
                clear_epoch: 1
            }
        );
    }

    #[tokio::test]
    async fn test_presence_events() {
        let store = store_with(Arc::new(MemoryStorage::new()));
        let mut alice = store.join("s1", "alice").await.unwrap();
        store.join("s1", "bob").await.unwrap();
        store.leave("s1", "bob").await.unwrap();

        assert_eq!(
            next(&mut alice.receiver).await,
            ServerMessage::ParticipantJoined {
                session_id: "s1".to_string(),
                participant_id: "bob".to_string()
            }
        );
        assert_eq!(
            next(&mut alice.receiver).await,
            ServerMessage::ParticipantLeft {
                session_id: "s1".to_string(),
                participant_id: "bob".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_release_persists_and_reload_replays() {
        let storage = Arc::new(MemoryStorage::new());
        let store = store_with(storage.clone());
        store.join("s1", "alice").await.unwrap();
        store.accept("s1", "alice", segment(0.0, 1, 0)).await.unwrap();
        store.accept("s1", "alice", segment(20.0, 2, 0)).await.unwrap();
        let canvas = store.inspect("s1", |s| s.canvas().clone()).await.unwrap();

        assert!(store.leave("s1", "alice").await.unwrap());
        assert!(!store.contains("s1"));

        let record = storage.load("s1").await.unwrap();
        assert_eq!(record.log.len(), 2);
        assert_eq!(record.snapshot_sequence, Some(1));

        let joined = store.join("s1", "bob").await.unwrap();
        assert_eq!(joined.snapshot.sequence_number, Some(1));
        assert_eq!(store.inspect("s1", |s| s.canvas().clone()).await.unwrap(), canvas);

        let op = store.accept("s1", "bob", segment(40.0, 1, 0)).await.unwrap();
        assert_eq!(op.sequence_number(), Some(2));
    }

    #[tokio::test]
    async fn test_failed_persist_keeps_session_in_memory() {
        let storage = Arc::new(FlakyStorage::default());
        let store = store_with(storage.clone());
        let mut alice = store.join("s1", "alice").await.unwrap();
        let bob = store.join("s1", "bob").await.unwrap();
        drop(bob);
        store.accept("s1", "alice", segment(0.0, 1, 0)).await.unwrap();

        storage.failing.store(true, Ordering::SeqCst);
        assert!(matches!(store.persist("s1").await, Err(StoreError::Storage(_))));
        assert!(store.inspect("s1", |s| s.is_degraded()).await.unwrap());

        // Skip the join and the op
        next(&mut alice.receiver).await;
        next(&mut alice.receiver).await;
        assert!(matches!(next(&mut alice.receiver).await, ServerMessage::Warning { .. }));

        store.leave("s1", "bob").await.unwrap();
        assert!(!store.leave("s1", "alice").await.unwrap());
        assert!(store.contains("s1"));

        storage.failing.store(false, Ordering::SeqCst);
        assert!(store.release("s1").await.unwrap());
        assert!(!store.contains("s1"));
        assert_eq!(storage.load("s1").await.unwrap().log.len(), 1);
    }

    #[tokio::test]
    async fn test_persist_skips_clean_sessions() {
        let store = store_with(Arc::new(MemoryStorage::new()));
        store.join("s1", "alice").await.unwrap();
        assert!(!store.persist("s1").await.unwrap());

        store.accept("s1", "alice", segment(0.0, 1, 0)).await.unwrap();
        assert_eq!(store.persist_due(Instant::now()).await, 1);
        assert!(!store.inspect("s1", |s| s.is_dirty()).await.unwrap());
        assert_eq!(store.persist_all().await, 0);
    }

    #[tokio::test]
    async fn test_delete_notifies_and_removes_record() {
        let storage = Arc::new(MemoryStorage::new());
        let store = store_with(storage.clone());
        let mut joined = store.join("s1", "alice").await.unwrap();
        store.accept("s1", "alice", segment(0.0, 1, 0)).await.unwrap();
        store.persist("s1").await.unwrap();

        store.delete("s1").await.unwrap();
        assert!(!store.contains("s1"));
        assert!(!storage.exists("s1").await.unwrap());

        next(&mut joined.receiver).await;
        assert_eq!(
            next(&mut joined.receiver).await,
            ServerMessage::SessionClosed {
                session_id: "s1".to_string()
            }
        );
        assert!(matches!(
            store.accept("s1", "alice", segment(0.0, 2, 0)).await,
            Err(StoreError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let store = Arc::new(store_with(Arc::new(MemoryStorage::new())));
        store.join("a", "alice").await.unwrap();
        store.join("b", "bob").await.unwrap();

        let mut tasks = Vec::new();
        for (session, author) in [("a", "alice"), ("b", "bob")] {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..50 {
                    store.accept(session, author, segment(0.0, i + 1, 0)).await.unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        for session in ["a", "b"] {
            let log = store.inspect(session, |s| s.log().to_vec()).await.unwrap();
            let seqs: Vec<u64> = log.iter().filter_map(StrokeOp::sequence_number).collect();
            assert_eq!(seqs, (0..50).collect::<Vec<_>>());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_accepts_are_gapless() {
        let store = Arc::new(store_with(Arc::new(MemoryStorage::new())));
        store.join("s1", "alice").await.unwrap();

        let mut tasks = Vec::new();
        for author in ["alice", "bob", "carol", "dave"] {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                let mut seqs = Vec::new();
                for i in 0..25 {
                    let op = store.accept("s1", author, segment(i as f64, i + 1, 0)).await.unwrap();
                    seqs.push(op.sequence_number().unwrap());
                }
                seqs
            }));
        }

        let mut all = Vec::new();
        for task in tasks {
            let seqs = task.await.unwrap();
            assert!(seqs.windows(2).all(|w| w[0] < w[1]));
            all.extend(seqs);
        }
        all.sort_unstable();
        assert_eq!(all, (0..100).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_stray_shape_after_clear_is_dropped() {
        let store = store_with(Arc::new(MemoryStorage::new()));
        store.join("s1", "alice").await.unwrap();

        let rectangle = |client_op_id, clear_epoch| {
            let op = StrokeOp::new(Tool::Rectangle, Rgb::black(), 2.0, Point::new(0.0, 0.0), Point::new(10.0, 10.0))
                .unwrap()
                .addressed("s1", "", clear_epoch, client_op_id);
            StrokeDraft::from(op)
        };
        let op = store.accept("s1", "alice", rectangle(1, 0)).await.unwrap();
        assert_eq!(op.sequence_number(), Some(0));

        let bob = store.join("s1", "bob").await.unwrap();
        assert_eq!(bob.snapshot.sequence_number, Some(0));
        assert!(!bob.snapshot.data.is_empty());

        assert_eq!(store.clear("s1", 0).await.unwrap(), Some(1));
        assert!(matches!(
            store.accept("s1", "alice", rectangle(2, 0)).await,
            Err(StoreError::StaleEpoch { op_epoch: 0, current: 1 })
        ));

        let snapshot = store.snapshot("s1").await.unwrap();
        assert!(snapshot.data.is_empty());
        assert_eq!(snapshot.sequence_number, None);
        assert_eq!(store.inspect("s1", |s| s.canvas().clone()).await.unwrap(), RasterSurface::new(64, 64));

        let op = store.accept("s1", "alice", rectangle(3, 1)).await.unwrap();
        assert_eq!(op.sequence_number(), Some(0));
    }

    #[tokio::test]
    async fn test_file_storage_survives_restart() {
        let dir = tempfile::tempdir().unwrap();

        let store = store_with(Arc::new(inkcast_core::FileStorage::new(dir.path().to_path_buf()).unwrap()));
        store.join("s1", "alice").await.unwrap();
        store.accept("s1", "alice", segment(0.0, 1, 0)).await.unwrap();
        store.clear("s1", 0).await.unwrap();
        store.accept("s1", "alice", segment(8.0, 2, 1)).await.unwrap();
        let canvas = store.inspect("s1", |s| s.canvas().clone()).await.unwrap();
        assert_eq!(store.persist_all().await, 1);
        drop(store);

        let restarted = store_with(Arc::new(inkcast_core::FileStorage::new(dir.path().to_path_buf()).unwrap()));
        let joined = restarted.join("s1", "bob").await.unwrap();
        assert_eq!(joined.snapshot.clear_epoch, 1);
        assert_eq!(joined.snapshot.sequence_number, Some(0));
        assert_eq!(restarted.inspect("s1", |s| s.canvas().clone()).await.unwrap(), canvas);
    }

    #[tokio::test]
    async fn test_join_during_delete_does_not_resurrect() {
        let storage = Arc::new(GatedDelete::default());
        let store = Arc::new(store_with(storage.clone()));
        store.join("s1", "alice").await.unwrap();
        store.accept("s1", "alice", segment(0.0, 1, 0)).await.unwrap();
        assert!(store.leave("s1", "alice").await.unwrap());
        assert!(storage.inner.exists("s1").await.unwrap());

        let deleting = tokio::spawn({
            let store = store.clone();
            async move { store.delete("s1").await }
        });
        storage.deleting.notified().await;

        // The record is still on disk, but the session is already gone
        assert!(matches!(store.join("s1", "bob").await, Err(StoreError::SessionNotFound(_))));
        assert!(!store.contains("s1"));

        storage.proceed.notify_one();
        deleting.await.unwrap().unwrap();
        assert!(!storage.inner.exists("s1").await.unwrap());
        assert!(matches!(store.join("s1", "bob").await, Err(StoreError::SessionNotFound(_))));
        assert_eq!(store.persist_all().await, 0);
    }

    #[tokio::test]
    async fn test_delete_unknown_session() {
        let store = store_with(Arc::new(MemoryStorage::new()));
        store.delete("ghost").await.unwrap();
        assert!(matches!(store.open("ghost").await, Err(StoreError::SessionNotFound(_))));
    }
}
