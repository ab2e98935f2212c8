//! Inkcast Core Library
//!
//! Platform-agnostic data structures and logic for shared whiteboard
//! sessions: stroke operations, the wire protocol, local history, ordered
//! delivery and the client-side session lifecycle.

pub mod canvas;
pub mod client;
pub mod history;
pub mod reorder;
pub mod session;
pub mod storage;
pub mod stroke;
pub mod sync;

pub use canvas::{SnapshotData, Surface, SurfaceError};
pub use client::ClientSession;
pub use history::{History, MAX_HISTORY};
pub use reorder::{ReorderBuffer, ReorderOutcome};
pub use session::{ClientConfig, LifecycleState, SessionController, SessionError, SessionEvent, SessionResult};
pub use storage::{FileStorage, MemoryStorage, SessionRecord, Storage, StorageError, StorageResult};
pub use stroke::{ERASER_WIDTH_FACTOR, Rgb, StrokeDraft, StrokeOp, Tool, ValidationError};
pub use sync::{ClientMessage, ConnectionState, NativeTransport, RejectReason, ServerMessage, TransportEvent};
