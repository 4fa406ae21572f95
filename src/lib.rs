//! commonplace-filesync: keep in-memory documents consistent with files on disk.
//!
//! The pieces, bottom up:
//!
//! - [`piece_table`]: immutable, cheaply cloned text buffers for local edits
//! - [`content`]: hashed content handles used to compare base/local/disk
//! - [`write_token`]: recognizes the echo of our own saves
//! - [`observer`]: native file watching with a polling fallback
//! - [`tracker`]: three-way reconciliation and sync events
//! - [`session`]: ties a tracker and an observer together

pub mod cli;
pub mod config;
pub mod content;
pub mod error;
pub mod freshness;
pub mod lru;
pub mod observer;
pub mod piece_table;
pub mod session;
pub mod state_file;
pub mod storage;
pub mod tracker;
pub mod write_token;

pub use config::SyncConfig;
pub use content::{compute_content_hash, ContentHandle, SharedContent};
pub use error::{RangeError, SyncError};
pub use observer::{ChangeRecord, ChangeType, ObserverCapabilities, ObserverKind, UnifiedObserver};
pub use piece_table::PieceTable;
pub use session::SyncSession;
pub use storage::{FileStorage, LocalFileStorage, MemoryStorage};
pub use tracker::{FileStateTracker, Resolution, SyncEvent, SyncState, TrackMode, TrackOptions};
pub use write_token::{WriteToken, WriteTokenManager};
