//! Persisted session state.
//!
//! Records, per tracked path, the hash of the base content and, when there
//! are unsaved edits, the base text and the local piece table. On restart
//! this lets us detect files changed while nothing was running, and bring
//! unsaved edits back.
//!
//! Whether a stored snapshot is usable is decided once, at load time: every
//! record becomes a [`RestoredHandle::Live`] or a [`RestoredHandle::Stale`].

use crate::content::{compute_content_hash, ContentHandle, SharedContent};
use crate::error::SyncError;
use crate::piece_table::{PieceTable, PieceTableSnapshot};
use crate::tracker::{FileStateTracker, InitialContent, SyncEvent, TrackMode, TrackOptions};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const STATE_FILE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub base_hash: String,
    pub mode: TrackMode,
    /// Present only when the file had unsaved edits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local: Option<PieceTableSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStateFile {
    pub version: u32,
    #[serde(default)]
    pub files: BTreeMap<PathBuf, FileRecord>,
}

impl Default for SessionStateFile {
    fn default() -> Self {
        Self {
            version: STATE_FILE_VERSION,
            files: BTreeMap::new(),
        }
    }
}

/// Outcome of validating a stored record.
#[derive(Debug, Clone)]
pub enum RestoredHandle {
    /// Unsaved edits that can be restored as they were.
    Live { base: String, local: PieceTable },
    /// Nothing restorable; the file is loaded from disk.
    Stale,
}

#[derive(Debug, Clone)]
pub struct RestoredFile {
    pub path: PathBuf,
    pub mode: TrackMode,
    pub base_hash: String,
    pub handle: RestoredHandle,
}

impl SessionStateFile {
    /// Record the current state of every tracked path.
    pub fn capture(tracker: &FileStateTracker) -> Self {
        let mut files = BTreeMap::new();
        for path in tracker.tracked_paths() {
            let Some(entry) = tracker.entry(path) else {
                continue;
            };
            let dirty = !entry.local().equals(entry.base().as_ref());
            files.insert(
                path.to_path_buf(),
                FileRecord {
                    base_hash: entry.base().hash().to_string(),
                    mode: entry.mode(),
                    base_text: dirty.then(|| entry.base().to_text().into_owned()),
                    local: dirty.then(|| entry.table().to_snapshot()),
                },
            );
        }
        Self {
            version: STATE_FILE_VERSION,
            files,
        }
    }

    pub async fn load(path: &Path) -> Result<Self, SyncError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| SyncError::io(path, e))?;
        let state: Self =
            serde_json::from_str(&content).map_err(|e| SyncError::StateFile(e.to_string()))?;
        if state.version != STATE_FILE_VERSION {
            return Err(SyncError::StateFile(format!(
                "unsupported version {}",
                state.version
            )));
        }
        Ok(state)
    }

    /// Write via a temporary file and rename, so readers never see half a file.
    pub async fn save(&self, path: &Path) -> Result<(), SyncError> {
        let json =
            serde_json::to_string_pretty(self).map_err(|e| SyncError::StateFile(e.to_string()))?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| SyncError::io(&tmp, e))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| SyncError::io(path, e))
    }

    /// Validate every record.
    pub fn into_restored(self) -> Vec<RestoredFile> {
        self.files
            .into_iter()
            .map(|(path, record)| {
                let handle = resolve_handle(&path, &record);
                RestoredFile {
                    path,
                    mode: record.mode,
                    base_hash: record.base_hash,
                    handle,
                }
            })
            .collect()
    }
}

fn resolve_handle(path: &Path, record: &FileRecord) -> RestoredHandle {
    let (Some(base), Some(snapshot)) = (&record.base_text, &record.local) else {
        return RestoredHandle::Stale;
    };
    if compute_content_hash(base.as_bytes()) != record.base_hash {
        warn!("Stored base for {} does not match its hash", path.display());
        return RestoredHandle::Stale;
    }
    match PieceTable::from_snapshot(snapshot.clone()) {
        Ok(local) => RestoredHandle::Live {
            base: base.clone(),
            local,
        },
        Err(e) => {
            warn!("Discarding stored edits for {}: {}", path.display(), e);
            RestoredHandle::Stale
        }
    }
}

/// Track a restored file, reporting anything that changed on disk meanwhile.
pub async fn restore_file(
    tracker: &mut FileStateTracker,
    file: RestoredFile,
) -> Result<Vec<SyncEvent>, SyncError> {
    let RestoredFile {
        path,
        mode,
        base_hash,
        handle,
    } = file;
    if tracker.is_tracked(&path) {
        return Err(SyncError::AlreadyTracked(path));
    }

    let (disk, mtime) = tracker.read_disk(&path).await?;
    let changed_offline = disk.hash() != base_hash;

    let events = match handle {
        RestoredHandle::Live { base, local } => {
            let base: SharedContent = tracker.factory().from_string(&base);
            let state = tracker.track_restored(&path, mode, base, local, disk, mtime);
            info!("Restored unsaved edits for {} ({:?})", path.display(), state);
            if changed_offline {
                tracker.restored_disk_change(&path, mtime)?
            } else {
                Vec::new()
            }
        }
        RestoredHandle::Stale => {
            let options = TrackOptions {
                initial_content: Some(InitialContent::Bytes(disk.to_bytes().into_owned())),
                reactive: mode == TrackMode::Reactive,
            };
            tracker.track(&path, options).await?;
            if changed_offline {
                debug!("{} changed while the session was closed", path.display());
                let event = SyncEvent::ExternalChange {
                    path: path.clone(),
                    new_mtime: mtime,
                };
                tracker.emit(event.clone());
                vec![event]
            } else {
                Vec::new()
            }
        }
    };
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dirty_record(base: &str, local: &str) -> FileRecord {
        FileRecord {
            base_hash: compute_content_hash(base.as_bytes()),
            mode: TrackMode::Tracked,
            base_text: Some(base.to_string()),
            local: Some(PieceTable::new(local).to_snapshot()),
        }
    }

    #[test]
    fn test_clean_record_is_stale() {
        let record = FileRecord {
            base_hash: compute_content_hash(b"x"),
            mode: TrackMode::Reactive,
            base_text: None,
            local: None,
        };
        assert!(matches!(
            resolve_handle(Path::new("a"), &record),
            RestoredHandle::Stale
        ));
    }

    #[test]
    fn test_dirty_record_is_live() {
        let record = dirty_record("base", "base plus");
        match resolve_handle(Path::new("a"), &record) {
            RestoredHandle::Live { base, local } => {
                assert_eq!(base, "base");
                assert_eq!(local.text(), "base plus");
            }
            RestoredHandle::Stale => panic!("expected live handle"),
        }
    }

    #[test]
    fn test_tampered_base_is_stale() {
        let mut record = dirty_record("base", "edited");
        record.base_text = Some("other".to_string());
        assert!(matches!(
            resolve_handle(Path::new("a"), &record),
            RestoredHandle::Stale
        ));
    }

    #[test]
    fn test_state_file_wire_shape() {
        let mut state = SessionStateFile::default();
        state.files.insert(PathBuf::from("a.txt"), dirty_record("b", "bc"));
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["version"], STATE_FILE_VERSION);
        assert_eq!(json["files"]["a.txt"]["mode"], "tracked");
        assert_eq!(json["files"]["a.txt"]["base_text"], "b");

        let back: SessionStateFile = serde_json::from_value(json).unwrap();
        assert_eq!(back, state);
    }

    #[tokio::test]
    async fn test_unsupported_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, r#"{ "version": 99, "files": {} }"#).unwrap();
        assert!(matches!(
            SessionStateFile::load(&path).await,
            Err(SyncError::StateFile(_))
        ));
    }
}
