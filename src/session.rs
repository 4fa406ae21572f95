//! A sync session: one tracker, one observer, one lifecycle.
//!
//! The session owns all mutable sync state (tokens, timers, observed paths),
//! so independent sessions can coexist in one process. Work is cooperative:
//! the caller drives [`SyncSession::next_events`], and each batch is fully
//! reconciled before the next one is taken.

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::observer::{ChangeStream, ObserverCapabilities, ObserverOptions, UnifiedObserver};
use crate::state_file::{restore_file, SessionStateFile};
use crate::storage::FileStorage;
use crate::tracker::{BatchOutcome, FileStateTracker, SyncEvent, SyncState, TrackOptions};
use crate::write_token::{ExpiredToken, WriteTokenManager};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

pub struct SyncSession {
    tracker: FileStateTracker,
    observer: UnifiedObserver,
    changes: ChangeStream,
    expired_rx: mpsc::UnboundedReceiver<ExpiredToken>,
    /// Paths without push notifications; refreshed by [`SyncSession::refresh_unobserved`].
    unobserved: HashSet<PathBuf>,
    disposed: bool,
}

impl SyncSession {
    /// Create a session. Must be called inside a tokio runtime.
    pub fn create(storage: Arc<dyn FileStorage>, config: &SyncConfig) -> Self {
        let (expired_tx, expired_rx) = mpsc::unbounded_channel();
        let tokens = WriteTokenManager::new(config.token_ttl())
            .with_mtime_tolerance(config.mtime_tolerance())
            .with_expiry_notifications(expired_tx);
        let tracker = FileStateTracker::new(storage, config).with_token_manager(tokens);
        let (observer, changes) = UnifiedObserver::new(ObserverOptions::from(config));

        Self {
            tracker,
            observer,
            changes,
            expired_rx,
            unobserved: HashSet::new(),
            disposed: false,
        }
    }

    pub fn capabilities(&self) -> &ObserverCapabilities {
        self.observer.capabilities()
    }

    pub fn tracker(&self) -> &FileStateTracker {
        &self.tracker
    }

    /// Direct access for edits, reloads and conflict resolution.
    pub fn tracker_mut(&mut self) -> &mut FileStateTracker {
        &mut self.tracker
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tracker.subscribe()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Track `path` and start observing it.
    pub async fn open(&mut self, path: &Path, options: TrackOptions) -> Result<SyncState, SyncError> {
        let state = self.tracker.track(path, options).await?;
        self.observe(path);
        Ok(state)
    }

    pub async fn close(&mut self, path: &Path) -> bool {
        self.observer.unobserve(path);
        self.unobserved.remove(path);
        self.tracker.untrack(path).await
    }

    /// Save `path` and nudge the observer so the echo is picked up quickly.
    pub async fn save(&mut self, path: &Path) -> Result<SyncState, SyncError> {
        let state = self.tracker.save(path).await?;
        self.observer.check_now(path);
        Ok(state)
    }

    /// Wait for the next change batch or token expiry and reconcile it.
    ///
    /// Returns `None` once the observer has disconnected.
    pub async fn next_events(&mut self) -> Option<BatchOutcome> {
        tokio::select! {
            batch = self.changes.next_batch() => {
                let batch = batch?;
                Some(self.tracker.handle_changes(&batch).await)
            }
            Some(expired) = self.expired_rx.recv() => {
                let mut outcome = BatchOutcome::default();
                match self.tracker.handle_token_expired(&expired.token).await {
                    Ok(events) => outcome.events = events,
                    Err(e) => outcome.errors.push(e),
                }
                Some(outcome)
            }
        }
    }

    /// Re-check every path the observer could not register.
    pub async fn refresh_unobserved(&mut self) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        let paths: Vec<PathBuf> = self.unobserved.iter().cloned().collect();
        for path in paths {
            if !self.tracker.is_tracked(&path) {
                self.unobserved.remove(&path);
                continue;
            }
            match self.tracker.refresh(&path).await {
                Ok(events) => outcome.events.extend(events),
                Err(e) => outcome.errors.push(e),
            }
        }
        outcome
    }

    /// Persist tracked paths and unsaved edits.
    pub async fn save_state(&self, path: &Path) -> Result<(), SyncError> {
        SessionStateFile::capture(&self.tracker).save(path).await
    }

    /// Re-open every path recorded in a state file.
    pub async fn restore_state(&mut self, path: &Path) -> Result<BatchOutcome, SyncError> {
        let state = SessionStateFile::load(path).await?;
        let mut outcome = BatchOutcome::default();
        for file in state.into_restored() {
            let file_path = file.path.clone();
            match restore_file(&mut self.tracker, file).await {
                Ok(events) => {
                    self.observe(&file_path);
                    outcome.events.extend(events);
                }
                Err(e) => {
                    warn!("Could not restore {}: {}", file_path.display(), e);
                    outcome.errors.push(e);
                }
            }
        }
        info!(
            "Restored {} file(s) from {}",
            self.tracker.tracked_paths().count(),
            path.display()
        );
        Ok(outcome)
    }

    /// Stop observation, cancel all timers and release tracked content.
    pub async fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.observer.disconnect();
        self.tracker.dispose().await;
        self.unobserved.clear();
        self.disposed = true;
    }

    fn observe(&mut self, path: &Path) {
        if let Err(e) = self.observer.observe(path) {
            // Sync keeps working through explicit refreshes.
            if self.unobserved.insert(path.to_path_buf()) {
                warn!(
                    "No change notifications for {} ({}); refresh manually",
                    path.display(),
                    e
                );
            }
        }
    }
}
