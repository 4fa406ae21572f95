//! Three-way reconciliation between base, local and disk content.
//!
//! For every tracked path the tracker keeps three content handles:
//!
//! - **base**: the last content known to match disk (last save or reload)
//! - **local**: the in-memory, user-edited content (a piece table)
//! - **disk**: the last observed on-disk content
//!
//! The [`SyncState`] is always derived from the two equalities
//! `local == base` and `disk == base`, never stored independently of them.
//! Change notifications are first checked against the write token manager so
//! that echoes of our own saves are not mistaken for external edits.

use crate::config::SyncConfig;
use crate::content::{
    ContentHandle, ContentHandleFactory, DefaultContentFactory, PieceTableContent, SharedContent,
};
use crate::error::SyncError;
use crate::freshness::{check_freshness, FreshnessPolicy, Timestamped};
use crate::lru::BoundedCache;
use crate::observer::{ChangeRecord, ChangeType};
use crate::piece_table::PieceTable;
use crate::storage::{FileStat, FileStorage};
use crate::write_token::{WriteToken, WriteTokenManager};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncState {
    Synced,
    LocalChanges,
    ExternalChanges,
    Conflict,
}

impl SyncState {
    pub fn from_equality(local_eq_base: bool, disk_eq_base: bool) -> Self {
        match (local_eq_base, disk_eq_base) {
            (true, true) => SyncState::Synced,
            (false, true) => SyncState::LocalChanges,
            (true, false) => SyncState::ExternalChanges,
            (false, false) => SyncState::Conflict,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackMode {
    /// External changes are surfaced; local edits are never discarded.
    Tracked,
    /// External changes overwrite local edits automatically.
    Reactive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitialContent {
    Bytes(Vec<u8>),
    Text(String),
}

impl InitialContent {
    fn as_bytes(&self) -> &[u8] {
        match self {
            InitialContent::Bytes(bytes) => bytes,
            InitialContent::Text(text) => text.as_bytes(),
        }
    }
}

impl From<&str> for InitialContent {
    fn from(text: &str) -> Self {
        InitialContent::Text(text.to_string())
    }
}

#[derive(Debug, Clone, Default)]
pub struct TrackOptions {
    /// Content the caller already holds; skips the initial disk read.
    pub initial_content: Option<InitialContent>,
    pub reactive: bool,
}

impl TrackOptions {
    pub fn reactive() -> Self {
        Self {
            reactive: true,
            ..Self::default()
        }
    }

    pub fn with_content(content: impl Into<InitialContent>) -> Self {
        Self {
            initial_content: Some(content.into()),
            ..Self::default()
        }
    }
}

/// Events for UI and editor consumers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum SyncEvent {
    ExternalChange {
        path: PathBuf,
        new_mtime: Option<DateTime<Utc>>,
    },
    Conflict {
        path: PathBuf,
        #[serde(serialize_with = "serialize_content")]
        base_content: SharedContent,
        #[serde(serialize_with = "serialize_content")]
        local_content: SharedContent,
        #[serde(serialize_with = "serialize_content")]
        disk_content: SharedContent,
    },
    Reloaded {
        path: PathBuf,
        #[serde(serialize_with = "serialize_content")]
        new_content: SharedContent,
    },
    Deleted {
        path: PathBuf,
    },
    LocalChangesDiscarded {
        path: PathBuf,
    },
    Synced {
        path: PathBuf,
    },
}

impl SyncEvent {
    pub fn path(&self) -> &Path {
        match self {
            SyncEvent::ExternalChange { path, .. }
            | SyncEvent::Conflict { path, .. }
            | SyncEvent::Reloaded { path, .. }
            | SyncEvent::Deleted { path }
            | SyncEvent::LocalChangesDiscarded { path }
            | SyncEvent::Synced { path } => path,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SyncEvent::ExternalChange { .. } => "external-change",
            SyncEvent::Conflict { .. } => "conflict",
            SyncEvent::Reloaded { .. } => "reloaded",
            SyncEvent::Deleted { .. } => "deleted",
            SyncEvent::LocalChangesDiscarded { .. } => "local-changes-discarded",
            SyncEvent::Synced { .. } => "synced",
        }
    }
}

fn serialize_content<S: Serializer>(content: &SharedContent, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&content.to_text())
}

/// How to settle a conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Accept disk as the new base and keep the local edits on top of it.
    KeepLocal,
    /// Drop local edits and load the disk content.
    TakeDisk,
    /// Use caller-merged text as the local content over the disk base.
    Merged(String),
}

/// Per-path state held by the tracker.
#[derive(Debug)]
pub struct TrackedFile {
    path: PathBuf,
    mode: TrackMode,
    base: SharedContent,
    local: PieceTable,
    local_content: SharedContent,
    disk: SharedContent,
    disk_mtime: Option<DateTime<Utc>>,
    state: SyncState,
    history: VecDeque<PieceTable>,
    /// Id of the write token for a save whose echo has not been seen yet.
    pending_save: Option<String>,
    last_error: Option<String>,
}

impl TrackedFile {
    fn new(
        path: PathBuf,
        mode: TrackMode,
        disk: SharedContent,
        disk_mtime: Option<DateTime<Utc>>,
    ) -> Self {
        let local = PieceTable::new(&disk.to_text());
        let local_content: SharedContent = Arc::new(PieceTableContent::new(local.clone()));
        let mut entry = Self {
            path,
            mode,
            base: Arc::clone(&disk),
            local,
            local_content,
            disk,
            disk_mtime,
            state: SyncState::Synced,
            history: VecDeque::new(),
            pending_save: None,
            last_error: None,
        };
        entry.recompute();
        entry
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> TrackMode {
        self.mode
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn base(&self) -> &SharedContent {
        &self.base
    }

    pub fn local(&self) -> &SharedContent {
        &self.local_content
    }

    pub fn disk(&self) -> &SharedContent {
        &self.disk
    }

    pub fn table(&self) -> &PieceTable {
        &self.local
    }

    pub fn disk_mtime(&self) -> Option<DateTime<Utc>> {
        self.disk_mtime
    }

    pub fn has_pending_save(&self) -> bool {
        self.pending_save.is_some()
    }

    /// Last reconciliation failure, cleared by the next successful read.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    fn recompute(&mut self) -> SyncState {
        self.state = SyncState::from_equality(
            self.local_content.equals(self.base.as_ref()),
            self.disk.equals(self.base.as_ref()),
        );
        self.state
    }

    fn set_local(&mut self, table: PieceTable, history_limit: usize) {
        let previous = std::mem::replace(&mut self.local, table);
        if history_limit > 0 {
            self.history.push_back(previous);
            while self.history.len() > history_limit {
                self.history.pop_front();
            }
        }
        self.local_content = Arc::new(PieceTableContent::new(self.local.clone()));
    }

    /// Load `content` as base and local.
    fn load(&mut self, content: SharedContent, history_limit: usize) -> Result<(), SyncError> {
        let bytes = content.to_bytes();
        let text = std::str::from_utf8(&bytes)
            .map_err(|_| SyncError::InvalidUtf8(self.path.clone()))?;
        let table = self.local.replace_whole(text)?;
        self.set_local(table, history_limit);
        self.base = content;
        Ok(())
    }
}

/// Result of processing a batch of change records.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub events: Vec<SyncEvent>,
    /// Recoverable failures; the affected paths kept their last known state.
    pub errors: Vec<SyncError>,
}

pub struct FileStateTracker {
    entries: HashMap<PathBuf, TrackedFile>,
    storage: Arc<dyn FileStorage>,
    factory: Arc<dyn ContentHandleFactory>,
    tokens: WriteTokenManager,
    events: broadcast::Sender<SyncEvent>,
    stat_cache: BoundedCache<PathBuf, Timestamped<FileStat>>,
    stat_policy: FreshnessPolicy,
    history_limit: usize,
}

impl FileStateTracker {
    pub fn new(storage: Arc<dyn FileStorage>, config: &SyncConfig) -> Self {
        let tokens = WriteTokenManager::new(config.token_ttl())
            .with_mtime_tolerance(config.mtime_tolerance());
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            entries: HashMap::new(),
            storage,
            factory: Arc::new(DefaultContentFactory),
            tokens,
            events,
            stat_cache: BoundedCache::new(config.stat_cache_limit),
            stat_policy: FreshnessPolicy {
                max_age: Duration::from_millis(config.stat_max_age_ms),
                prefer_fresh: true,
            },
            history_limit: config.history_limit,
        }
    }

    pub fn with_token_manager(mut self, tokens: WriteTokenManager) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn with_factory(mut self, factory: Arc<dyn ContentHandleFactory>) -> Self {
        self.factory = factory;
        self
    }

    /// Receive every event the tracker emits.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn tokens(&self) -> &WriteTokenManager {
        &self.tokens
    }

    pub fn is_tracked(&self, path: &Path) -> bool {
        self.entries.contains_key(path)
    }

    pub fn entry(&self, path: &Path) -> Option<&TrackedFile> {
        self.entries.get(path)
    }

    pub fn state(&self, path: &Path) -> Option<SyncState> {
        self.entries.get(path).map(|e| e.state)
    }

    pub fn tracked_paths(&self) -> impl Iterator<Item = &Path> {
        self.entries.keys().map(PathBuf::as_path)
    }

    /// Current local content of `path`.
    pub fn content(&self, path: &Path) -> Result<SharedContent, SyncError> {
        Ok(Arc::clone(&self.get(path)?.local_content))
    }

    /// Start tracking `path`.
    pub async fn track(&mut self, path: &Path, options: TrackOptions) -> Result<SyncState, SyncError> {
        if self.entries.contains_key(path) {
            return Err(SyncError::AlreadyTracked(path.to_path_buf()));
        }

        let disk = match &options.initial_content {
            Some(initial) => self.factory.from_bytes(initial.as_bytes()),
            None => {
                let bytes = self
                    .storage
                    .read(path)
                    .await
                    .map_err(|e| SyncError::io(path, e))?;
                self.factory.from_bytes(&bytes)
            }
        };
        if !is_utf8(disk.as_ref()) {
            warn!("Refusing to track {}: not valid UTF-8", path.display());
            return Err(SyncError::InvalidUtf8(path.to_path_buf()));
        }

        let disk_mtime = match self.fetch_stat(path).await {
            Ok(stat) => stat.map(|s| s.mtime),
            Err(e) => {
                warn!("Failed to stat {}: {}", path.display(), e);
                None
            }
        };

        let mode = if options.reactive {
            TrackMode::Reactive
        } else {
            TrackMode::Tracked
        };
        let entry = TrackedFile::new(path.to_path_buf(), mode, disk, disk_mtime);
        let state = entry.state;
        self.entries.insert(path.to_path_buf(), entry);
        info!("Tracking {} ({:?})", path.display(), mode);
        Ok(state)
    }

    /// Start tracking with explicit base and local content, e.g. when restoring
    /// a session whose unsaved edits survived a restart.
    pub(crate) fn track_restored(
        &mut self,
        path: &Path,
        mode: TrackMode,
        base: SharedContent,
        local: PieceTable,
        disk: SharedContent,
        disk_mtime: Option<DateTime<Utc>>,
    ) -> SyncState {
        let mut entry = TrackedFile::new(path.to_path_buf(), mode, disk, disk_mtime);
        entry.base = base;
        entry.local_content = Arc::new(PieceTableContent::new(local.clone()));
        entry.local = local;
        let state = entry.recompute();
        self.entries.insert(path.to_path_buf(), entry);
        state
    }

    /// Stop tracking `path`, releasing its content and any pending token.
    pub async fn untrack(&mut self, path: &Path) -> bool {
        self.tokens.clear_token(path).await;
        self.stat_cache.remove(&path.to_path_buf());
        let removed = self.entries.remove(path).is_some();
        if removed {
            info!("Stopped tracking {}", path.display());
        }
        removed
    }

    /// Insert text into the local content.
    pub fn insert(&mut self, path: &Path, offset: usize, text: &str) -> Result<SyncState, SyncError> {
        let table = self.get(path)?.local.insert(offset, text)?;
        Ok(self.apply_local(path, table))
    }

    /// Delete a byte range from the local content.
    pub fn delete(
        &mut self,
        path: &Path,
        offset: usize,
        length: usize,
    ) -> Result<SyncState, SyncError> {
        let table = self.get(path)?.local.delete(offset, length)?;
        Ok(self.apply_local(path, table))
    }

    /// Replace the whole local text.
    pub fn set_local_text(&mut self, path: &Path, text: &str) -> Result<SyncState, SyncError> {
        let table = self.get(path)?.local.replace_all(text)?;
        Ok(self.apply_local(path, table))
    }

    /// Restore the previous local snapshot. Returns `false` when there is none.
    pub fn undo(&mut self, path: &Path) -> Result<bool, SyncError> {
        let entry = self.get_mut(path)?;
        let Some(previous) = entry.history.pop_back() else {
            return Ok(false);
        };
        let before = entry.state;
        entry.local = previous;
        entry.local_content = Arc::new(PieceTableContent::new(entry.local.clone()));
        let after = entry.recompute();
        self.emit_if_synced(path, before, after);
        Ok(true)
    }

    fn apply_local(&mut self, path: &Path, table: PieceTable) -> SyncState {
        let history_limit = self.history_limit;
        let Some(entry) = self.entries.get_mut(path) else {
            return SyncState::Synced;
        };
        let before = entry.state;
        entry.set_local(table, history_limit);
        let after = entry.recompute();
        self.emit_if_synced(path, before, after);
        after
    }

    /// Edits are silent, except that returning to the saved content is
    /// reported as `synced`.
    fn emit_if_synced(&self, path: &Path, before: SyncState, after: SyncState) {
        if before != SyncState::Synced && after == SyncState::Synced {
            self.emit(SyncEvent::Synced {
                path: path.to_path_buf(),
            });
        }
    }

    /// Write the local content to disk and advance base to it.
    ///
    /// `synced` is emitted later, when the echo of this write is matched or
    /// its token times out without a conflicting change.
    pub async fn save(&mut self, path: &Path) -> Result<SyncState, SyncError> {
        let Some(entry) = self.entries.get_mut(path) else {
            return Err(SyncError::NotTracked(path.to_path_buf()));
        };
        let saved = Arc::clone(&entry.local_content);
        let bytes = saved.to_bytes().into_owned();

        // Registered before the write so even an instant echo finds it.
        let token = self.tokens.generate_token(path).await;
        if let Err(e) = self.storage.write(path, &bytes).await {
            self.tokens.clear_token(path).await;
            entry.last_error = Some(e.to_string());
            warn!("Failed to save {}: {}", path.display(), e);
            return Err(SyncError::io(path, e));
        }

        entry.base = Arc::clone(&saved);
        entry.disk = saved;
        entry.pending_save = Some(token.id);
        entry.last_error = None;
        let state = entry.recompute();
        self.stat_cache.remove(&path.to_path_buf());
        debug!("Saved {} ({} bytes)", path.display(), bytes.len());
        Ok(state)
    }

    /// Process one batch from the observer, in order.
    pub async fn handle_changes(&mut self, batch: &[ChangeRecord]) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for record in batch {
            match self.handle_change(record).await {
                Ok(events) => outcome.events.extend(events),
                Err(e) => {
                    warn!("Reconciliation failed for {}: {}", record.path.display(), e);
                    outcome.errors.push(e);
                }
            }
        }
        outcome
    }

    /// Reconcile a single change notification.
    pub async fn handle_change(&mut self, record: &ChangeRecord) -> Result<Vec<SyncEvent>, SyncError> {
        if !self.entries.contains_key(&record.path) {
            debug!("Ignoring change for untracked {}", record.path.display());
            return Ok(Vec::new());
        }
        if record.change_type == ChangeType::Deleted {
            debug!("Delete reported for {}", record.path.display());
        }
        self.refresh(&record.path).await
    }

    /// Re-check `path` against disk now.
    ///
    /// On I/O failure the entry keeps its last known disk content and the
    /// error is returned; the next notification retries.
    pub async fn refresh(&mut self, path: &Path) -> Result<Vec<SyncEvent>, SyncError> {
        if !self.entries.contains_key(path) {
            return Err(SyncError::NotTracked(path.to_path_buf()));
        }

        let stat = match self.fetch_stat(path).await {
            Ok(stat) => stat,
            Err(e) => return Err(self.record_error(path, e)),
        };
        let Some(stat) = stat else {
            return Ok(self.handle_deleted(path).await);
        };

        let token = self.tokens.match_token(path, stat.mtime).await;
        let bytes = match self.storage.read(path).await {
            Ok(bytes) => bytes,
            Err(e) => return Err(self.record_error(path, e)),
        };
        let disk = self.factory.from_bytes(&bytes);

        if let Some(token) = token {
            // The mtime fits our write; the content must match it too.
            let is_echo = self
                .entries
                .get(path)
                .is_some_and(|entry| disk.equals(entry.disk.as_ref()));
            if is_echo {
                debug!("Suppressed echo of our write to {} (token {})", path.display(), token.id);
                if let Some(entry) = self.entries.get_mut(path) {
                    entry.disk_mtime = Some(stat.mtime);
                    entry.last_error = None;
                }
                return Ok(self.confirm_save(path, &token.id));
            }
            debug!(
                "{} changed after our write (token {}), treating as external",
                path.display(),
                token.id
            );
        }

        self.reconcile_disk(path, stat, disk)
    }

    /// Settle a save whose token expired before its echo was seen.
    pub async fn handle_token_expired(
        &mut self,
        token: &WriteToken,
    ) -> Result<Vec<SyncEvent>, SyncError> {
        let Some(entry) = self.entries.get_mut(&token.path) else {
            return Ok(Vec::new());
        };
        if entry.pending_save.as_deref() != Some(token.id.as_str()) {
            return Ok(Vec::new());
        }
        debug!("No echo seen for save of {}, checking disk", token.path.display());

        let mut events = self.refresh(&token.path).await?;
        let confirmed = match self.entries.get_mut(&token.path) {
            Some(entry) => {
                entry.pending_save.take().is_some()
                    && events.is_empty()
                    && entry.recompute() == SyncState::Synced
            }
            None => false,
        };
        if confirmed {
            let event = SyncEvent::Synced {
                path: token.path.clone(),
            };
            self.emit(event.clone());
            events.push(event);
        }
        Ok(events)
    }

    /// Load the last observed disk content as base and local.
    pub fn reload(&mut self, path: &Path) -> Result<Vec<SyncEvent>, SyncError> {
        let history_limit = self.history_limit;
        let entry = self.get_mut(path)?;
        let disk = Arc::clone(&entry.disk);
        entry.load(Arc::clone(&disk), history_limit)?;
        entry.recompute();
        let event = SyncEvent::Reloaded {
            path: path.to_path_buf(),
            new_content: disk,
        };
        self.emit(event.clone());
        Ok(vec![event])
    }

    pub fn resolve_conflict(
        &mut self,
        path: &Path,
        resolution: Resolution,
    ) -> Result<SyncState, SyncError> {
        let history_limit = self.history_limit;
        match resolution {
            Resolution::TakeDisk => {
                self.reload(path)?;
            }
            Resolution::KeepLocal => {
                let entry = self.get_mut(path)?;
                entry.base = Arc::clone(&entry.disk);
            }
            Resolution::Merged(text) => {
                let entry = self.get_mut(path)?;
                let table = entry.local.replace_all(&text)?;
                entry.set_local(table, history_limit);
                entry.base = Arc::clone(&entry.disk);
            }
        }
        let entry = self.get_mut(path)?;
        let state = entry.recompute();
        info!("Resolved conflict on {} -> {:?}", path.display(), state);
        Ok(state)
    }

    /// File stats, served from cache while fresh.
    pub async fn file_stat(&mut self, path: &Path) -> Result<Option<FileStat>, SyncError> {
        let key = path.to_path_buf();
        let report = check_freshness(self.stat_cache.peek(&key), &self.stat_policy, Utc::now());
        if report.is_fresh {
            return Ok(self.stat_cache.get(&key).map(|cached| cached.value));
        }
        self.fetch_stat(path)
            .await
            .map_err(|e| SyncError::io(path, e))
    }

    pub fn cached_stat_count(&self) -> usize {
        self.stat_cache.len()
    }

    /// Release every pending token and its timer.
    pub async fn dispose(&mut self) {
        self.tokens.dispose().await;
        self.entries.clear();
        self.stat_cache.clear();
    }

    async fn fetch_stat(&mut self, path: &Path) -> std::io::Result<Option<FileStat>> {
        let stat = self.storage.stat(path).await?;
        let key = path.to_path_buf();
        match stat {
            Some(stat) => {
                for (evicted, _) in self.stat_cache.insert(key, Timestamped::now(stat)) {
                    debug!("Evicted cached stat for {}", evicted.display());
                }
            }
            None => {
                self.stat_cache.remove(&key);
            }
        }
        Ok(stat)
    }

    fn reconcile_disk(
        &mut self,
        path: &Path,
        stat: FileStat,
        disk: SharedContent,
    ) -> Result<Vec<SyncEvent>, SyncError> {
        let Some(entry) = self.entries.get_mut(path) else {
            return Ok(Vec::new());
        };
        entry.last_error = None;
        entry.disk_mtime = Some(stat.mtime);

        if disk.equals(entry.disk.as_ref()) {
            debug!("Disk content of {} unchanged", path.display());
            return Ok(Vec::new());
        }
        entry.disk = Arc::clone(&disk);
        // A later external write supersedes whatever we saved.
        entry.pending_save = None;

        if disk.equals(entry.base.as_ref()) {
            // Disk went back to base; nothing external is pending any more.
            let before = entry.state;
            let after = entry.recompute();
            if after == SyncState::Synced && before != SyncState::Synced {
                let event = SyncEvent::Synced {
                    path: path.to_path_buf(),
                };
                self.emit(event.clone());
                return Ok(vec![event]);
            }
            return Ok(Vec::new());
        }

        self.classify_external(path, Some(stat.mtime))
    }

    /// Decide what a disk change that differs from base means for `path`,
    /// whose disk content has already been updated.
    fn classify_external(
        &mut self,
        path: &Path,
        new_mtime: Option<DateTime<Utc>>,
    ) -> Result<Vec<SyncEvent>, SyncError> {
        let history_limit = self.history_limit;
        let Some(entry) = self.entries.get_mut(path) else {
            return Ok(Vec::new());
        };
        let disk = Arc::clone(&entry.disk);
        let local_dirty = !entry.local_content.equals(entry.base.as_ref());
        let mut mode = entry.mode;
        if mode == TrackMode::Reactive && !is_utf8(disk.as_ref()) {
            warn!("{} is no longer valid UTF-8; not reloading it", path.display());
            mode = TrackMode::Tracked;
        }

        let mut events = Vec::new();
        match (mode, local_dirty) {
            (TrackMode::Tracked, true) => {
                entry.recompute();
                info!("Conflict on {}", path.display());
                events.push(SyncEvent::Conflict {
                    path: path.to_path_buf(),
                    base_content: Arc::clone(&entry.base),
                    local_content: Arc::clone(&entry.local_content),
                    disk_content: disk,
                });
            }
            (TrackMode::Tracked, false) => {
                entry.recompute();
                info!("External change to {}", path.display());
                events.push(SyncEvent::ExternalChange {
                    path: path.to_path_buf(),
                    new_mtime,
                });
            }
            (TrackMode::Reactive, dirty) => {
                events.push(SyncEvent::ExternalChange {
                    path: path.to_path_buf(),
                    new_mtime,
                });
                entry.load(Arc::clone(&disk), history_limit)?;
                entry.recompute();
                if dirty {
                    info!("Discarded local changes to {}", path.display());
                    events.push(SyncEvent::LocalChangesDiscarded {
                        path: path.to_path_buf(),
                    });
                } else {
                    info!("Reloaded {}", path.display());
                    events.push(SyncEvent::Reloaded {
                        path: path.to_path_buf(),
                        new_content: disk,
                    });
                }
            }
        }

        for event in &events {
            self.emit(event.clone());
        }
        Ok(events)
    }

    /// Report a disk change found while restoring a session.
    pub(crate) fn restored_disk_change(
        &mut self,
        path: &Path,
        new_mtime: Option<DateTime<Utc>>,
    ) -> Result<Vec<SyncEvent>, SyncError> {
        self.classify_external(path, new_mtime)
    }

    async fn handle_deleted(&mut self, path: &Path) -> Vec<SyncEvent> {
        self.tokens.clear_token(path).await;
        self.stat_cache.remove(&path.to_path_buf());
        if self.entries.remove(path).is_none() {
            return Vec::new();
        }
        info!("{} was deleted externally", path.display());
        let event = SyncEvent::Deleted {
            path: path.to_path_buf(),
        };
        self.emit(event.clone());
        vec![event]
    }

    fn confirm_save(&mut self, path: &Path, token_id: &str) -> Vec<SyncEvent> {
        let Some(entry) = self.entries.get_mut(path) else {
            return Vec::new();
        };
        if entry.pending_save.as_deref() != Some(token_id) {
            return Vec::new();
        }
        entry.pending_save = None;
        // Compare against the current local content, which may have moved on
        // since the save started.
        if entry.recompute() != SyncState::Synced {
            return Vec::new();
        }
        let event = SyncEvent::Synced {
            path: path.to_path_buf(),
        };
        self.emit(event.clone());
        vec![event]
    }

    /// Read and stat `path` without touching any entry.
    pub(crate) async fn read_disk(
        &mut self,
        path: &Path,
    ) -> Result<(SharedContent, Option<DateTime<Utc>>), SyncError> {
        let bytes = self
            .storage
            .read(path)
            .await
            .map_err(|e| SyncError::io(path, e))?;
        let mtime = self
            .fetch_stat(path)
            .await
            .map_err(|e| SyncError::io(path, e))?
            .map(|s| s.mtime);
        Ok((self.factory.from_bytes(&bytes), mtime))
    }

    pub(crate) fn factory(&self) -> &dyn ContentHandleFactory {
        self.factory.as_ref()
    }

    fn record_error(&mut self, path: &Path, error: std::io::Error) -> SyncError {
        if let Some(entry) = self.entries.get_mut(path) {
            entry.last_error = Some(error.to_string());
        }
        SyncError::io(path, error)
    }

    pub(crate) fn emit(&self, event: SyncEvent) {
        // No subscribers is fine; callers also get events as return values.
        let _ = self.events.send(event);
    }

    fn get(&self, path: &Path) -> Result<&TrackedFile, SyncError> {
        self.entries
            .get(path)
            .ok_or_else(|| SyncError::NotTracked(path.to_path_buf()))
    }

    fn get_mut(&mut self, path: &Path) -> Result<&mut TrackedFile, SyncError> {
        self.entries
            .get_mut(path)
            .ok_or_else(|| SyncError::NotTracked(path.to_path_buf()))
    }
}

fn is_utf8(content: &dyn ContentHandle) -> bool {
    std::str::from_utf8(&content.to_bytes()).is_ok()
}
