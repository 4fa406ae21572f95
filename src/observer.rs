//! Unified change observer.
//!
//! Wraps the platform's native push notifications (`notify`'s recommended
//! watcher) when it can be created, and falls back to a polling loop that
//! diffs file fingerprints otherwise. Both paths normalize changes into
//! [`ChangeRecord`] batches delivered on a [`ChangeStream`]; disconnecting
//! closes the stream.
//!
//! The two modes differ in one documented way: [`UnifiedObserver::check_now`]
//! triggers an immediate scan when polling, and does nothing for native
//! observation, whose changes are push-only. Either way results arrive on
//! the stream, never as a return value.

use crate::error::SyncError;
use chrono::{DateTime, Utc};
use futures::Stream;
use notify::event::{ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObserverKind {
    Native,
    Polling,
}

/// What a caller can expect from an observer. Fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObserverCapabilities {
    #[serde(rename = "type")]
    pub kind: ObserverKind,
    pub latency_ms: u64,
    /// Native recursion; polling emulates it by re-scanning.
    pub supports_recursive: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Created,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub path: PathBuf,
    pub change_type: ChangeType,
    pub detected_at: DateTime<Utc>,
}

impl ChangeRecord {
    pub fn new(path: impl Into<PathBuf>, change_type: ChangeType) -> Self {
        Self {
            path: path.into(),
            change_type,
            detected_at: Utc::now(),
        }
    }
}

pub type ChangeBatch = Vec<ChangeRecord>;

#[derive(Debug, Clone, Copy)]
pub struct ObserverOptions {
    pub force_polling: bool,
    pub poll_interval: Duration,
    /// Latency reported for native observation.
    pub native_latency: Duration,
}

impl Default for ObserverOptions {
    fn default() -> Self {
        Self {
            force_polling: false,
            poll_interval: Duration::from_secs(1),
            native_latency: Duration::from_millis(50),
        }
    }
}

impl From<&crate::config::SyncConfig> for ObserverOptions {
    fn from(config: &crate::config::SyncConfig) -> Self {
        Self {
            force_polling: config.force_polling,
            poll_interval: config.poll_interval(),
            native_latency: Duration::from_millis(config.native_latency_ms),
        }
    }
}

/// Receiving end of an observer. Yields `None` once the observer disconnects.
#[derive(Debug)]
pub struct ChangeStream {
    rx: mpsc::UnboundedReceiver<ChangeBatch>,
}

impl ChangeStream {
    pub async fn next_batch(&mut self) -> Option<ChangeBatch> {
        self.rx.recv().await
    }
}

impl Stream for ChangeStream {
    type Item = ChangeBatch;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    mtime: Option<SystemTime>,
    len: u64,
}

type Snapshot = HashMap<PathBuf, Fingerprint>;

#[derive(Debug, Default)]
struct ObservedRoot {
    is_dir: bool,
    /// Absolute, resolved form of the root. Native watchers report paths
    /// under this, not under the key the caller observed.
    watch_path: PathBuf,
    /// Last scan result; polling only.
    snapshot: Snapshot,
}

#[derive(Debug, Default)]
struct ObservedSet {
    roots: HashMap<PathBuf, ObservedRoot>,
}

impl ObservedSet {
    /// Translate a path reported by the watcher into the caller's form.
    fn map_to_key(&self, path: &Path) -> Option<PathBuf> {
        self.roots.iter().find_map(|(key, root)| {
            if root.watch_path == path {
                return Some(key.clone());
            }
            if !root.is_dir {
                return None;
            }
            let rest = path.strip_prefix(&root.watch_path).ok()?;
            Some(key.join(rest))
        })
    }
}

fn resolve_watch_path(path: &Path) -> PathBuf {
    std::fs::canonicalize(path)
        .or_else(|_| std::env::current_dir().map(|cwd| cwd.join(path)))
        .unwrap_or_else(|_| path.to_path_buf())
}

type SharedObserved = Arc<RwLock<ObservedSet>>;

enum Backend {
    Native {
        watcher: RecommendedWatcher,
        /// Directories registered with the watcher, with how many roots need each.
        watched: HashMap<PathBuf, (RecursiveMode, usize)>,
    },
    Polling {
        task: JoinHandle<()>,
        wake: Arc<Notify>,
    },
}

pub struct UnifiedObserver {
    capabilities: ObserverCapabilities,
    observed: SharedObserved,
    backend: Option<Backend>,
}

impl UnifiedObserver {
    /// Create an observer, preferring native notifications.
    ///
    /// Must be called inside a tokio runtime; the polling fallback spawns a task.
    pub fn new(options: ObserverOptions) -> (Self, ChangeStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        let observed = SharedObserved::default();

        if !options.force_polling {
            match native_watcher(tx.clone(), Arc::clone(&observed)) {
                Ok(watcher) => {
                    info!("Using native file notifications");
                    let observer = Self {
                        capabilities: ObserverCapabilities {
                            kind: ObserverKind::Native,
                            latency_ms: options.native_latency.as_millis() as u64,
                            supports_recursive: true,
                            poll_interval_ms: None,
                        },
                        observed,
                        backend: Some(Backend::Native {
                            watcher,
                            watched: HashMap::new(),
                        }),
                    };
                    return (observer, ChangeStream { rx });
                }
                Err(e) => warn!("Native file notifications unavailable ({}), polling instead", e),
            }
        }

        let wake = Arc::new(Notify::new());
        let task = tokio::spawn(poll_loop(
            tx,
            Arc::clone(&observed),
            options.poll_interval,
            Arc::clone(&wake),
        ));
        let interval_ms = options.poll_interval.as_millis() as u64;
        info!("Polling for file changes every {}ms", interval_ms);
        let observer = Self {
            capabilities: ObserverCapabilities {
                kind: ObserverKind::Polling,
                latency_ms: interval_ms,
                supports_recursive: false,
                poll_interval_ms: Some(interval_ms),
            },
            observed,
            backend: Some(Backend::Polling { task, wake }),
        };
        (observer, ChangeStream { rx })
    }

    pub fn capabilities(&self) -> &ObserverCapabilities {
        &self.capabilities
    }

    pub fn is_connected(&self) -> bool {
        self.backend.is_some()
    }

    pub fn is_observed(&self, path: &Path) -> bool {
        self.read_observed().roots.contains_key(path)
    }

    /// Start delivering changes for `path`, a file or a directory tree.
    /// Observing an already observed path does nothing.
    pub fn observe(&mut self, path: &Path) -> Result<(), SyncError> {
        if self.is_observed(path) {
            return Ok(());
        }
        let Some(backend) = self.backend.as_mut() else {
            return Err(SyncError::Capability("observer is disconnected".to_string()));
        };

        let is_dir = std::fs::metadata(path).map(|m| m.is_dir()).unwrap_or(false);
        let mut root = ObservedRoot {
            is_dir,
            watch_path: resolve_watch_path(path),
            snapshot: Snapshot::new(),
        };

        match backend {
            Backend::Native { watcher, watched } => {
                // Watch a file through its directory so atomic replace-by-rename
                // does not drop the watch.
                let target = watch_target(&root);
                let mode = if is_dir {
                    RecursiveMode::Recursive
                } else {
                    RecursiveMode::NonRecursive
                };
                let existing = watched.get(&target).copied();
                let covered = matches!(
                    existing,
                    Some((current, _)) if current == RecursiveMode::Recursive || current == mode
                );
                if !covered {
                    watcher.watch(&target, mode)?;
                }
                let (current, count) = existing.unwrap_or((mode, 0));
                let mode = if covered { current } else { mode };
                watched.insert(target, (mode, count + 1));
            }
            Backend::Polling { .. } => {
                root.snapshot = scan(path, is_dir);
            }
        }

        debug!("Observing {} (dir={})", path.display(), is_dir);
        self.write_observed().roots.insert(path.to_path_buf(), root);
        Ok(())
    }

    /// Stop delivering changes for `path`. Safe to call for unobserved paths.
    pub fn unobserve(&mut self, path: &Path) {
        let Some(root) = self.write_observed().roots.remove(path) else {
            return;
        };
        if let Some(Backend::Native { watcher, watched }) = self.backend.as_mut() {
            let target = watch_target(&root);
            if let Some((_, count)) = watched.get_mut(&target) {
                *count -= 1;
                if *count == 0 {
                    watched.remove(&target);
                    if let Err(e) = watcher.unwatch(&target) {
                        debug!("Failed to unwatch {}: {}", target.display(), e);
                    }
                }
            }
        }
        debug!("Stopped observing {}", path.display());
    }

    /// Hint that `path` may have changed.
    ///
    /// Polling: run a scan now instead of waiting for the next tick. Native:
    /// no-op. In both cases any change is delivered on the stream.
    pub fn check_now(&self, path: &Path) {
        match &self.backend {
            Some(Backend::Polling { wake, .. }) if self.is_observed(path) => wake.notify_one(),
            Some(Backend::Native { .. }) => {
                debug!("check_now ignored for native observer ({})", path.display());
            }
            _ => {}
        }
    }

    /// Stop all observation and close the change stream. Idempotent.
    pub fn disconnect(&mut self) {
        match self.backend.take() {
            Some(Backend::Polling { task, .. }) => task.abort(),
            Some(Backend::Native { watcher, .. }) => drop(watcher),
            None => return,
        }
        self.write_observed().roots.clear();
        info!("Observer disconnected");
    }

    fn read_observed(&self) -> std::sync::RwLockReadGuard<'_, ObservedSet> {
        self.observed.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_observed(&self) -> std::sync::RwLockWriteGuard<'_, ObservedSet> {
        self.observed.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for UnifiedObserver {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn watch_target(root: &ObservedRoot) -> PathBuf {
    if root.is_dir {
        return root.watch_path.clone();
    }
    root.watch_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| root.watch_path.clone())
}

fn native_watcher(
    tx: mpsc::UnboundedSender<ChangeBatch>,
    observed: SharedObserved,
) -> notify::Result<RecommendedWatcher> {
    RecommendedWatcher::new(
        move |res: notify::Result<Event>| match res {
            Ok(event) => {
                let observed = observed.read().unwrap_or_else(PoisonError::into_inner);
                let batch: ChangeBatch = normalize_event(event)
                    .into_iter()
                    .filter_map(|mut record| {
                        record.path = observed.map_to_key(&record.path)?;
                        Some(record)
                    })
                    .collect();
                drop(observed);
                if !batch.is_empty() && tx.send(batch).is_err() {
                    debug!("Change stream closed, dropping native event");
                }
            }
            Err(e) => warn!("Watch error: {:?}", e),
        },
        Config::default(),
    )
}

/// Map a notify event onto zero or more change records.
fn normalize_event(event: Event) -> Vec<ChangeRecord> {
    let detected_at = Utc::now();
    let record = |path: &PathBuf, change_type| ChangeRecord {
        path: path.clone(),
        change_type,
        detected_at,
    };

    match event.kind {
        EventKind::Create(_) => event
            .paths
            .iter()
            .map(|p| record(p, ChangeType::Created))
            .collect(),
        EventKind::Remove(_) => event
            .paths
            .iter()
            .map(|p| record(p, ChangeType::Deleted))
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => event
            .paths
            .iter()
            .map(|p| record(p, ChangeType::Deleted))
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => event
            .paths
            .iter()
            .map(|p| record(p, ChangeType::Created))
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut records = Vec::new();
            if let Some(from) = event.paths.first() {
                records.push(record(from, ChangeType::Deleted));
            }
            if let Some(to) = event.paths.get(1) {
                records.push(record(to, ChangeType::Created));
            }
            records
        }
        EventKind::Modify(ModifyKind::Metadata(_)) => Vec::new(),
        EventKind::Modify(_) | EventKind::Any => event
            .paths
            .iter()
            .map(|p| record(p, ChangeType::Modified))
            .collect(),
        EventKind::Access(_) | EventKind::Other => Vec::new(),
    }
}

async fn poll_loop(
    tx: mpsc::UnboundedSender<ChangeBatch>,
    observed: SharedObserved,
    interval: Duration,
    wake: Arc<Notify>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = wake.notified() => {}
        }
        if tx.is_closed() {
            break;
        }

        let roots: Vec<(PathBuf, bool)> = {
            let observed = observed.read().unwrap_or_else(PoisonError::into_inner);
            observed
                .roots
                .iter()
                .map(|(path, root)| (path.clone(), root.is_dir))
                .collect()
        };
        if roots.is_empty() {
            continue;
        }

        let scanned = match tokio::task::spawn_blocking(move || {
            roots
                .into_iter()
                .map(|(path, is_dir)| {
                    let snapshot = scan(&path, is_dir);
                    (path, snapshot)
                })
                .collect::<Vec<_>>()
        })
        .await
        {
            Ok(scanned) => scanned,
            Err(e) => {
                warn!("Poll scan failed: {}", e);
                continue;
            }
        };

        let mut batch = ChangeBatch::new();
        {
            let mut observed = observed.write().unwrap_or_else(PoisonError::into_inner);
            for (path, snapshot) in scanned {
                // Unobserved while the scan ran.
                let Some(root) = observed.roots.get_mut(&path) else {
                    continue;
                };
                diff_snapshots(&root.snapshot, &snapshot, &mut batch);
                root.snapshot = snapshot;
            }
        }

        if !batch.is_empty() {
            batch.sort_by(|a, b| a.path.cmp(&b.path));
            if tx.send(batch).is_err() {
                break;
            }
        }
    }
}

/// Fingerprint `path`, walking the whole tree when it is a directory.
fn scan(path: &Path, is_dir: bool) -> Snapshot {
    let mut snapshot = Snapshot::new();
    if !is_dir {
        if let Ok(meta) = std::fs::metadata(path) {
            snapshot.insert(path.to_path_buf(), fingerprint(&meta));
        }
        return snapshot;
    }

    let mut stack = vec![path.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if meta.is_dir() {
                stack.push(entry.path());
            } else {
                snapshot.insert(entry.path(), fingerprint(&meta));
            }
        }
    }
    snapshot
}

fn fingerprint(meta: &std::fs::Metadata) -> Fingerprint {
    Fingerprint {
        mtime: meta.modified().ok(),
        len: meta.len(),
    }
}

fn diff_snapshots(old: &Snapshot, new: &Snapshot, batch: &mut ChangeBatch) {
    let detected_at = Utc::now();
    for (path, fp) in new {
        let change_type = match old.get(path) {
            None => ChangeType::Created,
            Some(prev) if prev != fp => ChangeType::Modified,
            Some(_) => continue,
        };
        batch.push(ChangeRecord {
            path: path.clone(),
            change_type,
            detected_at,
        });
    }
    for path in old.keys().filter(|p| !new.contains_key(*p)) {
        batch.push(ChangeRecord {
            path: path.clone(),
            change_type: ChangeType::Deleted,
            detected_at,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, RemoveKind};

    fn fp(len: u64) -> Fingerprint {
        Fingerprint { mtime: None, len }
    }

    #[test]
    fn test_diff_snapshots() {
        let old: Snapshot = [
            (PathBuf::from("a"), fp(1)),
            (PathBuf::from("b"), fp(2)),
            (PathBuf::from("c"), fp(3)),
        ]
        .into_iter()
        .collect();
        let new: Snapshot = [
            (PathBuf::from("a"), fp(1)),
            (PathBuf::from("b"), fp(5)),
            (PathBuf::from("d"), fp(4)),
        ]
        .into_iter()
        .collect();

        let mut batch = Vec::new();
        diff_snapshots(&old, &new, &mut batch);
        batch.sort_by(|a, b| a.path.cmp(&b.path));
        let kinds: Vec<_> = batch
            .iter()
            .map(|r| (r.path.to_str().unwrap(), r.change_type))
            .collect();
        assert_eq!(
            kinds,
            vec![
                ("b", ChangeType::Modified),
                ("c", ChangeType::Deleted),
                ("d", ChangeType::Created),
            ]
        );
    }

    #[test]
    fn test_normalize_event_kinds() {
        let path = PathBuf::from("/tmp/x.txt");
        let created = normalize_event(
            Event::new(EventKind::Create(CreateKind::File)).add_path(path.clone()),
        );
        assert_eq!(created[0].change_type, ChangeType::Created);

        let modified = normalize_event(
            Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content)))
                .add_path(path.clone()),
        );
        assert_eq!(modified[0].change_type, ChangeType::Modified);

        let removed = normalize_event(
            Event::new(EventKind::Remove(RemoveKind::File)).add_path(path.clone()),
        );
        assert_eq!(removed[0].change_type, ChangeType::Deleted);

        let renamed = normalize_event(
            Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
                .add_path(PathBuf::from("/tmp/old"))
                .add_path(PathBuf::from("/tmp/new")),
        );
        assert_eq!(renamed.len(), 2);
        assert_eq!(renamed[0].change_type, ChangeType::Deleted);
        assert_eq!(renamed[1].change_type, ChangeType::Created);

        let accessed = normalize_event(
            Event::new(EventKind::Access(notify::event::AccessKind::Any)).add_path(path),
        );
        assert!(accessed.is_empty());
    }

    #[test]
    fn test_observed_set_maps_to_caller_paths() {
        let mut set = ObservedSet::default();
        set.roots.insert(
            PathBuf::from("/w/file.txt"),
            ObservedRoot {
                is_dir: false,
                watch_path: PathBuf::from("/w/file.txt"),
                snapshot: Snapshot::new(),
            },
        );
        set.roots.insert(
            PathBuf::from("rel.txt"),
            ObservedRoot {
                is_dir: false,
                watch_path: PathBuf::from("/cwd/rel.txt"),
                snapshot: Snapshot::new(),
            },
        );
        set.roots.insert(
            PathBuf::from("docs"),
            ObservedRoot {
                is_dir: true,
                watch_path: PathBuf::from("/cwd/docs"),
                snapshot: Snapshot::new(),
            },
        );
        assert_eq!(
            set.map_to_key(Path::new("/w/file.txt")),
            Some(PathBuf::from("/w/file.txt"))
        );
        assert_eq!(
            set.map_to_key(Path::new("/cwd/rel.txt")),
            Some(PathBuf::from("rel.txt"))
        );
        assert_eq!(
            set.map_to_key(Path::new("/cwd/docs/nested/deep.txt")),
            Some(PathBuf::from("docs/nested/deep.txt"))
        );
        assert_eq!(set.map_to_key(Path::new("/w/other.txt")), None);
        assert_eq!(set.map_to_key(Path::new("/cwd/rel.txt.swp")), None);
    }

    #[test]
    fn test_watch_target_is_absolute_parent() {
        let root = ObservedRoot {
            is_dir: false,
            watch_path: resolve_watch_path(Path::new("some-file-that-does-not-exist.txt")),
            snapshot: Snapshot::new(),
        };
        let target = watch_target(&root);
        assert!(target.is_absolute());
        assert_eq!(target, std::env::current_dir().unwrap());
    }

    #[test]
    fn test_capabilities_wire_shape() {
        let caps = ObserverCapabilities {
            kind: ObserverKind::Polling,
            latency_ms: 1000,
            supports_recursive: false,
            poll_interval_ms: Some(1000),
        };
        let json = serde_json::to_value(caps).unwrap();
        assert_eq!(json["type"], "polling");
        assert_eq!(json["latencyMs"], 1000);
        assert_eq!(json["pollIntervalMs"], 1000);
    }
}
