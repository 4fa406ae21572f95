//! Self-write suppression.
//!
//! Before writing a file itself, the tracker asks for a [`WriteToken`]. When
//! the change notification for that write comes back, [`WriteTokenManager::match_token`]
//! finds and consumes the token, so the echo is not mistaken for an external
//! edit. Tokens are single-use, one per path, and expire after a short window.
//! An expired or missing token makes a change look external, which is the
//! safe direction to be wrong in.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// Default lifetime of an unmatched token.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteToken {
    pub id: String,
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    /// Observed mtimes older than this cannot belong to our write.
    ///
    /// This is `created_at` minus the manager's mtime tolerance, not
    /// `created_at` itself: filesystem timestamps come from a coarser clock
    /// and can land slightly before the moment the token was issued. With a
    /// zero tolerance the two are equal.
    pub expected_mtime_min: DateTime<Utc>,
}

/// Notice sent when a token expires without being matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredToken {
    pub token: WriteToken,
}

#[derive(Debug)]
struct PendingToken {
    token: WriteToken,
    issued: Instant,
    timer: JoinHandle<()>,
}

type TokenMap = Arc<Mutex<HashMap<PathBuf, PendingToken>>>;

pub struct WriteTokenManager {
    tokens: TokenMap,
    ttl: Duration,
    /// Slack subtracted from the issue time to absorb coarse filesystem clocks.
    mtime_tolerance: Duration,
    expired_tx: Option<mpsc::UnboundedSender<ExpiredToken>>,
}

impl WriteTokenManager {
    pub fn new(ttl: Duration) -> Self {
        Self {
            tokens: Arc::new(Mutex::new(HashMap::new())),
            ttl,
            mtime_tolerance: Duration::ZERO,
            expired_tx: None,
        }
    }

    pub fn with_mtime_tolerance(mut self, tolerance: Duration) -> Self {
        self.mtime_tolerance = tolerance;
        self
    }

    /// Report expired tokens on `tx`.
    pub fn with_expiry_notifications(mut self, tx: mpsc::UnboundedSender<ExpiredToken>) -> Self {
        self.expired_tx = Some(tx);
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Issue a token for `path`, replacing any pending one.
    ///
    /// The token is registered before this returns, so a write issued
    /// afterwards can always be matched.
    pub async fn generate_token(&self, path: &Path) -> WriteToken {
        let now = Utc::now();
        let tolerance =
            chrono::Duration::from_std(self.mtime_tolerance).unwrap_or(chrono::Duration::zero());
        let token = WriteToken {
            id: uuid::Uuid::new_v4().to_string(),
            path: path.to_path_buf(),
            created_at: now,
            expected_mtime_min: now - tolerance,
        };

        // Held while spawning so the timer cannot look before the insert.
        let mut tokens = self.tokens.lock().await;
        let timer = tokio::spawn(expire_after(
            Arc::clone(&self.tokens),
            token.path.clone(),
            token.id.clone(),
            self.ttl,
            self.expired_tx.clone(),
        ));
        if let Some(previous) = tokens.insert(
            token.path.clone(),
            PendingToken {
                token: token.clone(),
                issued: Instant::now(),
                timer,
            },
        ) {
            previous.timer.abort();
            debug!(
                "Replaced pending write token {} for {}",
                previous.token.id,
                path.display()
            );
        }

        token
    }

    /// Consume the pending token for `path` if `observed_mtime` could be our write.
    pub async fn match_token(
        &self,
        path: &Path,
        observed_mtime: DateTime<Utc>,
    ) -> Option<WriteToken> {
        let mut tokens = self.tokens.lock().await;
        let pending = tokens.get(path)?;

        if pending.issued.elapsed() >= self.ttl {
            // Timer has not run yet; the token is already dead. Report it
            // the same way the timer would have.
            if let Some(dead) = tokens.remove(path) {
                dead.timer.abort();
                debug!("Write token {} for {} expired", dead.token.id, path.display());
                if let Some(tx) = &self.expired_tx {
                    let _ = tx.send(ExpiredToken { token: dead.token });
                }
            }
            return None;
        }
        if observed_mtime < pending.token.expected_mtime_min {
            debug!(
                "mtime {} predates write token for {}, not an echo",
                observed_mtime,
                path.display()
            );
            return None;
        }

        let matched = tokens.remove(path)?;
        matched.timer.abort();
        Some(matched.token)
    }

    /// Whether a live token is pending for `path`.
    pub async fn has_pending(&self, path: &Path) -> bool {
        let tokens = self.tokens.lock().await;
        tokens
            .get(path)
            .is_some_and(|pending| pending.issued.elapsed() < self.ttl)
    }

    pub async fn clear_token(&self, path: &Path) {
        if let Some(pending) = self.tokens.lock().await.remove(path) {
            pending.timer.abort();
        }
    }

    /// Drop every token and cancel every timer.
    pub async fn dispose(&self) {
        let mut tokens = self.tokens.lock().await;
        for (_, pending) in tokens.drain() {
            pending.timer.abort();
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.tokens.lock().await.len()
    }
}

impl Default for WriteTokenManager {
    fn default() -> Self {
        Self::new(DEFAULT_TOKEN_TTL)
    }
}

impl Drop for WriteTokenManager {
    fn drop(&mut self) {
        if let Ok(mut tokens) = self.tokens.try_lock() {
            for (_, pending) in tokens.drain() {
                pending.timer.abort();
            }
        }
    }
}

async fn expire_after(
    tokens: TokenMap,
    path: PathBuf,
    id: String,
    ttl: Duration,
    expired_tx: Option<mpsc::UnboundedSender<ExpiredToken>>,
) {
    tokio::time::sleep(ttl).await;
    let mut tokens = tokens.lock().await;
    if tokens.get(&path).is_some_and(|p| p.token.id == id) {
        if let Some(pending) = tokens.remove(&path) {
            debug!("Write token {} for {} expired", id, path.display());
            if let Some(tx) = expired_tx {
                let _ = tx.send(ExpiredToken {
                    token: pending.token,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path() -> PathBuf {
        PathBuf::from("notes/a.txt")
    }

    #[tokio::test]
    async fn test_match_consumes_token() {
        let manager = WriteTokenManager::default();
        let token = manager.generate_token(&path()).await;

        let matched = manager
            .match_token(&path(), token.expected_mtime_min)
            .await
            .expect("token should match");
        assert_eq!(matched.id, token.id);
        assert!(manager
            .match_token(&path(), token.expected_mtime_min)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_old_mtime_is_not_suppressed() {
        let manager = WriteTokenManager::default();
        let token = manager.generate_token(&path()).await;
        let before = token.expected_mtime_min - chrono::Duration::seconds(10);
        assert!(manager.match_token(&path(), before).await.is_none());
        // The token survives a mismatched lookup.
        assert!(manager.has_pending(&path()).await);
    }

    #[tokio::test]
    async fn test_no_token_for_other_path() {
        let manager = WriteTokenManager::default();
        manager.generate_token(&path()).await;
        assert!(manager
            .match_token(Path::new("other.txt"), Utc::now())
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_new_token_replaces_previous() {
        let manager = WriteTokenManager::default();
        let first = manager.generate_token(&path()).await;
        let second = manager.generate_token(&path()).await;
        assert_ne!(first.id, second.id);
        assert_eq!(manager.pending_count().await, 1);
        let matched = manager.match_token(&path(), Utc::now()).await.unwrap();
        assert_eq!(matched.id, second.id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_expires() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let manager =
            WriteTokenManager::new(Duration::from_secs(2)).with_expiry_notifications(tx);
        let token = manager.generate_token(&path()).await;

        tokio::time::sleep(Duration::from_millis(2100)).await;

        let expired = rx.recv().await.unwrap();
        assert_eq!(expired.token.id, token.id);
        assert_eq!(manager.pending_count().await, 0);
        assert!(manager.match_token(&path(), Utc::now()).await.is_none());
    }

    #[tokio::test]
    async fn test_dead_token_found_by_match_is_reported() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let manager =
            WriteTokenManager::new(Duration::from_secs(1)).with_expiry_notifications(tx);
        let token = manager.generate_token(&path()).await;

        // Past its lifetime, but the timer has not had a chance to run.
        {
            let mut tokens = manager.tokens.lock().await;
            let pending = tokens.get_mut(&path()).unwrap();
            pending.issued -= Duration::from_secs(1);
        }

        assert!(manager.match_token(&path(), Utc::now()).await.is_none());
        let expired = rx.try_recv().unwrap();
        assert_eq!(expired.token.id, token.id);
        assert_eq!(manager.pending_count().await, 0);

        // The aborted timer does not report it a second time.
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_expected_mtime_min_includes_tolerance() {
        let manager = WriteTokenManager::default().with_mtime_tolerance(Duration::from_millis(25));
        let token = manager.generate_token(&path()).await;
        assert_eq!(
            token.created_at - token.expected_mtime_min,
            chrono::Duration::milliseconds(25)
        );

        let exact = WriteTokenManager::default();
        let token = exact.generate_token(&path()).await;
        assert_eq!(token.created_at, token.expected_mtime_min);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_cancels_timers() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let manager =
            WriteTokenManager::new(Duration::from_secs(1)).with_expiry_notifications(tx);
        manager.generate_token(&path()).await;
        manager.generate_token(Path::new("b.txt")).await;
        manager.dispose().await;
        assert_eq!(manager.pending_count().await, 0);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_tolerance_accepts_slightly_older_mtime() {
        let manager = WriteTokenManager::default().with_mtime_tolerance(Duration::from_millis(50));
        let token = manager.generate_token(&path()).await;
        let slightly_before = token.created_at - chrono::Duration::milliseconds(20);
        assert!(manager.match_token(&path(), slightly_before).await.is_some());
    }
}
