//! Cooperative cancellation: process-wide registry of per-task tokens.
//!
//! Tokens never interrupt an operation by force. Every long-running agent or
//! tool accepts the token and is expected to release resources promptly once
//! it fires; `race_with_abort` is the standard way to observe it.

use crate::{MaestroError, Result};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::debug;

#[derive(Debug)]
struct TokenInner {
    aborted: AtomicBool,
    reason: Mutex<Option<String>>,
    tx: watch::Sender<bool>,
}

/// Shared abort flag with a "listen for abort" capability.
#[derive(Debug, Clone)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            inner: Arc::new(TokenInner {
                aborted: AtomicBool::new(false),
                reason: Mutex::new(None),
                tx,
            }),
        }
    }

    /// Marks the token aborted. Idempotent: the first reason wins.
    pub fn abort(&self, reason: impl Into<String>) {
        if self.inner.aborted.swap(true, Ordering::SeqCst) {
            return;
        }
        let reason = reason.into();
        {
            let mut slot = self.inner.reason.lock().expect("reason lock poisoned");
            *slot = Some(reason);
        }
        let _ = self.inner.tx.send(true);
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<String> {
        self.inner.reason.lock().expect("reason lock poisoned").clone()
    }

    /// Resolves once the token fires, yielding the abort reason.
    pub async fn aborted(&self) -> String {
        let mut rx = self.inner.tx.subscribe();
        while !*rx.borrow() {
            // The sender lives inside our own Arc, so changed() cannot fail
            // while this token is alive.
            if rx.changed().await.is_err() {
                futures::future::pending::<()>().await;
            }
        }
        self.reason().unwrap_or_else(|| "aborted".to_string())
    }

    /// Creates a token that fires when this one fires.
    pub fn child(&self) -> CancelToken {
        let child = CancelToken::new();
        let parent = self.clone();
        let linked = child.clone();
        tokio::spawn(async move {
            let reason = parent.aborted().await;
            linked.abort(reason);
        });
        if self.is_aborted() {
            child.abort(self.reason().unwrap_or_else(|| "aborted".to_string()));
        }
        child
    }

    /// Creates a token that fires when this one fires or after `timeout`,
    /// whichever comes first. The timeout path aborts with `timeout_reason`.
    pub fn child_with_timeout(&self, timeout: Duration, timeout_reason: &str) -> CancelToken {
        let child = self.child();
        let linked = child.clone();
        let reason = timeout_reason.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            linked.abort(reason);
        });
        child
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Fails immediately with `ABORTED` when the token has already fired.
pub fn throw_if_aborted(token: &CancelToken) -> Result<()> {
    if token.is_aborted() {
        return Err(MaestroError::aborted(
            token.reason().unwrap_or_else(|| "aborted".to_string()),
        ));
    }
    Ok(())
}

/// Races `op` against the token. The losing operation is not interrupted;
/// callers must thread the token into any I/O they initiate.
pub async fn race_with_abort<T, F>(token: &CancelToken, op: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    throw_if_aborted(token)?;
    tokio::select! {
        reason = token.aborted() => Err(MaestroError::aborted(reason)),
        result = op => result,
    }
}

/// Process-wide mapping from task id to cancellation token.
#[derive(Clone)]
pub struct CancellationRegistry {
    tokens: Arc<RwLock<HashMap<String, CancelToken>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self {
            tokens: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Returns the token for `task_id`, creating one lazily.
    ///
    /// A retry that reuses a task id must not inherit an already-aborted
    /// token: when the stored token has fired it is replaced with a fresh one.
    pub async fn get_or_create(&self, task_id: &str) -> CancelToken {
        let mut tokens = self.tokens.write().await;
        match tokens.get(task_id) {
            Some(token) if !token.is_aborted() => token.clone(),
            _ => {
                let token = CancelToken::new();
                tokens.insert(task_id.to_string(), token.clone());
                debug!("Created cancellation token for task {}", task_id);
                token
            }
        }
    }

    pub async fn get(&self, task_id: &str) -> Option<CancelToken> {
        let tokens = self.tokens.read().await;
        tokens.get(task_id).cloned()
    }

    /// Aborts the token bound to `task_id`. Returns whether a token existed.
    /// Aborting twice is a no-op.
    pub async fn abort(&self, task_id: &str, reason: &str) -> bool {
        let tokens = self.tokens.read().await;
        match tokens.get(task_id) {
            Some(token) => {
                token.abort(reason);
                debug!("Aborted task {}: {}", task_id, reason);
                true
            }
            None => false,
        }
    }

    /// Drops the token once the task reached a terminal state.
    pub async fn cleanup(&self, task_id: &str) {
        let mut tokens = self.tokens.write().await;
        tokens.remove(task_id);
    }

    /// Aborts every live token. Used on shutdown.
    pub async fn abort_all(&self, reason: &str) {
        let tokens = self.tokens.read().await;
        for token in tokens.values() {
            token.abort(reason);
        }
    }

    pub async fn len(&self) -> usize {
        self.tokens.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tokens.read().await.is_empty()
    }
}

impl Default for CancellationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn abort_is_idempotent_and_first_reason_wins() {
        let token = CancelToken::new();
        token.abort("first");
        token.abort("second");
        assert!(token.is_aborted());
        assert_eq!(token.reason().as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn race_returns_aborted_error_with_reason() {
        let token = CancelToken::new();
        let racer = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            racer.abort("cancelled by user");
        });

        let result: Result<()> = race_with_abort(&token, async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        let err = result.unwrap_err();
        assert!(err.is_aborted());
        assert!(err.to_string().to_lowercase().contains("cancel"));
    }

    #[tokio::test]
    async fn race_lets_fast_operations_win() {
        let token = CancelToken::new();
        let result = race_with_abort(&token, async { Ok(42) }).await.unwrap();
        assert_eq!(result, 42);
    }

    #[tokio::test]
    async fn get_or_create_replaces_aborted_tokens() {
        let registry = CancellationRegistry::new();
        let token = registry.get_or_create("task-1").await;
        token.abort("stopped");

        let fresh = registry.get_or_create("task-1").await;
        assert!(!fresh.is_aborted());
    }

    #[tokio::test]
    async fn child_fires_with_parent() {
        let parent = CancelToken::new();
        let child = parent.child();
        parent.abort("parent gone");
        // The link task needs a scheduling tick.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(child.is_aborted());
        assert_eq!(child.reason().as_deref(), Some("parent gone"));
    }

    #[tokio::test]
    async fn child_with_timeout_fires_on_deadline() {
        let parent = CancelToken::new();
        let child = parent.child_with_timeout(Duration::from_millis(20), "Task timeout exceeded");
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(child.is_aborted());
        assert_eq!(child.reason().as_deref(), Some("Task timeout exceeded"));
        assert!(!parent.is_aborted());
    }

    #[tokio::test]
    async fn abort_on_unknown_task_is_a_noop() {
        let registry = CancellationRegistry::new();
        assert!(!registry.abort("ghost", "reason").await);
    }

    #[tokio::test]
    async fn cleanup_removes_token() {
        let registry = CancellationRegistry::new();
        registry.get_or_create("task-2").await;
        assert_eq!(registry.len().await, 1);
        registry.cleanup("task-2").await;
        assert!(registry.is_empty().await);
    }
}
