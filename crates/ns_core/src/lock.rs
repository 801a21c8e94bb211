use crate::hashing::blake3_hex_prefixed;
use crate::types::WsName;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

/// Result of running an operation under the workspace lock. When the lock was
/// busy the operation never ran and `result` is `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockOutcome<T> {
    pub lock_acquired: bool,
    pub result: Option<T>,
}

/// Per-workspace mutual exclusion for sync, discard, manual resolve and
/// optimize. Entries exist only while held.
#[derive(Debug, Default)]
pub struct SyncLocks {
    held: Mutex<HashMap<String, String>>,
    seq: AtomicU64,
}

/// Proof of holding the lock for one workspace. Dropping it releases the
/// lock, including when the owning future is dropped mid-operation.
#[derive(Debug)]
pub struct SyncLockGuard<'a> {
    locks: &'a SyncLocks,
    ws_name: WsName,
    token: String,
}

impl SyncLockGuard<'_> {
    pub fn ws_name(&self) -> &WsName {
        &self.ws_name
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

impl Drop for SyncLockGuard<'_> {
    fn drop(&mut self) {
        let mut held = match self.locks.held.lock() {
            Ok(held) => held,
            Err(poisoned) => poisoned.into_inner(),
        };
        if held.get(self.ws_name.as_str()) == Some(&self.token) {
            held.remove(self.ws_name.as_str());
            tracing::debug!(ws = %self.ws_name, "released sync lock");
        }
    }
}

fn lock_token_for(ws_name: &WsName, seq: u64, acquired_at_ms: i64) -> String {
    blake3_hex_prefixed(
        format!("ns.sync.lock.v1\n{}\n{}\n{}", ws_name.as_str(), seq, acquired_at_ms).as_bytes(),
    )
}

fn unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

impl SyncLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn global() -> &'static SyncLocks {
        static LOCKS: OnceLock<SyncLocks> = OnceLock::new();
        LOCKS.get_or_init(SyncLocks::new)
    }

    pub fn try_acquire(&self, ws_name: &WsName) -> Option<SyncLockGuard<'_>> {
        let mut held = match self.held.lock() {
            Ok(held) => held,
            Err(poisoned) => poisoned.into_inner(),
        };
        if held.contains_key(ws_name.as_str()) {
            tracing::debug!(ws = %ws_name, "sync lock busy");
            return None;
        }
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let token = lock_token_for(ws_name, seq, unix_ms());
        held.insert(ws_name.as_str().to_string(), token.clone());
        tracing::debug!(ws = %ws_name, %token, "acquired sync lock");
        Some(SyncLockGuard {
            locks: self,
            ws_name: ws_name.clone(),
            token,
        })
    }

    pub fn is_locked(&self, ws_name: &WsName) -> bool {
        match self.held.lock() {
            Ok(held) => held.contains_key(ws_name.as_str()),
            Err(poisoned) => poisoned.into_inner().contains_key(ws_name.as_str()),
        }
    }

    /// Runs `operation` while holding the lock for `ws_name`. Returns
    /// immediately without running it when the lock is already held.
    pub async fn with_lock<T, F, Fut>(&self, ws_name: &WsName, operation: F) -> LockOutcome<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let Some(_guard) = self.try_acquire(ws_name) else {
            return LockOutcome {
                lock_acquired: false,
                result: None,
            };
        };
        let result = operation().await;
        LockOutcome {
            lock_acquired: true,
            result: Some(result),
        }
    }
}
