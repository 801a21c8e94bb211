use crate::app_error::{AppError, AppResult, ErrorCode};
use crate::hashing::git_blob_sha;
use crate::remote::{with_cancel, RemoteChange, RemoteRepo, RemoteTree};
use crate::types::WsPath;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteCall {
    FetchTree,
    FetchBlob,
    UploadBlob,
    Commit,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryRepoStats {
    pub fetch_tree: usize,
    pub fetch_blob: usize,
    pub upload_blob: usize,
    pub commit: usize,
}

#[derive(Default)]
struct MemoryRepoState {
    files: BTreeMap<WsPath, String>,
    blobs: HashMap<String, Vec<u8>>,
    commit_seq: u64,
    stats: MemoryRepoStats,
    failures: HashMap<RemoteCall, ErrorCode>,
    move_before_commit: usize,
}

impl MemoryRepoState {
    fn head(&self) -> String {
        format!("{:040x}", self.commit_seq)
    }

    fn tree(&self) -> RemoteTree {
        RemoteTree {
            commit_sha: self.head(),
            tree_sha: format!("{:040x}", self.commit_seq + (1 << 32)),
            files: self.files.clone(),
        }
    }

    fn take_failure(&mut self, call: RemoteCall) -> AppResult<()> {
        match self.failures.remove(&call) {
            Some(code) => Err(AppError::new(
                code,
                "injected remote failure",
                serde_json::json!({ "call": format!("{:?}", call) }),
            )),
            None => Ok(()),
        }
    }
}

/// A branch held in memory, standing in for a GitHub repository in tests.
#[derive(Default)]
pub struct MemoryRepo {
    state: Mutex<MemoryRepoState>,
}

impl MemoryRepo {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> AppResult<std::sync::MutexGuard<'_, MemoryRepoState>> {
        self.state
            .lock()
            .map_err(|_| AppError::internal("memory repo state lock poisoned"))
    }

    /// Commits `bytes` at `ws_path` as if pushed by another client.
    pub fn set_file(&self, ws_path: &WsPath, bytes: &[u8]) -> AppResult<String> {
        let mut state = self.state()?;
        let sha = git_blob_sha(bytes);
        state.blobs.insert(sha.clone(), bytes.to_vec());
        state.files.insert(ws_path.clone(), sha.clone());
        state.commit_seq += 1;
        Ok(sha)
    }

    pub fn remove_file(&self, ws_path: &WsPath) -> AppResult<()> {
        let mut state = self.state()?;
        state.files.remove(ws_path);
        state.commit_seq += 1;
        Ok(())
    }

    pub fn file(&self, ws_path: &WsPath) -> AppResult<Option<Vec<u8>>> {
        let state = self.state()?;
        Ok(state
            .files
            .get(ws_path)
            .and_then(|sha| state.blobs.get(sha))
            .cloned())
    }

    pub fn head(&self) -> AppResult<String> {
        Ok(self.state()?.head())
    }

    pub fn stats(&self) -> AppResult<MemoryRepoStats> {
        Ok(self.state()?.stats.clone())
    }

    /// The next `call` fails with `code`.
    pub fn fail_next(&self, call: RemoteCall, code: ErrorCode) -> AppResult<()> {
        self.state()?.failures.insert(call, code);
        Ok(())
    }

    /// The next `times` commits find the branch advanced by someone else.
    pub fn move_head_before_commit(&self, times: usize) -> AppResult<()> {
        self.state()?.move_before_commit = times;
        Ok(())
    }
}

#[async_trait]
impl RemoteRepo for MemoryRepo {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    async fn fetch_tree(&self, cancel: &CancellationToken) -> AppResult<RemoteTree> {
        with_cancel(cancel, "fetch_tree", async {
            let mut state = self.state()?;
            state.stats.fetch_tree += 1;
            state.take_failure(RemoteCall::FetchTree)?;
            Ok(state.tree())
        })
        .await
    }

    async fn fetch_blob(&self, blob_sha: &str, cancel: &CancellationToken) -> AppResult<Vec<u8>> {
        with_cancel(cancel, "fetch_blob", async {
            let mut state = self.state()?;
            state.stats.fetch_blob += 1;
            state.take_failure(RemoteCall::FetchBlob)?;
            state.blobs.get(blob_sha).cloned().ok_or_else(|| {
                AppError::new(
                    ErrorCode::RemoteNotFound,
                    "blob not found",
                    serde_json::json!({ "sha": blob_sha }),
                )
            })
        })
        .await
    }

    async fn upload_blob(&self, bytes: &[u8], cancel: &CancellationToken) -> AppResult<String> {
        with_cancel(cancel, "upload_blob", async {
            let mut state = self.state()?;
            state.stats.upload_blob += 1;
            state.take_failure(RemoteCall::UploadBlob)?;
            let sha = git_blob_sha(bytes);
            state.blobs.insert(sha.clone(), bytes.to_vec());
            Ok(sha)
        })
        .await
    }

    async fn commit_changes(
        &self,
        base: &RemoteTree,
        changes: &[RemoteChange],
        _message: &str,
        cancel: &CancellationToken,
    ) -> AppResult<String> {
        with_cancel(cancel, "commit_changes", async {
            let mut state = self.state()?;
            state.stats.commit += 1;
            state.take_failure(RemoteCall::Commit)?;
            if state.move_before_commit > 0 {
                state.move_before_commit -= 1;
                state.commit_seq += 1;
            }
            if state.head() != base.commit_sha {
                return Err(AppError::new(
                    ErrorCode::RemoteMoved,
                    "branch moved since the tree was fetched",
                    serde_json::json!({ "expected": base.commit_sha, "actual": state.head() }),
                ));
            }
            for change in changes {
                match change {
                    RemoteChange::Upsert { ws_path, blob_sha } => {
                        if !state.blobs.contains_key(blob_sha) {
                            return Err(AppError::new(
                                ErrorCode::InvalidRemoteResponse,
                                "commit references an unknown blob",
                                serde_json::json!({ "ws_path": ws_path, "sha": blob_sha }),
                            ));
                        }
                        state.files.insert(ws_path.clone(), blob_sha.clone());
                    }
                    RemoteChange::Delete { ws_path } => {
                        state.files.remove(ws_path);
                    }
                }
            }
            state.commit_seq += 1;
            Ok(state.head())
        })
        .await
    }
}
