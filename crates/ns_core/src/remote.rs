use crate::app_error::{AppError, AppResult, ErrorCode};
use crate::hashing::git_blob_sha;
use crate::types::WsPath;
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Upper bound on simultaneous blob transfers within one pass.
pub const MAX_TRANSFER_CONCURRENCY: usize = 10;

/// Read-only snapshot of the remote branch: head commit, root tree and the
/// blob sha of every tracked file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTree {
    pub commit_sha: String,
    pub tree_sha: String,
    pub files: BTreeMap<WsPath, String>,
}

impl RemoteTree {
    pub fn sha_for(&self, ws_path: &WsPath) -> Option<&str> {
        self.files.get(ws_path).map(String::as_str)
    }

    pub fn contains(&self, ws_path: &WsPath) -> bool {
        self.files.contains_key(ws_path)
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RemoteChange {
    Upsert { ws_path: WsPath, blob_sha: String },
    Delete { ws_path: WsPath },
}

impl RemoteChange {
    pub fn ws_path(&self) -> &WsPath {
        match self {
            RemoteChange::Upsert { ws_path, .. } | RemoteChange::Delete { ws_path } => ws_path,
        }
    }
}

/// The remote side of a workspace. Every call takes the cancellation token and
/// must return `NS_ABORTED` once it fires, without issuing further requests.
#[async_trait]
pub trait RemoteRepo: Send + Sync {
    fn describe(&self) -> String;

    async fn fetch_tree(&self, cancel: &CancellationToken) -> AppResult<RemoteTree>;

    async fn fetch_blob(&self, blob_sha: &str, cancel: &CancellationToken) -> AppResult<Vec<u8>>;

    /// Stores `bytes` as a blob and returns its sha.
    async fn upload_blob(&self, bytes: &[u8], cancel: &CancellationToken) -> AppResult<String>;

    /// Writes one commit applying `changes` on top of `base` and moves the
    /// branch to it. Fails with `NS_SYNC_REMOTE_MOVED` when the branch no
    /// longer points at `base.commit_sha`.
    async fn commit_changes(
        &self,
        base: &RemoteTree,
        changes: &[RemoteChange],
        message: &str,
        cancel: &CancellationToken,
    ) -> AppResult<String>;
}

#[async_trait]
impl<T: RemoteRepo + ?Sized> RemoteRepo for Arc<T> {
    fn describe(&self) -> String {
        (**self).describe()
    }

    async fn fetch_tree(&self, cancel: &CancellationToken) -> AppResult<RemoteTree> {
        (**self).fetch_tree(cancel).await
    }

    async fn fetch_blob(&self, blob_sha: &str, cancel: &CancellationToken) -> AppResult<Vec<u8>> {
        (**self).fetch_blob(blob_sha, cancel).await
    }

    async fn upload_blob(&self, bytes: &[u8], cancel: &CancellationToken) -> AppResult<String> {
        (**self).upload_blob(bytes, cancel).await
    }

    async fn commit_changes(
        &self,
        base: &RemoteTree,
        changes: &[RemoteChange],
        message: &str,
        cancel: &CancellationToken,
    ) -> AppResult<String> {
        (**self).commit_changes(base, changes, message, cancel).await
    }
}

/// Races `fut` against `cancel`.
pub async fn with_cancel<T, F>(cancel: &CancellationToken, operation: &str, fut: F) -> AppResult<T>
where
    F: Future<Output = AppResult<T>>,
{
    if cancel.is_cancelled() {
        return Err(AppError::aborted(operation));
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(AppError::aborted(operation)),
        out = fut => out,
    }
}

pub fn verify_blob(ws_path: &WsPath, expected_sha: &str, bytes: &[u8]) -> AppResult<()> {
    let actual = git_blob_sha(bytes);
    if actual != expected_sha {
        return Err(AppError::new(
            ErrorCode::InvalidRemoteResponse,
            "remote blob content does not match its sha",
            serde_json::json!({
                "ws_path": ws_path,
                "expected": expected_sha,
                "actual": actual
            }),
        ));
    }
    Ok(())
}

/// Downloads `(ws_path, sha)` pairs with at most `MAX_TRANSFER_CONCURRENCY`
/// requests in flight and checks every blob against its sha.
pub async fn fetch_verified_blobs(
    remote: &dyn RemoteRepo,
    wanted: Vec<(WsPath, String)>,
    cancel: &CancellationToken,
) -> AppResult<Vec<(WsPath, String, Vec<u8>)>> {
    let results: Vec<AppResult<(WsPath, String, Vec<u8>)>> = futures::stream::iter(wanted)
        .map(|(ws_path, sha)| async move {
            let bytes = remote.fetch_blob(&sha, cancel).await?;
            verify_blob(&ws_path, &sha, &bytes)?;
            Ok((ws_path, sha, bytes))
        })
        .buffer_unordered(MAX_TRANSFER_CONCURRENCY)
        .collect()
        .await;

    let mut out = Vec::with_capacity(results.len());
    for result in results {
        out.push(result?);
    }
    out.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(out)
}

/// Uploads local contents with the same bound. The sha returned by the
/// remote must match the locally computed one.
pub async fn upload_blobs(
    remote: &dyn RemoteRepo,
    pending: Vec<(WsPath, String, &[u8])>,
    cancel: &CancellationToken,
) -> AppResult<()> {
    let results: Vec<AppResult<()>> = futures::stream::iter(pending)
        .map(|(ws_path, local_sha, bytes)| async move {
            let sha = remote.upload_blob(bytes, cancel).await?;
            if sha != local_sha {
                return Err(AppError::new(
                    ErrorCode::InvalidRemoteResponse,
                    "remote assigned an unexpected blob sha",
                    serde_json::json!({ "ws_path": ws_path, "expected": local_sha, "actual": sha }),
                ));
            }
            Ok(())
        })
        .buffer_unordered(MAX_TRANSFER_CONCURRENCY)
        .collect()
        .await;

    for result in results {
        result?;
    }
    Ok(())
}
