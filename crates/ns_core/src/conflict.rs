use crate::app_error::{AppError, AppResult, ErrorCode};
use crate::ledger::{
    discard_entry_changes, list_all_entries, record_synced, write_local_file, EntryState,
    EntryStore,
};
use crate::remote::{verify_blob, RemoteRepo, RemoteTree};
use crate::sync::plan_sync;
use crate::types::{WsName, WsPath};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

const CONFLICT_SUFFIX: &str = "-conflict";
const MAX_COPY_CANDIDATES: usize = 1000;

/// Paths produced by a manual resolve, to be opened side by side. There is no
/// local copy when the local side of the conflict was a deletion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedConflict {
    pub remote_content_ws_path: WsPath,
    pub local_content_ws_path: Option<WsPath>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedResolution {
    pub ws_path: WsPath,
    pub error: AppError,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ManualResolveReport {
    pub resolved: Vec<ResolvedConflict>,
    pub failed: Vec<FailedResolution>,
}

/// Re-derives the conflict set against a freshly fetched tree. Nothing is
/// written.
pub async fn get_conflicts(
    store: &dyn EntryStore,
    remote: &dyn RemoteRepo,
    ws_name: &WsName,
    cancel: &CancellationToken,
) -> AppResult<Vec<WsPath>> {
    let tree = remote.fetch_tree(cancel).await?;
    let entries = list_all_entries(store, ws_name)?;
    Ok(plan_sync(&entries, &tree).conflicts)
}

/// Resets every changed entry to its last-synced content. Entries that were
/// never synced cannot be reset and make the whole call report `false`;
/// entries already reset stay reset.
pub fn discard_local_changes(store: &dyn EntryStore, ws_name: &WsName, now_ms: i64) -> AppResult<bool> {
    let mut all_discarded = true;
    for entry in list_all_entries(store, ws_name)? {
        if entry.state() == EntryState::Untouched {
            continue;
        }
        if !discard_entry_changes(store, ws_name, &entry.uid, now_ms)? {
            tracing::warn!(ws = %ws_name, path = %entry.uid, "cannot discard a file that was never synced");
            all_discarded = false;
        }
    }
    Ok(all_discarded)
}

/// First free sibling name: `a-conflict.md`, `a-conflict-2.md`, ... A name is
/// taken when either the ledger or the remote tree has it.
fn conflict_copy_path(
    store: &dyn EntryStore,
    ws_name: &WsName,
    tree: &RemoteTree,
    ws_path: &WsPath,
) -> AppResult<WsPath> {
    for n in 1..=MAX_COPY_CANDIDATES {
        let suffix = if n == 1 {
            CONFLICT_SUFFIX.to_string()
        } else {
            format!("{}-{}", CONFLICT_SUFFIX, n)
        };
        let candidate = ws_path.with_stem_suffix(&suffix);
        if !tree.contains(&candidate) && store.get(ws_name, &candidate)?.is_none() {
            return Ok(candidate);
        }
    }
    Err(AppError::new(
        ErrorCode::ConflictResolutionFailed,
        "no free name for the conflict copy",
        serde_json::json!({ "ws_path": ws_path }),
    ))
}

/// Keeps both sides of a conflict: the local content moves to a new sibling
/// entry and the original path is reset to the remote content, or removed
/// when the remote no longer has it.
pub async fn duplicate_and_reset_to_remote(
    store: &dyn EntryStore,
    remote: &dyn RemoteRepo,
    ws_name: &WsName,
    ws_path: &WsPath,
    cancel: &CancellationToken,
    now_ms: i64,
) -> AppResult<ResolvedConflict> {
    let entry = store.get(ws_name, ws_path)?.ok_or_else(|| {
        AppError::new(
            ErrorCode::EntryNotFound,
            "no ledger entry for conflicted path",
            serde_json::json!({ "ws_path": ws_path }),
        )
    })?;

    let tree = remote.fetch_tree(cancel).await?;
    let remote_side = match tree.sha_for(ws_path) {
        Some(sha) => {
            let cached = entry
                .remote_content
                .as_ref()
                .filter(|_| entry.sha.as_deref() == Some(sha))
                .cloned();
            let bytes = match cached {
                Some(bytes) => bytes,
                None => {
                    let bytes = remote.fetch_blob(sha, cancel).await?;
                    verify_blob(ws_path, sha, &bytes)?;
                    bytes
                }
            };
            Some((sha.to_string(), bytes))
        }
        None => None,
    };

    let local_copy = if entry.deleted {
        None
    } else {
        let copy_path = conflict_copy_path(store, ws_name, &tree, ws_path)?;
        write_local_file(store, ws_name, &copy_path, entry.local_content.clone(), now_ms)?;
        Some(copy_path)
    };

    match remote_side {
        Some((sha, bytes)) => record_synced(store, ws_name, ws_path, bytes, sha, now_ms)?,
        None => store.delete(ws_name, ws_path)?,
    }

    tracing::info!(
        ws = %ws_name,
        path = %ws_path,
        copy = ?local_copy.as_ref().map(WsPath::as_str),
        "conflict resolved by duplicating local content"
    );
    Ok(ResolvedConflict {
        remote_content_ws_path: ws_path.clone(),
        local_content_ws_path: local_copy,
    })
}

/// Resolves `ws_paths` one after another. A failing path stays conflicted and
/// does not stop the others; cancellation does.
pub async fn resolve_conflicts_manually(
    store: &dyn EntryStore,
    remote: &dyn RemoteRepo,
    ws_name: &WsName,
    ws_paths: &[WsPath],
    cancel: &CancellationToken,
    now_ms: i64,
) -> AppResult<ManualResolveReport> {
    let mut report = ManualResolveReport::default();
    for ws_path in ws_paths {
        match duplicate_and_reset_to_remote(store, remote, ws_name, ws_path, cancel, now_ms).await {
            Ok(resolved) => report.resolved.push(resolved),
            Err(err) if err.is_abort() => return Err(err),
            Err(error) => {
                tracing::warn!(ws = %ws_name, path = %ws_path, code = %error.code, "manual resolve failed");
                report.failed.push(FailedResolution {
                    ws_path: ws_path.clone(),
                    error,
                });
            }
        }
    }
    Ok(report)
}
