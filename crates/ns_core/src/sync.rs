use crate::app_error::{AppResult, ErrorCode};
use crate::ledger::{list_all_entries, EntryState, EntryStore, FileEntry};
use crate::remote::{fetch_verified_blobs, upload_blobs, RemoteChange, RemoteRepo, RemoteTree};
use crate::types::{WsName, WsPath};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;

/// Attempts per pass when the branch moves between tree fetch and ref update.
pub const MAX_SYNC_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum SyncResult {
    #[serde(rename = "ok")]
    Ok { count: usize },
    #[serde(rename = "merge-conflict")]
    MergeConflict { conflict: Vec<WsPath> },
}

impl SyncResult {
    pub fn status(&self) -> &'static str {
        match self {
            SyncResult::Ok { .. } => "ok",
            SyncResult::MergeConflict { .. } => "merge-conflict",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SyncAction {
    /// Upload local content; covers creates and updates.
    Push { ws_path: WsPath, local_sha: String },
    PushDelete { ws_path: WsPath },
    Pull { ws_path: WsPath, remote_sha: String },
    /// Untouched entry whose file was deleted remotely.
    RemoteRemoved { ws_path: WsPath },
    /// Both sides changed to the same content; only the base moves.
    Adopt { ws_path: WsPath, sha: String },
    /// Local deletion of something the remote no longer has.
    DropLocal { ws_path: WsPath },
}

impl SyncAction {
    pub fn ws_path(&self) -> &WsPath {
        match self {
            SyncAction::Push { ws_path, .. }
            | SyncAction::PushDelete { ws_path }
            | SyncAction::Pull { ws_path, .. }
            | SyncAction::RemoteRemoved { ws_path }
            | SyncAction::Adopt { ws_path, .. }
            | SyncAction::DropLocal { ws_path } => ws_path,
        }
    }

    fn counted(&self) -> bool {
        matches!(
            self,
            SyncAction::Push { .. }
                | SyncAction::PushDelete { .. }
                | SyncAction::Pull { .. }
                | SyncAction::RemoteRemoved { .. }
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncPlan {
    pub actions: Vec<SyncAction>,
    pub conflicts: Vec<WsPath>,
}

impl SyncPlan {
    pub fn change_count(&self) -> usize {
        self.actions.iter().filter(|a| a.counted()).count()
    }

    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }

    fn remote_changes(&self) -> Vec<RemoteChange> {
        self.actions
            .iter()
            .filter_map(|action| match action {
                SyncAction::Push { ws_path, local_sha } => Some(RemoteChange::Upsert {
                    ws_path: ws_path.clone(),
                    blob_sha: local_sha.clone(),
                }),
                SyncAction::PushDelete { ws_path } => Some(RemoteChange::Delete {
                    ws_path: ws_path.clone(),
                }),
                _ => None,
            })
            .collect()
    }
}

enum Decision {
    Nothing,
    Act(SyncAction),
    Conflict,
}

fn decide(entry: &FileEntry, remote_sha: Option<&str>) -> Decision {
    let ws_path = entry.uid.clone();
    let base = entry.sha.as_deref();
    let local = entry.local_sha.as_str();

    match entry.state() {
        EntryState::Untouched => match remote_sha {
            Some(r) if Some(r) == base => Decision::Nothing,
            Some(r) => Decision::Act(SyncAction::Pull {
                ws_path,
                remote_sha: r.to_string(),
            }),
            None => Decision::Act(SyncAction::RemoteRemoved { ws_path }),
        },
        EntryState::Modified | EntryState::New => match remote_sha {
            None if base.is_none() => Decision::Act(SyncAction::Push {
                ws_path,
                local_sha: local.to_string(),
            }),
            None => Decision::Conflict,
            Some(r) if Some(r) == base => Decision::Act(SyncAction::Push {
                ws_path,
                local_sha: local.to_string(),
            }),
            Some(r) if r == local => Decision::Act(SyncAction::Adopt {
                ws_path,
                sha: r.to_string(),
            }),
            Some(_) => Decision::Conflict,
        },
        EntryState::Deleted => match (base, remote_sha) {
            (None, _) | (Some(_), None) => Decision::Act(SyncAction::DropLocal { ws_path }),
            (Some(b), Some(r)) if b == r => Decision::Act(SyncAction::PushDelete { ws_path }),
            (Some(_), Some(_)) => Decision::Conflict,
        },
    }
}

/// Three-way comparison of every ledger entry (base = last-synced sha, local
/// sha, remote sha). Pure; nothing is fetched or written.
pub fn plan_sync(entries: &[FileEntry], tree: &RemoteTree) -> SyncPlan {
    let mut plan = SyncPlan::default();
    for entry in entries {
        match decide(entry, tree.sha_for(&entry.uid)) {
            Decision::Nothing => {}
            Decision::Act(action) => plan.actions.push(action),
            Decision::Conflict => plan.conflicts.push(entry.uid.clone()),
        }
    }
    plan.conflicts.sort();
    plan
}

fn commit_message(changes: &[RemoteChange]) -> String {
    match changes {
        [single] => format!("Sync {}", single.ws_path()),
        _ => format!("Sync {} files", changes.len()),
    }
}

/// True when nothing wrote the entry between planning and now.
fn unchanged_since_plan(current: &FileEntry, planned: &FileEntry) -> bool {
    current.local_sha == planned.local_sha && current.deleted == planned.deleted
}

/// Executes a conflict-free plan. Ledger entries are re-read before they are
/// updated; a local write that landed after planning keeps its content and
/// only the base moves, so the next pass picks it up.
#[allow(clippy::too_many_arguments)]
async fn apply_plan(
    store: &dyn EntryStore,
    remote: &dyn RemoteRepo,
    ws_name: &WsName,
    tree: &RemoteTree,
    entries: &[FileEntry],
    plan: &SyncPlan,
    cancel: &CancellationToken,
    now_ms: i64,
) -> AppResult<usize> {
    let by_path: BTreeMap<&WsPath, &FileEntry> = entries.iter().map(|e| (&e.uid, e)).collect();

    let wanted: Vec<(WsPath, String)> = plan
        .actions
        .iter()
        .filter_map(|action| match action {
            SyncAction::Pull {
                ws_path,
                remote_sha,
            } => Some((ws_path.clone(), remote_sha.clone())),
            _ => None,
        })
        .collect();
    let pulled = fetch_verified_blobs(remote, wanted, cancel).await?;

    let changes = plan.remote_changes();
    if !changes.is_empty() {
        let pending: Vec<(WsPath, String, &[u8])> = plan
            .actions
            .iter()
            .filter_map(|action| match action {
                SyncAction::Push {
                    ws_path,
                    local_sha,
                } => by_path
                    .get(ws_path)
                    .map(|e| (ws_path.clone(), local_sha.clone(), e.local_content.as_slice())),
                _ => None,
            })
            .collect();
        upload_blobs(remote, pending, cancel).await?;
        let commit = remote
            .commit_changes(tree, &changes, &commit_message(&changes), cancel)
            .await?;
        tracing::debug!(ws = %ws_name, %commit, changes = changes.len(), "remote updated");
    }

    // The remote is final from here on; ledger writes run without suspension.
    let mut pulled: BTreeMap<WsPath, (String, Vec<u8>)> = pulled
        .into_iter()
        .map(|(ws_path, sha, bytes)| (ws_path, (sha, bytes)))
        .collect();
    for action in &plan.actions {
        let ws_path = action.ws_path();
        let Some(planned) = by_path.get(ws_path).copied() else {
            continue;
        };
        let current = store.get(ws_name, ws_path)?;
        match action {
            SyncAction::Pull { .. } => {
                let Some((sha, bytes)) = pulled.remove(ws_path) else {
                    continue;
                };
                match current {
                    Some(current) if !unchanged_since_plan(&current, planned) => {
                        // base stays put so the next pass sees both edits
                        tracing::info!(ws = %ws_name, path = %ws_path, "local edit during pull kept");
                    }
                    _ => store.put(ws_name, &FileEntry::synced(ws_path.clone(), bytes, sha, now_ms))?,
                }
            }
            SyncAction::Push { local_sha: sha, .. } | SyncAction::Adopt { sha, .. } => {
                let synced = FileEntry::synced(
                    ws_path.clone(),
                    planned.local_content.clone(),
                    sha.clone(),
                    now_ms,
                );
                match current {
                    Some(current) if unchanged_since_plan(&current, planned) => store.put(ws_name, &synced)?,
                    Some(mut current) => {
                        tracing::info!(ws = %ws_name, path = %ws_path, "local edit during push kept");
                        current.sha = synced.sha;
                        current.remote_content = synced.remote_content;
                        store.put(ws_name, &current)?;
                    }
                    // dropped while pushing; the remote copy still has to go
                    None => store.put(
                        ws_name,
                        &FileEntry {
                            deleted: true,
                            ..synced
                        },
                    )?,
                }
            }
            SyncAction::PushDelete { .. } | SyncAction::DropLocal { .. } => match current {
                Some(current) if unchanged_since_plan(&current, planned) => store.delete(ws_name, ws_path)?,
                Some(mut current) => {
                    // rewritten while deleting; the remote has no copy any more
                    current.sha = None;
                    current.remote_content = None;
                    store.put(ws_name, &current)?;
                }
                None => {}
            },
            SyncAction::RemoteRemoved { .. } => match current {
                Some(current) if !unchanged_since_plan(&current, planned) => {
                    tracing::info!(ws = %ws_name, path = %ws_path, "local edit during remote removal kept");
                }
                Some(_) => store.delete(ws_name, ws_path)?,
                None => {}
            },
        }
    }

    Ok(plan.change_count())
}

/// One sync pass. The caller must hold the workspace lock.
///
/// Any conflict stops the pass before either side is touched. When the branch
/// moves while pushing, the tree is re-fetched and the pass re-planned.
pub async fn github_sync(
    store: &dyn EntryStore,
    remote: &dyn RemoteRepo,
    ws_name: &WsName,
    cancel: &CancellationToken,
    now_ms: i64,
) -> AppResult<SyncResult> {
    let mut attempt = 1;
    loop {
        let tree = remote.fetch_tree(cancel).await?;
        let entries = list_all_entries(store, ws_name)?;
        let plan = plan_sync(&entries, &tree);

        if plan.has_conflicts() {
            tracing::info!(ws = %ws_name, conflicts = plan.conflicts.len(), "sync found conflicts");
            return Ok(SyncResult::MergeConflict {
                conflict: plan.conflicts,
            });
        }

        match apply_plan(store, remote, ws_name, &tree, &entries, &plan, cancel, now_ms).await {
            Ok(count) => {
                tracing::info!(ws = %ws_name, remote = %remote.describe(), count, "sync complete");
                return Ok(SyncResult::Ok { count });
            }
            Err(err) if err.code == ErrorCode::RemoteMoved && attempt < MAX_SYNC_ATTEMPTS => {
                tracing::warn!(ws = %ws_name, attempt, "remote branch moved during sync, retrying");
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
