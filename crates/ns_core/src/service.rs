use crate::app_error::{AppError, AppResult, ErrorCode};
use crate::backup::{backup_all_files, restore_from_backup, BackupReport, RestoreReport};
use crate::config::{load_github_config, update_github_token, GithubConfig};
use crate::conflict::{discard_local_changes, get_conflicts, resolve_conflicts_manually, ManualResolveReport};
use crate::db::open_db;
use crate::github::GithubRepo;
use crate::ledger::{
    delete_local_file, list_all_entries, read_file, write_local_file, EntryState, EntryStore,
    FileEntry, SqliteEntryStore,
};
use crate::lock::SyncLocks;
use crate::notify::{
    notification_for_error, notification_for_lock_busy, notification_for_sync, Notification,
    NotificationAction, Severity,
};
use crate::optimize::{optimize_database, OptimizeReport};
use crate::remote::RemoteRepo;
use crate::sync::{github_sync, SyncResult};
use crate::types::{WsName, WsPath};
use crate::workspace::{workspace_open, workspace_paths, WorkspaceJsonV1};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio_util::sync::CancellationToken;

const CONFLICTS_STATE_KEY: &str = "conflicted_ws_paths";

/// Builds the remote for a resolved config. Swapped out in tests.
pub type RemoteConnector = Box<dyn Fn(&GithubConfig) -> AppResult<Box<dyn RemoteRepo>>>;

pub fn github_connector() -> RemoteConnector {
    Box::new(|config: &GithubConfig| Ok(Box::new(GithubRepo::new(config)?) as Box<dyn RemoteRepo>))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    Sync { notify_verbose: bool },
    DiscardLocalChanges,
    ManuallyResolveConflict,
    CheckForConflicts,
    OptimizeDatabase { prune_unused: bool, retained: Vec<WsPath> },
    UpdateGithubToken { token: String },
    Backup { out_dir: PathBuf },
    Restore { bundle_dir: PathBuf },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Sync { .. } => "sync",
            Operation::DiscardLocalChanges => "discard_local_changes",
            Operation::ManuallyResolveConflict => "manually_resolve_conflict",
            Operation::CheckForConflicts => "check_for_conflicts",
            Operation::OptimizeDatabase { .. } => "optimize_database",
            Operation::UpdateGithubToken { .. } => "update_github_token",
            Operation::Backup { .. } => "backup",
            Operation::Restore { .. } => "restore",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum OperationResult {
    Synced { sync: SyncResult },
    Discarded { all_discarded: bool },
    ConflictsResolved { report: ManualResolveReport },
    Conflicts { conflict: Vec<WsPath> },
    Optimized { report: OptimizeReport, sync: Option<SyncResult> },
    TokenUpdated,
    BackedUp { report: BackupReport },
    Restored { report: RestoreReport },
    NotConfigured { message: String },
    LockBusy,
    Aborted,
    Failed { error: AppError },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationOutcome {
    pub result: OperationResult,
    pub notification: Option<Notification>,
}

impl OperationOutcome {
    fn new(result: OperationResult, notification: Option<Notification>) -> Self {
        Self {
            result,
            notification,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRunRecord {
    pub run_id: i64,
    pub operation: String,
    pub status: String,
    pub change_count: i64,
    pub conflict_count: i64,
    pub error_code: Option<String>,
    pub started_at_ms: i64,
    pub finished_at_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingEntry {
    pub ws_path: WsPath,
    pub state: EntryState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub ws_name: WsName,
    pub locked: bool,
    pub tracked: usize,
    pub pending: Vec<PendingEntry>,
    pub conflicted: Vec<WsPath>,
    pub last_run: Option<SyncRunRecord>,
}

struct RunSummary {
    status: &'static str,
    change_count: usize,
    conflict_count: usize,
    error_code: Option<ErrorCode>,
}

impl RunSummary {
    fn status(status: &'static str) -> Self {
        Self {
            status,
            change_count: 0,
            conflict_count: 0,
            error_code: None,
        }
    }

    fn from_sync(result: &SyncResult) -> Self {
        match result {
            SyncResult::Ok { count } => Self {
                change_count: *count,
                ..Self::status("ok")
            },
            SyncResult::MergeConflict { conflict } => Self {
                conflict_count: conflict.len(),
                ..Self::status("merge-conflict")
            },
        }
    }
}

fn state_error(message: &str, e: rusqlite::Error) -> AppError {
    AppError::new(
        ErrorCode::LedgerFailed,
        message,
        serde_json::json!({ "error": e.to_string() }),
    )
}

/// One open workspace: metadata, database and the remote connector. Every
/// operation resolves its GitHub config afresh and folds engine errors into
/// an `OperationResult`.
pub struct SyncService {
    root: PathBuf,
    workspace: WorkspaceJsonV1,
    ws_name: WsName,
    conn: Connection,
    connect: RemoteConnector,
    locks: &'static SyncLocks,
}

impl SyncService {
    pub fn open(root: &Path, connect: RemoteConnector) -> AppResult<Self> {
        let workspace = workspace_open(root)?;
        let ws_name = workspace.ws_name()?;
        let conn = open_db(&root.join(&workspace.db.relative_path))?;
        Ok(Self {
            root: root.to_path_buf(),
            workspace,
            ws_name,
            conn,
            connect,
            locks: SyncLocks::global(),
        })
    }

    pub fn with_locks(mut self, locks: &'static SyncLocks) -> Self {
        self.locks = locks;
        self
    }

    pub fn ws_name(&self) -> &WsName {
        &self.ws_name
    }

    pub fn workspace(&self) -> &WorkspaceJsonV1 {
        &self.workspace
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn default_backup_dir(&self) -> PathBuf {
        workspace_paths(&self.root).backups_dir
    }

    fn store(&self) -> SqliteEntryStore<'_> {
        SqliteEntryStore::new(&self.conn)
    }

    fn connect_remote(&self) -> AppResult<Box<dyn RemoteRepo>> {
        let config = load_github_config(&self.conn, &self.workspace)?;
        (self.connect)(&config)
    }

    fn read_state(&self, key: &str) -> AppResult<Option<String>> {
        self.conn
            .query_row(
                "SELECT state_value FROM sync_state WHERE ws_name=?1 AND state_key=?2",
                params![self.ws_name.as_str(), key],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| state_error("failed reading sync state", e))
    }

    fn write_state(&self, key: &str, value: &str, now_ms: i64) -> AppResult<()> {
        self.conn
            .execute(
                "INSERT INTO sync_state(ws_name, state_key, state_value, updated_at_ms)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(ws_name, state_key) DO UPDATE SET
                   state_value=excluded.state_value,
                   updated_at_ms=excluded.updated_at_ms",
                params![self.ws_name.as_str(), key, value, now_ms],
            )
            .map_err(|e| state_error("failed writing sync state", e))?;
        Ok(())
    }

    pub fn conflicted_ws_paths(&self) -> AppResult<Vec<WsPath>> {
        let Some(raw) = self.read_state(CONFLICTS_STATE_KEY)? else {
            return Ok(Vec::new());
        };
        serde_json::from_str(&raw).map_err(|e| {
            AppError::new(
                ErrorCode::LedgerFailed,
                "stored conflict set is corrupt",
                serde_json::json!({ "error": e.to_string() }),
            )
        })
    }

    fn set_conflicted_ws_paths(&self, ws_paths: &[WsPath], now_ms: i64) -> AppResult<()> {
        let raw = serde_json::to_string(ws_paths).map_err(|e| {
            AppError::new(
                ErrorCode::Internal,
                "failed to serialize conflict set",
                serde_json::json!({ "error": e.to_string() }),
            )
        })?;
        self.write_state(CONFLICTS_STATE_KEY, &raw, now_ms)
    }

    fn record_run(&self, operation: &str, summary: &RunSummary, started_at_ms: i64, finished_at_ms: i64) {
        let res = self.conn.execute(
            "INSERT INTO sync_runs(ws_name, operation, status, change_count, conflict_count, error_code, started_at_ms, finished_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                self.ws_name.as_str(),
                operation,
                summary.status,
                summary.change_count as i64,
                summary.conflict_count as i64,
                summary.error_code.map(ErrorCode::as_str),
                started_at_ms,
                finished_at_ms
            ],
        );
        if let Err(e) = res {
            tracing::warn!(error = %e, operation, "failed to record sync run");
        }
    }

    pub fn recent_runs(&self, limit: usize) -> AppResult<Vec<SyncRunRecord>> {
        let map_err = |e: rusqlite::Error| state_error("failed reading sync runs", e);
        let mut stmt = self
            .conn
            .prepare(
                "SELECT run_id, operation, status, change_count, conflict_count, error_code, started_at_ms, finished_at_ms
                 FROM sync_runs
                 WHERE ws_name=?1
                 ORDER BY run_id DESC
                 LIMIT ?2",
            )
            .map_err(map_err)?;
        let rows = stmt
            .query_map(params![self.ws_name.as_str(), limit as i64], |row| {
                Ok(SyncRunRecord {
                    run_id: row.get(0)?,
                    operation: row.get(1)?,
                    status: row.get(2)?,
                    change_count: row.get(3)?,
                    conflict_count: row.get(4)?,
                    error_code: row.get(5)?,
                    started_at_ms: row.get(6)?,
                    finished_at_ms: row.get(7)?,
                })
            })
            .map_err(map_err)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(map_err)?);
        }
        Ok(out)
    }

    pub fn status(&self) -> AppResult<StatusReport> {
        let entries = list_all_entries(&self.store(), &self.ws_name)?;
        let pending = entries
            .iter()
            .filter(|e| e.state() != EntryState::Untouched)
            .map(|e| PendingEntry {
                ws_path: e.uid.clone(),
                state: e.state(),
            })
            .collect();
        Ok(StatusReport {
            ws_name: self.ws_name.clone(),
            locked: self.locks.is_locked(&self.ws_name),
            tracked: entries.len(),
            pending,
            conflicted: self.conflicted_ws_paths()?,
            last_run: self.recent_runs(1)?.into_iter().next(),
        })
    }

    pub fn list_files(&self) -> AppResult<Vec<FileEntry>> {
        list_all_entries(&self.store(), &self.ws_name)
    }

    pub fn write_file(&self, ws_path: &WsPath, bytes: Vec<u8>, now_ms: i64) -> AppResult<FileEntry> {
        write_local_file(&self.store(), &self.ws_name, ws_path, bytes, now_ms)
    }

    /// Ledger-only reads need no GitHub config.
    pub async fn read_file(
        &self,
        ws_path: &WsPath,
        cancel: &CancellationToken,
        now_ms: i64,
    ) -> AppResult<Option<Vec<u8>>> {
        let store = self.store();
        if let Some(entry) = store.get(&self.ws_name, ws_path)? {
            return Ok((!entry.deleted).then_some(entry.local_content));
        }
        let remote = self.connect_remote()?;
        read_file(&store, remote.as_ref(), &self.ws_name, ws_path, cancel, now_ms).await
    }

    pub async fn delete_file(&self, ws_path: &WsPath, cancel: &CancellationToken, now_ms: i64) -> AppResult<()> {
        let store = self.store();
        if store.get(&self.ws_name, ws_path)?.is_some() {
            return delete_local_file(&store, &self.ws_name, ws_path, None, now_ms);
        }
        let remote = self.connect_remote()?;
        let tree = remote.fetch_tree(cancel).await?;
        delete_local_file(&store, &self.ws_name, ws_path, tree.sha_for(ws_path), now_ms)
    }

    fn lock_busy(&self, operation: &str, started_at_ms: i64, elapsed: Instant) -> OperationOutcome {
        self.record_run(operation, &RunSummary::status("lock-busy"), started_at_ms, finished(started_at_ms, elapsed));
        OperationOutcome::new(OperationResult::LockBusy, Some(notification_for_lock_busy(operation)))
    }

    fn failure(&self, operation: &str, err: AppError, started_at_ms: i64, elapsed: Instant, logged: bool) -> OperationOutcome {
        if err.is_abort() {
            if logged {
                self.record_run(operation, &RunSummary::status("aborted"), started_at_ms, finished(started_at_ms, elapsed));
            }
            tracing::info!(ws = %self.ws_name, operation, "operation aborted");
            return OperationOutcome::new(OperationResult::Aborted, None);
        }
        if err.code == ErrorCode::ConfigMissing {
            let notification = notification_for_error(&err);
            return OperationOutcome::new(
                OperationResult::NotConfigured {
                    message: err.message,
                },
                notification,
            );
        }
        if logged {
            let summary = RunSummary {
                error_code: Some(err.code),
                ..RunSummary::status("failed")
            };
            self.record_run(operation, &summary, started_at_ms, finished(started_at_ms, elapsed));
        }
        tracing::error!(ws = %self.ws_name, operation, code = %err.code, message = %err.message, "operation failed");
        let notification = notification_for_error(&err);
        OperationOutcome::new(OperationResult::Failed { error: err }, notification)
    }

    /// Runs one operation to completion. Engine errors never escape; they come
    /// back as `Failed`, `Aborted` or `NotConfigured`.
    pub async fn dispatch(&self, operation: Operation, cancel: &CancellationToken, now_ms: i64) -> OperationOutcome {
        let name = operation.name();
        let elapsed = Instant::now();
        tracing::debug!(ws = %self.ws_name, operation = name, "dispatch");
        match self.dispatch_inner(operation, cancel, now_ms, elapsed).await {
            Ok(outcome) => outcome,
            Err((err, logged)) => self.failure(name, err, now_ms, elapsed, logged),
        }
    }

    async fn dispatch_inner(
        &self,
        operation: Operation,
        cancel: &CancellationToken,
        now_ms: i64,
        elapsed: Instant,
    ) -> Result<OperationOutcome, (AppError, bool)> {
        let name = operation.name();
        let unlogged = |e: AppError| (e, false);
        let logged = |e: AppError| (e, true);
        let store = self.store();
        let ws_name = &self.ws_name;

        match operation {
            Operation::UpdateGithubToken { token } => {
                update_github_token(&self.conn, &token, now_ms).map_err(unlogged)?;
                Ok(OperationOutcome::new(
                    OperationResult::TokenUpdated,
                    Some(Notification::new(Severity::Success, "GitHub token updated")),
                ))
            }

            Operation::Sync { notify_verbose } => {
                let remote = self.connect_remote().map_err(unlogged)?;
                let outcome = self
                    .locks
                    .with_lock(ws_name, || github_sync(&store, remote.as_ref(), ws_name, cancel, now_ms))
                    .await;
                let Some(result) = outcome.result else {
                    return Ok(self.lock_busy(name, now_ms, elapsed));
                };
                let sync = result.map_err(logged)?;
                self.apply_conflict_state(&sync, now_ms).map_err(logged)?;
                self.record_run(name, &RunSummary::from_sync(&sync), now_ms, finished(now_ms, elapsed));
                let notification = notification_for_sync(&sync, notify_verbose);
                Ok(OperationOutcome::new(OperationResult::Synced { sync }, notification))
            }

            Operation::DiscardLocalChanges => {
                let outcome = self
                    .locks
                    .with_lock(ws_name, || async { discard_local_changes(&store, ws_name, now_ms) })
                    .await;
                let Some(result) = outcome.result else {
                    return Ok(self.lock_busy(name, now_ms, elapsed));
                };
                let all_discarded = result.map_err(logged)?;
                let notification = if all_discarded {
                    self.set_conflicted_ws_paths(&[], now_ms).map_err(logged)?;
                    self.record_run(name, &RunSummary::status("ok"), now_ms, finished(now_ms, elapsed));
                    Notification::new(Severity::Success, "Local changes discarded")
                } else {
                    let summary = RunSummary {
                        error_code: Some(ErrorCode::ConflictResolutionFailed),
                        ..RunSummary::status("failed")
                    };
                    self.record_run(name, &summary, now_ms, finished(now_ms, elapsed));
                    Notification::new(Severity::Info, "Local changes cannot be discarded")
                        .with_content("Some files were never synced and have nothing to go back to. Delete them instead.")
                };
                Ok(OperationOutcome::new(
                    OperationResult::Discarded { all_discarded },
                    Some(notification),
                ))
            }

            Operation::ManuallyResolveConflict => {
                let conflicted = self.conflicted_ws_paths().map_err(unlogged)?;
                if conflicted.is_empty() {
                    return Ok(OperationOutcome::new(
                        OperationResult::ConflictsResolved {
                            report: ManualResolveReport::default(),
                        },
                        Some(Notification::new(Severity::Info, "No conflicts to resolve")),
                    ));
                }
                let remote = self.connect_remote().map_err(unlogged)?;
                let outcome = self
                    .locks
                    .with_lock(ws_name, || {
                        resolve_conflicts_manually(&store, remote.as_ref(), ws_name, &conflicted, cancel, now_ms)
                    })
                    .await;
                let Some(result) = outcome.result else {
                    return Ok(self.lock_busy(name, now_ms, elapsed));
                };
                let report = result.map_err(logged)?;
                let still_conflicted: Vec<WsPath> = report.failed.iter().map(|f| f.ws_path.clone()).collect();
                self.set_conflicted_ws_paths(&still_conflicted, now_ms).map_err(logged)?;
                let summary = RunSummary {
                    change_count: report.resolved.len(),
                    conflict_count: still_conflicted.len(),
                    ..RunSummary::status(if still_conflicted.is_empty() { "ok" } else { "failed" })
                };
                self.record_run(name, &summary, now_ms, finished(now_ms, elapsed));
                let notification = if still_conflicted.is_empty() {
                    Notification::new(Severity::Success, "Manual conflict resolution").with_content(
                        "Created copies of the conflicted files. Resolve the conflicts manually and then sync again.",
                    )
                } else {
                    Notification::new(Severity::Error, "Unable to resolve conflict")
                        .with_content(format!("{} file(s) are still conflicted.", still_conflicted.len()))
                        .with_action(NotificationAction::ResolveConflict)
                };
                Ok(OperationOutcome::new(
                    OperationResult::ConflictsResolved { report },
                    Some(notification),
                ))
            }

            Operation::CheckForConflicts => {
                let remote = self.connect_remote().map_err(unlogged)?;
                let conflict = get_conflicts(&store, remote.as_ref(), ws_name, cancel)
                    .await
                    .map_err(unlogged)?;
                self.set_conflicted_ws_paths(&conflict, now_ms).map_err(unlogged)?;
                let notification = (!conflict.is_empty()).then(|| {
                    Notification::new(Severity::Warning, "Unresolved conflicts")
                        .with_content(format!("{} file(s) changed both locally and on GitHub.", conflict.len()))
                        .with_action(NotificationAction::ResolveConflict)
                });
                Ok(OperationOutcome::new(OperationResult::Conflicts { conflict }, notification))
            }

            Operation::OptimizeDatabase {
                prune_unused,
                retained,
            } => {
                let remote = self.connect_remote().map_err(unlogged)?;
                let retained: BTreeSet<WsPath> = retained.into_iter().collect();
                let outcome = self
                    .locks
                    .with_lock(ws_name, || async {
                        let optimized = match remote.fetch_tree(cancel).await {
                            Ok(tree) => optimize_database(&store, &tree, ws_name, &retained, prune_unused, cancel),
                            Err(err) => Err(err),
                        };
                        // the follow-up pass runs whatever the optimizer did
                        let synced = github_sync(&store, remote.as_ref(), ws_name, cancel, now_ms).await;
                        (optimized, synced)
                    })
                    .await;
                let Some((optimized, synced)) = outcome.result else {
                    return Ok(self.lock_busy(name, now_ms, elapsed));
                };
                let report = optimized.map_err(logged)?;
                let (sync, notification) = match synced {
                    Ok(sync) => {
                        self.apply_conflict_state(&sync, now_ms).map_err(logged)?;
                        let notification = notification_for_sync(&sync, false);
                        (Some(sync), notification)
                    }
                    Err(err) => {
                        tracing::warn!(ws = %ws_name, code = %err.code, "sync after optimize failed");
                        (None, notification_for_error(&err))
                    }
                };
                let summary = RunSummary {
                    change_count: report.pruned.len() + report.stale_removed.len(),
                    ..RunSummary::status("ok")
                };
                self.record_run(name, &summary, now_ms, finished(now_ms, elapsed));
                let notification = notification.or_else(|| {
                    Some(Notification::new(Severity::Success, "Database optimized").with_content(format!(
                        "Removed {} cached file(s)",
                        report.pruned.len() + report.stale_removed.len()
                    )))
                });
                Ok(OperationOutcome::new(OperationResult::Optimized { report, sync }, notification))
            }

            Operation::Backup { out_dir } => {
                let remote = self.connect_remote().map_err(unlogged)?;
                let report = backup_all_files(&store, remote.as_ref(), ws_name, &out_dir, cancel, now_ms)
                    .await
                    .map_err(unlogged)?;
                let notification = Notification::new(Severity::Success, "Backup created")
                    .with_content(format!("{} file(s) saved to {}", report.file_count, report.bundle_dir.display()));
                Ok(OperationOutcome::new(OperationResult::BackedUp { report }, Some(notification)))
            }

            Operation::Restore { bundle_dir } => {
                let remote = self.connect_remote().map_err(unlogged)?;
                let outcome = self
                    .locks
                    .with_lock(ws_name, || async {
                        match remote.fetch_tree(cancel).await {
                            Ok(tree) => restore_from_backup(&store, ws_name, &tree, &bundle_dir, now_ms),
                            Err(err) => Err(err),
                        }
                    })
                    .await;
                let Some(result) = outcome.result else {
                    return Ok(self.lock_busy(name, now_ms, elapsed));
                };
                let report = result.map_err(logged)?;
                let summary = RunSummary {
                    change_count: report.restored.len(),
                    ..RunSummary::status("ok")
                };
                self.record_run(name, &summary, now_ms, finished(now_ms, elapsed));
                let notification = Notification::new(Severity::Success, "Backup restored")
                    .with_content(format!("Restored {} file(s). Sync to upload them.", report.restored.len()));
                Ok(OperationOutcome::new(OperationResult::Restored { report }, Some(notification)))
            }
        }
    }

    fn apply_conflict_state(&self, sync: &SyncResult, now_ms: i64) -> AppResult<()> {
        match sync {
            SyncResult::Ok { .. } => self.set_conflicted_ws_paths(&[], now_ms),
            SyncResult::MergeConflict { conflict } => self.set_conflicted_ws_paths(conflict, now_ms),
        }
    }
}

fn finished(started_at_ms: i64, elapsed: Instant) -> i64 {
    started_at_ms + elapsed.elapsed().as_millis() as i64
}
