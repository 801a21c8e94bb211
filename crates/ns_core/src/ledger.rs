use crate::app_error::{AppError, AppResult, ErrorCode};
use crate::hashing::git_blob_sha;
use crate::remote::RemoteRepo;
use crate::types::{WsName, WsPath};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    Untouched,
    Modified,
    New,
    Deleted,
}

/// Sync state of one tracked file.
///
/// `sha` is the git blob id of the last-synced content and `None` for a file
/// that has never been synced. `local_content` is kept while `deleted` is set
/// so a discard can bring the file back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub uid: WsPath,
    pub sha: Option<String>,
    pub local_sha: String,
    #[serde(skip)]
    pub local_content: Vec<u8>,
    #[serde(skip)]
    pub remote_content: Option<Vec<u8>>,
    pub deleted: bool,
    pub updated_at_ms: i64,
}

impl FileEntry {
    pub fn new_local(uid: WsPath, bytes: Vec<u8>, now_ms: i64) -> Self {
        Self {
            uid,
            sha: None,
            local_sha: git_blob_sha(&bytes),
            local_content: bytes,
            remote_content: None,
            deleted: false,
            updated_at_ms: now_ms,
        }
    }

    /// An untouched entry whose local and last-synced content are `bytes`.
    pub fn synced(uid: WsPath, bytes: Vec<u8>, sha: String, now_ms: i64) -> Self {
        Self {
            uid,
            sha: Some(sha.clone()),
            local_sha: sha,
            local_content: bytes.clone(),
            remote_content: Some(bytes),
            deleted: false,
            updated_at_ms: now_ms,
        }
    }

    pub fn set_local_content(&mut self, bytes: Vec<u8>, now_ms: i64) {
        self.local_sha = git_blob_sha(&bytes);
        self.local_content = bytes;
        self.deleted = false;
        self.updated_at_ms = now_ms;
    }

    pub fn state(&self) -> EntryState {
        classify(self)
    }
}

/// Pure function of (deletion flag, last-synced sha, current local sha).
pub fn classify(entry: &FileEntry) -> EntryState {
    if entry.deleted {
        return EntryState::Deleted;
    }
    match &entry.sha {
        None => EntryState::New,
        Some(sha) if *sha == entry.local_sha => EntryState::Untouched,
        Some(_) => EntryState::Modified,
    }
}

pub fn is_entry_untouched(entry: &FileEntry) -> bool {
    classify(entry) == EntryState::Untouched
}

pub fn is_entry_modified(entry: &FileEntry) -> bool {
    classify(entry) == EntryState::Modified
}

pub fn is_entry_new(entry: &FileEntry) -> bool {
    classify(entry) == EntryState::New
}

pub fn is_entry_deleted(entry: &FileEntry) -> bool {
    classify(entry) == EntryState::Deleted
}

/// Persisted key/value store of ledger entries keyed by `(ws_name, ws_path)`.
/// Reads are last-write-visible; there is no snapshot isolation.
pub trait EntryStore {
    fn get(&self, ws_name: &WsName, ws_path: &WsPath) -> AppResult<Option<FileEntry>>;
    fn put(&self, ws_name: &WsName, entry: &FileEntry) -> AppResult<()>;
    fn delete(&self, ws_name: &WsName, ws_path: &WsPath) -> AppResult<()>;
    /// Entries whose path starts with `prefix`, ordered by path.
    fn list_by_prefix(&self, ws_name: &WsName, prefix: &str) -> AppResult<Vec<FileEntry>>;
}

fn ledger_error(message: &str, details: serde_json::Value) -> AppError {
    AppError::new(ErrorCode::LedgerFailed, message, details)
}

pub struct SqliteEntryStore<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteEntryStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

fn entry_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileEntry> {
    Ok(FileEntry {
        uid: WsPath(row.get(0)?),
        sha: row.get(1)?,
        local_sha: row.get(2)?,
        local_content: row.get(3)?,
        remote_content: row.get(4)?,
        deleted: row.get::<_, i64>(5)? != 0,
        updated_at_ms: row.get(6)?,
    })
}

impl EntryStore for SqliteEntryStore<'_> {
    fn get(&self, ws_name: &WsName, ws_path: &WsPath) -> AppResult<Option<FileEntry>> {
        self.conn
            .query_row(
                "SELECT ws_path, sha, local_sha, local_content, remote_content, deleted, updated_at_ms
                 FROM file_entries
                 WHERE ws_name=?1 AND ws_path=?2",
                params![ws_name.as_str(), ws_path.as_str()],
                entry_from_row,
            )
            .optional()
            .map_err(|e| {
                ledger_error(
                    "failed reading ledger entry",
                    serde_json::json!({ "error": e.to_string(), "ws_path": ws_path }),
                )
            })
    }

    fn put(&self, ws_name: &WsName, entry: &FileEntry) -> AppResult<()> {
        self.conn
            .execute(
                "INSERT INTO file_entries(ws_name, ws_path, sha, local_sha, local_content, remote_content, deleted, updated_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(ws_name, ws_path) DO UPDATE SET
                   sha=excluded.sha,
                   local_sha=excluded.local_sha,
                   local_content=excluded.local_content,
                   remote_content=excluded.remote_content,
                   deleted=excluded.deleted,
                   updated_at_ms=excluded.updated_at_ms",
                params![
                    ws_name.as_str(),
                    entry.uid.as_str(),
                    entry.sha,
                    entry.local_sha,
                    entry.local_content,
                    entry.remote_content,
                    entry.deleted as i64,
                    entry.updated_at_ms
                ],
            )
            .map_err(|e| {
                ledger_error(
                    "failed writing ledger entry",
                    serde_json::json!({ "error": e.to_string(), "ws_path": entry.uid }),
                )
            })?;
        Ok(())
    }

    fn delete(&self, ws_name: &WsName, ws_path: &WsPath) -> AppResult<()> {
        self.conn
            .execute(
                "DELETE FROM file_entries WHERE ws_name=?1 AND ws_path=?2",
                params![ws_name.as_str(), ws_path.as_str()],
            )
            .map_err(|e| {
                ledger_error(
                    "failed deleting ledger entry",
                    serde_json::json!({ "error": e.to_string(), "ws_path": ws_path }),
                )
            })?;
        Ok(())
    }

    fn list_by_prefix(&self, ws_name: &WsName, prefix: &str) -> AppResult<Vec<FileEntry>> {
        let map_err = |e: rusqlite::Error| {
            ledger_error(
                "failed listing ledger entries",
                serde_json::json!({ "error": e.to_string(), "prefix": prefix }),
            )
        };
        let mut stmt = self
            .conn
            .prepare(
                "SELECT ws_path, sha, local_sha, local_content, remote_content, deleted, updated_at_ms
                 FROM file_entries
                 WHERE ws_name=?1 AND substr(ws_path, 1, length(?2))=?2
                 ORDER BY ws_path ASC",
            )
            .map_err(map_err)?;
        let rows = stmt
            .query_map(params![ws_name.as_str(), prefix], entry_from_row)
            .map_err(map_err)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(map_err)?);
        }
        Ok(out)
    }
}

/// In-process store used by callers that do not need persistence.
#[derive(Default)]
pub struct MemoryEntryStore {
    entries: Mutex<BTreeMap<(String, String), FileEntry>>,
}

impl MemoryEntryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> AppResult<std::sync::MutexGuard<'_, BTreeMap<(String, String), FileEntry>>> {
        self.entries
            .lock()
            .map_err(|_| ledger_error("memory entry store lock poisoned", serde_json::json!({})))
    }
}

impl EntryStore for MemoryEntryStore {
    fn get(&self, ws_name: &WsName, ws_path: &WsPath) -> AppResult<Option<FileEntry>> {
        Ok(self
            .lock()?
            .get(&(ws_name.0.clone(), ws_path.0.clone()))
            .cloned())
    }

    fn put(&self, ws_name: &WsName, entry: &FileEntry) -> AppResult<()> {
        self.lock()?
            .insert((ws_name.0.clone(), entry.uid.0.clone()), entry.clone());
        Ok(())
    }

    fn delete(&self, ws_name: &WsName, ws_path: &WsPath) -> AppResult<()> {
        self.lock()?.remove(&(ws_name.0.clone(), ws_path.0.clone()));
        Ok(())
    }

    fn list_by_prefix(&self, ws_name: &WsName, prefix: &str) -> AppResult<Vec<FileEntry>> {
        Ok(self
            .lock()?
            .iter()
            .filter(|((ws, path), _)| ws == ws_name.as_str() && path.starts_with(prefix))
            .map(|(_, entry)| entry.clone())
            .collect())
    }
}

pub fn list_all_entries(store: &dyn EntryStore, ws_name: &WsName) -> AppResult<Vec<FileEntry>> {
    store.list_by_prefix(ws_name, "")
}

pub fn write_local_file(
    store: &dyn EntryStore,
    ws_name: &WsName,
    ws_path: &WsPath,
    bytes: Vec<u8>,
    now_ms: i64,
) -> AppResult<FileEntry> {
    let entry = match store.get(ws_name, ws_path)? {
        Some(mut existing) => {
            existing.set_local_content(bytes, now_ms);
            existing
        }
        None => FileEntry::new_local(ws_path.clone(), bytes, now_ms),
    };
    store.put(ws_name, &entry)?;
    tracing::trace!(ws = %ws_name, path = %ws_path, state = ?entry.state(), "local write");
    Ok(entry)
}

/// Marks a file deleted. A file that was never synced has nothing to delete
/// remotely, so its entry is dropped. Untracked files that only exist
/// remotely get a tombstone entry pointing at the remote sha.
pub fn delete_local_file(
    store: &dyn EntryStore,
    ws_name: &WsName,
    ws_path: &WsPath,
    remote_sha: Option<&str>,
    now_ms: i64,
) -> AppResult<()> {
    match store.get(ws_name, ws_path)? {
        Some(entry) if entry.sha.is_none() => store.delete(ws_name, ws_path),
        Some(mut entry) => {
            entry.deleted = true;
            entry.updated_at_ms = now_ms;
            store.put(ws_name, &entry)
        }
        None => {
            let Some(sha) = remote_sha else {
                return Err(AppError::new(
                    ErrorCode::EntryNotFound,
                    "cannot delete a file that does not exist",
                    serde_json::json!({ "ws_path": ws_path }),
                ));
            };
            let entry = FileEntry {
                uid: ws_path.clone(),
                sha: Some(sha.to_string()),
                local_sha: sha.to_string(),
                local_content: Vec::new(),
                remote_content: None,
                deleted: true,
                updated_at_ms: now_ms,
            };
            store.put(ws_name, &entry)
        }
    }
}

/// Reads the current content of a file: the ledger first, then the remote
/// tree. Remote content is cached as an untouched entry.
pub async fn read_file(
    store: &dyn EntryStore,
    remote: &dyn RemoteRepo,
    ws_name: &WsName,
    ws_path: &WsPath,
    cancel: &CancellationToken,
    now_ms: i64,
) -> AppResult<Option<Vec<u8>>> {
    if let Some(entry) = store.get(ws_name, ws_path)? {
        if entry.deleted {
            return Ok(None);
        }
        return Ok(Some(entry.local_content));
    }

    let tree = remote.fetch_tree(cancel).await?;
    let Some(sha) = tree.sha_for(ws_path) else {
        return Ok(None);
    };
    let bytes = remote.fetch_blob(sha, cancel).await?;
    crate::remote::verify_blob(ws_path, sha, &bytes)?;
    record_synced(store, ws_name, ws_path, bytes.clone(), sha.to_string(), now_ms)?;
    Ok(Some(bytes))
}

/// Resets local content to the last-synced content and clears the
/// modified/deleted state. Returns `false` when there is nothing to reset to:
/// a never-synced file or a missing entry.
pub fn discard_entry_changes(
    store: &dyn EntryStore,
    ws_name: &WsName,
    ws_path: &WsPath,
    now_ms: i64,
) -> AppResult<bool> {
    let Some(mut entry) = store.get(ws_name, ws_path)? else {
        return Ok(false);
    };
    let Some(sha) = entry.sha.clone() else {
        return Ok(false);
    };
    let Some(remote_content) = entry.remote_content.clone() else {
        // tombstone for a file never cached locally; dropping it makes the
        // remote copy visible again
        store.delete(ws_name, ws_path)?;
        return Ok(true);
    };
    entry.local_content = remote_content;
    entry.local_sha = sha;
    entry.deleted = false;
    entry.updated_at_ms = now_ms;
    store.put(ws_name, &entry)?;
    Ok(true)
}

pub fn record_synced(
    store: &dyn EntryStore,
    ws_name: &WsName,
    ws_path: &WsPath,
    bytes: Vec<u8>,
    sha: String,
    now_ms: i64,
) -> AppResult<()> {
    store.put(ws_name, &FileEntry::synced(ws_path.clone(), bytes, sha, now_ms))
}
