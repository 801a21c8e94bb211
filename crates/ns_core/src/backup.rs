use crate::app_error::{AppError, AppResult, ErrorCode};
use crate::canon_json::to_canonical_bytes;
use crate::hashing::blake3_hex_prefixed;
use crate::ledger::{list_all_entries, write_local_file, EntryStore};
use crate::remote::{fetch_verified_blobs, RemoteRepo, RemoteTree};
use crate::types::{WsName, WsPath};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

pub const BACKUP_MANIFEST_VERSION: u32 = 1;
const MANIFEST_FILE: &str = "manifest.json";
const FILES_DIR: &str = "files";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupFileV1 {
    pub path: String,
    pub hash: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupManifestV1 {
    pub manifest_version: u32,
    pub ws_name: String,
    pub created_at_ms: i64,
    pub files: Vec<BackupFileV1>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupReport {
    pub bundle_dir: PathBuf,
    pub file_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    pub restored: Vec<WsPath>,
}

fn backup_failed(message: &str, details: serde_json::Value) -> AppError {
    AppError::new(ErrorCode::BackupFailed, message, details)
}

fn backup_invalid(message: &str, details: serde_json::Value) -> AppError {
    AppError::new(ErrorCode::BackupInvalid, message, details)
}

/// Snapshot of every file visible in the workspace: ledger content where the
/// ledger has the file, remote content otherwise. Locally deleted files are
/// left out. Remote-only content is not cached in the ledger.
pub async fn backup_all_files(
    store: &dyn EntryStore,
    remote: &dyn RemoteRepo,
    ws_name: &WsName,
    out_dir: &Path,
    cancel: &CancellationToken,
    now_ms: i64,
) -> AppResult<BackupReport> {
    let tree = remote.fetch_tree(cancel).await?;
    let entries = list_all_entries(store, ws_name)?;
    let tracked: BTreeSet<&WsPath> = entries.iter().map(|e| &e.uid).collect();

    let remote_only: Vec<(WsPath, String)> = tree
        .files
        .iter()
        .filter(|(ws_path, _)| !tracked.contains(ws_path))
        .map(|(ws_path, sha)| (ws_path.clone(), sha.clone()))
        .collect();
    let fetched = fetch_verified_blobs(remote, remote_only, cancel).await?;

    let mut contents: BTreeMap<WsPath, Vec<u8>> = BTreeMap::new();
    for entry in &entries {
        if !entry.deleted {
            contents.insert(entry.uid.clone(), entry.local_content.clone());
        }
    }
    for (ws_path, _, bytes) in fetched {
        contents.insert(ws_path, bytes);
    }

    let bundle_dir = out_dir.join(format!("backup_{}_{}", ws_name.as_str(), now_ms));
    if bundle_dir.exists() {
        return Err(backup_failed(
            "backup bundle directory already exists",
            serde_json::json!({ "path": bundle_dir }),
        ));
    }
    let files_dir = bundle_dir.join(FILES_DIR);
    fs::create_dir_all(&files_dir).map_err(|e| {
        backup_failed(
            "failed to create backup bundle directory",
            serde_json::json!({ "error": e.to_string(), "path": files_dir }),
        )
    })?;

    let mut files = Vec::with_capacity(contents.len());
    for (ws_path, bytes) in &contents {
        let dst = files_dir.join(ws_path.as_str());
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                backup_failed(
                    "failed creating backup file directory",
                    serde_json::json!({ "error": e.to_string(), "path": parent }),
                )
            })?;
        }
        fs::write(&dst, bytes).map_err(|e| {
            backup_failed(
                "failed writing backup file",
                serde_json::json!({ "error": e.to_string(), "path": dst }),
            )
        })?;
        files.push(BackupFileV1 {
            path: ws_path.as_str().to_string(),
            hash: blake3_hex_prefixed(bytes),
            bytes: bytes.len() as u64,
        });
    }

    let manifest = BackupManifestV1 {
        manifest_version: BACKUP_MANIFEST_VERSION,
        ws_name: ws_name.as_str().to_string(),
        created_at_ms: now_ms,
        files,
    };
    let manifest_value = serde_json::to_value(&manifest).map_err(|e| {
        backup_failed(
            "failed to serialize backup manifest",
            serde_json::json!({ "error": e.to_string() }),
        )
    })?;
    fs::write(bundle_dir.join(MANIFEST_FILE), to_canonical_bytes(&manifest_value)?).map_err(|e| {
        backup_failed(
            "failed writing manifest.json",
            serde_json::json!({ "error": e.to_string() }),
        )
    })?;

    tracing::info!(ws = %ws_name, bundle = %bundle_dir.display(), files = contents.len(), "backup written");
    Ok(BackupReport {
        bundle_dir,
        file_count: contents.len(),
    })
}

fn relative_ws_path(files_dir: &Path, path: &Path) -> AppResult<String> {
    let rel = path.strip_prefix(files_dir).map_err(|e| {
        backup_invalid(
            "backup file outside files directory",
            serde_json::json!({ "error": e.to_string(), "path": path }),
        )
    })?;
    Ok(rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/"))
}

/// Checks the manifest against the bundle: every listed file exists with the
/// recorded hash and size, and nothing unlisted sits under `files/`.
pub fn verify_backup(bundle_dir: &Path) -> AppResult<BackupManifestV1> {
    let manifest_path = bundle_dir.join(MANIFEST_FILE);
    let bytes = fs::read(&manifest_path).map_err(|e| {
        backup_invalid(
            "failed reading manifest.json",
            serde_json::json!({ "error": e.to_string(), "path": manifest_path }),
        )
    })?;
    let manifest: BackupManifestV1 = serde_json::from_slice(&bytes).map_err(|e| {
        backup_invalid(
            "failed parsing manifest.json",
            serde_json::json!({ "error": e.to_string(), "path": manifest_path }),
        )
    })?;
    if manifest.manifest_version != BACKUP_MANIFEST_VERSION {
        return Err(backup_invalid(
            "unsupported backup manifest version",
            serde_json::json!({
                "manifest_version": manifest.manifest_version,
                "supported": [BACKUP_MANIFEST_VERSION]
            }),
        ));
    }

    let files_dir = bundle_dir.join(FILES_DIR);
    let mut listed = BTreeSet::new();
    for file in &manifest.files {
        let ws_path = WsPath::parse(&file.path).map_err(|e| {
            backup_invalid(
                "manifest lists an invalid path",
                serde_json::json!({ "path": file.path, "error": e.message }),
            )
        })?;
        let data = fs::read(files_dir.join(ws_path.as_str())).map_err(|e| {
            backup_invalid(
                "backup file listed in manifest is unreadable",
                serde_json::json!({ "error": e.to_string(), "path": file.path }),
            )
        })?;
        let actual = blake3_hex_prefixed(&data);
        if actual != file.hash || data.len() as u64 != file.bytes {
            return Err(backup_invalid(
                "backup file does not match manifest",
                serde_json::json!({
                    "path": file.path,
                    "expected_hash": file.hash,
                    "actual_hash": actual,
                    "expected_bytes": file.bytes,
                    "actual_bytes": data.len()
                }),
            ));
        }
        listed.insert(ws_path.as_str().to_string());
    }

    if files_dir.exists() {
        for entry in walkdir::WalkDir::new(&files_dir)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
        {
            let rel = relative_ws_path(&files_dir, entry.path())?;
            if !listed.contains(&rel) {
                return Err(backup_invalid(
                    "backup contains a file missing from the manifest",
                    serde_json::json!({ "path": rel }),
                ));
            }
        }
    }

    Ok(manifest)
}

/// Writes every file of a verified bundle as a new entry. Only allowed into a
/// workspace with no ledger entries and an empty remote branch.
pub fn restore_from_backup(
    store: &dyn EntryStore,
    ws_name: &WsName,
    tree: &RemoteTree,
    bundle_dir: &Path,
    now_ms: i64,
) -> AppResult<RestoreReport> {
    let manifest = verify_backup(bundle_dir)?;

    let existing = list_all_entries(store, ws_name)?.len();
    if existing > 0 || !tree.is_empty() {
        return Err(AppError::new(
            ErrorCode::EmptyWorkspaceRequired,
            "restore requires an empty workspace",
            serde_json::json!({
                "ws_name": ws_name,
                "ledger_entries": existing,
                "remote_files": tree.files.len()
            }),
        ));
    }

    let files_dir = bundle_dir.join(FILES_DIR);
    let mut restored = Vec::with_capacity(manifest.files.len());
    for file in &manifest.files {
        let ws_path = WsPath::parse(&file.path)?;
        let bytes = fs::read(files_dir.join(ws_path.as_str())).map_err(|e| {
            backup_invalid(
                "backup file disappeared during restore",
                serde_json::json!({ "error": e.to_string(), "path": file.path }),
            )
        })?;
        write_local_file(store, ws_name, &ws_path, bytes, now_ms)?;
        restored.push(ws_path);
    }

    tracing::info!(ws = %ws_name, files = restored.len(), from = %manifest.ws_name, "backup restored");
    Ok(RestoreReport { restored })
}
