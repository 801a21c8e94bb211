use crate::app_error::{AppError, AppResult, ErrorCode};
use crate::types::WsName;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const WORKSPACE_FILE: &str = "workspace.json";
const WORKSPACE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceJsonV1 {
    pub schema_version: u32,
    pub workspace_id: String,
    pub ws_name: String,
    pub created_at_ms: i64,
    pub db: WorkspaceDbConfig,
    pub github: WorkspaceGithubConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceDbConfig {
    pub relative_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceGithubConfig {
    pub owner: String,
    pub repo: String,
    pub branch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WorkspacePaths {
    pub root: PathBuf,
    pub workspace_json: PathBuf,
    pub db: PathBuf,
    pub backups_dir: PathBuf,
}

impl WorkspaceJsonV1 {
    pub fn ws_name(&self) -> AppResult<WsName> {
        WsName::parse(&self.ws_name)
    }
}

pub fn workspace_paths(root: &Path) -> WorkspacePaths {
    WorkspacePaths {
        root: root.to_path_buf(),
        workspace_json: root.join(WORKSPACE_FILE),
        db: root.join("db/notesync.sqlite"),
        backups_dir: root.join("backups"),
    }
}

pub fn workspace_init(
    root: &Path,
    ws_name: &WsName,
    github: WorkspaceGithubConfig,
    now_ms: i64,
) -> AppResult<WorkspaceJsonV1> {
    let paths = workspace_paths(root);
    if paths.workspace_json.exists() {
        return Err(AppError::new(
            ErrorCode::WorkspaceInitFailed,
            "workspace.json already exists",
            serde_json::json!({ "path": paths.workspace_json }),
        ));
    }
    if github.owner.trim().is_empty() || github.repo.trim().is_empty() || github.branch.trim().is_empty() {
        return Err(AppError::new(
            ErrorCode::ConfigInvalid,
            "github owner, repo and branch must be non-empty",
            serde_json::json!({ "owner": github.owner, "repo": github.repo, "branch": github.branch }),
        ));
    }

    let db_dir = paths.db.parent().ok_or_else(|| {
        AppError::new(
            ErrorCode::WorkspaceInitFailed,
            "unable to resolve db parent directory",
            serde_json::json!({ "root": root }),
        )
    })?;
    fs::create_dir_all(db_dir).map_err(|e| {
        AppError::new(
            ErrorCode::WorkspaceInitFailed,
            "failed to create db directory",
            serde_json::json!({ "error": e.to_string(), "path": db_dir }),
        )
    })?;

    let workspace = WorkspaceJsonV1 {
        schema_version: WORKSPACE_SCHEMA_VERSION,
        workspace_id: Uuid::new_v4().to_string(),
        ws_name: ws_name.as_str().to_string(),
        created_at_ms: now_ms,
        db: WorkspaceDbConfig {
            relative_path: "db/notesync.sqlite".to_string(),
        },
        github,
    };
    workspace_save(root, &workspace)?;
    tracing::info!(ws = %ws_name, root = %root.display(), "initialized workspace");
    Ok(workspace)
}

pub fn workspace_save(root: &Path, workspace: &WorkspaceJsonV1) -> AppResult<()> {
    let bytes = serde_json::to_vec_pretty(workspace).map_err(|e| {
        AppError::new(
            ErrorCode::WorkspaceInitFailed,
            "failed to serialize workspace.json",
            serde_json::json!({ "error": e.to_string() }),
        )
    })?;
    fs::write(root.join(WORKSPACE_FILE), bytes).map_err(|e| {
        AppError::new(
            ErrorCode::WorkspaceInitFailed,
            "failed to write workspace.json",
            serde_json::json!({ "error": e.to_string() }),
        )
    })
}

pub fn workspace_open(root: &Path) -> AppResult<WorkspaceJsonV1> {
    let path = root.join(WORKSPACE_FILE);
    let bytes = fs::read(&path).map_err(|e| {
        let message = if e.kind() == std::io::ErrorKind::NotFound {
            "workspace.json is missing"
        } else {
            "failed to read workspace.json"
        };
        AppError::new(
            ErrorCode::WorkspaceOpenFailed,
            message,
            serde_json::json!({ "error": e.to_string(), "path": path }),
        )
    })?;

    let workspace: WorkspaceJsonV1 = serde_json::from_slice(&bytes).map_err(|e| {
        AppError::new(
            ErrorCode::WorkspaceOpenFailed,
            "failed to parse workspace.json",
            serde_json::json!({ "error": e.to_string(), "path": path }),
        )
    })?;

    if workspace.schema_version != WORKSPACE_SCHEMA_VERSION {
        return Err(AppError::new(
            ErrorCode::WorkspaceOpenFailed,
            "unsupported workspace schema_version",
            serde_json::json!({
                "schema_version": workspace.schema_version,
                "supported": [WORKSPACE_SCHEMA_VERSION]
            }),
        ));
    }
    workspace.ws_name()?;
    Ok(workspace)
}
