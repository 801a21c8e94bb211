use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

/// Closed set of error codes. The code is chosen where the failure happens
/// (HTTP status, SQLite call, filesystem call) and never re-derived later.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    #[serde(rename = "NS_AUTH_FAILED")]
    AuthFailed,
    #[serde(rename = "NS_NETWORK_FAILED")]
    NetworkFailed,
    #[serde(rename = "NS_RATE_LIMITED")]
    RateLimited,
    #[serde(rename = "NS_INVALID_REMOTE_RESPONSE")]
    InvalidRemoteResponse,
    #[serde(rename = "NS_REMOTE_NOT_FOUND")]
    RemoteNotFound,
    #[serde(rename = "NS_SYNC_REMOTE_MOVED")]
    RemoteMoved,
    #[serde(rename = "NS_ABORTED")]
    Aborted,
    #[serde(rename = "NS_EMPTY_WORKSPACE_REQUIRED")]
    EmptyWorkspaceRequired,
    #[serde(rename = "NS_CONFIG_MISSING")]
    ConfigMissing,
    #[serde(rename = "NS_CONFIG_INVALID")]
    ConfigInvalid,
    #[serde(rename = "NS_WS_PATH_INVALID")]
    WsPathInvalid,
    #[serde(rename = "NS_WS_NAME_INVALID")]
    WsNameInvalid,
    #[serde(rename = "NS_LEDGER_FAILED")]
    LedgerFailed,
    #[serde(rename = "NS_ENTRY_NOT_FOUND")]
    EntryNotFound,
    #[serde(rename = "NS_CONFLICT_RESOLUTION_FAILED")]
    ConflictResolutionFailed,
    #[serde(rename = "NS_BACKUP_INVALID")]
    BackupInvalid,
    #[serde(rename = "NS_BACKUP_FAILED")]
    BackupFailed,
    #[serde(rename = "NS_WORKSPACE_INIT_FAILED")]
    WorkspaceInitFailed,
    #[serde(rename = "NS_WORKSPACE_OPEN_FAILED")]
    WorkspaceOpenFailed,
    #[serde(rename = "NS_DB_OPEN_FAILED")]
    DbOpenFailed,
    #[serde(rename = "NS_DB_MIGRATION_FAILED")]
    DbMigrationFailed,
    #[serde(rename = "NS_DB_SCHEMA_INCOMPATIBLE")]
    DbSchemaIncompatible,
    #[serde(rename = "NS_CANON_JSON_FAILED")]
    CanonJsonFailed,
    #[serde(rename = "NS_INTERNAL_ERROR")]
    Internal,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::AuthFailed => "NS_AUTH_FAILED",
            ErrorCode::NetworkFailed => "NS_NETWORK_FAILED",
            ErrorCode::RateLimited => "NS_RATE_LIMITED",
            ErrorCode::InvalidRemoteResponse => "NS_INVALID_REMOTE_RESPONSE",
            ErrorCode::RemoteNotFound => "NS_REMOTE_NOT_FOUND",
            ErrorCode::RemoteMoved => "NS_SYNC_REMOTE_MOVED",
            ErrorCode::Aborted => "NS_ABORTED",
            ErrorCode::EmptyWorkspaceRequired => "NS_EMPTY_WORKSPACE_REQUIRED",
            ErrorCode::ConfigMissing => "NS_CONFIG_MISSING",
            ErrorCode::ConfigInvalid => "NS_CONFIG_INVALID",
            ErrorCode::WsPathInvalid => "NS_WS_PATH_INVALID",
            ErrorCode::WsNameInvalid => "NS_WS_NAME_INVALID",
            ErrorCode::LedgerFailed => "NS_LEDGER_FAILED",
            ErrorCode::EntryNotFound => "NS_ENTRY_NOT_FOUND",
            ErrorCode::ConflictResolutionFailed => "NS_CONFLICT_RESOLUTION_FAILED",
            ErrorCode::BackupInvalid => "NS_BACKUP_INVALID",
            ErrorCode::BackupFailed => "NS_BACKUP_FAILED",
            ErrorCode::WorkspaceInitFailed => "NS_WORKSPACE_INIT_FAILED",
            ErrorCode::WorkspaceOpenFailed => "NS_WORKSPACE_OPEN_FAILED",
            ErrorCode::DbOpenFailed => "NS_DB_OPEN_FAILED",
            ErrorCode::DbMigrationFailed => "NS_DB_MIGRATION_FAILED",
            ErrorCode::DbSchemaIncompatible => "NS_DB_SCHEMA_INCOMPATIBLE",
            ErrorCode::CanonJsonFailed => "NS_CANON_JSON_FAILED",
            ErrorCode::Internal => "NS_INTERNAL_ERROR",
        }
    }

    pub fn category(self) -> &'static str {
        match self {
            ErrorCode::AuthFailed
            | ErrorCode::NetworkFailed
            | ErrorCode::RateLimited
            | ErrorCode::InvalidRemoteResponse
            | ErrorCode::RemoteNotFound => "remote",
            ErrorCode::RemoteMoved | ErrorCode::Aborted => "sync",
            ErrorCode::EmptyWorkspaceRequired
            | ErrorCode::WorkspaceInitFailed
            | ErrorCode::WorkspaceOpenFailed
            | ErrorCode::WsNameInvalid
            | ErrorCode::WsPathInvalid => "workspace",
            ErrorCode::ConfigMissing | ErrorCode::ConfigInvalid => "config",
            ErrorCode::LedgerFailed | ErrorCode::EntryNotFound => "ledger",
            ErrorCode::ConflictResolutionFailed => "conflict",
            ErrorCode::BackupInvalid | ErrorCode::BackupFailed => "backup",
            ErrorCode::DbOpenFailed
            | ErrorCode::DbMigrationFailed
            | ErrorCode::DbSchemaIncompatible => "db",
            ErrorCode::CanonJsonFailed => "canon_json",
            ErrorCode::Internal => "internal",
        }
    }

    /// Transient failures the caller may retry manually. The engine itself
    /// only retries `RemoteMoved`.
    pub fn retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::NetworkFailed | ErrorCode::RateLimited | ErrorCode::RemoteMoved
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppError {
    pub schema_version: u32,
    pub code: ErrorCode,
    pub category: String,
    pub message: String,
    pub retryable: bool,
    pub details: Value,
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn new(code: ErrorCode, message: &str, details: Value) -> Self {
        Self {
            schema_version: 1,
            code,
            category: code.category().to_string(),
            message: message.to_string(),
            retryable: code.retryable(),
            details,
        }
    }

    pub fn internal(message: &str) -> Self {
        Self::new(ErrorCode::Internal, message, json!({}))
    }

    pub fn aborted(operation: &str) -> Self {
        Self::new(
            ErrorCode::Aborted,
            "operation was cancelled",
            json!({ "operation": operation }),
        )
    }

    pub fn is_abort(&self) -> bool {
        self.code == ErrorCode::Aborted
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for AppError {}
