use crate::app_error::{AppError, AppResult, ErrorCode};
use crate::github::DEFAULT_API_BASE;
use crate::workspace::WorkspaceJsonV1;
use rusqlite::{params, Connection, OptionalExtension};
use std::fmt;

pub const TOKEN_SETTING_KEY: &str = "github_token";
pub const TOKEN_ENV: &str = "NS_GITHUB_TOKEN";
pub const API_BASE_ENV: &str = "NS_GITHUB_API_BASE";

/// Everything needed to talk to one branch. Resolved fresh at the start of
/// every operation and never mutated while it runs.
#[derive(Clone, PartialEq, Eq)]
pub struct GithubConfig {
    pub token: String,
    pub owner: String,
    pub repo: String,
    pub branch: String,
    pub api_base: String,
}

impl fmt::Debug for GithubConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GithubConfig")
            .field("token", &"<redacted>")
            .field("owner", &self.owner)
            .field("repo", &self.repo)
            .field("branch", &self.branch)
            .field("api_base", &self.api_base)
            .finish()
    }
}

fn settings_error(message: &str, e: rusqlite::Error) -> AppError {
    AppError::new(
        ErrorCode::LedgerFailed,
        message,
        serde_json::json!({ "error": e.to_string() }),
    )
}

pub fn read_setting(conn: &Connection, key: &str) -> AppResult<Option<String>> {
    conn.query_row(
        "SELECT setting_value FROM settings WHERE setting_key=?1",
        params![key],
        |row| row.get(0),
    )
    .optional()
    .map_err(|e| settings_error("failed reading setting", e))
}

pub fn write_setting(conn: &Connection, key: &str, value: &str, now_ms: i64) -> AppResult<()> {
    conn.execute(
        "INSERT INTO settings(setting_key, setting_value, updated_at_ms)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(setting_key) DO UPDATE SET
           setting_value=excluded.setting_value,
           updated_at_ms=excluded.updated_at_ms",
        params![key, value, now_ms],
    )
    .map_err(|e| settings_error("failed writing setting", e))?;
    Ok(())
}

pub fn update_github_token(conn: &Connection, token: &str, now_ms: i64) -> AppResult<()> {
    let token = token.trim();
    if token.is_empty() {
        return Err(AppError::new(
            ErrorCode::ConfigInvalid,
            "github token must not be empty",
            serde_json::json!({}),
        ));
    }
    write_setting(conn, TOKEN_SETTING_KEY, token, now_ms)?;
    tracing::info!("github token updated");
    Ok(())
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Token precedence: persisted setting, then `NS_GITHUB_TOKEN`. The API base
/// comes from `NS_GITHUB_API_BASE`, then `workspace.json`, then github.com.
pub fn load_github_config(conn: &Connection, workspace: &WorkspaceJsonV1) -> AppResult<GithubConfig> {
    let token = read_setting(conn, TOKEN_SETTING_KEY)?
        .filter(|t| !t.trim().is_empty())
        .or_else(|| non_empty_env(TOKEN_ENV))
        .ok_or_else(|| {
            AppError::new(
                ErrorCode::ConfigMissing,
                "github token is not configured",
                serde_json::json!({ "env": TOKEN_ENV }),
            )
        })?;

    let github = &workspace.github;
    if github.owner.is_empty() || github.repo.is_empty() || github.branch.is_empty() {
        return Err(AppError::new(
            ErrorCode::ConfigMissing,
            "github repository is not configured",
            serde_json::json!({ "owner": github.owner, "repo": github.repo, "branch": github.branch }),
        ));
    }

    let api_base = non_empty_env(API_BASE_ENV)
        .or_else(|| github.api_base.clone())
        .unwrap_or_else(|| DEFAULT_API_BASE.to_string());
    if !(api_base.starts_with("http://") || api_base.starts_with("https://")) {
        return Err(AppError::new(
            ErrorCode::ConfigInvalid,
            "github api base must be an http(s) url",
            serde_json::json!({ "api_base": api_base }),
        ));
    }

    Ok(GithubConfig {
        token,
        owner: github.owner.clone(),
        repo: github.repo.clone(),
        branch: github.branch.clone(),
        api_base,
    })
}
