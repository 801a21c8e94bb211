use crate::{now_ms, open_service, print_json};
use ns_core::app_error::{AppError, AppResult, ErrorCode};
use ns_core::service::Operation;
use ns_core::types::WsName;
use ns_core::workspace::{workspace_init, workspace_open, WorkspaceGithubConfig};
use std::path::Path;
use tokio_util::sync::CancellationToken;

use super::sync::report_outcome;

pub fn run_init(
    root: &str,
    ws_name: &str,
    owner: String,
    repo: String,
    branch: String,
    api_base: Option<String>,
) -> AppResult<()> {
    let ws_name = WsName::parse(ws_name)?;
    let workspace = workspace_init(
        Path::new(root),
        &ws_name,
        WorkspaceGithubConfig {
            owner,
            repo,
            branch,
            api_base,
        },
        now_ms(),
    )?;
    // creates the database so the first real command does not race on it
    open_service(root)?;
    print_json(&workspace);
    Ok(())
}

pub fn run_open(root: &str) -> AppResult<()> {
    let workspace = workspace_open(Path::new(root))?;
    print_json(&workspace);
    Ok(())
}

pub async fn run_set_token(root: &str, token_env: &str, cancel: &CancellationToken) -> AppResult<()> {
    let token = std::env::var(token_env).map_err(|e| {
        AppError::new(
            ErrorCode::ConfigMissing,
            "token environment variable is not set",
            serde_json::json!({ "error": e.to_string(), "env": token_env }),
        )
    })?;
    let service = open_service(root)?;
    let outcome = service
        .dispatch(Operation::UpdateGithubToken { token }, cancel, now_ms())
        .await;
    report_outcome(outcome)
}
