use crate::{now_ms, open_service, print_json};
use ns_core::app_error::{AppError, AppResult, ErrorCode};
use ns_core::ledger::EntryState;
use ns_core::types::WsPath;
use serde::Serialize;
use std::io::{Read, Write};
use tokio_util::sync::CancellationToken;

#[derive(Serialize)]
struct FileListing {
    ws_path: WsPath,
    state: EntryState,
    sha: Option<String>,
    local_sha: String,
    bytes: usize,
}

fn io_error(message: &str, e: std::io::Error, path: &str) -> AppError {
    AppError::new(
        ErrorCode::Internal,
        message,
        serde_json::json!({ "error": e.to_string(), "path": path }),
    )
}

pub fn run_write(root: &str, ws_path: &str, source: Option<&str>) -> AppResult<()> {
    let ws_path = WsPath::parse(ws_path)?;
    let bytes = match source {
        Some(path) if path != "-" => {
            std::fs::read(path).map_err(|e| io_error("failed reading source file", e, path))?
        }
        _ => {
            let mut buf = Vec::new();
            std::io::stdin()
                .read_to_end(&mut buf)
                .map_err(|e| io_error("failed reading stdin", e, "-"))?;
            buf
        }
    };
    let service = open_service(root)?;
    let entry = service.write_file(&ws_path, bytes, now_ms())?;
    tracing::debug!(path = %ws_path, state = ?entry.state(), "file written");
    print_json(&entry);
    Ok(())
}

/// Writes the raw content to stdout.
pub async fn run_read(root: &str, ws_path: &str, cancel: &CancellationToken) -> AppResult<()> {
    let ws_path = WsPath::parse(ws_path)?;
    let service = open_service(root)?;
    let bytes = service
        .read_file(&ws_path, cancel, now_ms())
        .await?
        .ok_or_else(|| {
            AppError::new(
                ErrorCode::EntryNotFound,
                "file does not exist",
                serde_json::json!({ "ws_path": ws_path }),
            )
        })?;
    let mut stdout = std::io::stdout().lock();
    stdout
        .write_all(&bytes)
        .and_then(|_| stdout.flush())
        .map_err(|e| io_error("failed writing to stdout", e, "-"))
}

pub async fn run_delete(root: &str, ws_path: &str, cancel: &CancellationToken) -> AppResult<()> {
    let ws_path = WsPath::parse(ws_path)?;
    let service = open_service(root)?;
    service.delete_file(&ws_path, cancel, now_ms()).await?;
    print_json(&serde_json::json!({ "deleted": ws_path }));
    Ok(())
}

pub fn run_list(root: &str) -> AppResult<()> {
    let service = open_service(root)?;
    let listing: Vec<FileListing> = service
        .list_files()?
        .into_iter()
        .map(|entry| FileListing {
            state: entry.state(),
            bytes: entry.local_content.len(),
            ws_path: entry.uid,
            sha: entry.sha,
            local_sha: entry.local_sha,
        })
        .collect();
    print_json(&listing);
    Ok(())
}
