use crate::{open_service, print_json};
use ns_core::app_error::AppResult;
use ns_core::backup::verify_backup;
use ns_core::service::Operation;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

use super::sync::report_outcome;

pub async fn run_create(root: &str, out_dir: Option<&str>, cancel: &CancellationToken) -> AppResult<()> {
    let service = open_service(root)?;
    let out_dir = out_dir
        .map(PathBuf::from)
        .unwrap_or_else(|| service.default_backup_dir());
    let outcome = service
        .dispatch(Operation::Backup { out_dir }, cancel, crate::now_ms())
        .await;
    report_outcome(outcome)
}

pub fn run_verify(bundle_dir: &str) -> AppResult<()> {
    let manifest = verify_backup(Path::new(bundle_dir))?;
    print_json(&manifest);
    Ok(())
}

pub async fn run_restore(root: &str, bundle_dir: &str, cancel: &CancellationToken) -> AppResult<()> {
    let service = open_service(root)?;
    let outcome = service
        .dispatch(
            Operation::Restore {
                bundle_dir: PathBuf::from(bundle_dir),
            },
            cancel,
            crate::now_ms(),
        )
        .await;
    report_outcome(outcome)
}
