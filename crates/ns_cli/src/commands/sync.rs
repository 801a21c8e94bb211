use crate::{now_ms, open_service, print_json};
use ns_core::app_error::AppResult;
use ns_core::service::{Operation, OperationOutcome, OperationResult};
use ns_core::types::WsPath;
use tokio_util::sync::CancellationToken;

/// Prints the outcome. Only `Failed` turns into a non-zero exit; a busy lock,
/// an abort or a missing token are reported in the JSON.
pub fn report_outcome(outcome: OperationOutcome) -> AppResult<()> {
    print_json(&outcome);
    match outcome.result {
        OperationResult::Failed { error } => Err(error),
        _ => Ok(()),
    }
}

async fn dispatch(root: &str, operation: Operation, cancel: &CancellationToken) -> AppResult<()> {
    let service = open_service(root)?;
    let outcome = service.dispatch(operation, cancel, now_ms()).await;
    report_outcome(outcome)
}

pub async fn run_sync(root: &str, verbose: bool, cancel: &CancellationToken) -> AppResult<()> {
    dispatch(
        root,
        Operation::Sync {
            notify_verbose: verbose,
        },
        cancel,
    )
    .await
}

pub fn run_status(root: &str) -> AppResult<()> {
    let service = open_service(root)?;
    print_json(&service.status()?);
    Ok(())
}

pub fn run_runs(root: &str, limit: usize) -> AppResult<()> {
    let service = open_service(root)?;
    print_json(&service.recent_runs(limit)?);
    Ok(())
}

pub async fn run_conflicts(root: &str, cancel: &CancellationToken) -> AppResult<()> {
    dispatch(root, Operation::CheckForConflicts, cancel).await
}

pub async fn run_resolve(root: &str, cancel: &CancellationToken) -> AppResult<()> {
    dispatch(root, Operation::ManuallyResolveConflict, cancel).await
}

pub async fn run_discard(root: &str, cancel: &CancellationToken) -> AppResult<()> {
    dispatch(root, Operation::DiscardLocalChanges, cancel).await
}

pub async fn run_optimize(
    root: &str,
    prune_unused: bool,
    retain: &[String],
    cancel: &CancellationToken,
) -> AppResult<()> {
    let retained = retain
        .iter()
        .map(|raw| WsPath::parse(raw))
        .collect::<AppResult<Vec<_>>>()?;
    dispatch(
        root,
        Operation::OptimizeDatabase {
            prune_unused,
            retained,
        },
        cancel,
    )
    .await
}
