use crate::app_error::{AppError, AppResult};
use crate::ledger::{list_all_entries, EntryState, EntryStore};
use crate::remote::RemoteTree;
use crate::types::{WsName, WsPath};
use serde::Serialize;
use std::collections::BTreeSet;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OptimizeReport {
    pub pruned: Vec<WsPath>,
    pub stale_removed: Vec<WsPath>,
    pub kept: usize,
}

/// Drops cached entries that are safe to re-fetch. Only untouched entries
/// outside `retained` are ever removed: those whose content no longer matches
/// `tree`, and, with `prune_unused`, all the others.
pub fn optimize_database(
    store: &dyn EntryStore,
    tree: &RemoteTree,
    ws_name: &WsName,
    retained: &BTreeSet<WsPath>,
    prune_unused: bool,
    cancel: &CancellationToken,
) -> AppResult<OptimizeReport> {
    let mut report = OptimizeReport::default();
    for entry in list_all_entries(store, ws_name)? {
        if cancel.is_cancelled() {
            return Err(AppError::aborted("optimize_database"));
        }
        if entry.state() != EntryState::Untouched {
            report.kept += 1;
            continue;
        }
        if retained.contains(&entry.uid) {
            report.kept += 1;
        } else if tree.sha_for(&entry.uid) != entry.sha.as_deref() {
            store.delete(ws_name, &entry.uid)?;
            report.stale_removed.push(entry.uid);
        } else if prune_unused {
            store.delete(ws_name, &entry.uid)?;
            report.pruned.push(entry.uid);
        } else {
            report.kept += 1;
        }
    }

    tracing::info!(
        ws = %ws_name,
        pruned = report.pruned.len(),
        stale_removed = report.stale_removed.len(),
        kept = report.kept,
        "optimized ledger"
    );
    Ok(report)
}
