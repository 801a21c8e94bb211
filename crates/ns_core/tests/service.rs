use ns_core::config::{GithubConfig, TOKEN_ENV};
use ns_core::ledger::EntryState;
use ns_core::lock::SyncLocks;
use ns_core::notify::{NotificationAction, Severity};
use ns_core::remote::RemoteRepo;
use ns_core::remote_memory::MemoryRepo;
use ns_core::service::{Operation, OperationResult, RemoteConnector, SyncService};
use ns_core::sync::SyncResult;
use ns_core::types::{WsName, WsPath};
use ns_core::workspace::{workspace_init, WorkspaceGithubConfig};
use ns_core::ErrorCode;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn path(raw: &str) -> WsPath {
    WsPath::parse(raw).expect("ws path")
}

fn connector(repo: &Arc<MemoryRepo>) -> RemoteConnector {
    let repo = Arc::clone(repo);
    Box::new(move |_config: &GithubConfig| Ok(Box::new(Arc::clone(&repo)) as Box<dyn RemoteRepo>))
}

fn test_locks() -> &'static SyncLocks {
    Box::leak(Box::new(SyncLocks::new()))
}

fn init(root: &Path) {
    workspace_init(
        root,
        &WsName::parse("Notes").expect("ws name"),
        WorkspaceGithubConfig {
            owner: "octo".to_string(),
            repo: "notes".to_string(),
            branch: "main".to_string(),
            api_base: None,
        },
        1,
    )
    .expect("workspace init");
}

async fn open_configured(root: &Path, repo: &Arc<MemoryRepo>, locks: &'static SyncLocks) -> SyncService {
    init(root);
    let service = SyncService::open(root, connector(repo))
        .expect("open service")
        .with_locks(locks);
    let outcome = service
        .dispatch(
            Operation::UpdateGithubToken {
                token: "test-token".to_string(),
            },
            &CancellationToken::new(),
            2,
        )
        .await;
    assert_eq!(outcome.result, OperationResult::TokenUpdated);
    service
}

#[tokio::test]
async fn sync_without_token_reports_not_configured() {
    std::env::remove_var(TOKEN_ENV);
    let temp = tempfile::tempdir().expect("tempdir");
    init(temp.path());
    let repo = Arc::new(MemoryRepo::new());
    let service = SyncService::open(temp.path(), connector(&repo))
        .expect("open service")
        .with_locks(test_locks());

    let outcome = service
        .dispatch(Operation::Sync { notify_verbose: true }, &CancellationToken::new(), 3)
        .await;
    assert!(matches!(outcome.result, OperationResult::NotConfigured { .. }));
    let notification = outcome.notification.expect("notification");
    assert_eq!(notification.action, Some(NotificationAction::UpdateGithubToken));
    assert_eq!(repo.stats().expect("stats").fetch_tree, 0);
    assert!(service.recent_runs(10).expect("runs").is_empty());

    // local reads and writes work without GitHub
    service.write_file(&path("a.md"), b"a".to_vec(), 4).expect("write");
    let read = service
        .read_file(&path("a.md"), &CancellationToken::new(), 5)
        .await
        .expect("read");
    assert_eq!(read.as_deref(), Some(&b"a"[..]));
}

#[tokio::test]
async fn sync_pushes_and_records_run() {
    let temp = tempfile::tempdir().expect("tempdir");
    let repo = Arc::new(MemoryRepo::new());
    let service = open_configured(temp.path(), &repo, test_locks()).await;
    service.write_file(&path("notes/a.md"), b"hello\n".to_vec(), 3).expect("write");

    let status = service.status().expect("status");
    assert_eq!(status.pending.len(), 1);
    assert_eq!(status.pending[0].state, EntryState::New);

    let outcome = service
        .dispatch(Operation::Sync { notify_verbose: false }, &CancellationToken::new(), 4)
        .await;
    assert_eq!(
        outcome.result,
        OperationResult::Synced {
            sync: SyncResult::Ok { count: 1 }
        }
    );
    let notification = outcome.notification.expect("notification");
    assert_eq!(notification.title, "GitHub sync completed");
    assert_eq!(
        repo.file(&path("notes/a.md")).expect("file").as_deref(),
        Some(&b"hello\n"[..])
    );

    let quiet = service
        .dispatch(Operation::Sync { notify_verbose: false }, &CancellationToken::new(), 5)
        .await;
    assert!(quiet.notification.is_none());

    let status = service.status().expect("status");
    assert!(status.pending.is_empty());
    assert!(!status.locked);
    let last = status.last_run.expect("last run");
    assert_eq!(last.operation, "sync");
    assert_eq!(last.status, "ok");
    assert_eq!(last.change_count, 0);
    assert_eq!(service.recent_runs(10).expect("runs").len(), 2);
}

#[tokio::test]
async fn conflict_is_stored_then_resolved_manually() {
    let temp = tempfile::tempdir().expect("tempdir");
    let repo = Arc::new(MemoryRepo::new());
    let service = open_configured(temp.path(), &repo, test_locks()).await;
    let cancel = CancellationToken::new();

    service.write_file(&path("a.md"), b"v1".to_vec(), 3).expect("write");
    service
        .dispatch(Operation::Sync { notify_verbose: false }, &cancel, 4)
        .await;
    service.write_file(&path("a.md"), b"local".to_vec(), 5).expect("edit");
    repo.set_file(&path("a.md"), b"remote").expect("remote edit");

    let outcome = service
        .dispatch(Operation::Sync { notify_verbose: false }, &cancel, 6)
        .await;
    assert_eq!(
        outcome.result,
        OperationResult::Synced {
            sync: SyncResult::MergeConflict {
                conflict: vec![path("a.md")]
            }
        }
    );
    assert_eq!(
        outcome.notification.expect("notification").action,
        Some(NotificationAction::ResolveConflict)
    );
    assert_eq!(service.conflicted_ws_paths().expect("conflicts"), vec![path("a.md")]);
    assert_eq!(service.recent_runs(1).expect("runs")[0].status, "merge-conflict");

    let checked = service.dispatch(Operation::CheckForConflicts, &cancel, 7).await;
    assert_eq!(
        checked.result,
        OperationResult::Conflicts {
            conflict: vec![path("a.md")]
        }
    );

    let resolved = service.dispatch(Operation::ManuallyResolveConflict, &cancel, 8).await;
    let OperationResult::ConflictsResolved { report } = resolved.result else {
        panic!("unexpected result: {:?}", resolved.result);
    };
    assert!(report.failed.is_empty());
    assert_eq!(report.resolved[0].local_content_ws_path, Some(path("a-conflict.md")));
    assert!(service.conflicted_ws_paths().expect("conflicts").is_empty());

    let outcome = service
        .dispatch(Operation::Sync { notify_verbose: false }, &cancel, 9)
        .await;
    assert_eq!(
        outcome.result,
        OperationResult::Synced {
            sync: SyncResult::Ok { count: 1 }
        }
    );
    assert_eq!(
        repo.file(&path("a-conflict.md")).expect("file").as_deref(),
        Some(&b"local"[..])
    );
}

#[tokio::test]
async fn busy_lock_is_reported_not_failed() {
    let temp = tempfile::tempdir().expect("tempdir");
    let repo = Arc::new(MemoryRepo::new());
    let locks = test_locks();
    let service = open_configured(temp.path(), &repo, locks).await;
    service.write_file(&path("a.md"), b"a".to_vec(), 3).expect("write");

    let _held = locks.try_acquire(service.ws_name()).expect("hold lock");
    let outcome = service
        .dispatch(Operation::Sync { notify_verbose: false }, &CancellationToken::new(), 4)
        .await;
    assert_eq!(outcome.result, OperationResult::LockBusy);
    assert_eq!(outcome.notification.expect("notification").severity, Severity::Info);
    assert_eq!(repo.stats().expect("stats").fetch_tree, 0);
    assert_eq!(service.recent_runs(1).expect("runs")[0].status, "lock-busy");
    assert!(service.status().expect("status").locked);
}

#[tokio::test]
async fn failures_are_recorded_with_their_code() {
    let temp = tempfile::tempdir().expect("tempdir");
    let repo = Arc::new(MemoryRepo::new());
    let service = open_configured(temp.path(), &repo, test_locks()).await;
    repo.fail_next(ns_core::remote_memory::RemoteCall::FetchTree, ErrorCode::AuthFailed)
        .expect("arm");

    let outcome = service
        .dispatch(Operation::Sync { notify_verbose: false }, &CancellationToken::new(), 3)
        .await;
    let OperationResult::Failed { error } = &outcome.result else {
        panic!("unexpected result: {:?}", outcome.result);
    };
    assert_eq!(error.code, ErrorCode::AuthFailed);
    let notification = outcome.notification.expect("notification");
    assert_eq!(notification.title, "GitHub login failed");
    let run = &service.recent_runs(1).expect("runs")[0];
    assert_eq!(run.status, "failed");
    assert_eq!(run.error_code.as_deref(), Some("NS_AUTH_FAILED"));

    let cancel = CancellationToken::new();
    cancel.cancel();
    let aborted = service
        .dispatch(Operation::Sync { notify_verbose: false }, &cancel, 4)
        .await;
    assert_eq!(aborted.result, OperationResult::Aborted);
    assert!(aborted.notification.is_none());
    assert_eq!(service.recent_runs(1).expect("runs")[0].status, "aborted");
}

#[tokio::test]
async fn optimize_prunes_then_syncs() {
    let temp = tempfile::tempdir().expect("tempdir");
    let repo = Arc::new(MemoryRepo::new());
    let service = open_configured(temp.path(), &repo, test_locks()).await;
    let cancel = CancellationToken::new();

    service.write_file(&path("a.md"), b"a".to_vec(), 3).expect("write");
    service.write_file(&path("b.md"), b"b".to_vec(), 3).expect("write");
    service
        .dispatch(Operation::Sync { notify_verbose: false }, &cancel, 4)
        .await;
    service.write_file(&path("b.md"), b"b2".to_vec(), 5).expect("edit");

    let outcome = service
        .dispatch(
            Operation::OptimizeDatabase {
                prune_unused: true,
                retained: vec![path("b.md")],
            },
            &cancel,
            6,
        )
        .await;
    let OperationResult::Optimized { report, sync } = outcome.result else {
        panic!("unexpected result: {:?}", outcome.result);
    };
    assert_eq!(report.pruned, vec![path("a.md")]);
    assert_eq!(sync, Some(SyncResult::Ok { count: 1 }));
    assert_eq!(repo.file(&path("b.md")).expect("file").as_deref(), Some(&b"b2"[..]));
    // pruned content is still on the remote and reads back through the cache
    let tracked: Vec<WsPath> = service
        .list_files()
        .expect("list")
        .into_iter()
        .map(|e| e.uid)
        .collect();
    assert_eq!(tracked, vec![path("b.md")]);
    let read = service.read_file(&path("a.md"), &cancel, 7).await.expect("read");
    assert_eq!(read.as_deref(), Some(&b"a"[..]));
}

#[tokio::test]
async fn discard_clears_stored_conflicts_only_when_complete() {
    let temp = tempfile::tempdir().expect("tempdir");
    let repo = Arc::new(MemoryRepo::new());
    let service = open_configured(temp.path(), &repo, test_locks()).await;
    let cancel = CancellationToken::new();

    service.write_file(&path("a.md"), b"v1".to_vec(), 3).expect("write");
    service
        .dispatch(Operation::Sync { notify_verbose: false }, &cancel, 4)
        .await;
    service.write_file(&path("a.md"), b"local".to_vec(), 5).expect("edit");
    service.write_file(&path("new.md"), b"n".to_vec(), 5).expect("create");
    repo.set_file(&path("a.md"), b"remote").expect("remote edit");
    service
        .dispatch(Operation::Sync { notify_verbose: false }, &cancel, 6)
        .await;
    assert_eq!(service.conflicted_ws_paths().expect("conflicts"), vec![path("a.md")]);

    let partial = service.dispatch(Operation::DiscardLocalChanges, &cancel, 7).await;
    assert_eq!(partial.result, OperationResult::Discarded { all_discarded: false });
    assert_eq!(service.conflicted_ws_paths().expect("conflicts"), vec![path("a.md")]);

    service.delete_file(&path("new.md"), &cancel, 8).await.expect("delete new");
    let complete = service.dispatch(Operation::DiscardLocalChanges, &cancel, 9).await;
    assert_eq!(complete.result, OperationResult::Discarded { all_discarded: true });
    assert!(service.conflicted_ws_paths().expect("conflicts").is_empty());

    // the reset entry now pulls the remote edit cleanly
    let outcome = service
        .dispatch(Operation::Sync { notify_verbose: false }, &cancel, 10)
        .await;
    assert_eq!(
        outcome.result,
        OperationResult::Synced {
            sync: SyncResult::Ok { count: 1 }
        }
    );
}

#[tokio::test]
async fn backup_then_restore_into_fresh_workspace() {
    let source_dir = tempfile::tempdir().expect("tempdir");
    let source_repo = Arc::new(MemoryRepo::new());
    let source = open_configured(source_dir.path(), &source_repo, test_locks()).await;
    let cancel = CancellationToken::new();
    source.write_file(&path("a.md"), b"a".to_vec(), 3).expect("write");
    source_repo.set_file(&path("remote.md"), b"r").expect("seed remote");

    let outcome = source
        .dispatch(
            Operation::Backup {
                out_dir: source.default_backup_dir(),
            },
            &cancel,
            4,
        )
        .await;
    let OperationResult::BackedUp { report } = outcome.result else {
        panic!("unexpected result: {:?}", outcome.result);
    };
    assert_eq!(report.file_count, 2);

    let refused = source
        .dispatch(
            Operation::Restore {
                bundle_dir: report.bundle_dir.clone(),
            },
            &cancel,
            5,
        )
        .await;
    let OperationResult::Failed { error } = &refused.result else {
        panic!("unexpected result: {:?}", refused.result);
    };
    assert_eq!(error.code, ErrorCode::EmptyWorkspaceRequired);

    let target_dir = tempfile::tempdir().expect("tempdir");
    let target_repo = Arc::new(MemoryRepo::new());
    let target = open_configured(target_dir.path(), &target_repo, test_locks()).await;
    let restored = target
        .dispatch(
            Operation::Restore {
                bundle_dir: report.bundle_dir.clone(),
            },
            &cancel,
            6,
        )
        .await;
    let OperationResult::Restored { report } = restored.result else {
        panic!("unexpected result: {:?}", restored.result);
    };
    assert_eq!(report.restored, vec![path("a.md"), path("remote.md")]);
    let status = target.status().expect("status");
    assert_eq!(status.pending.len(), 2);
}
