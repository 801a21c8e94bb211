use async_trait::async_trait;
use ns_core::app_error::AppResult;
use ns_core::hashing::git_blob_sha;
use ns_core::ledger::{
    delete_local_file, record_synced, write_local_file, EntryState, EntryStore, FileEntry,
    MemoryEntryStore,
};
use ns_core::remote::{RemoteChange, RemoteRepo, RemoteTree};
use ns_core::remote_memory::{MemoryRepo, RemoteCall};
use ns_core::sync::{github_sync, plan_sync, SyncAction, SyncResult};
use ns_core::types::{WsName, WsPath};
use ns_core::ErrorCode;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

fn ws() -> WsName {
    WsName::parse("Notes").expect("ws name")
}

fn path(raw: &str) -> WsPath {
    WsPath::parse(raw).expect("ws path")
}

/// Remote and ledger both hold `content` at `raw`, fully synced.
fn seed_synced(store: &MemoryEntryStore, remote: &MemoryRepo, raw: &str, content: &[u8]) {
    let sha = remote.set_file(&path(raw), content).expect("seed remote");
    record_synced(store, &ws(), &path(raw), content.to_vec(), sha, 1).expect("seed ledger");
}

fn entry(store: &MemoryEntryStore, raw: &str) -> Option<FileEntry> {
    store.get(&ws(), &path(raw)).expect("get entry")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EditPoint {
    Upload,
    Fetch,
}

/// Wraps a repo and writes to the ledger the first time `point` is reached,
/// the way a user edit lands while a pass is in flight.
struct EditingRemote<'a> {
    inner: &'a MemoryRepo,
    store: &'a MemoryEntryStore,
    point: EditPoint,
    edit: Mutex<Option<(WsPath, Option<Vec<u8>>)>>,
}

impl<'a> EditingRemote<'a> {
    fn new(inner: &'a MemoryRepo, store: &'a MemoryEntryStore, point: EditPoint, raw: &str, bytes: Option<&[u8]>) -> Self {
        Self {
            inner,
            store,
            point,
            edit: Mutex::new(Some((path(raw), bytes.map(<[u8]>::to_vec)))),
        }
    }

    fn maybe_edit(&self, point: EditPoint) {
        if point != self.point {
            return;
        }
        let Some((ws_path, bytes)) = self.edit.lock().expect("edit lock").take() else {
            return;
        };
        match bytes {
            Some(bytes) => {
                write_local_file(self.store, &ws(), &ws_path, bytes, 5).expect("edit during sync");
            }
            None => delete_local_file(self.store, &ws(), &ws_path, None, 5).expect("delete during sync"),
        }
    }
}

#[async_trait]
impl RemoteRepo for EditingRemote<'_> {
    fn describe(&self) -> String {
        self.inner.describe()
    }

    async fn fetch_tree(&self, cancel: &CancellationToken) -> AppResult<RemoteTree> {
        self.inner.fetch_tree(cancel).await
    }

    async fn fetch_blob(&self, blob_sha: &str, cancel: &CancellationToken) -> AppResult<Vec<u8>> {
        self.maybe_edit(EditPoint::Fetch);
        self.inner.fetch_blob(blob_sha, cancel).await
    }

    async fn upload_blob(&self, bytes: &[u8], cancel: &CancellationToken) -> AppResult<String> {
        self.maybe_edit(EditPoint::Upload);
        self.inner.upload_blob(bytes, cancel).await
    }

    async fn commit_changes(
        &self,
        base: &RemoteTree,
        changes: &[RemoteChange],
        message: &str,
        cancel: &CancellationToken,
    ) -> AppResult<String> {
        self.inner.commit_changes(base, changes, message, cancel).await
    }
}

#[tokio::test]
async fn local_modification_is_pushed() {
    let store = MemoryEntryStore::new();
    let remote = MemoryRepo::new();
    seed_synced(&store, &remote, "a.md", b"v1");
    write_local_file(&store, &ws(), &path("a.md"), b"v2".to_vec(), 2).expect("edit");

    let result = github_sync(&store, &remote, &ws(), &CancellationToken::new(), 3)
        .await
        .expect("sync");
    assert_eq!(result, SyncResult::Ok { count: 1 });

    assert_eq!(remote.file(&path("a.md")).expect("file").as_deref(), Some(&b"v2"[..]));
    let synced = entry(&store, "a.md").expect("entry");
    assert_eq!(synced.sha.as_deref(), Some(git_blob_sha(b"v2").as_str()));
    assert_eq!(synced.state(), EntryState::Untouched);
    assert_eq!(remote.stats().expect("stats").commit, 1);
}

#[tokio::test]
async fn divergent_edits_conflict_without_mutation() {
    let store = MemoryEntryStore::new();
    let remote = MemoryRepo::new();
    seed_synced(&store, &remote, "a.md", b"v1");
    seed_synced(&store, &remote, "b.md", b"b1");
    write_local_file(&store, &ws(), &path("a.md"), b"v2".to_vec(), 2).expect("local edit");
    write_local_file(&store, &ws(), &path("b.md"), b"b2".to_vec(), 2).expect("local edit");
    remote.set_file(&path("a.md"), b"v3").expect("remote edit");
    let head = remote.head().expect("head");

    let result = github_sync(&store, &remote, &ws(), &CancellationToken::new(), 3)
        .await
        .expect("sync");
    assert_eq!(
        result,
        SyncResult::MergeConflict {
            conflict: vec![path("a.md")]
        }
    );

    // b.md was pushable but nothing moves while a conflict is open
    assert_eq!(remote.head().expect("head"), head);
    assert_eq!(remote.file(&path("b.md")).expect("file").as_deref(), Some(&b"b1"[..]));
    assert_eq!(entry(&store, "a.md").expect("a").local_content, b"v2");
    assert_eq!(entry(&store, "b.md").expect("b").state(), EntryState::Modified);
}

#[tokio::test]
async fn second_sync_is_a_no_op() {
    let store = MemoryEntryStore::new();
    let remote = MemoryRepo::new();
    seed_synced(&store, &remote, "a.md", b"v1");
    write_local_file(&store, &ws(), &path("new.md"), b"n".to_vec(), 2).expect("new file");
    remote.set_file(&path("a.md"), b"v9").expect("remote edit");

    let cancel = CancellationToken::new();
    let first = github_sync(&store, &remote, &ws(), &cancel, 3).await.expect("first sync");
    assert_eq!(first, SyncResult::Ok { count: 2 });
    let second = github_sync(&store, &remote, &ws(), &cancel, 4).await.expect("second sync");
    assert_eq!(second, SyncResult::Ok { count: 0 });
    assert_eq!(remote.stats().expect("stats").commit, 1);
}

#[tokio::test]
async fn remote_changes_are_pulled_and_remote_deletions_applied() {
    let store = MemoryEntryStore::new();
    let remote = MemoryRepo::new();
    seed_synced(&store, &remote, "a.md", b"v1");
    seed_synced(&store, &remote, "gone.md", b"g");
    remote.set_file(&path("a.md"), b"v2").expect("remote edit");
    remote.remove_file(&path("gone.md")).expect("remote delete");

    let result = github_sync(&store, &remote, &ws(), &CancellationToken::new(), 3)
        .await
        .expect("sync");
    assert_eq!(result, SyncResult::Ok { count: 2 });

    let pulled = entry(&store, "a.md").expect("a");
    assert_eq!(pulled.local_content, b"v2");
    assert_eq!(pulled.state(), EntryState::Untouched);
    assert!(entry(&store, "gone.md").is_none());
    assert_eq!(remote.stats().expect("stats").commit, 0);
}

#[tokio::test]
async fn local_create_and_delete_are_pushed_in_one_commit() {
    let store = MemoryEntryStore::new();
    let remote = MemoryRepo::new();
    seed_synced(&store, &remote, "old.md", b"o");
    write_local_file(&store, &ws(), &path("notes/new.md"), b"n".to_vec(), 2).expect("create");
    delete_local_file(&store, &ws(), &path("old.md"), None, 2).expect("delete");

    let result = github_sync(&store, &remote, &ws(), &CancellationToken::new(), 3)
        .await
        .expect("sync");
    assert_eq!(result, SyncResult::Ok { count: 2 });

    assert_eq!(remote.file(&path("notes/new.md")).expect("file").as_deref(), Some(&b"n"[..]));
    assert!(remote.file(&path("old.md")).expect("file").is_none());
    assert!(entry(&store, "old.md").is_none());
    assert_eq!(entry(&store, "notes/new.md").expect("new").state(), EntryState::Untouched);
    assert_eq!(remote.stats().expect("stats").commit, 1);
}

#[tokio::test]
async fn identical_divergent_content_is_adopted() {
    let store = MemoryEntryStore::new();
    let remote = MemoryRepo::new();
    seed_synced(&store, &remote, "a.md", b"v1");
    write_local_file(&store, &ws(), &path("a.md"), b"same".to_vec(), 2).expect("local edit");
    remote.set_file(&path("a.md"), b"same").expect("remote edit");
    write_local_file(&store, &ws(), &path("both-new.md"), b"x".to_vec(), 2).expect("local create");
    remote.set_file(&path("both-new.md"), b"x").expect("remote create");

    let result = github_sync(&store, &remote, &ws(), &CancellationToken::new(), 3)
        .await
        .expect("sync");
    assert_eq!(result, SyncResult::Ok { count: 0 });
    assert_eq!(entry(&store, "a.md").expect("a").state(), EntryState::Untouched);
    assert_eq!(entry(&store, "both-new.md").expect("new").state(), EntryState::Untouched);
}

#[tokio::test]
async fn moved_branch_is_retried_then_gives_up() {
    let store = MemoryEntryStore::new();
    let remote = MemoryRepo::new();
    seed_synced(&store, &remote, "a.md", b"v1");
    write_local_file(&store, &ws(), &path("a.md"), b"v2".to_vec(), 2).expect("edit");

    remote.move_head_before_commit(1).expect("arm");
    let result = github_sync(&store, &remote, &ws(), &CancellationToken::new(), 3)
        .await
        .expect("sync after retry");
    assert_eq!(result, SyncResult::Ok { count: 1 });
    assert_eq!(remote.stats().expect("stats").fetch_tree, 2);

    write_local_file(&store, &ws(), &path("a.md"), b"v3".to_vec(), 4).expect("edit");
    remote.move_head_before_commit(3).expect("arm");
    let err = github_sync(&store, &remote, &ws(), &CancellationToken::new(), 5)
        .await
        .expect_err("retries exhausted");
    assert_eq!(err.code, ErrorCode::RemoteMoved);
    assert!(err.retryable);
    assert_eq!(entry(&store, "a.md").expect("a").state(), EntryState::Modified);
}

#[tokio::test]
async fn cancelled_sync_issues_no_requests() {
    let store = MemoryEntryStore::new();
    let remote = MemoryRepo::new();
    seed_synced(&store, &remote, "a.md", b"v1");
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = github_sync(&store, &remote, &ws(), &cancel, 2).await.expect_err("aborted");
    assert!(err.is_abort());
    assert_eq!(remote.stats().expect("stats").fetch_tree, 0);
}

#[tokio::test]
async fn failed_commit_leaves_ledger_untouched() {
    let store = MemoryEntryStore::new();
    let remote = MemoryRepo::new();
    seed_synced(&store, &remote, "a.md", b"v1");
    write_local_file(&store, &ws(), &path("a.md"), b"v2".to_vec(), 2).expect("edit");
    remote.fail_next(RemoteCall::Commit, ErrorCode::NetworkFailed).expect("arm");

    let err = github_sync(&store, &remote, &ws(), &CancellationToken::new(), 3)
        .await
        .expect_err("network failure");
    assert_eq!(err.code, ErrorCode::NetworkFailed);
    assert_eq!(entry(&store, "a.md").expect("a").state(), EntryState::Modified);
    assert_eq!(remote.file(&path("a.md")).expect("file").as_deref(), Some(&b"v1"[..]));
}

#[test]
fn plan_follows_three_way_table() {
    let sha = |b: &[u8]| git_blob_sha(b);
    let synced = |raw: &str, b: &[u8]| FileEntry::synced(path(raw), b.to_vec(), sha(b), 1);
    let modified = |raw: &str, base: &[u8], local: &[u8]| {
        let mut e = synced(raw, base);
        e.set_local_content(local.to_vec(), 2);
        e
    };
    let deleted = |raw: &str, base: &[u8]| {
        let mut e = synced(raw, base);
        e.deleted = true;
        e
    };

    let entries = vec![
        synced("untouched-same.md", b"1"),
        synced("untouched-changed.md", b"1"),
        synced("untouched-gone.md", b"1"),
        modified("modified-same.md", b"1", b"2"),
        modified("modified-changed.md", b"1", b"2"),
        modified("modified-gone.md", b"1", b"2"),
        FileEntry::new_local(path("new-absent.md"), b"n".to_vec(), 1),
        FileEntry::new_local(path("new-present.md"), b"n".to_vec(), 1),
        deleted("deleted-same.md", b"1"),
        deleted("deleted-changed.md", b"1"),
        deleted("deleted-gone.md", b"1"),
    ];
    let mut tree = RemoteTree::default();
    for (raw, content) in [
        ("untouched-same.md", &b"1"[..]),
        ("untouched-changed.md", &b"9"[..]),
        ("modified-same.md", &b"1"[..]),
        ("modified-changed.md", &b"9"[..]),
        ("new-present.md", &b"other"[..]),
        ("deleted-same.md", &b"1"[..]),
        ("deleted-changed.md", &b"9"[..]),
    ] {
        tree.files.insert(path(raw), sha(content));
    }

    let plan = plan_sync(&entries, &tree);
    assert_eq!(
        plan.conflicts,
        vec![
            path("deleted-changed.md"),
            path("modified-changed.md"),
            path("modified-gone.md"),
            path("new-present.md"),
        ]
    );
    assert_eq!(
        plan.actions,
        vec![
            SyncAction::Pull {
                ws_path: path("untouched-changed.md"),
                remote_sha: sha(b"9")
            },
            SyncAction::RemoteRemoved {
                ws_path: path("untouched-gone.md")
            },
            SyncAction::Push {
                ws_path: path("modified-same.md"),
                local_sha: sha(b"2")
            },
            SyncAction::Push {
                ws_path: path("new-absent.md"),
                local_sha: sha(b"n")
            },
            SyncAction::PushDelete {
                ws_path: path("deleted-same.md")
            },
            SyncAction::DropLocal {
                ws_path: path("deleted-gone.md")
            },
        ]
    );
    assert_eq!(plan.change_count(), 5);
}

#[tokio::test]
async fn edit_during_push_is_kept_for_next_pass() {
    let store = MemoryEntryStore::new();
    let remote = MemoryRepo::new();
    seed_synced(&store, &remote, "a.md", b"v1");
    write_local_file(&store, &ws(), &path("a.md"), b"v2".to_vec(), 2).expect("edit");
    let editing = EditingRemote::new(&remote, &store, EditPoint::Upload, "a.md", Some(b"v3-typed-during-sync"));

    let result = github_sync(&store, &editing, &ws(), &CancellationToken::new(), 3)
        .await
        .expect("sync");
    assert_eq!(result, SyncResult::Ok { count: 1 });
    assert_eq!(remote.file(&path("a.md")).expect("file").as_deref(), Some(&b"v2"[..]));

    let after = entry(&store, "a.md").expect("entry");
    assert_eq!(after.local_content, b"v3-typed-during-sync");
    assert_eq!(after.sha.as_deref(), Some(git_blob_sha(b"v2").as_str()));
    assert_eq!(after.remote_content.as_deref(), Some(&b"v2"[..]));
    assert_eq!(after.state(), EntryState::Modified);

    let result = github_sync(&store, &remote, &ws(), &CancellationToken::new(), 6)
        .await
        .expect("second sync");
    assert_eq!(result, SyncResult::Ok { count: 1 });
    assert_eq!(
        remote.file(&path("a.md")).expect("file").as_deref(),
        Some(&b"v3-typed-during-sync"[..])
    );
    assert_eq!(entry(&store, "a.md").expect("entry").state(), EntryState::Untouched);
}

#[tokio::test]
async fn delete_during_push_of_new_file_is_pushed_next() {
    let store = MemoryEntryStore::new();
    let remote = MemoryRepo::new();
    seed_synced(&store, &remote, "keep.md", b"k");
    write_local_file(&store, &ws(), &path("b.md"), b"new".to_vec(), 2).expect("create");
    let editing = EditingRemote::new(&remote, &store, EditPoint::Upload, "b.md", None);

    let result = github_sync(&store, &editing, &ws(), &CancellationToken::new(), 3)
        .await
        .expect("sync");
    assert_eq!(result, SyncResult::Ok { count: 1 });
    assert!(remote.file(&path("b.md")).expect("file").is_some());
    assert_eq!(entry(&store, "b.md").expect("tombstone").state(), EntryState::Deleted);

    let result = github_sync(&store, &remote, &ws(), &CancellationToken::new(), 6)
        .await
        .expect("second sync");
    assert_eq!(result, SyncResult::Ok { count: 1 });
    assert!(remote.file(&path("b.md")).expect("file").is_none());
    assert!(entry(&store, "b.md").is_none());
}

#[tokio::test]
async fn edit_during_pull_surfaces_as_conflict() {
    let store = MemoryEntryStore::new();
    let remote = MemoryRepo::new();
    seed_synced(&store, &remote, "a.md", b"v1");
    remote.set_file(&path("a.md"), b"theirs").expect("remote edit");
    let editing = EditingRemote::new(&remote, &store, EditPoint::Fetch, "a.md", Some(b"mine"));

    let result = github_sync(&store, &editing, &ws(), &CancellationToken::new(), 3)
        .await
        .expect("sync");
    assert_eq!(result, SyncResult::Ok { count: 1 });

    let after = entry(&store, "a.md").expect("entry");
    assert_eq!(after.local_content, b"mine");
    assert_eq!(after.sha.as_deref(), Some(git_blob_sha(b"v1").as_str()));
    assert_eq!(after.state(), EntryState::Modified);

    let result = github_sync(&store, &remote, &ws(), &CancellationToken::new(), 6)
        .await
        .expect("second sync");
    assert_eq!(
        result,
        SyncResult::MergeConflict {
            conflict: vec![path("a.md")]
        }
    );
    assert_eq!(remote.file(&path("a.md")).expect("file").as_deref(), Some(&b"theirs"[..]));
}
