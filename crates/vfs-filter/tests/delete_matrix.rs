//! Delete semantics across dispositions, concurrent handles and path kinds.
//!
//! Cases covered:
//! - SetDisposition: reversible, blocks new opens at once, commits on close
//! - DeleteOnClose: irreversible, deferred while other handles stay open
//! - Directories: non-empty refusal, empty local and projected directories
//! - Refusals: protected paths, the root, sharing violations

use std::sync::Arc;
use std::time::Duration;

use rusty_projection_filter::{
    AccessMask, DeleteDisposition, Dispatcher, FilterOptions, HandleId, OpenOptions, Status,
};
use rusty_projection_vfs::{MemoryBackingStore, PathState, VirtualPath};

fn p(path: &str) -> VirtualPath {
    VirtualPath::new(path).unwrap()
}

/// Dispatcher over a small projected tree.
fn create_test_env() -> (Arc<MemoryBackingStore>, Dispatcher) {
    let backing = Arc::new(MemoryBackingStore::new());
    backing.insert_file("a.txt", b"alpha");
    backing.insert_file("b.txt", b"bravo");
    backing.insert_file("dir/child.txt", b"child");
    backing.insert_file(".git/index", b"index");
    backing.insert_dir("empty");
    let dispatcher = Dispatcher::new(FilterOptions::default(), backing.clone()).unwrap();
    (backing, dispatcher)
}

fn deleter() -> OpenOptions {
    OpenOptions::read().with_access(AccessMask::READ.with_delete())
}

fn exists(dispatcher: &Dispatcher, path: &str) -> bool {
    dispatcher.on_query_attributes(&p(path)).is_ok()
}

// ============================================================================
// SetDisposition
// ============================================================================

#[test]
fn test_set_disposition_commits_on_close() {
    let (_backing, dispatcher) = create_test_env();

    let handle: HandleId = dispatcher.on_create(&p("a.txt"), deleter()).unwrap();
    dispatcher
        .on_delete(handle, DeleteDisposition::SetDisposition)
        .unwrap();
    assert!(exists(&dispatcher, "a.txt"));

    dispatcher.on_close(handle).unwrap();
    assert!(!exists(&dispatcher, "a.txt"));
    assert!(exists(&dispatcher, "b.txt"));

    assert!(dispatcher.wait_for_notifications(Duration::from_secs(5)));
    assert_eq!(
        dispatcher.modification_summary().deleted_files,
        vec!["a.txt".to_string()]
    );
}

#[test]
fn test_set_disposition_blocks_new_opens() {
    let (_backing, dispatcher) = create_test_env();

    let handle: HandleId = dispatcher.on_create(&p("a.txt"), deleter()).unwrap();
    dispatcher
        .on_delete(handle, DeleteDisposition::SetDisposition)
        .unwrap();
    assert_eq!(
        dispatcher.on_create(&p("a.txt"), OpenOptions::read()),
        Err(Status::AccessDenied)
    );
    dispatcher.on_close(handle).unwrap();
}

#[test]
fn test_undelete_clears_set_disposition() {
    let (_backing, dispatcher) = create_test_env();

    let handle: HandleId = dispatcher.on_create(&p("a.txt"), deleter()).unwrap();
    dispatcher
        .on_delete(handle, DeleteDisposition::SetDisposition)
        .unwrap();
    dispatcher.on_undelete(handle).unwrap();

    let reader: HandleId = dispatcher.on_create(&p("a.txt"), OpenOptions::read()).unwrap();
    dispatcher.on_close(reader).unwrap();
    dispatcher.on_close(handle).unwrap();
    assert!(exists(&dispatcher, "a.txt"));
}

// ============================================================================
// DeleteOnClose
// ============================================================================

#[test]
fn test_delete_on_close_cannot_be_undone() {
    let (_backing, dispatcher) = create_test_env();

    let handle: HandleId = dispatcher
        .on_create(&p("a.txt"), OpenOptions::read().with_delete_on_close())
        .unwrap();
    assert_eq!(dispatcher.on_undelete(handle), Err(Status::AccessDenied));

    // A later SetDisposition does not downgrade the mark.
    dispatcher
        .on_delete(handle, DeleteDisposition::SetDisposition)
        .unwrap();
    assert_eq!(dispatcher.on_undelete(handle), Err(Status::AccessDenied));

    dispatcher.on_close(handle).unwrap();
    assert!(!exists(&dispatcher, "a.txt"));
}

#[test]
fn test_delete_deferred_until_last_handle_closes() {
    let (_backing, dispatcher) = create_test_env();

    let marker: HandleId = dispatcher
        .on_create(&p("a.txt"), OpenOptions::read().with_delete_on_close())
        .unwrap();
    let reader: HandleId = dispatcher.on_create(&p("a.txt"), OpenOptions::read()).unwrap();

    dispatcher.on_close(marker).unwrap();
    assert!(exists(&dispatcher, "a.txt"));
    assert_eq!(dispatcher.on_read(reader, 0, 5).unwrap(), b"alpha");
    assert_eq!(
        dispatcher.on_create(&p("a.txt"), OpenOptions::read()),
        Err(Status::AccessDenied)
    );

    dispatcher.on_close(reader).unwrap();
    assert!(!exists(&dispatcher, "a.txt"));
    assert_eq!(
        dispatcher.on_create(&p("a.txt"), OpenOptions::read()),
        Err(Status::ObjectNameNotFound)
    );
}

#[test]
fn test_recreate_after_delete_is_local() {
    let (_backing, dispatcher) = create_test_env();

    let handle: HandleId = dispatcher
        .on_create(&p("a.txt"), OpenOptions::read().with_delete_on_close())
        .unwrap();
    dispatcher.on_close(handle).unwrap();

    let fresh: HandleId = dispatcher
        .on_create(&p("a.txt"), OpenOptions::create_file())
        .unwrap();
    dispatcher.on_write(fresh, 0, b"new").unwrap();
    dispatcher.on_close(fresh).unwrap();

    let attrs = dispatcher.on_query_attributes(&p("a.txt")).unwrap();
    assert_eq!(attrs.state, PathState::Local);
    assert_eq!(attrs.size, 3);
    assert!(attrs.version.is_none());
}

// ============================================================================
// Directories
// ============================================================================

#[test]
fn test_non_empty_directory_refused() {
    let (_backing, dispatcher) = create_test_env();

    assert_eq!(
        dispatcher.on_create(&p("dir"), OpenOptions::dir().with_delete_on_close()),
        Err(Status::DirectoryNotEmpty)
    );

    let handle: HandleId = dispatcher
        .on_create(&p("dir"), OpenOptions::dir().with_access(AccessMask::READ.with_delete()))
        .unwrap();
    assert_eq!(
        dispatcher.on_delete(handle, DeleteDisposition::SetDisposition),
        Err(Status::DirectoryNotEmpty)
    );
    dispatcher.on_close(handle).unwrap();
    assert!(exists(&dispatcher, "dir/child.txt"));
}

#[test]
fn test_directory_deletable_once_emptied() {
    let (_backing, dispatcher) = create_test_env();

    let child: HandleId = dispatcher
        .on_create(&p("dir/child.txt"), OpenOptions::read().with_delete_on_close())
        .unwrap();
    dispatcher.on_close(child).unwrap();

    let dir: HandleId = dispatcher
        .on_create(&p("dir"), OpenOptions::dir().with_delete_on_close())
        .unwrap();
    dispatcher.on_close(dir).unwrap();
    assert!(!exists(&dispatcher, "dir"));

    assert!(dispatcher.wait_for_notifications(Duration::from_secs(5)));
    let summary = dispatcher.modification_summary();
    assert_eq!(summary.deleted_dirs, vec!["dir".to_string()]);
}

#[test]
fn test_empty_projected_and_local_directories() {
    let (_backing, dispatcher) = create_test_env();

    let empty: HandleId = dispatcher
        .on_create(&p("empty"), OpenOptions::dir().with_delete_on_close())
        .unwrap();
    dispatcher.on_close(empty).unwrap();
    assert!(!exists(&dispatcher, "empty"));

    let local: HandleId = dispatcher.on_create(&p("made"), OpenOptions::create_dir()).unwrap();
    dispatcher.on_close(local).unwrap();
    let local: HandleId = dispatcher
        .on_create(&p("made"), OpenOptions::dir().with_delete_on_close())
        .unwrap();
    dispatcher.on_close(local).unwrap();
    assert!(!exists(&dispatcher, "made"));

    assert!(dispatcher.wait_for_notifications(Duration::from_secs(5)));
    let summary = dispatcher.modification_summary();
    assert_eq!(summary.deleted_dirs, vec!["empty".to_string()]);
    assert!(summary.created_dirs.is_empty());
}

// ============================================================================
// Refusals
// ============================================================================

#[test]
fn test_protected_path_refused() {
    let (_backing, dispatcher) = create_test_env();

    let handle: HandleId = dispatcher.on_create(&p(".git/INDEX"), deleter()).unwrap();
    assert_eq!(
        dispatcher.on_delete(handle, DeleteDisposition::DeleteOnClose),
        Err(Status::AccessDenied)
    );
    dispatcher.on_close(handle).unwrap();
    assert!(exists(&dispatcher, ".git/index"));
}

#[test]
fn test_sharing_violation_refused() {
    let (_backing, dispatcher) = create_test_env();

    let reader: HandleId = dispatcher
        .on_create(&p("a.txt"), OpenOptions::read().with_share(AccessMask::READ))
        .unwrap();
    assert_eq!(
        dispatcher.on_create(&p("a.txt"), deleter()),
        Err(Status::AccessDenied)
    );
    dispatcher.on_close(reader).unwrap();

    let handle: HandleId = dispatcher.on_create(&p("a.txt"), deleter()).unwrap();
    dispatcher
        .on_delete(handle, DeleteDisposition::DeleteOnClose)
        .unwrap();
    dispatcher.on_close(handle).unwrap();
    assert!(!exists(&dispatcher, "a.txt"));
}

#[test]
fn test_delete_requires_delete_access() {
    let (_backing, dispatcher) = create_test_env();

    let handle: HandleId = dispatcher.on_create(&p("a.txt"), OpenOptions::read()).unwrap();
    assert_eq!(
        dispatcher.on_delete(handle, DeleteDisposition::DeleteOnClose),
        Err(Status::AccessDenied)
    );
    dispatcher.on_close(handle).unwrap();
    assert!(exists(&dispatcher, "a.txt"));
}
