#![allow(missing_docs, clippy::unwrap_used)]

mod common;

use std::sync::Arc;

use common::{MockFsState, MockPathFs, dir_attr, file_attr};
use pathfs::fs::{Connector, LinkRequest, RenameRequest, RequestHeader, ROOT_ID};

async fn rooted(state: MockFsState) -> (Arc<Connector>, Arc<MockFsState>) {
    let fs = MockPathFs::new(state);
    let state = Arc::clone(&fs.state);
    let connector = Connector::new(Arc::new(fs)).await.unwrap();
    (connector, state)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rename_rekeys_and_preserves_both_ids() {
    let (connector, state) = rooted(MockFsState::with_paths(&[
        ("a", file_attr(1)),
        ("b", file_attr(2)),
    ]))
    .await;

    let root = RequestHeader::new(ROOT_ID);
    let a = connector.lookup(&root, "a").await.unwrap().node_id;
    let b = connector.lookup(&root, "b").await.unwrap().node_id;
    assert_eq!((a, b), (ROOT_ID + 1, ROOT_ID + 2));

    connector
        .rename(&root, &RenameRequest { new_dir: ROOT_ID }, "a", "b")
        .await
        .unwrap();
    assert_eq!(
        state.rename_calls.lock().unwrap().as_slice(),
        [("a".to_owned(), "b".to_owned())]
    );

    // The renamed entry answers under its old id at the new path.
    let reply = connector.getattr(&RequestHeader::new(a)).await.unwrap();
    assert_eq!(reply.attr.ino, a);
    assert!(
        state
            .getattr_calls
            .lock()
            .unwrap()
            .contains(&"b".to_owned())
    );

    // The overwritten entry's id still resolves — to a reserved
    // synthetic name under the root.
    let _ = connector.getattr(&RequestHeader::new(b)).await;
    assert!(
        state
            .getattr_calls
            .lock()
            .unwrap()
            .iter()
            .any(|p| p.starts_with("overwrittenByRename")),
        "victim resolves under its synthetic name"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rename_across_directories() {
    let (connector, state) = rooted(MockFsState::with_paths(&[
        ("src", dir_attr()),
        ("dst", dir_attr()),
        ("src/f", file_attr(1)),
    ]))
    .await;

    let root = RequestHeader::new(ROOT_ID);
    let src = connector.lookup(&root, "src").await.unwrap().node_id;
    let dst = connector.lookup(&root, "dst").await.unwrap().node_id;
    let f = connector
        .lookup(&RequestHeader::new(src), "f")
        .await
        .unwrap()
        .node_id;

    connector
        .rename(
            &RequestHeader::new(src),
            &RenameRequest { new_dir: dst },
            "f",
            "g",
        )
        .await
        .unwrap();
    assert_eq!(
        state.rename_calls.lock().unwrap().as_slice(),
        [("src/f".to_owned(), "dst/g".to_owned())]
    );

    let reply = connector.getattr(&RequestHeader::new(f)).await.unwrap();
    assert_eq!(reply.attr.ino, f);
    assert!(
        state
            .getattr_calls
            .lock()
            .unwrap()
            .contains(&"dst/g".to_owned())
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rename_onto_itself_is_observably_a_noop() {
    let (connector, _state) = rooted(MockFsState::with_paths(&[("a", file_attr(1))])).await;

    let root = RequestHeader::new(ROOT_ID);
    let a = connector.lookup(&root, "a").await.unwrap().node_id;
    connector
        .rename(&root, &RenameRequest { new_dir: ROOT_ID }, "a", "a")
        .await
        .unwrap();

    let again = connector.lookup(&root, "a").await.unwrap();
    assert_eq!(again.node_id, a);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cross_mount_rename_is_rejected_before_any_backend_call() {
    let (connector, root_state) = rooted(MockFsState::with_paths(&[
        ("sub", dir_attr()),
        ("f", file_attr(1)),
    ]))
    .await;

    let root = RequestHeader::new(ROOT_ID);
    let sub = connector.lookup(&root, "sub").await.unwrap().node_id;

    let inner = MockPathFs::new(MockFsState::with_paths(&[]));
    let inner_state = Arc::clone(&inner.state);
    connector.mount("/sub", Arc::new(inner)).await.unwrap();

    let err = connector
        .rename(&root, &RenameRequest { new_dir: sub }, "f", "f")
        .await
        .unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EXDEV));
    assert!(root_state.rename_calls.lock().unwrap().is_empty());
    assert!(inner_state.rename_calls.lock().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rename_raced_with_unlink_is_silently_absorbed() {
    let (connector, state) = rooted(MockFsState::with_paths(&[("a", file_attr(1))])).await;

    let root = RequestHeader::new(ROOT_ID);
    connector.lookup(&root, "a").await.unwrap();
    connector.unlink(&root, "a").await.unwrap();

    // The backend still accepts the rename (scripted), but the table's
    // source key is already gone; the stale notification is absorbed.
    state.insert_attr("a", file_attr(1));
    connector
        .rename(&root, &RenameRequest { new_dir: ROOT_ID }, "a", "b")
        .await
        .unwrap();

    // "b" was never registered: looking it up asks the backend afresh.
    state.insert_attr("b", file_attr(2));
    let entry = connector.lookup(&root, "b").await.unwrap();
    assert_eq!(entry.attr.size, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rename_failure_leaves_table_untouched() {
    let (connector, _state) = rooted(MockFsState {
        rename_errno: Some(libc::EACCES),
        ..MockFsState::with_paths(&[("a", file_attr(1))])
    })
    .await;

    let root = RequestHeader::new(ROOT_ID);
    let a = connector.lookup(&root, "a").await.unwrap().node_id;

    let err = connector
        .rename(&root, &RenameRequest { new_dir: ROOT_ID }, "a", "b")
        .await
        .unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EACCES));

    // Still addressable under the old name.
    let again = connector.lookup(&root, "a").await.unwrap();
    assert_eq!(again.node_id, a);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cross_mount_link_is_rejected() {
    let (connector, _root_state) = rooted(MockFsState::with_paths(&[
        ("sub", dir_attr()),
        ("f", file_attr(1)),
    ]))
    .await;

    let root = RequestHeader::new(ROOT_ID);
    let f = connector.lookup(&root, "f").await.unwrap().node_id;
    let sub = connector.lookup(&root, "sub").await.unwrap().node_id;

    let inner = MockPathFs::new(MockFsState::with_paths(&[]));
    let inner_state = Arc::clone(&inner.state);
    connector.mount("/sub", Arc::new(inner)).await.unwrap();

    let err = connector
        .link(
            &RequestHeader::new(sub),
            &LinkRequest { old_node_id: f },
            "copy",
        )
        .await
        .unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EXDEV));
    assert!(inner_state.link_calls.lock().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn link_on_same_mount_materializes_entry() {
    let (connector, state) = rooted(MockFsState::with_paths(&[("f", file_attr(9))])).await;

    let root = RequestHeader::new(ROOT_ID);
    let f = connector.lookup(&root, "f").await.unwrap().node_id;

    let entry = connector
        .link(&root, &LinkRequest { old_node_id: f }, "copy")
        .await
        .unwrap();
    assert_eq!(entry.attr.size, 9);
    assert_eq!(
        state.link_calls.lock().unwrap().as_slice(),
        [("f".to_owned(), "copy".to_owned())]
    );
}
