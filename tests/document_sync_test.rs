use std::time::Duration;

use kadabra_lsp_runtime::host::Editor;
use lsp_types::TextDocumentSyncKind;

use crate::common::{Harness, MockConnector, capabilities_with_sync, settle};

fn version(message: &crate::common::mock_server::Received) -> i64 {
    message.params["textDocument"]["version"]
        .as_i64()
        .expect("versioned document")
}

#[tokio::test]
async fn test_two_editors_share_one_server_document() {
    let h = Harness::new();
    let mock = MockConnector::default();
    h.register("mock", &["x"], &mock).await;
    let uri = h.document("a.x", "hello");

    let (first, _) = h.open(&uri).await;
    let (second, _) = h.open(&uri).await;
    let opens = mock.wait_for("textDocument/didOpen", 1).await;
    let v0 = version(&opens[0]);
    assert_eq!(opens[0].params["textDocument"]["text"], "hello");

    h.type_at(&uri, 5, "a");
    h.type_at(&uri, 6, "b");
    let changes = mock.wait_for("textDocument/didChange", 2).await;
    assert_eq!(version(&changes[0]), v0 + 1);
    assert_eq!(version(&changes[1]), v0 + 2);
    let first_change = &changes[0].params["contentChanges"][0];
    assert_eq!(first_change["range"]["start"]["character"], 5);
    assert_eq!(first_change["range"]["end"]["character"], 5);
    assert_eq!(first_change["text"], "a");

    h.runtime.editor_closed(first.id());
    settle().await;
    assert!(mock.received("textDocument/didClose").is_empty());

    h.runtime.editor_closed(second.id());
    mock.wait_for("textDocument/didClose", 1).await;
    settle().await;
    assert_eq!(mock.received("textDocument/didClose").len(), 1);
    assert_eq!(mock.received("textDocument/didOpen").len(), 1);
}

#[tokio::test]
async fn test_editor_closed_during_startup_is_never_opened() {
    let h = Harness::new();
    let mock = MockConnector::default();
    mock.delay("initialize", Duration::from_millis(100));
    h.register("mock", &["x"], &mock).await;
    let uri = h.document("a.x", "early");
    let editor = h.host.open_editor(&uri, Some(h.project.clone()));

    let (session, ()) = tokio::join!(h.runtime.editor_opened(editor.clone()), async {
        mock.wait_for("initialize", 1).await;
        h.runtime.editor_closed(editor.id());
    });
    assert!(session.is_some());
    settle().await;
    assert!(mock.received("textDocument/didOpen").is_empty());
    assert!(mock.received("textDocument/didClose").is_empty());

    let (reopened, _) = h.open(&uri).await;
    mock.wait_for("textDocument/didOpen", 1).await;
    h.runtime.editor_closed(reopened.id());
    mock.wait_for("textDocument/didClose", 1).await;
    settle().await;
    assert_eq!(mock.received("textDocument/didOpen").len(), 1);
    assert_eq!(mock.received("textDocument/didClose").len(), 1);
}

#[tokio::test]
async fn test_reopened_document_keeps_counting_versions() {
    let h = Harness::new();
    let mock = MockConnector::default();
    h.register("mock", &["x"], &mock).await;
    let uri = h.document("a.x", "fn");

    let (editor, _) = h.open(&uri).await;
    h.type_at(&uri, 2, "()");
    mock.wait_for("textDocument/didChange", 1).await;
    h.runtime.editor_closed(editor.id());
    mock.wait_for("textDocument/didClose", 1).await;

    h.open(&uri).await;
    let opens = mock.wait_for("textDocument/didOpen", 2).await;
    let last_change = version(&mock.received("textDocument/didChange")[0]);
    assert!(version(&opens[1]) > last_change);
    assert_eq!(opens[1].params["textDocument"]["text"], "fn()");
}

#[tokio::test]
async fn test_full_sync_sends_whole_text() {
    let h = Harness::new();
    let mock = MockConnector::new(capabilities_with_sync(TextDocumentSyncKind::FULL));
    h.register("mock", &["x"], &mock).await;
    let uri = h.document("a.x", "let x");

    h.open(&uri).await;
    h.type_at(&uri, 5, " = 1");
    let changes = mock.wait_for("textDocument/didChange", 1).await;
    let change = &changes[0].params["contentChanges"][0];
    assert!(change["range"].is_null());
    assert_eq!(change["text"], "let x = 1");
}

#[tokio::test]
async fn test_sync_none_advances_version_silently() {
    let h = Harness::new();
    let mock = MockConnector::new(capabilities_with_sync(TextDocumentSyncKind::NONE));
    h.register("mock", &["x"], &mock).await;
    let uri = h.document("a.x", "abc");

    let (_, session) = h.open(&uri).await;
    let connection = session.connection().expect("connected");
    let before = connection.document_version(&uri).expect("open on server");
    h.type_at(&uri, 3, "d");
    settle().await;

    assert_eq!(connection.document_version(&uri), Some(before + 1));
    assert!(mock.received("textDocument/didChange").is_empty());
}

#[tokio::test]
async fn test_did_save_carries_text_when_requested() {
    let h = Harness::new();
    let mock = MockConnector::default();
    h.register("mock", &["x"], &mock).await;
    let uri = h.document("a.x", "saved");

    let (_, session) = h.open(&uri).await;
    h.runtime.document_saved(&uri);
    let saves = mock.wait_for("textDocument/didSave", 1).await;
    assert_eq!(saves[0].params["text"], "saved");

    session.save();
    mock.wait_for("textDocument/didSave", 2).await;
}

#[tokio::test]
async fn test_did_save_skipped_without_save_capability() {
    let h = Harness::new();
    let mock = MockConnector::new(capabilities_with_sync(TextDocumentSyncKind::INCREMENTAL));
    h.register("mock", &["x"], &mock).await;
    let uri = h.document("a.x", "text");

    h.open(&uri).await;
    h.runtime.document_saved(&uri);
    settle().await;
    assert!(mock.received("textDocument/didSave").is_empty());
}

#[tokio::test]
async fn test_configuration_change_reaches_server() {
    let h = Harness::new();
    let mock = MockConnector::default();
    h.register("mock", &["x"], &mock).await;
    let uri = h.document("a.x", "");

    h.open(&uri).await;
    h.runtime
        .did_change_configuration(Some(h.project.clone()), &serde_json::json!({"mock": {"lint": true}}));
    let received = mock.wait_for("workspace/didChangeConfiguration", 1).await;
    assert_eq!(received[0].params["settings"]["mock"]["lint"], true);
}
