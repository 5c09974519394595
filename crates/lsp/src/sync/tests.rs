use std::sync::Arc;
use std::time::Duration;

use lsp_types::{Position, Range};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tether_rpc::{
	AnyResponse, ChannelTransport, JsonValue, MainLoop, Message, MessageTransport, Peer, Router,
};

use super::*;
use crate::host::Host;

#[derive(Default)]
struct FakeHost {
	open_docs: Mutex<Vec<TextDocumentItem>>,
}

#[async_trait::async_trait]
impl Host for FakeHost {
	fn open_documents(&self) -> Vec<TextDocumentItem> {
		self.open_docs.lock().clone()
	}
}

struct Rig {
	engine: SyncEngine,
	peer: Peer,
	far: ChannelTransport,
	host: Arc<FakeHost>,
	documents: Arc<DocumentTracker>,
}

fn rig() -> Rig {
	let (near, far) = ChannelTransport::pair();
	let (main_loop, peer) = MainLoop::new(|_| Router::new());
	tokio::spawn(main_loop.run(near));
	let documents = DocumentTracker::new();
	let host = Arc::new(FakeHost::default());
	let engine = SyncEngine::new(peer.clone(), documents.clone(), host.clone());
	Rig {
		engine,
		peer,
		far,
		host,
		documents,
	}
}

fn doc(uri: &str, language: &str, version: i32, text: &str) -> TextDocumentItem {
	TextDocumentItem {
		uri: uri.parse().unwrap(),
		language_id: language.into(),
		version,
		text: text.into(),
	}
}

fn rust_selector() -> DocumentSelector {
	vec![lsp_types::DocumentFilter {
		language: Some("rust".into()),
		scheme: None,
		pattern: None,
	}]
}

async fn next_notification(far: &mut ChannelTransport) -> (String, JsonValue) {
	match far.recv().await.unwrap().unwrap() {
		Message::Notification(n) => (n.method, n.params),
		other => panic!("expected notification, got {other:?}"),
	}
}

/// Sends a probe notification and asserts it is the next thing on the
/// wire, proving nothing was emitted in between.
async fn assert_silent(peer: &Peer, far: &mut ChannelTransport) {
	peer.notify("probe", JsonValue::Null).unwrap();
	let (method, _) = next_notification(far).await;
	assert_eq!(method, "probe");
}

#[tokio::test]
async fn open_sends_did_open_and_tracks() {
	let mut r = rig();
	r.engine.register_open_close("r1".into(), None);
	r.engine.notify_open(doc("file:///w/a.rs", "rust", 1, "fn main() {}"));

	let (method, params) = next_notification(&mut r.far).await;
	assert_eq!(method, "textDocument/didOpen");
	assert_eq!(params["textDocument"]["uri"], "file:///w/a.rs");
	assert_eq!(params["textDocument"]["version"], 1);
	assert_eq!(params["textDocument"]["text"], "fn main() {}");
	assert!(r.documents.is_open(&"file:///w/a.rs".parse().unwrap()));
}

#[tokio::test]
async fn open_without_matching_registration_is_silent() {
	let mut r = rig();
	r.engine.register_open_close("r1".into(), Some(rust_selector()));
	r.engine.notify_open(doc("file:///w/a.py", "python", 1, "pass"));

	assert!(!r.documents.is_open(&"file:///w/a.py".parse().unwrap()));
	assert_silent(&r.peer, &mut r.far).await;
}

#[tokio::test(start_paused = true)]
async fn full_sync_open_edit_save_close() {
	let mut r = rig();
	r.engine.register_open_close("oc".into(), None);
	r.engine.register_change("ch".into(), None, TextDocumentSyncKind::FULL);
	r.engine.register_save("sv".into(), None, false);

	let uri: Uri = "file:///w/a.rs".parse().unwrap();
	r.engine.notify_open(doc("file:///w/a.rs", "rust", 1, "A"));
	let (method, _) = next_notification(&mut r.far).await;
	assert_eq!(method, "textDocument/didOpen");

	// Tracker updates immediately; the wire waits out the debounce.
	r.engine.notify_change(&uri, 2, Vec::new(), "AB".into());
	let tracked = r.documents.get(&uri).unwrap();
	assert_eq!(tracked.text, "AB");
	assert_eq!(tracked.version, 2);

	tokio::time::sleep(CHANGE_DEBOUNCE + Duration::from_millis(50)).await;
	let (method, params) = next_notification(&mut r.far).await;
	assert_eq!(method, "textDocument/didChange");
	assert_eq!(params["textDocument"]["version"], 2);
	let changes = params["contentChanges"].as_array().unwrap();
	assert_eq!(changes.len(), 1);
	assert_eq!(changes[0]["text"], "AB");
	assert!(changes[0].get("range").is_none());

	r.engine.notify_save(&uri, None);
	let (method, params) = next_notification(&mut r.far).await;
	assert_eq!(method, "textDocument/didSave");
	assert_eq!(params["textDocument"]["uri"], "file:///w/a.rs");
	assert!(params.get("text").is_none(), "includeText=false must omit text");

	r.engine.notify_close(&uri);
	let (method, _) = next_notification(&mut r.far).await;
	assert_eq!(method, "textDocument/didClose");
	assert!(!r.documents.is_open(&uri));
}

#[tokio::test]
async fn incremental_changes_forwarded_verbatim_in_order() {
	let mut r = rig();
	r.engine.register_open_close("oc".into(), None);
	r.engine
		.register_change("ch".into(), None, TextDocumentSyncKind::INCREMENTAL);

	let uri: Uri = "file:///w/a.rs".parse().unwrap();
	r.engine.notify_open(doc("file:///w/a.rs", "rust", 1, ""));
	let _ = next_notification(&mut r.far).await;

	let change_at = |line: u32, character: u32, text: &str| TextDocumentContentChangeEvent {
		range: Some(Range {
			start: Position { line, character },
			end: Position { line, character },
		}),
		range_length: Some(0),
		text: text.into(),
	};
	r.engine.notify_change(
		&uri,
		2,
		vec![change_at(0, 0, "x"), change_at(0, 1, "y")],
		"xy".into(),
	);

	let (method, params) = next_notification(&mut r.far).await;
	assert_eq!(method, "textDocument/didChange");
	let changes = params["contentChanges"].as_array().unwrap();
	assert_eq!(changes.len(), 2);
	assert_eq!(changes[0]["text"], "x");
	assert_eq!(changes[1]["text"], "y");
}

#[tokio::test(start_paused = true)]
async fn force_flush_is_idempotent() {
	let mut r = rig();
	r.engine.register_open_close("oc".into(), None);
	r.engine.register_change("ch".into(), None, TextDocumentSyncKind::FULL);

	let uri: Uri = "file:///w/a.rs".parse().unwrap();
	r.engine.notify_open(doc("file:///w/a.rs", "rust", 1, "A"));
	let _ = next_notification(&mut r.far).await;

	// Flushing with no delayer pending is a no-op.
	r.engine.flush_pending();
	assert_silent(&r.peer, &mut r.far).await;

	r.engine.notify_change(&uri, 2, Vec::new(), "AB".into());
	r.engine.flush_pending();
	r.engine.flush_pending();

	let (method, params) = next_notification(&mut r.far).await;
	assert_eq!(method, "textDocument/didChange");
	assert_eq!(params["contentChanges"][0]["text"], "AB");
	// Exactly one didChange: the second flush found nothing.
	assert_silent(&r.peer, &mut r.far).await;

	// The aborted timer must not fire a duplicate later.
	tokio::time::sleep(CHANGE_DEBOUNCE * 2).await;
	assert_silent(&r.peer, &mut r.far).await;
}

#[tokio::test(start_paused = true)]
async fn change_to_second_uri_flushes_pending_delayer_first() {
	let mut r = rig();
	r.engine.register_open_close("oc".into(), None);
	r.engine.register_change("ch".into(), None, TextDocumentSyncKind::FULL);

	let a: Uri = "file:///w/a.rs".parse().unwrap();
	let b: Uri = "file:///w/b.rs".parse().unwrap();
	r.engine.notify_open(doc("file:///w/a.rs", "rust", 1, "A"));
	r.engine.notify_open(doc("file:///w/b.rs", "rust", 1, "B"));
	let _ = next_notification(&mut r.far).await;
	let _ = next_notification(&mut r.far).await;

	r.engine.notify_change(&a, 2, Vec::new(), "A2".into());
	// Before the delayer fires, a different uri changes: A must flush now.
	r.engine.notify_change(&b, 2, Vec::new(), "B2".into());

	let (method, params) = next_notification(&mut r.far).await;
	assert_eq!(method, "textDocument/didChange");
	assert_eq!(params["textDocument"]["uri"], "file:///w/a.rs");
	assert_eq!(params["contentChanges"][0]["text"], "A2");

	tokio::time::sleep(CHANGE_DEBOUNCE + Duration::from_millis(50)).await;
	let (method, params) = next_notification(&mut r.far).await;
	assert_eq!(method, "textDocument/didChange");
	assert_eq!(params["textDocument"]["uri"], "file:///w/b.rs");
	assert_eq!(params["contentChanges"][0]["text"], "B2");
}

#[tokio::test(start_paused = true)]
async fn sync_kind_none_sends_no_text_notifications() {
	let mut r = rig();
	let options = crate::capabilities::normalize_text_document_sync(Some(
		&lsp_types::TextDocumentSyncCapability::Kind(TextDocumentSyncKind::NONE),
	));
	r.engine.apply_server_defaults(&options, None);

	let uri: Uri = "file:///w/a.rs".parse().unwrap();
	r.engine.notify_open(doc("file:///w/a.rs", "rust", 1, "A"));
	r.engine.notify_change(&uri, 2, Vec::new(), "AB".into());
	r.engine.notify_save(&uri, None);
	r.engine.notify_close(&uri);
	tokio::time::sleep(CHANGE_DEBOUNCE * 2).await;

	assert_silent(&r.peer, &mut r.far).await;
}

#[tokio::test]
async fn save_includes_text_when_registered_for_it() {
	let mut r = rig();
	r.engine.register_open_close("oc".into(), None);
	r.engine.register_save("sv".into(), None, true);

	let uri: Uri = "file:///w/a.rs".parse().unwrap();
	r.engine.notify_open(doc("file:///w/a.rs", "rust", 3, "contents"));
	let _ = next_notification(&mut r.far).await;

	r.engine.notify_save(&uri, None);
	let (method, params) = next_notification(&mut r.far).await;
	assert_eq!(method, "textDocument/didSave");
	assert_eq!(params["text"], "contents");
}

#[tokio::test(start_paused = true)]
async fn will_save_wait_until_returns_edits_from_peer() {
	let mut r = rig();
	r.engine.register_open_close("oc".into(), None);
	r.engine.register_will_save_wait_until("wsw".into(), None);

	let uri: Uri = "file:///w/a.rs".parse().unwrap();
	r.engine.notify_open(doc("file:///w/a.rs", "rust", 1, "A"));
	let _ = next_notification(&mut r.far).await;

	let mut far = r.far;
	let answer = tokio::spawn(async move {
		loop {
			match far.recv().await.unwrap().unwrap() {
				Message::Request(req) if req.method == "textDocument/willSaveWaitUntil" => {
					let edits = vec![TextEdit {
						range: Range::default(),
						new_text: "formatted".into(),
					}];
					far.send(Message::Response(AnyResponse::new_ok(
						req.id,
						serde_json::to_value(edits).unwrap(),
					)))
					.await
					.unwrap();
					break;
				}
				_ => continue,
			}
		}
	});

	let edits = r
		.engine
		.will_save_wait_until(&uri, TextDocumentSaveReason::MANUAL)
		.await;
	answer.await.unwrap();
	assert_eq!(edits.len(), 1);
	assert_eq!(edits[0].new_text, "formatted");
}

#[tokio::test(start_paused = true)]
async fn will_save_wait_until_bounds_the_wait() {
	let mut r = rig();
	r.engine.register_open_close("oc".into(), None);
	r.engine.register_will_save_wait_until("wsw".into(), None);

	let uri: Uri = "file:///w/a.rs".parse().unwrap();
	r.engine.notify_open(doc("file:///w/a.rs", "rust", 1, "A"));
	let _ = next_notification(&mut r.far).await;

	// Nobody answers; the bounded wait must yield no edits.
	let edits = r
		.engine
		.will_save_wait_until(&uri, TextDocumentSaveReason::MANUAL)
		.await;
	assert!(edits.is_empty());
}

#[tokio::test]
async fn unregister_open_close_synthesizes_did_close_for_uncovered_docs() {
	let mut r = rig();
	r.engine.register_open_close("rust-reg".into(), Some(rust_selector()));
	let json_selector = vec![lsp_types::DocumentFilter {
		language: Some("json".into()),
		scheme: None,
		pattern: None,
	}];
	r.engine.register_open_close("json-reg".into(), Some(json_selector));

	r.engine.notify_open(doc("file:///w/a.rs", "rust", 1, "A"));
	let _ = next_notification(&mut r.far).await;
	assert_eq!(r.documents.len(), 1);

	r.engine.unregister("textDocument/didOpen", "rust-reg").unwrap();

	let (method, params) = next_notification(&mut r.far).await;
	assert_eq!(method, "textDocument/didClose");
	assert_eq!(params["textDocument"]["uri"], "file:///w/a.rs");
	assert!(r.documents.is_empty());
}

#[tokio::test]
async fn unregister_unknown_id_reports_error_and_keeps_state() {
	let mut r = rig();
	r.engine.register_open_close("known".into(), None);
	r.engine.notify_open(doc("file:///w/a.rs", "rust", 1, "A"));
	let _ = next_notification(&mut r.far).await;

	assert!(r.engine.unregister("textDocument/didOpen", "missing").is_err());
	// Nothing torn down.
	assert!(r.documents.is_open(&"file:///w/a.rs".parse().unwrap()));
	assert_silent(&r.peer, &mut r.far).await;
}

#[tokio::test]
async fn late_registration_opens_matching_host_documents() {
	let mut r = rig();
	*r.host.open_docs.lock() = vec![doc("file:///w/late.rs", "rust", 4, "late")];

	r.engine.register_open_close("r1".into(), Some(rust_selector()));

	let (method, params) = next_notification(&mut r.far).await;
	assert_eq!(method, "textDocument/didOpen");
	assert_eq!(params["textDocument"]["uri"], "file:///w/late.rs");
	assert_eq!(params["textDocument"]["version"], 4);
}

#[tokio::test]
async fn change_before_open_is_ignored() {
	let mut r = rig();
	r.engine.register_open_close("oc".into(), None);
	r.engine.register_change("ch".into(), None, TextDocumentSyncKind::INCREMENTAL);

	let uri: Uri = "file:///w/never_opened.rs".parse().unwrap();
	r.engine.notify_change(&uri, 1, Vec::new(), "X".into());
	assert_silent(&r.peer, &mut r.far).await;
}

#[tokio::test]
async fn tracker_versions_never_decrease() {
	let tracker = DocumentTracker::new();
	tracker.insert(&doc("file:///w/a.rs", "rust", 5, "A"));
	let uri: Uri = "file:///w/a.rs".parse().unwrap();
	tracker.update(&uri, 3, "B".into());
	assert_eq!(tracker.version(&uri), Some(5));
	tracker.update(&uri, 9, "C".into());
	assert_eq!(tracker.version(&uri), Some(9));
}

#[tokio::test]
async fn diagnostics_collection_stores_per_uri() {
	let diags = DiagnosticsCollection::new();
	let uri: Uri = "file:///w/a.rs".parse().unwrap();
	diags.set(
		&uri,
		Some(2),
		vec![Diagnostic {
			message: "boom".into(),
			..Default::default()
		}],
	);
	assert_eq!(diags.get(&uri).len(), 1);
	assert_eq!(diags.version(&uri), Some(2));
	diags.remove(&uri);
	assert!(diags.get(&uri).is_empty());
}
