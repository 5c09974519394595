//! Text-document synchronization engine.
//!
//! Tracks which buffers are open at the peer, turns editor events into
//! `textDocument/did*` notifications filtered by each registration's
//! document selector, and debounces full-text sync behind a single change
//! delayer. A document is present in the tracker iff it is open at the
//! peer; its version never decreases.
//!
//! # Delayed delivery
//!
//! Full-sync changes are not sent immediately: one delayer (bound to one
//! uri at a time) holds the latest state for [`CHANGE_DEBOUNCE`] before a
//! `didChange` carrying the whole text goes out. A change to a different
//! uri force-flushes the pending delayer first so per-document ordering
//! survives rebinding. Every outbound request drains the delayer up front,
//! so the peer always observes a state at least as new as the one the
//! request was issued against.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use lsp_types::{
	DidChangeTextDocumentParams, DidCloseTextDocumentParams, DidOpenTextDocumentParams,
	DidSaveTextDocumentParams, Diagnostic, DocumentSelector, TextDocumentContentChangeEvent,
	TextDocumentIdentifier, TextDocumentItem, TextDocumentSaveReason, TextDocumentSyncKind,
	TextDocumentSyncOptions, TextEdit, Uri, VersionedTextDocumentIdentifier,
	WillSaveTextDocumentParams,
};
use parking_lot::{Mutex, RwLock};
use tether_rpc::Peer;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::capabilities::save_options_include_text;
use crate::features::selector::matches_document;
use crate::host::Host;
use crate::{Error, Result};

#[cfg(test)]
mod tests;

/// Quiet window before a debounced full-sync `didChange` goes out.
pub const CHANGE_DEBOUNCE: Duration = Duration::from_millis(200);

/// Bound on the pre-save edit roundtrip.
pub const WILL_SAVE_WAIT_UNTIL_TIMEOUT: Duration = Duration::from_secs(1);

/// One buffer open at the peer.
#[derive(Debug, Clone)]
pub struct TrackedDocument {
	pub uri: Uri,
	pub language_id: String,
	pub version: i32,
	pub text: String,
}

/// Map of open documents, keyed by uri.
///
/// String keys: `Uri` has interior structure that upsets map-key lints,
/// and the rendered form is what goes on the wire anyway.
#[derive(Default)]
pub struct DocumentTracker {
	docs: RwLock<HashMap<String, TrackedDocument>>,
}

impl DocumentTracker {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn insert(&self, item: &TextDocumentItem) {
		let doc = TrackedDocument {
			uri: item.uri.clone(),
			language_id: item.language_id.clone(),
			version: item.version,
			text: item.text.clone(),
		};
		self.docs.write().insert(item.uri.to_string(), doc);
	}

	/// Applies a new version and text; versions never go backwards.
	/// Returns false for untracked uris.
	pub fn update(&self, uri: &Uri, version: i32, text: String) -> bool {
		let mut docs = self.docs.write();
		let Some(doc) = docs.get_mut(&uri.to_string()) else {
			return false;
		};
		doc.version = doc.version.max(version);
		doc.text = text;
		true
	}

	pub fn remove(&self, uri: &Uri) -> Option<TrackedDocument> {
		self.docs.write().remove(&uri.to_string())
	}

	pub fn get(&self, uri: &Uri) -> Option<TrackedDocument> {
		self.docs.read().get(&uri.to_string()).cloned()
	}

	pub fn version(&self, uri: &Uri) -> Option<i32> {
		self.docs.read().get(&uri.to_string()).map(|d| d.version)
	}

	pub fn is_open(&self, uri: &Uri) -> bool {
		self.docs.read().contains_key(&uri.to_string())
	}

	pub fn snapshot(&self) -> Vec<TrackedDocument> {
		self.docs.read().values().cloned().collect()
	}

	pub fn len(&self) -> usize {
		self.docs.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.docs.read().is_empty()
	}
}

#[derive(Debug, Clone)]
struct StoredDiagnostics {
	version: Option<i32>,
	diagnostics: Vec<Diagnostic>,
}

/// Per-uri diagnostics store.
///
/// Owned by the supervisor rather than the connection so markers survive a
/// supervised restart.
#[derive(Default)]
pub struct DiagnosticsCollection {
	map: RwLock<HashMap<String, StoredDiagnostics>>,
}

impl DiagnosticsCollection {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn set(&self, uri: &Uri, version: Option<i32>, diagnostics: Vec<Diagnostic>) {
		self.map
			.write()
			.insert(uri.to_string(), StoredDiagnostics { version, diagnostics });
	}

	pub fn get(&self, uri: &Uri) -> Vec<Diagnostic> {
		self.map
			.read()
			.get(&uri.to_string())
			.map(|s| s.diagnostics.clone())
			.unwrap_or_default()
	}

	pub fn version(&self, uri: &Uri) -> Option<i32> {
		self.map.read().get(&uri.to_string()).and_then(|s| s.version)
	}

	pub fn remove(&self, uri: &Uri) {
		self.map.write().remove(&uri.to_string());
	}

	pub fn clear(&self) {
		self.map.write().clear();
	}

	pub fn len(&self) -> usize {
		self.map.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.map.read().is_empty()
	}
}

#[derive(Debug, Clone)]
struct SelectorRegistration {
	id: String,
	selector: Option<DocumentSelector>,
}

#[derive(Debug, Clone)]
struct ChangeRegistration {
	base: SelectorRegistration,
	sync_kind: TextDocumentSyncKind,
}

#[derive(Debug, Clone)]
struct SaveRegistration {
	base: SelectorRegistration,
	include_text: bool,
}

#[derive(Default)]
struct SyncRegistrations {
	open_close: Vec<SelectorRegistration>,
	change: Vec<ChangeRegistration>,
	will_save: Vec<SelectorRegistration>,
	will_save_wait_until: Vec<SelectorRegistration>,
	save: Vec<SaveRegistration>,
}

fn remove_by_id(bucket: &mut Vec<SelectorRegistration>, id: &str) -> bool {
	let before = bucket.len();
	bucket.retain(|r| r.id != id);
	bucket.len() != before
}

/// One pending debounced full-sync delivery.
struct PendingChange {
	uri: Uri,
	generation: u64,
	timer: tokio::task::JoinHandle<()>,
}

struct SyncInner {
	peer: Peer,
	documents: Arc<DocumentTracker>,
	host: Arc<dyn Host>,
	registrations: Mutex<SyncRegistrations>,
	pending: Mutex<Option<PendingChange>>,
	generation: AtomicU64,
}

/// The synchronization engine proper. Cheap to clone; timers hold a clone.
#[derive(Clone)]
pub struct SyncEngine {
	inner: Arc<SyncInner>,
}

impl SyncEngine {
	pub fn new(peer: Peer, documents: Arc<DocumentTracker>, host: Arc<dyn Host>) -> Self {
		Self {
			inner: Arc::new(SyncInner {
				peer,
				documents,
				host,
				registrations: Mutex::new(SyncRegistrations::default()),
				pending: Mutex::new(None),
				generation: AtomicU64::new(0),
			}),
		}
	}

	pub fn documents(&self) -> &Arc<DocumentTracker> {
		&self.inner.documents
	}

	// --- registration -----------------------------------------------------

	/// Installs an open/close registration. Documents the host already has
	/// open that the new selector covers get a synthesized `didOpen`.
	pub fn register_open_close(&self, id: String, selector: Option<DocumentSelector>) {
		let late_opens: Vec<TextDocumentItem> = {
			let docs = self.inner.documents.clone();
			self.inner
				.host
				.open_documents()
				.into_iter()
				.filter(|item| {
					matches_document(selector.as_ref(), &item.uri, &item.language_id)
						&& !docs.is_open(&item.uri)
				})
				.collect()
		};
		self.inner
			.registrations
			.lock()
			.open_close
			.push(SelectorRegistration { id, selector });
		for item in late_opens {
			self.notify_open(item);
		}
	}

	pub fn register_change(&self, id: String, selector: Option<DocumentSelector>, sync_kind: TextDocumentSyncKind) {
		self.inner.registrations.lock().change.push(ChangeRegistration {
			base: SelectorRegistration { id, selector },
			sync_kind,
		});
	}

	pub fn register_will_save(&self, id: String, selector: Option<DocumentSelector>) {
		self.inner
			.registrations
			.lock()
			.will_save
			.push(SelectorRegistration { id, selector });
	}

	pub fn register_will_save_wait_until(&self, id: String, selector: Option<DocumentSelector>) {
		self.inner
			.registrations
			.lock()
			.will_save_wait_until
			.push(SelectorRegistration { id, selector });
	}

	pub fn register_save(&self, id: String, selector: Option<DocumentSelector>, include_text: bool) {
		self.inner.registrations.lock().save.push(SaveRegistration {
			base: SelectorRegistration { id, selector },
			include_text,
		});
	}

	/// Applies statically advertised server sync options under generated
	/// registration ids.
	pub fn apply_server_defaults(&self, options: &TextDocumentSyncOptions, selector: Option<&DocumentSelector>) {
		let fresh_id = || uuid::Uuid::new_v4().to_string();
		if options.open_close.unwrap_or(false) {
			self.register_open_close(fresh_id(), selector.cloned());
		}
		match options.change {
			Some(kind) if kind != TextDocumentSyncKind::NONE => {
				self.register_change(fresh_id(), selector.cloned(), kind);
			}
			_ => {}
		}
		if options.will_save.unwrap_or(false) {
			self.register_will_save(fresh_id(), selector.cloned());
		}
		if options.will_save_wait_until.unwrap_or(false) {
			self.register_will_save_wait_until(fresh_id(), selector.cloned());
		}
		if let Some(include_text) = save_options_include_text(options) {
			self.register_save(fresh_id(), selector.cloned(), include_text);
		}
	}

	/// Removes the registration `id` under `method`.
	///
	/// Unknown ids report an error to the requester but tear down nothing
	/// else. Removing the last open/close coverage of a tracked document
	/// synthesizes its `didClose`.
	pub fn unregister(&self, method: &str, id: &str) -> Result<()> {
		let unknown = || Error::Protocol(format!("unknown registration id {id:?}"));
		let removed_open_close: Option<SelectorRegistration> = {
			let mut regs = self.inner.registrations.lock();
			match method {
				"textDocument/didOpen" | "textDocument/didClose" => {
					let removed = regs.open_close.iter().find(|r| r.id == id).cloned();
					if !remove_by_id(&mut regs.open_close, id) {
						return Err(unknown());
					}
					removed
				}
				"textDocument/didChange" => {
					let before = regs.change.len();
					regs.change.retain(|r| r.base.id != id);
					if regs.change.len() == before {
						return Err(unknown());
					}
					None
				}
				"textDocument/willSave" => {
					if !remove_by_id(&mut regs.will_save, id) {
						return Err(unknown());
					}
					None
				}
				"textDocument/willSaveWaitUntil" => {
					if !remove_by_id(&mut regs.will_save_wait_until, id) {
						return Err(unknown());
					}
					None
				}
				"textDocument/didSave" => {
					let before = regs.save.len();
					regs.save.retain(|r| r.base.id != id);
					if regs.save.len() == before {
						return Err(unknown());
					}
					None
				}
				other => return Err(Error::Protocol(format!("unknown sync method {other:?}"))),
			}
		};

		if let Some(removed) = removed_open_close {
			self.close_uncovered(&removed);
		}
		Ok(())
	}

	/// Synthesizes `didClose` for tracked documents the removed selector
	/// matched that no remaining open/close selector keeps covered.
	fn close_uncovered(&self, removed: &SelectorRegistration) {
		let orphaned: Vec<TrackedDocument> = {
			let regs = self.inner.registrations.lock();
			self.inner
				.documents
				.snapshot()
				.into_iter()
				.filter(|doc| {
					matches_document(removed.selector.as_ref(), &doc.uri, &doc.language_id)
						&& !regs
							.open_close
							.iter()
							.any(|r| matches_document(r.selector.as_ref(), &doc.uri, &doc.language_id))
				})
				.collect()
		};
		for doc in orphaned {
			debug!(uri = %doc.uri.as_str(), "sync.close_uncovered");
			self.notify_close(&doc.uri);
		}
	}

	// --- editor events ----------------------------------------------------

	/// Host opened a document. Sends `didOpen` and starts tracking it when
	/// some open/close registration covers it.
	pub fn notify_open(&self, item: TextDocumentItem) {
		let covered = {
			let regs = self.inner.registrations.lock();
			regs.open_close
				.iter()
				.any(|r| matches_document(r.selector.as_ref(), &item.uri, &item.language_id))
		};
		if !covered || self.inner.documents.is_open(&item.uri) {
			return;
		}

		debug!(uri = %item.uri.as_str(), version = item.version, "sync.open");
		self.inner.documents.insert(&item);
		self.notify(
			"textDocument/didOpen",
			&DidOpenTextDocumentParams { text_document: item },
		);
	}

	/// Host changed a document.
	///
	/// `changes` is the incremental edit sequence exactly as the host
	/// reported it; `text` is the full post-change buffer. The tracker
	/// updates immediately; what goes on the wire depends on the matching
	/// registration's sync kind.
	pub fn notify_change(
		&self,
		uri: &Uri,
		version: i32,
		changes: Vec<TextDocumentContentChangeEvent>,
		text: String,
	) {
		if !self.inner.documents.update(uri, version, text) {
			debug!(uri = %uri.as_str(), "sync.change_untracked");
			return;
		}
		let Some(doc) = self.inner.documents.get(uri) else {
			return;
		};

		let kind = {
			let regs = self.inner.registrations.lock();
			regs.change
				.iter()
				.find(|r| matches_document(r.base.selector.as_ref(), uri, &doc.language_id))
				.map(|r| r.sync_kind)
		};

		match kind {
			None => {}
			Some(kind) if kind == TextDocumentSyncKind::NONE => {}
			Some(kind) if kind == TextDocumentSyncKind::INCREMENTAL => {
				// Ordering: anything still debounced for this uri goes first.
				self.flush_if_bound(uri);
				self.notify(
					"textDocument/didChange",
					&DidChangeTextDocumentParams {
						text_document: VersionedTextDocumentIdentifier {
							uri: uri.clone(),
							version: doc.version,
						},
						content_changes: changes,
					},
				);
			}
			Some(_) => self.schedule_full(uri),
		}
	}

	/// Binds (or rebinds) the delayer to `uri` with a fresh deadline.
	fn schedule_full(&self, uri: &Uri) {
		let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
		let engine = self.clone();
		let timer_uri = uri.clone();
		let timer = tokio::spawn(async move {
			tokio::time::sleep(CHANGE_DEBOUNCE).await;
			engine.flush_generation(generation, &timer_uri);
		});

		let stale = {
			let mut pending = self.inner.pending.lock();
			let stale = match pending.take() {
				// Different uri still pending: flush it before rebinding.
				Some(prev) if prev.uri.as_str() != uri.as_str() => Some(prev),
				Some(prev) => {
					prev.timer.abort();
					None
				}
				None => None,
			};
			*pending = Some(PendingChange {
				uri: uri.clone(),
				generation,
				timer,
			});
			stale
		};
		if let Some(prev) = stale {
			prev.timer.abort();
			self.send_full_change(&prev.uri);
		}
	}

	fn flush_generation(&self, generation: u64, uri: &Uri) {
		let fired = {
			let mut pending = self.inner.pending.lock();
			// A non-matching generation means the slot was force-flushed or
			// rebound in the meantime.
			if pending.as_ref().is_some_and(|p| p.generation == generation) {
				pending.take()
			} else {
				None
			}
		};
		if fired.is_some() {
			self.send_full_change(uri);
		}
	}

	/// Drains the pending delayer, if any. No-op when nothing is pending;
	/// draining twice produces exactly one `didChange`.
	pub fn flush_pending(&self) {
		let taken = self.inner.pending.lock().take();
		if let Some(p) = taken {
			p.timer.abort();
			self.send_full_change(&p.uri);
		}
	}

	fn flush_if_bound(&self, uri: &Uri) {
		let taken = {
			let mut pending = self.inner.pending.lock();
			if pending.as_ref().is_some_and(|p| p.uri.as_str() == uri.as_str()) {
				pending.take()
			} else {
				None
			}
		};
		if let Some(p) = taken {
			p.timer.abort();
			self.send_full_change(&p.uri);
		}
	}

	fn send_full_change(&self, uri: &Uri) {
		let Some(doc) = self.inner.documents.get(uri) else {
			return;
		};
		debug!(uri = %uri.as_str(), version = doc.version, bytes = doc.text.len(), "sync.flush_full");
		self.notify(
			"textDocument/didChange",
			&DidChangeTextDocumentParams {
				text_document: VersionedTextDocumentIdentifier {
					uri: uri.clone(),
					version: doc.version,
				},
				content_changes: vec![TextDocumentContentChangeEvent {
					range: None,
					range_length: None,
					text: doc.text,
				}],
			},
		);
	}

	/// Pre-save hook, notification flavor.
	pub fn notify_will_save(&self, uri: &Uri, reason: TextDocumentSaveReason) {
		let Some(doc) = self.inner.documents.get(uri) else {
			return;
		};
		let covered = {
			let regs = self.inner.registrations.lock();
			regs.will_save
				.iter()
				.any(|r| matches_document(r.selector.as_ref(), uri, &doc.language_id))
		};
		if !covered {
			return;
		}
		self.notify(
			"textDocument/willSave",
			&WillSaveTextDocumentParams {
				text_document: TextDocumentIdentifier { uri: uri.clone() },
				reason,
			},
		);
	}

	/// Pre-save hook, request flavor: the host applies the returned edits
	/// before completing the save. The wait is bounded by
	/// [`WILL_SAVE_WAIT_UNTIL_TIMEOUT`]; timeouts and errors yield no edits.
	pub async fn will_save_wait_until(&self, uri: &Uri, reason: TextDocumentSaveReason) -> Vec<TextEdit> {
		let Some(doc) = self.inner.documents.get(uri) else {
			return Vec::new();
		};
		let covered = {
			let regs = self.inner.registrations.lock();
			regs.will_save_wait_until
				.iter()
				.any(|r| matches_document(r.selector.as_ref(), uri, &doc.language_id))
		};
		if !covered {
			return Vec::new();
		}

		// The peer must see the latest text before computing edits.
		self.flush_pending();

		let params = WillSaveTextDocumentParams {
			text_document: TextDocumentIdentifier { uri: uri.clone() },
			reason,
		};
		let Ok(params) = serde_json::to_value(&params) else {
			return Vec::new();
		};
		let request = self
			.inner
			.peer
			.request("textDocument/willSaveWaitUntil", params, CancellationToken::new());
		match tokio::time::timeout(WILL_SAVE_WAIT_UNTIL_TIMEOUT, request).await {
			Ok(Ok(value)) => serde_json::from_value(value).unwrap_or_default(),
			Ok(Err(err)) => {
				let err = Error::from(err);
				if !err.is_benign() {
					warn!(uri = %uri.as_str(), error = %err, "sync.will_save_wait_until_failed");
				}
				Vec::new()
			}
			Err(_elapsed) => {
				warn!(uri = %uri.as_str(), "sync.will_save_wait_until_timeout");
				Vec::new()
			}
		}
	}

	/// Host saved a document. Includes the text only when a matching save
	/// registration asked for it.
	pub fn notify_save(&self, uri: &Uri, text: Option<String>) {
		let Some(doc) = self.inner.documents.get(uri) else {
			return;
		};
		let include_text = {
			let regs = self.inner.registrations.lock();
			match regs
				.save
				.iter()
				.find(|r| matches_document(r.base.selector.as_ref(), uri, &doc.language_id))
			{
				Some(reg) => reg.include_text,
				None => return,
			}
		};

		// didChange before didSave, per-uri.
		self.flush_if_bound(uri);

		let text = include_text.then(|| text.unwrap_or(doc.text));
		self.notify(
			"textDocument/didSave",
			&DidSaveTextDocumentParams {
				text_document: TextDocumentIdentifier { uri: uri.clone() },
				text,
			},
		);
	}

	/// Host closed a document. Sends `didClose` and stops tracking.
	///
	/// Tracked means open at the peer, so the close always goes out; any
	/// debounced change for the uri is delivered first.
	pub fn notify_close(&self, uri: &Uri) {
		if !self.inner.documents.is_open(uri) {
			return;
		}
		self.flush_if_bound(uri);
		self.inner.documents.remove(uri);
		debug!(uri = %uri.as_str(), "sync.close");
		self.notify(
			"textDocument/didClose",
			&DidCloseTextDocumentParams {
				text_document: TextDocumentIdentifier { uri: uri.clone() },
			},
		);
	}

	/// Disposes all registrations and synthesizes nothing; used on teardown.
	pub fn dispose(&self) {
		let mut pending = self.inner.pending.lock();
		if let Some(p) = pending.take() {
			p.timer.abort();
		}
		let mut regs = self.inner.registrations.lock();
		*regs = SyncRegistrations::default();
	}

	fn notify<P: serde::Serialize>(&self, method: &str, params: &P) {
		match serde_json::to_value(params) {
			Ok(value) => {
				if self.inner.peer.notify(method, value).is_err() {
					debug!(method, "sync.notify_after_close");
				}
			}
			Err(err) => warn!(method, error = %err, "sync.serialize_failed"),
		}
	}
}
