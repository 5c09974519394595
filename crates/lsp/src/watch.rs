//! File-watch aggregator.
//!
//! Each registration installs one host-native watcher per glob entry.
//! Events land in an in-memory queue; a single debounce timer drains the
//! queue after a quiet window and sends one
//! `workspace/didChangeWatchedFiles` batch. Events are neither deduplicated
//! nor reordered.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use lsp_types::{
	ClientCapabilities, DidChangeWatchedFilesClientCapabilities,
	DidChangeWatchedFilesParams, DidChangeWatchedFilesRegistrationOptions, DocumentSelector,
	FileChangeType, FileEvent, GlobPattern, OneOf, ServerCapabilities, Uri, WatchKind,
};
use parking_lot::Mutex;
use tether_rpc::Peer;
use tracing::{debug, warn};

use crate::features::DynamicFeature;
use crate::features::selector::uri_path;
use crate::host::{Disposal, WatcherFactory};
use crate::{Error, JsonValue, Result};

/// Quiet window before a batch of file events goes out.
pub const WATCH_DEBOUNCE: Duration = Duration::from_millis(250);

fn kind_bit(typ: FileChangeType) -> WatchKind {
	match typ {
		FileChangeType::CREATED => WatchKind::Create,
		FileChangeType::DELETED => WatchKind::Delete,
		_ => WatchKind::Change,
	}
}

fn pattern_string(pattern: &GlobPattern) -> String {
	match pattern {
		GlobPattern::String(p) => p.clone(),
		GlobPattern::Relative(rp) => {
			let base = match &rp.base_uri {
				OneOf::Left(folder) => uri_path(&folder.uri).to_string(),
				OneOf::Right(uri) => uri_path(uri).to_string(),
			};
			format!("{}/{}", base.trim_end_matches('/'), rp.pattern)
		}
	}
}

struct WatchRegistration {
	/// Host watcher guards; dropping them tears the watchers down.
	guards: Vec<Disposal>,
}

struct WatchInner {
	peer: Peer,
	factory: Arc<dyn WatcherFactory>,
	registrations: Mutex<HashMap<String, WatchRegistration>>,
	queue: Mutex<Vec<FileEvent>>,
	timer: Mutex<Option<(u64, tokio::task::JoinHandle<()>)>>,
	generation: AtomicU64,
}

/// Debounced batcher plus the dynamic feature over it.
#[derive(Clone)]
pub struct FileWatchFeature {
	inner: Arc<WatchInner>,
}

impl FileWatchFeature {
	pub fn new(peer: Peer, factory: Arc<dyn WatcherFactory>) -> Self {
		Self {
			inner: Arc::new(WatchInner {
				peer,
				factory,
				registrations: Mutex::new(HashMap::new()),
				queue: Mutex::new(Vec::new()),
				timer: Mutex::new(None),
				generation: AtomicU64::new(0),
			}),
		}
	}

	/// Queues one event and restarts the quiet-window timer.
	pub fn enqueue(&self, uri: Uri, typ: FileChangeType) {
		self.inner.queue.lock().push(FileEvent { uri, typ });

		let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
		let this = self.clone();
		let handle = tokio::spawn(async move {
			tokio::time::sleep(WATCH_DEBOUNCE).await;
			this.fire(generation);
		});
		let mut timer = self.inner.timer.lock();
		if let Some((_, old)) = timer.replace((generation, handle)) {
			old.abort();
		}
	}

	fn fire(&self, generation: u64) {
		{
			let mut timer = self.inner.timer.lock();
			// A non-matching generation means a newer event restarted the
			// window.
			if !timer.as_ref().is_some_and(|(current, _)| *current == generation) {
				return;
			}
			timer.take();
		}

		let changes: Vec<FileEvent> = std::mem::take(&mut *self.inner.queue.lock());
		if changes.is_empty() {
			return;
		}
		debug!(count = changes.len(), "watch.flush");
		let params = DidChangeWatchedFilesParams { changes };
		match serde_json::to_value(&params) {
			Ok(value) => {
				let _ = self.inner.peer.notify("workspace/didChangeWatchedFiles", value);
			}
			Err(err) => warn!(error = %err, "watch.serialize_failed"),
		}
	}

	fn install(&self, id: &str, options: DidChangeWatchedFilesRegistrationOptions) {
		let mut guards = Vec::with_capacity(options.watchers.len());
		for watcher in options.watchers {
			let kind = watcher.kind.unwrap_or(WatchKind::all());
			let pattern = pattern_string(&watcher.glob_pattern);
			let this = self.clone();
			let sink: crate::host::WatchSink = Arc::new(move |uri, typ| {
				// The registration's kind bitmask filters here so hosts with
				// coarser native watchers still honor it.
				if kind.contains(kind_bit(typ)) {
					this.enqueue(uri, typ);
				}
			});
			guards.push(self.inner.factory.watch(&pattern, kind, sink));
		}
		self.inner
			.registrations
			.lock()
			.insert(id.to_string(), WatchRegistration { guards });
	}
}

impl DynamicFeature for FileWatchFeature {
	fn methods(&self) -> Vec<&'static str> {
		vec!["workspace/didChangeWatchedFiles"]
	}

	fn fill_client_capabilities(&self, caps: &mut ClientCapabilities) {
		caps.workspace
			.get_or_insert_with(Default::default)
			.did_change_watched_files = Some(DidChangeWatchedFilesClientCapabilities {
			dynamic_registration: Some(true),
			relative_pattern_support: Some(true),
		});
	}

	fn initialize(&self, _server_caps: &ServerCapabilities, _selector: Option<&DocumentSelector>) {
		// Watchers only arrive through dynamic registration.
	}

	fn register(&self, _method: &str, id: &str, options: JsonValue) -> Result<()> {
		let options: DidChangeWatchedFilesRegistrationOptions = serde_json::from_value(options)
			.map_err(|err| Error::Protocol(format!("bad watcher registration options: {err}")))?;
		self.install(id, options);
		Ok(())
	}

	fn unregister(&self, _method: &str, id: &str) -> Result<()> {
		match self.inner.registrations.lock().remove(id) {
			// Guards drop here, disposing the host watchers.
			Some(_registration) => Ok(()),
			None => Err(Error::Protocol(format!("unknown registration id {id:?}"))),
		}
	}

	fn dispose(&self) {
		self.inner.registrations.lock().clear();
		if let Some((_, handle)) = self.inner.timer.lock().take() {
			handle.abort();
		}
		self.inner.queue.lock().clear();
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;
	use tether_rpc::{ChannelTransport, MainLoop, Message, MessageTransport, Router};

	use super::*;
	use crate::host::WatchSink;

	#[derive(Default)]
	struct FakeWatcherFactory {
		sinks: Mutex<Vec<(String, WatchKind, WatchSink)>>,
		disposed: Arc<AtomicU64>,
	}

	impl FakeWatcherFactory {
		fn push(&self, index: usize, uri: &str, typ: FileChangeType) {
			let sink = self.sinks.lock()[index].2.clone();
			sink(uri.parse().unwrap(), typ);
		}
	}

	impl WatcherFactory for FakeWatcherFactory {
		fn watch(&self, glob_pattern: &str, kind: WatchKind, sink: WatchSink) -> Disposal {
			self.sinks.lock().push((glob_pattern.to_string(), kind, sink));
			let disposed = self.disposed.clone();
			Disposal::new(move || {
				disposed.fetch_add(1, Ordering::SeqCst);
			})
		}
	}

	struct Rig {
		feature: FileWatchFeature,
		factory: Arc<FakeWatcherFactory>,
		far: ChannelTransport,
	}

	fn rig() -> Rig {
		let (near, far) = ChannelTransport::pair();
		let (main_loop, peer) = MainLoop::new(|_| Router::new());
		tokio::spawn(main_loop.run(near));
		let factory = Arc::new(FakeWatcherFactory::default());
		let feature = FileWatchFeature::new(peer, factory.clone());
		Rig { feature, factory, far }
	}

	fn register(feature: &FileWatchFeature, id: &str, glob: &str, kind: Option<u8>) {
		let mut watcher = json!({"globPattern": glob});
		if let Some(kind) = kind {
			watcher["kind"] = json!(kind);
		}
		feature
			.register("workspace/didChangeWatchedFiles", id, json!({"watchers": [watcher]}))
			.unwrap();
	}

	#[tokio::test(start_paused = true)]
	async fn batches_events_after_quiet_window_in_order() {
		let mut r = rig();
		register(&r.feature, "w1", "**/*.txt", None);

		// Three events inside a 50 ms window.
		r.factory.push(0, "file:///w/a.txt", FileChangeType::CREATED);
		tokio::time::sleep(Duration::from_millis(20)).await;
		r.factory.push(0, "file:///w/a.txt", FileChangeType::CHANGED);
		tokio::time::sleep(Duration::from_millis(20)).await;
		r.factory.push(0, "file:///w/b.txt", FileChangeType::DELETED);

		tokio::time::sleep(WATCH_DEBOUNCE + Duration::from_millis(50)).await;

		let msg = r.far.recv().await.unwrap().unwrap();
		let params = match msg {
			Message::Notification(n) => {
				assert_eq!(n.method, "workspace/didChangeWatchedFiles");
				n.params
			}
			other => panic!("expected notification, got {other:?}"),
		};
		let changes = params["changes"].as_array().unwrap();
		assert_eq!(changes.len(), 3, "no dedup, order preserved");
		assert_eq!(changes[0]["uri"], "file:///w/a.txt");
		assert_eq!(changes[0]["type"], 1);
		assert_eq!(changes[1]["uri"], "file:///w/a.txt");
		assert_eq!(changes[1]["type"], 2);
		assert_eq!(changes[2]["uri"], "file:///w/b.txt");
		assert_eq!(changes[2]["type"], 3);
	}

	#[tokio::test(start_paused = true)]
	async fn each_event_restarts_the_quiet_window() {
		let mut r = rig();
		register(&r.feature, "w1", "**/*", None);

		r.factory.push(0, "file:///w/a.txt", FileChangeType::CREATED);
		// Keep poking just before the window elapses.
		for _ in 0..3 {
			tokio::time::sleep(WATCH_DEBOUNCE - Duration::from_millis(10)).await;
			r.factory.push(0, "file:///w/a.txt", FileChangeType::CHANGED);
		}
		tokio::time::sleep(WATCH_DEBOUNCE + Duration::from_millis(50)).await;

		let msg = r.far.recv().await.unwrap().unwrap();
		match msg {
			Message::Notification(n) => {
				assert_eq!(n.params["changes"].as_array().unwrap().len(), 4);
			}
			other => panic!("expected one batched notification, got {other:?}"),
		}
	}

	#[tokio::test(start_paused = true)]
	async fn kind_bitmask_filters_events() {
		let mut r = rig();
		// 1 = Create only.
		register(&r.feature, "w1", "**/*", Some(1));

		r.factory.push(0, "file:///w/a.txt", FileChangeType::CHANGED);
		r.factory.push(0, "file:///w/a.txt", FileChangeType::DELETED);
		r.factory.push(0, "file:///w/a.txt", FileChangeType::CREATED);
		tokio::time::sleep(WATCH_DEBOUNCE + Duration::from_millis(50)).await;

		let msg = r.far.recv().await.unwrap().unwrap();
		match msg {
			Message::Notification(n) => {
				let changes = n.params["changes"].as_array().unwrap();
				assert_eq!(changes.len(), 1);
				assert_eq!(changes[0]["type"], 1);
			}
			other => panic!("expected notification, got {other:?}"),
		}
	}

	#[tokio::test]
	async fn unregister_disposes_host_watchers() {
		let r = rig();
		register(&r.feature, "w1", "**/*.rs", None);
		register(&r.feature, "w2", "**/*.toml", None);
		assert_eq!(r.factory.disposed.load(Ordering::SeqCst), 0);

		r.feature.unregister("workspace/didChangeWatchedFiles", "w1").unwrap();
		assert_eq!(r.factory.disposed.load(Ordering::SeqCst), 1);

		// Unknown ids error without touching the other registration.
		assert!(r.feature.unregister("workspace/didChangeWatchedFiles", "w1").is_err());
		assert_eq!(r.factory.disposed.load(Ordering::SeqCst), 1);
	}
}
