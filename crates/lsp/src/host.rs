//! Host editor surfaces.
//!
//! The document store, diagnostic display, provider registration, progress
//! UI, configuration store, and filesystem watchers all belong to the
//! embedding editor. The runtime reaches them through these traits;
//! everything has a no-op default so hosts (and test fakes) implement only
//! what they surface.

use std::sync::Arc;

use async_trait::async_trait;
use lsp_types::{
	ApplyWorkspaceEditParams, Diagnostic, DocumentSelector, FileChangeType, MessageActionItem,
	MessageType, ShowMessageRequestParams, TextDocumentItem, Uri, WatchKind,
	WorkDoneProgressBegin, WorkDoneProgressEnd, WorkDoneProgressReport, WorkspaceFolder,
};

use crate::JsonValue;

/// Main host surface: workspace operations, window sinks, and the
/// document store.
#[async_trait]
pub trait Host: Send + Sync + 'static {
	/// Applies a workspace edit and reports whether it was applied.
	async fn apply_edit(&self, _params: ApplyWorkspaceEditParams) -> bool {
		false
	}

	/// Reads a configuration section, optionally scoped to a folder uri.
	fn configuration_value(&self, _section: Option<&str>, _scope_uri: Option<&Uri>) -> JsonValue {
		JsonValue::Null
	}

	fn workspace_folders(&self) -> Option<Vec<WorkspaceFolder>> {
		None
	}

	/// Documents currently open in the editor, for late registrations.
	fn open_documents(&self) -> Vec<TextDocumentItem> {
		Vec::new()
	}

	fn show_message(&self, _typ: MessageType, _message: String) {}

	async fn show_message_request(&self, _params: ShowMessageRequestParams) -> Option<MessageActionItem> {
		None
	}

	fn log_message(&self, _typ: MessageType, _message: String) {}

	fn telemetry(&self, _data: JsonValue) {}

	/// Diagnostic display; the runtime keeps its own collection, this is
	/// the render side.
	fn publish_diagnostics(&self, _uri: Uri, _version: Option<i32>, _diagnostics: Vec<Diagnostic>) {}
}

/// Host with nothing to surface; useful as a default and in tests.
pub struct NullHost;

#[async_trait]
impl Host for NullHost {}

/// Guard for anything the host hands out that must be torn down on
/// unregistration. Dropping it disposes the resource.
pub struct Disposal(Option<Box<dyn FnOnce() + Send>>);

impl Disposal {
	pub fn new(dispose: impl FnOnce() + Send + 'static) -> Self {
		Self(Some(Box::new(dispose)))
	}

	pub fn noop() -> Self {
		Self(None)
	}
}

impl Drop for Disposal {
	fn drop(&mut self) {
		if let Some(dispose) = self.0.take() {
			dispose();
		}
	}
}

impl std::fmt::Debug for Disposal {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_tuple("Disposal").finish()
	}
}

/// Sink a host-native watcher feeds filesystem events into.
pub type WatchSink = Arc<dyn Fn(Uri, FileChangeType) + Send + Sync>;

/// Installs host-native filesystem watchers.
pub trait WatcherFactory: Send + Sync + 'static {
	/// Watches `glob_pattern`, delivering only events covered by `kind`.
	/// The returned guard tears the watcher down.
	fn watch(&self, glob_pattern: &str, kind: WatchKind, sink: WatchSink) -> Disposal;
}

/// Factory for hosts without filesystem watching.
pub struct NullWatcherFactory;

impl WatcherFactory for NullWatcherFactory {
	fn watch(&self, _glob_pattern: &str, _kind: WatchKind, _sink: WatchSink) -> Disposal {
		Disposal::noop()
	}
}

/// Turns protocol registrations into host provider registrations
/// (completion menus, hover surfaces, …). Thin glue: the options are the
/// registration options verbatim.
pub trait ProviderHost: Send + Sync + 'static {
	fn register_provider(
		&self,
		method: &str,
		selector: Option<&DocumentSelector>,
		options: &JsonValue,
	) -> Disposal;
}

pub struct NullProviderHost;

impl ProviderHost for NullProviderHost {
	fn register_provider(&self, _method: &str, _selector: Option<&DocumentSelector>, _options: &JsonValue) -> Disposal {
		Disposal::noop()
	}
}

/// One live progress report in the host UI.
pub trait ProgressHandle: Send {
	fn report(&mut self, report: WorkDoneProgressReport);
	fn end(&mut self, end: WorkDoneProgressEnd);
}

/// Host progress UI. `on_cancel` fires when the user cancels a
/// cancellable progress; the runtime turns that into
/// `window/workDoneProgress/cancel`.
pub trait ProgressView: Send + Sync + 'static {
	fn begin(&self, begin: WorkDoneProgressBegin, on_cancel: Box<dyn Fn() + Send + Sync>) -> Box<dyn ProgressHandle>;
}

pub struct NullProgressView;

struct NullProgressHandle;

impl ProgressHandle for NullProgressHandle {
	fn report(&mut self, _report: WorkDoneProgressReport) {}
	fn end(&mut self, _end: WorkDoneProgressEnd) {}
}

impl ProgressView for NullProgressView {
	fn begin(&self, _begin: WorkDoneProgressBegin, _on_cancel: Box<dyn Fn() + Send + Sync>) -> Box<dyn ProgressHandle> {
		Box::new(NullProgressHandle)
	}
}
