//! Client endpoint.
//!
//! A [`Client`] owns one connection's protocol state: the feature registry,
//! the synchronization engine, the file-watch aggregator, progress routing,
//! the configuration bridge, and the inbound server→client method table.
//! Everything reaches the wire through the dispatcher's peer handle, and
//! every outbound send drains the change delayer first so the server never
//! observes a request ahead of the buffer state it was issued against.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use lsp_types::{
	ClientCapabilities, DocumentSelector, InitializeParams, InitializeResult, LogMessageParams,
	PublishDiagnosticsParams, RegistrationParams, ServerCapabilities, SetTraceParams,
	ShowMessageParams, ShowMessageRequestParams, TraceValue, UnregistrationParams, Uri,
	WorkDoneProgressCreateParams, WorkspaceFolder,
};
use parking_lot::RwLock;
use serde_json::json;
use tether_rpc::{ErrorCode, Peer, ResponseError, Router, TraceLevel};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::apply_edit::handle_apply_edit;
use crate::configuration::ConfigurationFeature;
use crate::features::FeatureRegistry;
use crate::features::text_sync::TextDocumentSyncFeature;
use crate::host::{Host, ProviderHost, ProgressView, WatcherFactory};
use crate::progress::ProgressRouter;
use crate::providers::{Middleware, MiddlewareChain, PROVIDER_METHODS, ProviderFeature, TerminalHandler};
use crate::supervisor::ConnectionState;
use crate::sync::{DiagnosticsCollection, DocumentTracker, SyncEngine};
use crate::watch::FileWatchFeature;
use crate::{Error, JsonValue, Result};

/// Bound on the `shutdown` roundtrip during a graceful stop; an
/// unresponsive server degrades to plain transport teardown.
pub const SHUTDOWN_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection-independent client configuration.
#[derive(Clone)]
pub struct ClientOptions {
	pub process_id: Option<u32>,
	pub root_uri: Option<Uri>,
	pub initialization_options: Option<JsonValue>,
	/// Default selector features fall back to when a registration carries
	/// none.
	pub document_selector: Option<DocumentSelector>,
	pub trace: TraceLevel,
	pub workspace_folders: Option<Vec<WorkspaceFolder>>,
	/// Sections pushed through `workspace/didChangeConfiguration`.
	pub configuration_sections: Vec<String>,
}

impl Default for ClientOptions {
	fn default() -> Self {
		Self {
			process_id: Some(std::process::id()),
			root_uri: None,
			initialization_options: None,
			document_selector: None,
			trace: TraceLevel::Off,
			workspace_folders: None,
			configuration_sections: Vec::new(),
		}
	}
}

/// Host-side collaborators a client is wired to.
#[derive(Clone)]
pub struct ClientServices {
	pub host: Arc<dyn Host>,
	pub watcher_factory: Arc<dyn WatcherFactory>,
	pub provider_host: Arc<dyn ProviderHost>,
	pub progress_view: Arc<dyn ProgressView>,
	pub middleware: Vec<Arc<dyn Middleware>>,
}

impl Default for ClientServices {
	fn default() -> Self {
		Self {
			host: Arc::new(crate::host::NullHost),
			watcher_factory: Arc::new(crate::host::NullWatcherFactory),
			provider_host: Arc::new(crate::host::NullProviderHost),
			progress_view: Arc::new(crate::host::NullProgressView),
			middleware: Vec::new(),
		}
	}
}

struct ClientInner {
	peer: Peer,
	router: Arc<Router>,
	registry: Arc<FeatureRegistry>,
	sync: SyncEngine,
	watch: FileWatchFeature,
	configuration: ConfigurationFeature,
	progress: ProgressRouter,
	documents: Arc<DocumentTracker>,
	diagnostics: Arc<DiagnosticsCollection>,
	host: Arc<dyn Host>,
	options: ClientOptions,
	middleware: MiddlewareChain,
	server_capabilities: RwLock<Option<ServerCapabilities>>,
	state: Arc<RwLock<ConnectionState>>,
}

#[derive(Clone)]
pub struct Client {
	inner: Arc<ClientInner>,
}

impl Client {
	/// Wires a client onto a dispatcher peer/router pair.
	///
	/// `state` is shared with whoever supervises the connection; a client
	/// built for direct use should pass a fresh handle and call
	/// [`Client::set_state`] after [`Client::initialize`].
	pub fn new(
		peer: Peer,
		router: Arc<Router>,
		services: ClientServices,
		options: ClientOptions,
		diagnostics: Arc<DiagnosticsCollection>,
		state: Arc<RwLock<ConnectionState>>,
	) -> Self {
		let documents = DocumentTracker::new();
		let sync = SyncEngine::new(peer.clone(), documents.clone(), services.host.clone());
		let watch = FileWatchFeature::new(peer.clone(), services.watcher_factory.clone());
		let configuration = ConfigurationFeature::new(
			peer.clone(),
			services.host.clone(),
			options.configuration_sections.clone(),
		);
		let progress = ProgressRouter::new(peer.clone(), services.progress_view.clone());

		let mut registry = FeatureRegistry::new();
		registry.add_static(crate::features::WorkspaceBaseFeature);
		registry.add_dynamic(Arc::new(TextDocumentSyncFeature::new(sync.clone())));
		registry.add_dynamic(Arc::new(watch.clone()));
		registry.add_dynamic(Arc::new(configuration.clone()));
		for method in PROVIDER_METHODS {
			registry.add_dynamic(Arc::new(ProviderFeature::new(method, services.provider_host.clone())));
		}
		let registry = Arc::new(registry);

		let terminal: TerminalHandler = {
			let peer = peer.clone();
			let sync = sync.clone();
			Arc::new(move |method: String, params: JsonValue| {
				let peer = peer.clone();
				let sync = sync.clone();
				async move {
					sync.flush_pending();
					peer.request(method, params, CancellationToken::new())
						.await
						.map_err(Error::from)
				}
				.boxed()
			})
		};
		let middleware = MiddlewareChain::new(services.middleware.clone(), terminal);

		let inner = Arc::new(ClientInner {
			peer,
			router,
			registry,
			sync,
			watch,
			configuration,
			progress,
			documents,
			diagnostics,
			host: services.host,
			options,
			middleware,
			server_capabilities: RwLock::new(None),
			state,
		});
		let client = Self { inner };
		client.install_handlers();
		client
	}

	fn install_handlers(&self) {
		let router = &self.inner.router;

		// Dynamic (un)registration, including the legacy aliases.
		for method in ["client/registerCapability", "client/registerFeature"] {
			let registry = self.inner.registry.clone();
			router.on_request(method, move |req, _cx| {
				let registry = registry.clone();
				async move {
					let params: RegistrationParams = parse_params(req.params)?;
					let mut failures = Vec::new();
					for registration in &params.registrations {
						if let Err(err) = registry.register_capability(registration) {
							failures.push(json!({
								"id": registration.id,
								"method": registration.method,
								"message": err.to_string(),
							}));
						}
					}
					registration_outcome(failures)
				}
				.boxed()
			});
		}
		for method in ["client/unregisterCapability", "client/unregisterFeature"] {
			let registry = self.inner.registry.clone();
			router.on_request(method, move |req, _cx| {
				let registry = registry.clone();
				async move {
					let params: UnregistrationParams = parse_params(req.params)?;
					let mut failures = Vec::new();
					for unregistration in &params.unregisterations {
						if let Err(err) = registry.unregister_capability(unregistration) {
							failures.push(json!({
								"id": unregistration.id,
								"method": unregistration.method,
								"message": err.to_string(),
							}));
						}
					}
					registration_outcome(failures)
				}
				.boxed()
			});
		}

		// Workspace surface.
		{
			let documents = self.inner.documents.clone();
			let host = self.inner.host.clone();
			router.on_request("workspace/applyEdit", move |req, _cx| {
				let documents = documents.clone();
				let host = host.clone();
				async move {
					let params = parse_params(req.params)?;
					let response = handle_apply_edit(params, &documents, &host).await;
					serde_json::to_value(response)
						.map_err(|err| ResponseError::new(ErrorCode::INTERNAL_ERROR, err.to_string()))
				}
				.boxed()
			});
		}
		{
			let configuration = self.inner.configuration.clone();
			router.on_request("workspace/configuration", move |req, _cx| {
				let configuration = configuration.clone();
				async move {
					let params = parse_params(req.params)?;
					Ok(JsonValue::Array(configuration.pull(params)))
				}
				.boxed()
			});
		}
		{
			let host = self.inner.host.clone();
			router.on_request("workspace/workspaceFolders", move |_req, _cx| {
				let host = host.clone();
				async move {
					serde_json::to_value(host.workspace_folders())
						.map_err(|err| ResponseError::new(ErrorCode::INTERNAL_ERROR, err.to_string()))
				}
				.boxed()
			});
		}

		// Window surface.
		{
			let progress = self.inner.progress.clone();
			router.on_request("window/workDoneProgress/create", move |req, _cx| {
				let progress = progress.clone();
				async move {
					let params: WorkDoneProgressCreateParams = parse_params(req.params)?;
					progress.handle_create(params);
					Ok(JsonValue::Null)
				}
				.boxed()
			});
		}
		{
			let progress = self.inner.progress.clone();
			router.on_notification("$/progress", move |notif| {
				match serde_json::from_value(notif.params) {
					Ok(params) => progress.handle_progress(params),
					Err(err) => warn!(error = %err, "client.bad_progress_params"),
				}
				ControlFlow::Continue(())
			});
		}
		{
			let host = self.inner.host.clone();
			router.on_request("window/showMessageRequest", move |req, _cx| {
				let host = host.clone();
				async move {
					let params: ShowMessageRequestParams = parse_params(req.params)?;
					let choice = host.show_message_request(params).await;
					serde_json::to_value(choice)
						.map_err(|err| ResponseError::new(ErrorCode::INTERNAL_ERROR, err.to_string()))
				}
				.boxed()
			});
		}
		{
			let host = self.inner.host.clone();
			router.on_notification("window/showMessage", move |notif| {
				if let Ok(params) = serde_json::from_value::<ShowMessageParams>(notif.params) {
					host.show_message(params.typ, params.message);
				}
				ControlFlow::Continue(())
			});
		}
		{
			let host = self.inner.host.clone();
			router.on_notification("window/logMessage", move |notif| {
				if let Ok(params) = serde_json::from_value::<LogMessageParams>(notif.params) {
					host.log_message(params.typ, params.message);
				}
				ControlFlow::Continue(())
			});
		}
		{
			let host = self.inner.host.clone();
			router.on_notification("telemetry/event", move |notif| {
				host.telemetry(notif.params);
				ControlFlow::Continue(())
			});
		}

		// Diagnostics land in the collection first, then the display.
		{
			let host = self.inner.host.clone();
			let diagnostics = self.inner.diagnostics.clone();
			router.on_notification("textDocument/publishDiagnostics", move |notif| {
				match serde_json::from_value::<PublishDiagnosticsParams>(notif.params) {
					Ok(params) => {
						diagnostics.set(&params.uri, params.version, params.diagnostics.clone());
						host.publish_diagnostics(params.uri, params.version, params.diagnostics);
					}
					Err(err) => warn!(error = %err, "client.bad_diagnostics_params"),
				}
				ControlFlow::Continue(())
			});
		}
	}

	/// Runs the initialize sequence: capability negotiation, feature
	/// initialization, and the `initialized` notification.
	pub async fn initialize(&self) -> Result<InitializeResult> {
		let capabilities = self.inner.registry.fill_client_capabilities();
		let mut params = self.initialize_params(capabilities);
		self.inner.registry.fill_initialize_params(&mut params);

		let params_value = serde_json::to_value(&params)?;
		let raw = self
			.inner
			.peer
			.request("initialize", params_value, CancellationToken::new())
			.await
			.map_err(Error::from)?;
		let result: InitializeResult = serde_json::from_value(raw)?;

		*self.inner.server_capabilities.write() = Some(result.capabilities.clone());
		self.inner
			.registry
			.initialize_all(&result.capabilities, self.inner.options.document_selector.as_ref());

		self.inner.peer.notify("initialized", json!({})).map_err(Error::from)?;
		debug!("client.initialized");
		Ok(result)
	}

	#[allow(deprecated)] // rootUri is deprecated in the schema but still negotiated.
	fn initialize_params(&self, capabilities: ClientCapabilities) -> InitializeParams {
		let options = &self.inner.options;
		InitializeParams {
			process_id: options.process_id,
			root_uri: options.root_uri.clone(),
			initialization_options: options.initialization_options.clone(),
			capabilities,
			trace: Some(match options.trace {
				TraceLevel::Off => TraceValue::Off,
				TraceLevel::Messages => TraceValue::Messages,
				TraceLevel::Verbose => TraceValue::Verbose,
			}),
			workspace_folders: options.workspace_folders.clone(),
			..Default::default()
		}
	}

	fn ensure_running(&self) -> Result<()> {
		let state = *self.inner.state.read();
		if state != ConnectionState::Running {
			return Err(Error::NotRunning(state));
		}
		Ok(())
	}

	/// Sends a request, draining pending sync deliveries first.
	pub async fn send_request(
		&self,
		method: impl Into<String>,
		params: JsonValue,
		cancel: CancellationToken,
	) -> Result<JsonValue> {
		self.ensure_running()?;
		self.inner.sync.flush_pending();
		self.inner
			.peer
			.request(method, params, cancel)
			.await
			.map_err(Error::from)
	}

	/// Sends a notification, draining pending sync deliveries first.
	pub fn send_notification(&self, method: impl Into<String>, params: JsonValue) -> Result<()> {
		self.ensure_running()?;
		self.inner.sync.flush_pending();
		self.inner.peer.notify(method, params).map_err(Error::from)
	}

	/// Sends a language-feature request through the middleware chain.
	pub async fn feature_request(&self, method: impl Into<String>, params: JsonValue) -> Result<JsonValue> {
		self.ensure_running()?;
		self.inner.middleware.execute(method, params).await
	}

	/// Installs a handler for a server→client request method.
	pub fn on_request(
		&self,
		method: impl Into<String>,
		handler: impl Fn(tether_rpc::AnyRequest, tether_rpc::RequestCx) -> futures::future::BoxFuture<'static, std::result::Result<JsonValue, ResponseError>>
		+ Send
		+ Sync
		+ 'static,
	) {
		self.inner.router.on_request(method, handler);
	}

	/// Installs a handler for a server→client notification method.
	pub fn on_notification(
		&self,
		method: impl Into<String>,
		handler: impl Fn(tether_rpc::AnyNotification) -> ControlFlow<()> + Send + Sync + 'static,
	) {
		self.inner.router.on_notification(method, handler);
	}

	/// Adjusts wire tracing on the dispatcher and tells the server via
	/// `$/setTrace`.
	pub fn set_trace(&self, level: TraceLevel) -> Result<()> {
		self.inner.peer.set_trace_level(level);
		let value = match level {
			TraceLevel::Off => TraceValue::Off,
			TraceLevel::Messages => TraceValue::Messages,
			TraceLevel::Verbose => TraceValue::Verbose,
		};
		let params = serde_json::to_value(SetTraceParams { value })?;
		self.inner.peer.notify("$/setTrace", params).map_err(Error::from)
	}

	/// Tells the server the host's workspace folders changed.
	pub fn did_change_workspace_folders(&self, event: lsp_types::WorkspaceFoldersChangeEvent) -> Result<()> {
		let params = serde_json::to_value(lsp_types::DidChangeWorkspaceFoldersParams { event })?;
		self.send_notification("workspace/didChangeWorkspaceFolders", params)
	}

	/// Graceful stop: `shutdown` request, then `exit` notification.
	///
	/// The shutdown roundtrip is bounded by [`SHUTDOWN_REQUEST_TIMEOUT`];
	/// a server that never answers still gets the `exit` and the caller
	/// proceeds to transport teardown.
	pub async fn shutdown_and_exit(&self) -> Result<()> {
		self.inner.sync.flush_pending();
		let request = self
			.inner
			.peer
			.request("shutdown", JsonValue::Null, CancellationToken::new());
		match tokio::time::timeout(SHUTDOWN_REQUEST_TIMEOUT, request).await {
			Ok(result) => {
				result.map_err(Error::from)?;
			}
			Err(_elapsed) => {
				warn!("client.shutdown_timeout");
			}
		}
		self.inner.peer.notify("exit", JsonValue::Null).map_err(Error::from)
	}

	/// Disposes features and live progress; the diagnostics collection is
	/// deliberately left alone so markers survive a supervised restart.
	pub fn clean_up(&self) {
		self.inner.registry.dispose_all();
		self.inner.progress.dispose();
	}

	pub fn set_state(&self, state: ConnectionState) {
		*self.inner.state.write() = state;
	}

	pub fn state(&self) -> ConnectionState {
		*self.inner.state.read()
	}

	pub fn peer(&self) -> &Peer {
		&self.inner.peer
	}

	pub fn sync(&self) -> &SyncEngine {
		&self.inner.sync
	}

	pub fn watch(&self) -> &FileWatchFeature {
		&self.inner.watch
	}

	pub fn configuration(&self) -> &ConfigurationFeature {
		&self.inner.configuration
	}

	pub fn documents(&self) -> &Arc<DocumentTracker> {
		&self.inner.documents
	}

	pub fn diagnostics(&self) -> &Arc<DiagnosticsCollection> {
		&self.inner.diagnostics
	}

	pub fn server_capabilities(&self) -> Option<ServerCapabilities> {
		self.inner.server_capabilities.read().clone()
	}
}

fn parse_params<P: serde::de::DeserializeOwned>(params: JsonValue) -> std::result::Result<P, ResponseError> {
	serde_json::from_value(params).map_err(|err| ResponseError::new(ErrorCode::INVALID_PARAMS, err.to_string()))
}

/// Success is null; any per-element failure turns into one error response
/// whose data lists the failed elements so the peer can roll back
/// individually.
fn registration_outcome(failures: Vec<JsonValue>) -> std::result::Result<JsonValue, ResponseError> {
	if failures.is_empty() {
		return Ok(JsonValue::Null);
	}
	let mut error = ResponseError::new(ErrorCode::INVALID_PARAMS, "some registrations failed");
	error.data = Some(json!({ "failures": failures }));
	Err(error)
}
