//! Server endpoint.
//!
//! Mirrors the client side of the handshake: `initialize` reads the
//! client's capabilities and answers with composed server capabilities,
//! requests before that are rejected, `shutdown` stops new work while
//! in-flight requests drain, and `exit` ends the loop. The serve future
//! resolves to the process exit code: 0 after an orderly
//! `shutdown` + `exit`, 1 when the connection dies any other way.

use std::future::Future;
use std::ops::ControlFlow;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use lsp_types::{ClientCapabilities, InitializeParams, InitializeResult, ServerCapabilities, ServerInfo, SetTraceParams, TraceValue};
use parking_lot::RwLock;
use tether_rpc::{
	AnyNotification, AnyRequest, ErrorCode, MainLoop, Peer, RequestCx, ResponseError, Router,
	RpcService, TraceLevel, Tracer,
};
use tracing::{debug, warn};

use crate::transport::MessageTransport;
use crate::{Error, JsonValue, Result};

/// LSP-reserved code for requests that arrive before `initialize`.
const SERVER_NOT_INITIALIZED: i64 = -32002;

type CapabilityComposer = Arc<dyn Fn(&ClientCapabilities) -> ServerCapabilities + Send + Sync>;

#[derive(Default)]
struct ServerState {
	initialize_received: bool,
	initialized: bool,
	shutdown_received: bool,
	client_capabilities: Option<ClientCapabilities>,
}

/// Server endpoint builder; handlers go on the router, capabilities come
/// from the composer.
pub struct Server {
	router: Arc<Router>,
	compose: CapabilityComposer,
	server_info: Option<ServerInfo>,
	tracer: Tracer,
	state: Arc<RwLock<ServerState>>,
}

impl Server {
	pub fn new(compose: impl Fn(&ClientCapabilities) -> ServerCapabilities + Send + Sync + 'static) -> Self {
		Self {
			router: Router::new(),
			compose: Arc::new(compose),
			server_info: None,
			tracer: Tracer::disabled(),
			state: Arc::new(RwLock::new(ServerState::default())),
		}
	}

	pub fn with_server_info(mut self, info: ServerInfo) -> Self {
		self.server_info = Some(info);
		self
	}

	pub fn with_tracer(mut self, tracer: Tracer) -> Self {
		self.tracer = tracer;
		self
	}

	pub fn on_request(
		&self,
		method: impl Into<String>,
		handler: impl Fn(AnyRequest, RequestCx) -> BoxFuture<'static, std::result::Result<JsonValue, ResponseError>>
		+ Send
		+ Sync
		+ 'static,
	) {
		self.router.on_request(method, handler);
	}

	pub fn on_notification(
		&self,
		method: impl Into<String>,
		handler: impl Fn(AnyNotification) -> ControlFlow<()> + Send + Sync + 'static,
	) {
		self.router.on_notification(method, handler);
	}

	/// The capabilities the client sent in `initialize`, once received.
	pub fn client_capabilities(&self) -> Option<ClientCapabilities> {
		self.state.read().client_capabilities.clone()
	}

	/// Binds the server onto a transport. Returns the peer handle (for
	/// server→client traffic such as dynamic registration, diagnostics, and
	/// progress) and the serve future resolving to the exit code.
	pub fn start<T: MessageTransport + 'static>(
		self,
		transport: T,
	) -> (Peer, impl Future<Output = Result<i32>> + Send) {
		let state = self.state.clone();
		let tracer = self.tracer.clone();
		let (main_loop, peer) = MainLoop::with_tracer(
			{
				let state = state.clone();
				let router = self.router.clone();
				let compose = self.compose.clone();
				let server_info = self.server_info.clone();
				move |peer| ServerService {
					router,
					state,
					compose,
					server_info,
					peer,
				}
			},
			tracer,
		);

		let serve = async move {
			let outcome = main_loop.run(transport).await.map_err(|err| Error::Protocol(err.to_string()))?;
			let shutdown_received = state.read().shutdown_received;
			let code = match outcome {
				tether_rpc::LoopOutcome::Stopped if shutdown_received => 0,
				_ => 1,
			};
			debug!(?outcome, shutdown_received, code, "server.exited");
			Ok(code)
		};
		(peer, serve)
	}
}

struct ServerService {
	router: Arc<Router>,
	state: Arc<RwLock<ServerState>>,
	compose: CapabilityComposer,
	server_info: Option<ServerInfo>,
	peer: Peer,
}

impl ServerService {
	fn handle_initialize(&self, req: AnyRequest) -> std::result::Result<JsonValue, ResponseError> {
		{
			let state = self.state.read();
			if state.initialize_received {
				return Err(ResponseError::new(
					ErrorCode::INVALID_REQUEST,
					"initialize may only be sent once",
				));
			}
		}
		let params: InitializeParams = serde_json::from_value(req.params)
			.map_err(|err| ResponseError::new(ErrorCode::INVALID_PARAMS, err.to_string()))?;

		let capabilities = (self.compose)(&params.capabilities);
		{
			let mut state = self.state.write();
			state.initialize_received = true;
			state.client_capabilities = Some(params.capabilities);
		}
		let result = InitializeResult {
			capabilities,
			server_info: self.server_info.clone(),
		};
		serde_json::to_value(result).map_err(|err| ResponseError::new(ErrorCode::INTERNAL_ERROR, err.to_string()))
	}
}

impl RpcService for ServerService {
	fn handle_request(&mut self, req: AnyRequest, cx: RequestCx) -> BoxFuture<'static, std::result::Result<JsonValue, ResponseError>> {
		if req.method == "initialize" {
			let result = self.handle_initialize(req);
			return async move { result }.boxed();
		}

		{
			let state = self.state.read();
			if !state.initialize_received {
				let err = ResponseError::new(SERVER_NOT_INITIALIZED, "server not initialized");
				return async move { Err(err) }.boxed();
			}
			// After shutdown no new work starts; in-flight handlers finish.
			if state.shutdown_received {
				let err = ResponseError::new(ErrorCode::INVALID_REQUEST, "server is shutting down");
				return async move { Err(err) }.boxed();
			}
		}

		if req.method == "shutdown" {
			self.state.write().shutdown_received = true;
			debug!("server.shutdown");
			return async move { Ok(JsonValue::Null) }.boxed();
		}

		self.router.handle_request(req, cx)
	}

	fn handle_notification(&mut self, notif: AnyNotification) -> ControlFlow<()> {
		match notif.method.as_str() {
			"exit" => return ControlFlow::Break(()),
			"initialized" => {
				self.state.write().initialized = true;
				debug!("server.client_initialized");
			}
			"$/setTrace" => match serde_json::from_value::<SetTraceParams>(notif.params) {
				Ok(params) => {
					let level = match params.value {
						TraceValue::Off => TraceLevel::Off,
						TraceValue::Messages => TraceLevel::Messages,
						TraceValue::Verbose => TraceLevel::Verbose,
					};
					self.peer.set_trace_level(level);
				}
				Err(err) => warn!(error = %err, "server.bad_set_trace"),
			},
			_ => {
				if !self.state.read().initialize_received {
					debug!(method = %notif.method, "server.notification_before_initialize");
					return ControlFlow::Continue(());
				}
				return self.router.clone().handle_notification(notif);
			}
		}
		ControlFlow::Continue(())
	}
}
