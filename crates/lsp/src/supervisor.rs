//! Connection supervision.
//!
//! [`LanguageClient`] drives one supervised connection through
//! `Initial → Starting → Running → Stopping → Stopped`; a supervised
//! restart goes back to `Initial` and starts again. The error handler
//! decides whether transport errors shut the connection down, and the
//! close handler implements restart-storm detection: five closes inside
//! three minutes stop the restarts and surface one user-visible failure.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lsp_types::MessageType;
use parking_lot::{Mutex, RwLock};
use tether_rpc::{LoopOutcome, MainLoop, MainLoopError, MessageTransport, Router, TraceLevel};
use tracing::{debug, error, warn};

use crate::client::{Client, ClientOptions, ClientServices};
use crate::sync::DiagnosticsCollection;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
	Initial,
	Starting,
	StartFailed,
	Running,
	Stopping,
	Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
	/// Keep the connection.
	Continue,
	/// Give up on the connection.
	Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseAction {
	DoNotRestart,
	Restart,
}

/// Policy consulted when the connection errors or closes.
pub trait ErrorHandler: Send + Sync {
	fn error(&self, error: &Error, message: Option<&str>, count: u32) -> ErrorAction;
	fn closed(&self) -> CloseAction;
}

/// Closes tolerated before storm detection kicks in.
const MAX_RESTART_COUNT: usize = 4;
/// Window in which [`MAX_RESTART_COUNT`] + 1 closes count as a storm.
const RESTART_WINDOW: Duration = Duration::from_secs(3 * 60);
/// Errors tolerated before the default handler gives up.
const MAX_ERROR_COUNT: u32 = 3;

/// Default policy: tolerate a few errors, restart on close unless closes
/// storm.
#[derive(Default)]
pub struct DefaultErrorHandler {
	closes: Mutex<Vec<Instant>>,
}

impl DefaultErrorHandler {
	pub fn new() -> Self {
		Self::default()
	}

	fn closed_at(&self, now: Instant) -> CloseAction {
		let mut closes = self.closes.lock();
		closes.push(now);
		if closes.len() <= MAX_RESTART_COUNT {
			return CloseAction::Restart;
		}
		let first = closes[0];
		if now.duration_since(first) <= RESTART_WINDOW {
			return CloseAction::DoNotRestart;
		}
		// Forget the oldest and keep going.
		closes.remove(0);
		CloseAction::Restart
	}
}

impl ErrorHandler for DefaultErrorHandler {
	fn error(&self, _error: &Error, _message: Option<&str>, count: u32) -> ErrorAction {
		if count <= MAX_ERROR_COUNT {
			ErrorAction::Continue
		} else {
			ErrorAction::Shutdown
		}
	}

	fn closed(&self) -> CloseAction {
		self.closed_at(Instant::now())
	}
}

/// Produces the byte-stream (or message-port) transport for one connection
/// attempt. Spawning server processes is the factory's business; the
/// runtime only sees the transport.
#[async_trait]
pub trait StreamFactory: Send + Sync {
	async fn connect(&self) -> Result<Box<dyn MessageTransport + Send>>;
}

struct SupervisorInner {
	factory: Arc<dyn StreamFactory>,
	services: ClientServices,
	options: ClientOptions,
	error_handler: Arc<dyn ErrorHandler>,
	/// Survives restarts so existing markers stay visible.
	diagnostics: Arc<DiagnosticsCollection>,
	state: Arc<RwLock<ConnectionState>>,
	active: Mutex<Option<Client>>,
	error_count: AtomicU32,
}

/// Supervised client connection.
#[derive(Clone)]
pub struct LanguageClient {
	inner: Arc<SupervisorInner>,
}

impl LanguageClient {
	pub fn new(factory: Arc<dyn StreamFactory>, services: ClientServices, options: ClientOptions) -> Self {
		Self::with_error_handler(factory, services, options, Arc::new(DefaultErrorHandler::new()))
	}

	pub fn with_error_handler(
		factory: Arc<dyn StreamFactory>,
		services: ClientServices,
		options: ClientOptions,
		error_handler: Arc<dyn ErrorHandler>,
	) -> Self {
		Self {
			inner: Arc::new(SupervisorInner {
				factory,
				services,
				options,
				error_handler,
				diagnostics: DiagnosticsCollection::new(),
				state: Arc::new(RwLock::new(ConnectionState::Initial)),
				active: Mutex::new(None),
				error_count: AtomicU32::new(0),
			}),
		}
	}

	pub fn state(&self) -> ConnectionState {
		*self.inner.state.read()
	}

	/// The active client, while one exists.
	pub fn client(&self) -> Option<Client> {
		self.inner.active.lock().clone()
	}

	pub fn diagnostics(&self) -> &Arc<DiagnosticsCollection> {
		&self.inner.diagnostics
	}

	fn set_state(&self, state: ConnectionState) {
		debug!(?state, "supervisor.state");
		*self.inner.state.write() = state;
	}

	/// Starts (or restarts) the connection and runs the initialize
	/// handshake.
	pub async fn start(&self) -> Result<()> {
		{
			let mut state = self.inner.state.write();
			match *state {
				ConnectionState::Initial | ConnectionState::Stopped | ConnectionState::StartFailed => {
					*state = ConnectionState::Starting;
				}
				other => {
					return Err(Error::Protocol(format!("cannot start a connection in state {other:?}")));
				}
			}
		}

		let transport = match self.inner.factory.connect().await {
			Ok(transport) => transport,
			Err(err) => {
				self.set_state(ConnectionState::StartFailed);
				return Err(err);
			}
		};

		let router = Router::new();
		let service = router.clone();
		let (main_loop, peer) = MainLoop::new(move |_| service);
		let client = Client::new(
			peer.clone(),
			router,
			self.inner.services.clone(),
			self.inner.options.clone(),
			self.inner.diagnostics.clone(),
			self.inner.state.clone(),
		);
		let loop_task = tokio::spawn(main_loop.run(transport));
		*self.inner.active.lock() = Some(client.clone());

		if let Err(err) = client.initialize().await {
			self.set_state(ConnectionState::StartFailed);
			peer.stop();
			self.inner.active.lock().take();
			return Err(err);
		}

		self.set_state(ConnectionState::Running);
		if self.inner.options.trace != TraceLevel::Off {
			peer.set_trace_level(self.inner.options.trace);
		}
		self.inner.error_count.store(0, Ordering::SeqCst);
		self.spawn_monitor(loop_task);
		Ok(())
	}

	/// Graceful stop: `shutdown`, `exit`, then teardown.
	///
	/// The shutdown roundtrip is bounded (see
	/// [`crate::client::SHUTDOWN_REQUEST_TIMEOUT`]); a hung server cannot
	/// stall the teardown.
	pub async fn stop(&self) -> Result<()> {
		self.set_state(ConnectionState::Stopping);
		let client = self.inner.active.lock().take();
		if let Some(client) = client {
			if let Err(err) = client.shutdown_and_exit().await {
				if !err.is_benign() {
					warn!(error = %err, "supervisor.shutdown_failed");
				}
			}
			client.clean_up();
			client.peer().stop();
		}
		self.set_state(ConnectionState::Stopped);
		Ok(())
	}

	fn spawn_monitor(&self, loop_task: tokio::task::JoinHandle<std::result::Result<LoopOutcome, MainLoopError>>) {
		let this = self.clone();
		tokio::spawn(async move {
			let result = loop_task.await;
			this.on_connection_end(result).await;
		});
	}

	async fn on_connection_end(
		&self,
		result: std::result::Result<std::result::Result<LoopOutcome, MainLoopError>, tokio::task::JoinError>,
	) {
		let state = self.state();
		if state == ConnectionState::Stopping || state == ConnectionState::Stopped {
			// Deliberate teardown; stop() owns the cleanup.
			self.set_state(ConnectionState::Stopped);
			return;
		}

		match result {
			Ok(Ok(outcome)) => debug!(?outcome, "supervisor.connection_ended"),
			Ok(Err(loop_err)) => {
				let count = self.inner.error_count.fetch_add(1, Ordering::SeqCst) + 1;
				let err = Error::Protocol(loop_err.to_string());
				let action = self.inner.error_handler.error(&err, None, count);
				warn!(error = %err, count, ?action, "supervisor.connection_error");
				if action == ErrorAction::Shutdown {
					self.give_up("the language server connection errored and will not be restarted");
					return;
				}
			}
			Err(join_err) => {
				error!(error = %join_err, "supervisor.loop_task_failed");
			}
		}

		match self.inner.error_handler.closed() {
			CloseAction::Restart => {
				self.clean_up_active();
				self.set_state(ConnectionState::Initial);
				if let Err(err) = self.start().await {
					error!(error = %err, "supervisor.restart_failed");
					self.inner
						.services
						.host
						.show_message(MessageType::ERROR, format!("restarting the language server failed: {err}"));
				}
			}
			CloseAction::DoNotRestart => {
				self.give_up("the language server crashed repeatedly and will not be restarted");
			}
		}
	}

	/// Cleanup that preserves the diagnostics collection: listeners and
	/// providers go, markers stay.
	fn clean_up_active(&self) {
		if let Some(client) = self.inner.active.lock().take() {
			client.clean_up();
		}
	}

	fn give_up(&self, message: &str) {
		self.clean_up_active();
		self.set_state(ConnectionState::Stopped);
		self.inner
			.services
			.host
			.show_message(MessageType::ERROR, message.to_string());
	}
}

#[cfg(test)]
mod tests;
