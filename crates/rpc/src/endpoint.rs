//! Bidirectional message dispatcher.
//!
//! [`MainLoop`] owns one connection end: it reads frames, writes the
//! outgoing queue, correlates responses to pending requests by id, starts
//! inbound request handlers in wire order, and delivers notifications to
//! the service synchronously so wire order is preserved. Handler futures
//! are polled concurrently on the loop task; responses may therefore be
//! written out of issue order.
//!
//! Everything that mutates the pending table or the in-flight handler set
//! happens on the loop task. The [`Peer`] handle is a cheap clone that only
//! enqueues events.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::panic::AssertUnwindSafe;
use std::time::Instant;

use futures::FutureExt;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::cancel;
use crate::message::{
	AnyNotification, AnyRequest, AnyResponse, ErrorCode, Message, RequestId, ResponseError,
};
use crate::trace::{Direction, TraceLevel, Tracer};
use crate::transport::{MessageTransport, TransportError};
use crate::JsonValue;

/// Why `MainLoop::run` returned without a transport error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopOutcome {
	/// The peer closed its end of the stream.
	PeerClosed,
	/// The service (or a [`Peer::stop`] call) asked the loop to stop.
	Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum MainLoopError {
	#[error(transparent)]
	Transport(#[from] TransportError),
}

/// Failure of a single outgoing request.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
	/// The peer answered with an error response.
	#[error(transparent)]
	Response(ResponseError),
	/// The connection went away before a response arrived.
	#[error("connection closed")]
	ConnectionClosed,
}

impl RequestError {
	pub fn is_cancelled(&self) -> bool {
		matches!(self, RequestError::Response(e) if e.code == ErrorCode::REQUEST_CANCELLED)
	}
}

/// Per-request context handed to request handlers.
#[derive(Clone)]
pub struct RequestCx {
	pub id: RequestId,
	/// Trips when the peer sends `$/cancelRequest` for this id. Advisory;
	/// a handler that ignores it just runs to completion.
	pub cancel: CancellationToken,
}

/// The application half of a connection end.
pub trait RpcService: Send + 'static {
	/// Handles one inbound request. The returned future is polled on the
	/// loop task; it may suspend on peer roundtrips.
	fn handle_request(
		&mut self,
		req: AnyRequest,
		cx: RequestCx,
	) -> BoxFuture<'static, Result<JsonValue, ResponseError>>;

	/// Handles one inbound notification, delivered in wire order.
	/// `ControlFlow::Break` stops the loop (the `exit` path).
	fn handle_notification(&mut self, notif: AnyNotification) -> ControlFlow<()>;
}

enum LoopEvent {
	OutgoingRequest {
		method: String,
		params: JsonValue,
		resolver: oneshot::Sender<Result<JsonValue, ResponseError>>,
		cancel: CancellationToken,
	},
	OutgoingNotification(AnyNotification),
	CancelOutgoing(RequestId),
	SetTraceLevel(TraceLevel),
	Stop,
}

/// Cheap handle for issuing requests and notifications on a connection.
#[derive(Clone)]
pub struct Peer {
	tx: mpsc::UnboundedSender<LoopEvent>,
}

impl Peer {
	/// Sends a request and awaits its response.
	///
	/// Cancelling `cancel` before the loop writes the message keeps it off
	/// the wire entirely; cancelling afterwards publishes `$/cancelRequest`
	/// and resolves this future with `RequestCancelled`. Either way the
	/// pending entry is removed exactly once.
	pub async fn request(
		&self,
		method: impl Into<String>,
		params: JsonValue,
		cancel: CancellationToken,
	) -> Result<JsonValue, RequestError> {
		if cancel.is_cancelled() {
			return Err(RequestError::Response(ResponseError::request_cancelled()));
		}
		let (resolver, rx) = oneshot::channel();
		self.tx
			.send(LoopEvent::OutgoingRequest {
				method: method.into(),
				params,
				resolver,
				cancel,
			})
			.map_err(|_| RequestError::ConnectionClosed)?;
		match rx.await {
			Ok(Ok(value)) => Ok(value),
			Ok(Err(err)) => Err(RequestError::Response(err)),
			Err(_) => Err(RequestError::ConnectionClosed),
		}
	}

	pub fn notify(&self, method: impl Into<String>, params: JsonValue) -> Result<(), RequestError> {
		self.tx
			.send(LoopEvent::OutgoingNotification(AnyNotification::new(method, params)))
			.map_err(|_| RequestError::ConnectionClosed)
	}

	/// Adjusts how much of the wire is copied to the trace sink.
	pub fn set_trace_level(&self, level: TraceLevel) {
		let _ = self.tx.send(LoopEvent::SetTraceLevel(level));
	}

	/// Asks the loop to stop after the current batch of work.
	pub fn stop(&self) {
		let _ = self.tx.send(LoopEvent::Stop);
	}

	/// True once the loop is gone and sends can no longer succeed.
	pub fn is_closed(&self) -> bool {
		self.tx.is_closed()
	}
}

struct PendingEntry {
	resolver: oneshot::Sender<Result<JsonValue, ResponseError>>,
	started: Instant,
	/// Dropping this ends the cancellation watcher for the request.
	_watch_guard: oneshot::Sender<()>,
}

/// One connection end: dispatcher state plus the service.
pub struct MainLoop<S> {
	service: S,
	rx: mpsc::UnboundedReceiver<LoopEvent>,
	tx: mpsc::UnboundedSender<LoopEvent>,
	pending: HashMap<RequestId, PendingEntry>,
	inflight: HashMap<RequestId, CancellationToken>,
	tasks: FuturesUnordered<BoxFuture<'static, (RequestId, Result<JsonValue, ResponseError>)>>,
	tracer: Tracer,
	next_id: i64,
}

impl<S: RpcService> MainLoop<S> {
	/// Builds a loop and its peer handle. The service builder receives the
	/// peer so handlers can issue their own requests.
	pub fn new(build: impl FnOnce(Peer) -> S) -> (Self, Peer) {
		Self::with_tracer(build, Tracer::disabled())
	}

	pub fn with_tracer(build: impl FnOnce(Peer) -> S, tracer: Tracer) -> (Self, Peer) {
		let (tx, rx) = mpsc::unbounded_channel();
		let peer = Peer { tx: tx.clone() };
		let service = build(peer.clone());
		(
			Self {
				service,
				rx,
				tx,
				pending: HashMap::new(),
				inflight: HashMap::new(),
				tasks: FuturesUnordered::new(),
				tracer,
				next_id: 0,
			},
			peer,
		)
	}

	/// Runs the connection to completion.
	///
	/// On return every pending request future resolves with
	/// `ConnectionClosed` (their resolvers are dropped with the table).
	pub async fn run<T: MessageTransport>(mut self, mut transport: T) -> Result<LoopOutcome, MainLoopError> {
		enum Turn {
			Inbound(Result<Option<Message>, TransportError>),
			Event(Option<LoopEvent>),
			HandlerDone(RequestId, Result<JsonValue, ResponseError>),
		}

		loop {
			// Select arms only bind; all state mutation happens below so no
			// arm ever borrows the loop while another arm's future is live.
			let turn = tokio::select! {
				inbound = transport.recv() => Turn::Inbound(inbound),
				event = self.rx.recv() => Turn::Event(event),
				Some((id, result)) = self.tasks.next(), if !self.tasks.is_empty() => {
					Turn::HandlerDone(id, result)
				}
			};

			match turn {
				Turn::Inbound(Ok(Some(message))) => {
					if let ControlFlow::Break(()) = self.handle_incoming(message, &mut transport).await? {
						return Ok(LoopOutcome::Stopped);
					}
				}
				Turn::Inbound(Ok(None)) => return Ok(LoopOutcome::PeerClosed),
				Turn::Inbound(Err(err)) if err.is_recoverable() => {
					// -32700 territory: framing is intact, keep reading.
					tracing::warn!(error = %err, "rpc.recv_parse_error");
				}
				Turn::Inbound(Err(err)) => return Err(err.into()),
				Turn::Event(Some(event)) => {
					if let ControlFlow::Break(()) = self.handle_event(event, &mut transport).await? {
						return Ok(LoopOutcome::Stopped);
					}
				}
				// The loop holds a sender, so recv never yields None here.
				Turn::Event(None) => {}
				Turn::HandlerDone(id, result) => {
					self.inflight.remove(&id);
					let response = match result {
						Ok(value) => AnyResponse::new_ok(id, value),
						Err(err) => AnyResponse::new_err(id, err),
					};
					self.send(&mut transport, Message::Response(response)).await?;
				}
			}
		}
	}

	async fn handle_incoming<T: MessageTransport>(
		&mut self,
		message: Message,
		transport: &mut T,
	) -> Result<ControlFlow<()>, MainLoopError> {
		self.tracer.record(Direction::Receive, &message);
		match message {
			Message::Request(req) => {
				let cancel = CancellationToken::new();
				self.inflight.insert(req.id.clone(), cancel.clone());
				let cx = RequestCx {
					id: req.id.clone(),
					cancel,
				};
				let id = req.id.clone();
				let fut = self.service.handle_request(req, cx);
				self.tasks.push(
					async move {
						let result = match AssertUnwindSafe(fut).catch_unwind().await {
							Ok(result) => result,
							Err(_) => {
								tracing::error!(id = %id, "rpc.handler_panic");
								Err(ResponseError::new(ErrorCode::INTERNAL_ERROR, "request handler panicked"))
							}
						};
						(id, result)
					}
					.boxed(),
				);
			}
			Message::Notification(notif) => {
				if let Some(id) = cancel::parse_cancel(&notif) {
					if let Some(token) = self.inflight.get(&id) {
						token.cancel();
					}
					return Ok(ControlFlow::Continue(()));
				}
				return Ok(self.service.handle_notification(notif));
			}
			Message::Response(resp) => match self.pending.remove(&resp.id) {
				Some(entry) => {
					tracing::trace!(
						id = %resp.id,
						elapsed_ms = entry.started.elapsed().as_millis() as u64,
						"rpc.response"
					);
					let result = match resp.error {
						Some(err) => Err(err),
						None => Ok(resp.result.unwrap_or(JsonValue::Null)),
					};
					let _ = entry.resolver.send(result);
				}
				None => {
					// Unknown ids are logged and dropped, never fatal.
					tracing::warn!(id = %resp.id, "rpc.recv_unknown_response");
				}
			},
		}
		Ok(ControlFlow::Continue(()))
	}

	async fn handle_event<T: MessageTransport>(
		&mut self,
		event: LoopEvent,
		transport: &mut T,
	) -> Result<ControlFlow<()>, MainLoopError> {
		match event {
			LoopEvent::OutgoingRequest {
				method,
				params,
				resolver,
				cancel,
			} => {
				if cancel.is_cancelled() {
					// Cancelled while queued: never put on the wire.
					let _ = resolver.send(Err(ResponseError::request_cancelled()));
					return Ok(ControlFlow::Continue(()));
				}

				self.next_id += 1;
				let id = RequestId::Int(self.next_id);

				let (watch_guard, watch_done) = oneshot::channel::<()>();
				let watcher_id = id.clone();
				let watcher_tx = self.tx.clone();
				tokio::spawn(async move {
					tokio::select! {
						_ = cancel.cancelled() => {
							let _ = watcher_tx.send(LoopEvent::CancelOutgoing(watcher_id));
						}
						_ = watch_done => {}
					}
				});

				self.pending.insert(
					id.clone(),
					PendingEntry {
						resolver,
						started: Instant::now(),
						_watch_guard: watch_guard,
					},
				);

				let request = AnyRequest { id, method, params };
				self.send(transport, Message::Request(request)).await?;
			}
			LoopEvent::OutgoingNotification(notif) => {
				self.send(transport, Message::Notification(notif)).await?;
			}
			LoopEvent::CancelOutgoing(id) => {
				// Entry may already be gone if the response won the race; the
				// table is touched exactly once either way.
				if let Some(entry) = self.pending.remove(&id) {
					self.send(transport, Message::Notification(cancel::cancel_notification(id))).await?;
					let _ = entry.resolver.send(Err(ResponseError::request_cancelled()));
				}
			}
			LoopEvent::SetTraceLevel(level) => self.tracer.set_level(level),
			LoopEvent::Stop => return Ok(ControlFlow::Break(())),
		}
		Ok(ControlFlow::Continue(()))
	}

	async fn send<T: MessageTransport>(&mut self, transport: &mut T, message: Message) -> Result<(), MainLoopError> {
		self.tracer.record(Direction::Send, &message);
		match transport.send(message).await {
			Ok(()) => Ok(()),
			Err(TransportError::Serialize(err)) => {
				// A failed send does not tear down the connection.
				tracing::error!(error = %err, "rpc.send_serialize_failed");
				Ok(())
			}
			Err(err) => Err(err.into()),
		}
	}
}
