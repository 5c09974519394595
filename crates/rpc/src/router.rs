//! Method-string handler routing.
//!
//! Both endpoints register handlers at runtime (dynamic registration adds
//! and removes them mid-connection), so the router keys handlers by method
//! string behind a lock rather than by any static type identity. A request
//! whose method has no handler is answered `MethodNotFound`.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;

use crate::endpoint::{RequestCx, RpcService};
use crate::message::{AnyNotification, AnyRequest, ResponseError};
use crate::JsonValue;

pub type RequestHandler =
	Arc<dyn Fn(AnyRequest, RequestCx) -> BoxFuture<'static, Result<JsonValue, ResponseError>> + Send + Sync>;
pub type NotificationHandler = Arc<dyn Fn(AnyNotification) -> ControlFlow<()> + Send + Sync>;

#[derive(Default)]
pub struct Router {
	requests: Mutex<HashMap<String, RequestHandler>>,
	notifications: Mutex<HashMap<String, NotificationHandler>>,
}

impl Router {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	/// Installs (or replaces) the request handler for `method`.
	pub fn on_request(
		&self,
		method: impl Into<String>,
		handler: impl Fn(AnyRequest, RequestCx) -> BoxFuture<'static, Result<JsonValue, ResponseError>>
		+ Send
		+ Sync
		+ 'static,
	) {
		self.requests.lock().insert(method.into(), Arc::new(handler));
	}

	/// Installs (or replaces) the notification handler for `method`.
	pub fn on_notification(
		&self,
		method: impl Into<String>,
		handler: impl Fn(AnyNotification) -> ControlFlow<()> + Send + Sync + 'static,
	) {
		self.notifications.lock().insert(method.into(), Arc::new(handler));
	}

	pub fn remove_request(&self, method: &str) {
		self.requests.lock().remove(method);
	}

	pub fn remove_notification(&self, method: &str) {
		self.notifications.lock().remove(method);
	}

	pub fn has_request_handler(&self, method: &str) -> bool {
		self.requests.lock().contains_key(method)
	}
}

impl RpcService for Arc<Router> {
	fn handle_request(&mut self, req: AnyRequest, cx: RequestCx) -> BoxFuture<'static, Result<JsonValue, ResponseError>> {
		let handler = self.requests.lock().get(&req.method).cloned();
		match handler {
			Some(handler) => handler(req, cx),
			None => {
				let method = req.method;
				async move { Err(ResponseError::method_not_found(&method)) }.boxed()
			}
		}
	}

	fn handle_notification(&mut self, notif: AnyNotification) -> ControlFlow<()> {
		let handler = self.notifications.lock().get(&notif.method).cloned();
		match handler {
			Some(handler) => handler(notif),
			None => {
				tracing::debug!(method = %notif.method, "rpc.notification_unhandled");
				ControlFlow::Continue(())
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;
	use tokio_util::sync::CancellationToken;

	use super::*;
	use crate::endpoint::MainLoop;
	use crate::message::ErrorCode;
	use crate::transport::ChannelTransport;

	#[tokio::test]
	async fn routes_by_method_string() {
		let router = Router::new();
		router.on_request("math/double", |req, _cx| {
			async move {
				let n = req.params.as_i64().unwrap_or(0);
				Ok(json!(n * 2))
			}
			.boxed()
		});

		let (near, far) = ChannelTransport::pair();
		let (server, _peer) = MainLoop::new(move |_| router);
		tokio::spawn(server.run(near));

		let (client_loop, client) = MainLoop::new(|_| Router::new());
		tokio::spawn(client_loop.run(far));

		let result = client
			.request("math/double", json!(21), CancellationToken::new())
			.await
			.unwrap();
		assert_eq!(result, json!(42));
	}

	#[tokio::test]
	async fn missing_handler_is_method_not_found() {
		let (near, far) = ChannelTransport::pair();
		let (server, _peer) = MainLoop::new(move |_| Router::new());
		tokio::spawn(server.run(near));
		let (client_loop, client) = MainLoop::new(|_| Router::new());
		tokio::spawn(client_loop.run(far));

		let err = client
			.request("nope", JsonValue::Null, CancellationToken::new())
			.await
			.unwrap_err();
		match err {
			crate::endpoint::RequestError::Response(resp) => {
				assert_eq!(resp.code, ErrorCode::METHOD_NOT_FOUND)
			}
			other => panic!("unexpected error: {other:?}"),
		}
	}

	#[tokio::test]
	async fn removed_handler_stops_routing() {
		let router = Router::new();
		router.on_request("ephemeral", |_req, _cx| async move { Ok(json!("here")) }.boxed());
		assert!(router.has_request_handler("ephemeral"));
		router.remove_request("ephemeral");
		assert!(!router.has_request_handler("ephemeral"));
	}

	#[tokio::test]
	async fn notification_handlers_fire_and_unknown_ones_are_ignored() {
		let seen = Arc::new(Mutex::new(Vec::<String>::new()));
		let router = Router::new();
		let sink = seen.clone();
		router.on_notification("tick", move |n| {
			sink.lock().push(n.method);
			ControlFlow::Continue(())
		});

		let mut service = router.clone();
		service.handle_notification(AnyNotification::new("tick", JsonValue::Null));
		service.handle_notification(AnyNotification::new("unknown", JsonValue::Null));
		assert_eq!(*seen.lock(), vec!["tick"]);
	}
}
