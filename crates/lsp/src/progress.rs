//! Server-initiated progress multiplexing.
//!
//! The server allocates a token via `window/workDoneProgress/create`, then
//! streams `$/progress` begin/report/end values for it. Each known token
//! maps to one host progress object; cancelling that object round-trips as
//! `window/workDoneProgress/cancel`. Progress for tokens that were never
//! created is ignored.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use lsp_types::{
	NumberOrString, ProgressParams, ProgressParamsValue, WorkDoneProgress,
	WorkDoneProgressCancelParams, WorkDoneProgressCreateParams,
};
use parking_lot::Mutex;
use tether_rpc::Peer;
use tracing::debug;

use crate::host::{ProgressHandle, ProgressView};

fn token_key(token: &NumberOrString) -> String {
	match token {
		NumberOrString::Number(n) => format!("#{n}"),
		NumberOrString::String(s) => s.clone(),
	}
}

struct ProgressInner {
	peer: Peer,
	view: Arc<dyn ProgressView>,
	created: Mutex<HashSet<String>>,
	active: Mutex<HashMap<String, Box<dyn ProgressHandle>>>,
}

#[derive(Clone)]
pub struct ProgressRouter {
	inner: Arc<ProgressInner>,
}

impl ProgressRouter {
	pub fn new(peer: Peer, view: Arc<dyn ProgressView>) -> Self {
		Self {
			inner: Arc::new(ProgressInner {
				peer,
				view,
				created: Mutex::new(HashSet::new()),
				active: Mutex::new(HashMap::new()),
			}),
		}
	}

	/// `window/workDoneProgress/create`: the token becomes known; the UI
	/// object appears on the first `begin`.
	pub fn handle_create(&self, params: WorkDoneProgressCreateParams) {
		self.inner.created.lock().insert(token_key(&params.token));
	}

	/// `$/progress` value routing.
	pub fn handle_progress(&self, params: ProgressParams) {
		let key = token_key(&params.token);
		let ProgressParamsValue::WorkDone(value) = params.value;
		match value {
			WorkDoneProgress::Begin(begin) => {
				if !self.inner.created.lock().contains(&key) {
					debug!(token = %key, "progress.unknown_token");
					return;
				}
				let peer = self.inner.peer.clone();
				let token = params.token.clone();
				let on_cancel = Box::new(move || {
					let cancel = WorkDoneProgressCancelParams { token: token.clone() };
					if let Ok(value) = serde_json::to_value(&cancel) {
						let _ = peer.notify("window/workDoneProgress/cancel", value);
					}
				});
				let handle = self.inner.view.begin(begin, on_cancel);
				self.inner.active.lock().insert(key, handle);
			}
			WorkDoneProgress::Report(report) => {
				if let Some(handle) = self.inner.active.lock().get_mut(&key) {
					handle.report(report);
				}
			}
			WorkDoneProgress::End(end) => {
				if let Some(mut handle) = self.inner.active.lock().remove(&key) {
					handle.end(end);
					self.inner.created.lock().remove(&key);
				}
			}
		}
	}

	/// Drops every live progress object, e.g. on connection teardown.
	pub fn dispose(&self) {
		self.inner.active.lock().clear();
		self.inner.created.lock().clear();
	}
}
