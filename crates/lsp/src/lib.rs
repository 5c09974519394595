//! Client-server runtime for the Language Server Protocol.
//!
//! The protocol machinery lives here: capability negotiation and the
//! feature registry, the text-document synchronization engine, the
//! file-watch aggregator, progress multiplexing, the workspace-edit
//! applier, the configuration bridge, and connection supervision. Framing
//! and request correlation come from `tether-rpc`.
//!
//! The embedding editor is an external collaborator reached through the
//! traits in [`host`]; language servers are reached through whatever byte
//! streams [`transport`] wires up. Neither side's payload grammar is
//! interpreted beyond what routing and synchronization require.

pub mod apply_edit;
pub mod capabilities;
pub mod client;
pub mod configuration;
pub mod features;
pub mod host;
pub mod progress;
pub mod providers;
pub mod server;
pub mod supervisor;
pub mod sync;
pub mod transport;
pub mod watch;

pub use lsp_types;
pub use tether_rpc as rpc;
pub use tether_rpc::JsonValue;

use lsp_types::Uri;
use tether_rpc::{RequestError, ResponseError};

pub use client::{Client, ClientOptions};
pub use supervisor::{ConnectionState, LanguageClient};
pub use sync::{DiagnosticsCollection, DocumentTracker, TrackedDocument};

/// Errors surfaced by the LSP runtime.
#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("i/o error: {0}")]
	Io(#[from] std::io::Error),
	/// The peer answered a request with an error response.
	#[error(transparent)]
	Response(ResponseError),
	#[error("connection closed")]
	ConnectionClosed,
	#[error("operation requires a running connection (state: {0:?})")]
	NotRunning(supervisor::ConnectionState),
	#[error("protocol error: {0}")]
	Protocol(String),
	#[error("serialization error: {0}")]
	Json(#[from] serde_json::Error),
}

impl Error {
	/// True for outcomes the requester must not log as failures.
	pub fn is_benign(&self) -> bool {
		matches!(self, Error::Response(e) if e.is_benign())
	}
}

impl From<RequestError> for Error {
	fn from(err: RequestError) -> Self {
		match err {
			RequestError::Response(resp) => Error::Response(resp),
			RequestError::ConnectionClosed => Error::ConnectionClosed,
		}
	}
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Builds a `file://` uri from an absolute path.
pub fn uri_from_path(path: &std::path::Path) -> Option<Uri> {
	let mut out = String::from("file://");
	for component in path.to_str()?.split('/') {
		if component.is_empty() {
			continue;
		}
		out.push('/');
		// Conservative percent-encoding: keep unreserved bytes literal.
		for byte in component.bytes() {
			match byte {
				b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
					out.push(byte as char)
				}
				_ => out.push_str(&format!("%{byte:02X}")),
			}
		}
	}
	if out == "file://" {
		out.push('/');
	}
	out.parse().ok()
}
