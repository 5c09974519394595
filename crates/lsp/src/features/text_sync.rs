//! Dynamic-feature wrapper over the synchronization engine.
//!
//! Registrations for the six `textDocument/did*`/`willSave*` methods all
//! land here; the engine holds the actual registration records and the
//! tracker. `didOpen` and `didClose` share one open/close registration set,
//! so unregistering either method under an id removes that coverage.

use lsp_types::{
	ClientCapabilities, DocumentSelector, ServerCapabilities,
	TextDocumentChangeRegistrationOptions, TextDocumentRegistrationOptions,
	TextDocumentSaveRegistrationOptions, TextDocumentSyncClientCapabilities,
};

use super::{DynamicFeature, selector};
use crate::capabilities::normalize_text_document_sync;
use crate::sync::SyncEngine;
use crate::{Error, JsonValue, Result};

pub struct TextDocumentSyncFeature {
	engine: SyncEngine,
}

impl TextDocumentSyncFeature {
	pub fn new(engine: SyncEngine) -> Self {
		Self { engine }
	}

	pub fn engine(&self) -> &SyncEngine {
		&self.engine
	}

	fn parse_selector(options: &JsonValue) -> Result<Option<DocumentSelector>> {
		if options.is_null() {
			return Ok(None);
		}
		let parsed: TextDocumentRegistrationOptions = serde_json::from_value(options.clone())
			.map_err(|err| Error::Protocol(format!("bad registration options: {err}")))?;
		Ok(parsed.document_selector)
	}
}

impl DynamicFeature for TextDocumentSyncFeature {
	fn methods(&self) -> Vec<&'static str> {
		vec![
			"textDocument/didOpen",
			"textDocument/didChange",
			"textDocument/willSave",
			"textDocument/willSaveWaitUntil",
			"textDocument/didSave",
			"textDocument/didClose",
		]
	}

	fn fill_client_capabilities(&self, caps: &mut ClientCapabilities) {
		caps.text_document
			.get_or_insert_with(Default::default)
			.synchronization = Some(TextDocumentSyncClientCapabilities {
			dynamic_registration: Some(true),
			will_save: Some(true),
			will_save_wait_until: Some(true),
			did_save: Some(true),
		});
	}

	fn initialize(&self, server_caps: &ServerCapabilities, selector: Option<&DocumentSelector>) {
		let options = normalize_text_document_sync(server_caps.text_document_sync.as_ref());
		self.engine.apply_server_defaults(&options, selector);
	}

	fn register(&self, method: &str, id: &str, options: JsonValue) -> Result<()> {
		match method {
			"textDocument/didOpen" | "textDocument/didClose" => {
				let selector = Self::parse_selector(&options)?;
				self.engine.register_open_close(id.to_string(), selector);
			}
			"textDocument/didChange" => {
				let parsed: TextDocumentChangeRegistrationOptions = serde_json::from_value(options)
					.map_err(|err| Error::Protocol(format!("bad didChange registration options: {err}")))?;
				self.engine
					.register_change(id.to_string(), parsed.document_selector, parsed.sync_kind);
			}
			"textDocument/willSave" => {
				let selector = Self::parse_selector(&options)?;
				self.engine.register_will_save(id.to_string(), selector);
			}
			"textDocument/willSaveWaitUntil" => {
				let selector = Self::parse_selector(&options)?;
				self.engine.register_will_save_wait_until(id.to_string(), selector);
			}
			"textDocument/didSave" => {
				let parsed: TextDocumentSaveRegistrationOptions = serde_json::from_value(options)
					.map_err(|err| Error::Protocol(format!("bad didSave registration options: {err}")))?;
				self.engine.register_save(
					id.to_string(),
					parsed.text_document_registration_options.document_selector,
					parsed.include_text.unwrap_or(false),
				);
			}
			other => return Err(Error::Protocol(format!("unknown sync method {other:?}"))),
		}
		Ok(())
	}

	fn unregister(&self, method: &str, id: &str) -> Result<()> {
		self.engine.unregister(method, id)
	}

	fn dispose(&self) {
		self.engine.dispose();
	}
}

// Selector matching is re-exported for integrations that pre-filter
// events before handing them to the engine.
pub use selector::matches_document;

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use lsp_types::{TextDocumentSyncKind, Uri};
	use serde_json::json;
	use tether_rpc::{ChannelTransport, MainLoop, Message, MessageTransport, Router};

	use super::*;
	use crate::host::NullHost;
	use crate::sync::DocumentTracker;

	fn feature() -> (TextDocumentSyncFeature, ChannelTransport) {
		let (near, far) = ChannelTransport::pair();
		let (main_loop, peer) = MainLoop::new(|_| Router::new());
		tokio::spawn(main_loop.run(near));
		let engine = SyncEngine::new(peer, DocumentTracker::new(), Arc::new(NullHost));
		(TextDocumentSyncFeature::new(engine), far)
	}

	#[tokio::test]
	async fn did_change_registration_parses_sync_kind() {
		let (feature, mut far) = feature();
		feature
			.register(
				"textDocument/didChange",
				"c1",
				json!({
					"documentSelector": [{"language": "rust"}],
					"syncKind": 2,
				}),
			)
			.unwrap();
		feature
			.register("textDocument/didOpen", "o1", json!({"documentSelector": null}))
			.unwrap();

		let engine = feature.engine();
		engine.notify_open(lsp_types::TextDocumentItem {
			uri: "file:///a.rs".parse().unwrap(),
			language_id: "rust".into(),
			version: 1,
			text: "".into(),
		});
		let _ = far.recv().await.unwrap();

		let uri: Uri = "file:///a.rs".parse().unwrap();
		engine.notify_change(
			&uri,
			2,
			vec![lsp_types::TextDocumentContentChangeEvent {
				range: Some(Default::default()),
				range_length: Some(0),
				text: "x".into(),
			}],
			"x".into(),
		);

		// syncKind 2 is incremental: the change goes out immediately with
		// its range intact.
		match far.recv().await.unwrap().unwrap() {
			Message::Notification(n) => {
				assert_eq!(n.method, "textDocument/didChange");
				assert!(n.params["contentChanges"][0].get("range").is_some());
			}
			other => panic!("expected notification, got {other:?}"),
		}
	}

	#[tokio::test]
	async fn bad_registration_options_are_rejected() {
		let (feature, _far) = feature();
		let err = feature
			.register("textDocument/didChange", "c1", json!({"syncKind": "nope"}))
			.unwrap_err();
		assert!(matches!(err, Error::Protocol(_)));
	}

	#[tokio::test]
	async fn initialize_applies_number_shorthand() {
		let (feature, mut far) = feature();
		let caps = ServerCapabilities {
			text_document_sync: Some(lsp_types::TextDocumentSyncCapability::Kind(
				TextDocumentSyncKind::FULL,
			)),
			..Default::default()
		};
		feature.initialize(&caps, None);

		feature.engine().notify_open(lsp_types::TextDocumentItem {
			uri: "file:///a.rs".parse().unwrap(),
			language_id: "rust".into(),
			version: 1,
			text: "A".into(),
		});
		match far.recv().await.unwrap().unwrap() {
			Message::Notification(n) => assert_eq!(n.method, "textDocument/didOpen"),
			other => panic!("expected didOpen, got {other:?}"),
		}
	}
}
