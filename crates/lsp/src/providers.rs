//! Language-feature provider glue.
//!
//! One [`ProviderFeature`] instance exists per language method
//! (`textDocument/completion`, `textDocument/hover`, …). It is thin on
//! purpose: a registration becomes a host provider registration with the
//! registration options passed through verbatim, and an unregistration
//! drops the host guard. Servers advertising a capability statically get a
//! synthetic registration with a generated id.
//!
//! Outgoing feature requests run through an ordered middleware chain; each
//! feature owns zero or one transformer, and the default next calls the
//! terminal handler.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use lsp_types::{
	ClientCapabilities, DocumentSelector, ServerCapabilities, TextDocumentClientCapabilities,
};
use parking_lot::Mutex;
use serde_json::json;
use tracing::debug;

use crate::features::DynamicFeature;
use crate::host::{Disposal, ProviderHost};
use crate::{Error, JsonValue, Result};

/// Language methods routed through provider features.
pub const PROVIDER_METHODS: &[&str] = &[
	"textDocument/completion",
	"textDocument/hover",
	"textDocument/signatureHelp",
	"textDocument/declaration",
	"textDocument/definition",
	"textDocument/typeDefinition",
	"textDocument/implementation",
	"textDocument/references",
	"textDocument/documentHighlight",
	"textDocument/documentSymbol",
	"textDocument/codeAction",
	"textDocument/codeLens",
	"textDocument/formatting",
	"textDocument/rangeFormatting",
	"textDocument/onTypeFormatting",
	"textDocument/rename",
	"textDocument/documentLink",
	"textDocument/documentColor",
	"textDocument/foldingRange",
	"textDocument/selectionRange",
	"textDocument/semanticTokens",
	"textDocument/prepareCallHierarchy",
	"textDocument/onTypeRename",
	"workspace/symbol",
	"workspace/executeCommand",
];

/// `ServerCapabilities` field that statically advertises `method`.
fn capability_field(method: &str) -> Option<&'static str> {
	Some(match method {
		"textDocument/completion" => "completionProvider",
		"textDocument/hover" => "hoverProvider",
		"textDocument/signatureHelp" => "signatureHelpProvider",
		"textDocument/declaration" => "declarationProvider",
		"textDocument/definition" => "definitionProvider",
		"textDocument/typeDefinition" => "typeDefinitionProvider",
		"textDocument/implementation" => "implementationProvider",
		"textDocument/references" => "referencesProvider",
		"textDocument/documentHighlight" => "documentHighlightProvider",
		"textDocument/documentSymbol" => "documentSymbolProvider",
		"textDocument/codeAction" => "codeActionProvider",
		"textDocument/codeLens" => "codeLensProvider",
		"textDocument/formatting" => "documentFormattingProvider",
		"textDocument/rangeFormatting" => "documentRangeFormattingProvider",
		"textDocument/onTypeFormatting" => "documentOnTypeFormattingProvider",
		"textDocument/rename" => "renameProvider",
		"textDocument/documentLink" => "documentLinkProvider",
		"textDocument/documentColor" => "colorProvider",
		"textDocument/foldingRange" => "foldingRangeProvider",
		"textDocument/selectionRange" => "selectionRangeProvider",
		"textDocument/semanticTokens" => "semanticTokensProvider",
		"textDocument/prepareCallHierarchy" => "callHierarchyProvider",
		"textDocument/onTypeRename" => "linkedEditingRangeProvider",
		"workspace/symbol" => "workspaceSymbolProvider",
		"workspace/executeCommand" => "executeCommandProvider",
		_ => return None,
	})
}

/// Registration options derived from a statically advertised capability:
/// `true` means options-free support, an object passes through, anything
/// else means unsupported.
fn static_registration_options(method: &str, server_caps: &JsonValue) -> Option<JsonValue> {
	let value = server_caps.get(capability_field(method)?)?;
	match value {
		JsonValue::Bool(true) => Some(json!({})),
		JsonValue::Bool(false) | JsonValue::Null => None,
		other => Some(other.clone()),
	}
}

fn text_document(caps: &mut ClientCapabilities) -> &mut TextDocumentClientCapabilities {
	caps.text_document.get_or_insert_with(Default::default)
}

fn fill_dynamic_registration(method: &str, caps: &mut ClientCapabilities) {
	match method {
		"textDocument/completion" => {
			text_document(caps).completion.get_or_insert_with(Default::default).dynamic_registration = Some(true)
		}
		"textDocument/hover" => {
			text_document(caps).hover.get_or_insert_with(Default::default).dynamic_registration = Some(true)
		}
		"textDocument/signatureHelp" => {
			text_document(caps).signature_help.get_or_insert_with(Default::default).dynamic_registration =
				Some(true)
		}
		"textDocument/declaration" => {
			text_document(caps).declaration.get_or_insert_with(Default::default).dynamic_registration = Some(true)
		}
		"textDocument/definition" => {
			text_document(caps).definition.get_or_insert_with(Default::default).dynamic_registration = Some(true)
		}
		"textDocument/typeDefinition" => {
			text_document(caps).type_definition.get_or_insert_with(Default::default).dynamic_registration =
				Some(true)
		}
		"textDocument/implementation" => {
			text_document(caps).implementation.get_or_insert_with(Default::default).dynamic_registration =
				Some(true)
		}
		"textDocument/references" => {
			text_document(caps).references.get_or_insert_with(Default::default).dynamic_registration = Some(true)
		}
		"textDocument/documentHighlight" => {
			text_document(caps).document_highlight.get_or_insert_with(Default::default).dynamic_registration =
				Some(true)
		}
		"textDocument/documentSymbol" => {
			text_document(caps).document_symbol.get_or_insert_with(Default::default).dynamic_registration =
				Some(true)
		}
		"textDocument/codeAction" => {
			text_document(caps).code_action.get_or_insert_with(Default::default).dynamic_registration = Some(true)
		}
		"textDocument/codeLens" => {
			text_document(caps).code_lens.get_or_insert_with(Default::default).dynamic_registration = Some(true)
		}
		"textDocument/formatting" => {
			text_document(caps).formatting.get_or_insert_with(Default::default).dynamic_registration = Some(true)
		}
		"textDocument/rangeFormatting" => {
			text_document(caps).range_formatting.get_or_insert_with(Default::default).dynamic_registration =
				Some(true)
		}
		"textDocument/onTypeFormatting" => {
			text_document(caps).on_type_formatting.get_or_insert_with(Default::default).dynamic_registration =
				Some(true)
		}
		"textDocument/rename" => {
			text_document(caps).rename.get_or_insert_with(Default::default).dynamic_registration = Some(true)
		}
		"textDocument/documentLink" => {
			text_document(caps)
				.document_link
				.get_or_insert_with(|| lsp_types::DocumentLinkClientCapabilities {
					dynamic_registration: None,
					tooltip_support: None,
				})
				.dynamic_registration = Some(true)
		}
		"textDocument/documentColor" => {
			text_document(caps).color_provider.get_or_insert_with(Default::default).dynamic_registration =
				Some(true)
		}
		"textDocument/foldingRange" => {
			text_document(caps).folding_range.get_or_insert_with(Default::default).dynamic_registration =
				Some(true)
		}
		"textDocument/selectionRange" => {
			text_document(caps).selection_range.get_or_insert_with(Default::default).dynamic_registration =
				Some(true)
		}
		"textDocument/semanticTokens" => {
			text_document(caps).semantic_tokens.get_or_insert_with(Default::default).dynamic_registration =
				Some(true)
		}
		"textDocument/prepareCallHierarchy" => {
			text_document(caps).call_hierarchy.get_or_insert_with(Default::default).dynamic_registration =
				Some(true)
		}
		"textDocument/onTypeRename" => {
			text_document(caps).linked_editing_range.get_or_insert_with(Default::default).dynamic_registration =
				Some(true)
		}
		"workspace/symbol" => {
			caps.workspace
				.get_or_insert_with(Default::default)
				.symbol
				.get_or_insert_with(Default::default)
				.dynamic_registration = Some(true)
		}
		"workspace/executeCommand" => {
			caps.workspace
				.get_or_insert_with(Default::default)
				.execute_command
				.get_or_insert_with(Default::default)
				.dynamic_registration = Some(true)
		}
		_ => {}
	}
}

struct ProviderInner {
	method: &'static str,
	host: Arc<dyn ProviderHost>,
	default_selector: Mutex<Option<DocumentSelector>>,
	registrations: Mutex<HashMap<String, Disposal>>,
}

/// Per-method dynamic feature turning registrations into host provider
/// registrations.
#[derive(Clone)]
pub struct ProviderFeature {
	inner: Arc<ProviderInner>,
}

impl ProviderFeature {
	pub fn new(method: &'static str, host: Arc<dyn ProviderHost>) -> Self {
		Self {
			inner: Arc::new(ProviderInner {
				method,
				host,
				default_selector: Mutex::new(None),
				registrations: Mutex::new(HashMap::new()),
			}),
		}
	}

	fn do_register(&self, id: &str, options: JsonValue) {
		let selector: Option<DocumentSelector> = options
			.get("documentSelector")
			.and_then(|value| serde_json::from_value(value.clone()).ok())
			.flatten()
			.or_else(|| self.inner.default_selector.lock().clone());

		debug!(method = self.inner.method, id, "providers.register");
		let guard = self
			.inner
			.host
			.register_provider(self.inner.method, selector.as_ref(), &options);
		self.inner.registrations.lock().insert(id.to_string(), guard);
	}

	pub fn registration_count(&self) -> usize {
		self.inner.registrations.lock().len()
	}
}

impl DynamicFeature for ProviderFeature {
	fn methods(&self) -> Vec<&'static str> {
		vec![self.inner.method]
	}

	fn fill_client_capabilities(&self, caps: &mut ClientCapabilities) {
		fill_dynamic_registration(self.inner.method, caps);
	}

	fn initialize(&self, server_caps: &ServerCapabilities, selector: Option<&DocumentSelector>) {
		*self.inner.default_selector.lock() = selector.cloned();
		let caps_json = serde_json::to_value(server_caps).unwrap_or(JsonValue::Null);
		if let Some(options) = static_registration_options(self.inner.method, &caps_json) {
			self.do_register(&uuid::Uuid::new_v4().to_string(), options);
		}
	}

	fn register(&self, _method: &str, id: &str, options: JsonValue) -> Result<()> {
		self.do_register(id, options);
		Ok(())
	}

	fn unregister(&self, _method: &str, id: &str) -> Result<()> {
		match self.inner.registrations.lock().remove(id) {
			Some(_guard) => Ok(()),
			None => Err(Error::Protocol(format!("unknown registration id {id:?}"))),
		}
	}

	fn dispose(&self) {
		self.inner.registrations.lock().clear();
	}
}

// --- middleware -----------------------------------------------------------

/// Terminal of a middleware chain: the actual peer request.
pub type TerminalHandler =
	Arc<dyn Fn(String, JsonValue) -> BoxFuture<'static, Result<JsonValue>> + Send + Sync>;

/// One transformer in the chain. Implementations may rewrite params,
/// short-circuit, or post-process the result; calling `next.run` continues
/// the chain.
pub trait Middleware: Send + Sync {
	fn handle(&self, method: String, params: JsonValue, next: Next) -> BoxFuture<'static, Result<JsonValue>>;
}

/// Continuation of a middleware chain.
pub struct Next {
	layers: Arc<Vec<Arc<dyn Middleware>>>,
	index: usize,
	terminal: TerminalHandler,
}

impl Next {
	pub fn run(self, method: String, params: JsonValue) -> BoxFuture<'static, Result<JsonValue>> {
		match self.layers.get(self.index).cloned() {
			Some(layer) => {
				let next = Next {
					layers: self.layers.clone(),
					index: self.index + 1,
					terminal: self.terminal.clone(),
				};
				layer.handle(method, params, next)
			}
			None => (self.terminal)(method, params),
		}
	}
}

/// Ordered transformer list over a terminal handler.
#[derive(Clone)]
pub struct MiddlewareChain {
	layers: Arc<Vec<Arc<dyn Middleware>>>,
	terminal: TerminalHandler,
}

impl MiddlewareChain {
	pub fn new(layers: Vec<Arc<dyn Middleware>>, terminal: TerminalHandler) -> Self {
		Self {
			layers: Arc::new(layers),
			terminal,
		}
	}

	pub fn execute(&self, method: impl Into<String>, params: JsonValue) -> BoxFuture<'static, Result<JsonValue>> {
		Next {
			layers: self.layers.clone(),
			index: 0,
			terminal: self.terminal.clone(),
		}
		.run(method.into(), params)
	}
}
