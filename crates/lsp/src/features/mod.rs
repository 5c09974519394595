//! Feature registry and capability negotiation.
//!
//! A feature owns one slice of the protocol surface. Static features fill
//! client capabilities and initialize once; dynamic features additionally
//! accept per-id registrations at runtime, routed here by method string.
//! The registry never switches on feature types, only on the method names
//! each feature claims.

pub mod selector;
pub mod text_sync;

use std::collections::HashMap;
use std::sync::Arc;

use lsp_types::{
	ClientCapabilities, DocumentSelector, InitializeParams, Registration, ServerCapabilities,
	Unregistration,
};
use parking_lot::RwLock;
use tracing::debug;

use crate::{Error, JsonValue, Result};

/// Feature with a fixed capability contribution and no runtime
/// registrations.
pub trait StaticFeature: Send + Sync {
	fn fill_initialize_params(&self, _params: &mut InitializeParams) {}
	fn fill_client_capabilities(&self, caps: &mut ClientCapabilities);
	fn initialize(&self, server_caps: &ServerCapabilities);
	fn dispose(&self) {}
}

/// Feature whose handler set is the union of its current registrations.
pub trait DynamicFeature: Send + Sync {
	/// Method names this feature accepts registrations for.
	fn methods(&self) -> Vec<&'static str>;

	fn fill_client_capabilities(&self, caps: &mut ClientCapabilities);

	/// Called once with the negotiated server capabilities. Features whose
	/// capability the server advertises statically register themselves here
	/// under freshly generated ids.
	fn initialize(&self, server_caps: &ServerCapabilities, selector: Option<&DocumentSelector>);

	fn register(&self, method: &str, id: &str, options: JsonValue) -> Result<()>;

	/// Idempotent by id; unknown ids error without touching other state.
	fn unregister(&self, method: &str, id: &str) -> Result<()>;

	fn dispose(&self) {}
}

/// Baseline workspace capabilities with no registration surface:
/// `workspace/applyEdit` handling and workspace-folder awareness.
pub struct WorkspaceBaseFeature;

impl StaticFeature for WorkspaceBaseFeature {
	fn fill_client_capabilities(&self, caps: &mut ClientCapabilities) {
		let workspace = caps.workspace.get_or_insert_with(Default::default);
		workspace.apply_edit = Some(true);
		workspace.workspace_folders = Some(true);
	}

	fn initialize(&self, _server_caps: &ServerCapabilities) {}
}

/// Ordered feature list plus the method → feature routing map.
#[derive(Default)]
pub struct FeatureRegistry {
	statics: Vec<Box<dyn StaticFeature>>,
	dynamics: Vec<Arc<dyn DynamicFeature>>,
	by_method: RwLock<HashMap<String, Arc<dyn DynamicFeature>>>,
}

impl FeatureRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn add_static(&mut self, feature: impl StaticFeature + 'static) {
		self.statics.push(Box::new(feature));
	}

	pub fn add_dynamic(&mut self, feature: Arc<dyn DynamicFeature>) {
		let mut by_method = self.by_method.write();
		for method in feature.methods() {
			by_method.insert(method.to_string(), feature.clone());
		}
		drop(by_method);
		self.dynamics.push(feature);
	}

	/// Lets every feature populate its reserved capability sub-paths.
	pub fn fill_client_capabilities(&self) -> ClientCapabilities {
		let mut caps = ClientCapabilities::default();
		for feature in &self.statics {
			feature.fill_client_capabilities(&mut caps);
		}
		for feature in &self.dynamics {
			feature.fill_client_capabilities(&mut caps);
		}
		caps
	}

	pub fn fill_initialize_params(&self, params: &mut InitializeParams) {
		for feature in &self.statics {
			feature.fill_initialize_params(params);
		}
	}

	/// Initializes all features against the negotiated capabilities, in
	/// registration order.
	pub fn initialize_all(&self, server_caps: &ServerCapabilities, selector: Option<&DocumentSelector>) {
		for feature in &self.statics {
			feature.initialize(server_caps);
		}
		for feature in &self.dynamics {
			feature.initialize(server_caps, selector);
		}
	}

	/// Routes one registration element to its feature.
	pub fn register_capability(&self, registration: &Registration) -> Result<()> {
		let feature = self
			.by_method
			.read()
			.get(&registration.method)
			.cloned()
			.ok_or_else(|| {
				Error::Protocol(format!("no feature accepts registrations for {:?}", registration.method))
			})?;
		debug!(method = %registration.method, id = %registration.id, "features.register");
		feature.register(
			&registration.method,
			&registration.id,
			registration.register_options.clone().unwrap_or(JsonValue::Null),
		)
	}

	/// Routes one unregistration element to its feature.
	pub fn unregister_capability(&self, unregistration: &Unregistration) -> Result<()> {
		let feature = self
			.by_method
			.read()
			.get(&unregistration.method)
			.cloned()
			.ok_or_else(|| {
				Error::Protocol(format!(
					"no feature accepts registrations for {:?}",
					unregistration.method
				))
			})?;
		debug!(method = %unregistration.method, id = %unregistration.id, "features.unregister");
		feature.unregister(&unregistration.method, &unregistration.id)
	}

	pub fn dispose_all(&self) {
		for feature in &self.dynamics {
			feature.dispose();
		}
		for feature in &self.statics {
			feature.dispose();
		}
	}
}
