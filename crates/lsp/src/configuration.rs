//! Configuration bridge.
//!
//! Push: when the host's configuration changes, every registration whose
//! sections are affected gets a `workspace/didChangeConfiguration` built by
//! reading those sections from the host store. Pull: the server's
//! `workspace/configuration` request is answered positionally, one value
//! per requested item.

use std::sync::Arc;

use lsp_types::{
	ClientCapabilities, ConfigurationParams, DidChangeConfigurationClientCapabilities,
	DidChangeConfigurationParams, DocumentSelector, ServerCapabilities,
};
use parking_lot::Mutex;
use serde::Deserialize;
use tether_rpc::Peer;
use tracing::warn;

use crate::features::DynamicFeature;
use crate::host::Host;
use crate::{Error, JsonValue, Result};

#[derive(Debug, Clone)]
struct ConfigRegistration {
	id: String,
	/// Empty means the whole configuration.
	sections: Vec<String>,
}

/// Registration options: `{ section?: string | string[] }`.
#[derive(Debug, Default, Deserialize)]
struct ConfigRegistrationOptions {
	#[serde(default)]
	section: SectionSpec,
}

#[derive(Debug, Default, Deserialize)]
#[serde(untagged)]
enum SectionSpec {
	#[default]
	All,
	One(String),
	Many(Vec<String>),
}

impl SectionSpec {
	fn into_sections(self) -> Vec<String> {
		match self {
			SectionSpec::All => Vec::new(),
			SectionSpec::One(section) => vec![section],
			SectionSpec::Many(sections) => sections,
		}
	}
}

struct ConfigInner {
	peer: Peer,
	host: Arc<dyn Host>,
	initial_sections: Vec<String>,
	registrations: Mutex<Vec<ConfigRegistration>>,
}

#[derive(Clone)]
pub struct ConfigurationFeature {
	inner: Arc<ConfigInner>,
}

/// True when a registered section is touched by any changed section.
/// Prefix relationship in either direction counts: changing `editor`
/// affects `editor.fontSize` registrations and vice versa.
fn section_affected(registered: &str, changed: &str) -> bool {
	registered == changed
		|| registered.starts_with(&format!("{changed}."))
		|| changed.starts_with(&format!("{registered}."))
}

impl ConfigurationFeature {
	pub fn new(peer: Peer, host: Arc<dyn Host>, initial_sections: Vec<String>) -> Self {
		Self {
			inner: Arc::new(ConfigInner {
				peer,
				host,
				initial_sections,
				registrations: Mutex::new(Vec::new()),
			}),
		}
	}

	/// Host configuration changed. `changed` names the touched sections;
	/// `None` means everything may have changed.
	pub fn did_change_configuration(&self, changed: Option<&[String]>) {
		let affected: Vec<ConfigRegistration> = {
			let registrations = self.inner.registrations.lock();
			registrations
				.iter()
				.filter(|reg| match changed {
					None => true,
					Some(changed) => {
						reg.sections.is_empty()
							|| reg
								.sections
								.iter()
								.any(|s| changed.iter().any(|c| section_affected(s, c)))
					}
				})
				.cloned()
				.collect()
		};

		for registration in affected {
			let settings = self.build_settings(&registration.sections);
			let params = DidChangeConfigurationParams { settings };
			match serde_json::to_value(&params) {
				Ok(value) => {
					let _ = self.inner.peer.notify("workspace/didChangeConfiguration", value);
				}
				Err(err) => warn!(error = %err, "configuration.serialize_failed"),
			}
		}
	}

	fn build_settings(&self, sections: &[String]) -> JsonValue {
		match sections {
			[] => self.inner.host.configuration_value(None, None),
			[section] => self.inner.host.configuration_value(Some(section), None),
			many => {
				let mut object = serde_json::Map::new();
				for section in many {
					object.insert(
						section.clone(),
						self.inner.host.configuration_value(Some(section), None),
					);
				}
				JsonValue::Object(object)
			}
		}
	}

	/// Answers `workspace/configuration`: one value per item, aligned
	/// positionally.
	pub fn pull(&self, params: ConfigurationParams) -> Vec<JsonValue> {
		params
			.items
			.iter()
			.map(|item| {
				self.inner
					.host
					.configuration_value(item.section.as_deref(), item.scope_uri.as_ref())
			})
			.collect()
	}
}

impl DynamicFeature for ConfigurationFeature {
	fn methods(&self) -> Vec<&'static str> {
		vec!["workspace/didChangeConfiguration"]
	}

	fn fill_client_capabilities(&self, caps: &mut ClientCapabilities) {
		let workspace = caps.workspace.get_or_insert_with(Default::default);
		workspace.did_change_configuration = Some(DidChangeConfigurationClientCapabilities {
			dynamic_registration: Some(true),
		});
		workspace.configuration = Some(true);
	}

	fn initialize(&self, _server_caps: &ServerCapabilities, _selector: Option<&DocumentSelector>) {
		// The configured sections become the initial registration.
		self.inner.registrations.lock().push(ConfigRegistration {
			id: uuid::Uuid::new_v4().to_string(),
			sections: self.inner.initial_sections.clone(),
		});
	}

	fn register(&self, _method: &str, id: &str, options: JsonValue) -> Result<()> {
		let options: ConfigRegistrationOptions = if options.is_null() {
			ConfigRegistrationOptions::default()
		} else {
			serde_json::from_value(options)
				.map_err(|err| Error::Protocol(format!("bad configuration registration options: {err}")))?
		};
		self.inner.registrations.lock().push(ConfigRegistration {
			id: id.to_string(),
			sections: options.section.into_sections(),
		});
		Ok(())
	}

	fn unregister(&self, _method: &str, id: &str) -> Result<()> {
		let mut registrations = self.inner.registrations.lock();
		let before = registrations.len();
		registrations.retain(|reg| reg.id != id);
		if registrations.len() == before {
			return Err(Error::Protocol(format!("unknown registration id {id:?}")));
		}
		Ok(())
	}

	fn dispose(&self) {
		self.inner.registrations.lock().clear();
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;

	use async_trait::async_trait;
	use lsp_types::{ConfigurationItem, Uri};
	use serde_json::json;
	use tether_rpc::{ChannelTransport, MainLoop, Message, MessageTransport, Router};

	use super::*;

	#[derive(Default)]
	struct StoreHost {
		values: Mutex<HashMap<String, JsonValue>>,
	}

	#[async_trait]
	impl Host for StoreHost {
		fn configuration_value(&self, section: Option<&str>, scope_uri: Option<&Uri>) -> JsonValue {
			let key = match (section, scope_uri) {
				(Some(section), Some(scope)) => format!("{}::{section}", scope.as_str()),
				(Some(section), None) => section.to_string(),
				(None, _) => "*".to_string(),
			};
			self.values.lock().get(&key).cloned().unwrap_or(JsonValue::Null)
		}
	}

	struct Rig {
		feature: ConfigurationFeature,
		host: Arc<StoreHost>,
		far: ChannelTransport,
		peer: tether_rpc::Peer,
	}

	fn rig(initial_sections: Vec<String>) -> Rig {
		let (near, far) = ChannelTransport::pair();
		let (main_loop, peer) = MainLoop::new(|_| Router::new());
		tokio::spawn(main_loop.run(near));
		let host = Arc::new(StoreHost::default());
		let feature = ConfigurationFeature::new(peer.clone(), host.clone(), initial_sections);
		Rig { feature, host, far, peer }
	}

	async fn next_settings(far: &mut ChannelTransport) -> JsonValue {
		match far.recv().await.unwrap().unwrap() {
			Message::Notification(n) => {
				assert_eq!(n.method, "workspace/didChangeConfiguration");
				n.params["settings"].clone()
			}
			other => panic!("expected notification, got {other:?}"),
		}
	}

	#[tokio::test]
	async fn push_reads_registered_section_from_the_store() {
		let mut r = rig(Vec::new());
		r.host.values.lock().insert("lint".into(), json!({"enabled": true}));
		r.feature
			.register("workspace/didChangeConfiguration", "c1", json!({"section": "lint"}))
			.unwrap();

		r.feature.did_change_configuration(Some(&["lint".to_string()]));
		assert_eq!(next_settings(&mut r.far).await, json!({"enabled": true}));
	}

	#[tokio::test]
	async fn push_skips_unaffected_registrations() {
		let mut r = rig(Vec::new());
		r.feature
			.register("workspace/didChangeConfiguration", "c1", json!({"section": "lint"}))
			.unwrap();
		r.feature
			.register("workspace/didChangeConfiguration", "c2", json!({"section": "format"}))
			.unwrap();
		r.host.values.lock().insert("format".into(), json!("tabs"));

		r.feature.did_change_configuration(Some(&["format".to_string()]));
		assert_eq!(next_settings(&mut r.far).await, json!("tabs"));

		// Exactly one notification went out: the probe is next on the wire.
		r.peer.notify("probe", JsonValue::Null).unwrap();
		match r.far.recv().await.unwrap().unwrap() {
			Message::Notification(n) => assert_eq!(n.method, "probe"),
			other => panic!("expected probe, got {other:?}"),
		}
	}

	#[tokio::test]
	async fn prefix_changes_affect_nested_sections() {
		let mut r = rig(Vec::new());
		r.feature
			.register(
				"workspace/didChangeConfiguration",
				"c1",
				json!({"section": "editor.fontSize"}),
			)
			.unwrap();
		r.host.values.lock().insert("editor.fontSize".into(), json!(14));

		r.feature.did_change_configuration(Some(&["editor".to_string()]));
		assert_eq!(next_settings(&mut r.far).await, json!(14));
	}

	#[tokio::test]
	async fn multi_section_registration_builds_keyed_object() {
		let mut r = rig(Vec::new());
		r.feature
			.register(
				"workspace/didChangeConfiguration",
				"c1",
				json!({"section": ["lint", "format"]}),
			)
			.unwrap();
		r.host.values.lock().insert("lint".into(), json!(true));
		r.host.values.lock().insert("format".into(), json!("tabs"));

		r.feature.did_change_configuration(None);
		assert_eq!(next_settings(&mut r.far).await, json!({"lint": true, "format": "tabs"}));
	}

	#[tokio::test]
	async fn initialize_installs_the_configured_sections() {
		let mut r = rig(vec!["tether".to_string()]);
		r.feature.initialize(&ServerCapabilities::default(), None);
		r.host.values.lock().insert("tether".into(), json!({"trace": "off"}));

		r.feature.did_change_configuration(None);
		assert_eq!(next_settings(&mut r.far).await, json!({"trace": "off"}));
	}

	#[tokio::test]
	async fn pull_answers_positionally_with_scope() {
		let r = rig(Vec::new());
		r.host.values.lock().insert("a".into(), json!(1));
		r.host
			.values
			.lock()
			.insert("file:///w::b".into(), json!(2));

		let results = r.feature.pull(ConfigurationParams {
			items: vec![
				ConfigurationItem {
					scope_uri: None,
					section: Some("a".into()),
				},
				ConfigurationItem {
					scope_uri: Some("file:///w".parse().unwrap()),
					section: Some("b".into()),
				},
				ConfigurationItem {
					scope_uri: None,
					section: Some("missing".into()),
				},
			],
		});
		assert_eq!(results, vec![json!(1), json!(2), JsonValue::Null]);
	}
}
