//! JSON configuration loading and handler construction.
//!
//! Deliberately small: one flat document describing frontdoors, providers,
//! pipeline stages, and shadow fan-out, resolved into live `gateway` types.
//! Reload-on-change and a schema-validated format are left to whoever
//! operates this binary; this just turns JSON into a running `Handler` per
//! configured frontdoor.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use gateway::canonical::WireFormat;
use gateway::pipeline::webhook::{OnError, WebhookConfig, WebhookStage};
use gateway::pipeline::{Phase, Pipeline, Stage};
use gateway::provider::responses_adapter::{ResponsesThreadAdapter, ThreadKeyConfig};
use gateway::provider::{HttpUpstreamProvider, UpstreamProvider};
use gateway::router::{ProviderInfo, Router, RouterConfig};
use gateway::shadow::{ShadowEngine, ShadowProviderConfig};
use gateway::store::{InMemoryInteractionStore, InteractionStore};
use gateway::{Handler, ProviderHandle};
use gw_core::Strng;
use indexmap::IndexMap;
use serde::Deserialize;

fn default_tenant_id() -> String {
	"default".to_string()
}

fn default_webhook_timeout_ms() -> u64 {
	5_000
}

fn default_shadow_timeout_ms() -> u64 {
	10_000
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
	#[serde(default = "default_tenant_id")]
	pub tenant_id: String,
	#[serde(default)]
	pub frontdoors: Vec<FrontdoorSpec>,
	#[serde(default)]
	pub providers: Vec<ProviderSpec>,
	#[serde(default)]
	pub router: RouterConfig,
	#[serde(default)]
	pub pipeline: Vec<WebhookStageSpec>,
	#[serde(default)]
	pub shadow: ShadowSpec,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FrontdoorSpec {
	/// Path prefix this frontdoor is mounted under, e.g. `/openai`.
	pub path: String,
	pub wire_format: WireFormat,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderSpec {
	pub name: String,
	pub api_type: WireFormat,
	pub base_url: String,
	/// Environment variable holding the provider's API key. Empty if unset.
	#[serde(default)]
	pub api_key_env: Option<String>,
	#[serde(default)]
	pub threading: Option<ThreadingSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ThreadingSpec {
	#[serde(default)]
	pub discriminator_path: Option<String>,
	pub provider_secret_env: String,
	#[serde(default)]
	pub persistence_enabled: bool,
}

#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum PhaseSpec {
	Pre,
	Post,
}

#[derive(Debug, Deserialize, Clone, Copy, Default)]
#[serde(rename_all = "snake_case")]
pub enum OnErrorSpec {
	#[default]
	Deny,
	Allow,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WebhookStageSpec {
	pub name: String,
	pub phase: PhaseSpec,
	#[serde(default)]
	pub order: i64,
	pub url: String,
	#[serde(default = "default_webhook_timeout_ms")]
	pub timeout_ms: u64,
	#[serde(default)]
	pub retries: u32,
	#[serde(default)]
	pub on_error: OnErrorSpec,
	#[serde(default)]
	pub squelch: bool,
	#[serde(default)]
	pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ShadowSpec {
	#[serde(default)]
	pub providers: Vec<ShadowProviderSpec>,
	#[serde(default = "default_shadow_timeout_ms")]
	pub timeout_ms: u64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShadowProviderSpec {
	pub provider: String,
	#[serde(default)]
	pub model_override: Option<String>,
	#[serde(default)]
	pub max_tokens_multiplier: Option<u64>,
}

pub struct Built {
	pub store: Arc<dyn InteractionStore>,
	pub frontdoors: Vec<(String, Arc<Handler>)>,
}

/// Turns a parsed `Config` into a shared audit store plus one `Handler` per
/// configured frontdoor. Frontdoors share providers, routing, pipeline, and
/// shadow configuration — only the wire format they accept differs.
pub fn build(config: Config) -> anyhow::Result<Built> {
	let store: Arc<dyn InteractionStore> = Arc::new(InMemoryInteractionStore::new());
	let tenant_id = Strng::from(config.tenant_id.as_str());

	let mut provider_infos = IndexMap::new();
	let mut provider_handles: IndexMap<Strng, ProviderHandle> = IndexMap::new();
	for spec in &config.providers {
		let name = Strng::from(spec.name.as_str());
		provider_infos.insert(name.clone(), ProviderInfo { name: name.clone(), api_type: spec.api_type });

		let api_key = spec.api_key_env.as_deref().and_then(|var| std::env::var(var).ok()).unwrap_or_default();
		let http_provider = HttpUpstreamProvider::new(name.clone(), spec.base_url.clone(), api_key, spec.api_type);

		let handle = match &spec.threading {
			Some(threading) => {
				let secret = std::env::var(&threading.provider_secret_env).unwrap_or_default();
				let adapter = ResponsesThreadAdapter::new(
					http_provider,
					Some(store.clone()),
					ThreadKeyConfig {
						discriminator_path: threading.discriminator_path.clone(),
						provider_secret: Strng::from(secret),
						persistence_enabled: threading.persistence_enabled,
					},
				);
				ProviderHandle::Threaded(Arc::new(adapter))
			}
			None => ProviderHandle::Plain(Arc::new(http_provider)),
		};
		provider_handles.insert(name, handle);
	}

	let router = Router::new(provider_infos, config.router.clone())?;

	let mut shadow_providers = Vec::new();
	for spec in &config.shadow.providers {
		let handle = provider_handles
			.get(spec.provider.as_str())
			.ok_or_else(|| anyhow::anyhow!("shadow provider {:?} is not a configured provider", spec.provider))?;
		let upstream: Arc<dyn UpstreamProvider> = match handle {
			ProviderHandle::Plain(p) => p.clone(),
			ProviderHandle::Threaded(_) => anyhow::bail!("shadow provider {:?} cannot be a Responses-threaded provider", spec.provider),
		};
		shadow_providers.push((
			ShadowProviderConfig {
				provider_name: Strng::from(spec.provider.as_str()),
				model_override: spec.model_override.clone(),
				max_tokens_multiplier: spec.max_tokens_multiplier,
			},
			upstream,
		));
	}
	let shadow = if shadow_providers.is_empty() {
		None
	} else {
		Some(Arc::new(ShadowEngine::new(shadow_providers, Duration::from_millis(config.shadow.timeout_ms))))
	};

	let mut frontdoors = Vec::with_capacity(config.frontdoors.len());
	for spec in &config.frontdoors {
		let stages: Vec<Box<dyn Stage>> = config
			.pipeline
			.iter()
			.map(|stage| -> Box<dyn Stage> {
				Box::new(WebhookStage::new(WebhookConfig {
					name: stage.name.clone(),
					phase: match stage.phase {
						PhaseSpec::Pre => Phase::Pre,
						PhaseSpec::Post => Phase::Post,
					},
					order: stage.order,
					url: stage.url.clone(),
					timeout: Duration::from_millis(stage.timeout_ms),
					retries: stage.retries,
					on_error: match stage.on_error {
						OnErrorSpec::Allow => OnError::Allow,
						OnErrorSpec::Deny => OnError::Deny,
					},
					squelch: stage.squelch,
					headers: stage.headers.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
				}))
			})
			.collect();

		let handler = Handler::new(spec.wire_format, tenant_id.clone(), router.clone(), provider_handles.clone(), Pipeline::new(stages), store.clone(), shadow.clone());
		frontdoors.push((spec.path.clone(), Arc::new(handler)));
	}

	Ok(Built { store, frontdoors })
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn minimal_config_parses_with_defaults() {
		let json = serde_json::json!({
			"providers": [{"name": "openai", "api_type": "openai", "base_url": "https://api.openai.com"}],
			"frontdoors": [{"path": "/openai", "wire_format": "openai"}],
			"router": {"default_provider": "openai"},
		});
		let config: Config = serde_json::from_value(json).unwrap();
		assert_eq!(config.tenant_id, "default");
		let built = build(config).unwrap();
		assert_eq!(built.frontdoors.len(), 1);
	}

	#[test]
	fn shadow_provider_must_reference_a_configured_provider() {
		let json = serde_json::json!({
			"providers": [{"name": "openai", "api_type": "openai", "base_url": "https://api.openai.com"}],
			"frontdoors": [{"path": "/openai", "wire_format": "openai"}],
			"router": {"default_provider": "openai"},
			"shadow": {"providers": [{"provider": "missing"}]},
		});
		let config: Config = serde_json::from_value(json).unwrap();
		assert!(build(config).is_err());
	}
}
