//! Model-name based provider selection and request/response model rewriting.
//!
//! Two chained decisions: prefix routing (`<prefix>/<rest>`) takes priority
//! over the ordered rewrite list; a fallback rule or the default provider
//! covers anything neither of those match.

use std::collections::BTreeMap;

use gw_core::Strng;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::canonical::WireFormat;
use crate::error::GatewayError;

#[derive(Debug, Clone)]
pub struct ProviderInfo {
	pub name: Strng,
	pub api_type: WireFormat,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RewriteRule {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub model_exact: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub model_prefix: Option<String>,
	#[serde(rename = "match", skip_serializing_if = "Option::is_none")]
	pub match_substring: Option<String>,
	pub provider: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub model: Option<String>,
	#[serde(default)]
	pub rewrite_response_model: bool,
}

impl RewriteRule {
	fn matches(&self, requested_model: &str) -> bool {
		if let Some(exact) = &self.model_exact {
			if exact == requested_model {
				return true;
			}
		}
		if let Some(prefix) = &self.model_prefix {
			if requested_model.starts_with(prefix.as_str()) {
				return true;
			}
		}
		if let Some(needle) = &self.match_substring {
			if requested_model.contains(needle.as_str()) {
				return true;
			}
		}
		false
	}
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouterConfig {
	pub default_provider: String,
	#[serde(default)]
	pub prefix_providers: BTreeMap<String, String>,
	#[serde(default)]
	pub rewrites: Vec<RewriteRule>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub fallback: Option<RewriteRule>,
}

/// The outcome of a routing decision: which provider to call, what model
/// name to send it, and whether the response's `model` field should be
/// rewritten back to what the client originally requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDecision {
	pub provider: Strng,
	pub upstream_model: String,
	pub rewrite_response_model: bool,
	pub requested_model: String,
}

#[derive(Clone)]
pub struct Router {
	providers: IndexMap<Strng, ProviderInfo>,
	config: RouterConfig,
}

impl Router {
	/// Fails construction if any provider referenced by the prefix map,
	/// a rewrite rule, the fallback rule, or the default provider is
	/// missing from `providers`.
	pub fn new(providers: IndexMap<Strng, ProviderInfo>, config: RouterConfig) -> Result<Self, GatewayError> {
		let exists = |name: &str| providers.contains_key(name);

		if !exists(&config.default_provider) {
			return Err(GatewayError::invalid_request(format!(
				"router default_provider {:?} is not a configured provider",
				config.default_provider
			)));
		}
		for provider_name in config.prefix_providers.values() {
			if !exists(provider_name) {
				return Err(GatewayError::invalid_request(format!(
					"router prefix map references unknown provider {provider_name:?}"
				)));
			}
		}
		for rule in config.rewrites.iter().chain(config.fallback.iter()) {
			if !exists(&rule.provider) {
				return Err(GatewayError::invalid_request(format!(
					"router rewrite rule references unknown provider {:?}",
					rule.provider
				)));
			}
		}

		Ok(Router { providers, config })
	}

	pub fn provider(&self, name: &str) -> Option<&ProviderInfo> {
		self.providers.get(name)
	}

	pub fn decide(&self, requested_model: &str) -> Result<RouteDecision, GatewayError> {
		if requested_model.trim().is_empty() {
			return Err(GatewayError::invalid_request("model must not be empty").with_param("model"));
		}

		if let Some((prefix, rest)) = requested_model.split_once('/') {
			if let Some(provider) = self.config.prefix_providers.get(prefix) {
				return Ok(RouteDecision {
					provider: Strng::from(provider.as_str()),
					upstream_model: rest.to_string(),
					rewrite_response_model: false,
					requested_model: requested_model.to_string(),
				});
			}
		}

		if let Some(rule) = self.config.rewrites.iter().find(|r| r.matches(requested_model)) {
			return Ok(RouteDecision {
				provider: Strng::from(rule.provider.as_str()),
				upstream_model: rule.model.clone().unwrap_or_else(|| requested_model.to_string()),
				rewrite_response_model: rule.rewrite_response_model,
				requested_model: requested_model.to_string(),
			});
		}

		if let Some(rule) = &self.config.fallback {
			return Ok(RouteDecision {
				provider: Strng::from(rule.provider.as_str()),
				upstream_model: rule.model.clone().unwrap_or_else(|| requested_model.to_string()),
				rewrite_response_model: rule.rewrite_response_model,
				requested_model: requested_model.to_string(),
			});
		}

		Ok(RouteDecision {
			provider: Strng::from(self.config.default_provider.as_str()),
			upstream_model: requested_model.to_string(),
			rewrite_response_model: false,
			requested_model: requested_model.to_string(),
		})
	}
}
