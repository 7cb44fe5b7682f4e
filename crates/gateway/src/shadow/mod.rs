//! Shadow execution engine: fans a request out to alternate providers after
//! the primary response is available, never delaying or altering what the
//! client receives.

pub mod divergence;

use std::sync::Arc;
use std::time::Duration;

use gw_core::Strng;

use crate::canonical::{CanonicalRequest, CanonicalResponse};
use crate::codec::Codec;
use crate::error::GatewayError;
use crate::provider::UpstreamProvider;
use crate::store::{Divergence, ShadowRequestAudit, ShadowResponseAudit, ShadowResult};

#[derive(Debug, Clone)]
pub struct ShadowProviderConfig {
	pub provider_name: Strng,
	pub model_override: Option<String>,
	/// `None` or `Some(0)` means unlimited (sent as 0); `Some(1)` preserves
	/// the primary request's `max_tokens`; `>1` scales it.
	pub max_tokens_multiplier: Option<u64>,
}

fn apply_shadow_overrides(mut request: CanonicalRequest, config: &ShadowProviderConfig) -> CanonicalRequest {
	if let Some(model) = &config.model_override {
		request.model = model.clone();
	}
	request.sampling.max_tokens = match config.max_tokens_multiplier {
		None | Some(0) => Some(0),
		Some(1) => request.sampling.max_tokens,
		Some(n) => request.sampling.max_tokens.map(|tokens| tokens * n),
	};
	request.sampling.stream = false;
	request
}

pub struct ShadowEngine {
	providers: Vec<(ShadowProviderConfig, Arc<dyn UpstreamProvider>)>,
	timeout: Duration,
}

impl ShadowEngine {
	pub fn new(providers: Vec<(ShadowProviderConfig, Arc<dyn UpstreamProvider>)>, timeout: Duration) -> Self {
		ShadowEngine { providers, timeout }
	}

	pub fn is_enabled(&self) -> bool {
		!self.providers.is_empty()
	}

	/// Runs every configured shadow provider in parallel, bounded by
	/// `timeout`. Never returns an error: a shadow failure becomes a
	/// `ShadowResult` row with `error` populated.
	pub async fn run(
		&self,
		interaction_id: &str,
		primary_request: &CanonicalRequest,
		primary_response: &CanonicalResponse,
		client_codec: Arc<dyn Codec>,
	) -> Vec<ShadowResult> {
		let tasks = self.providers.iter().map(|(config, provider)| {
			let config = config.clone();
			let provider = provider.clone();
			let primary_request = primary_request.clone();
			let primary_response = primary_response.clone();
			let client_codec = client_codec.clone();
			let interaction_id = interaction_id.to_string();
			let timeout = self.timeout;
			tokio::spawn(async move {
				run_one(interaction_id, config, provider, primary_request, primary_response, client_codec, timeout).await
			})
		});

		let mut results = Vec::with_capacity(self.providers.len());
		for task in tasks {
			match task.await {
				Ok(result) => results.push(result),
				Err(join_error) => tracing::warn!(error = %join_error, "shadow task panicked"),
			}
		}
		results
	}
}

async fn run_one(
	interaction_id: String,
	config: ShadowProviderConfig,
	provider: Arc<dyn UpstreamProvider>,
	primary_request: CanonicalRequest,
	primary_response: CanonicalResponse,
	client_codec: Arc<dyn Codec>,
	timeout: Duration,
) -> ShadowResult {
	let shadow_request = apply_shadow_overrides(primary_request.clone(), &config);
	let started = std::time::Instant::now();

	let call = tokio::time::timeout(timeout, provider.complete(&shadow_request)).await;

	let id = gw_core::ids::shadow_id();
	let base = ShadowResult {
		id,
		interaction_id,
		provider_name: config.provider_name.to_string(),
		provider_model_override: config.model_override.clone(),
		request: ShadowRequestAudit { canonical: serde_json::to_value(&shadow_request).unwrap_or(serde_json::Value::Null), provider_bytes: None },
		response: ShadowResponseAudit::default(),
		error: None,
		duration_ms: started.elapsed().as_millis() as u64,
		prompt_tokens: None,
		completion_tokens: None,
		divergences: Vec::new(),
		has_structural_divergence: false,
		created_at: chrono::Utc::now().timestamp_millis(),
	};

	match call {
		Err(_elapsed) => ShadowResult { error: Some(GatewayError::new(crate::error::GatewayErrorKind::Overloaded, "shadow call timed out")), duration_ms: started.elapsed().as_millis() as u64, ..base },
		Ok(Err(e)) => ShadowResult { error: Some(e), duration_ms: started.elapsed().as_millis() as u64, ..base },
		Ok(Ok(result)) => {
			let divergences: Vec<Divergence> = divergence::detect(&primary_response, &result.response);
			let has_structural_divergence = divergence::has_structural_divergence(&divergences);
			let reencoded = client_codec.encode_response(&result.response).ok();
			ShadowResult {
				response: ShadowResponseAudit {
					raw: Some(result.provider_response_bytes),
					canonical: serde_json::to_value(&result.response).ok(),
					reencoded_for_frontdoor: reencoded,
					finish_reason: result.response.first_finish_reason(),
					usage: Some(result.response.usage.clone()),
				},
				prompt_tokens: Some(result.response.usage.prompt_tokens),
				completion_tokens: Some(result.response.usage.completion_tokens),
				divergences,
				has_structural_divergence,
				duration_ms: started.elapsed().as_millis() as u64,
				created_at: chrono::Utc::now().timestamp_millis(),
				..base
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::canonical::Sampling;

	fn base_request() -> CanonicalRequest {
		CanonicalRequest {
			tenant_id: Default::default(),
			model: "gpt-4o".to_string(),
			source_api_type: crate::canonical::WireFormat::Openai,
			raw_body: None,
			user_agent: None,
			messages: Vec::new(),
			system_prompt: None,
			instructions: None,
			tools: Vec::new(),
			tool_choice: None,
			response_format: None,
			stop: Vec::new(),
			sampling: Sampling { max_tokens: Some(100), temperature: None, top_p: None, stream: true },
			previous_response_id: None,
			metadata: Default::default(),
			unmapped_fields: serde_json::Value::Null,
		}
	}

	#[test]
	fn no_multiplier_sets_unlimited_zero() {
		let config = ShadowProviderConfig { provider_name: Strng::from("shadow"), model_override: None, max_tokens_multiplier: None };
		let request = apply_shadow_overrides(base_request(), &config);
		assert_eq!(request.sampling.max_tokens, Some(0));
		assert!(!request.sampling.stream, "shadow calls are always forced non-streaming");
	}

	#[test]
	fn multiplier_of_one_preserves_max_tokens() {
		let config = ShadowProviderConfig { provider_name: Strng::from("shadow"), model_override: None, max_tokens_multiplier: Some(1) };
		let request = apply_shadow_overrides(base_request(), &config);
		assert_eq!(request.sampling.max_tokens, Some(100));
	}

	#[test]
	fn multiplier_scales_max_tokens() {
		let config = ShadowProviderConfig { provider_name: Strng::from("shadow"), model_override: None, max_tokens_multiplier: Some(3) };
		let request = apply_shadow_overrides(base_request(), &config);
		assert_eq!(request.sampling.max_tokens, Some(300));
	}

	#[test]
	fn model_override_replaces_model() {
		let config = ShadowProviderConfig { provider_name: Strng::from("shadow"), model_override: Some("gpt-4o-mini".to_string()), max_tokens_multiplier: None };
		let request = apply_shadow_overrides(base_request(), &config);
		assert_eq!(request.model, "gpt-4o-mini");
	}
}
