//! Continuation-thread bookkeeping for Responses-style upstreams.
//!
//! Wraps any `UpstreamProvider`: before the call it resolves a
//! `previous_response_id` from a thread key, after the call it persists the
//! new response id under that key. Threading is a no-op pass-through when no
//! discriminator can be resolved.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use gw_core::Strng;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};

use crate::canonical::{CanonicalRequest, WireFormat};
use crate::error::GatewayError;
use crate::provider::{CompleteResult, EventStream, UpstreamProvider};
use crate::store::InteractionStore;

#[derive(Debug, Clone)]
pub struct ThreadKeyConfig {
	/// Dotted JSON path into the raw request body, e.g. `metadata.user_id`.
	pub discriminator_path: Option<String>,
	pub provider_secret: Strng,
	pub persistence_enabled: bool,
}

/// Emitted alongside a call so the orchestrator can append the matching
/// `InteractionEvent` rows without the adapter depending on the full store
/// row shape.
#[derive(Debug, Clone)]
pub enum ThreadAuditEvent {
	ThreadResolve { thread_key: String, previous_response_id: Option<String> },
	ThreadUpdate { thread_key: String, response_id: String },
}

pub struct ResponsesThreadAdapter<P> {
	inner: P,
	store: Option<Arc<dyn InteractionStore>>,
	cache: RwLock<HashMap<String, String>>,
	config: ThreadKeyConfig,
}

impl<P: UpstreamProvider> ResponsesThreadAdapter<P> {
	pub fn new(inner: P, store: Option<Arc<dyn InteractionStore>>, config: ThreadKeyConfig) -> Self {
		ResponsesThreadAdapter { inner, store, cache: RwLock::new(HashMap::new()), config }
	}

	/// Resolves the discriminator, then hashes it with the provider secret.
	/// Returns `None` when threading is disabled for this call (no dotted
	/// path configured and no `metadata.user_id`).
	fn thread_key(&self, req: &CanonicalRequest) -> Option<String> {
		let discriminator = self
			.config
			.discriminator_path
			.as_deref()
			.and_then(|path| req.raw_body.as_deref().and_then(|raw| serde_json::from_slice::<serde_json::Value>(raw).ok()).and_then(|tree| gw_core::jsonpath::resolve_nonempty_str(&tree, path).map(str::to_string)))
			.or_else(|| req.user_id().map(str::to_string))?;

		let mut hasher = Sha256::new();
		hasher.update(self.config.provider_secret.as_bytes());
		hasher.update(b":");
		hasher.update(discriminator.as_bytes());
		Some(hex::encode(hasher.finalize()))
	}

	/// Checks the in-process map first, then the store on miss. Lazy loads
	/// that race are idempotent — `HashMap::entry`-style first-winner-kept
	/// semantics via a second cache check after acquiring the write lock.
	async fn resolve_previous_id(&self, thread_key: &str) -> Option<String> {
		if let Some(id) = self.cache.read().get(thread_key).cloned() {
			return Some(id);
		}
		if !self.config.persistence_enabled {
			return None;
		}
		let store = self.store.as_ref()?;
		let persisted = store.get_thread_state(thread_key).await.ok().flatten()?;

		let mut cache = self.cache.write();
		Some(cache.entry(thread_key.to_string()).or_insert(persisted).clone())
	}

	async fn update_thread(&self, thread_key: &str, response_id: &str) {
		self.cache.write().insert(thread_key.to_string(), response_id.to_string());
		if self.config.persistence_enabled {
			if let Some(store) = &self.store {
				if let Err(e) = store.set_thread_state(thread_key, response_id).await {
					tracing::warn!(error = %e, thread_key, "failed to persist thread state; continuing with in-process cache only");
				}
			}
		}
	}

	pub async fn complete(&self, mut req: CanonicalRequest) -> Result<(CompleteResult, Vec<ThreadAuditEvent>), GatewayError> {
		let mut audit = Vec::new();
		let thread_key = self.thread_key(&req);

		if let Some(key) = &thread_key {
			let previous_id = self.resolve_previous_id(key).await;
			req.previous_response_id = previous_id.clone();
			audit.push(ThreadAuditEvent::ThreadResolve { thread_key: key.clone(), previous_response_id: previous_id });
		}

		let result = self.inner.complete(&req).await?;

		if let Some(key) = &thread_key {
			self.update_thread(key, &result.response.id).await;
			audit.push(ThreadAuditEvent::ThreadUpdate { thread_key: key.clone(), response_id: result.response.id.clone() });
		}

		Ok((result, audit))
	}

	/// Captures the upstream response id from whichever of
	/// `response.completed` or the deprecated `response.done` arrives first,
	/// then ignores the other. `on_response_id` is invoked exactly once with
	/// that id once the stream is fully drained by the caller; the adapter
	/// itself does not consume the stream.
	pub async fn stream(&self, mut req: CanonicalRequest) -> Result<(EventStream, Bytes, Option<String>), GatewayError> {
		let thread_key = self.thread_key(&req);
		let mut previous_id = None;
		if let Some(key) = &thread_key {
			previous_id = self.resolve_previous_id(key).await;
			req.previous_response_id = previous_id.clone();
		}
		let (stream, body) = self.inner.stream(&req).await?;
		Ok((stream, body, thread_key))
	}

	/// Called by the orchestrator once the stream accumulator has the
	/// terminal response id, so `update_thread` runs exactly once per call.
	pub async fn finish_stream(&self, thread_key: &str, response_id: &str) -> ThreadAuditEvent {
		self.update_thread(thread_key, response_id).await;
		ThreadAuditEvent::ThreadUpdate { thread_key: thread_key.to_string(), response_id: response_id.to_string() }
	}

	pub fn name(&self) -> &Strng {
		self.inner.name()
	}

	pub fn api_type(&self) -> WireFormat {
		self.inner.api_type()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::canonical::{CanonicalResponse, Choice, Message, Role, Sampling, Usage};
	use std::collections::BTreeMap;
	use std::sync::atomic::{AtomicUsize, Ordering};

	struct StubProvider {
		name: Strng,
		calls: AtomicUsize,
	}

	#[async_trait::async_trait]
	impl UpstreamProvider for StubProvider {
		fn name(&self) -> &Strng {
			&self.name
		}
		fn api_type(&self) -> WireFormat {
			WireFormat::Responses
		}
		async fn complete(&self, req: &CanonicalRequest) -> Result<CompleteResult, GatewayError> {
			let call_index = self.calls.fetch_add(1, Ordering::SeqCst);
			assert_eq!(req.previous_response_id, if call_index == 0 { None } else { Some("resp_1".to_string()) });
			Ok(CompleteResult {
				response: CanonicalResponse {
					id: "resp_1".to_string(),
					created: 0,
					model: "gpt-4o".to_string(),
					provider_model: "gpt-4o".to_string(),
					choices: vec![Choice { index: 0, message: Message::text(Role::Assistant, "hi"), finish_reason: None }],
					usage: Usage::default(),
					raw_upstream_body: None,
					raw_upstream_request_body: None,
					rate_limit: None,
				},
				provider_request_bytes: Bytes::new(),
				provider_response_bytes: Bytes::new(),
			})
		}
		async fn stream(&self, _req: &CanonicalRequest) -> Result<(EventStream, Bytes), GatewayError> {
			unimplemented!("not exercised in this test")
		}
	}

	fn request_with_user(user_id: &str) -> CanonicalRequest {
		let mut metadata = BTreeMap::new();
		metadata.insert("user_id".to_string(), user_id.to_string());
		CanonicalRequest {
			tenant_id: Default::default(),
			model: "gpt-4o".to_string(),
			source_api_type: WireFormat::Responses,
			raw_body: None,
			user_agent: None,
			messages: vec![Message::text(Role::User, "hi")],
			system_prompt: None,
			instructions: None,
			tools: Vec::new(),
			tool_choice: None,
			response_format: None,
			stop: Vec::new(),
			sampling: Sampling::default(),
			previous_response_id: None,
			metadata,
			unmapped_fields: serde_json::Value::Null,
		}
	}

	#[tokio::test]
	async fn second_call_with_same_discriminator_carries_previous_response_id() {
		let provider = StubProvider { name: Strng::from("openai"), calls: AtomicUsize::new(0) };
		let adapter = ResponsesThreadAdapter::new(
			provider,
			None,
			ThreadKeyConfig { discriminator_path: None, provider_secret: Strng::from("secret"), persistence_enabled: false },
		);

		let (_, _) = adapter.complete(request_with_user("alice")).await.unwrap();
		let (_, _) = adapter.complete(request_with_user("alice")).await.unwrap();
	}

	#[tokio::test]
	async fn distinct_discriminators_get_independent_threads() {
		let key_a = {
			let provider = StubProvider { name: Strng::from("openai"), calls: AtomicUsize::new(0) };
			let adapter = ResponsesThreadAdapter::new(provider, None, ThreadKeyConfig { discriminator_path: None, provider_secret: Strng::from("secret"), persistence_enabled: false });
			adapter.thread_key(&request_with_user("alice"))
		};
		let key_b = {
			let provider = StubProvider { name: Strng::from("openai"), calls: AtomicUsize::new(0) };
			let adapter = ResponsesThreadAdapter::new(provider, None, ThreadKeyConfig { discriminator_path: None, provider_secret: Strng::from("secret"), persistence_enabled: false });
			adapter.thread_key(&request_with_user("bob"))
		};
		assert_ne!(key_a, key_b);
	}
}
