//! A process-local `InteractionStore`. Useful for tests and for
//! deployments that don't need the audit log to outlive the process; a
//! durable implementation backs the same trait with a real database
//! without the rest of the core knowing the difference.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::types::*;
use super::{ListDivergentFilter, ListInteractionsFilter, Pagination};
use crate::error::GatewayError;
use crate::store::InteractionStore;

#[derive(Default)]
pub struct InMemoryInteractionStore {
	interactions: RwLock<HashMap<String, Interaction>>,
	by_provider_response_id: RwLock<HashMap<String, String>>,
	/// Keyed by interaction id; each Vec is append-only and kept sorted by
	/// `sequence` so event order within an interaction stays stable.
	events: RwLock<HashMap<String, Vec<InteractionEvent>>>,
	thread_state: RwLock<HashMap<String, String>>,
	shadow_results: RwLock<HashMap<String, Vec<ShadowResult>>>,
	event_sequence: AtomicU64,
}

impl InMemoryInteractionStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn next_sequence(&self) -> u64 {
		self.event_sequence.fetch_add(1, Ordering::SeqCst)
	}
}

#[async_trait]
impl InteractionStore for InMemoryInteractionStore {
	async fn save_interaction(&self, interaction: Interaction) -> Result<(), GatewayError> {
		if let Some(provider_response_id) = interaction.response.provider_response_id.clone() {
			self
				.by_provider_response_id
				.write()
				.insert(provider_response_id, interaction.id.clone());
		}
		self.interactions.write().insert(interaction.id.clone(), interaction);
		Ok(())
	}

	async fn get_interaction(&self, id: &str) -> Result<Option<Interaction>, GatewayError> {
		Ok(self.interactions.read().get(id).cloned())
	}

	async fn get_interaction_by_provider_response_id(
		&self,
		id: &str,
	) -> Result<Option<Interaction>, GatewayError> {
		let Some(interaction_id) = self.by_provider_response_id.read().get(id).cloned() else {
			return Ok(None);
		};
		Ok(self.interactions.read().get(&interaction_id).cloned())
	}

	async fn update_interaction(&self, interaction: Interaction) -> Result<(), GatewayError> {
		self.save_interaction(interaction).await
	}

	async fn list_interactions(
		&self,
		filter: ListInteractionsFilter,
	) -> Result<Vec<InteractionSummary>, GatewayError> {
		let interactions = self.interactions.read();
		let mut matched: Vec<&Interaction> = interactions
			.values()
			.filter(|i| {
				filter.tenant_id.as_deref().is_none_or(|t| t == i.tenant_id)
					&& filter
						.frontdoor
						.as_deref()
						.is_none_or(|f| f == i.frontdoor_api_type.as_str())
					&& filter.provider.as_deref().is_none_or(|p| p == i.provider)
					&& filter.status.is_none_or(|s| s == i.status)
			})
			.collect();
		matched.sort_by_key(|i| i.created_at);
		let limit = if filter.limit == 0 { matched.len() } else { filter.limit };
		Ok(
			matched
				.into_iter()
				.skip(filter.offset)
				.take(limit)
				.map(InteractionSummary::from)
				.collect(),
		)
	}

	async fn append_interaction_event(&self, event: InteractionEvent) -> Result<(), GatewayError> {
		let mut events = self.events.write();
		let bucket = events.entry(event.interaction_id.clone()).or_default();
		bucket.push(event);
		bucket.sort_by_key(|e| e.sequence);
		Ok(())
	}

	async fn list_interaction_events(
		&self,
		interaction_id: &str,
		page: Pagination,
	) -> Result<Vec<InteractionEvent>, GatewayError> {
		let events = self.events.read();
		let Some(bucket) = events.get(interaction_id) else {
			return Ok(Vec::new());
		};
		let limit = if page.limit == 0 { bucket.len() } else { page.limit };
		Ok(bucket.iter().skip(page.offset).take(limit).cloned().collect())
	}

	async fn set_thread_state(&self, thread_key: &str, response_id: &str) -> Result<(), GatewayError> {
		self.thread_state.write().insert(thread_key.to_string(), response_id.to_string());
		Ok(())
	}

	async fn get_thread_state(&self, thread_key: &str) -> Result<Option<String>, GatewayError> {
		Ok(self.thread_state.read().get(thread_key).cloned())
	}

	async fn save_shadow_result(&self, result: ShadowResult) -> Result<(), GatewayError> {
		self
			.shadow_results
			.write()
			.entry(result.interaction_id.clone())
			.or_default()
			.push(result);
		Ok(())
	}

	async fn get_shadow_results(&self, interaction_id: &str) -> Result<Vec<ShadowResult>, GatewayError> {
		Ok(self.shadow_results.read().get(interaction_id).cloned().unwrap_or_default())
	}

	async fn list_divergent_interactions(
		&self,
		filter: ListDivergentFilter,
	) -> Result<Vec<ShadowResult>, GatewayError> {
		let shadow_results = self.shadow_results.read();
		let mut matched: Vec<ShadowResult> = shadow_results
			.values()
			.flatten()
			.filter(|r| r.has_structural_divergence)
			.filter(|r| filter.provider_name.as_deref().is_none_or(|p| p == r.provider_name))
			.cloned()
			.collect();
		matched.sort_by_key(|r| r.created_at);
		let limit = if filter.limit == 0 { matched.len() } else { filter.limit };
		Ok(matched.into_iter().skip(filter.offset).take(limit).collect())
	}

	async fn get_divergent_shadow_count(&self) -> Result<u64, GatewayError> {
		let shadow_results = self.shadow_results.read();
		Ok(
			shadow_results
				.values()
				.flatten()
				.filter(|r| r.has_structural_divergence)
				.count() as u64,
		)
	}
}

#[cfg(test)]
mod tests {
	use std::collections::BTreeMap;

	use super::*;
	use crate::canonical::WireFormat;

	fn sample_interaction(id: &str) -> Interaction {
		Interaction {
			id: id.to_string(),
			tenant_id: "default".to_string(),
			frontdoor_api_type: WireFormat::Openai,
			provider: "openai".to_string(),
			requested_model: "gpt-4o".to_string(),
			served_model: "gpt-4o".to_string(),
			provider_model: "gpt-4o".to_string(),
			streaming: false,
			status: InteractionStatus::Completed,
			duration_ms: Some(12),
			request: RequestAudit::default(),
			response: ResponseAudit::default(),
			error: None,
			metadata: BTreeMap::new(),
			selected_headers: BTreeMap::new(),
			previous_interaction_id: None,
			thread_key: None,
			transformation_steps: Vec::new(),
			created_at: 0,
			updated_at: 0,
		}
	}

	#[tokio::test]
	async fn save_and_get_round_trips() {
		let store = InMemoryInteractionStore::new();
		store.save_interaction(sample_interaction("int_1")).await.unwrap();
		let got = store.get_interaction("int_1").await.unwrap().unwrap();
		assert_eq!(got.id, "int_1");
	}

	#[tokio::test]
	async fn save_interaction_is_idempotent_on_id() {
		let store = InMemoryInteractionStore::new();
		store.save_interaction(sample_interaction("int_1")).await.unwrap();
		let mut second = sample_interaction("int_1");
		second.status = InteractionStatus::Failed;
		store.save_interaction(second).await.unwrap();
		assert_eq!(store.get_interaction("int_1").await.unwrap().unwrap().status, InteractionStatus::Failed);
		assert_eq!(store.list_interactions(ListInteractionsFilter::default()).await.unwrap().len(), 1);
	}

	#[tokio::test]
	async fn thread_state_is_last_writer_wins() {
		let store = InMemoryInteractionStore::new();
		store.set_thread_state("thread_a", "resp_1").await.unwrap();
		store.set_thread_state("thread_a", "resp_2").await.unwrap();
		assert_eq!(store.get_thread_state("thread_a").await.unwrap(), Some("resp_2".to_string()));
	}

	#[tokio::test]
	async fn events_are_returned_in_insertion_order() {
		let store = InMemoryInteractionStore::new();
		for stage in [EventStage::FrontdoorDecode, EventStage::PipelinePre, EventStage::ProviderEncode] {
			let seq = store.next_sequence();
			store
				.append_interaction_event(InteractionEvent {
					id: format!("evt_{seq}"),
					interaction_id: "int_1".to_string(),
					stage,
					direction: EventDirection::Internal,
					api_type: None,
					provider: None,
					requested_model: None,
					provider_model: None,
					thread_key: None,
					previous_response_id: None,
					raw: None,
					canonical: None,
					headers: BTreeMap::new(),
					metadata: serde_json::Value::Null,
					sequence: seq,
					created_at: 0,
				})
				.await
				.unwrap();
		}
		let events = store.list_interaction_events("int_1", Pagination::default()).await.unwrap();
		let stages: Vec<_> = events.iter().map(|e| e.stage).collect();
		assert_eq!(
			stages,
			vec![EventStage::FrontdoorDecode, EventStage::PipelinePre, EventStage::ProviderEncode]
		);
	}

	#[tokio::test]
	async fn divergent_interactions_are_listable() {
		let store = InMemoryInteractionStore::new();
		store
			.save_shadow_result(ShadowResult {
				id: "shadow_1".to_string(),
				interaction_id: "int_1".to_string(),
				provider_name: "anthropic".to_string(),
				provider_model_override: None,
				request: ShadowRequestAudit { canonical: serde_json::Value::Null, provider_bytes: None },
				response: ShadowResponseAudit::default(),
				error: None,
				duration_ms: 5,
				prompt_tokens: None,
				completion_tokens: None,
				divergences: vec![Divergence {
					kind: DivergenceKind::ArrayLength,
					path: "choices".to_string(),
					description: "choice count differs".to_string(),
					primary_value: None,
					shadow_value: None,
				}],
				has_structural_divergence: true,
				created_at: 0,
			})
			.await
			.unwrap();
		assert_eq!(store.get_divergent_shadow_count().await.unwrap(), 1);
		let found = store.list_divergent_interactions(ListDivergentFilter::default()).await.unwrap();
		assert_eq!(found.len(), 1);
	}
}
