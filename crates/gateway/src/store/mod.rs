//! The interaction store contract: the audit-log interface the core
//! consumes. Storage-engine choice (SQL schema, migrations, ...) is an
//! external concern; this module defines the trait and ships an in-memory
//! implementation that satisfies it, suitable for tests and for small
//! deployments that don't need durability.

mod memory;
mod types;

pub use memory::InMemoryInteractionStore;
pub use types::*;

use async_trait::async_trait;

use crate::error::GatewayError;

#[derive(Debug, Clone, Default)]
pub struct ListInteractionsFilter {
	pub tenant_id: Option<String>,
	pub frontdoor: Option<String>,
	pub provider: Option<String>,
	pub status: Option<InteractionStatus>,
	pub limit: usize,
	pub offset: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ListDivergentFilter {
	pub provider_name: Option<String>,
	pub limit: usize,
	pub offset: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Pagination {
	pub limit: usize,
	pub offset: usize,
}

/// Operations the core consumes. Every method that can fail returns
/// `GatewayError::server(..)`-flavoured errors; callers on the hot path
/// (thread-state persistence, shadow results, audit writes) must log these
/// rather than fail the client response.
#[async_trait]
pub trait InteractionStore: Send + Sync {
	async fn save_interaction(&self, interaction: Interaction) -> Result<(), GatewayError>;
	async fn get_interaction(&self, id: &str) -> Result<Option<Interaction>, GatewayError>;
	async fn get_interaction_by_provider_response_id(
		&self,
		id: &str,
	) -> Result<Option<Interaction>, GatewayError>;
	async fn update_interaction(&self, interaction: Interaction) -> Result<(), GatewayError>;
	async fn list_interactions(
		&self,
		filter: ListInteractionsFilter,
	) -> Result<Vec<InteractionSummary>, GatewayError>;

	async fn append_interaction_event(&self, event: InteractionEvent) -> Result<(), GatewayError>;
	async fn list_interaction_events(
		&self,
		interaction_id: &str,
		page: Pagination,
	) -> Result<Vec<InteractionEvent>, GatewayError>;

	async fn set_thread_state(&self, thread_key: &str, response_id: &str) -> Result<(), GatewayError>;
	async fn get_thread_state(&self, thread_key: &str) -> Result<Option<String>, GatewayError>;

	async fn save_shadow_result(&self, result: ShadowResult) -> Result<(), GatewayError>;
	async fn get_shadow_results(&self, interaction_id: &str) -> Result<Vec<ShadowResult>, GatewayError>;
	async fn list_divergent_interactions(
		&self,
		filter: ListDivergentFilter,
	) -> Result<Vec<ShadowResult>, GatewayError>;
	async fn get_divergent_shadow_count(&self) -> Result<u64, GatewayError>;
}
