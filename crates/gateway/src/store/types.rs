//! Row shapes for the interaction store: interactions, interaction events,
//! shadow results, divergences, and thread state.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::canonical::{FinishReason, Usage, WireFormat};
use crate::error::GatewayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionStatus {
	Pending,
	InProgress,
	Completed,
	Failed,
	Cancelled,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestAudit {
	#[serde(skip)]
	pub raw: Option<Bytes>,
	pub canonical_json: Option<serde_json::Value>,
	pub unmapped_fields: Option<serde_json::Value>,
	#[serde(skip)]
	pub provider_request_bytes: Option<Bytes>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseAudit {
	#[serde(skip)]
	pub raw: Option<Bytes>,
	pub canonical_json: Option<serde_json::Value>,
	pub unmapped_fields: Option<serde_json::Value>,
	#[serde(skip)]
	pub client_response_bytes: Option<Bytes>,
	pub provider_response_id: Option<String>,
	pub finish_reason: Option<FinishReason>,
	pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionError {
	pub error_type: String,
	pub code: Option<String>,
	pub message: String,
}

/// One step recorded in `Interaction::transformation_steps`: a human-audit
/// trail distinct from the machine-timed `InteractionEvent` log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformationStep {
	pub name: String,
	pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interaction {
	pub id: String,
	pub tenant_id: String,
	pub frontdoor_api_type: WireFormat,
	pub provider: String,
	pub requested_model: String,
	pub served_model: String,
	pub provider_model: String,
	pub streaming: bool,
	pub status: InteractionStatus,
	pub duration_ms: Option<u64>,
	pub request: RequestAudit,
	pub response: ResponseAudit,
	pub error: Option<InteractionError>,
	pub metadata: BTreeMap<String, String>,
	pub selected_headers: BTreeMap<String, String>,
	pub previous_interaction_id: Option<String>,
	pub thread_key: Option<String>,
	pub transformation_steps: Vec<TransformationStep>,
	pub created_at: i64,
	pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionSummary {
	pub id: String,
	pub tenant_id: String,
	pub frontdoor_api_type: WireFormat,
	pub provider: String,
	pub status: InteractionStatus,
	pub created_at: i64,
}

impl From<&Interaction> for InteractionSummary {
	fn from(i: &Interaction) -> Self {
		InteractionSummary {
			id: i.id.clone(),
			tenant_id: i.tenant_id.clone(),
			frontdoor_api_type: i.frontdoor_api_type,
			provider: i.provider.clone(),
			status: i.status,
			created_at: i.created_at,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStage {
	FrontdoorDecode,
	ProviderEncode,
	ProviderDecode,
	FrontdoorEncode,
	ThreadResolve,
	ThreadUpdate,
	PipelinePre,
	PipelinePost,
	ShadowDispatch,
	ShadowResult,
	Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventDirection {
	Ingress,
	Egress,
	Internal,
}

/// An append-only timeline row. Never updated or deleted once appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionEvent {
	pub id: String,
	pub interaction_id: String,
	pub stage: EventStage,
	pub direction: EventDirection,
	pub api_type: Option<WireFormat>,
	pub provider: Option<String>,
	pub requested_model: Option<String>,
	pub provider_model: Option<String>,
	pub thread_key: Option<String>,
	pub previous_response_id: Option<String>,
	#[serde(skip)]
	pub raw: Option<Bytes>,
	pub canonical: Option<serde_json::Value>,
	pub headers: BTreeMap<String, String>,
	pub metadata: serde_json::Value,
	/// Insertion sequence number, used to keep a stable order when two
	/// events share the same millisecond timestamp.
	pub sequence: u64,
	pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DivergenceKind {
	MissingField,
	ExtraField,
	TypeMismatch,
	ArrayLength,
	NullMismatch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Divergence {
	pub kind: DivergenceKind,
	pub path: String,
	pub description: String,
	pub primary_value: Option<serde_json::Value>,
	pub shadow_value: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowRequestAudit {
	pub canonical: serde_json::Value,
	#[serde(skip)]
	pub provider_bytes: Option<Bytes>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShadowResponseAudit {
	#[serde(skip)]
	pub raw: Option<Bytes>,
	pub canonical: Option<serde_json::Value>,
	/// The shadow response re-encoded with the *primary frontdoor's* codec,
	/// so it can be diffed against what the client actually received.
	#[serde(skip)]
	pub reencoded_for_frontdoor: Option<Bytes>,
	pub finish_reason: Option<FinishReason>,
	pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowResult {
	pub id: String,
	pub interaction_id: String,
	pub provider_name: String,
	pub provider_model_override: Option<String>,
	pub request: ShadowRequestAudit,
	pub response: ShadowResponseAudit,
	pub error: Option<GatewayError>,
	pub duration_ms: u64,
	pub prompt_tokens: Option<u64>,
	pub completion_tokens: Option<u64>,
	pub divergences: Vec<Divergence>,
	pub has_structural_divergence: bool,
	pub created_at: i64,
}
