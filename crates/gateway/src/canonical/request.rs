//! The canonical request: the only request shape the router, pipeline, and
//! shadow engine are allowed to see. Every frontdoor codec decodes into
//! this, and every provider adapter encodes out of it.

use std::collections::BTreeMap;

use bytes::Bytes;
use gw_core::Strng;
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, GatewayErrorKind};

/// The wire format a caller spoke, or a provider speaks. Distinct from the
/// provider *name*: two providers can share an `api_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireFormat {
	Openai,
	Anthropic,
	Responses,
}

impl WireFormat {
	pub fn as_str(&self) -> &'static str {
		match self {
			WireFormat::Openai => "openai",
			WireFormat::Anthropic => "anthropic",
			WireFormat::Responses => "responses",
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
	System,
	User,
	Assistant,
	Tool,
}

impl Role {
	pub fn as_str(&self) -> &'static str {
		match self {
			Role::System => "system",
			Role::User => "user",
			Role::Assistant => "assistant",
			Role::Tool => "tool",
		}
	}
}

/// A single part of a rich (multi-part) message body. Only the structural
/// shape matters to the core (divergence detection compares structure,
/// never text); `Other` keeps the part's JSON payload for audit/round-trip
/// without the canonical layer needing to understand every content kind a
/// wire format might introduce.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
	Text { text: String },
	Other {
		kind: String,
		#[serde(flatten)]
		raw: serde_json::Value,
	},
}

impl ContentPart {
	pub fn kind(&self) -> &str {
		match self {
			ContentPart::Text { .. } => "text",
			ContentPart::Other { kind, .. } => kind.as_str(),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
	Text(String),
	Parts(Vec<ContentPart>),
}

impl MessageContent {
	pub fn as_text(&self) -> Option<&str> {
		match self {
			MessageContent::Text(t) => Some(t.as_str()),
			MessageContent::Parts(_) => None,
		}
	}

	pub fn is_empty(&self) -> bool {
		match self {
			MessageContent::Text(t) => t.is_empty(),
			MessageContent::Parts(p) => p.is_empty(),
		}
	}
}

/// A normalized tool call, regardless of which wire format produced it:
/// tool calls surface as `{id, name, arguments_json_string}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
	pub id: String,
	pub name: String,
	pub arguments_json: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
	pub role: Role,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub content: Option<MessageContent>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub tool_calls: Vec<ToolCall>,
	/// Set on `Role::Tool` messages: the id of the call this message answers.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub tool_call_id: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
}

impl Message {
	pub fn text(role: Role, text: impl Into<String>) -> Self {
		Message {
			role,
			content: Some(MessageContent::Text(text.into())),
			tool_calls: Vec::new(),
			tool_call_id: None,
			name: None,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
	pub name: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub description: Option<String>,
	#[serde(default)]
	pub parameters: serde_json::Value,
}

/// Modeled as a tagged variant rather than an untyped value: codecs
/// normalise on decode, denormalise on encode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoice {
	Auto,
	None,
	Required,
	Named(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseFormat {
	Text,
	JsonObject,
	JsonSchema { schema: serde_json::Value },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Sampling {
	pub max_tokens: Option<u64>,
	pub temperature: Option<f64>,
	pub top_p: Option<f64>,
	pub stream: bool,
}

/// The canonical request. Owned by the handler frame; provider adapters
/// must not retain references to it past the call that received it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalRequest {
	pub tenant_id: Strng,
	pub model: String,
	pub source_api_type: WireFormat,
	#[serde(skip)]
	pub raw_body: Option<Bytes>,
	pub user_agent: Option<String>,

	pub messages: Vec<Message>,
	pub system_prompt: Option<String>,
	/// Responses-only: the `instructions` field.
	pub instructions: Option<String>,
	#[serde(default)]
	pub tools: Vec<ToolDefinition>,
	pub tool_choice: Option<ToolChoice>,
	pub response_format: Option<ResponseFormat>,
	#[serde(default)]
	pub stop: Vec<String>,

	#[serde(flatten)]
	pub sampling: Sampling,

	/// Responses-only continuation pointer.
	pub previous_response_id: Option<String>,

	/// Gateway-scoped metadata (`interaction_id`, `user_id`, ...). Never
	/// forwarded upstream unless a codec explicitly whitelists a key.
	#[serde(default)]
	pub metadata: BTreeMap<String, String>,

	/// Fields the source wire format carried that have no canonical slot;
	/// preserved for audit, never sent upstream.
	#[serde(default)]
	pub unmapped_fields: serde_json::Value,
}

impl CanonicalRequest {
	/// Validates the invariants below. Call this once, right after
	/// `Codec::decode_request`.
	pub fn validate(&self) -> Result<(), GatewayError> {
		if self.model.trim().is_empty() {
			return Err(GatewayError::new(
				GatewayErrorKind::InvalidRequest,
				"model must not be empty",
			)
			.with_param("model"));
		}
		let one_shot_responses_text = self.source_api_type == WireFormat::Responses
			&& self.messages.len() == 1
			&& self.messages[0].role == Role::User
			&& self.system_prompt.is_none();
		if self.messages.is_empty() && !one_shot_responses_text {
			return Err(GatewayError::new(
				GatewayErrorKind::InvalidRequest,
				"messages must not be empty",
			)
			.with_param("messages"));
		}
		Ok(())
	}

	/// If `source_api_type = responses` and exactly one user message is
	/// present with no system prompt, the simple-string input form is used.
	pub fn uses_simple_responses_input(&self) -> bool {
		self.source_api_type == WireFormat::Responses
			&& self.messages.len() == 1
			&& self.messages[0].role == Role::User
			&& self.system_prompt.is_none()
	}

	pub fn metadata_get(&self, key: &str) -> Option<&str> {
		self.metadata.get(key).map(String::as_str)
	}

	pub fn interaction_id(&self) -> Option<&str> {
		self.metadata_get("interaction_id")
	}

	pub fn user_id(&self) -> Option<&str> {
		self.metadata_get("user_id")
	}
}
