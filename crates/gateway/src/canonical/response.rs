//! The canonical response: what every provider adapter produces and every
//! frontdoor codec re-encodes from.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::canonical::request::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
	Stop,
	Length,
	ToolCalls,
	ContentFilter,
	Cancelled,
}

impl FinishReason {
	/// Finish-reason normalisation table.
	pub fn from_anthropic(stop_reason: &str) -> Option<Self> {
		match stop_reason {
			"end_turn" | "stop_sequence" => Some(FinishReason::Stop),
			"max_tokens" => Some(FinishReason::Length),
			"tool_use" => Some(FinishReason::ToolCalls),
			_ => None,
		}
	}

	pub fn to_anthropic(&self) -> &'static str {
		match self {
			FinishReason::Stop => "end_turn",
			FinishReason::Length => "max_tokens",
			FinishReason::ToolCalls => "tool_use",
			FinishReason::ContentFilter => "end_turn",
			FinishReason::Cancelled => "end_turn",
		}
	}

	pub fn from_openai(value: &str) -> Option<Self> {
		match value {
			"stop" => Some(FinishReason::Stop),
			"length" => Some(FinishReason::Length),
			"tool_calls" => Some(FinishReason::ToolCalls),
			"content_filter" => Some(FinishReason::ContentFilter),
			"cancelled" => Some(FinishReason::Cancelled),
			_ => None,
		}
	}

	pub fn to_openai(&self) -> &'static str {
		match self {
			FinishReason::Stop => "stop",
			FinishReason::Length => "length",
			FinishReason::ToolCalls => "tool_calls",
			FinishReason::ContentFilter => "content_filter",
			FinishReason::Cancelled => "cancelled",
		}
	}
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
	pub prompt_tokens: u64,
	pub completion_tokens: u64,
	pub total_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
	pub index: u32,
	pub message: Message,
	pub finish_reason: Option<FinishReason>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitSnapshot {
	pub limit_requests: Option<u64>,
	pub remaining_requests: Option<u64>,
	pub limit_tokens: Option<u64>,
	pub remaining_tokens: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalResponse {
	/// Gateway-owned id; never the upstream-provider id.
	pub id: String,
	pub created: i64,
	/// Client-facing model name, possibly rewritten by the router.
	pub model: String,
	/// The model actually used upstream, preserved for audit.
	pub provider_model: String,
	pub choices: Vec<Choice>,
	pub usage: Usage,
	#[serde(skip)]
	pub raw_upstream_body: Option<Bytes>,
	#[serde(skip)]
	pub raw_upstream_request_body: Option<Bytes>,
	pub rate_limit: Option<RateLimitSnapshot>,
}

impl CanonicalResponse {
	pub fn first_finish_reason(&self) -> Option<FinishReason> {
		self.choices.first().and_then(|c| c.finish_reason)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn anthropic_finish_reason_normalisation() {
		assert_eq!(FinishReason::from_anthropic("end_turn"), Some(FinishReason::Stop));
		assert_eq!(FinishReason::from_anthropic("max_tokens"), Some(FinishReason::Length));
		assert_eq!(FinishReason::from_anthropic("tool_use"), Some(FinishReason::ToolCalls));
		assert_eq!(FinishReason::from_anthropic("unknown"), None);
	}

	#[test]
	fn openai_finish_reason_round_trips() {
		for fr in [
			FinishReason::Stop,
			FinishReason::Length,
			FinishReason::ToolCalls,
			FinishReason::ContentFilter,
			FinishReason::Cancelled,
		] {
			assert_eq!(FinishReason::from_openai(fr.to_openai()), Some(fr));
		}
	}
}
