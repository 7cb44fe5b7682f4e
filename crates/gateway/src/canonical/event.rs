//! Canonical streaming events.
//!
//! Modeled as a sealed tagged variant with per-variant payload shapes rather
//! than a single wide struct with mostly-`None` fields.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::canonical::response::{FinishReason, Usage};
use crate::error::GatewayError;

/// A single streamed tool-call fragment. `arguments_delta` accumulates
/// across events for a given `index`; the terminal `content_block_stop`
/// (or `response.output_item.done`) carries the final arguments string.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolCallChunk {
	pub index: u32,
	pub id: Option<String>,
	pub name: Option<String>,
	pub arguments_delta: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamMetadata {
	pub id: String,
	pub model: String,
	pub created: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CanonicalEvent {
	ContentDelta { index: u32, text: String },
	ContentBlockStart { index: u32, block_type: String },
	ContentBlockDelta { index: u32, tool_call: Option<ToolCallChunk>, text: Option<String> },
	ContentBlockStop { index: u32, tool_call: Option<ToolCallChunk> },
	MessageStart { id: String, model: String },
	MessageDelta { finish_reason: Option<FinishReason>, usage: Option<Usage> },
	MessageStop,

	ResponseCreated { id: String, model: String },
	ResponseOutputItemAdded { index: u32, item_type: String },
	ResponseOutputItemDelta { index: u32, tool_call: Option<ToolCallChunk>, text: Option<String> },
	ResponseOutputItemDone { index: u32, tool_call: Option<ToolCallChunk> },
	ResponseDone { id: String, model: String, provider_model: String, usage: Option<Usage> },
	ResponseFailed { id: String, error: GatewayError },

	/// Opaque pass-through bytes: used when the codec can forward the
	/// provider's raw SSE frame unmodified (pass-through).
	Raw { bytes: Bytes },

	Error { error: GatewayError },
	Done,
}

impl CanonicalEvent {
	/// Whether this event terminates the stream — used by the accumulator
	/// that builds a canonical response at stream close.
	pub fn is_terminal(&self) -> bool {
		matches!(
			self,
			CanonicalEvent::MessageStop
				| CanonicalEvent::ResponseDone { .. }
				| CanonicalEvent::ResponseFailed { .. }
				| CanonicalEvent::Error { .. }
				| CanonicalEvent::Done
		)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn terminal_events_are_flagged() {
		assert!(CanonicalEvent::Done.is_terminal());
		assert!(CanonicalEvent::MessageStop.is_terminal());
		assert!(!CanonicalEvent::ContentDelta { index: 0, text: "hi".into() }.is_terminal());
	}
}
