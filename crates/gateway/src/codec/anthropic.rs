//! Anthropic Messages codec (`POST /v1/messages`).
//!
//! Hand-rolled wire structs rather than a typed upstream crate — there is
//! no third-party Anthropic wire-types crate in the dependency stack, so
//! this mirrors the `rest: serde_json::Value` flatten idiom used across the
//! codec layer directly against the documented wire shape.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::canonical::{
	CanonicalEvent, CanonicalRequest, CanonicalResponse, Choice, ContentPart, FinishReason, Message,
	MessageContent, Role, Sampling, StreamMetadata, ToolCall, ToolCallChunk, ToolChoice,
	ToolDefinition, Usage, WireFormat,
};
use crate::codec::Codec;
use crate::error::{GatewayError, GatewayErrorKind};

pub struct AnthropicCodec;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireRequest {
	model: String,
	messages: Vec<WireMessage>,
	#[serde(skip_serializing_if = "Option::is_none")]
	system: Option<WireSystem>,
	max_tokens: u64,
	#[serde(skip_serializing_if = "Option::is_none")]
	temperature: Option<f64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	top_p: Option<f64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	stream: Option<bool>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	stop_sequences: Vec<String>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	tools: Vec<WireToolDefinition>,
	#[serde(skip_serializing_if = "Option::is_none")]
	tool_choice: Option<serde_json::Value>,
	#[serde(flatten, default)]
	rest: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum WireSystem {
	Text(String),
	Blocks(Vec<WireContentBlock>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireMessage {
	role: String,
	content: WireContent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum WireContent {
	Text(String),
	Blocks(Vec<WireContentBlock>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireContentBlock {
	Text {
		text: String,
	},
	ToolUse {
		id: String,
		name: String,
		input: serde_json::Value,
	},
	ToolResult {
		tool_use_id: String,
		#[serde(default)]
		content: Option<WireContent>,
	},
	#[serde(other)]
	Unrecognized,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireToolDefinition {
	name: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	description: Option<String>,
	input_schema: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireResponse {
	id: String,
	#[serde(default = "default_type")]
	r#type: String,
	role: String,
	content: Vec<WireContentBlock>,
	model: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	stop_reason: Option<String>,
	usage: WireUsage,
	#[serde(flatten, default)]
	rest: serde_json::Value,
}

fn default_type() -> String {
	"message".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireUsage {
	input_tokens: u64,
	output_tokens: u64,
}

/// Anthropic streams as a sequence of typed SSE events, not one JSON chunk
/// per line, so `decode_stream_chunk` takes one already-split `data:` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireStreamEvent {
	MessageStart {
		message: WireResponse,
	},
	ContentBlockStart {
		index: u32,
		content_block: WireContentBlock,
	},
	ContentBlockDelta {
		index: u32,
		delta: WireDelta,
	},
	ContentBlockStop {
		index: u32,
	},
	MessageDelta {
		delta: WireMessageDelta,
		#[serde(default)]
		usage: Option<WireUsage>,
	},
	MessageStop,
	Ping,
	#[serde(other)]
	Unrecognized,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireDelta {
	TextDelta { text: String },
	InputJsonDelta { partial_json: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireMessageDelta {
	#[serde(skip_serializing_if = "Option::is_none")]
	stop_reason: Option<String>,
}

fn canonical_role(wire: &str) -> Result<Role, GatewayError> {
	match wire {
		"user" => Ok(Role::User),
		"assistant" => Ok(Role::Assistant),
		other => Err(GatewayError::invalid_request(format!("unknown role: {other}")).with_param("messages.role")),
	}
}

fn wire_content_to_canonical(content: WireContent) -> (Option<MessageContent>, Vec<ToolCall>, Option<String>) {
	match content {
		WireContent::Text(t) => (Some(MessageContent::Text(t)), Vec::new(), None),
		WireContent::Blocks(blocks) => {
			let mut parts = Vec::new();
			let mut tool_calls = Vec::new();
			let mut tool_call_id = None;
			for block in blocks {
				match block {
					WireContentBlock::Text { text } => parts.push(ContentPart::Text { text }),
					WireContentBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
						id,
						name,
						arguments_json: serde_json::to_string(&input).unwrap_or_default(),
					}),
					WireContentBlock::ToolResult { tool_use_id, content } => {
						tool_call_id = Some(tool_use_id);
						if let Some(c) = content {
							let (inner, _, _) = wire_content_to_canonical(c);
							if let Some(MessageContent::Text(t)) = inner {
								parts.push(ContentPart::Text { text: t });
							}
						}
					}
					WireContentBlock::Unrecognized => {}
				}
			}
			let content = if parts.is_empty() { None } else { Some(MessageContent::Parts(parts)) };
			(content, tool_calls, tool_call_id)
		}
	}
}

fn canonical_content_to_wire(m: &Message) -> WireContent {
	let mut blocks = Vec::new();
	if let Some(content) = &m.content {
		match content {
			MessageContent::Text(t) => {
				if m.role == Role::Tool {
					return WireContent::Blocks(vec![WireContentBlock::ToolResult {
						tool_use_id: m.tool_call_id.clone().unwrap_or_default(),
						content: Some(WireContent::Text(t.clone())),
					}]);
				}
				blocks.push(WireContentBlock::Text { text: t.clone() });
			}
			MessageContent::Parts(parts) => {
				for p in parts {
					if let ContentPart::Text { text } = p {
						blocks.push(WireContentBlock::Text { text: text.clone() });
					}
				}
			}
		}
	}
	for tc in &m.tool_calls {
		blocks.push(WireContentBlock::ToolUse {
			id: tc.id.clone(),
			name: tc.name.clone(),
			input: serde_json::from_str(&tc.arguments_json).unwrap_or(serde_json::Value::Null),
		});
	}
	if blocks.len() == 1 {
		if let WireContentBlock::Text { text } = &blocks[0] {
			return WireContent::Text(text.clone());
		}
	}
	WireContent::Blocks(blocks)
}

impl Codec for AnthropicCodec {
	fn wire_format(&self) -> WireFormat {
		WireFormat::Anthropic
	}

	fn decode_request(&self, bytes: &[u8]) -> Result<CanonicalRequest, GatewayError> {
		let wire: WireRequest = serde_json::from_slice(bytes).map_err(|e| {
			GatewayError::invalid_request(format!("failed to parse request: {e}")).with_source_api("anthropic")
		})?;

		let mut messages = Vec::with_capacity(wire.messages.len());
		for m in wire.messages {
			let role = canonical_role(&m.role)?;
			let (content, tool_calls, tool_call_id) = wire_content_to_canonical(m.content);
			messages.push(Message {
				role: if tool_call_id.is_some() { Role::Tool } else { role },
				content,
				tool_calls,
				tool_call_id,
				name: None,
			});
		}

		let system_prompt = wire.system.map(|s| match s {
			WireSystem::Text(t) => t,
			WireSystem::Blocks(blocks) => blocks
				.into_iter()
				.filter_map(|b| match b {
					WireContentBlock::Text { text } => Some(text),
					_ => None,
				})
				.collect::<Vec<_>>()
				.join("\n"),
		});

		Ok(CanonicalRequest {
			tenant_id: Default::default(),
			model: wire.model,
			source_api_type: WireFormat::Anthropic,
			raw_body: Some(Bytes::copy_from_slice(bytes)),
			user_agent: None,
			messages,
			system_prompt,
			instructions: None,
			tools: wire
				.tools
				.into_iter()
				.map(|t| ToolDefinition { name: t.name, description: t.description, parameters: t.input_schema })
				.collect(),
			tool_choice: wire.tool_choice.as_ref().and_then(|v| match v.get("type").and_then(|t| t.as_str()) {
				Some("auto") => Some(ToolChoice::Auto),
				Some("any") => Some(ToolChoice::Required),
				Some("none") => Some(ToolChoice::None),
				Some("tool") => v.get("name").and_then(|n| n.as_str()).map(|n| ToolChoice::Named(n.to_string())),
				_ => None,
			}),
			response_format: None,
			stop: wire.stop_sequences,
			sampling: Sampling {
				max_tokens: Some(wire.max_tokens),
				temperature: wire.temperature,
				top_p: wire.top_p,
				stream: wire.stream.unwrap_or(false),
			},
			previous_response_id: None,
			metadata: BTreeMap::new(),
			unmapped_fields: wire.rest,
		})
	}

	fn encode_request(&self, req: &CanonicalRequest) -> Result<Bytes, GatewayError> {
		let tool_choice = req.tool_choice.as_ref().map(|tc| match tc {
			ToolChoice::Auto => serde_json::json!({"type": "auto"}),
			ToolChoice::Required => serde_json::json!({"type": "any"}),
			ToolChoice::None => serde_json::json!({"type": "none"}),
			ToolChoice::Named(name) => serde_json::json!({"type": "tool", "name": name}),
		});

		let wire = WireRequest {
			model: req.model.clone(),
			messages: req.messages.iter().map(|m| WireMessage { role: m.role.as_str().to_string(), content: canonical_content_to_wire(m) }).collect(),
			system: req.system_prompt.clone().map(WireSystem::Text),
			max_tokens: req.sampling.max_tokens.unwrap_or(4096),
			temperature: req.sampling.temperature,
			top_p: req.sampling.top_p,
			stream: Some(req.sampling.stream),
			stop_sequences: req.stop.clone(),
			tools: req
				.tools
				.iter()
				.map(|t| WireToolDefinition { name: t.name.clone(), description: t.description.clone(), input_schema: t.parameters.clone() })
				.collect(),
			tool_choice,
			rest: req.unmapped_fields.clone(),
		};
		serde_json::to_vec(&wire).map(Bytes::from).map_err(GatewayError::from_marshal)
	}

	fn decode_response(&self, bytes: &[u8]) -> Result<CanonicalResponse, GatewayError> {
		let wire: WireResponse = serde_json::from_slice(bytes).map_err(|e| {
			GatewayError::new(GatewayErrorKind::Server, format!("failed to parse response: {e}")).with_source_api("anthropic")
		})?;

		let (content, tool_calls, _) = wire_content_to_canonical(WireContent::Blocks(wire.content));
		let message = Message { role: Role::Assistant, content, tool_calls, tool_call_id: None, name: None };

		Ok(CanonicalResponse {
			id: wire.id,
			created: 0,
			model: wire.model.clone(),
			provider_model: wire.model,
			choices: vec![Choice {
				index: 0,
				message,
				finish_reason: wire.stop_reason.as_deref().and_then(FinishReason::from_anthropic),
			}],
			usage: Usage {
				prompt_tokens: wire.usage.input_tokens,
				completion_tokens: wire.usage.output_tokens,
				total_tokens: wire.usage.input_tokens + wire.usage.output_tokens,
			},
			raw_upstream_body: Some(Bytes::copy_from_slice(bytes)),
			raw_upstream_request_body: None,
			rate_limit: None,
		})
	}

	fn encode_response(&self, resp: &CanonicalResponse) -> Result<Bytes, GatewayError> {
		let choice = resp.choices.first();
		let content = match choice {
			Some(c) => match canonical_content_to_wire(&c.message) {
				WireContent::Text(t) => vec![WireContentBlock::Text { text: t }],
				WireContent::Blocks(b) => b,
			},
			None => Vec::new(),
		};

		let wire = WireResponse {
			id: resp.id.clone(),
			r#type: default_type(),
			role: "assistant".to_string(),
			content,
			model: resp.model.clone(),
			stop_reason: choice.and_then(|c| c.finish_reason).map(|f| f.to_anthropic().to_string()),
			usage: WireUsage { input_tokens: resp.usage.prompt_tokens, output_tokens: resp.usage.completion_tokens },
			rest: serde_json::Value::Null,
		};
		serde_json::to_vec(&wire).map(Bytes::from).map_err(GatewayError::from_marshal)
	}

	fn decode_stream_chunk(&self, bytes: &[u8]) -> Result<Vec<CanonicalEvent>, GatewayError> {
		let wire: WireStreamEvent = serde_json::from_slice(bytes).map_err(|e| {
			GatewayError::new(GatewayErrorKind::Server, format!("failed to parse stream event: {e}")).with_source_api("anthropic")
		})?;

		let event = match wire {
			WireStreamEvent::MessageStart { message } => {
				Some(CanonicalEvent::MessageStart { id: message.id, model: message.model })
			}
			WireStreamEvent::ContentBlockStart { index, content_block } => Some(CanonicalEvent::ContentBlockStart {
				index,
				block_type: match content_block {
					WireContentBlock::Text { .. } => "text".to_string(),
					WireContentBlock::ToolUse { .. } => "tool_use".to_string(),
					WireContentBlock::ToolResult { .. } => "tool_result".to_string(),
					WireContentBlock::Unrecognized => "unknown".to_string(),
				},
			}),
			WireStreamEvent::ContentBlockDelta { index, delta } => Some(match delta {
				WireDelta::TextDelta { text } => CanonicalEvent::ContentDelta { index, text },
				WireDelta::InputJsonDelta { partial_json } => CanonicalEvent::ContentBlockDelta {
					index,
					tool_call: Some(ToolCallChunk { index, id: None, name: None, arguments_delta: Some(partial_json) }),
					text: None,
				},
			}),
			WireStreamEvent::ContentBlockStop { index } => {
				Some(CanonicalEvent::ContentBlockStop { index, tool_call: None })
			}
			WireStreamEvent::MessageDelta { delta, usage } => Some(CanonicalEvent::MessageDelta {
				finish_reason: delta.stop_reason.as_deref().and_then(FinishReason::from_anthropic),
				usage: usage.map(|u| Usage { prompt_tokens: u.input_tokens, completion_tokens: u.output_tokens, total_tokens: u.input_tokens + u.output_tokens }),
			}),
			WireStreamEvent::MessageStop => Some(CanonicalEvent::MessageStop),
			WireStreamEvent::Ping | WireStreamEvent::Unrecognized => None,
		};
		Ok(event.into_iter().collect())
	}

	fn encode_stream_chunk(&self, event: &CanonicalEvent, meta: &StreamMetadata) -> Result<Bytes, GatewayError> {
		let wire = match event {
			CanonicalEvent::MessageStart { id, model } => WireStreamEvent::MessageStart {
				message: WireResponse {
					id: id.clone(),
					r#type: default_type(),
					role: "assistant".to_string(),
					content: Vec::new(),
					model: model.clone(),
					stop_reason: None,
					usage: WireUsage { input_tokens: 0, output_tokens: 0 },
					rest: serde_json::Value::Null,
				},
			},
			CanonicalEvent::ContentBlockStart { index, block_type } => WireStreamEvent::ContentBlockStart {
				index: *index,
				content_block: if block_type == "tool_use" {
					WireContentBlock::ToolUse { id: String::new(), name: String::new(), input: serde_json::Value::Null }
				} else {
					WireContentBlock::Text { text: String::new() }
				},
			},
			CanonicalEvent::ContentDelta { index, text } => {
				WireStreamEvent::ContentBlockDelta { index: *index, delta: WireDelta::TextDelta { text: text.clone() } }
			}
			CanonicalEvent::ContentBlockDelta { index, tool_call: Some(tc), .. } => WireStreamEvent::ContentBlockDelta {
				index: *index,
				delta: WireDelta::InputJsonDelta { partial_json: tc.arguments_delta.clone().unwrap_or_default() },
			},
			CanonicalEvent::ContentBlockStop { index, .. } => WireStreamEvent::ContentBlockStop { index: *index },
			CanonicalEvent::MessageDelta { finish_reason, usage } => WireStreamEvent::MessageDelta {
				delta: WireMessageDelta { stop_reason: finish_reason.map(|f| f.to_anthropic().to_string()) },
				usage: usage.as_ref().map(|u| WireUsage { input_tokens: u.prompt_tokens, output_tokens: u.completion_tokens }),
			},
			CanonicalEvent::MessageStop => WireStreamEvent::MessageStop,
			CanonicalEvent::Raw { bytes } => return Ok(bytes.clone()),
			_ => {
				let _ = meta;
				return Ok(Bytes::new());
			}
		};
		serde_json::to_vec(&wire).map(Bytes::from).map_err(GatewayError::from_marshal)
	}
}
