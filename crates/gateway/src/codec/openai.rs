//! OpenAI Chat Completions codec (`POST /v1/chat/completions`).
//!
//! Wire structs keep a `rest: serde_json::Value` catch-all so that any field
//! this codec doesn't have a canonical slot for round-trips through
//! `unmapped_fields` instead of being silently dropped.

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

pub struct OpenAiCodec;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireRequest {
	model: String,
	messages: Vec<WireMessage>,
	#[serde(skip_serializing_if = "Option::is_none")]
	temperature: Option<f64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	top_p: Option<f64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	max_tokens: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	stream: Option<bool>,
	#[serde(skip_serializing_if = "Option::is_none")]
	stop: Option<Vec<String>>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	tools: Vec<WireToolDefinition>,
	#[serde(skip_serializing_if = "Option::is_none")]
	tool_choice: Option<serde_json::Value>,
	#[serde(skip_serializing_if = "Option::is_none")]
	response_format: Option<serde_json::Value>,
	#[serde(flatten)]
	rest: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireMessage {
	role: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	content: Option<WireContent>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	tool_calls: Vec<WireToolCall>,
	#[serde(skip_serializing_if = "Option::is_none")]
	tool_call_id: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum WireContent {
	Text(String),
	Parts(Vec<WireContentPart>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireContentPart {
	r#type: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	text: Option<String>,
	#[serde(flatten)]
	rest: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireToolCall {
	id: String,
	r#type: String,
	function: WireFunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireFunctionCall {
	name: String,
	arguments: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireToolDefinition {
	r#type: String,
	function: WireFunctionDefinition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireFunctionDefinition {
	name: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	description: Option<String>,
	#[serde(default)]
	parameters: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireResponse {
	id: String,
	#[serde(default = "default_object")]
	object: String,
	created: i64,
	model: String,
	choices: Vec<WireChoice>,
	#[serde(skip_serializing_if = "Option::is_none")]
	usage: Option<WireUsage>,
	#[serde(flatten)]
	rest: serde_json::Value,
}

fn default_object() -> String {
	"chat.completion".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireChoice {
	index: u32,
	message: WireMessage,
	#[serde(skip_serializing_if = "Option::is_none")]
	finish_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireUsage {
	prompt_tokens: u64,
	completion_tokens: u64,
	total_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireStreamChunk {
	id: String,
	created: i64,
	model: String,
	#[serde(default)]
	choices: Vec<WireStreamChoice>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	usage: Option<WireUsage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireStreamChoice {
	index: u32,
	delta: WireDelta,
	#[serde(default)]
	finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct WireDelta {
	#[serde(default)]
	role: Option<String>,
	#[serde(default)]
	content: Option<String>,
	#[serde(default)]
	tool_calls: Vec<WireToolCallDelta>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireToolCallDelta {
	index: u32,
	#[serde(skip_serializing_if = "Option::is_none")]
	id: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	function: Option<WireFunctionCallDelta>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct WireFunctionCallDelta {
	#[serde(skip_serializing_if = "Option::is_none")]
	name: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	arguments: Option<String>,
}

fn wire_role(role: Role) -> String {
	role.as_str().to_string()
}

fn canonical_role(wire: &str) -> Result<Role, GatewayError> {
	match wire {
		"system" => Ok(Role::System),
		"user" => Ok(Role::User),
		"assistant" => Ok(Role::Assistant),
		"tool" => Ok(Role::Tool),
		other => Err(GatewayError::invalid_request(format!("unknown role: {other}")).with_param("messages.role")),
	}
}

fn content_to_canonical(content: Option<WireContent>) -> Option<MessageContent> {
	match content {
		None => None,
		Some(WireContent::Text(t)) => Some(MessageContent::Text(t)),
		Some(WireContent::Parts(parts)) => Some(MessageContent::Parts(
			parts
				.into_iter()
				.map(|p| {
					if p.r#type == "text" {
						ContentPart::Text { text: p.text.unwrap_or_default() }
					} else {
						ContentPart::Other { kind: p.r#type, raw: p.rest }
					}
				})
				.collect(),
		)),
	}
}

fn content_to_wire(content: &Option<MessageContent>) -> Option<WireContent> {
	match content {
		None => None,
		Some(MessageContent::Text(t)) => Some(WireContent::Text(t.clone())),
		Some(MessageContent::Parts(parts)) => Some(WireContent::Parts(
			parts
				.iter()
				.map(|p| match p {
					ContentPart::Text { text } => WireContentPart {
						r#type: "text".to_string(),
						text: Some(text.clone()),
						rest: serde_json::Value::Null,
					},
					ContentPart::Other { kind, raw } => WireContentPart {
						r#type: kind.clone(),
						text: None,
						rest: raw.clone(),
					},
				})
				.collect(),
		)),
	}
}

fn message_to_canonical(m: WireMessage) -> Result<Message, GatewayError> {
	Ok(Message {
		role: canonical_role(&m.role)?,
		content: content_to_canonical(m.content),
		tool_calls: m
			.tool_calls
			.into_iter()
			.map(|tc| ToolCall { id: tc.id, name: tc.function.name, arguments_json: tc.function.arguments })
			.collect(),
		tool_call_id: m.tool_call_id,
		name: m.name,
	})
}

fn message_to_wire(m: &Message) -> WireMessage {
	WireMessage {
		role: wire_role(m.role),
		content: content_to_wire(&m.content),
		tool_calls: m
			.tool_calls
			.iter()
			.map(|tc| WireToolCall {
				id: tc.id.clone(),
				r#type: "function".to_string(),
				function: WireFunctionCall { name: tc.name.clone(), arguments: tc.arguments_json.clone() },
			})
			.collect(),
		tool_call_id: m.tool_call_id.clone(),
		name: m.name.clone(),
	}
}

fn tool_choice_to_wire(tc: &ToolChoice) -> serde_json::Value {
	match tc {
		ToolChoice::Auto => serde_json::json!("auto"),
		ToolChoice::None => serde_json::json!("none"),
		ToolChoice::Required => serde_json::json!("required"),
		ToolChoice::Named(name) => serde_json::json!({"type": "function", "function": {"name": name}}),
	}
}

fn tool_choice_from_wire(v: &serde_json::Value) -> Option<ToolChoice> {
	match v {
		serde_json::Value::String(s) => match s.as_str() {
			"auto" => Some(ToolChoice::Auto),
			"none" => Some(ToolChoice::None),
			"required" => Some(ToolChoice::Required),
			_ => None,
		},
		serde_json::Value::Object(_) => v
			.get("function")
			.and_then(|f| f.get("name"))
			.and_then(|n| n.as_str())
			.map(|n| ToolChoice::Named(n.to_string())),
		_ => None,
	}
}

impl Codec for OpenAiCodec {
	fn wire_format(&self) -> WireFormat {
		WireFormat::Openai
	}

	fn decode_request(&self, bytes: &[u8]) -> Result<CanonicalRequest, GatewayError> {
		let wire: WireRequest = serde_json::from_slice(bytes).map_err(|e| {
			GatewayError::invalid_request(format!("failed to parse request: {e}")).with_source_api("openai")
		})?;

		let mut wire_messages = wire.messages.into_iter();
		let mut system_prompt = None;
		let mut leading = wire_messages.next();
		if let Some(m) = &leading {
			if m.role == "system" {
				system_prompt = m.content.as_ref().and_then(|c| match c {
					WireContent::Text(t) => Some(t.clone()),
					WireContent::Parts(_) => None,
				});
				leading = wire_messages.next();
			}
		}
		let messages = leading
			.into_iter()
			.chain(wire_messages)
			.map(message_to_canonical)
			.collect::<Result<Vec<_>, _>>()?;

		Ok(CanonicalRequest {
			tenant_id: Default::default(),
			model: wire.model,
			source_api_type: WireFormat::Openai,
			raw_body: Some(Bytes::copy_from_slice(bytes)),
			user_agent: None,
			messages,
			system_prompt,
			instructions: None,
			tools: wire
				.tools
				.into_iter()
				.map(|t| ToolDefinition {
					name: t.function.name,
					description: t.function.description,
					parameters: t.function.parameters,
				})
				.collect(),
			tool_choice: wire.tool_choice.as_ref().and_then(tool_choice_from_wire),
			response_format: None,
			stop: wire.stop.unwrap_or_default(),
			sampling: Sampling {
				max_tokens: wire.max_tokens,
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
		let mut messages = Vec::with_capacity(req.messages.len() + 1);
		if let Some(system_prompt) = &req.system_prompt {
			messages.push(WireMessage {
				role: "system".to_string(),
				content: Some(WireContent::Text(system_prompt.clone())),
				tool_calls: Vec::new(),
				tool_call_id: None,
				name: None,
			});
		}
		messages.extend(req.messages.iter().map(message_to_wire));

		let wire = WireRequest {
			model: req.model.clone(),
			messages,
			temperature: req.sampling.temperature,
			top_p: req.sampling.top_p,
			max_tokens: req.sampling.max_tokens,
			stream: Some(req.sampling.stream),
			stop: if req.stop.is_empty() { None } else { Some(req.stop.clone()) },
			tools: req
				.tools
				.iter()
				.map(|t| WireToolDefinition {
					r#type: "function".to_string(),
					function: WireFunctionDefinition {
						name: t.name.clone(),
						description: t.description.clone(),
						parameters: t.parameters.clone(),
					},
				})
				.collect(),
			tool_choice: req.tool_choice.as_ref().map(tool_choice_to_wire),
			response_format: None,
			rest: req.unmapped_fields.clone(),
		};
		serde_json::to_vec(&wire).map(Bytes::from).map_err(GatewayError::from_marshal)
	}

	fn decode_response(&self, bytes: &[u8]) -> Result<CanonicalResponse, GatewayError> {
		let wire: WireResponse = serde_json::from_slice(bytes).map_err(|e| {
			GatewayError::new(GatewayErrorKind::Server, format!("failed to parse response: {e}")).with_source_api("openai")
		})?;

		let choices = wire
			.choices
			.into_iter()
			.map(|c| -> Result<Choice, GatewayError> {
				Ok(Choice {
					index: c.index,
					message: message_to_canonical(c.message)?,
					finish_reason: c.finish_reason.as_deref().and_then(FinishReason::from_openai),
				})
			})
			.collect::<Result<Vec<_>, _>>()?;

		Ok(CanonicalResponse {
			id: wire.id,
			created: wire.created,
			model: wire.model.clone(),
			provider_model: wire.model,
			choices,
			usage: wire
				.usage
				.map(|u| Usage { prompt_tokens: u.prompt_tokens, completion_tokens: u.completion_tokens, total_tokens: u.total_tokens })
				.unwrap_or_default(),
			raw_upstream_body: Some(Bytes::copy_from_slice(bytes)),
			raw_upstream_request_body: None,
			rate_limit: None,
		})
	}

	fn encode_response(&self, resp: &CanonicalResponse) -> Result<Bytes, GatewayError> {
		let wire = WireResponse {
			id: resp.id.clone(),
			object: default_object(),
			created: resp.created,
			model: resp.model.clone(),
			choices: resp
				.choices
				.iter()
				.map(|c| WireChoice {
					index: c.index,
					message: message_to_wire(&c.message),
					finish_reason: c.finish_reason.map(|f| f.to_openai().to_string()),
				})
				.collect(),
			usage: Some(WireUsage {
				prompt_tokens: resp.usage.prompt_tokens,
				completion_tokens: resp.usage.completion_tokens,
				total_tokens: resp.usage.total_tokens,
			}),
			rest: serde_json::Value::Null,
		};
		serde_json::to_vec(&wire).map(Bytes::from).map_err(GatewayError::from_marshal)
	}

	fn decode_stream_chunk(&self, bytes: &[u8]) -> Result<Vec<CanonicalEvent>, GatewayError> {
		let wire: WireStreamChunk = serde_json::from_slice(bytes).map_err(|e| {
			GatewayError::new(GatewayErrorKind::Server, format!("failed to parse stream chunk: {e}")).with_source_api("openai")
		})?;

		let mut events = Vec::new();
		for choice in wire.choices {
			if let Some(role) = choice.delta.role {
				let _ = role; // role-only deltas carry no canonical payload beyond message_start
				events.push(CanonicalEvent::MessageStart { id: wire.id.clone(), model: wire.model.clone() });
			}
			if let Some(text) = choice.delta.content {
				events.push(CanonicalEvent::ContentDelta { index: choice.index, text });
			}
			for tc in choice.delta.tool_calls {
				events.push(CanonicalEvent::ContentBlockDelta {
					index: choice.index,
					tool_call: Some(ToolCallChunk {
						index: tc.index,
						id: tc.id,
						name: tc.function.as_ref().and_then(|f| f.name.clone()),
						arguments_delta: tc.function.and_then(|f| f.arguments),
					}),
					text: None,
				});
			}
			if let Some(reason) = choice.finish_reason {
				events.push(CanonicalEvent::MessageDelta {
					finish_reason: FinishReason::from_openai(&reason),
					usage: None,
				});
			}
		}
		if let Some(usage) = wire.usage {
			events.push(CanonicalEvent::MessageDelta {
				finish_reason: None,
				usage: Some(Usage { prompt_tokens: usage.prompt_tokens, completion_tokens: usage.completion_tokens, total_tokens: usage.total_tokens }),
			});
		}
		Ok(events)
	}

	fn encode_stream_chunk(&self, event: &CanonicalEvent, meta: &StreamMetadata) -> Result<Bytes, GatewayError> {
		let chunk = match event {
			CanonicalEvent::ContentDelta { index, text } => WireStreamChunk {
				id: meta.id.clone(),
				created: meta.created,
				model: meta.model.clone(),
				choices: vec![WireStreamChoice {
					index: *index,
					delta: WireDelta { role: None, content: Some(text.clone()), tool_calls: Vec::new() },
					finish_reason: None,
				}],
				usage: None,
			},
			CanonicalEvent::ContentBlockDelta { index, tool_call: Some(tc), .. } => WireStreamChunk {
				id: meta.id.clone(),
				created: meta.created,
				model: meta.model.clone(),
				choices: vec![WireStreamChoice {
					index: *index,
					delta: WireDelta {
						role: None,
						content: None,
						tool_calls: vec![WireToolCallDelta {
							index: tc.index,
							id: tc.id.clone(),
							function: Some(WireFunctionCallDelta { name: tc.name.clone(), arguments: tc.arguments_delta.clone() }),
						}],
					},
					finish_reason: None,
				}],
				usage: None,
			},
			CanonicalEvent::MessageDelta { finish_reason, usage } => WireStreamChunk {
				id: meta.id.clone(),
				created: meta.created,
				model: meta.model.clone(),
				choices: vec![WireStreamChoice {
					index: 0,
					delta: WireDelta::default(),
					finish_reason: finish_reason.map(|f| f.to_openai().to_string()),
				}],
				usage: usage.as_ref().map(|u| WireUsage { prompt_tokens: u.prompt_tokens, completion_tokens: u.completion_tokens, total_tokens: u.total_tokens }),
			},
			CanonicalEvent::Raw { bytes } => return Ok(bytes.clone()),
			_ => return Ok(Bytes::new()),
		};
		serde_json::to_vec(&chunk).map(Bytes::from).map_err(GatewayError::from_marshal)
	}
}
