//! OpenAI Responses codec (`POST /v1/responses`).
//!
//! The Responses wire format is event-sequenced rather than delta-only:
//! `response.created` opens the stream, `response.output_item.*` frames
//! carry per-item progress, and exactly one of `response.completed` /
//! `response.failed` / `response.incomplete` / `response.cancelled` / the
//! deprecated `response.done` closes it. A request with a single user
//! message and no system prompt collapses `input` to a bare string
//! (`CanonicalRequest::uses_simple_responses_input`).

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

pub struct ResponsesCodec;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireRequest {
	model: String,
	input: WireInput,
	#[serde(skip_serializing_if = "Option::is_none")]
	instructions: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	stream: Option<bool>,
	#[serde(skip_serializing_if = "Option::is_none")]
	max_output_tokens: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	temperature: Option<f64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	top_p: Option<f64>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	tools: Vec<WireToolDefinition>,
	#[serde(skip_serializing_if = "Option::is_none")]
	tool_choice: Option<serde_json::Value>,
	#[serde(skip_serializing_if = "Option::is_none")]
	previous_response_id: Option<String>,
	#[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
	metadata: BTreeMap<String, String>,
	#[serde(flatten, default)]
	rest: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum WireInput {
	Text(String),
	Items(Vec<WireInputItem>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireInputItem {
	Message {
		role: String,
		content: WireMessageContent,
	},
	FunctionCall {
		call_id: String,
		name: String,
		arguments: String,
	},
	FunctionCallOutput {
		call_id: String,
		output: String,
	},
	#[serde(other)]
	Unrecognized,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum WireMessageContent {
	Text(String),
	Parts(Vec<WireContentPart>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireContentPart {
	InputText { text: String },
	OutputText { text: String },
	#[serde(other)]
	Unrecognized,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireToolDefinition {
	r#type: String,
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
	created_at: i64,
	model: String,
	#[serde(default = "default_status")]
	status: String,
	output: Vec<WireOutputItem>,
	#[serde(default)]
	usage: Option<WireUsage>,
	#[serde(flatten, default)]
	rest: serde_json::Value,
}

fn default_object() -> String {
	"response".to_string()
}

fn default_status() -> String {
	"completed".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireOutputItem {
	Message {
		id: String,
		role: String,
		content: Vec<WireContentPart>,
	},
	FunctionCall {
		id: String,
		call_id: String,
		name: String,
		arguments: String,
	},
	#[serde(other)]
	Unrecognized,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireUsage {
	input_tokens: u64,
	output_tokens: u64,
	total_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireStreamEvent {
	#[serde(rename = "response.created")]
	ResponseCreated { response: WireResponse },
	#[serde(rename = "response.output_item.added")]
	OutputItemAdded { output_index: u32, item: WireOutputItem },
	#[serde(rename = "response.output_text.delta")]
	OutputTextDelta { output_index: u32, item_id: String, delta: String },
	#[serde(rename = "response.function_call_arguments.delta")]
	FunctionCallArgumentsDelta { output_index: u32, item_id: String, delta: String },
	#[serde(rename = "response.output_item.done")]
	OutputItemDone { output_index: u32, item: WireOutputItem },
	#[serde(rename = "response.completed")]
	ResponseCompleted { response: WireResponse },
	#[serde(rename = "response.incomplete")]
	ResponseIncomplete { response: WireResponse },
	#[serde(rename = "response.cancelled")]
	ResponseCancelled { response: WireResponse },
	/// Deprecated alias for `response.completed`, still emitted by some
	/// upstream deployments.
	#[serde(rename = "response.done")]
	ResponseDoneLegacy { response: WireResponse },
	#[serde(rename = "response.failed")]
	ResponseFailed { response: WireResponse },
	#[serde(other)]
	Unrecognized,
}

fn message_content_to_canonical(content: WireMessageContent) -> Option<MessageContent> {
	match content {
		WireMessageContent::Text(t) => Some(MessageContent::Text(t)),
		WireMessageContent::Parts(parts) => {
			let texts: Vec<ContentPart> = parts
				.into_iter()
				.filter_map(|p| match p {
					WireContentPart::InputText { text } | WireContentPart::OutputText { text } => Some(ContentPart::Text { text }),
					WireContentPart::Unrecognized => None,
				})
				.collect();
			if texts.is_empty() { None } else { Some(MessageContent::Parts(texts)) }
		}
	}
}

fn canonical_role(wire: &str) -> Result<Role, GatewayError> {
	match wire {
		"user" => Ok(Role::User),
		"assistant" => Ok(Role::Assistant),
		"system" | "developer" => Ok(Role::System),
		other => Err(GatewayError::invalid_request(format!("unknown role: {other}")).with_param("input.role")),
	}
}

impl Codec for ResponsesCodec {
	fn wire_format(&self) -> WireFormat {
		WireFormat::Responses
	}

	fn decode_request(&self, bytes: &[u8]) -> Result<CanonicalRequest, GatewayError> {
		let wire: WireRequest = serde_json::from_slice(bytes).map_err(|e| {
			GatewayError::invalid_request(format!("failed to parse request: {e}")).with_source_api("responses")
		})?;

		let mut messages = Vec::new();
		match wire.input {
			WireInput::Text(t) => messages.push(Message::text(Role::User, t)),
			WireInput::Items(items) => {
				for item in items {
					match item {
						WireInputItem::Message { role, content } => {
							messages.push(Message {
								role: canonical_role(&role)?,
								content: message_content_to_canonical(content),
								tool_calls: Vec::new(),
								tool_call_id: None,
								name: None,
							});
						}
						WireInputItem::FunctionCall { call_id, name, arguments } => {
							messages.push(Message {
								role: Role::Assistant,
								content: None,
								tool_calls: vec![ToolCall { id: call_id, name, arguments_json: arguments }],
								tool_call_id: None,
								name: None,
							});
						}
						WireInputItem::FunctionCallOutput { call_id, output } => {
							messages.push(Message {
								role: Role::Tool,
								content: Some(MessageContent::Text(output)),
								tool_calls: Vec::new(),
								tool_call_id: Some(call_id),
								name: None,
							});
						}
						WireInputItem::Unrecognized => {}
					}
				}
			}
		}

		Ok(CanonicalRequest {
			tenant_id: Default::default(),
			model: wire.model,
			source_api_type: WireFormat::Responses,
			raw_body: Some(Bytes::copy_from_slice(bytes)),
			user_agent: None,
			messages,
			system_prompt: None,
			instructions: wire.instructions,
			tools: wire
				.tools
				.into_iter()
				.map(|t| ToolDefinition { name: t.name, description: t.description, parameters: t.parameters })
				.collect(),
			tool_choice: wire.tool_choice.as_ref().and_then(|v| match v {
				serde_json::Value::String(s) => match s.as_str() {
					"auto" => Some(ToolChoice::Auto),
					"none" => Some(ToolChoice::None),
					"required" => Some(ToolChoice::Required),
					_ => None,
				},
				serde_json::Value::Object(_) => v.get("name").and_then(|n| n.as_str()).map(|n| ToolChoice::Named(n.to_string())),
				_ => None,
			}),
			response_format: None,
			stop: Vec::new(),
			sampling: Sampling {
				max_tokens: wire.max_output_tokens,
				temperature: wire.temperature,
				top_p: wire.top_p,
				stream: wire.stream.unwrap_or(false),
			},
			previous_response_id: wire.previous_response_id,
			metadata: wire.metadata,
			unmapped_fields: wire.rest,
		})
	}

	fn encode_request(&self, req: &CanonicalRequest) -> Result<Bytes, GatewayError> {
		let input = if req.uses_simple_responses_input() {
			WireInput::Text(req.messages[0].content.as_ref().and_then(MessageContent::as_text).unwrap_or_default().to_string())
		} else {
			let mut items = Vec::new();
			for m in &req.messages {
				if let Some(tool_call_id) = &m.tool_call_id {
					let output = m.content.as_ref().and_then(MessageContent::as_text).unwrap_or_default().to_string();
					items.push(WireInputItem::FunctionCallOutput { call_id: tool_call_id.clone(), output });
					continue;
				}
				for tc in &m.tool_calls {
					items.push(WireInputItem::FunctionCall { call_id: tc.id.clone(), name: tc.name.clone(), arguments: tc.arguments_json.clone() });
				}
				if let Some(content) = &m.content {
					let is_assistant = m.role == Role::Assistant;
					items.push(WireInputItem::Message {
						role: m.role.as_str().to_string(),
						content: match content {
							MessageContent::Text(t) => WireMessageContent::Text(t.clone()),
							MessageContent::Parts(parts) => WireMessageContent::Parts(
								parts
									.iter()
									.filter_map(|p| match p {
										ContentPart::Text { text } => Some(if is_assistant {
											WireContentPart::OutputText { text: text.clone() }
										} else {
											WireContentPart::InputText { text: text.clone() }
										}),
										ContentPart::Other { .. } => None,
									})
									.collect(),
							),
						},
					});
				}
			}
			WireInput::Items(items)
		};

		let wire = WireRequest {
			model: req.model.clone(),
			input,
			instructions: req.instructions.clone().or_else(|| req.system_prompt.clone()),
			stream: Some(req.sampling.stream),
			max_output_tokens: req.sampling.max_tokens,
			temperature: req.sampling.temperature,
			top_p: req.sampling.top_p,
			tools: req
				.tools
				.iter()
				.map(|t| WireToolDefinition { r#type: "function".to_string(), name: t.name.clone(), description: t.description.clone(), parameters: t.parameters.clone() })
				.collect(),
			tool_choice: req.tool_choice.as_ref().map(|tc| match tc {
				ToolChoice::Auto => serde_json::json!("auto"),
				ToolChoice::None => serde_json::json!("none"),
				ToolChoice::Required => serde_json::json!("required"),
				ToolChoice::Named(name) => serde_json::json!({"type": "function", "name": name}),
			}),
			previous_response_id: req.previous_response_id.clone(),
			metadata: req.metadata.clone(),
			rest: req.unmapped_fields.clone(),
		};
		serde_json::to_vec(&wire).map(Bytes::from).map_err(GatewayError::from_marshal)
	}

	fn decode_response(&self, bytes: &[u8]) -> Result<CanonicalResponse, GatewayError> {
		let wire: WireResponse = serde_json::from_slice(bytes).map_err(|e| {
			GatewayError::new(GatewayErrorKind::Server, format!("failed to parse response: {e}")).with_source_api("responses")
		})?;

		let mut content_parts = Vec::new();
		let mut tool_calls = Vec::new();
		for item in &wire.output {
			match item {
				WireOutputItem::Message { content, .. } => {
					for part in content {
						if let WireContentPart::OutputText { text } | WireContentPart::InputText { text } = part {
							content_parts.push(ContentPart::Text { text: text.clone() });
						}
					}
				}
				WireOutputItem::FunctionCall { call_id, name, arguments, .. } => {
					tool_calls.push(ToolCall { id: call_id.clone(), name: name.clone(), arguments_json: arguments.clone() });
				}
				WireOutputItem::Unrecognized => {}
			}
		}

		let message = Message {
			role: Role::Assistant,
			content: if content_parts.is_empty() { None } else { Some(MessageContent::Parts(content_parts)) },
			tool_calls,
			tool_call_id: None,
			name: None,
		};

		let finish_reason = match wire.status.as_str() {
			"completed" if !message.tool_calls.is_empty() => Some(FinishReason::ToolCalls),
			"completed" => Some(FinishReason::Stop),
			"incomplete" => Some(FinishReason::Length),
			"cancelled" => Some(FinishReason::Cancelled),
			_ => None,
		};

		Ok(CanonicalResponse {
			id: wire.id,
			created: wire.created_at,
			model: wire.model.clone(),
			provider_model: wire.model,
			choices: vec![Choice { index: 0, message, finish_reason }],
			usage: wire
				.usage
				.map(|u| Usage { prompt_tokens: u.input_tokens, completion_tokens: u.output_tokens, total_tokens: u.total_tokens })
				.unwrap_or_default(),
			raw_upstream_body: Some(Bytes::copy_from_slice(bytes)),
			raw_upstream_request_body: None,
			rate_limit: None,
		})
	}

	fn encode_response(&self, resp: &CanonicalResponse) -> Result<Bytes, GatewayError> {
		let choice = resp.choices.first();
		let mut output = Vec::new();
		if let Some(c) = choice {
			if let Some(content) = &c.message.content {
				let parts = match content {
					MessageContent::Text(t) => vec![WireContentPart::OutputText { text: t.clone() }],
					MessageContent::Parts(parts) => parts
						.iter()
						.filter_map(|p| match p {
							ContentPart::Text { text } => Some(WireContentPart::OutputText { text: text.clone() }),
							ContentPart::Other { .. } => None,
						})
						.collect(),
				};
				output.push(WireOutputItem::Message { id: gw_core::ids::response_id(), role: "assistant".to_string(), content: parts });
			}
			for tc in &c.message.tool_calls {
				output.push(WireOutputItem::FunctionCall { id: gw_core::ids::response_id(), call_id: tc.id.clone(), name: tc.name.clone(), arguments: tc.arguments_json.clone() });
			}
		}

		let status = match choice.and_then(|c| c.finish_reason) {
			Some(FinishReason::Length) => "incomplete",
			Some(FinishReason::Cancelled) => "cancelled",
			_ => "completed",
		};

		let wire = WireResponse {
			id: resp.id.clone(),
			object: default_object(),
			created_at: resp.created,
			model: resp.model.clone(),
			status: status.to_string(),
			output,
			usage: Some(WireUsage { input_tokens: resp.usage.prompt_tokens, output_tokens: resp.usage.completion_tokens, total_tokens: resp.usage.total_tokens }),
			rest: serde_json::Value::Null,
		};
		serde_json::to_vec(&wire).map(Bytes::from).map_err(GatewayError::from_marshal)
	}

	fn decode_stream_chunk(&self, bytes: &[u8]) -> Result<Vec<CanonicalEvent>, GatewayError> {
		let wire: WireStreamEvent = serde_json::from_slice(bytes).map_err(|e| {
			GatewayError::new(GatewayErrorKind::Server, format!("failed to parse stream event: {e}")).with_source_api("responses")
		})?;

		let event = match wire {
			WireStreamEvent::ResponseCreated { response } => Some(CanonicalEvent::ResponseCreated { id: response.id, model: response.model }),
			WireStreamEvent::OutputItemAdded { output_index, item } => Some(CanonicalEvent::ResponseOutputItemAdded {
				index: output_index,
				item_type: match item {
					WireOutputItem::Message { .. } => "message".to_string(),
					WireOutputItem::FunctionCall { .. } => "function_call".to_string(),
					WireOutputItem::Unrecognized => "unknown".to_string(),
				},
			}),
			WireStreamEvent::OutputTextDelta { output_index, delta, .. } => {
				Some(CanonicalEvent::ResponseOutputItemDelta { index: output_index, tool_call: None, text: Some(delta) })
			}
			WireStreamEvent::FunctionCallArgumentsDelta { output_index, item_id, delta } => Some(CanonicalEvent::ResponseOutputItemDelta {
				index: output_index,
				tool_call: Some(ToolCallChunk { index: output_index, id: Some(item_id), name: None, arguments_delta: Some(delta) }),
				text: None,
			}),
			WireStreamEvent::OutputItemDone { output_index, item } => Some(CanonicalEvent::ResponseOutputItemDone {
				index: output_index,
				tool_call: match item {
					WireOutputItem::FunctionCall { id, name, arguments, .. } => {
						Some(ToolCallChunk { index: output_index, id: Some(id), name: Some(name), arguments_delta: Some(arguments) })
					}
					_ => None,
				},
			}),
			WireStreamEvent::ResponseCompleted { response }
			| WireStreamEvent::ResponseIncomplete { response }
			| WireStreamEvent::ResponseCancelled { response }
			| WireStreamEvent::ResponseDoneLegacy { response } => {
				Some(CanonicalEvent::ResponseDone {
					id: response.id.clone(),
					model: response.model.clone(),
					provider_model: response.model,
					usage: response.usage.map(|u| Usage { prompt_tokens: u.input_tokens, completion_tokens: u.output_tokens, total_tokens: u.total_tokens }),
				})
			}
			WireStreamEvent::ResponseFailed { response } => Some(CanonicalEvent::ResponseFailed {
				id: response.id.clone(),
				error: GatewayError::new(GatewayErrorKind::Server, "upstream response failed").with_source_api("responses"),
			}),
			WireStreamEvent::Unrecognized => None,
		};
		Ok(event.into_iter().collect())
	}

	fn encode_stream_chunk(&self, event: &CanonicalEvent, meta: &StreamMetadata) -> Result<Bytes, GatewayError> {
		let wire = match event {
			CanonicalEvent::ResponseCreated { id, model } => WireStreamEvent::ResponseCreated {
				response: WireResponse { id: id.clone(), object: default_object(), created_at: meta.created, model: model.clone(), status: "in_progress".to_string(), output: Vec::new(), usage: None, rest: serde_json::Value::Null },
			},
			CanonicalEvent::ResponseOutputItemAdded { index, item_type } => WireStreamEvent::OutputItemAdded {
				output_index: *index,
				item: if item_type == "function_call" {
					WireOutputItem::FunctionCall { id: gw_core::ids::response_id(), call_id: String::new(), name: String::new(), arguments: String::new() }
				} else {
					WireOutputItem::Message { id: gw_core::ids::response_id(), role: "assistant".to_string(), content: Vec::new() }
				},
			},
			CanonicalEvent::ResponseOutputItemDelta { index, tool_call: Some(tc), .. } => WireStreamEvent::FunctionCallArgumentsDelta {
				output_index: *index,
				item_id: tc.id.clone().unwrap_or_default(),
				delta: tc.arguments_delta.clone().unwrap_or_default(),
			},
			CanonicalEvent::ResponseOutputItemDelta { index, text: Some(text), .. } => {
				WireStreamEvent::OutputTextDelta { output_index: *index, item_id: meta.id.clone(), delta: text.clone() }
			}
			CanonicalEvent::ResponseOutputItemDone { index, tool_call } => WireStreamEvent::OutputItemDone {
				output_index: *index,
				item: match tool_call {
					Some(tc) => WireOutputItem::FunctionCall {
						id: tc.id.clone().unwrap_or_default(),
						call_id: tc.id.clone().unwrap_or_default(),
						name: tc.name.clone().unwrap_or_default(),
						arguments: tc.arguments_delta.clone().unwrap_or_default(),
					},
					None => WireOutputItem::Message { id: meta.id.clone(), role: "assistant".to_string(), content: Vec::new() },
				},
			},
			CanonicalEvent::ResponseDone { id, model, usage, .. } => WireStreamEvent::ResponseCompleted {
				response: WireResponse {
					id: id.clone(),
					object: default_object(),
					created_at: meta.created,
					model: model.clone(),
					status: "completed".to_string(),
					output: Vec::new(),
					usage: usage.as_ref().map(|u| WireUsage { input_tokens: u.prompt_tokens, output_tokens: u.completion_tokens, total_tokens: u.total_tokens }),
					rest: serde_json::Value::Null,
				},
			},
			CanonicalEvent::ResponseFailed { id, .. } => WireStreamEvent::ResponseFailed {
				response: WireResponse { id: id.clone(), object: default_object(), created_at: meta.created, model: meta.model.clone(), status: "failed".to_string(), output: Vec::new(), usage: None, rest: serde_json::Value::Null },
			},
			CanonicalEvent::Raw { bytes } => return Ok(bytes.clone()),
			_ => return Ok(Bytes::new()),
		};
		serde_json::to_vec(&wire).map(Bytes::from).map_err(GatewayError::from_marshal)
	}
}
