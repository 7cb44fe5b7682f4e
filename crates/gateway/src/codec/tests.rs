use std::collections::BTreeMap;

use bytes::Bytes;

use crate::canonical::{CanonicalRequest, Message, Role, Sampling, WireFormat};
use crate::codec::{for_format, passthrough_eligible};

fn openai_chat_body() -> serde_json::Value {
	serde_json::json!({
		"model": "gpt-4o",
		"messages": [
			{"role": "system", "content": "be terse"},
			{"role": "user", "content": "hello there"}
		],
		"temperature": 0.2,
		"some_future_field": "keep me"
	})
}

fn anthropic_body() -> serde_json::Value {
	serde_json::json!({
		"model": "claude-3-5-sonnet-20241022",
		"max_tokens": 512,
		"system": "be terse",
		"messages": [
			{"role": "user", "content": "hello there"}
		]
	})
}

#[test]
fn openai_decode_preserves_unmapped_fields() {
	let codec = for_format(WireFormat::Openai);
	let body = serde_json::to_vec(&openai_chat_body()).unwrap();
	let req = codec.decode_request(&body).unwrap();
	assert_eq!(req.model, "gpt-4o");
	assert_eq!(req.messages.len(), 1, "system message becomes system_prompt, not a canonical message");
	assert!(req.unmapped_fields.get("some_future_field").is_some());
}

#[test]
fn anthropic_decode_splits_system_from_messages() {
	let codec = for_format(WireFormat::Anthropic);
	let body = serde_json::to_vec(&anthropic_body()).unwrap();
	let req = codec.decode_request(&body).unwrap();
	assert_eq!(req.system_prompt.as_deref(), Some("be terse"));
	assert_eq!(req.messages.len(), 1);
	assert_eq!(req.messages[0].role, Role::User);
}

#[test]
fn openai_request_round_trips_through_canonical() {
	let codec = for_format(WireFormat::Openai);
	let body = serde_json::to_vec(&openai_chat_body()).unwrap();
	let req = codec.decode_request(&body).unwrap();
	let encoded = codec.encode_request(&req).unwrap();
	let reparsed: serde_json::Value = serde_json::from_slice(&encoded).unwrap();
	assert_eq!(reparsed["model"], "gpt-4o");
	assert_eq!(reparsed["messages"][0]["role"], "system");
	assert_eq!(reparsed["messages"][1]["content"], "hello there");
}

#[test]
fn anthropic_response_encodes_text_block() {
	use crate::canonical::{Choice, CanonicalResponse, FinishReason, MessageContent, Usage};

	let codec = for_format(WireFormat::Anthropic);
	let resp = CanonicalResponse {
		id: "int_abc".to_string(),
		created: 0,
		model: "claude-3-5-sonnet-20241022".to_string(),
		provider_model: "claude-3-5-sonnet-20241022".to_string(),
		choices: vec![Choice {
			index: 0,
			message: Message {
				role: Role::Assistant,
				content: Some(MessageContent::Text("hi back".to_string())),
				tool_calls: Vec::new(),
				tool_call_id: None,
				name: None,
			},
			finish_reason: Some(FinishReason::Stop),
		}],
		usage: Usage { prompt_tokens: 5, completion_tokens: 3, total_tokens: 8 },
		raw_upstream_body: None,
		raw_upstream_request_body: None,
		rate_limit: None,
	};
	let encoded = codec.encode_response(&resp).unwrap();
	let reparsed: serde_json::Value = serde_json::from_slice(&encoded).unwrap();
	assert_eq!(reparsed["content"][0]["text"], "hi back");
	assert_eq!(reparsed["stop_reason"], "end_turn");
}

#[test]
fn responses_single_user_message_collapses_to_simple_string_input() {
	let codec = for_format(WireFormat::Responses);
	let req = CanonicalRequest {
		tenant_id: Default::default(),
		model: "gpt-4o".to_string(),
		source_api_type: WireFormat::Responses,
		raw_body: None,
		user_agent: None,
		messages: vec![Message::text(Role::User, "what is 2+2")],
		system_prompt: None,
		instructions: None,
		tools: Vec::new(),
		tool_choice: None,
		response_format: None,
		stop: Vec::new(),
		sampling: Sampling::default(),
		previous_response_id: None,
		metadata: BTreeMap::new(),
		unmapped_fields: serde_json::Value::Null,
	};
	assert!(req.uses_simple_responses_input());
	let encoded = codec.encode_request(&req).unwrap();
	let reparsed: serde_json::Value = serde_json::from_slice(&encoded).unwrap();
	assert_eq!(reparsed["input"], "what is 2+2");
}

#[test]
fn responses_decode_stream_event_produces_created() {
	let codec = for_format(WireFormat::Responses);
	let event_bytes = Bytes::from(
		serde_json::to_vec(&serde_json::json!({
			"type": "response.created",
			"response": {
				"id": "resp_1",
				"object": "response",
				"created_at": 1,
				"model": "gpt-4o",
				"status": "in_progress",
				"output": []
			}
		}))
		.unwrap(),
	);
	let events = codec.decode_stream_chunk(&event_bytes).unwrap();
	assert_eq!(events.len(), 1);
}

#[test]
fn passthrough_requires_matching_formats_and_no_mutation() {
	assert!(passthrough_eligible(WireFormat::Openai, WireFormat::Openai, false));
	assert!(!passthrough_eligible(WireFormat::Openai, WireFormat::Openai, true));
	assert!(!passthrough_eligible(WireFormat::Openai, WireFormat::Anthropic, false));
}
