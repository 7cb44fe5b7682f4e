//! Structural divergence detection: compares *shape*, never text.

use serde_json::Value;

use crate::canonical::{CanonicalResponse, ContentPart, MessageContent};
use crate::store::{Divergence, DivergenceKind};

fn json_type_name(v: &Value) -> &'static str {
	match v {
		Value::Null => "null",
		Value::Bool(_) => "boolean",
		Value::Number(_) => "number",
		Value::String(_) => "string",
		Value::Array(_) => "array",
		Value::Object(_) => "object",
	}
}

fn content_shape(content: &Option<MessageContent>) -> (bool, Option<(&'static str, usize, Vec<&str>)>) {
	match content {
		None => (false, None),
		Some(MessageContent::Text(_)) => (true, Some(("text", 1, vec!["text"]))),
		Some(MessageContent::Parts(parts)) => {
			let kinds = parts.iter().map(ContentPart::kind).collect::<Vec<_>>();
			(!parts.is_empty(), Some(("parts", parts.len(), kinds)))
		}
	}
}

/// Compares choice counts, per-choice message shape and finish reason
/// (index 0 only), tool-call counts/names, and tool-call argument *keys*
/// (presence + JSON type, never values).
pub fn detect(primary: &CanonicalResponse, shadow: &CanonicalResponse) -> Vec<Divergence> {
	let mut divergences = Vec::new();

	if primary.choices.len() != shadow.choices.len() {
		divergences.push(Divergence {
			kind: DivergenceKind::ArrayLength,
			path: "choices".to_string(),
			description: format!("primary has {} choice(s), shadow has {}", primary.choices.len(), shadow.choices.len()),
			primary_value: Some(Value::from(primary.choices.len())),
			shadow_value: Some(Value::from(shadow.choices.len())),
		});
	}

	for (index, (p, s)) in primary.choices.iter().zip(shadow.choices.iter()).enumerate() {
		let path_prefix = format!("choices[{index}]");

		if p.message.role != s.message.role {
			divergences.push(Divergence {
				kind: DivergenceKind::TypeMismatch,
				path: format!("{path_prefix}.message.role"),
				description: "message role differs".to_string(),
				primary_value: Some(serde_json::to_value(p.message.role).unwrap_or(Value::Null)),
				shadow_value: Some(serde_json::to_value(s.message.role).unwrap_or(Value::Null)),
			});
		}

		let (p_has_content, p_shape) = content_shape(&p.message.content);
		let (s_has_content, s_shape) = content_shape(&s.message.content);
		if p_has_content != s_has_content {
			divergences.push(Divergence {
				kind: if p_has_content { DivergenceKind::MissingField } else { DivergenceKind::ExtraField },
				path: format!("{path_prefix}.message.content"),
				description: "content presence differs".to_string(),
				primary_value: Some(Value::Bool(p_has_content)),
				shadow_value: Some(Value::Bool(s_has_content)),
			});
		} else if let (Some((p_kind, p_len, p_part_kinds)), Some((s_kind, s_len, s_part_kinds))) = (p_shape, s_shape) {
			if p_kind != s_kind || p_len != s_len || p_part_kinds != s_part_kinds {
				divergences.push(Divergence {
					kind: DivergenceKind::TypeMismatch,
					path: format!("{path_prefix}.message.content"),
					description: "rich-content structure differs".to_string(),
					primary_value: Some(serde_json::json!({"kind": p_kind, "len": p_len, "parts": p_part_kinds})),
					shadow_value: Some(serde_json::json!({"kind": s_kind, "len": s_len, "parts": s_part_kinds})),
				});
			}
		}

		if index == 0 && p.finish_reason != s.finish_reason {
			divergences.push(Divergence {
				kind: DivergenceKind::TypeMismatch,
				path: format!("{path_prefix}.finish_reason"),
				description: "finish reason differs".to_string(),
				primary_value: Some(serde_json::to_value(p.finish_reason).unwrap_or(Value::Null)),
				shadow_value: Some(serde_json::to_value(s.finish_reason).unwrap_or(Value::Null)),
			});
		}

		if p.message.tool_calls.len() != s.message.tool_calls.len() {
			divergences.push(Divergence {
				kind: DivergenceKind::ArrayLength,
				path: format!("{path_prefix}.message.tool_calls"),
				description: "tool-call count differs".to_string(),
				primary_value: Some(Value::from(p.message.tool_calls.len())),
				shadow_value: Some(Value::from(s.message.tool_calls.len())),
			});
		}

		for (call_index, (p_call, s_call)) in p.message.tool_calls.iter().zip(s.message.tool_calls.iter()).enumerate() {
			let call_path = format!("{path_prefix}.message.tool_calls[{call_index}]");
			if p_call.name != s_call.name {
				divergences.push(Divergence {
					kind: DivergenceKind::TypeMismatch,
					path: format!("{call_path}.name"),
					description: "tool-call name differs".to_string(),
					primary_value: Some(Value::String(p_call.name.clone())),
					shadow_value: Some(Value::String(s_call.name.clone())),
				});
			}
			divergences.extend(compare_argument_keys(&call_path, &p_call.arguments_json, &s_call.arguments_json));
		}
	}

	divergences
}

/// Compares tool-call argument *keys* only — presence and JSON type of each
/// key, never the values themselves.
fn compare_argument_keys(call_path: &str, primary_json: &str, shadow_json: &str) -> Vec<Divergence> {
	let primary: Value = serde_json::from_str(primary_json).unwrap_or(Value::Null);
	let shadow: Value = serde_json::from_str(shadow_json).unwrap_or(Value::Null);
	let (Value::Object(p_map), Value::Object(s_map)) = (&primary, &shadow) else {
		return Vec::new();
	};

	let mut divergences = Vec::new();
	for (key, p_value) in p_map {
		let path = format!("{call_path}.arguments.{key}");
		match s_map.get(key) {
			None => divergences.push(Divergence {
				kind: DivergenceKind::MissingField,
				path,
				description: format!("shadow is missing argument key {key:?}"),
				primary_value: Some(Value::String(json_type_name(p_value).to_string())),
				shadow_value: None,
			}),
			Some(s_value) if json_type_name(p_value) != json_type_name(s_value) => divergences.push(Divergence {
				kind: DivergenceKind::TypeMismatch,
				path,
				description: format!("argument key {key:?} has a different JSON type"),
				primary_value: Some(Value::String(json_type_name(p_value).to_string())),
				shadow_value: Some(Value::String(json_type_name(s_value).to_string())),
			}),
			_ => {}
		}
	}
	for key in s_map.keys() {
		if !p_map.contains_key(key) {
			divergences.push(Divergence {
				kind: DivergenceKind::ExtraField,
				path: format!("{call_path}.arguments.{key}"),
				description: format!("shadow has extra argument key {key:?}"),
				primary_value: None,
				shadow_value: Some(Value::String(json_type_name(&s_map[key]).to_string())),
			});
		}
	}
	divergences
}

pub fn has_structural_divergence(divergences: &[Divergence]) -> bool {
	!divergences.is_empty()
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::canonical::{Choice, FinishReason, Message, Role, ToolCall, Usage};

	fn response_with_choices(choices: Vec<Choice>) -> CanonicalResponse {
		CanonicalResponse {
			id: "resp_1".to_string(),
			created: 0,
			model: "gpt-4o".to_string(),
			provider_model: "gpt-4o".to_string(),
			choices,
			usage: Usage::default(),
			raw_upstream_body: None,
			raw_upstream_request_body: None,
			rate_limit: None,
		}
	}

	fn text_choice(text: &str, finish_reason: FinishReason) -> Choice {
		Choice { index: 0, message: Message::text(Role::Assistant, text), finish_reason: Some(finish_reason) }
	}

	#[test]
	fn identical_structure_differing_text_yields_no_divergence() {
		let primary = response_with_choices(vec![text_choice("hello", FinishReason::Stop)]);
		let shadow = response_with_choices(vec![text_choice("goodbye", FinishReason::Stop)]);
		assert!(detect(&primary, &shadow).is_empty());
	}

	#[test]
	fn differing_choice_counts_yield_array_length_divergence_on_choices() {
		let primary = response_with_choices(vec![text_choice("hello", FinishReason::Stop)]);
		let shadow = response_with_choices(vec![text_choice("hello", FinishReason::Stop), text_choice("again", FinishReason::Stop)]);
		let divergences = detect(&primary, &shadow);
		assert!(divergences.iter().any(|d| d.kind == DivergenceKind::ArrayLength && d.path == "choices"));
		assert!(has_structural_divergence(&divergences));
	}

	#[test]
	fn differing_tool_call_argument_keys_yield_missing_and_extra_field() {
		let mut primary_choice = text_choice("", FinishReason::ToolCalls);
		primary_choice.message.content = None;
		primary_choice.message.tool_calls = vec![ToolCall { id: "call_1".to_string(), name: "lookup".to_string(), arguments_json: r#"{"query":"x","limit":5}"#.to_string() }];

		let mut shadow_choice = text_choice("", FinishReason::ToolCalls);
		shadow_choice.message.content = None;
		shadow_choice.message.tool_calls = vec![ToolCall { id: "call_1".to_string(), name: "lookup".to_string(), arguments_json: r#"{"query":"y","page":2}"#.to_string() }];

		let primary = response_with_choices(vec![primary_choice]);
		let shadow = response_with_choices(vec![shadow_choice]);
		let divergences = detect(&primary, &shadow);

		assert!(divergences.iter().any(|d| d.kind == DivergenceKind::MissingField && d.path.ends_with("arguments.limit")));
		assert!(divergences.iter().any(|d| d.kind == DivergenceKind::ExtraField && d.path.ends_with("arguments.page")));
	}
}
