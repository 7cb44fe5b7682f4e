//! Pre/post pipeline executor: stages run strictly in ascending `order`
//! within their phase, never in parallel — deny/mutate semantics require a
//! total order.

pub mod webhook;

use serde::{Deserialize, Serialize};

use crate::canonical::{CanonicalRequest, CanonicalResponse};
use crate::error::GatewayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
	Pre,
	Post,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageInput {
	pub phase: Phase,
	pub request: CanonicalRequest,
	pub response: Option<CanonicalResponse>,
	pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
	Allow,
	Deny,
	Mutate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageOutput {
	pub action: Action,
	pub request: Option<CanonicalRequest>,
	pub response: Option<CanonicalResponse>,
	pub deny_reason: Option<String>,
}

impl StageOutput {
	pub fn allow() -> Self {
		StageOutput { action: Action::Allow, request: None, response: None, deny_reason: None }
	}

	pub fn deny(reason: impl Into<String>) -> Self {
		StageOutput { action: Action::Deny, request: None, response: None, deny_reason: Some(reason.into()) }
	}

	pub fn mutate_request(request: CanonicalRequest) -> Self {
		StageOutput { action: Action::Mutate, request: Some(request), response: None, deny_reason: None }
	}

	pub fn mutate_response(response: CanonicalResponse) -> Self {
		StageOutput { action: Action::Mutate, request: None, response: Some(response), deny_reason: None }
	}
}

/// A single pipeline step. `order` determines execution order within a
/// phase; implementations (e.g. `webhook::WebhookStage`) carry whatever
/// configuration they need to produce a `StageOutput`.
#[async_trait::async_trait]
pub trait Stage: Send + Sync {
	fn name(&self) -> &str;
	fn phase(&self) -> Phase;
	fn order(&self) -> i64;
	/// Whether a denied post-stage suppresses the upstream response in
	/// favour of the stage's own replacement ("squelch").
	fn squelch_on_deny(&self) -> bool {
		false
	}

	async fn run(&self, input: StageInput) -> Result<StageOutput, GatewayError>;
}

#[derive(Debug, Clone)]
pub struct Denied {
	pub stage_name: String,
	pub reason: String,
}

impl Denied {
	pub fn into_error(self) -> GatewayError {
		GatewayError::invalid_request(self.reason).with_code(format!("denied_by_{}", self.stage_name))
	}
}

pub struct Pipeline {
	stages: Vec<Box<dyn Stage>>,
}

impl Pipeline {
	pub fn new(mut stages: Vec<Box<dyn Stage>>) -> Self {
		stages.sort_by_key(|s| s.order());
		Pipeline { stages }
	}

	fn stages_for(&self, phase: Phase) -> impl Iterator<Item = &Box<dyn Stage>> {
		self.stages.iter().filter(move |s| s.phase() == phase)
	}

	/// Returns the (possibly mutated) request alongside whether any stage
	/// actually returned `mutate` — callers use this to decide whether
	/// pass-through is still legal (§4.1: pass-through requires that no
	/// transformation rule altered the canonical request).
	pub async fn run_pre(&self, mut request: CanonicalRequest, metadata: &serde_json::Value) -> Result<(CanonicalRequest, bool), Denied> {
		let mut mutated = false;
		for stage in self.stages_for(Phase::Pre) {
			let input = StageInput { phase: Phase::Pre, request: request.clone(), response: None, metadata: metadata.clone() };
			let output = match stage.run(input).await {
				Ok(output) => output,
				Err(e) => return Err(Denied { stage_name: stage.name().to_string(), reason: e.message }),
			};
			match output.action {
				Action::Allow => {}
				Action::Mutate => {
					if let Some(new_request) = output.request {
						request = new_request;
						mutated = true;
					}
				}
				Action::Deny => {
					return Err(Denied { stage_name: stage.name().to_string(), reason: output.deny_reason.unwrap_or_default() });
				}
			}
		}
		Ok((request, mutated))
	}

	/// Returns `Ok(Some((response, mutated)))` normally, or `Ok(None)` when a
	/// post stage both denies and is configured to squelch — in that case
	/// the caller must suppress the upstream response entirely. `mutated`
	/// tells the caller whether any stage replaced the response, which
	/// governs whether a pass-through reply can still use the provider's raw
	/// bytes or must be re-encoded from the (possibly stage-altered)
	/// canonical response.
	pub async fn run_post(
		&self,
		request: &CanonicalRequest,
		mut response: CanonicalResponse,
		metadata: &serde_json::Value,
	) -> Result<Option<(CanonicalResponse, bool)>, Denied> {
		let mut mutated = false;
		for stage in self.stages_for(Phase::Post) {
			let input = StageInput { phase: Phase::Post, request: request.clone(), response: Some(response.clone()), metadata: metadata.clone() };
			let output = match stage.run(input).await {
				Ok(output) => output,
				Err(e) => return Err(Denied { stage_name: stage.name().to_string(), reason: e.message }),
			};
			match output.action {
				Action::Allow => {}
				Action::Mutate => {
					if let Some(new_response) = output.response {
						response = new_response;
						mutated = true;
					}
				}
				Action::Deny => {
					if stage.squelch_on_deny() {
						return Ok(output.response.map(|r| (r, true)));
					}
					return Err(Denied { stage_name: stage.name().to_string(), reason: output.deny_reason.unwrap_or_default() });
				}
			}
		}
		Ok(Some((response, mutated)))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::canonical::{Message, Role, Sampling, WireFormat};
	use std::collections::BTreeMap;
	use std::sync::Arc;

	fn base_request() -> CanonicalRequest {
		CanonicalRequest {
			tenant_id: Default::default(),
			model: "gpt-4o".to_string(),
			source_api_type: WireFormat::Openai,
			raw_body: None,
			user_agent: None,
			messages: vec![Message::text(Role::User, "hi")],
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
		}
	}

	struct RecordingStage {
		name: String,
		order: i64,
		log: Arc<parking_lot::Mutex<Vec<String>>>,
	}

	#[async_trait::async_trait]
	impl Stage for RecordingStage {
		fn name(&self) -> &str {
			&self.name
		}
		fn phase(&self) -> Phase {
			Phase::Pre
		}
		fn order(&self) -> i64 {
			self.order
		}
		async fn run(&self, input: StageInput) -> Result<StageOutput, GatewayError> {
			self.log.lock().push(self.name.clone());
			assert!(input.response.is_none(), "pre-stages must not observe a response");
			Ok(StageOutput::allow())
		}
	}

	struct DenyStage {
		order: i64,
	}

	#[async_trait::async_trait]
	impl Stage for DenyStage {
		fn name(&self) -> &str {
			"deny"
		}
		fn phase(&self) -> Phase {
			Phase::Pre
		}
		fn order(&self) -> i64 {
			self.order
		}
		async fn run(&self, _input: StageInput) -> Result<StageOutput, GatewayError> {
			Ok(StageOutput::deny("blocked by policy"))
		}
	}

	#[tokio::test]
	async fn stages_execute_in_ascending_order_regardless_of_registration_order() {
		let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
		let pipeline = Pipeline::new(vec![
			Box::new(RecordingStage { name: "c".to_string(), order: 3, log: log.clone() }),
			Box::new(RecordingStage { name: "a".to_string(), order: 1, log: log.clone() }),
			Box::new(RecordingStage { name: "b".to_string(), order: 2, log: log.clone() }),
		]);
		pipeline.run_pre(base_request(), &serde_json::Value::Null).await.unwrap();
		assert_eq!(*log.lock(), vec!["a".to_string(), "b".to_string(), "c".to_string()]);
	}

	#[tokio::test]
	async fn pre_deny_aborts_before_later_stages_run() {
		let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
		let pipeline = Pipeline::new(vec![
			Box::new(DenyStage { order: 1 }),
			Box::new(RecordingStage { name: "never".to_string(), order: 2, log: log.clone() }),
		]);
		let err = pipeline.run_pre(base_request(), &serde_json::Value::Null).await.unwrap_err();
		assert_eq!(err.reason, "blocked by policy");
		assert!(log.lock().is_empty());
	}
}
