//! HTTP webhook pipeline stage: POSTs `StageInput` as JSON, expects a
//! `StageOutput` back. Retries transport errors and 5xx responses up to
//! `retries` times; on exhaustion falls back to `on_error`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::sleep;

use crate::canonical::WireFormat;
use crate::error::GatewayError;
use crate::pipeline::{Phase, Stage, StageInput, StageOutput};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
	Allow,
	Deny,
}

impl Default for OnError {
	fn default() -> Self {
		OnError::Deny
	}
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
	pub name: String,
	pub phase: Phase,
	pub order: i64,
	pub url: String,
	pub timeout: Duration,
	pub retries: u32,
	pub on_error: OnError,
	pub squelch: bool,
	pub headers: Vec<(String, String)>,
}

pub struct WebhookStage {
	config: WebhookConfig,
	client: reqwest::Client,
}

impl WebhookStage {
	pub fn new(config: WebhookConfig) -> Self {
		let client = reqwest::Client::builder()
			.timeout(config.timeout)
			.build()
			.expect("reqwest client builder with only timeout/defaults cannot fail");
		WebhookStage { config, client }
	}

	async fn post_once(&self, input: &StageInput) -> Result<StageOutput, WebhookCallError> {
		let resp = self
			.client
			.post(&self.config.url)
			.header("content-type", "application/json")
			.headers(self.extra_headers())
			.json(input)
			.send()
			.await
			.map_err(WebhookCallError::Transport)?;

		let status = resp.status();
		if status.is_server_error() {
			return Err(WebhookCallError::ServerStatus(status.as_u16()));
		}
		if !status.is_success() {
			return Err(WebhookCallError::ClientStatus(status.as_u16()));
		}

		resp.json::<StageOutput>().await.map_err(WebhookCallError::Decode)
	}

	fn extra_headers(&self) -> http::HeaderMap {
		let mut map = http::HeaderMap::new();
		for (name, value) in &self.config.headers {
			if let (Ok(name), Ok(value)) = (http::HeaderName::try_from(name.as_str()), http::HeaderValue::try_from(value.as_str())) {
				map.insert(name, value);
			}
		}
		map
	}

	fn fallback(&self, reason: String) -> StageOutput {
		match self.config.on_error {
			OnError::Allow => StageOutput::allow(),
			OnError::Deny => StageOutput::deny(reason),
		}
	}
}

enum WebhookCallError {
	Transport(reqwest::Error),
	ServerStatus(u16),
	ClientStatus(u16),
	Decode(reqwest::Error),
}

impl WebhookCallError {
	fn is_retryable(&self) -> bool {
		matches!(self, WebhookCallError::Transport(_) | WebhookCallError::ServerStatus(_))
	}
}

impl std::fmt::Display for WebhookCallError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			WebhookCallError::Transport(e) => write!(f, "transport error: {e}"),
			WebhookCallError::ServerStatus(s) => write!(f, "upstream returned {s}"),
			WebhookCallError::ClientStatus(s) => write!(f, "upstream returned {s}"),
			WebhookCallError::Decode(e) => write!(f, "failed to decode stage output: {e}"),
		}
	}
}

#[async_trait::async_trait]
impl Stage for WebhookStage {
	fn name(&self) -> &str {
		&self.config.name
	}

	fn phase(&self) -> Phase {
		self.config.phase
	}

	fn order(&self) -> i64 {
		self.config.order
	}

	fn squelch_on_deny(&self) -> bool {
		self.config.squelch
	}

	async fn run(&self, input: StageInput) -> Result<StageOutput, GatewayError> {
		let mut attempt = 0;
		loop {
			match self.post_once(&input).await {
				Ok(output) => return Ok(output),
				Err(e) if attempt < self.config.retries && e.is_retryable() => {
					attempt += 1;
					sleep(Duration::from_millis(100 * attempt as u64)).await;
				}
				Err(e) => return Ok(self.fallback(e.to_string())),
			}
		}
	}
}

/// Error-payload shape frontdoors render a `Denied` into, keyed per wire
/// format.
pub fn render_denied(format: WireFormat, reason: &str) -> serde_json::Value {
	match format {
		WireFormat::Anthropic => serde_json::json!({"type": "error", "error": {"type": "invalid_request_error", "message": reason}}),
		WireFormat::Openai | WireFormat::Responses => serde_json::json!({"error": {"type": "invalid_request_error", "message": reason, "code": "denied_by_pipeline", "param": serde_json::Value::Null}}),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn on_error_defaults_to_deny() {
		assert_eq!(OnError::default(), OnError::Deny);
	}

	#[test]
	fn denied_payload_matches_anthropic_convention() {
		let payload = render_denied(WireFormat::Anthropic, "blocked by policy");
		assert_eq!(payload["type"], "error");
		assert_eq!(payload["error"]["message"], "blocked by policy");
	}
}
