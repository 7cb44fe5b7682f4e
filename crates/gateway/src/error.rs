//! The canonical error kind set, shared by every codec, the router, the
//! provider adapters, and the pipeline. Wire-level codecs translate
//! provider-specific errors into this shape; frontdoors translate it back
//! out into the caller's wire format.

use gw_core::Strng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayErrorKind {
	InvalidRequest,
	Authentication,
	Permission,
	NotFound,
	RateLimit,
	Overloaded,
	Server,
	ContextLength,
	MaxTokens,
	OutputTruncated,
}

impl GatewayErrorKind {
	/// The HTTP status a frontdoor should map this to.
	pub fn http_status(&self) -> u16 {
		match self {
			GatewayErrorKind::InvalidRequest => 400,
			GatewayErrorKind::Authentication => 401,
			GatewayErrorKind::Permission => 403,
			GatewayErrorKind::NotFound => 404,
			GatewayErrorKind::RateLimit => 429,
			GatewayErrorKind::Overloaded => 503,
			GatewayErrorKind::Server => 500,
			GatewayErrorKind::ContextLength => 400,
			GatewayErrorKind::MaxTokens => 200,
			GatewayErrorKind::OutputTruncated => 200,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct GatewayError {
	pub kind: GatewayErrorKind,
	pub message: String,
	/// Fine-grained code, e.g. `context_length_exceeded`, `invalid_api_key`.
	pub code: Option<Strng>,
	/// The offending input field, when known.
	pub param: Option<Strng>,
	/// Which wire format / subsystem this error originated from, for audit.
	pub source_api: Option<Strng>,
}

impl GatewayError {
	pub fn new(kind: GatewayErrorKind, message: impl Into<String>) -> Self {
		GatewayError {
			kind,
			message: message.into(),
			code: None,
			param: None,
			source_api: None,
		}
	}

	pub fn with_code(mut self, code: impl Into<Strng>) -> Self {
		self.code = Some(code.into());
		self
	}

	pub fn with_param(mut self, param: impl Into<Strng>) -> Self {
		self.param = Some(param.into());
		self
	}

	pub fn with_source_api(mut self, source_api: impl Into<Strng>) -> Self {
		self.source_api = Some(source_api.into());
		self
	}

	pub fn invalid_request(message: impl Into<String>) -> Self {
		Self::new(GatewayErrorKind::InvalidRequest, message)
	}

	pub fn not_found(message: impl Into<String>) -> Self {
		Self::new(GatewayErrorKind::NotFound, message)
	}

	pub fn server(message: impl Into<String>) -> Self {
		Self::new(GatewayErrorKind::Server, message)
	}

	/// Wraps a `serde_json` encode failure — only reachable if a codec builds
	/// a wire struct that can't round-trip, which would be a codec bug.
	pub fn from_marshal(e: serde_json::Error) -> Self {
		Self::new(GatewayErrorKind::Server, format!("failed to marshal response: {e}"))
	}

	/// Classifies an upstream error message against known patterns. Used by
	/// codecs that only get a free-text message from the provider.
	pub fn classify_upstream_message(status: u16, message: &str) -> Self {
		let lower = message.to_ascii_lowercase();
		let kind = if lower.contains("context length") || lower.contains("context_length") {
			GatewayErrorKind::ContextLength
		} else if lower.contains("maximum context") || lower.contains("max_tokens") {
			GatewayErrorKind::MaxTokens
		} else {
			match status {
				400 => GatewayErrorKind::InvalidRequest,
				401 => GatewayErrorKind::Authentication,
				403 => GatewayErrorKind::Permission,
				404 => GatewayErrorKind::NotFound,
				429 => GatewayErrorKind::RateLimit,
				503 => GatewayErrorKind::Overloaded,
				_ => GatewayErrorKind::Server,
			}
		};
		Self::new(kind, message)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn classifies_context_length_message() {
		let err = GatewayError::classify_upstream_message(400, "This model's maximum context length is 8192 tokens");
		assert_eq!(err.kind, GatewayErrorKind::ContextLength);
	}

	#[test]
	fn classifies_max_tokens_message() {
		let err = GatewayError::classify_upstream_message(400, "Reduce your max_tokens parameter and try again");
		assert_eq!(err.kind, GatewayErrorKind::MaxTokens);
	}

	#[test]
	fn classifies_by_status_when_unmatched() {
		let err = GatewayError::classify_upstream_message(429, "slow down");
		assert_eq!(err.kind, GatewayErrorKind::RateLimit);
	}

	#[test]
	fn http_status_mapping() {
		assert_eq!(GatewayErrorKind::NotFound.http_status(), 404);
		assert_eq!(GatewayErrorKind::Overloaded.http_status(), 503);
	}
}
