//! The codec layer: bidirectional translation between each wire format and
//! the canonical form, including the pass-through optimisation when
//! frontdoor and provider share a format.

pub mod anthropic;
pub mod openai;
pub mod responses;

#[cfg(test)]
mod tests;

use bytes::Bytes;

use crate::canonical::{CanonicalEvent, CanonicalRequest, CanonicalResponse, StreamMetadata, WireFormat};
use crate::error::GatewayError;

/// Every wire format implements this uniformly; the router/pipeline/shadow
/// engine never see anything but the canonical types this trait produces
/// and consumes.
pub trait Codec: Send + Sync {
	fn wire_format(&self) -> WireFormat;

	fn decode_request(&self, bytes: &[u8]) -> Result<CanonicalRequest, GatewayError>;
	fn encode_request(&self, req: &CanonicalRequest) -> Result<Bytes, GatewayError>;

	fn decode_response(&self, bytes: &[u8]) -> Result<CanonicalResponse, GatewayError>;
	fn encode_response(&self, resp: &CanonicalResponse) -> Result<Bytes, GatewayError>;

	fn decode_stream_chunk(&self, bytes: &[u8]) -> Result<Vec<CanonicalEvent>, GatewayError>;
	fn encode_stream_chunk(&self, event: &CanonicalEvent, meta: &StreamMetadata) -> Result<Bytes, GatewayError>;
}

/// Returns a `Codec` for a wire format. Each call returns a fresh
/// zero-sized handle; codecs carry no per-request state.
pub fn for_format(format: WireFormat) -> Box<dyn Codec> {
	match format {
		WireFormat::Openai => Box::new(openai::OpenAiCodec),
		WireFormat::Anthropic => Box::new(anthropic::AnthropicCodec),
		WireFormat::Responses => Box::new(responses::ResponsesCodec),
	}
}

/// Whether pass-through is legal for this request — source and provider
/// speak the same wire format and nothing mutated the canonical request
/// along the way.
pub fn passthrough_eligible(source: WireFormat, provider: WireFormat, mutated: bool) -> bool {
	source == provider && !mutated
}
