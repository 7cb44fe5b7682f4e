//! Upstream provider adapters.
//!
//! `UpstreamProvider` is the seam between the router and the actual HTTP
//! call: given a fully-mapped canonical request it returns a canonical
//! response or a canonical event stream. `HttpUpstreamProvider` is the one
//! concrete implementation, speaking whichever wire format its codec
//! understands over plain HTTP. `responses_adapter` wraps any provider with
//! continuation-thread bookkeeping for the Responses-style APIs.

pub mod responses_adapter;

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use gw_core::Strng;

use crate::canonical::{CanonicalEvent, CanonicalRequest, CanonicalResponse, StreamMetadata, WireFormat};
use crate::codec::Codec;
use crate::error::{GatewayError, GatewayErrorKind};

pub type EventStream = Pin<Box<dyn Stream<Item = Result<CanonicalEvent, GatewayError>> + Send>>;

/// A provider-side call result that also hands back the raw bytes exchanged,
/// so the orchestrator can populate `Interaction::request`/`response` audit
/// fields without re-encoding.
pub struct CompleteResult {
	pub response: CanonicalResponse,
	pub provider_request_bytes: Bytes,
	pub provider_response_bytes: Bytes,
}

#[async_trait]
pub trait UpstreamProvider: Send + Sync {
	fn name(&self) -> &Strng;
	fn api_type(&self) -> WireFormat;

	async fn complete(&self, req: &CanonicalRequest) -> Result<CompleteResult, GatewayError>;
	async fn stream(&self, req: &CanonicalRequest) -> Result<(EventStream, Bytes), GatewayError>;

	/// Sends `raw_body` to the provider verbatim instead of re-encoding
	/// `req` from canonical form, for byte-exact pass-through when the
	/// frontdoor and provider wire formats match and nothing mutated the
	/// request. The default falls back to the normal encode-from-canonical
	/// path, which is always correct; only an adapter that can safely skip
	/// re-encoding needs to override it.
	async fn complete_passthrough(&self, _raw_body: &Bytes, req: &CanonicalRequest) -> Result<CompleteResult, GatewayError> {
		self.complete(req).await
	}
}

/// Speaks one wire format over HTTP using `reqwest`. The codec it holds
/// dictates both what bytes it sends and how it interprets the response —
/// the same `Codec` trait the frontdoor handlers use.
pub struct HttpUpstreamProvider {
	name: Strng,
	base_url: String,
	api_key: Strng,
	codec: Box<dyn Codec>,
	client: reqwest::Client,
}

impl HttpUpstreamProvider {
	pub fn new(name: impl Into<Strng>, base_url: impl Into<String>, api_key: impl Into<Strng>, api_type: WireFormat) -> Self {
		HttpUpstreamProvider {
			name: name.into(),
			base_url: base_url.into(),
			api_key: api_key.into(),
			codec: crate::codec::for_format(api_type),
			client: reqwest::Client::builder()
				.timeout(Duration::from_secs(120))
				.build()
				.expect("reqwest client builder with only timeout/defaults cannot fail"),
		}
	}

	fn endpoint(&self, suffix: &str) -> String {
		format!("{}{}", self.base_url.trim_end_matches('/'), suffix)
	}

	fn request_path(&self) -> &'static str {
		match self.codec.wire_format() {
			WireFormat::Openai => "/v1/chat/completions",
			WireFormat::Anthropic => "/v1/messages",
			WireFormat::Responses => "/v1/responses",
		}
	}

	fn map_transport_error(&self, e: reqwest::Error) -> GatewayError {
		if e.is_timeout() {
			GatewayError::new(GatewayErrorKind::Overloaded, format!("upstream timed out: {e}")).with_source_api(self.name.clone())
		} else {
			GatewayError::new(GatewayErrorKind::Server, format!("upstream transport error: {e}")).with_source_api(self.name.clone())
		}
	}
}

#[async_trait]
impl UpstreamProvider for HttpUpstreamProvider {
	fn name(&self) -> &Strng {
		&self.name
	}

	fn api_type(&self) -> WireFormat {
		self.codec.wire_format()
	}

	async fn complete(&self, req: &CanonicalRequest) -> Result<CompleteResult, GatewayError> {
		let body = self.codec.encode_request(req)?;
		let resp = self
			.client
			.post(self.endpoint(self.request_path()))
			.bearer_auth(self.api_key.as_str())
			.header("content-type", "application/json")
			.body(body.clone())
			.send()
			.await
			.map_err(|e| self.map_transport_error(e))?;

		let status = resp.status();
		let response_bytes = resp.bytes().await.map_err(|e| self.map_transport_error(e))?;

		if !status.is_success() {
			let message = String::from_utf8_lossy(&response_bytes).to_string();
			return Err(GatewayError::classify_upstream_message(status.as_u16(), &message).with_source_api(self.name.clone()));
		}

		let response = self.codec.decode_response(&response_bytes)?;
		Ok(CompleteResult { response, provider_request_bytes: body, provider_response_bytes: response_bytes })
	}

	async fn complete_passthrough(&self, raw_body: &Bytes, _req: &CanonicalRequest) -> Result<CompleteResult, GatewayError> {
		let resp = self
			.client
			.post(self.endpoint(self.request_path()))
			.bearer_auth(self.api_key.as_str())
			.header("content-type", "application/json")
			.body(raw_body.clone())
			.send()
			.await
			.map_err(|e| self.map_transport_error(e))?;

		let status = resp.status();
		let response_bytes = resp.bytes().await.map_err(|e| self.map_transport_error(e))?;

		if !status.is_success() {
			let message = String::from_utf8_lossy(&response_bytes).to_string();
			return Err(GatewayError::classify_upstream_message(status.as_u16(), &message).with_source_api(self.name.clone()));
		}

		// Still decoded into canonical form for audit and pipeline purposes —
		// only the client-facing and upstream-facing bytes skip re-encoding.
		let response = self.codec.decode_response(&response_bytes)?;
		Ok(CompleteResult { response, provider_request_bytes: raw_body.clone(), provider_response_bytes: response_bytes })
	}

	async fn stream(&self, req: &CanonicalRequest) -> Result<(EventStream, Bytes), GatewayError> {
		let body = self.codec.encode_request(req)?;
		let resp = self
			.client
			.post(self.endpoint(self.request_path()))
			.bearer_auth(self.api_key.as_str())
			.header("content-type", "application/json")
			.header("accept", "text/event-stream")
			.body(body.clone())
			.send()
			.await
			.map_err(|e| self.map_transport_error(e))?;

		let status = resp.status();
		if !status.is_success() {
			let message = resp.text().await.unwrap_or_default();
			return Err(GatewayError::classify_upstream_message(status.as_u16(), &message).with_source_api(self.name.clone()));
		}

		let provider_name = self.name.clone();
		let wire_format = self.codec.wire_format();
		let byte_stream = resp.bytes_stream();

		let events = sse_events(byte_stream).flat_map(move |frame| {
			let decoded: Vec<Result<CanonicalEvent, GatewayError>> = match frame {
				Ok(bytes) => match crate::codec::for_format(wire_format).decode_stream_chunk(&bytes) {
					Ok(events) => events.into_iter().map(Ok).collect(),
					Err(e) => vec![Err(e)],
				},
				Err(e) => vec![Err(GatewayError::new(GatewayErrorKind::Server, format!("upstream stream error: {e}")).with_source_api(provider_name.clone()))],
			};
			futures::stream::iter(decoded)
		});

		Ok((Box::pin(events), body))
	}
}

/// Splits an SSE byte stream on newline-terminated `data:` frames, dropping
/// the `[DONE]` sentinel rather than forwarding it as a frame.
struct SseState {
	inner: Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>,
	buffer: String,
	queue: std::collections::VecDeque<Bytes>,
}

fn sse_events(
	byte_stream: impl Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
) -> impl Stream<Item = Result<Bytes, reqwest::Error>> + Send {
	let state = SseState { inner: Box::pin(byte_stream), buffer: String::new(), queue: std::collections::VecDeque::new() };

	futures::stream::unfold(state, |mut state| async move {
		loop {
			if let Some(frame) = state.queue.pop_front() {
				return Some((Ok(frame), state));
			}
			match state.inner.next().await {
				Some(Ok(chunk)) => {
					state.buffer.push_str(&String::from_utf8_lossy(&chunk));
					while let Some(newline_pos) = state.buffer.find('\n') {
						let line = state.buffer[..newline_pos].trim_end_matches('\r').to_string();
						state.buffer.drain(..=newline_pos);
						let Some(data) = line.strip_prefix("data:") else { continue };
						let data = data.trim();
						if data.is_empty() || data == "[DONE]" {
							continue;
						}
						state.queue.push_back(Bytes::copy_from_slice(data.as_bytes()));
					}
				}
				Some(Err(e)) => return Some((Err(e), state)),
				None => return None,
			}
		}
	})
}

/// A response-model rewrite applied after an upstream call: the client sees
/// `requested_model` in `response.model`, while `response.provider_model`
/// keeps the name actually sent upstream.
pub fn apply_response_model_rewrite(mut response: CanonicalResponse, requested_model: &str, rewrite: bool) -> CanonicalResponse {
	if rewrite {
		response.provider_model = response.model.clone();
		response.model = requested_model.to_string();
	}
	response
}

pub fn stream_metadata(id: impl Into<String>, model: impl Into<String>, created: i64) -> StreamMetadata {
	StreamMetadata { id: id.into(), model: model.into(), created }
}
