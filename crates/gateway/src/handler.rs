//! The frontdoor request-flow orchestrator: the one place that ties codec,
//! router, pre/post pipeline, provider call, thread bookkeeping, audit
//! persistence and shadow dispatch together for a single inbound call.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use gw_core::Strng;
use indexmap::IndexMap;

use crate::canonical::{
	CanonicalEvent, CanonicalRequest, CanonicalResponse, Choice, FinishReason, Message,
	MessageContent, Role, StreamMetadata, ToolCall, Usage, WireFormat,
};
use crate::codec::Codec;
use crate::error::GatewayError;
use crate::pipeline::{Denied, Pipeline};
use crate::pipeline::webhook::render_denied;
use crate::provider::responses_adapter::{ResponsesThreadAdapter, ThreadAuditEvent};
use crate::provider::{apply_response_model_rewrite, stream_metadata, CompleteResult, EventStream, HttpUpstreamProvider, UpstreamProvider};
use crate::router::{RouteDecision, Router};
use crate::shadow::ShadowEngine;
use crate::store::{
	EventDirection, EventStage, Interaction, InteractionError, InteractionEvent,
	InteractionStatus, InteractionStore, RequestAudit, ResponseAudit,
};

/// One configured upstream, either called directly or through the
/// continuation-thread adapter. Kept as a concrete enum rather than a second
/// trait object so `ResponsesThreadAdapter`'s audit-carrying return types
/// don't have to be erased.
#[derive(Clone)]
pub enum ProviderHandle {
	Plain(Arc<dyn UpstreamProvider>),
	Threaded(Arc<ResponsesThreadAdapter<HttpUpstreamProvider>>),
}

impl ProviderHandle {
	fn name(&self) -> &Strng {
		match self {
			ProviderHandle::Plain(p) => p.name(),
			ProviderHandle::Threaded(p) => p.name(),
		}
	}

	fn api_type(&self) -> WireFormat {
		match self {
			ProviderHandle::Plain(p) => p.api_type(),
			ProviderHandle::Threaded(p) => p.api_type(),
		}
	}

	async fn complete(&self, req: &CanonicalRequest) -> Result<(CompleteResult, Vec<ThreadAuditEvent>), GatewayError> {
		match self {
			ProviderHandle::Plain(p) => Ok((p.complete(req).await?, Vec::new())),
			ProviderHandle::Threaded(p) => p.complete(req.clone()).await,
		}
	}

	/// Only ever called for `Plain` handles — thread continuation always
	/// injects `previous_response_id` into the canonical request before
	/// encoding, so a `Threaded` handle can never take the raw-bytes path
	/// and falls back to the normal encode-from-canonical call.
	async fn complete_passthrough(&self, raw_body: &Bytes, req: &CanonicalRequest) -> Result<(CompleteResult, Vec<ThreadAuditEvent>), GatewayError> {
		match self {
			ProviderHandle::Plain(p) => Ok((p.complete_passthrough(raw_body, req).await?, Vec::new())),
			ProviderHandle::Threaded(p) => p.complete(req.clone()).await,
		}
	}

	async fn stream(&self, req: &CanonicalRequest) -> Result<(EventStream, Bytes, Option<String>), GatewayError> {
		match self {
			ProviderHandle::Plain(p) => {
				let (stream, body) = p.stream(req).await?;
				Ok((stream, body, None))
			}
			ProviderHandle::Threaded(p) => p.stream(req.clone()).await,
		}
	}
}

/// Body of the reply an orchestrated call produces. `Stream` frames are
/// already encoded in the frontdoor's wire format and ready to write
/// verbatim to the client connection.
pub enum FrontdoorReply {
	Complete { status: u16, body: Bytes },
	Stream { status: u16, frames: Pin<Box<dyn Stream<Item = Result<Bytes, GatewayError>> + Send>> },
	/// A post-pipeline stage both denied and squelched: nothing should be
	/// written to the client at all.
	Suppressed,
}

pub struct HandleResult {
	pub interaction_id: String,
	pub reply: FrontdoorReply,
}

pub struct Handler {
	pub frontdoor_format: WireFormat,
	pub tenant_id: Strng,
	codec: Arc<dyn Codec>,
	router: Router,
	providers: IndexMap<Strng, ProviderHandle>,
	pipeline: Arc<Pipeline>,
	store: Arc<dyn InteractionStore>,
	shadow: Option<Arc<ShadowEngine>>,
}

impl Handler {
	pub fn new(
		frontdoor_format: WireFormat,
		tenant_id: impl Into<Strng>,
		router: Router,
		providers: IndexMap<Strng, ProviderHandle>,
		pipeline: Pipeline,
		store: Arc<dyn InteractionStore>,
		shadow: Option<Arc<ShadowEngine>>,
	) -> Self {
		Handler {
			frontdoor_format,
			tenant_id: tenant_id.into(),
			codec: Arc::from(crate::codec::for_format(frontdoor_format)),
			router,
			providers,
			pipeline: Arc::new(pipeline),
			store,
			shadow,
		}
	}

	fn now_millis() -> i64 {
		chrono::Utc::now().timestamp_millis()
	}

	fn error_reply(&self, status: u16, reason: &str) -> FrontdoorReply {
		let payload = render_denied(self.frontdoor_format, reason);
		let body = serde_json::to_vec(&payload).unwrap_or_else(|_| b"{}".to_vec());
		FrontdoorReply::Complete { status, body: Bytes::from(body) }
	}

	/// Decodes, routes, pre-pipelines, and dispatches one request. The raw
	/// body is read exactly once by the caller and handed in whole.
	pub async fn handle(&self, raw_body: Bytes, user_agent: Option<String>) -> HandleResult {
		let interaction_id = gw_core::ids::interaction_id();

		let mut req = match self.codec.decode_request(&raw_body) {
			Ok(req) => req,
			Err(e) => {
				return HandleResult { interaction_id, reply: self.error_reply(e.kind.http_status(), &e.message) };
			}
		};
		req.tenant_id = self.tenant_id.clone();
		req.raw_body = Some(raw_body);
		let raw_request_bytes = req.raw_body.clone();
		req.user_agent = user_agent;
		req.metadata.insert("interaction_id".to_string(), interaction_id.clone());

		if let Err(e) = req.validate() {
			return HandleResult { interaction_id, reply: self.error_reply(e.kind.http_status(), &e.message) };
		}

		let requested_model = req.model.clone();
		let streaming = req.sampling.stream;

		let mut interaction = Interaction {
			id: interaction_id.clone(),
			tenant_id: self.tenant_id.to_string(),
			frontdoor_api_type: self.frontdoor_format,
			provider: String::new(),
			requested_model: requested_model.clone(),
			served_model: requested_model.clone(),
			provider_model: String::new(),
			streaming,
			status: InteractionStatus::Pending,
			duration_ms: None,
			request: RequestAudit { raw: req.raw_body.clone(), canonical_json: serde_json::to_value(&req).ok(), unmapped_fields: Some(req.unmapped_fields.clone()), provider_request_bytes: None },
			response: ResponseAudit::default(),
			error: None,
			metadata: BTreeMap::new(),
			selected_headers: BTreeMap::new(),
			previous_interaction_id: None,
			thread_key: None,
			transformation_steps: Vec::new(),
			created_at: Self::now_millis(),
			updated_at: Self::now_millis(),
		};
		let started = std::time::Instant::now();
		self.emit_event(&interaction_id, EventStage::FrontdoorDecode, EventDirection::Ingress, Some(self.frontdoor_format), None, Some(requested_model.as_str()), None, None, None).await;

		let metadata = serde_json::Value::Null;
		let (req, pre_mutated) = match self.pipeline.run_pre(req, &metadata).await {
			Ok(result) => result,
			Err(denied) => return self.finish_denied(interaction, interaction_id, denied).await,
		};

		let decision = match self.router.decide(&req.model) {
			Ok(decision) => decision,
			Err(e) => return self.fail(interaction, interaction_id, e).await,
		};
		let Some(provider_handle) = self.providers.get(&decision.provider) else {
			return self.fail(interaction, interaction_id, GatewayError::server(format!("no provider registered for {:?}", decision.provider))).await;
		};

		interaction.provider = provider_handle.name().to_string();
		let passthrough = crate::codec::passthrough_eligible(self.frontdoor_format, provider_handle.api_type(), pre_mutated)
			&& decision.upstream_model == req.model
			&& matches!(provider_handle, ProviderHandle::Plain(_));

		let mut upstream_req = req.clone();
		upstream_req.model = decision.upstream_model.clone();
		interaction.provider_model = decision.upstream_model.clone();

		self.emit_event(&interaction_id, EventStage::ProviderEncode, EventDirection::Egress, Some(provider_handle.api_type()), Some(interaction.provider.as_str()), Some(decision.upstream_model.as_str()), None, None, None).await;

		if streaming {
			self.handle_streaming(interaction, interaction_id, req, upstream_req, decision, provider_handle, passthrough, started).await
		} else {
			self.handle_complete(interaction, interaction_id, req, upstream_req, decision, provider_handle, passthrough, raw_request_bytes, started).await
		}
	}

	#[allow(clippy::too_many_arguments)]
	async fn handle_complete(
		&self,
		mut interaction: Interaction,
		interaction_id: String,
		original_req: CanonicalRequest,
		upstream_req: CanonicalRequest,
		decision: RouteDecision,
		provider_handle: &ProviderHandle,
		passthrough: bool,
		raw_request_bytes: Option<Bytes>,
		started: std::time::Instant,
	) -> HandleResult {
		let (result, thread_audit) = match (passthrough, raw_request_bytes.as_ref()) {
			(true, Some(raw)) => match provider_handle.complete_passthrough(raw, &upstream_req).await {
				Ok(result) => result,
				Err(e) => return self.fail(interaction, interaction_id, e).await,
			},
			_ => match provider_handle.complete(&upstream_req).await {
				Ok(result) => result,
				Err(e) => return self.fail(interaction, interaction_id, e).await,
			},
		};
		interaction.request.provider_request_bytes = Some(result.provider_request_bytes.clone());
		for event in &thread_audit {
			self.emit_thread_event(&interaction_id, event).await;
			if let ThreadAuditEvent::ThreadResolve { thread_key, .. } = event {
				interaction.thread_key = Some(thread_key.clone());
			}
		}

		self.emit_event(&interaction_id, EventStage::ProviderDecode, EventDirection::Ingress, Some(provider_handle.api_type()), Some(interaction.provider.as_str()), None, Some(decision.upstream_model.as_str()), None, None).await;

		let provider_response_bytes = result.provider_response_bytes.clone();
		let response = apply_response_model_rewrite(result.response, &decision.requested_model, decision.rewrite_response_model);

		let post = self.pipeline.run_post(&original_req, response.clone(), &serde_json::Value::Null).await;
		let (final_response, post_mutated) = match post {
			Ok(Some(result)) => result,
			Ok(None) => {
				interaction.status = InteractionStatus::Cancelled;
				interaction.duration_ms = Some(started.elapsed().as_millis() as u64);
				interaction.updated_at = Self::now_millis();
				let _ = self.store.save_interaction(interaction).await;
				return HandleResult { interaction_id, reply: FrontdoorReply::Suppressed };
			}
			Err(denied) => return self.finish_denied(interaction, interaction_id, denied).await,
		};

		// When pass-through was eligible and the post-pipeline left the
		// response untouched, the client gets the provider's raw bytes
		// verbatim instead of a re-encoded copy.
		let body = if passthrough && !post_mutated {
			provider_response_bytes.clone()
		} else {
			match self.codec.encode_response(&final_response) {
				Ok(body) => body,
				Err(e) => return self.fail(interaction, interaction_id, e).await,
			}
		};

		self.emit_event(&interaction_id, EventStage::FrontdoorEncode, EventDirection::Egress, Some(self.frontdoor_format), Some(interaction.provider.as_str()), None, None, None, None).await;

		interaction.status = InteractionStatus::Completed;
		interaction.duration_ms = Some(started.elapsed().as_millis() as u64);
		interaction.served_model = final_response.model.clone();
		interaction.response = ResponseAudit {
			raw: Some(provider_response_bytes),
			canonical_json: serde_json::to_value(&final_response).ok(),
			unmapped_fields: None,
			client_response_bytes: Some(body.clone()),
			provider_response_id: Some(final_response.id.clone()),
			finish_reason: final_response.first_finish_reason(),
			usage: Some(final_response.usage.clone()),
		};
		interaction.updated_at = Self::now_millis();
		let _ = self.store.save_interaction(interaction).await;

		self.spawn_shadow(&interaction_id, &original_req, &final_response);

		HandleResult { interaction_id, reply: FrontdoorReply::Complete { status: 200, body } }
	}

	async fn handle_streaming(
		&self,
		mut interaction: Interaction,
		interaction_id: String,
		original_req: CanonicalRequest,
		upstream_req: CanonicalRequest,
		decision: RouteDecision,
		provider_handle: &ProviderHandle,
		passthrough: bool,
		started: std::time::Instant,
	) -> HandleResult {
		let (events, provider_request_bytes, thread_key) = match provider_handle.stream(&upstream_req).await {
			Ok(result) => result,
			Err(e) => return self.fail(interaction, interaction_id, e).await,
		};
		interaction.thread_key = thread_key.clone();

		let meta = stream_metadata(gw_core::ids::response_id(), decision.requested_model.clone(), Self::now_millis());
		let codec = self.codec.clone();
		let store = self.store.clone();
		let shadow = self.shadow.clone();
		let pipeline_request = original_req.clone();
		let passthrough_meta = passthrough;
		let interaction_id_for_tail = interaction_id.clone();

		let frames = build_stream_tee(
			events,
			codec.clone(),
			meta,
			self.pipeline.clone(),
			store,
			shadow,
			interaction,
			interaction_id_for_tail,
			pipeline_request,
			decision,
			provider_request_bytes,
			started,
			passthrough_meta,
		);

		HandleResult { interaction_id, reply: FrontdoorReply::Stream { status: 200, frames: Box::pin(frames) } }
	}

	async fn finish_denied(&self, mut interaction: Interaction, interaction_id: String, denied: Denied) -> HandleResult {
		interaction.status = InteractionStatus::Failed;
		interaction.error = Some(InteractionError { error_type: "denied".to_string(), code: Some(format!("denied_by_{}", denied.stage_name)), message: denied.reason.clone() });
		interaction.updated_at = Self::now_millis();
		let _ = self.store.save_interaction(interaction).await;
		HandleResult { interaction_id, reply: self.error_reply(403, &denied.reason) }
	}

	async fn fail(&self, mut interaction: Interaction, interaction_id: String, e: GatewayError) -> HandleResult {
		interaction.status = InteractionStatus::Failed;
		interaction.error = Some(InteractionError { error_type: format!("{:?}", e.kind), code: e.code.as_ref().map(|c| c.to_string()), message: e.message.clone() });
		interaction.updated_at = Self::now_millis();
		let status = e.kind.http_status();
		let _ = self.store.save_interaction(interaction).await;
		HandleResult { interaction_id, reply: self.error_reply(status, &e.message) }
	}

	fn spawn_shadow(&self, interaction_id: &str, request: &CanonicalRequest, response: &CanonicalResponse) {
		let Some(shadow) = self.shadow.clone() else { return };
		if !shadow.is_enabled() {
			return;
		}
		let store = self.store.clone();
		let codec = self.codec.clone();
		let interaction_id = interaction_id.to_string();
		let request = request.clone();
		let response = response.clone();
		tokio::spawn(async move {
			let results = shadow.run(&interaction_id, &request, &response, codec).await;
			for result in results {
				if let Err(e) = store.save_shadow_result(result).await {
					tracing::warn!(error = %e, interaction_id, "failed to persist shadow result");
				}
			}
		});
	}

	async fn emit_thread_event(&self, interaction_id: &str, event: &ThreadAuditEvent) {
		let (stage, thread_key, previous_response_id) = match event {
			ThreadAuditEvent::ThreadResolve { thread_key, previous_response_id } => (EventStage::ThreadResolve, thread_key.clone(), previous_response_id.clone()),
			ThreadAuditEvent::ThreadUpdate { thread_key, response_id } => (EventStage::ThreadUpdate, thread_key.clone(), Some(response_id.clone())),
		};
		let event = InteractionEvent {
			id: gw_core::ids::event_id(),
			interaction_id: interaction_id.to_string(),
			stage,
			direction: EventDirection::Internal,
			api_type: None,
			provider: None,
			requested_model: None,
			provider_model: None,
			thread_key: Some(thread_key),
			previous_response_id,
			raw: None,
			canonical: None,
			headers: BTreeMap::new(),
			metadata: serde_json::Value::Null,
			sequence: 0,
			created_at: Self::now_millis(),
		};
		if let Err(e) = self.store.append_interaction_event(event).await {
			tracing::warn!(error = %e, interaction_id, "failed to append thread audit event");
		}
	}

	#[allow(clippy::too_many_arguments)]
	async fn emit_event(
		&self,
		interaction_id: &str,
		stage: EventStage,
		direction: EventDirection,
		api_type: Option<WireFormat>,
		provider: Option<&str>,
		requested_model: Option<&str>,
		provider_model: Option<&str>,
		thread_key: Option<&str>,
		previous_response_id: Option<&str>,
	) {
		let event = InteractionEvent {
			id: gw_core::ids::event_id(),
			interaction_id: interaction_id.to_string(),
			stage,
			direction,
			api_type,
			provider: provider.map(str::to_string),
			requested_model: requested_model.map(str::to_string),
			provider_model: provider_model.map(str::to_string),
			thread_key: thread_key.map(str::to_string),
			previous_response_id: previous_response_id.map(str::to_string),
			raw: None,
			canonical: None,
			headers: BTreeMap::new(),
			metadata: serde_json::Value::Null,
			sequence: 0,
			created_at: Self::now_millis(),
		};
		if let Err(e) = self.store.append_interaction_event(event).await {
			tracing::warn!(error = %e, interaction_id, "failed to append interaction event");
		}
	}
}

/// Accumulates streamed events into a single `CanonicalResponse` so the
/// post-pipeline, the shadow engine, and the audit log can treat a streamed
/// call the same as a non-streamed one once it closes. Every part of a
/// stream is folded into a single choice at index 0 — real traffic this
/// gateway fronts never streams more than one choice.
#[derive(Default)]
struct StreamAccumulator {
	id: Option<String>,
	model: Option<String>,
	provider_model: Option<String>,
	text: BTreeMap<u32, String>,
	tool_calls: BTreeMap<u32, (Option<String>, Option<String>, String)>,
	finish_reason: Option<FinishReason>,
	usage: Option<Usage>,
}

impl StreamAccumulator {
	fn absorb(&mut self, event: &CanonicalEvent) {
		match event {
			CanonicalEvent::MessageStart { id, model } | CanonicalEvent::ResponseCreated { id, model } => {
				self.id = Some(id.clone());
				self.model = Some(model.clone());
			}
			CanonicalEvent::ContentDelta { index, text } => {
				self.text.entry(*index).or_default().push_str(text);
			}
			CanonicalEvent::ContentBlockDelta { index, tool_call, text } | CanonicalEvent::ResponseOutputItemDelta { index, tool_call, text } => {
				if let Some(t) = text {
					self.text.entry(*index).or_default().push_str(t);
				}
				if let Some(chunk) = tool_call {
					self.absorb_tool_chunk(*index, chunk);
				}
			}
			CanonicalEvent::ContentBlockStop { index, tool_call } | CanonicalEvent::ResponseOutputItemDone { index, tool_call } => {
				if let Some(chunk) = tool_call {
					self.absorb_tool_chunk(*index, chunk);
				}
			}
			CanonicalEvent::MessageDelta { finish_reason, usage } => {
				if finish_reason.is_some() {
					self.finish_reason = *finish_reason;
				}
				if usage.is_some() {
					self.usage = usage.clone();
				}
			}
			CanonicalEvent::ResponseDone { id, model, provider_model, usage } => {
				self.id = Some(id.clone());
				self.model = Some(model.clone());
				self.provider_model = Some(provider_model.clone());
				if usage.is_some() {
					self.usage = usage.clone();
				}
			}
			_ => {}
		}
	}

	fn absorb_tool_chunk(&mut self, index: u32, chunk: &crate::canonical::ToolCallChunk) {
		let entry = self.tool_calls.entry(index).or_insert((None, None, String::new()));
		if chunk.id.is_some() {
			entry.0 = chunk.id.clone();
		}
		if chunk.name.is_some() {
			entry.1 = chunk.name.clone();
		}
		if let Some(delta) = &chunk.arguments_delta {
			entry.2.push_str(delta);
		}
	}

	fn into_response(self, requested_model: &str) -> CanonicalResponse {
		let content = if self.text.is_empty() { None } else { Some(MessageContent::Text(self.text.into_values().collect::<Vec<_>>().join(""))) };
		let tool_calls = self
			.tool_calls
			.into_iter()
			.map(|(_, (id, name, arguments))| ToolCall { id: id.unwrap_or_default(), name: name.unwrap_or_default(), arguments_json: if arguments.is_empty() { "{}".to_string() } else { arguments } })
			.collect::<Vec<_>>();

		let message = Message { role: Role::Assistant, content, tool_calls, tool_call_id: None, name: None };
		CanonicalResponse {
			id: self.id.unwrap_or_else(gw_core::ids::response_id),
			created: chrono::Utc::now().timestamp_millis(),
			model: self.model.unwrap_or_else(|| requested_model.to_string()),
			provider_model: self.provider_model.unwrap_or_default(),
			choices: vec![Choice { index: 0, message, finish_reason: self.finish_reason }],
			usage: self.usage.unwrap_or_default(),
			raw_upstream_body: None,
			raw_upstream_request_body: None,
			rate_limit: None,
		}
	}
}

/// Tees the provider's canonical event stream into client-encoded frames
/// while accumulating a full response in the background. The upstream
/// consumption and post-pipeline/audit/shadow work run on a detached task
/// feeding the returned stream over a channel, so dropping the returned
/// stream (a client disconnect) stops the client's frames without cancelling
/// the audit write or shadow dispatch — matching the detached-context
/// requirement for cancellation. Once the upstream stream closes (or
/// errors), the post-pipeline runs against the accumulated response purely
/// for audit and shadow-trigger purposes — a streamed reply can't be unsent,
/// so a denying post-stage only marks the interaction as denied and skips
/// the shadow dispatch rather than altering already-delivered bytes.
#[allow(clippy::too_many_arguments)]
fn build_stream_tee(
	mut events: EventStream,
	codec: Arc<dyn Codec>,
	meta: StreamMetadata,
	post_pipeline: Arc<Pipeline>,
	store: Arc<dyn InteractionStore>,
	shadow: Option<Arc<ShadowEngine>>,
	mut interaction: Interaction,
	interaction_id: String,
	original_req: CanonicalRequest,
	decision: RouteDecision,
	provider_request_bytes: Bytes,
	started: std::time::Instant,
	_passthrough: bool,
) -> impl Stream<Item = Result<Bytes, GatewayError>> + Send {
	let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, GatewayError>>(16);

	tokio::spawn(async move {
		let mut accumulator = StreamAccumulator::default();
		let mut failed = false;
		let mut client_gone = false;

		while let Some(next) = events.next().await {
			match next {
				Ok(event) => {
					accumulator.absorb(&event);
					let terminal = event.is_terminal();
					let frame = codec.encode_stream_chunk(&event, &meta);
					if !client_gone && tx.send(frame.clone()).await.is_err() {
						client_gone = true;
					}
					if matches!(frame, Err(_)) {
						failed = true;
						break;
					}
					if terminal {
						break;
					}
				}
				Err(e) => {
					failed = true;
					if !client_gone {
						let _ = tx.send(Err(e)).await;
					}
					break;
				}
			}
		}
		drop(tx);

		interaction.provider_model = decision.upstream_model.clone();
		interaction.served_model = decision.requested_model.clone();
		interaction.request.provider_request_bytes = Some(provider_request_bytes);
		interaction.duration_ms = Some(started.elapsed().as_millis() as u64);
		interaction.updated_at = chrono::Utc::now().timestamp_millis();

		if failed {
			interaction.status = if client_gone { InteractionStatus::Cancelled } else { InteractionStatus::Failed };
			let _ = store.save_interaction(interaction).await;
			return;
		}
		if client_gone {
			interaction.status = InteractionStatus::Cancelled;
		}

		let response = accumulator.into_response(&decision.requested_model);
		let response = apply_response_model_rewrite(response, &decision.requested_model, decision.rewrite_response_model);

		match post_pipeline.run_post(&original_req, response.clone(), &serde_json::Value::Null).await {
			Ok(_) => {
				if interaction.status != InteractionStatus::Cancelled {
					interaction.status = InteractionStatus::Completed;
				}
				interaction.response = ResponseAudit {
					raw: None,
					canonical_json: serde_json::to_value(&response).ok(),
					unmapped_fields: None,
					client_response_bytes: None,
					provider_response_id: Some(response.id.clone()),
					finish_reason: response.first_finish_reason(),
					usage: Some(response.usage.clone()),
				};
				let _ = store.save_interaction(interaction).await;

				if let Some(shadow) = shadow {
					if shadow.is_enabled() {
						let codec = codec.clone();
						let request = original_req.clone();
						let interaction_id = interaction_id.clone();
						tokio::spawn(async move {
							let results = shadow.run(&interaction_id, &request, &response, codec).await;
							for result in results {
								let _ = store.save_shadow_result(result).await;
							}
						});
					}
				}
			}
			Err(denied) => {
				interaction.status = InteractionStatus::Failed;
				interaction.error = Some(InteractionError { error_type: "denied".to_string(), code: Some(format!("denied_by_{}", denied.stage_name)), message: denied.reason });
				let _ = store.save_interaction(interaction).await;
			}
		}
	});

	tokio_stream::wrappers::ReceiverStream::new(rx)
}
