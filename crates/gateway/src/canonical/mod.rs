pub mod event;
pub mod request;
pub mod response;

pub use event::{CanonicalEvent, StreamMetadata, ToolCallChunk};
pub use request::{
	CanonicalRequest, ContentPart, Message, MessageContent, Role, Sampling, ToolCall,
	ToolChoice, ToolDefinition, WireFormat,
};
pub use response::{CanonicalResponse, Choice, FinishReason, RateLimitSnapshot, Usage};
