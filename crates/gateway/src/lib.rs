//! Frontdoor-agnostic core of the gateway: canonical request/response types,
//! wire-format codecs, routing, the pre/post pipeline, provider adapters,
//! shadow execution, the audit store, and the request-flow orchestrator.
//!
//! A binary crate wires these together with a transport (HTTP listener,
//! config loading, process wiring); nothing in this crate depends on a
//! specific transport or on how configuration is sourced.

pub mod canonical;
pub mod codec;
pub mod error;
pub mod handler;
pub mod pipeline;
pub mod provider;
pub mod router;
pub mod shadow;
pub mod store;

pub use error::{GatewayError, GatewayErrorKind};
pub use handler::{FrontdoorReply, HandleResult, Handler, ProviderHandle};
