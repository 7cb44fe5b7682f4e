//! Gateway-owned identifier generation.
//!
//! Every id the gateway mints (never an upstream-provider id) is a short
//! prefix plus a v4 UUID: `int_` for interactions, `resp_` for client-facing
//! Responses ids, `evt_` for interaction events, `thread_` for continuation
//! threads.

use uuid::Uuid;

fn new_id(prefix: &str) -> String {
	format!("{prefix}_{}", Uuid::new_v4())
}

pub fn interaction_id() -> String {
	new_id("int")
}

pub fn response_id() -> String {
	new_id("resp")
}

pub fn event_id() -> String {
	new_id("evt")
}

pub fn thread_id() -> String {
	new_id("thread")
}

pub fn shadow_id() -> String {
	new_id("shadow")
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn ids_carry_the_expected_prefix() {
		assert!(interaction_id().starts_with("int_"));
		assert!(response_id().starts_with("resp_"));
		assert!(event_id().starts_with("evt_"));
		assert!(thread_id().starts_with("thread_"));
	}

	#[test]
	fn ids_are_unique() {
		assert_ne!(interaction_id(), interaction_id());
	}
}
