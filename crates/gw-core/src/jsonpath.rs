//! Minimal dotted-path resolution over a `serde_json::Value` tree, used to
//! pull a thread discriminator (e.g. `metadata.user_id`) out of a raw
//! request body without deserializing it into a typed struct first.

use serde_json::Value;

/// Follows `path` (dot-separated object keys; no array indexing) through
/// `root` and returns the leaf value if every segment resolves to an
/// object member.
pub fn resolve<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
	let mut cur = root;
	for segment in path.split('.') {
		if segment.is_empty() {
			return None;
		}
		cur = cur.as_object()?.get(segment)?;
	}
	Some(cur)
}

/// Convenience wrapper for the common case: resolve a path and require a
/// non-empty string leaf.
pub fn resolve_nonempty_str<'a>(root: &'a Value, path: &str) -> Option<&'a str> {
	resolve(root, path).and_then(Value::as_str).filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn resolves_nested_path() {
		let v = json!({"metadata": {"user_id": "alice"}});
		assert_eq!(resolve_nonempty_str(&v, "metadata.user_id"), Some("alice"));
	}

	#[test]
	fn missing_path_is_none() {
		let v = json!({"metadata": {}});
		assert_eq!(resolve_nonempty_str(&v, "metadata.user_id"), None);
	}

	#[test]
	fn empty_string_is_treated_as_absent() {
		let v = json!({"metadata": {"user_id": ""}});
		assert_eq!(resolve_nonempty_str(&v, "metadata.user_id"), None);
	}

	#[test]
	fn non_object_intermediate_is_none() {
		let v = json!({"metadata": "not-an-object"});
		assert_eq!(resolve(&v, "metadata.user_id"), None);
	}
}
