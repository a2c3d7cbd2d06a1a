//! Request transformation filters: header add/edit/del, URL prefix
//! stripping, and regex path rewriting.
//!
//! The grammars come straight from the config columns: `header_transform`
//! holds comma-separated `add|edit|del name [value]` lines and
//! `url_rewrite` holds comma-separated `pattern replacement` regex pairs.
//! Malformed lines are skipped silently so one bad row cannot take a
//! service down.

use regex::Regex;

use crate::http::{HeaderMap, HeaderName, HeaderValue};

#[cfg(test)]
#[path = "filters_test.rs"]
mod tests;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderOp {
	/// `add` and `edit` both overwrite the header.
	Set { name: String, value: String },
	Del { name: String },
}

pub fn parse_header_ops(raw: &str) -> Vec<HeaderOp> {
	let mut ops = Vec::new();
	for line in raw.split(',') {
		let fields: Vec<&str> = line.split_whitespace().collect();
		match fields.as_slice() {
			["add" | "edit", name, value] => ops.push(HeaderOp::Set {
				name: name.to_string(),
				value: value.to_string(),
			}),
			["del", name, ..] => ops.push(HeaderOp::Del {
				name: name.to_string(),
			}),
			_ => {},
		}
	}
	ops
}

pub fn apply_header_ops(headers: &mut HeaderMap, ops: &[HeaderOp]) {
	for op in ops {
		match op {
			HeaderOp::Set { name, value } => {
				let (Ok(name), Ok(value)) = (
					HeaderName::try_from(name.as_str()),
					HeaderValue::try_from(value.as_str()),
				) else {
					continue;
				};
				headers.insert(name, value);
			},
			HeaderOp::Del { name } => {
				if let Ok(name) = HeaderName::try_from(name.as_str()) {
					headers.remove(name);
				}
			},
		}
	}
}

/// Removes the first occurrence of `prefix` from `path`.
pub fn strip_prefix_once(path: &str, prefix: &str) -> String {
	path.replacen(prefix, "", 1)
}

pub fn parse_rewrites(raw: &str) -> Vec<(Regex, String)> {
	let mut rules = Vec::new();
	for line in raw.split(',') {
		let fields: Vec<&str> = line.split_whitespace().collect();
		let [pattern, replacement] = fields.as_slice() else {
			continue;
		};
		match Regex::new(pattern) {
			Ok(re) => rules.push((re, replacement.to_string())),
			Err(e) => tracing::debug!(pattern, "skipping invalid rewrite pattern: {e}"),
		}
	}
	rules
}

pub fn apply_rewrites(path: &str, rules: &[(Regex, String)]) -> String {
	let mut path = path.to_string();
	for (re, replacement) in rules {
		path = re.replace_all(&path, replacement.as_str()).into_owned();
	}
	path
}
