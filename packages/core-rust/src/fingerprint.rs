//! Deterministic operation keys used for in-flight deduplication.
//!
//! The key is the kind, the path, and a canonical JSON rendering of the input
//! (object keys sorted recursively, no insignificant whitespace). Two inputs
//! that are equal as JSON values always produce the same key regardless of
//! the order their object keys were inserted in.

use std::fmt;

use serde_json::Value;

use crate::operation::OperationKind;

/// Opaque dedupe key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    #[must_use]
    pub fn of(kind: OperationKind, path: &str, input: &Value) -> Self {
        let mut key = String::with_capacity(path.len() + 32);
        key.push_str(kind.as_str());
        key.push(':');
        key.push_str(path);
        key.push(':');
        write_canonical(input, &mut key);
        Self(key)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Appends the canonical JSON form of `value` to `out`.
pub fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_unstable_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(item, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
