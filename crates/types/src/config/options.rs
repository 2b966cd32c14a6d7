//! Nested option documents assembled from dotted keys.
//!
//! Options supplied from outside the process (environment, flags, a remote
//! config service) arrive as flat `a.b.c = value` pairs. [`OptionTree`]
//! merges them into a nested JSON object. Every key segment is checked
//! before it is used as an object key: segments that would address an
//! object's prototype machinery in dynamically typed consumers of the same
//! document are rejected, as are empty segments.

use serde_json::{Map, Value};

use super::ConfigError;

/// Key segments that are never accepted.
pub const FORBIDDEN_KEY_SEGMENTS: [&str; 3] = ["__proto__", "constructor", "prototype"];

/// A nested option document built from dotted keys.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OptionTree {
    root: Map<String, Value>,
}

impl OptionTree {
    /// Creates an empty tree.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `value` at the dotted `key`, creating intermediate objects.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::RejectedKey`] when a segment is empty or
    /// forbidden, or when an intermediate segment already holds a non-object
    /// value.
    pub fn insert(&mut self, key: &str, value: Value) -> Result<(), ConfigError> {
        let segments: Vec<&str> = key.split('.').collect();
        for segment in &segments {
            if segment.is_empty() {
                return Err(ConfigError::RejectedKey {
                    key: key.to_owned(),
                    reason: "empty segment".to_owned(),
                });
            }
            if FORBIDDEN_KEY_SEGMENTS.contains(segment) {
                return Err(ConfigError::RejectedKey {
                    key: key.to_owned(),
                    reason: format!("segment '{segment}' is not allowed"),
                });
            }
        }

        let Some((last, parents)) = segments.split_last() else {
            return Err(ConfigError::RejectedKey {
                key: key.to_owned(),
                reason: "empty key".to_owned(),
            });
        };

        let mut node = &mut self.root;
        for segment in parents {
            let entry =
                node.entry((*segment).to_owned()).or_insert_with(|| Value::Object(Map::new()));
            node = match entry {
                Value::Object(map) => map,
                _ => {
                    return Err(ConfigError::RejectedKey {
                        key: key.to_owned(),
                        reason: format!("'{segment}' already holds a value"),
                    });
                },
            };
        }
        node.insert((*last).to_owned(), value);
        Ok(())
    }

    /// Returns the value at a dotted key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        let mut segments = key.split('.');
        let first = segments.next()?;
        segments.try_fold(self.root.get(first)?, |node, segment| node.as_object()?.get(segment))
    }

    /// Converts the tree into a JSON object value.
    #[must_use]
    pub fn into_value(self) -> Value {
        Value::Object(self.root)
    }
}
