//! Query keys: canonical identifiers for cached result sets.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{Entity, ListParams};

/// Segment marking a list key: `[entity, "list", parentId | null, filter]`.
pub const LIST_SEGMENT: &str = "list";

/// Segment marking a detail key: `[entity, "detail", id]`.
pub const DETAIL_SEGMENT: &str = "detail";

/// One discriminator of a [`QueryKey`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyPart {
    Null,
    Text(String),
}

impl KeyPart {
    /// Normalise an identifier taken from a JSON payload. Numbers and strings
    /// both become text so `5` and `"5"` name the same entry.
    pub fn id_from_value(value: &Value) -> Option<KeyPart> {
        match value {
            Value::String(s) if !s.is_empty() => Some(KeyPart::Text(s.clone())),
            Value::Number(n) => Some(KeyPart::Text(n.to_string())),
            _ => None,
        }
    }
}

impl From<&str> for KeyPart {
    fn from(s: &str) -> Self {
        KeyPart::Text(s.to_string())
    }
}

impl From<String> for KeyPart {
    fn from(s: String) -> Self {
        KeyPart::Text(s)
    }
}

/// Numeric ids become text, matching [`KeyPart::id_from_value`].
impl From<i64> for KeyPart {
    fn from(n: i64) -> Self {
        KeyPart::Text(n.to_string())
    }
}

impl<T: Into<KeyPart>> From<Option<T>> for KeyPart {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(KeyPart::Null)
    }
}

/// An ordered tuple `(scope, ...discriminators)`.
///
/// Equality and hashing follow the serialized form: two keys built from the
/// same parts are the same key no matter where they were built.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryKey(Vec<KeyPart>);

impl QueryKey {
    pub fn new(scope: impl Into<String>) -> Self {
        QueryKey(vec![KeyPart::Text(scope.into())])
    }

    pub fn with(mut self, part: impl Into<KeyPart>) -> Self {
        self.0.push(part.into());
        self
    }

    /// Prefix covering every list of `entity`.
    pub fn lists(entity: Entity) -> Self {
        QueryKey::new(entity.path()).with(LIST_SEGMENT)
    }

    /// Prefix covering every list of `entity` under one parent.
    pub fn lists_under(entity: Entity, parent_id: impl Into<KeyPart>) -> Self {
        QueryKey::lists(entity).with(parent_id)
    }

    /// Full key of one list view.
    pub fn list(entity: Entity, params: &ListParams) -> Self {
        QueryKey::lists_under(entity, params.parent_id.clone()).with(params.search.as_str())
    }

    pub fn detail(entity: Entity, id: impl Into<KeyPart>) -> Self {
        QueryKey::new(entity.path()).with(DETAIL_SEGMENT).with(id)
    }

    pub fn parts(&self) -> &[KeyPart] {
        &self.0
    }

    /// True when `prefix` covers this key (every key covers itself).
    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        self.0.starts_with(&prefix.0)
    }

    pub fn serialized(&self) -> String {
        serde_json::to_string(&self.0).unwrap_or_default()
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.serialized())
    }
}
