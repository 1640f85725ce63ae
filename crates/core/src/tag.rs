//! Tags: per-user facts used as business state.
//!
//! A tag is a `(user, key)` pair with an optional value. Writes are upserts:
//! re-writing a key updates it, it never creates a second row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A stored tag row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    pub user_id: String,

    pub key: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

/// Read-only snapshot of a user's tags, taken for one evaluation.
///
/// Never cached across evaluations; callers fetch a fresh one from the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TagSet {
    tags: HashMap<String, Option<String>>,
}

impl TagSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a snapshot from stored rows.
    pub fn from_tags<'a>(tags: impl IntoIterator<Item = &'a Tag>) -> Self {
        Self {
            tags: tags
                .into_iter()
                .map(|t| (t.key.clone(), t.value.clone()))
                .collect(),
        }
    }

    /// Builder used mostly by tests and the gateway.
    pub fn with(mut self, key: impl Into<String>, value: Option<&str>) -> Self {
        self.tags.insert(key.into(), value.map(String::from));
        self
    }

    pub fn contains(&self, key: &str) -> bool {
        self.tags.contains_key(key)
    }

    /// The tag's value, or `None` if absent or valueless.
    pub fn value(&self, key: &str) -> Option<&str> {
        self.tags.get(key).and_then(|v| v.as_deref())
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.tags.keys().map(String::as_str)
    }
}

impl FromIterator<(String, Option<String>)> for TagSet {
    fn from_iter<I: IntoIterator<Item = (String, Option<String>)>>(iter: I) -> Self {
        Self {
            tags: iter.into_iter().collect(),
        }
    }
}
