//! In-memory document store.
//!
//! Each collection is an ordered list of JSON documents keyed by their string
//! `id`. Insertion order is preserved so listings are stable.

use dashmap::DashMap;
use serde_json::{Map, Value};
use tabsync_engine::Entity;

/// Documents of every collection, keyed by collection name.
#[derive(Debug, Default)]
pub struct DocumentStore {
    collections: DashMap<String, Vec<Value>>,
}

/// Result of a single-document write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Created,
    Updated,
}

impl DocumentStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Summaries of every document in `collection`: the id plus top-level
    /// scalar fields. Unknown collections list as empty.
    pub fn list(&self, collection: &str) -> Vec<Value> {
        self.collections
            .get(collection)
            .map(|docs| docs.iter().map(summarize).collect())
            .unwrap_or_default()
    }

    /// Full document `id` of `collection`.
    pub fn get(&self, collection: &str, id: &str) -> Option<Value> {
        self.collections
            .get(collection)?
            .iter()
            .find(|doc| document_id(doc) == Some(id))
            .cloned()
    }

    /// Replace `collection` entirely.
    pub fn replace(&self, collection: &str, items: Vec<Entity>) -> usize {
        let docs: Vec<Value> = items.into_iter().map(Entity::into_value).collect();
        let count = docs.len();
        self.collections.insert(collection.to_string(), docs);
        count
    }

    /// Insert or replace one document, keeping its position when it exists.
    pub fn upsert(&self, collection: &str, document: Entity) -> Upsert {
        let mut docs = self.collections.entry(collection.to_string()).or_default();
        let id = document.id().to_string();
        match docs.iter_mut().find(|doc| document_id(doc) == Some(&id)) {
            Some(existing) => {
                *existing = document.into_value();
                Upsert::Updated
            }
            None => {
                docs.push(document.into_value());
                Upsert::Created
            }
        }
    }

    /// Remove one document. Returns `false` when it did not exist.
    pub fn remove(&self, collection: &str, id: &str) -> bool {
        let Some(mut docs) = self.collections.get_mut(collection) else {
            return false;
        };
        let before = docs.len();
        docs.retain(|doc| document_id(doc) != Some(id));
        docs.len() != before
    }

    /// Number of documents in `collection`.
    pub fn count(&self, collection: &str) -> usize {
        self.collections
            .get(collection)
            .map(|docs| docs.len())
            .unwrap_or(0)
    }
}

fn document_id(doc: &Value) -> Option<&str> {
    doc.get("id").and_then(Value::as_str)
}

fn summarize(doc: &Value) -> Value {
    let Some(fields) = doc.as_object() else {
        return Value::Object(Map::new());
    };
    let summary: Map<String, Value> = fields
        .iter()
        .filter(|(key, value)| *key == "id" || !(value.is_object() || value.is_array()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    Value::Object(summary)
}
