//! Entity and collection types.
//!
//! The engine treats documents as opaque JSON objects. The only field it ever
//! reads is `id`; replacement is always whole-document.

use crate::{error::Result, CollectionName, Error, SchemaVersion};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

/// An opaque document with a stable string `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct Entity(Value);

impl Entity {
    /// Wrap a JSON value, rejecting anything without a string `id`.
    pub fn new(value: Value) -> Result<Self> {
        match value.get("id") {
            Some(Value::String(_)) => Ok(Self(value)),
            _ => Err(Error::MissingId(truncated(&value))),
        }
    }

    /// The entity id.
    pub fn id(&self) -> &str {
        // Checked in `new`, and the inner value is never handed out mutably.
        self.0.get("id").and_then(Value::as_str).unwrap_or_default()
    }

    /// Borrow the underlying document.
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Consume into the underlying document.
    pub fn into_value(self) -> Value {
        self.0
    }
}

impl TryFrom<Value> for Entity {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        Entity::new(value)
    }
}

impl From<Entity> for Value {
    fn from(entity: Entity) -> Self {
        entity.0
    }
}

fn truncated(value: &Value) -> String {
    let mut text = value.to_string();
    if text.len() > 80 {
        let mut cut = 80;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push_str("...");
    }
    text
}

/// One named set of documents synchronized as a unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamedCollection {
    /// Collection name, also the durable storage key
    pub name: CollectionName,
    /// Schema version the items conform to
    pub schema_version: SchemaVersion,
    /// Documents, in display order
    pub items: Vec<Entity>,
}

impl NamedCollection {
    /// Create an empty collection.
    pub fn empty(name: impl Into<CollectionName>, schema_version: SchemaVersion) -> Self {
        Self {
            name: name.into(),
            schema_version,
            items: Vec::new(),
        }
    }

    /// Create a collection from items, checking id uniqueness.
    pub fn with_items(
        name: impl Into<CollectionName>,
        schema_version: SchemaVersion,
        items: Vec<Entity>,
    ) -> Result<Self> {
        let collection = Self {
            name: name.into(),
            schema_version,
            items,
        };
        collection.validate_unique_ids()?;
        Ok(collection)
    }

    /// Get an entity by id.
    pub fn get(&self, id: &str) -> Option<&Entity> {
        self.items.iter().find(|e| e.id() == id)
    }

    /// Iterate over all ids in order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.items.iter().map(Entity::id)
    }

    /// Number of entities.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Check if the collection has no entities.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Ensure ids are unique within the collection.
    pub fn validate_unique_ids(&self) -> Result<()> {
        validate_unique_ids(&self.name, &self.items)
    }
}

/// Ensure ids are unique within a list of entities.
pub fn validate_unique_ids(collection: &str, items: &[Entity]) -> Result<()> {
    let mut seen = HashSet::with_capacity(items.len());
    for entity in items {
        if !seen.insert(entity.id()) {
            return Err(Error::DuplicateId {
                collection: collection.to_string(),
                id: entity.id().to_string(),
            });
        }
    }
    Ok(())
}
