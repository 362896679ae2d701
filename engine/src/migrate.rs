//! Schema migrations for stored collections.
//!
//! Each step upgrades a collection from version `n` to `n + 1`. Steps work on
//! raw JSON so they may reshape documents freely; the result is re-checked for
//! ids and uniqueness before it reaches a replica.

use crate::{error::Result, Entity, Error, NamedCollection, SchemaVersion};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A single upgrade step over the documents of one collection.
pub type MigrationStep = Arc<dyn Fn(Vec<Value>) -> Vec<Value> + Send + Sync>;

/// Ordered set of upgrade steps for one collection.
#[derive(Clone, Default)]
pub struct Migrations {
    steps: BTreeMap<SchemaVersion, MigrationStep>,
}

impl Migrations {
    /// Create an empty migration set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the step that upgrades `from` to `from + 1`.
    pub fn step<F>(mut self, from: SchemaVersion, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Vec<Value> + Send + Sync + 'static,
    {
        self.steps.insert(from, Arc::new(f));
        self
    }

    /// Check if no steps are registered.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Upgrade `collection` to `target`.
    ///
    /// A collection already at `target` is returned untouched. A collection
    /// written by a newer schema cannot be read.
    pub fn upgrade(
        &self,
        collection: NamedCollection,
        target: SchemaVersion,
    ) -> Result<NamedCollection> {
        let NamedCollection {
            name,
            schema_version,
            items,
        } = collection;

        if schema_version == target {
            return Ok(NamedCollection {
                name,
                schema_version,
                items,
            });
        }
        if schema_version > target {
            return Err(Error::UnsupportedVersion {
                collection: name,
                stored: schema_version,
                running: target,
            });
        }

        let mut values: Vec<Value> = items.into_iter().map(Entity::into_value).collect();
        for version in schema_version..target {
            let step = self.steps.get(&version).ok_or_else(|| Error::MissingMigration {
                collection: name.clone(),
                from: version,
            })?;
            values = step(values);
            tracing::debug!(collection = %name, from = version, to = version + 1, "Applied migration step");
        }

        let items = values
            .into_iter()
            .map(Entity::new)
            .collect::<Result<Vec<_>>>()?;
        NamedCollection::with_items(name, target, items)
    }
}

impl fmt::Debug for Migrations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Migrations")
            .field("from_versions", &self.steps.keys().collect::<Vec<_>>())
            .finish()
    }
}
