//! Bazaar Schema Registry
//!
//! Holds one validation schema per collection. Schemas evolve by full
//! replacement; documents already stored are not re-validated until they
//! are rewritten.
//!
//! @version 0.1.0
//! @author Bazaar Development Team

use crate::validation::{Schema, Validator};
use bazaar_common::{BazaarError, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

// =============================================================================
// Registered Schema
// =============================================================================

/// A schema as held by the registry.
#[derive(Debug, Clone)]
pub struct RegisteredSchema {
    pub schema: Arc<Schema>,
    /// 1 on register, incremented by every update.
    pub version: u64,
}

// =============================================================================
// Schema Registry
// =============================================================================

/// Registry of collection schemas.
pub struct SchemaRegistry {
    schemas: RwLock<HashMap<String, RegisteredSchema>>,
    validator: Arc<Validator>,
}

impl SchemaRegistry {
    pub fn new(validator: Arc<Validator>) -> Self {
        Self {
            schemas: RwLock::new(HashMap::new()),
            validator,
        }
    }

    /// Register the schema for a new collection.
    pub fn register(&self, collection: &str, schema: Schema) -> Result<u64> {
        self.validator.check_schema(&schema)?;

        let mut schemas = self.schemas.write();
        if schemas.contains_key(collection) {
            return Err(BazaarError::CollectionExists(collection.to_string()));
        }
        schemas.insert(
            collection.to_string(),
            RegisteredSchema {
                schema: Arc::new(schema),
                version: 1,
            },
        );
        tracing::info!(collection, "schema registered");
        Ok(1)
    }

    /// Get the current schema of a collection.
    pub fn get(&self, collection: &str) -> Result<Arc<Schema>> {
        self.get_versioned(collection).map(|r| r.schema)
    }

    pub fn get_versioned(&self, collection: &str) -> Result<RegisteredSchema> {
        self.schemas
            .read()
            .get(collection)
            .cloned()
            .ok_or_else(|| BazaarError::UnknownCollection(collection.to_string()))
    }

    /// Replace the schema of a collection. Returns the new version.
    pub fn update(&self, collection: &str, schema: Schema) -> Result<u64> {
        self.validator.check_schema(&schema)?;

        let mut schemas = self.schemas.write();
        let entry = schemas
            .get_mut(collection)
            .ok_or_else(|| BazaarError::UnknownCollection(collection.to_string()))?;
        entry.schema = Arc::new(schema);
        entry.version += 1;

        tracing::info!(collection, version = entry.version, "schema updated");
        Ok(entry.version)
    }

    pub fn contains(&self, collection: &str) -> bool {
        self.schemas.read().contains_key(collection)
    }

    pub fn len(&self) -> usize {
        self.schemas.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.read().is_empty()
    }

    pub fn collections(&self) -> Vec<String> {
        let mut names: Vec<String> = self.schemas.read().keys().cloned().collect();
        names.sort();
        names
    }
}

// =============================================================================
// Tests
// =============================================================================
