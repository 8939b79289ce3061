//! Bazaar Document Collection
//!
//! Binds one storage handle to its index manager and to the shared schema
//! registry and validator. Every write runs validate, unique pre-check,
//! store write and index apply under the collection write lock, so a
//! rejected write leaves nothing behind and readers never see a document
//! without its index entries.
//!
//! @version 0.1.0
//! @author Bazaar Development Team

use crate::index::{IndexDescriptor, IndexManager, IndexStats};
use crate::patch::Patch;
use crate::query::{evaluate, Filter, Matcher, Query, QueryResult};
use crate::registry::SchemaRegistry;
use crate::store::{DocumentStore, StoreStats};
use crate::types::{Document, DocumentId};
use crate::validation::Validator;
use bazaar_common::{BazaarError, EngineConfig, Result, Violation};
use parking_lot::{RwLock, RwLockReadGuard};
use serde::Serialize;
use std::sync::Arc;

// =============================================================================
// Collection
// =============================================================================

/// A collection of documents.
pub struct Collection {
    name: String,
    store: Box<dyn DocumentStore>,
    indexes: RwLock<IndexManager>,
    registry: Arc<SchemaRegistry>,
    validator: Arc<Validator>,
    max_document_size: usize,
    validate_on_write: bool,
}

impl Collection {
    /// Create a collection over `store`. Its schema must already be
    /// registered under `name`.
    pub fn new(
        name: impl Into<String>,
        store: Box<dyn DocumentStore>,
        registry: Arc<SchemaRegistry>,
        validator: Arc<Validator>,
        config: &EngineConfig,
    ) -> Self {
        let name = name.into();
        Self {
            indexes: RwLock::new(IndexManager::new(name.clone(), config.geo_cell_degrees)),
            name,
            store,
            registry,
            validator,
            max_document_size: config.max_document_size,
            validate_on_write: config.validate_on_write,
        }
    }

    /// Get the collection name.
    pub fn name(&self) -> &str {
        &self.name
    }

    // -------------------------------------------------------------------------
    // Validation
    // -------------------------------------------------------------------------

    /// Validate a document against the collection's current schema without
    /// writing it.
    pub fn validate(&self, doc: &Document) -> Result<Vec<Violation>> {
        let schema = self.registry.get(&self.name)?;
        Ok(self.validator.validate(&schema, doc))
    }

    fn check_document(&self, doc: &Document) -> Result<()> {
        let size = doc.encoded_size();
        if size > self.max_document_size {
            return Err(BazaarError::DocumentTooLarge {
                size,
                limit: self.max_document_size,
            });
        }
        if self.validate_on_write {
            let schema = self.registry.get(&self.name)?;
            self.validator.ensure_valid(&schema, doc)?;
        }
        Ok(())
    }

    fn rejected(&self, id: &DocumentId, err: &BazaarError) {
        tracing::debug!(collection = %self.name, id = %id, error = %err, "write rejected");
    }

    // -------------------------------------------------------------------------
    // Document Operations
    // -------------------------------------------------------------------------

    /// Insert a document.
    pub fn insert(&self, doc: Document) -> Result<DocumentId> {
        let mut indexes = self.indexes.write();
        let id = doc.id.clone();

        let result = self
            .check_document(&doc)
            .and_then(|_| indexes.check_unique(&doc))
            .and_then(|_| self.store.insert(doc.clone()));
        match result {
            Ok(_) => {
                indexes.insert(&doc);
                Ok(id)
            }
            Err(err) => {
                self.rejected(&id, &err);
                Err(err)
            }
        }
    }

    /// Insert multiple documents in order. Stops at the first rejected
    /// document; the ones before it stay inserted.
    pub fn insert_many(&self, docs: Vec<Document>) -> Result<Vec<DocumentId>> {
        let mut ids = Vec::with_capacity(docs.len());

        for doc in docs {
            let id = self.insert(doc)?;
            ids.push(id);
        }

        Ok(ids)
    }

    /// Get a document by ID.
    pub fn get(&self, id: &DocumentId) -> Result<Option<Document>> {
        let _indexes = self.indexes.read();
        self.store.get(id)
    }

    /// Replace a document wholesale. The stored id is kept.
    pub fn replace(&self, id: &DocumentId, mut doc: Document) -> Result<()> {
        let mut indexes = self.indexes.write();
        doc.id = id.clone();

        let old = self.existing(id)?;
        self.write_replacement(&mut indexes, &old, doc)
    }

    /// Apply a patch to a document.
    pub fn update(&self, id: &DocumentId, patch: &Patch) -> Result<Document> {
        let mut indexes = self.indexes.write();

        let old = self.existing(id)?;
        let new = patch.apply(&old)?;
        self.write_replacement(&mut indexes, &old, new.clone())?;
        Ok(new)
    }

    /// Apply a patch only if the stored document matches `guard`. The guard
    /// and the write happen under one write lock, so concurrent callers
    /// cannot both pass a guard that only one of them should.
    pub fn update_if(&self, id: &DocumentId, guard: &Query, patch: &Patch) -> Result<Document> {
        let mut indexes = self.indexes.write();

        let guard = Matcher::new(&guard.filters, &self.validator)?;
        let old = self.existing(id)?;
        if !guard.matches(&old) {
            tracing::warn!(collection = %self.name, id = %id, "update guard failed");
            return Err(BazaarError::InvariantViolation(format!(
                "document {} in {} does not satisfy the update guard",
                id, self.name
            )));
        }
        let new = patch.apply(&old)?;
        self.write_replacement(&mut indexes, &old, new.clone())?;
        Ok(new)
    }

    /// Subtract `amount` from a numeric field, failing with
    /// `InvariantViolation` if the field holds less than `amount`.
    /// `amount` must be positive.
    pub fn decrement(&self, id: &DocumentId, field: &str, amount: i64) -> Result<Document> {
        if amount <= 0 {
            return Err(BazaarError::InvalidPatch(format!(
                "decrement of {} by {} must be positive",
                field, amount
            )));
        }
        let guard = Query::new().with_filter(Filter::gte(field, amount));
        let patch = Patch::new().inc(field, -amount);
        self.update_if(id, &guard, &patch)
    }

    /// Delete a document.
    pub fn delete(&self, id: &DocumentId) -> Result<Document> {
        let mut indexes = self.indexes.write();

        match self.store.delete(id)? {
            Some(doc) => {
                indexes.remove(&doc);
                Ok(doc)
            }
            None => Err(BazaarError::DocumentNotFound(id.to_string())),
        }
    }

    /// Get the number of documents.
    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    fn existing(&self, id: &DocumentId) -> Result<Document> {
        self.store
            .get(id)?
            .ok_or_else(|| BazaarError::DocumentNotFound(id.to_string()))
    }

    fn write_replacement(
        &self,
        indexes: &mut IndexManager,
        old: &Document,
        new: Document,
    ) -> Result<()> {
        let result = self
            .check_document(&new)
            .and_then(|_| indexes.check_unique(&new))
            .and_then(|_| self.store.update(&old.id, new.clone()));
        match result {
            Ok(()) => {
                indexes.replace(old, &new);
                Ok(())
            }
            Err(err) => {
                self.rejected(&old.id, &err);
                Err(err)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Query Operations
    // -------------------------------------------------------------------------

    /// Find documents matching a query.
    pub fn find(&self, query: &Query) -> Result<QueryResult> {
        self.snapshot().find(query)
    }

    /// Read-lock the collection. Writers wait until the snapshot is dropped.
    pub(crate) fn snapshot(&self) -> Snapshot<'_> {
        Snapshot {
            collection: self,
            indexes: self.indexes.read(),
        }
    }

    /// Find the first document matching a query.
    pub fn find_one(&self, query: &Query) -> Result<Option<Document>> {
        let query = query.clone().with_limit(1);
        Ok(self.find(&query)?.into_iter().next())
    }

    /// Count documents matching a query.
    pub fn count(&self, query: &Query) -> Result<usize> {
        Ok(self.find(query)?.count())
    }

    // -------------------------------------------------------------------------
    // Index Operations
    // -------------------------------------------------------------------------

    /// Create an index, back-filling it from the stored documents.
    pub fn create_index(&self, descriptor: IndexDescriptor) -> Result<()> {
        let mut indexes = self.indexes.write();
        let documents = self.store.scan()?;
        indexes.create_index(descriptor, &documents)
    }

    /// Drop an index by name.
    pub fn drop_index(&self, name: &str) -> Result<IndexDescriptor> {
        self.indexes.write().drop_index(name)
    }

    /// Descriptors of every index, in creation order.
    pub fn indexes(&self) -> Vec<IndexDescriptor> {
        self.indexes.read().descriptors()
    }

    // -------------------------------------------------------------------------
    // Statistics
    // -------------------------------------------------------------------------

    pub fn stats(&self) -> Result<CollectionStats> {
        let indexes = self.indexes.read();
        let schema = self.registry.get_versioned(&self.name)?;
        let store = self.store.stats();

        Ok(CollectionStats {
            name: self.name.clone(),
            document_count: self.store.len(),
            schema_version: schema.version,
            indexes: indexes.stats(),
            store,
        })
    }
}

// =============================================================================
// Snapshot
// =============================================================================

/// A read-locked view of one collection. Every query through it sees the
/// same documents and index entries.
pub(crate) struct Snapshot<'a> {
    collection: &'a Collection,
    indexes: RwLockReadGuard<'a, IndexManager>,
}

impl Snapshot<'_> {
    pub(crate) fn find(&self, query: &Query) -> Result<QueryResult> {
        evaluate(
            &self.collection.name,
            query,
            self.collection.store.as_ref(),
            &self.indexes,
            &self.collection.validator,
        )
    }
}

// =============================================================================
// Collection Statistics
// =============================================================================

/// Statistics for a collection.
#[derive(Debug, Clone, Serialize)]
pub struct CollectionStats {
    pub name: String,
    pub document_count: usize,
    pub schema_version: u64,
    pub indexes: Vec<IndexStats>,
    #[serde(skip)]
    pub store: StoreStats,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::SortDirection;
    use crate::query::QueryBuilder;
    use crate::store::MemoryStore;
    use crate::types::Value;
    use crate::validation::{FieldSchema, Schema};

    fn collection_with(schema: Schema, config: EngineConfig) -> Collection {
        let validator = Arc::new(Validator::new(config.regex_size_limit));
        let registry = Arc::new(SchemaRegistry::new(validator.clone()));
        registry.register("produtos", schema).unwrap();
        Collection::new(
            "produtos",
            Box::new(MemoryStore::new()),
            registry,
            validator,
            &config,
        )
    }

    fn products() -> Collection {
        let schema = Schema::new("produtos")
            .required_field("nome", FieldSchema::string().min_length(3))
            .required_field("quantidade_disponivel", FieldSchema::int().min(0.0))
            .field("sku", FieldSchema::string());
        collection_with(schema, EngineConfig::default())
    }

    fn product(id: &str, nome: &str, qty: i64) -> Document {
        let mut doc = Document::with_id(id);
        doc.set("nome", nome);
        doc.set("quantidade_disponivel", qty);
        doc
    }

    #[test]
    fn test_insert_and_get() {
        let collection = products();

        let id = collection.insert(product("p1", "Celular", 5)).unwrap();
        assert_eq!(id.as_str(), "p1");

        let retrieved = collection.get(&id).unwrap().unwrap();
        assert_eq!(retrieved, product("p1", "Celular", 5));
    }

    #[test]
    fn test_duplicate_id() {
        let collection = products();

        collection.insert(product("same-id", "Celular", 1)).unwrap();
        let result = collection.insert(product("same-id", "Notebook", 1));

        assert!(matches!(result, Err(BazaarError::DuplicateId(_))));
    }

    #[test]
    fn test_invalid_document_leaves_no_trace() {
        let collection = products();
        collection
            .create_index(IndexDescriptor::btree("nome"))
            .unwrap();

        let result = collection.insert(product("p1", "TV", -1));
        match result {
            Err(BazaarError::ValidationFailed(violations)) => assert_eq!(violations.len(), 2),
            other => panic!("expected validation failure, got {:?}", other),
        }

        assert!(collection.is_empty());
        assert_eq!(collection.stats().unwrap().indexes[0].entries, 0);
    }

    #[test]
    fn test_validation_can_be_disabled() {
        let schema = Schema::new("produtos").required_field("nome", FieldSchema::string());
        let config = EngineConfig {
            validate_on_write: false,
            ..EngineConfig::default()
        };
        let collection = collection_with(schema, config);

        assert!(collection.insert(Document::with_id("p1")).is_ok());
    }

    #[test]
    fn test_document_too_large() {
        let config = EngineConfig {
            max_document_size: 64,
            ..EngineConfig::default()
        };
        let collection = collection_with(Schema::new("produtos"), config);

        let mut doc = Document::with_id("p1");
        doc.set("descricao", "x".repeat(100));
        assert!(matches!(
            collection.insert(doc),
            Err(BazaarError::DocumentTooLarge { limit: 64, .. })
        ));
    }

    #[test]
    fn test_unique_index_blocks_duplicate_and_allows_self_update() {
        let collection = products();
        collection
            .create_index(IndexDescriptor::btree("sku").unique())
            .unwrap();

        let mut first = product("p1", "Celular", 1);
        first.set("sku", "ABC");
        collection.insert(first).unwrap();

        let mut second = product("p2", "Notebook", 1);
        second.set("sku", "ABC");
        assert!(matches!(
            collection.insert(second),
            Err(BazaarError::UniqueViolation { .. })
        ));
        assert!(collection.get(&DocumentId::new("p2")).unwrap().is_none());

        let patched = collection
            .update(&DocumentId::new("p1"), &Patch::new().set("nome", "Celular X"))
            .unwrap();
        assert_eq!(patched.get("sku").and_then(Value::as_str), Some("ABC"));
    }

    #[test]
    fn test_update_keeps_indexes_in_step() {
        let collection = products();
        collection
            .create_index(IndexDescriptor::btree("quantidade_disponivel"))
            .unwrap();
        collection.insert(product("p1", "Celular", 5)).unwrap();

        collection
            .update(
                &DocumentId::new("p1"),
                &Patch::new().set("quantidade_disponivel", 9i64),
            )
            .unwrap();

        let old = QueryBuilder::new().eq("quantidade_disponivel", 5i64).build();
        let new = QueryBuilder::new().eq("quantidade_disponivel", 9i64).build();
        assert_eq!(collection.count(&old).unwrap(), 0);
        let result = collection.find(&new).unwrap();
        assert_eq!(result.count(), 1);
        assert_eq!(result.index_used.as_deref(), Some("quantidade_disponivel_1"));
    }

    #[test]
    fn test_rejected_patch_is_not_applied() {
        let collection = products();
        collection.insert(product("p1", "Celular", 5)).unwrap();

        let result = collection.update(
            &DocumentId::new("p1"),
            &Patch::new().inc("quantidade_disponivel", -6i64),
        );
        assert!(matches!(result, Err(BazaarError::ValidationFailed(_))));

        let stored = collection.get(&DocumentId::new("p1")).unwrap().unwrap();
        assert_eq!(stored.get("quantidade_disponivel"), Some(&Value::Int(5)));
    }

    #[test]
    fn test_decrement_guard() {
        let collection = products();
        collection.insert(product("p1", "Celular", 2)).unwrap();
        let id = DocumentId::new("p1");

        let doc = collection.decrement(&id, "quantidade_disponivel", 2).unwrap();
        assert_eq!(doc.get("quantidade_disponivel"), Some(&Value::Int(0)));

        assert!(matches!(
            collection.decrement(&id, "quantidade_disponivel", 1),
            Err(BazaarError::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_decrement_rejects_non_positive_amount() {
        let collection = products();
        collection.insert(product("p1", "Celular", 2)).unwrap();
        let id = DocumentId::new("p1");

        for amount in [0, -3, i64::MIN] {
            assert!(matches!(
                collection.decrement(&id, "quantidade_disponivel", amount),
                Err(BazaarError::InvalidPatch(_))
            ));
        }
        let stored = collection.get(&id).unwrap().unwrap();
        assert_eq!(stored.get("quantidade_disponivel"), Some(&Value::Int(2)));
    }

    #[test]
    fn test_replace_and_delete() {
        let collection = products();
        collection.insert(product("p1", "Celular", 5)).unwrap();
        let id = DocumentId::new("p1");

        collection
            .replace(&id, product("ignored", "Notebook", 3))
            .unwrap();
        let stored = collection.get(&id).unwrap().unwrap();
        assert_eq!(stored.id, id);
        assert_eq!(stored.get("nome").and_then(Value::as_str), Some("Notebook"));

        collection.delete(&id).unwrap();
        assert!(matches!(
            collection.delete(&id),
            Err(BazaarError::DocumentNotFound(_))
        ));
        assert!(matches!(
            collection.replace(&id, product("p1", "Celular", 1)),
            Err(BazaarError::DocumentNotFound(_))
        ));
    }

    #[test]
    fn test_find_one_and_sorted_find() {
        let collection = products();
        for (id, qty) in [("p1", 3), ("p2", 1), ("p3", 2)] {
            collection.insert(product(id, "Produto", qty)).unwrap();
        }

        let query = QueryBuilder::new().sort("quantidade_disponivel", true).build();
        let ids: Vec<String> = collection
            .find(&query)
            .unwrap()
            .ids()
            .into_iter()
            .map(|id| id.0)
            .collect();
        assert_eq!(ids, vec!["p2", "p3", "p1"]);

        let first = collection.find_one(&query).unwrap().unwrap();
        assert_eq!(first.id.as_str(), "p2");
    }

    #[test]
    fn test_index_lifecycle() {
        let collection = products();
        collection.insert(product("p1", "Celular", 5)).unwrap();

        let descriptor = IndexDescriptor::compound(vec![
            ("nome".to_string(), SortDirection::Ascending),
            ("quantidade_disponivel".to_string(), SortDirection::Descending),
        ]);
        collection.create_index(descriptor.clone()).unwrap();
        assert!(matches!(
            collection.create_index(descriptor.clone()),
            Err(BazaarError::DuplicateIndex(_))
        ));

        let stats = collection.stats().unwrap();
        assert_eq!(stats.indexes[0].entries, 1);
        assert_eq!(stats.schema_version, 1);

        collection.drop_index(&descriptor.name).unwrap();
        assert!(collection.indexes().is_empty());
        assert!(matches!(
            collection.drop_index(&descriptor.name),
            Err(BazaarError::IndexNotFound(_))
        ));
    }
}
