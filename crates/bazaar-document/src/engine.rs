//! Bazaar Document Engine
//!
//! Core engine that coordinates all document store operations: schema
//! definition and evolution, document writes, index management, queries
//! and aggregation pipelines.
//!
//! @version 0.1.0
//! @author Bazaar Development Team

use crate::aggregation::{self, Pipeline, QuerySource};
use crate::collection::{Collection, CollectionStats, Snapshot};
use crate::index::IndexDescriptor;
use crate::patch::Patch;
use crate::query::{Filter, Matcher, Query, QueryResult};
use crate::registry::SchemaRegistry;
use crate::store::{DocumentStore, MemoryStore};
use crate::types::{Document, DocumentId, Value};
use crate::validation::{Schema, Validator};
use bazaar_common::{BazaarError, EngineConfig, Result, Violation};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

// =============================================================================
// Document Engine
// =============================================================================

/// The main document storage and query engine.
pub struct DocumentEngine {
    config: EngineConfig,
    validator: Arc<Validator>,
    registry: Arc<SchemaRegistry>,
    collections: RwLock<HashMap<String, Arc<Collection>>>,
    stats: RwLock<EngineStats>,
}

impl DocumentEngine {
    /// Create a new document engine with default configuration.
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    /// Create a new document engine with custom configuration.
    pub fn with_config(config: EngineConfig) -> Self {
        let validator = Arc::new(Validator::new(config.regex_size_limit));
        Self {
            registry: Arc::new(SchemaRegistry::new(validator.clone())),
            validator,
            config,
            collections: RwLock::new(HashMap::new()),
            stats: RwLock::new(EngineStats::default()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn collection(&self, name: &str) -> Result<Arc<Collection>> {
        self.collections
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| BazaarError::UnknownCollection(name.to_string()))
    }

    // -------------------------------------------------------------------------
    // Schema and Collection Management
    // -------------------------------------------------------------------------

    /// Register a schema and create its collection over an in-memory store.
    /// Returns the schema version.
    pub fn define_schema(&self, collection: &str, schema: Schema) -> Result<u64> {
        self.create_collection_with_store(collection, schema, Box::new(MemoryStore::new()))
    }

    /// Register a schema and create its collection over a caller-supplied
    /// store.
    pub fn create_collection_with_store(
        &self,
        collection: &str,
        schema: Schema,
        store: Box<dyn DocumentStore>,
    ) -> Result<u64> {
        let mut collections = self.collections.write();

        if collections.len() >= self.config.max_collections {
            return Err(BazaarError::TooManyCollections(self.config.max_collections));
        }
        if collections.contains_key(collection) {
            return Err(BazaarError::CollectionExists(collection.to_string()));
        }

        let version = self.registry.register(collection, schema)?;
        collections.insert(
            collection.to_string(),
            Arc::new(Collection::new(
                collection,
                store,
                self.registry.clone(),
                self.validator.clone(),
                &self.config,
            )),
        );
        tracing::info!(collection, "collection created");
        Ok(version)
    }

    /// Replace a collection's schema. Stored documents are not re-validated
    /// until they are next written. Returns the new version.
    pub fn update_schema(&self, collection: &str, schema: Schema) -> Result<u64> {
        self.registry.update(collection, schema)
    }

    /// Current schema of a collection.
    pub fn schema(&self, collection: &str) -> Result<Arc<Schema>> {
        self.registry.get(collection)
    }

    /// Validate a document against a collection's schema without writing.
    pub fn validate(&self, collection: &str, doc: &Document) -> Result<Vec<Violation>> {
        self.collection(collection)?.validate(doc)
    }

    /// List all collection names, sorted.
    pub fn list_collections(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Check if a collection exists.
    pub fn collection_exists(&self, name: &str) -> bool {
        self.collections.read().contains_key(name)
    }

    // -------------------------------------------------------------------------
    // Document Operations
    // -------------------------------------------------------------------------

    /// Insert a document into a collection.
    pub fn insert(&self, collection: &str, doc: Document) -> Result<DocumentId> {
        let id = self.counted(self.collection(collection)?.insert(doc))?;
        self.stats.write().documents_inserted += 1;
        Ok(id)
    }

    /// Insert multiple documents, stopping at the first rejected one.
    pub fn insert_many(&self, collection: &str, docs: Vec<Document>) -> Result<Vec<DocumentId>> {
        let coll = self.collection(collection)?;
        let mut ids = Vec::with_capacity(docs.len());
        for doc in docs {
            ids.push(self.counted(coll.insert(doc))?);
            self.stats.write().documents_inserted += 1;
        }
        Ok(ids)
    }

    /// Get a document by ID.
    pub fn get(&self, collection: &str, id: &DocumentId) -> Result<Option<Document>> {
        self.collection(collection)?.get(id)
    }

    /// Apply a patch to a document, returning the updated document.
    pub fn update(&self, collection: &str, id: &DocumentId, patch: &Patch) -> Result<Document> {
        let doc = self.counted(self.collection(collection)?.update(id, patch))?;
        self.stats.write().documents_updated += 1;
        Ok(doc)
    }

    /// Replace a document wholesale.
    pub fn replace(&self, collection: &str, id: &DocumentId, doc: Document) -> Result<()> {
        self.counted(self.collection(collection)?.replace(id, doc))?;
        self.stats.write().documents_updated += 1;
        Ok(())
    }

    /// Apply a patch if the stored document matches `guard`.
    pub fn update_if(
        &self,
        collection: &str,
        id: &DocumentId,
        guard: &Query,
        patch: &Patch,
    ) -> Result<Document> {
        let doc = self.counted(self.collection(collection)?.update_if(id, guard, patch))?;
        self.stats.write().documents_updated += 1;
        Ok(doc)
    }

    /// Subtract `amount` from a numeric field if it holds at least that much.
    pub fn decrement(
        &self,
        collection: &str,
        id: &DocumentId,
        field: &str,
        amount: i64,
    ) -> Result<Document> {
        let doc = self.counted(self.collection(collection)?.decrement(id, field, amount))?;
        self.stats.write().documents_updated += 1;
        Ok(doc)
    }

    /// Delete a document.
    pub fn delete(&self, collection: &str, id: &DocumentId) -> Result<Document> {
        let doc = self.collection(collection)?.delete(id)?;
        self.stats.write().documents_deleted += 1;
        Ok(doc)
    }

    fn counted<T>(&self, result: Result<T>) -> Result<T> {
        if matches!(&result, Err(err) if err.is_constraint_error()) {
            self.stats.write().writes_rejected += 1;
        }
        result
    }

    // -------------------------------------------------------------------------
    // Query Operations
    // -------------------------------------------------------------------------

    /// Find documents matching a query.
    pub fn find(&self, collection: &str, query: &Query) -> Result<QueryResult> {
        let result = self.collection(collection)?.find(query)?;
        self.stats.write().queries_executed += 1;
        Ok(result)
    }

    /// Find one document matching a query.
    pub fn find_one(&self, collection: &str, query: &Query) -> Result<Option<Document>> {
        self.collection(collection)?.find_one(query)
    }

    /// Count documents matching a query.
    pub fn count(&self, collection: &str, query: &Query) -> Result<usize> {
        self.collection(collection)?.count(query)
    }

    /// Run an aggregation pipeline over a collection.
    ///
    /// Every collection the pipeline reads is read-locked, in name order,
    /// for the whole run, so lookups see the same state as the source scan.
    pub fn run_aggregation(&self, collection: &str, pipeline: &Pipeline) -> Result<Vec<Value>> {
        let handles = pipeline
            .collections(collection)
            .into_iter()
            .map(|name| self.collection(&name).map(|coll| (name, coll)))
            .collect::<Result<Vec<_>>>()?;

        let pinned = PinnedCollections {
            snapshots: handles
                .iter()
                .map(|(name, coll)| (name.as_str(), coll.snapshot()))
                .collect(),
            validator: &self.validator,
        };
        let rows = aggregation::execute(pipeline, collection, &pinned)?;
        drop(pinned);

        self.stats.write().aggregations_executed += 1;
        Ok(rows)
    }

    // -------------------------------------------------------------------------
    // Index Operations
    // -------------------------------------------------------------------------

    /// Create an index on a collection.
    pub fn create_index(&self, collection: &str, descriptor: IndexDescriptor) -> Result<()> {
        self.collection(collection)?.create_index(descriptor)
    }

    /// Drop an index by name.
    pub fn drop_index(&self, collection: &str, name: &str) -> Result<IndexDescriptor> {
        self.collection(collection)?.drop_index(name)
    }

    /// List indexes on a collection.
    pub fn list_indexes(&self, collection: &str) -> Result<Vec<IndexDescriptor>> {
        Ok(self.collection(collection)?.indexes())
    }

    // -------------------------------------------------------------------------
    // Statistics
    // -------------------------------------------------------------------------

    /// Get engine statistics.
    pub fn stats(&self) -> EngineStats {
        self.stats.read().clone()
    }

    /// Reset statistics.
    pub fn reset_stats(&self) {
        *self.stats.write() = EngineStats::default();
    }

    /// Get collection statistics.
    pub fn collection_stats(&self, collection: &str) -> Result<CollectionStats> {
        self.collection(collection)?.stats()
    }
}

impl Default for DocumentEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// The read-locked collections of one aggregation run.
struct PinnedCollections<'a> {
    snapshots: HashMap<&'a str, Snapshot<'a>>,
    validator: &'a Validator,
}

impl QuerySource for PinnedCollections<'_> {
    fn find(&self, collection: &str, query: &Query) -> Result<QueryResult> {
        self.snapshots
            .get(collection)
            .ok_or_else(|| BazaarError::UnknownCollection(collection.to_string()))?
            .find(query)
    }

    fn matcher<'f>(&self, filters: &'f [Filter]) -> Result<Matcher<'f>> {
        Matcher::new(filters, self.validator)
    }
}

// =============================================================================
// Engine Statistics
// =============================================================================

/// Statistics for the document engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub documents_inserted: u64,
    pub documents_updated: u64,
    pub documents_deleted: u64,
    pub writes_rejected: u64,
    pub queries_executed: u64,
    pub aggregations_executed: u64,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::{Accumulator, GroupKey};
    use crate::query::QueryBuilder;
    use crate::validation::FieldSchema;
    use parking_lot::Mutex;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    /// Wakes a waiting writer on its first scan, then gives it time to run.
    struct SignallingStore {
        inner: MemoryStore,
        on_scan: Mutex<Option<mpsc::Sender<()>>>,
    }

    impl DocumentStore for SignallingStore {
        fn insert(&self, doc: Document) -> Result<DocumentId> {
            self.inner.insert(doc)
        }

        fn get(&self, id: &DocumentId) -> Result<Option<Document>> {
            self.inner.get(id)
        }

        fn update(&self, id: &DocumentId, doc: Document) -> Result<()> {
            self.inner.update(id, doc)
        }

        fn scan(&self) -> Result<Vec<Document>> {
            if let Some(tx) = self.on_scan.lock().take() {
                let _ = tx.send(());
                thread::sleep(Duration::from_millis(100));
            }
            self.inner.scan()
        }

        fn delete(&self, id: &DocumentId) -> Result<Option<Document>> {
            self.inner.delete(id)
        }

        fn len(&self) -> usize {
            self.inner.len()
        }
    }

    fn engine_with_items() -> DocumentEngine {
        let engine = DocumentEngine::new();
        engine
            .define_schema(
                "items",
                Schema::new("items")
                    .required_field("name", FieldSchema::string())
                    .field("price", FieldSchema::int().min(0.0)),
            )
            .unwrap();
        engine
    }

    #[test]
    fn test_engine_creation() {
        let engine = DocumentEngine::new();
        assert!(engine.list_collections().is_empty());
    }

    #[test]
    fn test_collection_management() {
        let engine = engine_with_items();
        assert!(engine.collection_exists("items"));
        assert_eq!(engine.list_collections(), vec!["items".to_string()]);

        assert!(matches!(
            engine.define_schema("items", Schema::new("items")),
            Err(BazaarError::CollectionExists(_))
        ));
        assert!(matches!(
            engine.find("missing", &Query::new()),
            Err(BazaarError::UnknownCollection(_))
        ));
    }

    #[test]
    fn test_too_many_collections() {
        let engine = DocumentEngine::with_config(EngineConfig {
            max_collections: 1,
            ..EngineConfig::default()
        });
        engine.define_schema("a", Schema::new("a")).unwrap();
        assert!(matches!(
            engine.define_schema("b", Schema::new("b")),
            Err(BazaarError::TooManyCollections(1))
        ));
    }

    #[test]
    fn test_document_crud() {
        let engine = engine_with_items();

        let mut doc = Document::with_id("doc1");
        doc.set("name", "Alice");
        doc.set("price", 30i64);

        let id = engine.insert("items", doc).unwrap();
        assert_eq!(id.as_str(), "doc1");

        let retrieved = engine.get("items", &id).unwrap().unwrap();
        assert_eq!(retrieved.get("name").and_then(|v| v.as_str()), Some("Alice"));

        engine
            .update("items", &id, &Patch::new().set("name", "Alice Smith"))
            .unwrap();
        let retrieved = engine.get("items", &id).unwrap().unwrap();
        assert_eq!(
            retrieved.get("name").and_then(|v| v.as_str()),
            Some("Alice Smith")
        );

        engine.delete("items", &id).unwrap();
        assert!(engine.get("items", &id).unwrap().is_none());
    }

    #[test]
    fn test_query() {
        let engine = engine_with_items();

        for i in 0..10 {
            let mut doc = Document::new();
            doc.set("name", format!("Product {}", i));
            doc.set("price", (i * 10) as i64);
            engine.insert("items", doc).unwrap();
        }

        let query = QueryBuilder::new().gt("price", 50i64).build();
        let result = engine.find("items", &query).unwrap();
        assert_eq!(result.count(), 4);
        assert_eq!(engine.count("items", &query).unwrap(), 4);
    }

    #[test]
    fn test_index() {
        let engine = engine_with_items();

        engine
            .create_index("items", IndexDescriptor::btree("name"))
            .unwrap();

        let indexes = engine.list_indexes("items").unwrap();
        assert_eq!(indexes[0].name, "name_1");

        engine.drop_index("items", "name_1").unwrap();
        assert!(engine.list_indexes("items").unwrap().is_empty());
    }

    #[test]
    fn test_schema_update_bumps_version() {
        let engine = engine_with_items();
        let evolved = Schema::new("items")
            .required_field("name", FieldSchema::string())
            .field("price", FieldSchema::int().min(0.0))
            .field("tags", FieldSchema::any());

        assert_eq!(engine.update_schema("items", evolved).unwrap(), 2);
        assert_eq!(engine.collection_stats("items").unwrap().schema_version, 2);
        assert!(engine.schema("items").unwrap().property("tags").is_some());
    }

    #[test]
    fn test_run_aggregation() {
        let engine = engine_with_items();
        for price in [10i64, 20, 30] {
            let mut doc = Document::new();
            doc.set("name", "x");
            doc.set("price", price);
            engine.insert("items", doc).unwrap();
        }

        let pipeline = Pipeline::new().group(
            GroupKey::Field("name".to_string()),
            vec![("total", Accumulator::Sum("price".to_string()))],
        );
        let rows = engine.run_aggregation("items", &pipeline).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_path("total"), Some(&Value::Int(60)));
        assert_eq!(engine.stats().aggregations_executed, 1);
    }

    #[test]
    fn test_aggregation_lookup_ignores_writes_during_run() {
        let engine = Arc::new(engine_with_items());
        let (tx, rx) = mpsc::channel();
        engine
            .create_collection_with_store(
                "orders",
                Schema::new("orders").required_field("item", FieldSchema::string()),
                Box::new(SignallingStore {
                    inner: MemoryStore::new(),
                    on_scan: Mutex::new(Some(tx)),
                }),
            )
            .unwrap();
        let mut order = Document::with_id("o1");
        order.set("item", "widget");
        engine.insert("orders", order).unwrap();

        let writer = {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                rx.recv().unwrap();
                let mut item = Document::new();
                item.set("name", "widget");
                engine.insert("items", item).unwrap();
            })
        };

        let pipeline = Pipeline::new().lookup("items", "item", "name", "matching");
        let rows = engine.run_aggregation("orders", &pipeline).unwrap();
        writer.join().unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_path("matching"), Some(&Value::Array(vec![])));
        assert_eq!(engine.count("items", &Query::new()).unwrap(), 1);
    }

    #[test]
    fn test_aggregation_over_unknown_lookup_collection() {
        let engine = engine_with_items();
        let pipeline = Pipeline::new().lookup("missing", "name", "_id", "joined");
        assert!(matches!(
            engine.run_aggregation("items", &pipeline),
            Err(BazaarError::UnknownCollection(_))
        ));
    }

    #[test]
    fn test_stats() {
        let engine = engine_with_items();

        for _ in 0..5 {
            let mut doc = Document::new();
            doc.set("name", "x");
            engine.insert("items", doc).unwrap();
        }
        let mut bad = Document::new();
        bad.set("price", -1i64);
        assert!(engine.insert("items", bad).is_err());

        let stats = engine.stats();
        assert_eq!(stats.documents_inserted, 5);
        assert_eq!(stats.writes_rejected, 1);

        engine.reset_stats();
        assert_eq!(engine.stats(), EngineStats::default());
    }
}
