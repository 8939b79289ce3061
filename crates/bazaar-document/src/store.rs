//! Bazaar Store - Document Storage Interface
//!
//! Defines the minimal storage trait the document core writes through and
//! the bundled in-memory implementation. Durable storage engines plug in by
//! implementing `DocumentStore`.
//!
//! @version 0.1.0
//! @author Bazaar Development Team

use crate::types::{Document, DocumentId};
use bazaar_common::{BazaarError, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

// =============================================================================
// Document Store Trait
// =============================================================================

/// Storage backend for the documents of one collection.
pub trait DocumentStore: Send + Sync {
    /// Store a new document. Fails with `DuplicateId` if the id is taken.
    fn insert(&self, doc: Document) -> Result<DocumentId>;

    /// Read a document by id.
    fn get(&self, id: &DocumentId) -> Result<Option<Document>>;

    /// Replace a stored document. Fails with `DocumentNotFound`.
    fn update(&self, id: &DocumentId, doc: Document) -> Result<()>;

    /// Snapshot of every stored document.
    fn scan(&self) -> Result<Vec<Document>>;

    /// Remove a document, returning it if it existed.
    fn delete(&self, id: &DocumentId) -> Result<Option<Document>>;

    /// Number of stored documents.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn stats(&self) -> StoreStats {
        StoreStats::default()
    }
}

// =============================================================================
// Store Statistics
// =============================================================================

/// Operation counters reported by a store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub documents: u64,
    pub read_ops: u64,
    pub write_ops: u64,
    pub delete_ops: u64,
}

// =============================================================================
// Memory Store
// =============================================================================

/// In-memory document store.
pub struct MemoryStore {
    documents: RwLock<HashMap<DocumentId, Document>>,
    read_ops: AtomicU64,
    write_ops: AtomicU64,
    delete_ops: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            documents: RwLock::new(HashMap::new()),
            read_ops: AtomicU64::new(0),
            write_ops: AtomicU64::new(0),
            delete_ops: AtomicU64::new(0),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentStore for MemoryStore {
    fn insert(&self, doc: Document) -> Result<DocumentId> {
        let mut documents = self.documents.write();
        if documents.contains_key(&doc.id) {
            return Err(BazaarError::DuplicateId(doc.id.to_string()));
        }
        let id = doc.id.clone();
        documents.insert(id.clone(), doc);
        self.write_ops.fetch_add(1, Ordering::Relaxed);
        Ok(id)
    }

    fn get(&self, id: &DocumentId) -> Result<Option<Document>> {
        self.read_ops.fetch_add(1, Ordering::Relaxed);
        Ok(self.documents.read().get(id).cloned())
    }

    fn update(&self, id: &DocumentId, doc: Document) -> Result<()> {
        let mut documents = self.documents.write();
        let slot = documents
            .get_mut(id)
            .ok_or_else(|| BazaarError::DocumentNotFound(id.to_string()))?;
        *slot = doc;
        self.write_ops.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn scan(&self) -> Result<Vec<Document>> {
        self.read_ops.fetch_add(1, Ordering::Relaxed);
        Ok(self.documents.read().values().cloned().collect())
    }

    fn delete(&self, id: &DocumentId) -> Result<Option<Document>> {
        let removed = self.documents.write().remove(id);
        if removed.is_some() {
            self.delete_ops.fetch_add(1, Ordering::Relaxed);
        }
        Ok(removed)
    }

    fn len(&self) -> usize {
        self.documents.read().len()
    }

    fn stats(&self) -> StoreStats {
        StoreStats {
            documents: self.len() as u64,
            read_ops: self.read_ops.load(Ordering::Relaxed),
            write_ops: self.write_ops.load(Ordering::Relaxed),
            delete_ops: self.delete_ops.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_crud() {
        let store = MemoryStore::new();

        let mut doc = Document::with_id("u1");
        doc.set("nome", "Ana");
        let id = store.insert(doc.clone()).unwrap();
        assert_eq!(store.get(&id).unwrap(), Some(doc));

        let mut replacement = Document::with_id("u1");
        replacement.set("nome", "Ana Paula");
        store.update(&id, replacement.clone()).unwrap();
        assert_eq!(store.get(&id).unwrap(), Some(replacement));

        assert!(store.delete(&id).unwrap().is_some());
        assert!(store.delete(&id).unwrap().is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_duplicate_and_missing() {
        let store = MemoryStore::new();
        store.insert(Document::with_id("same")).unwrap();

        assert!(matches!(
            store.insert(Document::with_id("same")),
            Err(BazaarError::DuplicateId(_))
        ));
        assert!(matches!(
            store.update(&DocumentId::new("other"), Document::with_id("other")),
            Err(BazaarError::DocumentNotFound(_))
        ));
    }

    #[test]
    fn test_stats() {
        let store = MemoryStore::new();
        store.insert(Document::with_id("a")).unwrap();
        store.insert(Document::with_id("b")).unwrap();
        store.scan().unwrap();
        store.delete(&DocumentId::new("a")).unwrap();

        let stats = store.stats();
        assert_eq!(stats.documents, 1);
        assert_eq!(stats.write_ops, 2);
        assert_eq!(stats.read_ops, 1);
        assert_eq!(stats.delete_ops, 1);
    }
}
