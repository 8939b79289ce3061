//! Bazaar Document Index
//!
//! Secondary indexes for one collection: ordered btree indexes over one or
//! more fields and geo2d grid indexes over GeoJSON points. The index manager
//! keeps them in step with writes and picks the index that accelerates a
//! query.
//!
//! @version 0.1.0
//! @author Bazaar Development Team

use crate::geo::{GeoGrid, GeoPoint};
use crate::types::{Document, DocumentId, Value};
use bazaar_common::{BazaarError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

// =============================================================================
// Index Descriptor
// =============================================================================

/// Ordering of one indexed field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

impl SortDirection {
    fn suffix(&self) -> &'static str {
        match self {
            Self::Ascending => "1",
            Self::Descending => "-1",
        }
    }
}

/// The type of index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    /// Ordered index for equality, range and sort.
    #[default]
    BTree,
    /// Grid index over GeoJSON points for proximity queries.
    Geo2d,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexField {
    pub field: String,
    pub direction: SortDirection,
}

/// Definition of a secondary index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDescriptor {
    pub name: String,
    pub fields: Vec<IndexField>,
    pub kind: IndexKind,
    pub unique: bool,
}

impl IndexDescriptor {
    /// Single-field ascending btree index.
    pub fn btree(field: impl Into<String>) -> Self {
        Self::compound(vec![(field.into(), SortDirection::Ascending)])
    }

    /// Multi-field btree index. The name is derived from the fields.
    pub fn compound(fields: Vec<(String, SortDirection)>) -> Self {
        let fields: Vec<IndexField> = fields
            .into_iter()
            .map(|(field, direction)| IndexField { field, direction })
            .collect();
        Self {
            name: default_name(&fields, IndexKind::BTree),
            fields,
            kind: IndexKind::BTree,
            unique: false,
        }
    }

    /// Geo2d index on a GeoJSON point field.
    pub fn geo2d(field: impl Into<String>) -> Self {
        let fields = vec![IndexField {
            field: field.into(),
            direction: SortDirection::Ascending,
        }];
        Self {
            name: default_name(&fields, IndexKind::Geo2d),
            fields,
            kind: IndexKind::Geo2d,
            unique: false,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.field.as_str())
    }

    fn same_shape(&self, other: &IndexDescriptor) -> bool {
        self.kind == other.kind && self.fields == other.fields
    }

    fn check(&self) -> Result<()> {
        if self.fields.is_empty() {
            return Err(BazaarError::InvalidIndex(format!("{}: no fields", self.name)));
        }
        if self.kind == IndexKind::Geo2d && (self.fields.len() != 1 || self.unique) {
            return Err(BazaarError::InvalidIndex(format!(
                "{}: geo2d indexes cover exactly one field and cannot be unique",
                self.name
            )));
        }
        Ok(())
    }
}

fn default_name(fields: &[IndexField], kind: IndexKind) -> String {
    fields
        .iter()
        .map(|f| match kind {
            IndexKind::BTree => format!("{}_{}", f.field, f.direction.suffix()),
            IndexKind::Geo2d => format!("{}_2d", f.field),
        })
        .collect::<Vec<_>>()
        .join("_")
}

// =============================================================================
// Index Value
// =============================================================================

/// Wrapper for f64 with a total order. Zero signs are merged so that
/// numerically equal keys are equal.
#[derive(Debug, Clone, Copy)]
pub struct OrderedFloat(pub f64);

impl OrderedFloat {
    pub fn new(f: f64) -> Self {
        if f == 0.0 {
            Self(0.0)
        } else if f.is_nan() {
            Self(f64::NAN)
        } else {
            Self(f)
        }
    }
}

impl PartialEq for OrderedFloat {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for OrderedFloat {}

impl PartialOrd for OrderedFloat {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedFloat {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// A totally ordered projection of a `Value`. Every numeric kind maps to
/// one number space so that `1500`, `1500.0` and `1500.00` share a key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum IndexValue {
    Null,
    Number(OrderedFloat),
    String(String),
    Object(Vec<(String, IndexValue)>),
    Array(Vec<IndexValue>),
    Bool(bool),
    Timestamp(DateTime<Utc>),
}

impl IndexValue {
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Int(_) | Value::Float(_) | Value::Decimal(_) => {
                Self::Number(OrderedFloat::new(value.as_f64().unwrap_or(f64::NAN)))
            }
            Value::String(s) => Self::String(s.clone()),
            Value::Timestamp(t) => Self::Timestamp(*t),
            Value::Array(arr) => Self::Array(arr.iter().map(Self::from_value).collect()),
            Value::Object(obj) => {
                let mut entries: Vec<(String, IndexValue)> = obj
                    .iter()
                    .map(|(k, v)| (k.clone(), Self::from_value(v)))
                    .collect();
                entries.sort();
                Self::Object(entries)
            }
        }
    }

    /// Key of a document field; an absent field keys as null.
    pub fn of_field(doc: &Document, field: &str) -> Self {
        doc.field(field)
            .map(|v| Self::from_value(&v))
            .unwrap_or(Self::Null)
    }
}

// =============================================================================
// Predicates and Plans
// =============================================================================

/// An index-usable condition on one field. Bounds are inclusive; strict
/// comparisons widen to inclusive ones and are re-checked afterwards.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Eq { field: String, value: IndexValue },
    AtLeast { field: String, value: IndexValue },
    AtMost { field: String, value: IndexValue },
}

impl Predicate {
    fn field(&self) -> &str {
        match self {
            Self::Eq { field, .. } | Self::AtLeast { field, .. } | Self::AtMost { field, .. } => {
                field
            }
        }
    }
}

/// How a btree index will be scanned for a query.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexPlan {
    pub index: String,
    pub eq_prefix: Vec<IndexValue>,
    pub lower: Option<IndexValue>,
    pub upper: Option<IndexValue>,
    /// The scan yields documents in the requested sort order.
    pub ordered: bool,
    pub reverse: bool,
}

// =============================================================================
// B-Tree Index
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum KeyPart {
    Asc(IndexValue),
    Desc(Reverse<IndexValue>),
    /// Sorts after every value; closes a prefix range.
    Max,
}

impl KeyPart {
    fn new(value: IndexValue, direction: SortDirection) -> Self {
        match direction {
            SortDirection::Ascending => Self::Asc(value),
            SortDirection::Descending => Self::Desc(Reverse(value)),
        }
    }
}

type Key = Vec<KeyPart>;

struct BTreeIndex {
    fields: Vec<IndexField>,
    tree: BTreeMap<Key, BTreeSet<DocumentId>>,
    entries: usize,
}

impl BTreeIndex {
    fn new(fields: Vec<IndexField>) -> Self {
        Self {
            fields,
            tree: BTreeMap::new(),
            entries: 0,
        }
    }

    fn key_for(&self, doc: &Document) -> Key {
        self.fields
            .iter()
            .map(|f| KeyPart::new(IndexValue::of_field(doc, &f.field), f.direction))
            .collect()
    }

    /// True if another document already holds this document's key.
    fn conflicts(&self, doc: &Document) -> bool {
        self.tree
            .get(&self.key_for(doc))
            .is_some_and(|ids| ids.iter().any(|id| *id != doc.id))
    }

    fn insert(&mut self, doc: &Document) {
        let key = self.key_for(doc);
        if self.tree.entry(key).or_default().insert(doc.id.clone()) {
            self.entries += 1;
        }
    }

    fn remove(&mut self, doc: &Document) {
        let key = self.key_for(doc);
        if let Some(ids) = self.tree.get_mut(&key) {
            if ids.remove(&doc.id) {
                self.entries -= 1;
            }
            if ids.is_empty() {
                self.tree.remove(&key);
            }
        }
    }

    fn scan(&self, plan: &IndexPlan) -> Vec<DocumentId> {
        let prefix: Key = plan
            .eq_prefix
            .iter()
            .zip(&self.fields)
            .map(|(value, f)| KeyPart::new(value.clone(), f.direction))
            .collect();

        let mut start = prefix.clone();
        let mut end = prefix.clone();
        if let Some(next) = self.fields.get(prefix.len()) {
            let (low, high) = match next.direction {
                SortDirection::Ascending => (&plan.lower, &plan.upper),
                SortDirection::Descending => (&plan.upper, &plan.lower),
            };
            if let Some(low) = low {
                start.push(KeyPart::new(low.clone(), next.direction));
            }
            if let Some(high) = high {
                end.push(KeyPart::new(high.clone(), next.direction));
            }
        }
        end.push(KeyPart::Max);

        if start > end {
            return Vec::new();
        }

        let range = self
            .tree
            .range((Bound::Included(start), Bound::Included(end)));
        if plan.reverse {
            range.rev().flat_map(|(_, ids)| ids.iter().cloned()).collect()
        } else {
            range.flat_map(|(_, ids)| ids.iter().cloned()).collect()
        }
    }
}

// =============================================================================
// Index Manager
// =============================================================================

enum IndexData {
    BTree(BTreeIndex),
    Geo(GeoGrid),
}

struct ManagedIndex {
    descriptor: IndexDescriptor,
    data: IndexData,
}

impl ManagedIndex {
    fn insert(&mut self, doc: &Document) {
        match &mut self.data {
            IndexData::BTree(tree) => tree.insert(doc),
            IndexData::Geo(grid) => {
                let point = doc
                    .field(&self.descriptor.fields[0].field)
                    .and_then(|v| GeoPoint::from_value(&v));
                match point {
                    Some(point) => grid.insert(doc.id.clone(), point),
                    None => grid.remove(&doc.id),
                }
            }
        }
    }

    fn remove(&mut self, doc: &Document) {
        match &mut self.data {
            IndexData::BTree(tree) => tree.remove(doc),
            IndexData::Geo(grid) => grid.remove(&doc.id),
        }
    }

    fn entries(&self) -> usize {
        match &self.data {
            IndexData::BTree(tree) => tree.entries,
            IndexData::Geo(grid) => grid.len(),
        }
    }
}

/// Summary of one index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub name: String,
    pub kind: IndexKind,
    pub entries: usize,
}

/// The secondary indexes of one collection.
pub struct IndexManager {
    collection: String,
    geo_cell_degrees: f64,
    indexes: Vec<ManagedIndex>,
}

impl IndexManager {
    pub fn new(collection: impl Into<String>, geo_cell_degrees: f64) -> Self {
        Self {
            collection: collection.into(),
            geo_cell_degrees,
            indexes: Vec::new(),
        }
    }

    /// Build an index over `documents` and install it.
    pub fn create_index(&mut self, descriptor: IndexDescriptor, documents: &[Document]) -> Result<()> {
        descriptor.check()?;
        if let Some(existing) = self
            .indexes
            .iter()
            .find(|i| i.descriptor.name == descriptor.name || i.descriptor.same_shape(&descriptor))
        {
            return Err(BazaarError::DuplicateIndex(existing.descriptor.name.clone()));
        }

        let data = match descriptor.kind {
            IndexKind::BTree => IndexData::BTree(BTreeIndex::new(descriptor.fields.clone())),
            IndexKind::Geo2d => IndexData::Geo(GeoGrid::new(self.geo_cell_degrees)),
        };
        let mut index = ManagedIndex { descriptor, data };

        for doc in documents {
            if index.descriptor.unique {
                if let IndexData::BTree(tree) = &index.data {
                    if tree.conflicts(doc) {
                        return Err(BazaarError::UniqueViolation {
                            index: index.descriptor.name.clone(),
                        });
                    }
                }
            }
            index.insert(doc);
        }

        tracing::info!(
            collection = %self.collection,
            index = %index.descriptor.name,
            entries = index.entries(),
            "index created"
        );
        self.indexes.push(index);
        Ok(())
    }

    pub fn drop_index(&mut self, name: &str) -> Result<IndexDescriptor> {
        let pos = self
            .indexes
            .iter()
            .position(|i| i.descriptor.name == name)
            .ok_or_else(|| BazaarError::IndexNotFound(name.to_string()))?;
        let removed = self.indexes.remove(pos);
        tracing::info!(collection = %self.collection, index = name, "index dropped");
        Ok(removed.descriptor)
    }

    pub fn descriptors(&self) -> Vec<IndexDescriptor> {
        self.indexes.iter().map(|i| i.descriptor.clone()).collect()
    }

    pub fn stats(&self) -> Vec<IndexStats> {
        self.indexes
            .iter()
            .map(|i| IndexStats {
                name: i.descriptor.name.clone(),
                kind: i.descriptor.kind,
                entries: i.entries(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.indexes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indexes.is_empty()
    }

    // -------------------------------------------------------------------------
    // Maintenance
    // -------------------------------------------------------------------------

    /// Check unique indexes before a write. The document's own entry does
    /// not count as a conflict.
    pub fn check_unique(&self, doc: &Document) -> Result<()> {
        for index in &self.indexes {
            if let (true, IndexData::BTree(tree)) = (index.descriptor.unique, &index.data) {
                if tree.conflicts(doc) {
                    return Err(BazaarError::UniqueViolation {
                        index: index.descriptor.name.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn insert(&mut self, doc: &Document) {
        for index in &mut self.indexes {
            index.insert(doc);
        }
    }

    pub fn remove(&mut self, doc: &Document) {
        for index in &mut self.indexes {
            index.remove(doc);
        }
    }

    pub fn replace(&mut self, old: &Document, new: &Document) {
        for index in &mut self.indexes {
            index.remove(old);
            index.insert(new);
        }
    }

    // -------------------------------------------------------------------------
    // Selection
    // -------------------------------------------------------------------------

    /// Pick the btree index that best serves the predicates and sort.
    ///
    /// An index is usable when its leading field carries a predicate. Among
    /// usable indexes the one matching the most leading equality fields wins,
    /// then one with a range on the following field, then one that serves
    /// the sort. Without a usable index, an index led by the sort field is
    /// scanned in full.
    pub fn select_index(
        &self,
        predicates: &[Predicate],
        sort: Option<(&str, SortDirection)>,
    ) -> Option<IndexPlan> {
        let mut best: Option<((usize, bool, bool), IndexPlan)> = None;

        for index in &self.indexes {
            let IndexData::BTree(_) = index.data else {
                continue;
            };
            let fields = &index.descriptor.fields;

            let mut eq_prefix = Vec::new();
            for f in fields {
                match predicates.iter().find_map(|p| match p {
                    Predicate::Eq { field, value } if *field == f.field => Some(value),
                    _ => None,
                }) {
                    Some(value) => eq_prefix.push(value.clone()),
                    None => break,
                }
            }

            let mut lower = None;
            let mut upper = None;
            if let Some(next) = fields.get(eq_prefix.len()) {
                for p in predicates.iter().filter(|p| p.field() == next.field) {
                    match p {
                        Predicate::AtLeast { value, .. } => {
                            lower = Some(tighter(lower, value, Ordering::Greater));
                        }
                        Predicate::AtMost { value, .. } => {
                            upper = Some(tighter(upper, value, Ordering::Less));
                        }
                        Predicate::Eq { .. } => {}
                    }
                }
            }
            let has_range = lower.is_some() || upper.is_some();
            if eq_prefix.is_empty() && !has_range {
                continue;
            }

            let (ordered, reverse) = sort_support(fields, eq_prefix.len(), sort);
            let score = (eq_prefix.len(), has_range, ordered);
            if best.as_ref().map_or(true, |(s, _)| score > *s) {
                best = Some((
                    score,
                    IndexPlan {
                        index: index.descriptor.name.clone(),
                        eq_prefix,
                        lower,
                        upper,
                        ordered,
                        reverse,
                    },
                ));
            }
        }

        if let Some((_, plan)) = best {
            return Some(plan);
        }

        let (sort_field, direction) = sort?;
        self.indexes.iter().find_map(|index| {
            let first = index.descriptor.fields.first()?;
            if index.descriptor.kind != IndexKind::BTree || first.field != sort_field {
                return None;
            }
            Some(IndexPlan {
                index: index.descriptor.name.clone(),
                eq_prefix: Vec::new(),
                lower: None,
                upper: None,
                ordered: true,
                reverse: first.direction != direction,
            })
        })
    }

    /// Ids covered by a plan, in index order.
    pub fn scan(&self, plan: &IndexPlan) -> Result<Vec<DocumentId>> {
        let index = self
            .indexes
            .iter()
            .find(|i| i.descriptor.name == plan.index)
            .ok_or_else(|| BazaarError::IndexNotFound(plan.index.clone()))?;
        match &index.data {
            IndexData::BTree(tree) => Ok(tree.scan(plan)),
            IndexData::Geo(_) => Err(BazaarError::InvalidIndex(format!(
                "{} is not a btree index",
                plan.index
            ))),
        }
    }

    /// Name of the geo2d index on `field`, if one exists.
    pub fn geo_index(&self, field: &str) -> Option<&str> {
        self.indexes
            .iter()
            .find(|i| {
                i.descriptor.kind == IndexKind::Geo2d && i.descriptor.fields[0].field == field
            })
            .map(|i| i.descriptor.name.as_str())
    }

    /// Ids of documents whose point may lie within `radius_m` of `center`.
    pub fn geo_candidates(
        &self,
        field: &str,
        center: &GeoPoint,
        radius_m: f64,
    ) -> Result<BTreeSet<DocumentId>> {
        self.indexes
            .iter()
            .find_map(|i| match &i.data {
                IndexData::Geo(grid) if i.descriptor.fields[0].field == field => {
                    Some(grid.candidates(center, radius_m))
                }
                _ => None,
            })
            .ok_or_else(|| BazaarError::NoGeoIndex(field.to_string()))
    }
}

/// Keep the stricter of two bounds; `keep` is the ordering that makes the
/// candidate stricter than the current bound.
fn tighter(current: Option<IndexValue>, candidate: &IndexValue, keep: Ordering) -> IndexValue {
    match current {
        Some(current) if candidate.cmp(&current) != keep => current,
        _ => candidate.clone(),
    }
}

/// Whether scanning `fields` with `eq_len` leading equalities yields the
/// requested order, and whether the scan must run backwards.
fn sort_support(
    fields: &[IndexField],
    eq_len: usize,
    sort: Option<(&str, SortDirection)>,
) -> (bool, bool) {
    let Some((sort_field, direction)) = sort else {
        return (false, false);
    };
    match fields.iter().position(|f| f.field == sort_field) {
        Some(pos) if pos < eq_len => (true, false),
        Some(pos) if pos == eq_len => (true, fields[pos].direction != direction),
        _ => (false, false),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn transaction(id: &str, user: &str, day: u32) -> Document {
        let mut doc = Document::with_id(id);
        doc.set("usuario_id", user);
        doc.set("data", Utc.with_ymd_and_hms(2024, 11, day, 12, 0, 0).unwrap());
        doc
    }

    fn eq(field: &str, value: impl Into<Value>) -> Predicate {
        Predicate::Eq {
            field: field.to_string(),
            value: IndexValue::from_value(&value.into()),
        }
    }

    fn ids(list: &[&str]) -> Vec<DocumentId> {
        list.iter().map(|s| DocumentId::new(*s)).collect()
    }

    fn transactions_manager() -> IndexManager {
        let docs = vec![
            transaction("t1", "u1", 1),
            transaction("t2", "u2", 2),
            transaction("t3", "u1", 3),
            transaction("t4", "u1", 2),
        ];
        let mut manager = IndexManager::new("transacoes", 0.1);
        manager
            .create_index(
                IndexDescriptor::compound(vec![
                    ("usuario_id".to_string(), SortDirection::Ascending),
                    ("data".to_string(), SortDirection::Descending),
                ]),
                &docs,
            )
            .unwrap();
        manager
    }

    #[test]
    fn test_numeric_keys_share_space() {
        assert_eq!(
            IndexValue::from_value(&Value::Int(1500)),
            IndexValue::from_value(&Value::Decimal(rust_decimal::Decimal::new(150000, 2)))
        );
        assert_eq!(
            IndexValue::from_value(&Value::Float(-0.0)),
            IndexValue::from_value(&Value::Int(0))
        );
        assert!(IndexValue::from_value(&Value::Int(2)) < IndexValue::from_value(&Value::Float(2.5)));
    }

    #[test]
    fn test_default_names() {
        let compound = IndexDescriptor::compound(vec![
            ("usuario_id".to_string(), SortDirection::Ascending),
            ("data".to_string(), SortDirection::Descending),
        ]);
        assert_eq!(compound.name, "usuario_id_1_data_-1");
        assert_eq!(IndexDescriptor::geo2d("localizacao").name, "localizacao_2d");
    }

    #[test]
    fn test_compound_prefix_selection() {
        let manager = transactions_manager();

        let plan = manager
            .select_index(&[eq("usuario_id", "u1")], Some(("data", SortDirection::Descending)))
            .unwrap();
        assert!(plan.ordered);
        assert!(!plan.reverse);
        assert_eq!(manager.scan(&plan).unwrap(), ids(&["t3", "t4", "t1"]));

        let plan = manager
            .select_index(&[eq("usuario_id", "u1")], Some(("data", SortDirection::Ascending)))
            .unwrap();
        assert!(plan.reverse);
        assert_eq!(manager.scan(&plan).unwrap(), ids(&["t1", "t4", "t3"]));
    }

    #[test]
    fn test_non_leading_field_not_served() {
        let manager = transactions_manager();
        let day = Utc.with_ymd_and_hms(2024, 11, 2, 12, 0, 0).unwrap();
        assert!(manager.select_index(&[eq("data", day)], None).is_none());
    }

    #[test]
    fn test_range_on_descending_field() {
        let manager = transactions_manager();
        let from = Utc.with_ymd_and_hms(2024, 11, 2, 0, 0, 0).unwrap();
        let plan = manager
            .select_index(
                &[
                    eq("usuario_id", "u1"),
                    Predicate::AtLeast {
                        field: "data".to_string(),
                        value: IndexValue::Timestamp(from),
                    },
                ],
                None,
            )
            .unwrap();
        assert_eq!(manager.scan(&plan).unwrap(), ids(&["t3", "t4"]));
    }

    #[test]
    fn test_empty_range_is_empty() {
        let mut manager = IndexManager::new("produtos", 0.1);
        let docs: Vec<Document> = (0..5)
            .map(|i| {
                let mut d = Document::with_id(format!("p{}", i));
                d.set("quantidade", i as i64);
                d
            })
            .collect();
        manager.create_index(IndexDescriptor::btree("quantidade"), &docs).unwrap();

        let plan = manager
            .select_index(
                &[
                    Predicate::AtLeast {
                        field: "quantidade".to_string(),
                        value: IndexValue::from_value(&Value::Int(4)),
                    },
                    Predicate::AtMost {
                        field: "quantidade".to_string(),
                        value: IndexValue::from_value(&Value::Int(1)),
                    },
                ],
                None,
            )
            .unwrap();
        assert!(manager.scan(&plan).unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_index() {
        let mut manager = IndexManager::new("usuarios", 0.1);
        manager.create_index(IndexDescriptor::btree("email"), &[]).unwrap();

        assert!(matches!(
            manager.create_index(IndexDescriptor::btree("email").named("other"), &[]),
            Err(BazaarError::DuplicateIndex(_))
        ));
        assert!(matches!(
            manager.create_index(IndexDescriptor::btree("nome").named("email_1"), &[]),
            Err(BazaarError::DuplicateIndex(_))
        ));
        assert!(matches!(
            manager.drop_index("missing"),
            Err(BazaarError::IndexNotFound(_))
        ));
    }

    #[test]
    fn test_unique_backfill_conflict_not_installed() {
        let mut a = Document::with_id("a");
        a.set("email", "ana@example.com");
        let mut b = Document::with_id("b");
        b.set("email", "ana@example.com");

        let mut manager = IndexManager::new("usuarios", 0.1);
        let result = manager.create_index(IndexDescriptor::btree("email").unique(), &[a, b]);
        assert!(matches!(result, Err(BazaarError::UniqueViolation { .. })));
        assert!(manager.is_empty());
    }

    #[test]
    fn test_unique_precheck_ignores_self() {
        let mut a = Document::with_id("a");
        a.set("email", "ana@example.com");
        let mut manager = IndexManager::new("usuarios", 0.1);
        manager
            .create_index(IndexDescriptor::btree("email").unique(), std::slice::from_ref(&a))
            .unwrap();

        assert!(manager.check_unique(&a).is_ok());
        let mut b = Document::with_id("b");
        b.set("email", "ana@example.com");
        assert!(manager.check_unique(&b).is_err());
    }

    #[test]
    fn test_geo_requires_index() {
        let manager = IndexManager::new("usuarios", 0.1);
        let result = manager.geo_candidates("localizacao", &GeoPoint::new(0.0, 0.0), 10.0);
        assert!(matches!(result, Err(BazaarError::NoGeoIndex(_))));
    }

    #[test]
    fn test_replace_moves_entries() {
        let mut manager = IndexManager::new("produtos", 0.1);
        manager.create_index(IndexDescriptor::btree("categoria_id"), &[]).unwrap();

        let mut old = Document::with_id("p1");
        old.set("categoria_id", "c1");
        manager.insert(&old);
        let mut new = old.clone();
        new.set("categoria_id", "c2");
        manager.replace(&old, &new);

        let plan = manager.select_index(&[eq("categoria_id", "c1")], None).unwrap();
        assert!(manager.scan(&plan).unwrap().is_empty());
        let plan = manager.select_index(&[eq("categoria_id", "c2")], None).unwrap();
        assert_eq!(manager.scan(&plan).unwrap(), ids(&["p1"]));
        assert_eq!(manager.stats()[0].entries, 1);
    }
}
