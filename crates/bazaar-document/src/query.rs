//! Bazaar Document Query
//!
//! Query language for document filtering and the evaluator that answers
//! queries over one collection, narrowing the scan through an index when
//! one applies and re-checking every filter on the candidates.
//!
//! @version 0.1.0
//! @author Bazaar Development Team

use crate::geo::GeoPoint;
use crate::index::{IndexManager, IndexValue, Predicate, SortDirection};
use crate::store::DocumentStore;
use crate::types::{Document, DocumentId, FieldAccess, Value, ID_FIELD};
use crate::validation::Validator;
use bazaar_common::{BazaarError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::Instant;

// =============================================================================
// Query
// =============================================================================

/// A query for filtering documents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub filters: Vec<Filter>,
    pub sort: Option<Sort>,
    pub skip: Option<usize>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if a document matches this query. An invalid regex never
    /// matches; use a [`Matcher`] to test many documents or to surface
    /// pattern errors.
    pub fn matches<D: FieldAccess + ?Sized>(&self, doc: &D) -> bool {
        Matcher::new(&self.filters, &Validator::default()).is_ok_and(|m| m.matches(doc))
    }

    /// Add a filter.
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Add sorting.
    pub fn with_sort(mut self, field: impl Into<String>, ascending: bool) -> Self {
        self.sort = Some(Sort {
            field: field.into(),
            ascending,
        });
        self
    }

    pub fn with_skip(mut self, skip: usize) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Top-level filters with nested `And`s flattened.
    fn conjuncts(&self) -> Vec<&Filter> {
        fn collect<'a>(filter: &'a Filter, out: &mut Vec<&'a Filter>) {
            match filter {
                Filter::And(inner) => inner.iter().for_each(|f| collect(f, out)),
                other => out.push(other),
            }
        }
        let mut out = Vec::new();
        self.filters.iter().for_each(|f| collect(f, &mut out));
        out
    }
}

// =============================================================================
// Filter
// =============================================================================

/// A filter condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Filter {
    Eq { field: String, value: Value },
    Ne { field: String, value: Value },
    Gt { field: String, value: Value },
    Gte { field: String, value: Value },
    Lt { field: String, value: Value },
    Lte { field: String, value: Value },
    In { field: String, values: Vec<Value> },
    Nin { field: String, values: Vec<Value> },
    Exists { field: String, exists: bool },
    Regex { field: String, pattern: String },
    Contains { field: String, value: String },
    StartsWith { field: String, value: String },
    EndsWith { field: String, value: String },
    /// Documents whose point lies within `max_distance_m` of `point`.
    Near {
        field: String,
        point: GeoPoint,
        max_distance_m: f64,
    },
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn gte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Gte {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn lte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Lte {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Check if a document matches this filter. An invalid regex never
    /// matches.
    pub fn matches<D: FieldAccess + ?Sized>(&self, doc: &D) -> bool {
        Matcher::new(std::slice::from_ref(self), &Validator::default())
            .is_ok_and(|m| m.matches(doc))
    }

    fn test<D: FieldAccess + ?Sized>(&self, doc: &D, patterns: &HashMap<String, Regex>) -> bool {
        match self {
            Self::Eq { field, value } => doc.field(field).is_some_and(|v| v.loose_eq(value)),
            Self::Ne { field, value } => doc.field(field).map_or(true, |v| !v.loose_eq(value)),
            Self::Gt { field, value } => compares(doc, field, value, |o| o == Ordering::Greater),
            Self::Gte { field, value } => compares(doc, field, value, |o| o != Ordering::Less),
            Self::Lt { field, value } => compares(doc, field, value, |o| o == Ordering::Less),
            Self::Lte { field, value } => compares(doc, field, value, |o| o != Ordering::Greater),
            Self::In { field, values } => doc
                .field(field)
                .is_some_and(|v| values.iter().any(|x| x.loose_eq(&v))),
            Self::Nin { field, values } => doc
                .field(field)
                .map_or(true, |v| !values.iter().any(|x| x.loose_eq(&v))),
            Self::Exists { field, exists } => doc.field(field).is_some() == *exists,
            Self::Regex { field, pattern } => patterns
                .get(pattern)
                .is_some_and(|re| with_str(doc, field, |s| re.is_match(s))),
            Self::Contains { field, value } => with_str(doc, field, |s| s.contains(value.as_str())),
            Self::StartsWith { field, value } => {
                with_str(doc, field, |s| s.starts_with(value.as_str()))
            }
            Self::EndsWith { field, value } => with_str(doc, field, |s| s.ends_with(value.as_str())),
            Self::Near {
                field,
                point,
                max_distance_m,
            } => distance(doc, field, point).is_some_and(|d| d <= *max_distance_m),
            Self::And(filters) => filters.iter().all(|f| f.test(doc, patterns)),
            Self::Or(filters) => filters.iter().any(|f| f.test(doc, patterns)),
            Self::Not(filter) => !filter.test(doc, patterns),
        }
    }

    /// Patterns of every `Regex` filter in this tree.
    fn patterns<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Self::Regex { pattern, .. } => out.push(pattern),
            Self::And(filters) | Self::Or(filters) => {
                filters.iter().for_each(|f| f.patterns(out))
            }
            Self::Not(filter) => filter.patterns(out),
            _ => {}
        }
    }

    /// True if a `Near` sits under an `Or` or a `Not`, where its results
    /// could not be ordered by distance.
    fn has_nested_near(&self) -> bool {
        match self {
            Self::And(filters) => filters.iter().any(Self::has_nested_near),
            Self::Or(filters) => filters.iter().any(Self::contains_near),
            Self::Not(filter) => filter.contains_near(),
            _ => false,
        }
    }

    fn contains_near(&self) -> bool {
        match self {
            Self::Near { .. } => true,
            Self::And(filters) | Self::Or(filters) => filters.iter().any(Self::contains_near),
            Self::Not(filter) => filter.contains_near(),
            _ => false,
        }
    }

    /// Fields of every `Near` filter in this tree.
    fn near_fields<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Self::Near { field, .. } => out.push(field),
            Self::And(filters) | Self::Or(filters) => {
                filters.iter().for_each(|f| f.near_fields(out))
            }
            Self::Not(filter) => filter.near_fields(out),
            _ => {}
        }
    }

    fn as_predicate(&self) -> Option<Predicate> {
        Some(match self {
            Self::Eq { field, value } => Predicate::Eq {
                field: field.clone(),
                value: IndexValue::from_value(value),
            },
            Self::Gt { field, value } | Self::Gte { field, value } => Predicate::AtLeast {
                field: field.clone(),
                value: IndexValue::from_value(value),
            },
            Self::Lt { field, value } | Self::Lte { field, value } => Predicate::AtMost {
                field: field.clone(),
                value: IndexValue::from_value(value),
            },
            _ => return None,
        })
    }
}

fn compares<D: FieldAccess + ?Sized>(
    doc: &D,
    field: &str,
    value: &Value,
    accept: fn(Ordering) -> bool,
) -> bool {
    doc.field(field)
        .and_then(|v| v.compare(value))
        .is_some_and(accept)
}

fn with_str<D: FieldAccess + ?Sized>(doc: &D, field: &str, test: impl Fn(&str) -> bool) -> bool {
    match doc.field(field).as_deref() {
        Some(Value::String(s)) => test(s),
        _ => false,
    }
}

/// Distance in meters from `point` to the document's point at `field`.
pub fn distance<D: FieldAccess + ?Sized>(doc: &D, field: &str, point: &GeoPoint) -> Option<f64> {
    let value = doc.field(field)?;
    GeoPoint::from_value(&value).map(|p| point.distance_to(&p))
}

// =============================================================================
// Matcher
// =============================================================================

/// A set of filters with their regexes compiled, ready to test many
/// documents.
pub struct Matcher<'f> {
    filters: &'f [Filter],
    patterns: HashMap<String, Regex>,
}

impl<'f> Matcher<'f> {
    /// Compile every regex in `filters` through the validator's size-limited
    /// pattern cache. Fails with `InvalidQuery` on a bad or oversized pattern.
    pub fn new(filters: &'f [Filter], validator: &Validator) -> Result<Self> {
        let mut sources = Vec::new();
        filters.iter().for_each(|f| f.patterns(&mut sources));

        let mut patterns = HashMap::with_capacity(sources.len());
        for source in sources {
            let re = validator
                .compile(source)
                .map_err(|e| BazaarError::InvalidQuery(format!("pattern '{}': {}", source, e)))?;
            patterns.insert(source.to_string(), re);
        }
        Ok(Self { filters, patterns })
    }

    pub fn matches<D: FieldAccess + ?Sized>(&self, doc: &D) -> bool {
        self.filters.iter().all(|f| f.test(doc, &self.patterns))
    }
}

// =============================================================================
// Sort
// =============================================================================

/// Sort specification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sort {
    pub field: String,
    pub ascending: bool,
}

impl Sort {
    pub fn direction(&self) -> SortDirection {
        if self.ascending {
            SortDirection::Ascending
        } else {
            SortDirection::Descending
        }
    }
}

/// Stable sort of documents by a field. Absent fields sort as null.
pub fn sort_documents(docs: &mut [Document], field: &str, direction: SortDirection) {
    docs.sort_by(|a, b| {
        let ord = IndexValue::of_field(a, field).cmp(&IndexValue::of_field(b, field));
        match direction {
            SortDirection::Ascending => ord,
            SortDirection::Descending => ord.reverse(),
        }
    });
}

// =============================================================================
// Query Builder
// =============================================================================

/// Builder for constructing queries.
pub struct QueryBuilder {
    query: Query,
}

impl QueryBuilder {
    pub fn new() -> Self {
        Self {
            query: Query::new(),
        }
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.query.filters.push(Filter::eq(field, value));
        self
    }

    pub fn ne(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.query.filters.push(Filter::Ne {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    pub fn gt(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.query.filters.push(Filter::Gt {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    pub fn gte(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.query.filters.push(Filter::gte(field, value));
        self
    }

    pub fn lt(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.query.filters.push(Filter::Lt {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    pub fn lte(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.query.filters.push(Filter::lte(field, value));
        self
    }

    pub fn in_values(mut self, field: impl Into<String>, values: Vec<Value>) -> Self {
        self.query.filters.push(Filter::In {
            field: field.into(),
            values,
        });
        self
    }

    pub fn nin_values(mut self, field: impl Into<String>, values: Vec<Value>) -> Self {
        self.query.filters.push(Filter::Nin {
            field: field.into(),
            values,
        });
        self
    }

    pub fn exists(mut self, field: impl Into<String>, exists: bool) -> Self {
        self.query.filters.push(Filter::Exists {
            field: field.into(),
            exists,
        });
        self
    }

    pub fn contains(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.filters.push(Filter::Contains {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    pub fn starts_with(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.filters.push(Filter::StartsWith {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    pub fn ends_with(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.filters.push(Filter::EndsWith {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    pub fn regex(mut self, field: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.query.filters.push(Filter::Regex {
            field: field.into(),
            pattern: pattern.into(),
        });
        self
    }

    /// Documents within `max_distance_m` meters of `point`, nearest first.
    pub fn near(mut self, field: impl Into<String>, point: GeoPoint, max_distance_m: f64) -> Self {
        self.query.filters.push(Filter::Near {
            field: field.into(),
            point,
            max_distance_m,
        });
        self
    }

    pub fn and(mut self, filters: Vec<Filter>) -> Self {
        self.query.filters.push(Filter::And(filters));
        self
    }

    pub fn or(mut self, filters: Vec<Filter>) -> Self {
        self.query.filters.push(Filter::Or(filters));
        self
    }

    pub fn not(mut self, filter: Filter) -> Self {
        self.query.filters.push(Filter::Not(Box::new(filter)));
        self
    }

    pub fn sort(mut self, field: impl Into<String>, ascending: bool) -> Self {
        self.query.sort = Some(Sort {
            field: field.into(),
            ascending,
        });
        self
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.query.skip = Some(skip);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.query.limit = Some(limit);
        self
    }

    pub fn build(self) -> Query {
        self.query
    }
}

impl Default for QueryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Query Result
// =============================================================================

/// Result of a document query.
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub documents: Vec<Document>,
    pub total_scanned: usize,
    /// Name of the index that narrowed the scan, if any.
    pub index_used: Option<String>,
    pub execution_time_ms: u64,
}

impl QueryResult {
    pub fn empty() -> Self {
        Self {
            documents: Vec::new(),
            total_scanned: 0,
            index_used: None,
            execution_time_ms: 0,
        }
    }

    pub fn count(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn first(&self) -> Option<&Document> {
        self.documents.first()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Document> {
        self.documents.iter()
    }

    pub fn ids(&self) -> Vec<DocumentId> {
        self.documents.iter().map(|d| d.id.clone()).collect()
    }
}

impl IntoIterator for QueryResult {
    type Item = Document;
    type IntoIter = std::vec::IntoIter<Document>;

    fn into_iter(self) -> Self::IntoIter {
        self.documents.into_iter()
    }
}

impl<'a> IntoIterator for &'a QueryResult {
    type Item = &'a Document;
    type IntoIter = std::slice::Iter<'a, Document>;

    fn into_iter(self) -> Self::IntoIter {
        self.documents.iter()
    }
}

// =============================================================================
// Evaluation
// =============================================================================

/// Evaluate a query against a store and its indexes. The caller holds the
/// collection lock so the store and indexes describe the same snapshot.
pub(crate) fn evaluate(
    collection: &str,
    query: &Query,
    store: &dyn DocumentStore,
    indexes: &IndexManager,
    validator: &Validator,
) -> Result<QueryResult> {
    let start = Instant::now();
    let matcher = Matcher::new(&query.filters, validator)?;

    if query.filters.iter().any(Filter::has_nested_near) {
        return Err(BazaarError::InvalidQuery(
            "near filters cannot be nested under or/not".to_string(),
        ));
    }

    let mut near_fields = Vec::new();
    query.filters.iter().for_each(|f| f.near_fields(&mut near_fields));
    if let Some(missing) = near_fields.iter().find(|f| indexes.geo_index(f).is_none()) {
        return Err(BazaarError::NoGeoIndex((*missing).to_string()));
    }

    let conjuncts = query.conjuncts();
    let (mut documents, total_scanned, index_used) =
        if let Some((field, point, radius)) = conjuncts.iter().find_map(|f| match f {
            Filter::Near {
                field,
                point,
                max_distance_m,
            } => Some((field, point, *max_distance_m)),
            _ => None,
        }) {
            let candidates = indexes.geo_candidates(field, point, radius)?;
            let scanned = candidates.len();
            let mut hits: Vec<(f64, Document)> = fetch(store, candidates)?
                .into_iter()
                .filter(|d| matcher.matches(d))
                .filter_map(|d| distance(&d, field, point).map(|dist| (dist, d)))
                .collect();
            hits.sort_by(|(da, a), (db, b)| da.total_cmp(db).then_with(|| a.id.cmp(&b.id)));
            let docs = hits.into_iter().map(|(_, d)| d).collect();
            (docs, scanned, indexes.geo_index(field).map(String::from))
        } else if let Some(id) = conjuncts.iter().find_map(|f| match f {
            Filter::Eq { field, value } if field == ID_FIELD => Some(value),
            _ => None,
        }) {
            let found = match id.as_str() {
                Some(id) => store.get(&DocumentId::new(id))?,
                None => None,
            };
            let scanned = usize::from(found.is_some());
            let docs = found.into_iter().filter(|d| matcher.matches(d)).collect();
            (docs, scanned, Some(ID_FIELD.to_string()))
        } else {
            let predicates: Vec<Predicate> =
                conjuncts.iter().filter_map(|f| f.as_predicate()).collect();
            let sort = query
                .sort
                .as_ref()
                .map(|s| (s.field.as_str(), s.direction()));

            match indexes.select_index(&predicates, sort) {
                Some(plan) => {
                    let ids = indexes.scan(&plan)?;
                    let scanned = ids.len();
                    let mut docs: Vec<Document> = fetch(store, ids)?
                        .into_iter()
                        .filter(|d| matcher.matches(d))
                        .collect();
                    if !plan.ordered {
                        docs.sort_by(|a, b| a.id.cmp(&b.id));
                        if let Some((field, direction)) = sort {
                            sort_documents(&mut docs, field, direction);
                        }
                    }
                    (docs, scanned, Some(plan.index))
                }
                None => {
                    let mut all = store.scan()?;
                    let scanned = all.len();
                    all.retain(|d| matcher.matches(d));
                    all.sort_by(|a, b| a.id.cmp(&b.id));
                    if let Some((field, direction)) = sort {
                        sort_documents(&mut all, field, direction);
                    }
                    (all, scanned, None)
                }
            }
        };

    let skip = query.skip.unwrap_or(0).min(documents.len());
    documents.drain(..skip);
    if let Some(limit) = query.limit {
        documents.truncate(limit);
    }

    tracing::debug!(
        collection,
        index = index_used.as_deref().unwrap_or("none"),
        scanned = total_scanned,
        returned = documents.len(),
        "query evaluated"
    );

    Ok(QueryResult {
        documents,
        total_scanned,
        index_used,
        execution_time_ms: start.elapsed().as_millis() as u64,
    })
}

fn fetch(
    store: &dyn DocumentStore,
    ids: impl IntoIterator<Item = DocumentId>,
) -> Result<Vec<Document>> {
    let mut docs = Vec::new();
    for id in ids {
        if let Some(doc) = store.get(&id)? {
            docs.push(doc);
        }
    }
    Ok(docs)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use rust_decimal::Decimal;

    fn create_test_doc() -> Document {
        let mut doc = Document::with_id("p1");
        doc.set("nome", "Celular Samsung");
        doc.set("preco", Decimal::new(150000, 2));
        doc.set("quantidade_disponivel", 10i64);
        doc.set("ativo", true);
        doc
    }

    #[test]
    fn test_eq_filter_across_numeric_kinds() {
        let doc = create_test_doc();

        assert!(Filter::eq("preco", 1500i64).matches(&doc));
        assert!(Filter::eq("preco", 1500.0).matches(&doc));
        assert!(!Filter::eq("preco", 1499i64).matches(&doc));
        assert!(Filter::eq("_id", "p1").matches(&doc));
    }

    #[test]
    fn test_comparison_filters() {
        let doc = create_test_doc();

        assert!(Filter::gte("quantidade_disponivel", 10i64).matches(&doc));
        assert!(!Filter::Gt {
            field: "quantidade_disponivel".to_string(),
            value: Value::Int(10),
        }
        .matches(&doc));
        assert!(Filter::lte("preco", Decimal::new(150000, 2)).matches(&doc));
        // Incomparable kinds never match.
        assert!(!Filter::gte("nome", 1i64).matches(&doc));
    }

    #[test]
    fn test_missing_field_semantics() {
        let doc = create_test_doc();

        assert!(!Filter::eq("promocao", Value::Null).matches(&doc));
        assert!(Filter::Ne {
            field: "promocao".to_string(),
            value: Value::Int(1),
        }
        .matches(&doc));
        assert!(Filter::Exists {
            field: "promocao".to_string(),
            exists: false,
        }
        .matches(&doc));
    }

    #[test]
    fn test_string_filters() {
        let doc = create_test_doc();

        let query = QueryBuilder::new()
            .contains("nome", "Sam")
            .starts_with("nome", "Cel")
            .ends_with("nome", "sung")
            .regex("nome", "^Celular")
            .build();
        assert!(query.matches(&doc));
    }

    #[test]
    fn test_logical_filters() {
        let doc = create_test_doc();

        let filter = Filter::Or(vec![Filter::eq("nome", "TV"), Filter::eq("ativo", true)]);
        assert!(filter.matches(&doc));

        let filter = Filter::Not(Box::new(Filter::eq("ativo", true)));
        assert!(!filter.matches(&doc));

        let query = QueryBuilder::new()
            .in_values("quantidade_disponivel", vec![Value::Int(5), Value::Float(10.0)])
            .build();
        assert!(query.matches(&doc));
    }

    #[test]
    fn test_near_filter() {
        let mut doc = create_test_doc();
        doc.set("localizacao", GeoPoint::new(-46.625, -23.548).to_value());

        let center = GeoPoint::new(-46.63, -23.55);
        let query = QueryBuilder::new().near("localizacao", center, 1000.0).build();
        assert!(query.matches(&doc));

        let query = QueryBuilder::new().near("localizacao", center, 100.0).build();
        assert!(!query.matches(&doc));
        assert!(distance(&doc, "nome", &center).is_none());
    }

    fn evaluate_over(docs: Vec<Document>, query: &Query) -> Result<QueryResult> {
        let store = MemoryStore::new();
        for doc in docs {
            store.insert(doc).unwrap();
        }
        let indexes = IndexManager::new("produtos".to_string(), 0.1);
        evaluate("produtos", query, &store, &indexes, &Validator::default())
    }

    #[test]
    fn test_matcher_compiles_patterns_once() {
        let doc = create_test_doc();

        let filters = [Filter::Regex {
            field: "nome".to_string(),
            pattern: "^Celular".to_string(),
        }];
        let matcher = Matcher::new(&filters, &Validator::default()).unwrap();
        assert!(matcher.matches(&doc));

        let bad = [Filter::Regex {
            field: "nome".to_string(),
            pattern: "(unclosed".to_string(),
        }];
        assert!(matches!(
            Matcher::new(&bad, &Validator::default()),
            Err(BazaarError::InvalidQuery(_))
        ));

        let oversized = [Filter::Regex {
            field: "nome".to_string(),
            pattern: r"\w{500}".to_string(),
        }];
        assert!(matches!(
            Matcher::new(&oversized, &Validator::new(64)),
            Err(BazaarError::InvalidQuery(_))
        ));
    }

    #[test]
    fn test_evaluate_rejects_invalid_regex() {
        let query = QueryBuilder::new().regex("nome", "(unclosed").build();
        assert!(matches!(
            evaluate_over(vec![create_test_doc()], &query),
            Err(BazaarError::InvalidQuery(_))
        ));

        let query = QueryBuilder::new().regex("nome", "sung$").build();
        assert_eq!(evaluate_over(vec![create_test_doc()], &query).unwrap().count(), 1);
    }

    #[test]
    fn test_evaluate_rejects_near_under_or_and_not() {
        let near = Filter::Near {
            field: "localizacao".to_string(),
            point: GeoPoint::new(-46.63, -23.55),
            max_distance_m: 1000.0,
        };

        let either = QueryBuilder::new()
            .or(vec![near.clone(), Filter::eq("ativo", true)])
            .build();
        assert!(matches!(
            evaluate_over(vec![create_test_doc()], &either),
            Err(BazaarError::InvalidQuery(_))
        ));

        let negated = QueryBuilder::new().not(near).build();
        assert!(matches!(
            evaluate_over(vec![create_test_doc()], &negated),
            Err(BazaarError::InvalidQuery(_))
        ));
    }

    #[test]
    fn test_sort_documents_stable() {
        let mut docs: Vec<Document> = [("a", 3i64), ("b", 1), ("c", 3), ("d", 2)]
            .into_iter()
            .map(|(id, n)| {
                let mut d = Document::with_id(id);
                d.set("nota", n);
                d
            })
            .collect();
        docs.push(Document::with_id("e"));

        sort_documents(&mut docs, "nota", SortDirection::Descending);
        let ids: Vec<&str> = docs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c", "d", "b", "e"]);
    }
}
