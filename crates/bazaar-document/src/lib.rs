//! Bazaar Document - Schema-Validated Document Core
//!
//! Schema-validated, indexed, geo-aware document storage. Writes are
//! checked against a per-collection constraint tree before they commit;
//! reads are answered by an index-aware query evaluator and a small
//! aggregation pipeline executor.
//!
//! Key Features:
//! - Schema registry with hot schema evolution
//! - Recursive constraint validation reporting every violation
//! - Single-field, compound and geo2d secondary indexes
//! - Point, range and proximity queries with index selection
//! - Match, group, lookup, unwind, project and sort pipelines
//! - Guarded conditional updates for stock and loyalty points
//!
//! @version 0.1.0
//! @author Bazaar Development Team

pub mod types;
pub mod validation;
pub mod registry;
pub mod store;
pub mod patch;
pub mod geo;
pub mod index;
pub mod query;
pub mod aggregation;
pub mod collection;
pub mod engine;
pub mod marketplace;

pub use types::{Document, DocumentId, FieldAccess, Value};
pub use validation::{ArraySchema, Constraint, FieldSchema, FieldType, ObjectSchema, Schema, Validator};
pub use registry::{RegisteredSchema, SchemaRegistry};
pub use store::{DocumentStore, MemoryStore, StoreStats};
pub use patch::{Patch, PatchOp};
pub use geo::{haversine_distance, GeoPoint};
pub use index::{IndexDescriptor, IndexKind, IndexStats, SortDirection};
pub use query::{Filter, Matcher, Query, QueryBuilder, QueryResult};
pub use aggregation::{Accumulator, GroupKey, Pipeline, ProjectExpr, QuerySource, Stage};
pub use collection::{Collection, CollectionStats};
pub use engine::{DocumentEngine, EngineStats};
pub use bazaar_common::{BazaarError, EngineConfig, Result, Rule, Violation};
