//! Bazaar Aggregation
//!
//! A small pipeline DSL over the rows of a collection: match, group, lookup,
//! unwind, project and sort. Stages run left to right, each consuming the
//! previous stage's output. The pipeline's row shape is checked before any
//! data is read, and every row is checked again as it flows; any failure
//! aborts the whole run.
//!
//! @version 0.1.0
//! @author Bazaar Development Team

use crate::index::{IndexValue, SortDirection};
use crate::query::{Filter, Matcher, Query, QueryResult};
use crate::types::{Value, ID_FIELD};
use bazaar_common::{BazaarError, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

// =============================================================================
// Pipeline Definition
// =============================================================================

/// An aggregation pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    pub stages: Vec<Stage>,
}

/// Pipeline stage types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Match(Vec<Filter>),
    Group(GroupSpec),
    Lookup(LookupSpec),
    Unwind(String),
    Project(Vec<(String, ProjectExpr)>),
    Sort {
        field: String,
        direction: SortDirection,
    },
}

impl Stage {
    fn name(&self) -> &'static str {
        match self {
            Self::Match(_) => "match",
            Self::Group(_) => "group",
            Self::Lookup(_) => "lookup",
            Self::Unwind(_) => "unwind",
            Self::Project(_) => "project",
            Self::Sort { .. } => "sort",
        }
    }
}

/// Key a group partitions rows by.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupKey {
    Field(String),
    Literal(Value),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Accumulator {
    Sum(String),
    Avg(String),
    Count,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSpec {
    pub key: GroupKey,
    pub accumulators: Vec<(String, Accumulator)>,
}

/// Left outer join against another collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LookupSpec {
    pub from: String,
    pub local_field: String,
    pub foreign_field: String,
    pub as_field: String,
}

/// Value of a projected field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectExpr {
    /// Copy the field of the same name.
    Include,
    /// Copy the value at a path under a new name.
    Field(String),
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn match_filters(mut self, filters: Vec<Filter>) -> Self {
        self.stages.push(Stage::Match(filters));
        self
    }

    pub fn group(mut self, key: GroupKey, accumulators: Vec<(&str, Accumulator)>) -> Self {
        self.stages.push(Stage::Group(GroupSpec {
            key,
            accumulators: accumulators
                .into_iter()
                .map(|(name, acc)| (name.to_string(), acc))
                .collect(),
        }));
        self
    }

    pub fn lookup(mut self, from: &str, local_field: &str, foreign_field: &str, as_field: &str) -> Self {
        self.stages.push(Stage::Lookup(LookupSpec {
            from: from.to_string(),
            local_field: local_field.to_string(),
            foreign_field: foreign_field.to_string(),
            as_field: as_field.to_string(),
        }));
        self
    }

    pub fn unwind(mut self, field: &str) -> Self {
        self.stages.push(Stage::Unwind(field.to_string()));
        self
    }

    pub fn project(mut self, fields: Vec<(&str, ProjectExpr)>) -> Self {
        self.stages.push(Stage::Project(
            fields
                .into_iter()
                .map(|(name, expr)| (name.to_string(), expr))
                .collect(),
        ));
        self
    }

    pub fn sort(mut self, field: &str, direction: SortDirection) -> Self {
        self.stages.push(Stage::Sort {
            field: field.to_string(),
            direction,
        });
        self
    }

    /// Names of the collections a run over `base` reads, sorted.
    pub fn collections(&self, base: &str) -> BTreeSet<String> {
        let mut names = BTreeSet::from([base.to_string()]);
        for stage in &self.stages {
            if let Stage::Lookup(spec) = stage {
                names.insert(spec.from.clone());
            }
        }
        names
    }

    /// Check that every stage only references fields the previous stages
    /// are known to produce.
    pub fn check_shape(&self) -> Result<()> {
        let mut shape = Shape::Open;
        for stage in &self.stages {
            shape = shape.apply(stage)?;
        }
        Ok(())
    }
}

// =============================================================================
// Static Shape
// =============================================================================

/// Fields known to exist on every row at a point in the pipeline.
#[derive(Debug, Clone, PartialEq)]
enum Shape {
    /// Rows are collection documents; any field may exist.
    Open,
    Closed(BTreeSet<String>),
}

impl Shape {
    fn require(&self, stage: &Stage, path: &str) -> Result<()> {
        let root = path.split('.').next().unwrap_or(path);
        match self {
            Shape::Closed(fields) if !fields.contains(root) => Err(BazaarError::stage_mismatch(
                stage.name(),
                format!("field '{}' is not produced by the previous stage", path),
            )),
            _ => Ok(()),
        }
    }

    fn apply(self, stage: &Stage) -> Result<Shape> {
        match stage {
            Stage::Match(_) => Ok(self),
            Stage::Group(spec) => {
                if let GroupKey::Field(path) = &spec.key {
                    self.require(stage, path)?;
                }
                let mut out = BTreeSet::from([ID_FIELD.to_string()]);
                for (name, acc) in &spec.accumulators {
                    if let Accumulator::Sum(path) | Accumulator::Avg(path) = acc {
                        self.require(stage, path)?;
                    }
                    out.insert(name.clone());
                }
                Ok(Shape::Closed(out))
            }
            Stage::Lookup(spec) => {
                self.require(stage, &spec.local_field)?;
                Ok(match self {
                    Shape::Open => Shape::Open,
                    Shape::Closed(mut fields) => {
                        fields.insert(spec.as_field.clone());
                        Shape::Closed(fields)
                    }
                })
            }
            Stage::Unwind(path) => {
                self.require(stage, path)?;
                Ok(self)
            }
            Stage::Project(fields) => {
                for (name, expr) in fields {
                    match expr {
                        ProjectExpr::Include => self.require(stage, name)?,
                        ProjectExpr::Field(path) => self.require(stage, path)?,
                    }
                }
                Ok(Shape::Closed(fields.iter().map(|(n, _)| n.clone()).collect()))
            }
            Stage::Sort { field, .. } => {
                self.require(stage, field)?;
                Ok(self)
            }
        }
    }
}

// =============================================================================
// Executor
// =============================================================================

/// Query access to the collections a pipeline reads. One run sees one
/// consistent state of every collection it reads.
pub trait QuerySource {
    fn find(&self, collection: &str, query: &Query) -> Result<QueryResult>;

    /// Compile the patterns of a match stage that filters rows in flight.
    fn matcher<'f>(&self, filters: &'f [Filter]) -> Result<Matcher<'f>>;
}

/// Run a pipeline over `collection`, returning the final rows.
pub fn execute(pipeline: &Pipeline, collection: &str, source: &dyn QuerySource) -> Result<Vec<Value>> {
    pipeline.check_shape()?;

    // A leading match is answered by the query evaluator.
    let (source_query, stages) = match pipeline.stages.split_first() {
        Some((Stage::Match(filters), rest)) => (
            Query {
                filters: filters.clone(),
                ..Query::default()
            },
            rest,
        ),
        _ => (Query::new(), pipeline.stages.as_slice()),
    };

    let mut rows: Vec<Value> = source
        .find(collection, &source_query)?
        .into_iter()
        .map(|doc| doc.to_value())
        .collect();

    for stage in stages {
        rows = run_stage(stage, rows, source)?;
        tracing::debug!(collection, stage = stage.name(), rows = rows.len(), "stage complete");
    }
    Ok(rows)
}

fn run_stage(stage: &Stage, rows: Vec<Value>, source: &dyn QuerySource) -> Result<Vec<Value>> {
    match stage {
        Stage::Match(filters) => {
            let matcher = source.matcher(filters)?;
            Ok(rows.into_iter().filter(|row| matcher.matches(row)).collect())
        }
        Stage::Group(spec) => group(stage, spec, rows),
        Stage::Lookup(spec) => lookup(stage, spec, rows, source),
        Stage::Unwind(path) => unwind(stage, path, rows),
        Stage::Project(fields) => project(stage, fields, rows),
        Stage::Sort { field, direction } => {
            let mut keyed = Vec::with_capacity(rows.len());
            for row in rows {
                let key = IndexValue::from_value(required(stage, &row, field)?);
                keyed.push((key, row));
            }
            keyed.sort_by(|(a, _), (b, _)| match direction {
                SortDirection::Ascending => a.cmp(b),
                SortDirection::Descending => b.cmp(a),
            });
            Ok(keyed.into_iter().map(|(_, row)| row).collect())
        }
    }
}

fn required<'a>(stage: &Stage, row: &'a Value, path: &str) -> Result<&'a Value> {
    row.get_path(path).ok_or_else(|| {
        BazaarError::stage_mismatch(stage.name(), format!("row has no field '{}'", path))
    })
}

// -----------------------------------------------------------------------------
// Group
// -----------------------------------------------------------------------------

#[derive(Default)]
struct NumericAcc {
    values: Vec<Value>,
}

impl NumericAcc {
    fn push(&mut self, stage: &Stage, path: &str, value: &Value) -> Result<()> {
        match value {
            Value::Null => Ok(()),
            v if v.is_number() => {
                self.values.push(v.clone());
                Ok(())
            }
            other => Err(BazaarError::stage_mismatch(
                stage.name(),
                format!("field '{}' holds {}, expected a number", path, other.type_name()),
            )),
        }
    }

    fn has(&self, pred: fn(&Value) -> bool) -> bool {
        self.values.iter().any(pred)
    }

    fn sum(&self, stage: &Stage) -> Result<Value> {
        let overflow = || BazaarError::stage_mismatch(stage.name(), "sum overflow");
        if self.has(|v| matches!(v, Value::Decimal(_))) {
            let mut total = Decimal::ZERO;
            for v in &self.values {
                let d = v.as_decimal().ok_or_else(overflow)?;
                total = total.checked_add(d).ok_or_else(overflow)?;
            }
            Ok(Value::Decimal(total))
        } else if self.has(|v| matches!(v, Value::Float(_))) {
            Ok(Value::Float(self.values.iter().filter_map(Value::as_f64).sum()))
        } else {
            let mut total: i64 = 0;
            for v in &self.values {
                total = v
                    .as_i64()
                    .and_then(|n| total.checked_add(n))
                    .ok_or_else(overflow)?;
            }
            Ok(Value::Int(total))
        }
    }

    fn avg(&self, stage: &Stage, path: &str) -> Result<Value> {
        if self.values.is_empty() {
            return Err(BazaarError::EmptyGroupAverage(path.to_string()));
        }
        let count = self.values.len();
        match self.sum(stage)? {
            Value::Decimal(total) => total
                .checked_div(Decimal::from(count as u64))
                .map(Value::Decimal)
                .ok_or_else(|| BazaarError::stage_mismatch(stage.name(), "average overflow")),
            total => Ok(Value::Float(total.as_f64().unwrap_or(f64::NAN) / count as f64)),
        }
    }
}

struct Partition {
    key: Value,
    rows: usize,
    numeric: Vec<NumericAcc>,
}

fn group(stage: &Stage, spec: &GroupSpec, rows: Vec<Value>) -> Result<Vec<Value>> {
    let mut order: BTreeMap<IndexValue, usize> = BTreeMap::new();
    let mut partitions: Vec<Partition> = Vec::new();

    for row in &rows {
        let key = match &spec.key {
            GroupKey::Field(path) => required(stage, row, path)?.clone(),
            GroupKey::Literal(value) => value.clone(),
        };
        let slot = *order.entry(IndexValue::from_value(&key)).or_insert_with(|| {
            partitions.push(Partition {
                key,
                rows: 0,
                numeric: spec.accumulators.iter().map(|_| NumericAcc::default()).collect(),
            });
            partitions.len() - 1
        });
        let partition = &mut partitions[slot];
        partition.rows += 1;

        for ((_, acc), numeric) in spec.accumulators.iter().zip(&mut partition.numeric) {
            if let Accumulator::Sum(path) | Accumulator::Avg(path) = acc {
                numeric.push(stage, path, required(stage, row, path)?)?;
            }
        }
    }

    partitions
        .into_iter()
        .map(|partition| {
            let mut out = HashMap::new();
            for ((name, acc), numeric) in spec.accumulators.iter().zip(&partition.numeric) {
                let value = match acc {
                    Accumulator::Count => Value::Int(partition.rows as i64),
                    Accumulator::Sum(_) => numeric.sum(stage)?,
                    Accumulator::Avg(path) => numeric.avg(stage, path)?,
                };
                out.insert(name.clone(), value);
            }
            out.insert(ID_FIELD.to_string(), partition.key);
            Ok(Value::Object(out))
        })
        .collect()
}

// -----------------------------------------------------------------------------
// Lookup / Unwind / Project
// -----------------------------------------------------------------------------

fn lookup(
    stage: &Stage,
    spec: &LookupSpec,
    rows: Vec<Value>,
    source: &dyn QuerySource,
) -> Result<Vec<Value>> {
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let local = required(stage, &row, &spec.local_field)?.clone();
        let query = Query::new().with_filter(Filter::Eq {
            field: spec.foreign_field.clone(),
            value: local,
        });
        let matches: Vec<Value> = source
            .find(&spec.from, &query)?
            .into_iter()
            .map(|doc| doc.to_value())
            .collect();

        let Value::Object(mut fields) = row else {
            return Err(BazaarError::stage_mismatch(stage.name(), "row is not an object"));
        };
        fields.insert(spec.as_field.clone(), Value::Array(matches));
        out.push(Value::Object(fields));
    }
    Ok(out)
}

fn unwind(stage: &Stage, path: &str, rows: Vec<Value>) -> Result<Vec<Value>> {
    let mut out = Vec::new();
    for row in rows {
        let items = match required(stage, &row, path)? {
            Value::Array(items) => items.clone(),
            other => {
                return Err(BazaarError::stage_mismatch(
                    stage.name(),
                    format!("field '{}' holds {}, expected an array", path, other.type_name()),
                ))
            }
        };
        for item in items {
            let mut copy = row.clone();
            set_path(&mut copy, path, item);
            out.push(copy);
        }
    }
    Ok(out)
}

fn set_path(row: &mut Value, path: &str, value: Value) {
    let mut current = row;
    let mut parts = path.split('.').peekable();
    while let Some(part) = parts.next() {
        let Value::Object(fields) = current else {
            return;
        };
        if parts.peek().is_none() {
            fields.insert(part.to_string(), value);
            return;
        }
        match fields.get_mut(part) {
            Some(next) => current = next,
            None => return,
        }
    }
}

fn project(stage: &Stage, fields: &[(String, ProjectExpr)], rows: Vec<Value>) -> Result<Vec<Value>> {
    rows.iter()
        .map(|row| {
            let mut out = HashMap::with_capacity(fields.len());
            for (name, expr) in fields {
                let path = match expr {
                    ProjectExpr::Include => name,
                    ProjectExpr::Field(path) => path,
                };
                out.insert(name.clone(), required(stage, row, path)?.clone());
            }
            Ok(Value::Object(out))
        })
        .collect()
}

// =============================================================================
// Tests
// =============================================================================
