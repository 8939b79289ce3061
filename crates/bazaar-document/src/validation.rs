//! Bazaar Document Validation
//!
//! Schema validation for documents. A schema is a recursive constraint tree:
//! leaf constraints on scalar values, object constraints with named
//! properties, and array constraints applied to every element. The validator
//! walks the tree alongside the document and reports every violation it
//! finds in a single pass.
//!
//! @version 0.1.0
//! @author Bazaar Development Team

use crate::types::{Document, Value, ID_FIELD};
use bazaar_common::{BazaarError, Result, Rule, Violation};
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

// =============================================================================
// Schema
// =============================================================================

/// Schema definition for one collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub name: String,
    pub root: ObjectSchema,
}

impl Schema {
    /// Create a new schema that accepts any document.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            root: ObjectSchema::new(),
        }
    }

    /// Add an optional field to the schema.
    pub fn field(mut self, name: impl Into<String>, constraint: impl Into<Constraint>) -> Self {
        self.root = self.root.field(name, constraint);
        self
    }

    /// Add a required field to the schema.
    pub fn required_field(
        mut self,
        name: impl Into<String>,
        constraint: impl Into<Constraint>,
    ) -> Self {
        self.root = self.root.required_field(name, constraint);
        self
    }

    /// Set whether fields not named by the schema are allowed.
    pub fn additional_properties(mut self, allow: bool) -> Self {
        self.root.additional_properties = allow;
        self
    }

    /// Look up the constraint for a top-level field.
    pub fn property(&self, name: &str) -> Option<&Constraint> {
        self.root.properties.get(name)
    }
}

// =============================================================================
// Constraint Tree
// =============================================================================

/// A node of the constraint tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Constraint {
    Leaf(FieldSchema),
    Object(ObjectSchema),
    Array(ArraySchema),
}

impl From<FieldSchema> for Constraint {
    fn from(schema: FieldSchema) -> Self {
        Self::Leaf(schema)
    }
}

impl From<ObjectSchema> for Constraint {
    fn from(schema: ObjectSchema) -> Self {
        Self::Object(schema)
    }
}

impl From<ArraySchema> for Constraint {
    fn from(schema: ArraySchema) -> Self {
        Self::Array(schema)
    }
}

/// Constraints on a nested object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectSchema {
    pub properties: BTreeMap<String, Constraint>,
    pub required: Vec<String>,
    pub additional_properties: bool,
    pub nullable: bool,
}

impl ObjectSchema {
    pub fn new() -> Self {
        Self {
            properties: BTreeMap::new(),
            required: Vec::new(),
            additional_properties: true,
            nullable: false,
        }
    }

    pub fn field(mut self, name: impl Into<String>, constraint: impl Into<Constraint>) -> Self {
        self.properties.insert(name.into(), constraint.into());
        self
    }

    pub fn required_field(
        mut self,
        name: impl Into<String>,
        constraint: impl Into<Constraint>,
    ) -> Self {
        let name = name.into();
        self.properties.insert(name.clone(), constraint.into());
        self.required.push(name);
        self
    }

    pub fn additional_properties(mut self, allow: bool) -> Self {
        self.additional_properties = allow;
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }
}

impl Default for ObjectSchema {
    fn default() -> Self {
        Self::new()
    }
}

/// Constraints on an array and each of its elements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArraySchema {
    pub items: Box<Constraint>,
    pub min_items: Option<usize>,
    pub max_items: Option<usize>,
    pub nullable: bool,
}

impl ArraySchema {
    pub fn of(items: impl Into<Constraint>) -> Self {
        Self {
            items: Box::new(items.into()),
            min_items: None,
            max_items: None,
            nullable: false,
        }
    }

    pub fn min_items(mut self, n: usize) -> Self {
        self.min_items = Some(n);
        self
    }

    pub fn max_items(mut self, n: usize) -> Self {
        self.max_items = Some(n);
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }
}

// =============================================================================
// Field Schema
// =============================================================================

/// Constraints on a single scalar field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSchema {
    pub field_type: FieldType,
    pub nullable: bool,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    pub pattern: Option<String>,
    pub enum_values: Option<Vec<Value>>,
    pub max_scale: Option<u32>,
}

impl FieldSchema {
    pub fn new(field_type: FieldType) -> Self {
        Self {
            field_type,
            nullable: false,
            min: None,
            max: None,
            min_length: None,
            max_length: None,
            pattern: None,
            enum_values: None,
            max_scale: None,
        }
    }

    pub fn string() -> Self {
        Self::new(FieldType::String)
    }

    pub fn int() -> Self {
        Self::new(FieldType::Int)
    }

    pub fn double() -> Self {
        Self::new(FieldType::Double)
    }

    pub fn number() -> Self {
        Self::new(FieldType::Number)
    }

    pub fn decimal() -> Self {
        Self::new(FieldType::Decimal)
    }

    pub fn bool() -> Self {
        Self::new(FieldType::Bool)
    }

    pub fn date() -> Self {
        Self::new(FieldType::Date)
    }

    pub fn reference() -> Self {
        Self::new(FieldType::Reference)
    }

    pub fn any() -> Self {
        Self::new(FieldType::Any)
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn min(mut self, min: f64) -> Self {
        self.min = Some(min);
        self
    }

    pub fn max(mut self, max: f64) -> Self {
        self.max = Some(max);
        self
    }

    pub fn min_length(mut self, len: usize) -> Self {
        self.min_length = Some(len);
        self
    }

    pub fn max_length(mut self, len: usize) -> Self {
        self.max_length = Some(len);
        self
    }

    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    pub fn enum_values(mut self, values: Vec<Value>) -> Self {
        self.enum_values = Some(values);
        self
    }

    /// Limit the number of fraction digits of a decimal value.
    pub fn max_scale(mut self, scale: u32) -> Self {
        self.max_scale = Some(scale);
        self
    }
}

// =============================================================================
// Field Type
// =============================================================================

/// Type of a field value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Int,
    /// Floating point; integral JSON numbers are accepted.
    Double,
    /// Any numeric kind.
    Number,
    /// Exact decimal; integers are accepted as whole decimals.
    Decimal,
    Bool,
    Date,
    /// Id of a document in another collection.
    Reference,
    Any,
}

impl FieldType {
    pub fn matches(&self, value: &Value) -> bool {
        matches!(
            (self, value),
            (Self::Any, _)
                | (Self::String | Self::Reference, Value::String(_))
                | (Self::Int, Value::Int(_))
                | (Self::Double, Value::Float(_) | Value::Int(_))
                | (Self::Number, Value::Int(_) | Value::Float(_) | Value::Decimal(_))
                | (Self::Decimal, Value::Decimal(_) | Value::Int(_))
                | (Self::Bool, Value::Bool(_))
                | (Self::Date, Value::Timestamp(_))
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Int => "int",
            Self::Double => "double",
            Self::Number => "number",
            Self::Decimal => "decimal",
            Self::Bool => "bool",
            Self::Date => "date",
            Self::Reference => "reference",
            Self::Any => "any",
        }
    }
}

// =============================================================================
// Validator
// =============================================================================

/// Validates documents against schemas. Compiled patterns are cached.
pub struct Validator {
    regex_size_limit: usize,
    patterns: Mutex<HashMap<String, Regex>>,
}

impl Validator {
    pub fn new(regex_size_limit: usize) -> Self {
        Self {
            regex_size_limit,
            patterns: Mutex::new(HashMap::new()),
        }
    }

    /// Validate a document. An empty result means the document is valid.
    pub fn validate(&self, schema: &Schema, doc: &Document) -> Vec<Violation> {
        let mut violations = Vec::new();
        self.check_fields(&schema.root, &doc.data, "", &mut violations);
        violations
    }

    /// Validate a document, turning violations into an error.
    pub fn ensure_valid(&self, schema: &Schema, doc: &Document) -> Result<()> {
        let violations = self.validate(schema, doc);
        if violations.is_empty() {
            Ok(())
        } else {
            Err(BazaarError::ValidationFailed(violations))
        }
    }

    /// Reject schemas that can never be evaluated: bad patterns or
    /// inverted bounds.
    pub fn check_schema(&self, schema: &Schema) -> Result<()> {
        self.check_object_schema(&schema.root, &schema.name)
    }

    fn check_object_schema(&self, object: &ObjectSchema, path: &str) -> Result<()> {
        for name in &object.required {
            if !object.properties.contains_key(name) && !object.additional_properties {
                return Err(BazaarError::InvalidSchema(format!(
                    "{}: required field '{}' is not a property",
                    path, name
                )));
            }
        }
        for (name, constraint) in &object.properties {
            self.check_constraint(constraint, &join_path(path, name))?;
        }
        Ok(())
    }

    fn check_constraint(&self, constraint: &Constraint, path: &str) -> Result<()> {
        match constraint {
            Constraint::Leaf(field) => {
                if let (Some(min), Some(max)) = (field.min_length, field.max_length) {
                    if min > max {
                        return Err(BazaarError::InvalidSchema(format!(
                            "{}: minLength {} exceeds maxLength {}",
                            path, min, max
                        )));
                    }
                }
                if let (Some(min), Some(max)) = (field.min, field.max) {
                    if min > max {
                        return Err(BazaarError::InvalidSchema(format!(
                            "{}: minimum {} exceeds maximum {}",
                            path, min, max
                        )));
                    }
                }
                if let Some(ref pattern) = field.pattern {
                    self.compile(pattern)
                        .map_err(|e| BazaarError::InvalidSchema(format!("{}: {}", path, e)))?;
                }
                Ok(())
            }
            Constraint::Object(object) => self.check_object_schema(object, path),
            Constraint::Array(array) => {
                if let (Some(min), Some(max)) = (array.min_items, array.max_items) {
                    if min > max {
                        return Err(BazaarError::InvalidSchema(format!(
                            "{}: minItems {} exceeds maxItems {}",
                            path, min, max
                        )));
                    }
                }
                self.check_constraint(&array.items, path)
            }
        }
    }

    fn check_fields(
        &self,
        object: &ObjectSchema,
        fields: &HashMap<String, Value>,
        path: &str,
        violations: &mut Vec<Violation>,
    ) {
        for required in &object.required {
            if !fields.contains_key(required) {
                violations.push(Violation::missing(join_path(path, required)));
            }
        }

        for (name, constraint) in &object.properties {
            if let Some(value) = fields.get(name) {
                self.check_value(constraint, value, &join_path(path, name), violations);
            }
        }

        if !object.additional_properties {
            let mut unknown: Vec<&String> = fields
                .keys()
                .filter(|k| k.as_str() != ID_FIELD && !object.properties.contains_key(*k))
                .collect();
            unknown.sort();
            for key in unknown {
                violations.push(Violation::constraint(join_path(path, key), Rule::UnknownField));
            }
        }
    }

    fn check_value(
        &self,
        constraint: &Constraint,
        value: &Value,
        path: &str,
        violations: &mut Vec<Violation>,
    ) {
        match constraint {
            Constraint::Leaf(field) => self.check_leaf(field, value, path, violations),
            Constraint::Object(object) => match value {
                Value::Null if object.nullable => {}
                Value::Object(fields) => self.check_fields(object, fields, path, violations),
                other => violations.push(Violation::type_mismatch(path, "object", other.type_name())),
            },
            Constraint::Array(array) => match value {
                Value::Null if array.nullable => {}
                Value::Array(items) => {
                    if let Some(min) = array.min_items {
                        if items.len() < min {
                            violations.push(Violation::constraint(path, Rule::MinItems(min)));
                        }
                    }
                    if let Some(max) = array.max_items {
                        if items.len() > max {
                            violations.push(Violation::constraint(path, Rule::MaxItems(max)));
                        }
                    }
                    for (i, item) in items.iter().enumerate() {
                        self.check_value(&array.items, item, &format!("{}.{}", path, i), violations);
                    }
                }
                other => violations.push(Violation::type_mismatch(path, "array", other.type_name())),
            },
        }
    }

    fn check_leaf(
        &self,
        field: &FieldSchema,
        value: &Value,
        path: &str,
        violations: &mut Vec<Violation>,
    ) {
        if value.is_null() && field.nullable {
            return;
        }

        if !field.field_type.matches(value) {
            violations.push(Violation::type_mismatch(
                path,
                field.field_type.name(),
                value.type_name(),
            ));
            return;
        }

        if let Some(ref enum_values) = field.enum_values {
            if !enum_values.iter().any(|allowed| allowed.loose_eq(value)) {
                violations.push(Violation::constraint(path, Rule::Enum));
            }
        }

        if value.is_number() {
            if let (Some(min), Some(n)) = (field.min, value.as_f64()) {
                if n < min {
                    violations.push(Violation::constraint(path, Rule::Minimum(min)));
                }
            }
            if let (Some(max), Some(n)) = (field.max, value.as_f64()) {
                if n > max {
                    violations.push(Violation::constraint(path, Rule::Maximum(max)));
                }
            }
            if let Some(max_scale) = field.max_scale {
                if let Value::Decimal(d) = value {
                    if d.normalize().scale() > max_scale {
                        violations.push(Violation::constraint(path, Rule::MaxScale(max_scale)));
                    }
                }
            }
        }

        if let Value::String(s) = value {
            let len = s.chars().count();
            if let Some(min_len) = field.min_length {
                if len < min_len {
                    violations.push(Violation::constraint(path, Rule::MinLength(min_len)));
                }
            }
            if let Some(max_len) = field.max_length {
                if len > max_len {
                    violations.push(Violation::constraint(path, Rule::MaxLength(max_len)));
                }
            }
            if let Some(ref pattern) = field.pattern {
                let matched = self.compile(pattern).is_ok_and(|re| re.is_match(s));
                if !matched {
                    violations.push(Violation::constraint(path, Rule::Pattern(pattern.clone())));
                }
            }
        }
    }

    /// Compile a pattern under the configured size limit, caching the result.
    pub(crate) fn compile(&self, pattern: &str) -> std::result::Result<Regex, regex::Error> {
        let mut cache = self.patterns.lock();
        if let Some(re) = cache.get(pattern) {
            return Ok(re.clone());
        }
        let re = regex::RegexBuilder::new(pattern)
            .size_limit(self.regex_size_limit)
            .build()?;
        cache.insert(pattern.to_string(), re.clone());
        Ok(re)
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new(1024 * 1024)
    }
}

fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", parent, name)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use serde_json::json;

    fn doc(json: serde_json::Value) -> Document {
        Document::from_json(json).unwrap()
    }

    fn leaf(schema: FieldSchema, value: Value) -> Vec<Violation> {
        let schema = Schema::new("test").field("f", schema);
        let mut d = Document::with_id("d");
        d.set("f", value);
        Validator::default().validate(&schema, &d)
    }

    #[test]
    fn test_type_validation() {
        assert!(leaf(FieldSchema::string(), Value::from("hello")).is_empty());
        assert!(matches!(
            leaf(FieldSchema::string(), Value::Int(42)).as_slice(),
            [Violation::TypeMismatch { .. }]
        ));
        assert!(leaf(FieldSchema::double(), Value::Int(42)).is_empty());
        assert_eq!(leaf(FieldSchema::int(), Value::Float(4.2)).len(), 1);
    }

    #[test]
    fn test_type_mismatch_short_circuits_rules() {
        let violations = leaf(FieldSchema::string().min_length(3).pattern("^x"), Value::Int(1));
        assert_eq!(violations.len(), 1);
        assert!(matches!(violations[0], Violation::TypeMismatch { .. }));
    }

    #[test]
    fn test_nullable() {
        assert_eq!(leaf(FieldSchema::string(), Value::Null).len(), 1);
        assert!(leaf(FieldSchema::string().nullable(), Value::Null).is_empty());
    }

    #[test]
    fn test_every_rule_is_reported() {
        let schema = FieldSchema::string().min_length(5).pattern(r"^\d+$");
        let violations = leaf(schema, Value::from("ab"));

        assert_eq!(violations.len(), 2);
        assert_eq!(violations[0].rule(), Some(&Rule::MinLength(5)));
        assert!(matches!(violations[1].rule(), Some(Rule::Pattern(_))));
    }

    #[test]
    fn test_length_counts_characters() {
        let schema = FieldSchema::string().min_length(3).max_length(4);
        assert!(leaf(schema.clone(), Value::from("João")).is_empty());
        assert_eq!(leaf(schema, Value::from("Jo")).len(), 1);
    }

    #[test]
    fn test_range_validation() {
        let schema = FieldSchema::int().min(1.0).max(5.0);
        assert!(leaf(schema.clone(), Value::Int(3)).is_empty());
        assert_eq!(
            leaf(schema.clone(), Value::Int(0))[0].rule(),
            Some(&Rule::Minimum(1.0))
        );
        assert_eq!(leaf(schema, Value::Int(6))[0].rule(), Some(&Rule::Maximum(5.0)));
    }

    #[test]
    fn test_decimal_scale_checked_by_value() {
        let schema = FieldSchema::decimal().max_scale(2);
        assert!(leaf(schema.clone(), Value::Decimal(Decimal::new(150000, 2))).is_empty());
        // 19.9900 normalizes to 19.99
        assert!(leaf(schema.clone(), Value::Decimal(Decimal::new(199900, 4))).is_empty());
        assert!(leaf(schema.clone(), Value::Int(1500)).is_empty());
        assert_eq!(
            leaf(schema, Value::Decimal(Decimal::new(19999, 3)))[0].rule(),
            Some(&Rule::MaxScale(2))
        );
    }

    #[test]
    fn test_enum_validation() {
        let schema = FieldSchema::string().enum_values(vec![Value::from("SP"), Value::from("RJ")]);
        assert!(leaf(schema.clone(), Value::from("SP")).is_empty());
        assert_eq!(leaf(schema, Value::from("XX"))[0].rule(), Some(&Rule::Enum));
    }

    #[test]
    fn test_nested_object_and_required() {
        let schema = Schema::new("usuarios")
            .required_field("nome", FieldSchema::string())
            .required_field(
                "endereco",
                ObjectSchema::new()
                    .required_field("cidade", FieldSchema::string())
                    .required_field("cep", FieldSchema::string().min_length(8)),
            );

        let violations = Validator::default().validate(
            &schema,
            &doc(json!({ "endereco": { "cep": "123" } })),
        );

        assert_eq!(
            violations,
            vec![
                Violation::missing("nome"),
                Violation::missing("endereco.cidade"),
                Violation::constraint("endereco.cep", Rule::MinLength(8)),
            ]
        );
    }

    #[test]
    fn test_array_of_objects_aggregates_element_violations() {
        let schema = Schema::new("categorias").required_field(
            "subcategorias",
            ArraySchema::of(
                ObjectSchema::new()
                    .required_field("nome", FieldSchema::string().min_length(3))
                    .required_field("descricao", FieldSchema::string()),
            ),
        );

        let violations = Validator::default().validate(
            &schema,
            &doc(json!({
                "subcategorias": [
                    { "nome": "Celulares", "descricao": "ok" },
                    { "nome": "TV" },
                    { "descricao": 7 }
                ]
            })),
        );

        let paths: Vec<&str> = violations.iter().map(Violation::path).collect();
        assert_eq!(
            paths,
            vec![
                "subcategorias.1.descricao",
                "subcategorias.1.nome",
                "subcategorias.2.nome",
                "subcategorias.2.descricao"
            ]
        );
    }

    #[test]
    fn test_array_item_counts() {
        let schema = Schema::new("geo").field(
            "coordinates",
            ArraySchema::of(FieldSchema::double()).min_items(2).max_items(2),
        );
        let validator = Validator::default();

        assert!(validator
            .validate(&schema, &doc(json!({ "coordinates": [-46.6, -23.5] })))
            .is_empty());
        let violations = validator.validate(&schema, &doc(json!({ "coordinates": [1.0, 2.0, 3.0] })));
        assert_eq!(violations[0].rule(), Some(&Rule::MaxItems(2)));
    }

    #[test]
    fn test_additional_properties() {
        let schema = Schema::new("strict")
            .field("a", FieldSchema::int())
            .additional_properties(false);

        let violations = Validator::default().validate(&schema, &doc(json!({ "a": 1, "b": 2 })));
        assert_eq!(violations, vec![Violation::constraint("b", Rule::UnknownField)]);
    }

    #[test]
    fn test_check_schema_rejects_bad_pattern() {
        let validator = Validator::default();
        let bad = Schema::new("bad").field("f", FieldSchema::string().pattern("(unclosed"));
        assert!(matches!(
            validator.check_schema(&bad),
            Err(BazaarError::InvalidSchema(_))
        ));

        let inverted = Schema::new("bad").field("f", FieldSchema::int().min(5.0).max(1.0));
        assert!(validator.check_schema(&inverted).is_err());
    }

    #[test]
    fn test_validation_is_deterministic() {
        let schema = Schema::new("t")
            .required_field("a", FieldSchema::string().min_length(3))
            .required_field("b", FieldSchema::int().min(0.0))
            .required_field("c", FieldSchema::bool());
        let d = doc(json!({ "a": "x", "b": -1 }));
        let validator = Validator::default();

        let first = validator.validate(&schema, &d);
        assert_eq!(first.len(), 3);
        for _ in 0..10 {
            assert_eq!(validator.validate(&schema, &d), first);
        }
    }
}
