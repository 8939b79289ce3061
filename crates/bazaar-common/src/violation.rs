//! Bazaar Violations - Schema Validation Findings
//!
//! A validation pass reports every problem it finds as a `Violation`, so a
//! rejected write tells the caller about all of its faults at once.
//!
//! @version 0.1.0
//! @author Bazaar Development Team

use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// Violation
// =============================================================================

/// A single reason a document failed schema validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    /// A required field is absent.
    MissingField { path: String },
    /// The field holds a value of the wrong type; no further rules are checked.
    TypeMismatch {
        path: String,
        expected: String,
        found: String,
    },
    /// The field has the right type but breaks one of its rules.
    ConstraintViolation { path: String, rule: Rule },
}

impl Violation {
    pub fn missing(path: impl Into<String>) -> Self {
        Self::MissingField { path: path.into() }
    }

    pub fn type_mismatch(
        path: impl Into<String>,
        expected: impl Into<String>,
        found: impl Into<String>,
    ) -> Self {
        Self::TypeMismatch {
            path: path.into(),
            expected: expected.into(),
            found: found.into(),
        }
    }

    pub fn constraint(path: impl Into<String>, rule: Rule) -> Self {
        Self::ConstraintViolation {
            path: path.into(),
            rule,
        }
    }

    /// Dotted path of the offending field.
    pub fn path(&self) -> &str {
        match self {
            Self::MissingField { path }
            | Self::TypeMismatch { path, .. }
            | Self::ConstraintViolation { path, .. } => path,
        }
    }

    /// The broken rule, for constraint violations.
    pub fn rule(&self) -> Option<&Rule> {
        match self {
            Self::ConstraintViolation { rule, .. } => Some(rule),
            _ => None,
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingField { path } => write!(f, "missing required field '{}'", path),
            Self::TypeMismatch {
                path,
                expected,
                found,
            } => write!(f, "field '{}' expected {}, got {}", path, expected, found),
            Self::ConstraintViolation { path, rule } => {
                write!(f, "field '{}' violates {}", path, rule)
            }
        }
    }
}

// =============================================================================
// Rule
// =============================================================================

/// A constraint rule that a present, correctly typed value failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rule {
    MinLength(usize),
    MaxLength(usize),
    Minimum(f64),
    Maximum(f64),
    Enum,
    Pattern(String),
    MaxScale(u32),
    MinItems(usize),
    MaxItems(usize),
    UnknownField,
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MinLength(n) => write!(f, "minLength {}", n),
            Self::MaxLength(n) => write!(f, "maxLength {}", n),
            Self::Minimum(n) => write!(f, "minimum {}", n),
            Self::Maximum(n) => write!(f, "maximum {}", n),
            Self::Enum => write!(f, "enum"),
            Self::Pattern(p) => write!(f, "pattern {}", p),
            Self::MaxScale(n) => write!(f, "at most {} fraction digits", n),
            Self::MinItems(n) => write!(f, "minItems {}", n),
            Self::MaxItems(n) => write!(f, "maxItems {}", n),
            Self::UnknownField => write!(f, "no additional properties"),
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
    fn test_violation_accessors() {
        let v = Violation::constraint("endereco.estado", Rule::Enum);
        assert_eq!(v.path(), "endereco.estado");
        assert_eq!(v.rule(), Some(&Rule::Enum));
        assert_eq!(v.to_string(), "field 'endereco.estado' violates enum");

        let v = Violation::type_mismatch("nota", "int", "string");
        assert!(v.rule().is_none());
        assert_eq!(v.to_string(), "field 'nota' expected int, got string");
    }
}
