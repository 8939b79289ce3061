//! Bazaar Patch - Partial Document Updates
//!
//! @version 0.1.0
//! @author Bazaar Development Team

use crate::types::{Document, Value, ID_FIELD};
use bazaar_common::{BazaarError, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// =============================================================================
// Patch
// =============================================================================

/// A single change to a dotted field path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PatchOp {
    Set { path: String, value: Value },
    Unset { path: String },
    Inc { path: String, amount: Value },
}

/// An ordered list of changes applied to a copy of a document. The result is
/// validated and written as a full replacement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    pub ops: Vec<PatchOp>,
}

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.ops.push(PatchOp::Set {
            path: path.into(),
            value: value.into(),
        });
        self
    }

    pub fn unset(mut self, path: impl Into<String>) -> Self {
        self.ops.push(PatchOp::Unset { path: path.into() });
        self
    }

    pub fn inc(mut self, path: impl Into<String>, amount: impl Into<Value>) -> Self {
        self.ops.push(PatchOp::Inc {
            path: path.into(),
            amount: amount.into(),
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Apply the patch, returning the patched copy.
    pub fn apply(&self, doc: &Document) -> Result<Document> {
        let mut patched = doc.clone();
        for op in &self.ops {
            match op {
                PatchOp::Set { path, value } => {
                    check_path(path)?;
                    patched
                        .set_path(path, value.clone())
                        .map_err(BazaarError::InvalidPatch)?;
                }
                PatchOp::Unset { path } => {
                    check_path(path)?;
                    patched.unset_path(path);
                }
                PatchOp::Inc { path, amount } => {
                    check_path(path)?;
                    let current = patched.get(path).cloned().unwrap_or(Value::Int(0));
                    let next = add_numbers(&current, amount).ok_or_else(|| {
                        BazaarError::InvalidPatch(format!(
                            "cannot increment {} at '{}' by {}",
                            current.type_name(),
                            path,
                            amount.type_name()
                        ))
                    })?;
                    patched.set_path(path, next).map_err(BazaarError::InvalidPatch)?;
                }
            }
        }
        Ok(patched)
    }
}

fn check_path(path: &str) -> Result<()> {
    if path.is_empty() || path.split('.').any(str::is_empty) {
        return Err(BazaarError::InvalidPatch(format!("malformed path '{}'", path)));
    }
    if path == ID_FIELD {
        return Err(BazaarError::InvalidPatch("_id is immutable".to_string()));
    }
    Ok(())
}

/// Numeric addition keeping the widest kind involved: decimal, then
/// double, then int. Int overflow yields `None`.
fn add_numbers(a: &Value, b: &Value) -> Option<Value> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => x.checked_add(*y).map(Value::Int),
        (Value::Decimal(_), _) | (_, Value::Decimal(_)) if a.is_number() && b.is_number() => {
            let sum: Decimal = a.as_decimal()?.checked_add(b.as_decimal()?)?;
            Some(Value::Decimal(sum))
        }
        _ if a.is_number() && b.is_number() => Some(Value::Float(a.as_f64()? + b.as_f64()?)),
        _ => None,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn product() -> Document {
        let mut doc = Document::with_id("p1");
        doc.set("quantidade_disponivel", 10i64);
        doc.set("preco", Decimal::new(150000, 2));
        doc
    }

    #[test]
    fn test_inc_int() {
        let patched = Patch::new()
            .inc("quantidade_disponivel", -3i64)
            .apply(&product())
            .unwrap();
        assert_eq!(
            patched.get("quantidade_disponivel"),
            Some(&Value::Int(7))
        );
    }

    #[test]
    fn test_inc_missing_field_starts_at_zero() {
        let patched = Patch::new().inc("pontos", 15i64).apply(&product()).unwrap();
        assert_eq!(patched.get("pontos"), Some(&Value::Int(15)));
    }

    #[test]
    fn test_inc_decimal_stays_decimal() {
        let patched = Patch::new()
            .inc("preco", Decimal::new(-5000, 2))
            .apply(&product())
            .unwrap();
        assert_eq!(
            patched.get("preco"),
            Some(&Value::Decimal(Decimal::new(145000, 2)))
        );
    }

    #[test]
    fn test_set_nested_and_unset() {
        let patched = Patch::new()
            .set("resposta.mensagem", "Obrigado!")
            .unset("preco")
            .apply(&product())
            .unwrap();

        assert!(patched.contains("resposta.mensagem"));
        assert!(!patched.contains("preco"));
    }

    #[test]
    fn test_invalid_patches() {
        let doc = product();
        assert!(matches!(
            Patch::new().set("_id", "other").apply(&doc),
            Err(BazaarError::InvalidPatch(_))
        ));
        let mut named = doc.clone();
        named.set("nome", "Celular");
        assert!(Patch::new().inc("nome", 1i64).apply(&named).is_err());
        assert!(Patch::new().set("a..b", 1i64).apply(&doc).is_err());
    }

    #[test]
    fn test_apply_leaves_original_untouched() {
        let doc = product();
        let _ = Patch::new().inc("quantidade_disponivel", 1i64).apply(&doc);
        assert_eq!(doc.get("quantidade_disponivel"), Some(&Value::Int(10)));
    }
}
