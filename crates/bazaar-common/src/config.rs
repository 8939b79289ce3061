//! Bazaar Config - Engine Configuration
//!
//! Configuration for the document engine. Supports loading from TOML files
//! and programmatic construction, with defaults suitable for development.
//!
//! Key Features:
//! - Collection and document size limits
//! - Write-time validation toggle
//! - Regex compilation limits for schema patterns
//! - Geo index cell sizing
//!
//! @version 0.1.0
//! @author Bazaar Development Team

use crate::error::{BazaarError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

// =============================================================================
// Engine Configuration
// =============================================================================

/// Configuration for the document engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of collections one engine will hold.
    pub max_collections: usize,
    /// Maximum size of a document's JSON encoding, in bytes.
    pub max_document_size: usize,
    /// Validate documents against their collection schema on every write.
    pub validate_on_write: bool,
    /// Compiled size limit for schema regex patterns, in bytes.
    pub regex_size_limit: usize,
    /// Edge length of a geo2d index cell, in degrees.
    pub geo_cell_degrees: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_collections: 1000,
            max_document_size: 16 * 1024 * 1024, // 16 MB
            validate_on_write: true,
            regex_size_limit: 1024 * 1024, // 1 MB
            geo_cell_degrees: 0.1,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| BazaarError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the configured values are usable.
    pub fn validate(&self) -> Result<()> {
        if !(self.geo_cell_degrees.is_finite() && self.geo_cell_degrees > 0.0) {
            return Err(BazaarError::Configuration(format!(
                "geo_cell_degrees must be a positive number, got {}",
                self.geo_cell_degrees
            )));
        }
        if self.max_collections == 0 {
            return Err(BazaarError::Configuration(
                "max_collections must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert!(config.validate_on_write);
        assert_eq!(config.max_collections, 1000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = EngineConfig::from_toml("geo_cell_degrees = 0.5\n").unwrap();
        assert_eq!(config.geo_cell_degrees, 0.5);
        assert_eq!(config.max_document_size, 16 * 1024 * 1024);
    }

    #[test]
    fn test_invalid_cell_size_rejected() {
        let result = EngineConfig::from_toml("geo_cell_degrees = 0.0\n");
        assert!(matches!(result, Err(BazaarError::Configuration(_))));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_collections = 8").unwrap();
        writeln!(file, "validate_on_write = false").unwrap();

        let config = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.max_collections, 8);
        assert!(!config.validate_on_write);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let result = EngineConfig::from_file("/definitely/not/here/bazaar.toml");
        assert!(matches!(result, Err(BazaarError::Io(_))));
    }
}
