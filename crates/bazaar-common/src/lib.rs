//! Bazaar Common - Shared Types and Utilities
//!
//! Foundational error handling and configuration used by the Bazaar
//! document core. Provides the abstractions that let the registry,
//! validator, index manager, query evaluator and aggregation executor
//! report failures consistently.
//!
//! Key Features:
//! - Unified error type with user/constraint classification
//! - Structured validation violations
//! - Engine configuration with TOML loading
//!
//! @version 0.1.0
//! @author Bazaar Development Team

pub mod config;
pub mod error;
pub mod violation;

pub use config::EngineConfig;
pub use error::{BazaarError, Result};
pub use violation::{Rule, Violation};
