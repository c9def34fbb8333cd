//! Shared domain types for the integration subsystem.
//!
//! These types are used by the orchestrator, the CLI and integration
//! processes themselves, so they carry no runtime dependencies beyond serde.

pub mod domain;
pub mod error;

pub use domain::*;
pub use error::{CoreError, Result};
