//! Core constants shared across burrow crates.

pub mod defaults;

pub use defaults::*;

/// Project name.
pub const PROJECT_NAME: &str = "burrow";
/// Project version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
