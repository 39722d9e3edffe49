// Configuration Module
// Loads database sources from tools.yaml and hands validated descriptors to the core

pub mod loader;
pub mod models;

use std::path::PathBuf;
use thiserror::Error;

pub use loader::{ConfigSummary, SourceCatalog, CONFIG_SEARCH_PATHS};
pub use models::{DatabaseKind, DialectOptions, RawSource, SourceDescriptor};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(String),

    #[error("Failed to read configuration file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid YAML in configuration file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid source configuration for '{name}': {reason}")]
    InvalidSource { name: String, reason: String },

    #[error("Unsupported database type: {0}")]
    UnsupportedKind(String),
}
