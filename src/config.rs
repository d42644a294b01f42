//! Configuration System
//!
//! Layered configuration: built-in defaults, the user's global file, workspace files and
//! `CADENCE_`-prefixed environment variables, in increasing precedence. Each section is owned
//! by the module that consumes it and re-exported here.

use crate::logging::LoggingConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

mod facade;
mod merge;
mod sources;

pub use crate::pipeline::PipelineConfig;
pub use crate::provider::{ProviderConfig, ProviderType};
pub use crate::quota::QuotaConfig;
pub use facade::ConfigLoader;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CadenceConfig {
    /// Generative text service
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Daily token quota
    #[serde(default)]
    pub quota: QuotaConfig,

    /// Plan generation pipeline
    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub catalog: CatalogConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where the embedded database lives
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Absolute, or relative to the workspace root. Defaults to the user data directory.
    #[serde(default)]
    pub store_path: Option<PathBuf>,
}

impl StorageConfig {
    pub fn resolve_store_path(&self, workspace_root: &Path) -> PathBuf {
        match &self.store_path {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => workspace_root.join(path),
            None => directories::ProjectDirs::from("", "", "cadence")
                .map(|dirs| dirs.data_dir().join("store"))
                .unwrap_or_else(|| workspace_root.join(".cadence").join("store")),
        }
    }
}

/// Optional content catalog used to validate activity references
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// JSON file with an array of `{ "id": ..., "name": ... }` entries
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Configuration validation errors
#[derive(Debug, Clone)]
pub enum ValidationError {
    Provider(String),
    Quota(String),
    Pipeline(String),
    Storage(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::Provider(msg) => write!(f, "Provider: {}", msg),
            ValidationError::Quota(msg) => write!(f, "Quota: {}", msg),
            ValidationError::Pipeline(msg) => write!(f, "Pipeline: {}", msg),
            ValidationError::Storage(msg) => write!(f, "Storage: {}", msg),
        }
    }
}

impl std::error::Error for ValidationError {}

impl CadenceConfig {
    /// Validate the entire configuration, collecting every problem.
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if let Err(e) = self.provider.validate() {
            errors.push(ValidationError::Provider(e));
        }
        if let Err(e) = self.quota.validate() {
            errors.push(ValidationError::Quota(e));
        }
        if let Err(e) = self.pipeline.validate() {
            errors.push(ValidationError::Pipeline(e));
        }
        if let Some(path) = &self.storage.store_path {
            if path.as_os_str().is_empty() {
                errors.push(ValidationError::Storage(
                    "Store path cannot be empty".to_string(),
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
