//! Content catalog
//!
//! Read-only reference data that activity `ref_id`s point into. The pipeline only asks
//! whether an id exists and lists available ids to the service.

use crate::error::ApiError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

pub trait ContentCatalog: Send + Sync {
    fn contains(&self, ref_id: &str) -> bool;

    /// Display name for an id, if known.
    fn name(&self, ref_id: &str) -> Option<String>;

    /// All entries, ordered by id.
    fn entries(&self) -> Vec<CatalogEntry>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryCatalog {
    entries: BTreeMap<String, CatalogEntry>,
}

impl InMemoryCatalog {
    pub fn from_entries(entries: impl IntoIterator<Item = CatalogEntry>) -> Self {
        Self {
            entries: entries.into_iter().map(|e| (e.id.clone(), e)).collect(),
        }
    }

    /// Load a JSON array of entries.
    pub fn load_json(path: &Path) -> Result<Self, ApiError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ApiError::ConfigError(format!("Failed to read catalog {}: {}", path.display(), e))
        })?;
        let entries: Vec<CatalogEntry> = serde_json::from_str(&raw).map_err(|e| {
            ApiError::ConfigError(format!("Invalid catalog {}: {}", path.display(), e))
        })?;
        if let Some(blank) = entries.iter().find(|e| e.id.trim().is_empty()) {
            return Err(ApiError::ConfigError(format!(
                "Catalog entry '{}' has an empty id",
                blank.name
            )));
        }
        Ok(Self::from_entries(entries))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ContentCatalog for InMemoryCatalog {
    fn contains(&self, ref_id: &str) -> bool {
        self.entries.contains_key(ref_id)
    }

    fn name(&self, ref_id: &str) -> Option<String> {
        self.entries.get(ref_id).map(|e| e.name.clone())
    }

    fn entries(&self) -> Vec<CatalogEntry> {
        self.entries.values().cloned().collect()
    }
}
