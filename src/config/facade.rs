//! Config loading entry points.

use crate::config::merge::merge_policy;
use crate::config::sources::{environment, global_file, workspace_file};
use crate::config::CadenceConfig;
use crate::error::ApiError;
use config::File;
use std::path::Path;

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration for a workspace: defaults, global file, workspace files, environment.
    pub fn load(workspace_root: &Path) -> Result<CadenceConfig, ApiError> {
        let builder = merge_policy::builder_with_defaults()?;
        let builder = global_file::add_to_builder(builder)?;
        let builder = workspace_file::add_to_builder(builder, workspace_root)?;
        let builder = environment::add_to_builder(builder);
        Ok(builder.build()?.try_deserialize()?)
    }

    /// Load configuration from one explicit file (plus defaults and environment).
    pub fn load_from_file(path: &Path) -> Result<CadenceConfig, ApiError> {
        if !path.exists() {
            return Err(ApiError::ConfigError(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
        let builder = merge_policy::builder_with_defaults()?.add_source(File::from(path));
        let builder = environment::add_to_builder(builder);
        Ok(builder.build()?.try_deserialize()?)
    }
}
