//! Merge rules: defaults, override order, conflict handling.

use config::Config;
use config::ConfigBuilder;
use config::ConfigError;

/// Create a Config builder with merge policy defaults applied.
pub fn builder_with_defaults() -> Result<ConfigBuilder<config::builder::DefaultState>, ConfigError>
{
    Config::builder()
        .set_default("quota.enabled", true)?
        .set_default("quota.daily_tokens", 10_000i64)?
        .set_default("quota.window_hours", 24i64)?
        .set_default("quota.estimated_response_tokens", 500i64)?
        .set_default("pipeline.max_output_tokens", 2_000i64)?
        .set_default("pipeline.charge_quota", false)
}
