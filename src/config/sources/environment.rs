//! Environment source: CADENCE_<SECTION>__<KEY>, e.g. CADENCE_QUOTA__ENABLED=false.

use config::builder::DefaultState;
use config::{ConfigBuilder, Environment};

pub fn add_to_builder(builder: ConfigBuilder<DefaultState>) -> ConfigBuilder<DefaultState> {
    builder.add_source(
        Environment::with_prefix("CADENCE")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true),
    )
}
