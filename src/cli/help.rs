//! Command-name contract used in logs.

use crate::cli::parse::{Commands, QuotaCommands};

/// Dotted command name (e.g. "generate", "quota.show").
pub fn command_name(command: &Commands) -> String {
    match command {
        Commands::Generate { .. } => "generate".to_string(),
        Commands::Status { .. } => "status".to_string(),
        Commands::Jobs { .. } => "jobs".to_string(),
        Commands::Events { .. } => "events".to_string(),
        Commands::Abort { .. } => "abort".to_string(),
        Commands::Resume { .. } => "resume".to_string(),
        Commands::RerunDay { .. } => "rerun_day".to_string(),
        Commands::Quota { command } => format!("quota.{}", quota_command_name(command)),
        Commands::Chat { .. } => "chat".to_string(),
        Commands::Duration { .. } => "duration".to_string(),
    }
}

pub fn quota_command_name(command: &QuotaCommands) -> &'static str {
    match command {
        QuotaCommands::Show { .. } => "show",
        QuotaCommands::Reserve { .. } => "reserve",
        QuotaCommands::Migrate { .. } => "migrate",
    }
}
