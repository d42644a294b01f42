//! CLI parse: clap types for Cadence. No behavior; definitions only.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Cadence CLI - checkpointed seven-day plan generation
#[derive(Parser)]
#[command(name = "cadence")]
#[command(about = "Generate seven-day plans step by step under a daily token quota")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Workspace root directory
    #[arg(long, default_value = ".")]
    pub workspace: PathBuf,

    /// Configuration file path (overrides default config loading)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(long, default_value = "false")]
    pub verbose: bool,

    /// Disable logging entirely
    #[arg(long, default_value = "false")]
    pub quiet: bool,

    /// Log level (trace, debug, info, warn, error, off)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Log format (json, text)
    #[arg(long)]
    pub log_format: Option<String>,

    /// Log output (stdout, stderr, file)
    #[arg(long)]
    pub log_output: Option<String>,

    /// Log file path (if output is "file")
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Generate a plan and wait for it to finish
    Generate {
        /// JSON file with the profile
        #[arg(long)]
        profile: PathBuf,
        /// Identity charged for the generation (user id or anonymous session id)
        #[arg(long)]
        identity: String,
        /// JSON file with an array of feedback strings from earlier plans
        #[arg(long)]
        feedback: Option<PathBuf>,
        /// Language for generated text
        #[arg(long, default_value = "en")]
        language: String,
        /// Skip quota enforcement (subscribers)
        #[arg(long)]
        bypass_quota: bool,
        /// Start from another job's committed metadata and days
        #[arg(long)]
        seed_from: Option<String>,
    },
    /// Show a job and its plan so far
    Status {
        job: String,
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// List jobs
    Jobs {
        /// Only jobs owned by this identity
        #[arg(long)]
        owner: Option<String>,
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Show a job's progress events
    Events {
        job: String,
        /// Only events after this sequence number
        #[arg(long, default_value = "0")]
        after: u64,
    },
    /// Ask a job to stop before its next step
    Abort { job: String },
    /// Continue a job that stopped before finishing
    Resume { job: String },
    /// Regenerate one committed day in place
    RerunDay { job: String, day: u8 },
    /// Inspect or manage the daily token quota
    Quota {
        #[command(subcommand)]
        command: QuotaCommands,
    },
    /// Stream a single conversational reply to stdout
    Chat {
        #[arg(long)]
        identity: String,
        #[arg(long)]
        bypass_quota: bool,
        message: String,
    },
    /// Estimate minutes for a JSON array of activities
    Duration { file: PathBuf },
}

#[derive(Subcommand)]
pub enum QuotaCommands {
    /// Show usage for an identity
    Show {
        identity: String,
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Reserve tokens for an identity
    Reserve {
        identity: String,
        tokens: u64,
        #[arg(long)]
        bypass: bool,
    },
    /// Move an anonymous session's quota onto a signed-in identity
    Migrate { anon_id: String, user_id: String },
}
