//! Cadence: checkpointed seven-day plan generation
//!
//! A plan is produced one bounded step at a time against a generative text service: first
//! the outline, then each of seven days. Every step is durably checkpointed before the job's
//! status moves, each identity is held to a rolling daily token quota, and conversational
//! replies can be relayed as a live stream under the same quota.

pub mod catalog;
pub mod cli;
pub mod clock;
pub mod config;
pub mod duration;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod progress;
pub mod provider;
pub mod quota;
pub mod relay;
pub mod store;
