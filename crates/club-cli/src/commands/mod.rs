//! CLI subcommand implementations.

pub mod admin;
pub mod members;
pub mod payment;
pub mod reviews;
pub mod run_job;
pub mod status;
pub mod util;
