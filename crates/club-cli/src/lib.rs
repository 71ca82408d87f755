//! Club membership service library.
//!
//! Reconciliation ticks, reminders, the job scheduler and the `club` command
//! surface on top of `club-core`, `club-db` and `club-telegram`.

mod cli;
pub mod commands;
mod config;
pub mod notify;
pub mod reconcile;
pub mod reminders;
pub mod scheduler;
#[cfg(test)]
mod testing;

pub use cli::{Cli, Commands};
pub use config::Config;
