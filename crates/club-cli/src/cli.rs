//! Command-line argument definitions.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::scheduler::Job;

/// Membership lifecycle service for a paid club.
///
/// Turns payments into subscription intervals, hands out single-use invite
/// links when a period starts and removes members when it ends.
#[derive(Debug, Parser)]
#[command(name = "club", version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config file.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the job scheduler until the process is stopped.
    Serve,

    /// Run one job immediately.
    RunJob {
        #[arg(value_enum)]
        job: Job,

        /// Run as of this instant (ISO 8601 or relative, e.g. '2 hours ago').
        #[arg(long)]
        at: Option<String>,
    },

    /// Record a payment and append the interval it buys.
    IngestPayment {
        /// Member phone number; a leading + is added if missing.
        #[arg(long)]
        phone: String,

        /// Number of paid months.
        #[arg(long, default_value_t = 1)]
        months: i64,

        /// First paid month (1-12).
        #[arg(long)]
        start_month: u32,

        #[arg(long)]
        start_year: i32,

        /// Telegram username, with or without the leading @.
        #[arg(long)]
        username: Option<String>,
    },

    /// Attach a Telegram user id to a member.
    Link {
        #[arg(long)]
        phone: String,

        #[arg(long)]
        messaging_id: i64,

        #[arg(long)]
        username: Option<String>,
    },

    /// Set the end of a member's nearest subscription.
    SetEnd {
        #[arg(long)]
        phone: String,

        /// New end: a local date (2024-10-31, ends at 23:59), ISO 8601, or relative.
        #[arg(long)]
        end: String,
    },

    /// Revoke the links of a member's nearest subscription and delete it.
    DeleteSubscription {
        #[arg(long)]
        phone: String,
    },

    /// Revoke every link of a member and delete the member.
    DeleteMember {
        #[arg(long)]
        phone: String,
    },

    /// Change a member's phone number.
    ChangePhone {
        #[arg(long)]
        old: String,

        #[arg(long)]
        new: String,
    },

    /// Send (issuing if needed) the invite links for the current subscription.
    SendInvite {
        #[arg(long)]
        phone: String,
    },

    /// List members and their subscriptions.
    Members {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Record a member's reply to the feedback request.
    Review {
        /// Telegram user id of the author.
        #[arg(long)]
        messaging_id: i64,

        #[arg(long)]
        text: String,
    },

    /// List member feedback, oldest first.
    Reviews {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show database, scheduler and leaked-link status.
    Status,
}
