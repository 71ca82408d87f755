use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use club_cli::commands::{admin, members, payment, reviews, run_job, status, util};
use club_cli::reconcile::{LifecycleSettings, Payment, Reconciler};
use club_cli::scheduler::{self, JobRunner};
use club_cli::{Cli, Commands, Config};
use club_core::ThreadSleeper;
use club_db::Database;
use club_telegram::TelegramBot;

type TelegramReconciler<'a> = Reconciler<'a, TelegramBot, TelegramBot, ThreadSleeper>;

/// Load config and open database, ensuring the parent directory exists.
fn open_database(config_path: Option<&Path>) -> Result<(Database, Config)> {
    let config = Config::load_from(config_path).context("failed to load configuration")?;
    tracing::debug!(?config, "loaded configuration");

    if let Some(parent) = config.database_path.parent() {
        std::fs::create_dir_all(parent).context("failed to create database directory")?;
    }

    let db = Database::open(&config.database_path)
        .context("failed to open database")?
        .with_lease_ttl(config.lease_ttl()?);
    Ok((db, config))
}

/// Runs `f` with a reconciler backed by the configured bot.
fn with_reconciler<F>(db: &Database, config: &Config, settings: &LifecycleSettings, f: F) -> Result<()>
where
    F: FnOnce(&TelegramReconciler<'_>) -> Result<()>,
{
    let bot = config.telegram()?;
    let sleeper = ThreadSleeper;
    let reconciler = Reconciler::new(db, &bot, &bot, &sleeper, settings);
    f(&reconciler)
}

#[expect(
    clippy::too_many_lines,
    reason = "CLI command dispatch is inherently verbose"
)]
fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env()
    };
    // Logs go to stderr; stdout carries command output only.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();

    let Some(command) = &cli.command else {
        use clap::CommandFactory;
        Cli::command().print_help()?;
        println!();
        return Ok(());
    };

    let (db, config) = open_database(cli.config.as_deref())?;
    let settings = config.settings()?;
    let now = Utc::now();
    let mut stdout = std::io::stdout();

    match command {
        Commands::Serve => {
            let bot = Arc::new(config.telegram()?);
            let runner = Arc::new(JobRunner::new(
                config.database_path.clone(),
                config.lease_ttl()?,
                bot,
                settings,
            ));
            scheduler::serve(&runner, &config.schedule)?;
        }
        Commands::RunJob { job, at } => {
            let at = at
                .as_deref()
                .map(|at| util::parse_datetime(at, now))
                .transpose()?
                .unwrap_or(now);
            let bot = config.telegram()?;
            run_job::run(&mut stdout, &db, &bot, &settings, *job, at)?;
        }
        Commands::IngestPayment {
            phone,
            months,
            start_month,
            start_year,
            username,
        } => {
            let payment = Payment {
                phone: util::normalize_phone(phone)?,
                paid_months: *months,
                start_month: *start_month,
                start_year: *start_year,
                username: username.clone(),
            };
            payment::run(&mut stdout, &db, &settings, &payment)?;
        }
        Commands::Link {
            phone,
            messaging_id,
            username,
        } => {
            let phone = util::normalize_phone(phone)?;
            admin::link(
                &mut stdout,
                &db,
                &settings,
                &phone,
                *messaging_id,
                username.as_deref(),
            )?;
        }
        Commands::SetEnd { phone, end } => {
            let phone = util::normalize_phone(phone)?;
            let end = util::parse_end(end, settings.timezone, now)?;
            admin::set_end(&mut stdout, &db, &settings, &phone, end, now)?;
        }
        Commands::DeleteSubscription { phone } => {
            let phone = util::normalize_phone(phone)?;
            with_reconciler(&db, &config, &settings, |reconciler| {
                admin::delete_subscription(&mut stdout, reconciler, settings.timezone, &phone)
            })?;
        }
        Commands::DeleteMember { phone } => {
            let phone = util::normalize_phone(phone)?;
            with_reconciler(&db, &config, &settings, |reconciler| {
                admin::delete_member(&mut stdout, reconciler, &phone)
            })?;
        }
        Commands::ChangePhone { old, new } => {
            let old = util::normalize_phone(old)?;
            let new = util::normalize_phone(new)?;
            admin::change_phone(&mut stdout, &db, &settings, &old, &new)?;
        }
        Commands::SendInvite { phone } => {
            let phone = util::normalize_phone(phone)?;
            with_reconciler(&db, &config, &settings, |reconciler| {
                admin::send_invite(&mut stdout, reconciler, &phone, now)
            })?;
        }
        Commands::Members { json } => {
            members::run(&mut stdout, &db, &settings, now, *json)?;
        }
        Commands::Review { messaging_id, text } => {
            reviews::record(&mut stdout, &db, *messaging_id, text, now)?;
        }
        Commands::Reviews { json } => {
            reviews::run(&mut stdout, &db, settings.timezone, *json)?;
        }
        Commands::Status => {
            status::run(&mut stdout, &db, &config.database_path)?;
        }
    }

    Ok(())
}
