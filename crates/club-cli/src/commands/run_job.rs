//! One-off job execution.
//!
//! Runs outside the tick claim, so a manual run never blocks the scheduled one.

use std::io::Write;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use club_core::{MembershipChannel, MessageDispatch};
use club_db::Database;

use crate::reconcile::LifecycleSettings;
use crate::scheduler::{Job, run_job};

pub fn run<W, B>(
    writer: &mut W,
    db: &Database,
    bot: &B,
    settings: &LifecycleSettings,
    job: Job,
    now: DateTime<Utc>,
) -> Result<()>
where
    W: Write,
    B: MembershipChannel + MessageDispatch,
{
    let span = tracing::info_span!("tick", job = %job, scheduled_for = %now);
    let _guard = span.enter();
    let report = run_job(db, bot, settings, job, now).with_context(|| format!("{job} failed"))?;
    writeln!(writer, "{}", serde_json::to_string_pretty(&report)?)?;
    Ok(())
}
