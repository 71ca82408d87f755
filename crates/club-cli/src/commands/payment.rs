//! Payment ingestion.

use std::io::Write;

use anyhow::{Context, Result};
use club_db::Database;

use super::util::local;
use crate::reconcile::{LifecycleSettings, Payment, append_interval};

pub fn run<W: Write>(
    writer: &mut W,
    db: &Database,
    settings: &LifecycleSettings,
    payment: &Payment,
) -> Result<()> {
    let period = append_interval(db, settings, payment)
        .with_context(|| format!("failed to record payment for {}", payment.phone))?;
    writeln!(
        writer,
        "Recorded {} month(s) for {}: {} - {}",
        payment.paid_months,
        payment.phone,
        local(period.start, settings.timezone),
        local(period.end, settings.timezone),
    )?;
    Ok(())
}
