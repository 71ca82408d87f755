//! Manual member and subscription edits.

use std::io::Write;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use club_core::{MembershipChannel, MessageDispatch, Sleeper};
use club_db::Database;

use super::util::local;
use crate::reconcile::{self, LifecycleSettings, Reconciler};

pub fn link<W: Write>(
    writer: &mut W,
    db: &Database,
    settings: &LifecycleSettings,
    phone: &str,
    messaging_id: i64,
    username: Option<&str>,
) -> Result<()> {
    let member = reconcile::link_member(db, settings, phone, messaging_id, username)
        .with_context(|| format!("failed to link {phone}"))?;
    writeln!(writer, "Linked {} to Telegram user {messaging_id}", member.phone)?;
    Ok(())
}

pub fn set_end<W: Write>(
    writer: &mut W,
    db: &Database,
    settings: &LifecycleSettings,
    phone: &str,
    end: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<()> {
    let (start, end) = reconcile::set_nearest_end(db, settings, phone, end, now)
        .with_context(|| format!("failed to set subscription end for {phone}"))?;
    writeln!(
        writer,
        "Subscription of {phone}: {} - {}",
        local(start, settings.timezone),
        local(end, settings.timezone),
    )?;
    Ok(())
}

pub fn change_phone<W: Write>(
    writer: &mut W,
    db: &Database,
    settings: &LifecycleSettings,
    old: &str,
    new: &str,
) -> Result<()> {
    reconcile::change_phone(db, settings, old, new)
        .with_context(|| format!("failed to change phone {old}"))?;
    writeln!(writer, "Changed phone {old} to {new}")?;
    Ok(())
}

pub fn delete_subscription<W, P, D, S>(
    writer: &mut W,
    reconciler: &Reconciler<'_, P, D, S>,
    tz: chrono_tz::Tz,
    phone: &str,
) -> Result<()>
where
    W: Write,
    P: MembershipChannel,
    D: MessageDispatch,
    S: Sleeper,
{
    let deleted = reconciler
        .delete_nearest(phone)
        .with_context(|| format!("failed to delete subscription of {phone}"))?;
    writeln!(
        writer,
        "Deleted subscription of {phone}: {} - {}",
        local(deleted.start, tz),
        local(deleted.end, tz),
    )?;
    Ok(())
}

pub fn delete_member<W, P, D, S>(
    writer: &mut W,
    reconciler: &Reconciler<'_, P, D, S>,
    phone: &str,
) -> Result<()>
where
    W: Write,
    P: MembershipChannel,
    D: MessageDispatch,
    S: Sleeper,
{
    reconciler
        .delete_member(phone)
        .with_context(|| format!("failed to delete member {phone}"))?;
    writeln!(writer, "Deleted member {phone}")?;
    Ok(())
}

pub fn send_invite<W, P, D, S>(
    writer: &mut W,
    reconciler: &Reconciler<'_, P, D, S>,
    phone: &str,
    now: DateTime<Utc>,
) -> Result<()>
where
    W: Write,
    P: MembershipChannel,
    D: MessageDispatch,
    S: Sleeper,
{
    let interval = reconciler
        .send_invite(phone, now)
        .with_context(|| format!("failed to send invite to {phone}"))?;
    writeln!(
        writer,
        "Sent {} invite link(s) to {phone}",
        interval.tokens().len()
    )?;
    Ok(())
}
