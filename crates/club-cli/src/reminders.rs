//! Read-only reminder ticks.
//!
//! Each tick selects recipients by a date predicate and sends one message per
//! member. Delivery failures are counted and logged per recipient.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use club_core::{
    Channel, Member, MembershipChannel, MessageDispatch, last_day_bounds, local_day_bounds,
};
use club_db::{Database, DbError, MemberInterval};

use crate::notify::{self, ACTIVATION_REMINDER, FEEDBACK_REQUEST};
use crate::reconcile::{LifecycleSettings, TickReport};

pub struct Reminders<'a, P, D> {
    db: &'a Database,
    platform: &'a P,
    dispatch: &'a D,
    settings: &'a LifecycleSettings,
}

impl<'a, P: MembershipChannel, D: MessageDispatch> Reminders<'a, P, D> {
    pub const fn new(
        db: &'a Database,
        platform: &'a P,
        dispatch: &'a D,
        settings: &'a LifecycleSettings,
    ) -> Self {
        Self {
            db,
            platform,
            dispatch,
            settings,
        }
    }

    /// Reminds members holding an active interval who have not joined the
    /// primary channel yet. A failed status lookup still sends the reminder.
    pub fn activation(&self, now: DateTime<Utc>) -> Result<TickReport, DbError> {
        let members = distinct_members(self.db.active_intervals(now)?);
        let mut report = TickReport::default();
        for member in members {
            report.members_seen += 1;
            if let Some(messaging_id) = member.messaging_id {
                match self.platform.member_status(Channel::Primary, messaging_id) {
                    Ok(status) if status.is_present() => {
                        report.unchanged += 1;
                        continue;
                    }
                    Ok(_) => {}
                    Err(error) => {
                        tracing::warn!(member_id = %member.id, phone = %member.phone, %error, "member status lookup failed");
                    }
                }
            }
            notify::deliver(self.dispatch, &member, ACTIVATION_REMINDER, &mut report);
        }
        report.log("activation-reminder");
        Ok(report)
    }

    /// Warns members whose interval ends on the last day of the current month.
    pub fn renewal(&self, now: DateTime<Utc>) -> Result<TickReport, DbError> {
        let (start, end) = last_day_bounds(now, self.settings.timezone);
        let members = distinct_members(self.db.intervals_ending_between(start, end)?);
        let text = self.settings.messages.renewal_reminder();
        Ok(self.send_all("renewal-reminder", members, &text))
    }

    /// Sends the last-day notice to members whose interval ends today, and a
    /// win-back message to members with nothing left.
    pub fn final_renewal(&self, now: DateTime<Utc>) -> Result<TickReport, DbError> {
        let (start, end) = local_day_bounds(now, self.settings.timezone);
        let ending = distinct_members(self.db.intervals_ending_between(start, end)?);
        let mut seen: HashSet<_> = ending.iter().map(|member| member.id).collect();
        let lapsed: Vec<Member> = self
            .db
            .members_without_interval_after(now)?
            .into_iter()
            .filter(|member| seen.insert(member.id))
            .collect();

        let messages = &self.settings.messages;
        let mut report = self.send_all("final-renewal-reminder", ending, &messages.final_renewal());
        let win_back = self.send_all("win-back", lapsed, &messages.win_back());
        report.members_seen += win_back.members_seen;
        report.messages_sent += win_back.messages_sent;
        report.messages_failed += win_back.messages_failed;
        report.unreachable += win_back.unreachable;
        Ok(report)
    }

    /// Asks every reachable member for feedback.
    pub fn feedback(&self) -> Result<TickReport, DbError> {
        let members = self.db.members_with_messaging_id()?;
        Ok(self.send_all("feedback-request", members, FEEDBACK_REQUEST))
    }

    fn send_all(&self, job: &str, members: Vec<Member>, text: &str) -> TickReport {
        let mut report = TickReport::default();
        for member in members {
            report.members_seen += 1;
            notify::deliver(self.dispatch, &member, text, &mut report);
        }
        report.log(job);
        report
    }
}

/// Members of `rows` in first-seen order, each once.
fn distinct_members(rows: Vec<MemberInterval>) -> Vec<Member> {
    let mut seen = HashSet::new();
    rows.into_iter()
        .map(|row| row.member)
        .filter(|member| seen.insert(member.id))
        .collect()
}
