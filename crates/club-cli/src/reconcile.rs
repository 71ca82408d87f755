//! Lifecycle reconciliation: the scheduled ticks and admin operations that
//! move members between lifecycle states.
//!
//! Every mutation runs inside one member's [`MemberUnitOfWork`]. An error while
//! processing a member rolls back that member's unit of work and is counted in
//! the [`TickReport`]; the remaining members are still processed.

use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use club_core::{
    BillingPeriod, Channel, ChannelError, DEFAULT_ADJACENCY_WINDOW, Interval, IssuePolicy,
    Issuance, IssueError, IssuedToken, LifecycleState, Member, MemberId, MembershipChannel,
    MessageDispatch, RequiredTokens, Sleeper, TokenIssuer, ValidationError, billing_period,
    local_month_start, merge,
};
use club_db::{Database, DbError, LeakedToken, MemberUnitOfWork};
use serde::Serialize;
use thiserror::Error;

use crate::notify::{self, Messages, RENEWAL_CONFIRMED};

/// Tunables shared by every tick and admin operation.
#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub adjacency_window: Duration,
    /// Only intervals that started within this window before `now` are activated.
    pub activation_window: Duration,
    pub lock_timeout: StdDuration,
    pub issue_policy: IssuePolicy,
    pub required_tokens: RequiredTokens,
    pub timezone: Tz,
    pub messages: Messages,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            adjacency_window: DEFAULT_ADJACENCY_WINDOW,
            activation_window: Duration::days(31),
            lock_timeout: StdDuration::from_secs(5),
            issue_policy: IssuePolicy::default(),
            required_tokens: RequiredTokens::PrimaryOnly,
            timezone: chrono_tz::Europe::Moscow,
            messages: Messages::default(),
        }
    }
}

/// Per-tick counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub members_seen: u32,
    pub succeeded: u32,
    pub unchanged: u32,
    pub lock_timeouts: u32,
    pub failed: u32,
    pub messages_sent: u32,
    pub messages_failed: u32,
    pub unreachable: u32,
}

impl TickReport {
    fn record(&mut self, member_id: MemberId, result: Result<Outcome, ReconcileError>) {
        match result {
            Ok(Outcome::Changed) => self.succeeded += 1,
            Ok(Outcome::Unchanged) => self.unchanged += 1,
            Err(error) if error.is_lock_timeout() => {
                self.lock_timeouts += 1;
                tracing::warn!(member_id = %member_id, "member skipped, lock held elsewhere");
            }
            Err(error) => {
                self.failed += 1;
                tracing::error!(member_id = %member_id, %error, "member reconciliation failed");
            }
        }
    }

    pub fn log(&self, job: &str) {
        tracing::info!(
            job,
            members_seen = self.members_seen,
            succeeded = self.succeeded,
            unchanged = self.unchanged,
            lock_timeouts = self.lock_timeouts,
            failed = self.failed,
            messages_sent = self.messages_sent,
            messages_failed = self.messages_failed,
            unreachable = self.unreachable,
            "tick finished"
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Changed,
    Unchanged,
}

/// Errors raised while reconciling one member.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error(transparent)]
    Issue(#[from] IssueError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("failed to deliver message to {phone}: {source}")]
    Dispatch {
        phone: String,
        #[source]
        source: ChannelError,
    },
    #[error("member {0} has no messaging id")]
    Unreachable(String),
    #[error("member {0} has no subscription")]
    NoInterval(String),
    #[error("member {0} has no subscription covering now")]
    NoCurrentInterval(String),
}

impl ReconcileError {
    pub const fn is_lock_timeout(&self) -> bool {
        matches!(self, Self::Db(DbError::LockTimeout { .. }))
    }
}

/// A payment (or free grant) to be turned into an interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payment {
    pub phone: String,
    pub paid_months: i64,
    pub start_month: u32,
    pub start_year: i32,
    pub username: Option<String>,
}

/// Drives members through their lifecycle against the external platform.
pub struct Reconciler<'a, P, D, S> {
    db: &'a Database,
    platform: &'a P,
    dispatch: &'a D,
    sleeper: &'a S,
    settings: &'a LifecycleSettings,
}

impl<'a, P, D, S> Reconciler<'a, P, D, S>
where
    P: MembershipChannel,
    D: MessageDispatch,
    S: Sleeper,
{
    pub const fn new(
        db: &'a Database,
        platform: &'a P,
        dispatch: &'a D,
        sleeper: &'a S,
        settings: &'a LifecycleSettings,
    ) -> Self {
        Self {
            db,
            platform,
            dispatch,
            sleeper,
            settings,
        }
    }

    /// Collapses every member's overlapping or adjacent intervals.
    ///
    /// Tokens held by absorbed intervals are revoked before the records are deleted.
    pub fn merge_overlaps(&self) -> Result<TickReport, DbError> {
        let ids = self.db.all_member_ids()?;
        Ok(self.each_member("merge", ids, |member_id, _| {
            self.merge_member(member_id)
        }))
    }

    /// Issues tokens for intervals that became current within the activation
    /// window and sends the invitation once all required tokens are held.
    pub fn activate(&self, now: DateTime<Utc>) -> Result<TickReport, DbError> {
        let ids = self.db.member_ids_with_current(now)?;
        Ok(self.each_member("activation", ids, |member_id, report| {
            self.activate_member(member_id, now, report)
        }))
    }

    /// Revokes and deletes expired intervals, removing channel access from
    /// members left without a current interval.
    pub fn expire(&self, now: DateTime<Utc>) -> Result<TickReport, DbError> {
        let ids = self.db.member_ids_with_expired(now)?;
        Ok(self.each_member("expiration", ids, |member_id, _| {
            self.expire_member(member_id, now)
        }))
    }

    /// Revokes the nearest interval's tokens and deletes it.
    pub fn delete_nearest(&self, phone: &str) -> Result<Interval, ReconcileError> {
        let mut uow = self.db.lock_member_by_phone(phone, self.settings.lock_timeout)?;
        let member = uow.member().clone();
        let nearest = uow
            .intervals()
            .first()
            .cloned()
            .ok_or_else(|| ReconcileError::NoInterval(member.phone.clone()))?;
        self.revoke_tokens(&member, &nearest);
        uow.delete(&nearest);
        uow.commit()?;
        tracing::info!(
            member_id = %member.id,
            phone = %member.phone,
            interval_id = %nearest.id,
            start = %nearest.start,
            end = %nearest.end,
            "deleted interval"
        );
        Ok(nearest)
    }

    /// Revokes every token the member holds, then deletes the member.
    pub fn delete_member(&self, phone: &str) -> Result<Member, ReconcileError> {
        let mut uow = self.db.lock_member_by_phone(phone, self.settings.lock_timeout)?;
        let member = uow.member().clone();
        for interval in uow.intervals() {
            self.revoke_tokens(&member, interval);
        }
        uow.delete_member();
        uow.commit()?;
        tracing::info!(member_id = %member.id, phone = %member.phone, "deleted member");
        Ok(member)
    }

    /// Sends the invitation for the interval covering `now`, issuing any
    /// missing tokens first.
    pub fn send_invite(&self, phone: &str, now: DateTime<Utc>) -> Result<Interval, ReconcileError> {
        let mut uow = self.db.lock_member_by_phone(phone, self.settings.lock_timeout)?;
        let member = uow.member().clone();
        let Some(recipient) = member.messaging_id else {
            return Err(ReconcileError::Unreachable(member.phone));
        };
        let current = uow
            .intervals()
            .iter()
            .find(|interval| interval.covers(now))
            .cloned()
            .ok_or_else(|| ReconcileError::NoCurrentInterval(member.phone.clone()))?;

        let interval = self.issue_missing(&mut uow, &member, &current)?;
        drop(uow);

        let text = notify::invitation(&interval.tokens());
        self.dispatch
            .send_message(recipient, &text)
            .map_err(|source| ReconcileError::Dispatch {
                phone: member.phone.clone(),
                source,
            })?;
        tracing::info!(member_id = %member.id, phone = %member.phone, interval_id = %interval.id, "invitation sent");
        Ok(interval)
    }

    fn each_member<F>(&self, job: &str, ids: Vec<MemberId>, mut reconcile: F) -> TickReport
    where
        F: FnMut(MemberId, &mut TickReport) -> Result<Outcome, ReconcileError>,
    {
        let mut report = TickReport::default();
        for member_id in ids {
            report.members_seen += 1;
            let result = reconcile(member_id, &mut report);
            report.record(member_id, result);
        }
        report.log(job);
        report
    }

    fn merge_member(&self, member_id: MemberId) -> Result<Outcome, ReconcileError> {
        let mut uow = self.db.lock_member(member_id, self.settings.lock_timeout)?;
        let plan = merge(uow.intervals(), self.settings.adjacency_window);
        if plan.is_noop() {
            return Ok(Outcome::Unchanged);
        }

        let member = uow.member().clone();
        for interval in &plan.discarded {
            self.revoke_tokens(&member, interval);
            uow.delete(interval);
        }
        for interval in plan.changed() {
            uow.save(interval)?;
        }
        uow.commit()?;
        tracing::info!(
            member_id = %member.id,
            phone = %member.phone,
            kept = plan.kept.len(),
            discarded = plan.discarded.len(),
            "merged intervals"
        );
        Ok(Outcome::Changed)
    }

    fn activate_member(
        &self,
        member_id: MemberId,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<Outcome, ReconcileError> {
        let mut uow = self.db.lock_member(member_id, self.settings.lock_timeout)?;
        let member = uow.member().clone();
        let window_start = now - self.settings.activation_window;
        let month_start = local_month_start(now, self.settings.timezone);
        let current: Vec<Interval> = uow
            .intervals()
            .iter()
            .filter(|interval| interval.covers(now))
            .cloned()
            .collect();

        let mut outcome = Outcome::Unchanged;
        for interval in current {
            match interval.state_at(now, self.settings.required_tokens) {
                LifecycleState::Activatable if interval.start >= window_start => {
                    let activated = self.issue_missing(&mut uow, &member, &interval)?;
                    outcome = Outcome::Changed;
                    tracing::info!(
                        member_id = %member.id,
                        phone = %member.phone,
                        interval_id = %activated.id,
                        start = %activated.start,
                        end = %activated.end,
                        "activated interval"
                    );
                    let text = notify::invitation(&activated.tokens());
                    notify::deliver(self.dispatch, &member, &text, report);
                }
                LifecycleState::Activatable => {
                    tracing::debug!(
                        member_id = %member.id,
                        interval_id = %interval.id,
                        start = %interval.start,
                        "interval started before the activation window"
                    );
                }
                LifecycleState::Active if interval.start < month_start => {
                    notify::deliver(self.dispatch, &member, RENEWAL_CONFIRMED, report);
                }
                _ => {}
            }
        }
        Ok(outcome)
    }

    fn expire_member(
        &self,
        member_id: MemberId,
        now: DateTime<Utc>,
    ) -> Result<Outcome, ReconcileError> {
        let mut uow = self.db.lock_member(member_id, self.settings.lock_timeout)?;
        let member = uow.member().clone();
        let (expired, remaining): (Vec<Interval>, Vec<Interval>) = uow
            .intervals()
            .iter()
            .cloned()
            .partition(|interval| interval.end < now);
        if expired.is_empty() {
            return Ok(Outcome::Unchanged);
        }

        for interval in &expired {
            self.revoke_tokens(&member, interval);
        }
        if !remaining.iter().any(|interval| interval.covers(now)) {
            self.remove_access(&member);
        }
        for interval in &expired {
            uow.delete(interval);
        }
        uow.commit()?;
        tracing::info!(
            member_id = %member.id,
            phone = %member.phone,
            expired = expired.len(),
            "removed expired intervals"
        );
        Ok(Outcome::Changed)
    }

    /// Issues every required token the interval lacks, persisting each one as
    /// soon as it is obtained.
    ///
    /// Tokens obtained before a failure stay recorded, so a later attempt only
    /// requests the missing channels.
    fn issue_missing(
        &self,
        uow: &mut MemberUnitOfWork<'_>,
        member: &Member,
        interval: &Interval,
    ) -> Result<Interval, ReconcileError> {
        let issuer = self.issuer();
        let mut current = interval.clone();
        for channel in interval.missing_tokens(self.settings.required_tokens) {
            let Issuance::Issued(token) = issuer.issue_for(&current, channel)? else {
                continue;
            };
            match uow.record_token(current.id, channel, &token) {
                Ok(stored) => current = stored,
                Err(error) => {
                    tracing::warn!(
                        member_id = %member.id,
                        interval_id = %current.id,
                        %channel,
                        %error,
                        "could not record token, revoking it"
                    );
                    self.revoke_one(member, &current, channel, &token);
                    return Err(error.into());
                }
            }
        }
        Ok(current)
    }

    fn revoke_tokens(&self, member: &Member, interval: &Interval) {
        for (channel, token) in interval.tokens() {
            self.revoke_one(member, interval, channel, token);
        }
    }

    /// Failed revocations go to the leaked-token ledger.
    fn revoke_one(&self, member: &Member, interval: &Interval, channel: Channel, token: &IssuedToken) {
        let Err(error) = self.issuer().revoke(channel, token) else {
            tracing::debug!(member_id = %member.id, interval_id = %interval.id, %channel, "revoked token");
            return;
        };
        tracing::error!(
            member_id = %member.id,
            phone = %member.phone,
            interval_id = %interval.id,
            start = %interval.start,
            end = %interval.end,
            %channel,
            %error,
            "token revocation failed"
        );
        let leaked = LeakedToken {
            member_id: member.id,
            interval_start: interval.start,
            interval_end: interval.end,
            channel,
            link: token.link.clone(),
            error: error.source.to_string(),
            recorded_at: Utc::now(),
        };
        if let Err(db_error) = self.db.record_leaked_token(&leaked) {
            tracing::error!(member_id = %member.id, %channel, error = %db_error, "failed to record leaked token");
        }
    }

    /// Removes the member from every required channel. Failures are logged only.
    fn remove_access(&self, member: &Member) {
        let Some(messaging_id) = member.messaging_id else {
            tracing::warn!(member_id = %member.id, phone = %member.phone, "cannot remove member without messaging id");
            return;
        };
        for &channel in self.settings.required_tokens.channels() {
            match self.platform.remove_member(channel, messaging_id) {
                Ok(()) => {
                    tracing::info!(member_id = %member.id, phone = %member.phone, %channel, "removed member from channel");
                }
                Err(error) => {
                    tracing::error!(member_id = %member.id, phone = %member.phone, %channel, %error, "failed to remove member from channel");
                }
            }
        }
    }

    const fn issuer(&self) -> TokenIssuer<'a, P, S> {
        TokenIssuer::new(self.platform, self.sleeper, self.settings.issue_policy)
    }
}

/// Appends the interval bought by `payment`, creating the member if needed.
pub fn append_interval(
    db: &Database,
    settings: &LifecycleSettings,
    payment: &Payment,
) -> Result<BillingPeriod, ReconcileError> {
    let period = billing_period(
        payment.start_year,
        payment.start_month,
        payment.paid_months,
        settings.timezone,
    )?;
    let member = db.find_or_create_member(&payment.phone)?;
    let mut uow = db.lock_member(member.id, settings.lock_timeout)?;
    if let Some(username) = &payment.username {
        let mut updated = uow.member().clone();
        updated.profile_link = Some(profile_link(username));
        uow.update_member(updated);
    }
    uow.append(period.start, period.end)?;
    uow.commit()?;
    tracing::info!(
        member_id = %member.id,
        phone = %member.phone,
        start = %period.start,
        end = %period.end,
        "appended interval"
    );
    Ok(period)
}

/// Moves the nearest interval's end, or opens `[now, end]` if the member has none.
pub fn set_nearest_end(
    db: &Database,
    settings: &LifecycleSettings,
    phone: &str,
    end: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<(DateTime<Utc>, DateTime<Utc>), ReconcileError> {
    let mut uow = db.lock_member_by_phone(phone, settings.lock_timeout)?;
    let bounds = if let Some(mut nearest) = uow.intervals().first().cloned() {
        nearest.end = end;
        uow.save(&nearest)?;
        (nearest.start, end)
    } else {
        uow.append(now, end)?;
        (now, end)
    };
    uow.commit()?;
    tracing::info!(phone, start = %bounds.0, end = %bounds.1, "set interval end");
    Ok(bounds)
}

/// Assigns the member's messaging identity.
pub fn link_member(
    db: &Database,
    settings: &LifecycleSettings,
    phone: &str,
    messaging_id: i64,
    username: Option<&str>,
) -> Result<Member, ReconcileError> {
    let member = db.find_or_create_member(phone)?;
    let mut uow = db.lock_member(member.id, settings.lock_timeout)?;
    let mut updated = uow.member().clone();
    updated.messaging_id = Some(messaging_id);
    if let Some(username) = username {
        updated.profile_link = Some(profile_link(username));
    }
    uow.update_member(updated.clone());
    uow.commit()?;
    tracing::info!(member_id = %updated.id, phone, messaging_id, "linked member");
    Ok(updated)
}

pub fn change_phone(
    db: &Database,
    settings: &LifecycleSettings,
    old: &str,
    new: &str,
) -> Result<Member, ReconcileError> {
    let mut uow = db.lock_member_by_phone(old, settings.lock_timeout)?;
    let mut updated = uow.member().clone();
    updated.phone = new.to_string();
    uow.update_member(updated.clone());
    uow.commit()?;
    tracing::info!(member_id = %updated.id, old, new, "changed phone");
    Ok(updated)
}

fn profile_link(username: &str) -> String {
    format!("https://t.me/{}", username.trim_start_matches('@'))
}
