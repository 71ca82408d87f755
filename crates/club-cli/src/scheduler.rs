//! Wall-clock job scheduling.
//!
//! The scheduler thread only computes due instants, claims them in the store
//! and spawns one OS thread per claimed tick. Each run opens its own database
//! connection, so an over-running job never delays the other triggers.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use clap::ValueEnum;
use club_core::{MembershipChannel, MessageDispatch, MonthDay, ThreadSleeper, Trigger};
use club_db::{Database, DbError};
use serde::{Deserialize, Serialize};

use crate::reconcile::{LifecycleSettings, Reconciler, TickReport};
use crate::reminders::Reminders;

/// Longest the scheduler sleeps between checks.
const MAX_POLL: StdDuration = StdDuration::from_secs(1);

/// A scheduled job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum)]
pub enum Job {
    Merge,
    Activation,
    ActivationReminder,
    Expiration,
    RenewalReminder,
    FinalRenewalReminder,
    FeedbackRequest,
}

impl Job {
    pub const ALL: [Self; 7] = [
        Self::Merge,
        Self::Activation,
        Self::ActivationReminder,
        Self::Expiration,
        Self::RenewalReminder,
        Self::FinalRenewalReminder,
        Self::FeedbackRequest,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Self::Merge => "merge",
            Self::Activation => "activation",
            Self::ActivationReminder => "activation-reminder",
            Self::Expiration => "expiration",
            Self::RenewalReminder => "renewal-reminder",
            Self::FinalRenewalReminder => "final-renewal-reminder",
            Self::FeedbackRequest => "feedback-request",
        }
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One trigger per job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub merge: Trigger,
    pub activation: Trigger,
    pub activation_reminder: Trigger,
    pub expiration: Trigger,
    pub renewal_reminder: Trigger,
    pub final_renewal_reminder: Trigger,
    pub feedback_request: Trigger,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        let monthly = |day, hour| Trigger::Monthly {
            day,
            hour,
            minute: 0,
        };
        Self {
            merge: Trigger::Every(Duration::minutes(10)),
            activation: monthly(MonthDay::Day(1), 12),
            activation_reminder: monthly(MonthDay::Day(1), 16),
            expiration: monthly(MonthDay::Day(1), 18),
            renewal_reminder: monthly(MonthDay::Day(25), 17),
            final_renewal_reminder: monthly(MonthDay::Last, 12),
            feedback_request: monthly(MonthDay::Day(26), 14),
        }
    }
}

impl ScheduleConfig {
    pub const fn trigger(&self, job: Job) -> Trigger {
        match job {
            Job::Merge => self.merge,
            Job::Activation => self.activation,
            Job::ActivationReminder => self.activation_reminder,
            Job::Expiration => self.expiration,
            Job::RenewalReminder => self.renewal_reminder,
            Job::FinalRenewalReminder => self.final_renewal_reminder,
            Job::FeedbackRequest => self.feedback_request,
        }
    }
}

#[derive(Debug)]
struct Entry {
    job: Job,
    trigger: Trigger,
    next: Option<DateTime<Utc>>,
}

/// Tracks the next firing instant of every job.
#[derive(Debug)]
pub struct Scheduler {
    tz: Tz,
    entries: Vec<Entry>,
}

impl Scheduler {
    /// Starts every job from `now`.
    pub fn new(schedule: &ScheduleConfig, tz: Tz, now: DateTime<Utc>) -> Self {
        Self::starting_from(schedule, tz, |_| now)
    }

    /// Starts each job after its last claimed tick, or from `now` when it has
    /// never been claimed, so instants missed while no scheduler ran still fire.
    pub fn resume(
        schedule: &ScheduleConfig,
        tz: Tz,
        now: DateTime<Utc>,
        db: &Database,
    ) -> Result<Self, DbError> {
        let mut last = Vec::with_capacity(Job::ALL.len());
        for job in Job::ALL {
            last.push((job, db.last_tick(job.name())?));
        }
        Ok(Self::starting_from(schedule, tz, |job| {
            last.iter()
                .find(|(claimed, _)| *claimed == job)
                .and_then(|(_, at)| *at)
                .map_or(now, |at| at.min(now))
        }))
    }

    fn starting_from<F>(schedule: &ScheduleConfig, tz: Tz, from: F) -> Self
    where
        F: Fn(Job) -> DateTime<Utc>,
    {
        let entries = Job::ALL
            .into_iter()
            .map(|job| {
                let trigger = schedule.trigger(job);
                Entry {
                    job,
                    trigger,
                    next: trigger.next_after(from(job), tz),
                }
            })
            .collect();
        Self { tz, entries }
    }

    /// Jobs whose next instant is at or before `now`.
    ///
    /// Missed instants coalesce: each due job is reported once, at its latest
    /// missed instant. A job stays due until [`Scheduler::complete`] is called
    /// for it.
    pub fn due(&self, now: DateTime<Utc>) -> Vec<(Job, DateTime<Utc>)> {
        self.entries
            .iter()
            .filter_map(|entry| {
                let mut next = entry.next.filter(|next| *next <= now)?;
                while let Some(following) = entry
                    .trigger
                    .next_after(next, self.tz)
                    .filter(|following| *following > next && *following <= now)
                {
                    next = following;
                }
                Some((entry.job, next))
            })
            .collect()
    }

    /// Moves a job past `scheduled_for`.
    pub fn complete(&mut self, job: Job, scheduled_for: DateTime<Utc>) {
        if let Some(entry) = self.entries.iter_mut().find(|entry| entry.job == job) {
            entry.next = entry
                .trigger
                .next_after(scheduled_for, self.tz)
                .filter(|following| *following > scheduled_for);
        }
    }

    /// Earliest upcoming instant across all jobs.
    pub fn next_wake(&self) -> Option<DateTime<Utc>> {
        self.entries.iter().filter_map(|entry| entry.next).min()
    }
}

/// Runs one job against a store and a platform.
pub fn run_job<B>(
    db: &Database,
    bot: &B,
    settings: &LifecycleSettings,
    job: Job,
    now: DateTime<Utc>,
) -> Result<TickReport, DbError>
where
    B: MembershipChannel + MessageDispatch,
{
    let sleeper = ThreadSleeper;
    let reconciler = Reconciler::new(db, bot, bot, &sleeper, settings);
    let reminders = Reminders::new(db, bot, bot, settings);
    match job {
        Job::Merge => reconciler.merge_overlaps(),
        Job::Activation => reconciler.activate(now),
        Job::ActivationReminder => reminders.activation(now),
        Job::Expiration => reconciler.expire(now),
        Job::RenewalReminder => reminders.renewal(now),
        Job::FinalRenewalReminder => reminders.final_renewal(now),
        Job::FeedbackRequest => reminders.feedback(),
    }
}

/// Runs jobs on their own connection to a shared database file.
#[derive(Debug)]
pub struct JobRunner<B> {
    database_path: PathBuf,
    lease_ttl: Duration,
    bot: Arc<B>,
    settings: LifecycleSettings,
}

impl<B> JobRunner<B>
where
    B: MembershipChannel + MessageDispatch,
{
    pub const fn new(
        database_path: PathBuf,
        lease_ttl: Duration,
        bot: Arc<B>,
        settings: LifecycleSettings,
    ) -> Self {
        Self {
            database_path,
            lease_ttl,
            bot,
            settings,
        }
    }

    pub const fn settings(&self) -> &LifecycleSettings {
        &self.settings
    }

    pub fn open(&self) -> Result<Database, DbError> {
        Ok(Database::open(&self.database_path)?.with_lease_ttl(self.lease_ttl))
    }

    pub fn run(&self, job: Job, scheduled_for: DateTime<Utc>) -> Result<TickReport, DbError> {
        let span = tracing::info_span!("tick", job = %job, scheduled_for = %scheduled_for);
        let _guard = span.enter();
        let db = self.open()?;
        run_job(&db, self.bot.as_ref(), &self.settings, job, scheduled_for)
    }
}

/// Claims every due tick and starts a thread for each one this process won.
///
/// A tick whose claim fails stays due and is retried on the next call.
pub fn dispatch_due<B>(
    scheduler: &mut Scheduler,
    db: &Database,
    runner: &Arc<JobRunner<B>>,
    now: DateTime<Utc>,
) -> Vec<(Job, JoinHandle<()>)>
where
    B: MembershipChannel + MessageDispatch + Send + Sync + 'static,
{
    let mut handles = Vec::new();
    for (job, scheduled_for) in scheduler.due(now) {
        match db.claim_tick(job.name(), scheduled_for) {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(job = %job, %scheduled_for, "tick already claimed");
                scheduler.complete(job, scheduled_for);
                continue;
            }
            Err(error) => {
                tracing::warn!(job = %job, %scheduled_for, %error, "failed to claim tick");
                continue;
            }
        }
        scheduler.complete(job, scheduled_for);

        let runner = Arc::clone(runner);
        let spawned = std::thread::Builder::new()
            .name(format!("club-{job}"))
            .spawn(move || {
                if let Err(error) = runner.run(job, scheduled_for) {
                    tracing::error!(job = %job, %scheduled_for, %error, "job failed");
                }
            });
        match spawned {
            Ok(handle) => handles.push((job, handle)),
            Err(error) => {
                tracing::error!(job = %job, %scheduled_for, %error, "failed to spawn job thread");
            }
        }
    }
    handles
}

/// Runs the scheduler until the process is killed.
pub fn serve<B>(runner: &Arc<JobRunner<B>>, schedule: &ScheduleConfig) -> Result<()>
where
    B: MembershipChannel + MessageDispatch + Send + Sync + 'static,
{
    let db = runner.open().context("failed to open database")?;
    let mut scheduler = Scheduler::resume(schedule, runner.settings().timezone, Utc::now(), &db)
        .context("failed to read last ticks")?;
    tracing::info!(next_wake = ?scheduler.next_wake(), "scheduler started");

    let mut running: Vec<(Job, JoinHandle<()>)> = Vec::new();
    loop {
        let now = Utc::now();
        running.extend(dispatch_due(&mut scheduler, &db, runner, now));
        reap(&mut running);

        // Ticks whose claim failed stay due; retry them at the poll interval.
        let wait = if scheduler.due(now).is_empty() {
            scheduler.next_wake().map_or(MAX_POLL, |next| {
                (next - Utc::now())
                    .to_std()
                    .unwrap_or(StdDuration::ZERO)
                    .min(MAX_POLL)
            })
        } else {
            MAX_POLL
        };
        std::thread::sleep(wait);
    }
}

/// Joins finished job threads, logging any that panicked.
fn reap(running: &mut Vec<(Job, JoinHandle<()>)>) {
    let (finished, pending): (Vec<_>, Vec<_>) = running
        .drain(..)
        .partition(|(_, handle)| handle.is_finished());
    *running = pending;
    for (job, handle) in finished {
        if handle.join().is_err() {
            tracing::error!(job = %job, "job thread panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakePlatform, settings, utc};

    fn scheduler_at(now: DateTime<Utc>) -> Scheduler {
        Scheduler::new(&ScheduleConfig::default(), chrono_tz::Europe::Moscow, now)
    }

    #[test]
    fn nothing_is_due_before_the_first_instant() {
        let now = utc(2024, 9, 1, 8, 55);
        let scheduler = scheduler_at(now);

        assert!(scheduler.due(now).is_empty());
        assert_eq!(scheduler.next_wake(), Some(utc(2024, 9, 1, 9, 0)));
    }

    #[test]
    fn monthly_job_fires_at_local_time() {
        let scheduler = scheduler_at(utc(2024, 9, 1, 8, 59));

        let due = scheduler.due(utc(2024, 9, 1, 9, 0));

        assert!(due.contains(&(Job::Activation, utc(2024, 9, 1, 9, 0))));
        assert!(!due.iter().any(|(job, _)| *job == Job::Expiration));
    }

    #[test]
    fn missed_instants_coalesce_to_the_latest() {
        let start = utc(2024, 9, 1, 0, 0);
        let mut scheduler = scheduler_at(start);

        let due = scheduler.due(start + Duration::minutes(35));

        let merges: Vec<_> = due.iter().filter(|(job, _)| *job == Job::Merge).collect();
        assert_eq!(merges, vec![&(Job::Merge, start + Duration::minutes(30))]);
        scheduler.complete(Job::Merge, start + Duration::minutes(30));
        assert!(
            scheduler
                .due(start + Duration::minutes(36))
                .iter()
                .all(|(job, _)| *job != Job::Merge)
        );
    }

    #[test]
    fn last_day_trigger_handles_february() {
        let scheduler = scheduler_at(utc(2024, 2, 1, 0, 0));

        let due = scheduler.due(utc(2024, 2, 29, 9, 0));

        assert!(due.contains(&(Job::FinalRenewalReminder, utc(2024, 2, 29, 9, 0))));
    }

    #[test]
    fn schedule_config_reads_trigger_strings() {
        let json = r#"{"merge": "every 5m", "final_renewal_reminder": "monthly last 10:30"}"#;

        let schedule: ScheduleConfig = serde_json::from_str(json).expect("parse schedule");

        assert_eq!(schedule.merge, Trigger::Every(Duration::minutes(5)));
        assert_eq!(
            schedule.final_renewal_reminder,
            Trigger::Monthly {
                day: MonthDay::Last,
                hour: 10,
                minute: 30,
            }
        );
        assert_eq!(schedule.activation, ScheduleConfig::default().activation);
    }

    #[test]
    fn job_names_parse_back() {
        for job in Job::ALL {
            assert_eq!(Job::from_str(job.name(), false), Ok(job));
        }
    }

    #[test]
    fn each_tick_is_claimed_once_across_schedulers() {
        let temp = tempfile::tempdir().expect("create temp dir");
        let path = temp.path().join("club.db");
        let bot = Arc::new(FakePlatform::default());
        let runner = Arc::new(JobRunner::new(
            path.clone(),
            Duration::minutes(10),
            Arc::clone(&bot),
            settings(),
        ));

        let db = runner.open().expect("open db");
        let member = db.find_or_create_member("+79991234567").expect("create member");
        let mut uow = db
            .lock_member(member.id, StdDuration::ZERO)
            .expect("lock member");
        uow.append(utc(2024, 9, 1, 0, 0), utc(2024, 9, 10, 0, 0))
            .expect("append");
        uow.append(utc(2024, 9, 9, 0, 0), utc(2024, 9, 20, 0, 0))
            .expect("append");
        uow.commit().expect("commit");

        let other = runner.open().expect("open second connection");
        let start = utc(2024, 9, 2, 0, 0);
        let now = start + Duration::minutes(10);
        let mut first = scheduler_at(start);
        let mut second = scheduler_at(start);

        let won = dispatch_due(&mut first, &db, &runner, now);
        let lost = dispatch_due(&mut second, &other, &runner, now);

        assert_eq!(won.len(), 1);
        assert!(lost.is_empty());
        for (_, handle) in won {
            handle.join().expect("job thread");
        }
        let records = db.list_members().expect("list members");
        assert_eq!(records[0].intervals.len(), 1);
        assert_eq!(db.last_tick("merge").expect("last tick"), Some(now));
        assert!(second.due(now).is_empty());
    }

    #[test]
    fn due_job_stays_due_until_completed() {
        let mut scheduler = scheduler_at(utc(2024, 9, 1, 8, 59));
        let now = utc(2024, 9, 1, 9, 1);

        assert!(scheduler.due(now).contains(&(Job::Activation, utc(2024, 9, 1, 9, 0))));
        assert!(scheduler.due(now).contains(&(Job::Activation, utc(2024, 9, 1, 9, 0))));

        scheduler.complete(Job::Activation, utc(2024, 9, 1, 9, 0));

        assert!(!scheduler.due(now).iter().any(|(job, _)| *job == Job::Activation));
    }

    #[test]
    fn resumed_scheduler_fires_instants_missed_while_down() {
        let db = Database::open_in_memory().expect("open db");
        assert!(db.claim_tick("activation", utc(2024, 8, 1, 9, 0)).expect("claim"));
        let restart = utc(2024, 9, 1, 9, 5);

        let scheduler = Scheduler::resume(
            &ScheduleConfig::default(),
            chrono_tz::Europe::Moscow,
            restart,
            &db,
        )
        .expect("resume");

        let due = scheduler.due(restart);
        assert!(due.contains(&(Job::Activation, utc(2024, 9, 1, 9, 0))));
        assert!(!due.iter().any(|(job, _)| *job == Job::Expiration));
    }

    #[test]
    fn resumed_scheduler_coalesces_missed_months() {
        let db = Database::open_in_memory().expect("open db");
        assert!(db.claim_tick("activation", utc(2024, 6, 1, 9, 0)).expect("claim"));
        let restart = utc(2024, 9, 2, 0, 0);

        let scheduler = Scheduler::resume(
            &ScheduleConfig::default(),
            chrono_tz::Europe::Moscow,
            restart,
            &db,
        )
        .expect("resume");

        let activations: Vec<_> = scheduler
            .due(restart)
            .into_iter()
            .filter(|(job, _)| *job == Job::Activation)
            .collect();
        assert_eq!(activations, vec![(Job::Activation, utc(2024, 9, 1, 9, 0))]);
    }

    #[test]
    fn resumed_scheduler_without_history_starts_from_now() {
        let db = Database::open_in_memory().expect("open db");
        let restart = utc(2024, 9, 1, 9, 5);

        let scheduler = Scheduler::resume(
            &ScheduleConfig::default(),
            chrono_tz::Europe::Moscow,
            restart,
            &db,
        )
        .expect("resume");

        assert!(scheduler.due(restart).is_empty());
    }

    #[test]
    fn resumed_scheduler_skips_claimed_ticks() {
        let db = Database::open_in_memory().expect("open db");
        assert!(db.claim_tick("activation", utc(2024, 9, 1, 9, 0)).expect("claim"));
        let restart = utc(2024, 9, 1, 9, 5);

        let scheduler = Scheduler::resume(
            &ScheduleConfig::default(),
            chrono_tz::Europe::Moscow,
            restart,
            &db,
        )
        .expect("resume");

        assert!(!scheduler.due(restart).iter().any(|(job, _)| *job == Job::Activation));
    }
}
