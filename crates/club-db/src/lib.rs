//! Storage layer for club membership intervals.
//!
//! Provides persistence for members, their subscription intervals and the
//! bookkeeping the scheduler needs, using `rusqlite`.
//!
//! # Thread Safety
//!
//! The [`Database`] type wraps a `rusqlite::Connection`, which is `Send` but not `Sync`.
//! Every scheduler job opens its own `Database`; concurrent writers coordinate through
//! member leases (see [`Database::lock_member`]) and SQLite's own file locking.
//!
//! # Schema
//!
//! ## Timestamp Format
//!
//! Timestamps are stored as TEXT in RFC 3339 format with millisecond precision and a
//! `Z` suffix (e.g., `2024-09-01T09:00:00.000Z`). Every writer uses the same format, so
//! lexicographic ordering matches chronological ordering and range predicates can be
//! evaluated in SQL.
//!
//! ## Member Leases
//!
//! SQLite has no row locks. The `member_leases` table stands in for them: a row
//! `(member_id, owner, expires_at)` grants its owner exclusive write access to the
//! member's intervals until it is deleted or `expires_at` passes. A lease left behind
//! by a crashed process is taken over once it expires.

mod lease;

use std::path::Path;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use club_core::{Channel, Interval, IntervalId, IssuedToken, Member, MemberId, ValidationError};
use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;
use uuid::Uuid;

pub use lease::MemberUnitOfWork;

/// How long a connection waits on SQLite's file lock before failing a statement.
const BUSY_TIMEOUT: StdDuration = StdDuration::from_secs(5);

/// Default lifetime of a member lease.
pub const DEFAULT_LEASE_TTL: Duration = Duration::minutes(10);

const MEMBER_COLUMNS: &str = "m.id, m.phone, m.messaging_id, m.profile_link";

const INTERVAL_COLUMNS: &str = "i.id, i.member_id, i.start_at, i.end_at, i.access_token, \
     i.access_expires_at, i.secondary_token, i.secondary_expires_at, i.version";

/// Database errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// An error from the underlying database.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// A stored timestamp could not be parsed.
    #[error("invalid timestamp in {column}: {value}")]
    TimestampParse {
        column: &'static str,
        value: String,
        #[source]
        source: chrono::ParseError,
    },
    /// Another holder kept the member lease for the whole wait.
    #[error("timed out after {waited:?} waiting for the lock on member {member_id}")]
    LockTimeout {
        member_id: MemberId,
        waited: StdDuration,
    },
    /// Another owner took the member lease over after it expired.
    #[error("lease on member {member_id} was taken over before commit")]
    LeaseLost { member_id: MemberId },
    /// The stored interval changed since it was read.
    #[error("interval {interval_id} was modified concurrently")]
    Conflict { interval_id: IntervalId },
    /// Rejected before reaching the store.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// A unique column already holds the value.
    #[error("{field} {value} is already in use")]
    Duplicate { field: &'static str, value: String },
    #[error("member not found: {0}")]
    MemberNotFound(String),
    /// A stored value could not be mapped back to a domain type.
    #[error("invalid stored data: {0}")]
    InvalidData(String),
}

/// Database connection wrapper.
///
/// See the [module documentation](self) for thread safety considerations.
pub struct Database {
    conn: Connection,
    owner: String,
    lease_ttl: Duration,
}

/// A member with all of its intervals, ordered by start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberRecord {
    pub member: Member,
    pub intervals: Vec<Interval>,
}

/// One interval joined with its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberInterval {
    pub member: Member,
    pub interval: Interval,
}

/// A member's reply to a feedback request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Review {
    pub id: i64,
    pub member: Member,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

/// A token whose revocation failed and must be cleaned up by hand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeakedToken {
    pub member_id: MemberId,
    pub interval_start: DateTime<Utc>,
    pub interval_end: DateTime<Utc>,
    pub channel: Channel,
    pub link: String,
    pub error: String,
    pub recorded_at: DateTime<Utc>,
}

impl Database {
    /// Opens a database at the given path, creating it if necessary.
    ///
    /// The database schema is automatically initialized on first open.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::debug!(path = %path.display(), journal_mode = %mode, "opened database");
        let db = Self::with_connection(conn);
        db.init()?;
        Ok(db)
    }

    /// Opens an in-memory database.
    ///
    /// Useful for testing. The database is destroyed when the connection closes.
    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        let db = Self::with_connection(conn);
        db.init()?;
        Ok(db)
    }

    fn with_connection(conn: Connection) -> Self {
        Self {
            conn,
            owner: lease_owner(),
            lease_ttl: DEFAULT_LEASE_TTL,
        }
    }

    /// Sets how long member leases taken through this connection stay valid.
    #[must_use]
    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    /// Identity written into leases and tick claims, `<host>:<pid>:<uuid>`.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Initializes the database schema.
    ///
    /// This is idempotent - safe to call on an already-initialized database.
    fn init(&self) -> Result<(), DbError> {
        self.conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS members (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                phone TEXT NOT NULL UNIQUE,
                messaging_id INTEGER UNIQUE,
                profile_link TEXT,
                created_at TEXT NOT NULL
            );

            -- start_at/end_at: RFC 3339 UTC (e.g., '2024-09-01T09:00:00.000Z')
            -- access_token/secondary_token: invite links, NULL until issued
            -- version: bumped on every write, checked by optimistic updates
            CREATE TABLE IF NOT EXISTS intervals (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                member_id INTEGER NOT NULL,
                start_at TEXT NOT NULL,
                end_at TEXT NOT NULL,
                access_token TEXT,
                access_expires_at TEXT,
                secondary_token TEXT,
                secondary_expires_at TEXT,
                version INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                CHECK (start_at <= end_at),
                FOREIGN KEY (member_id) REFERENCES members(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_intervals_member ON intervals(member_id);
            CREATE INDEX IF NOT EXISTS idx_intervals_end ON intervals(end_at);

            CREATE TABLE IF NOT EXISTS member_leases (
                member_id INTEGER PRIMARY KEY,
                owner TEXT NOT NULL,
                expires_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS job_ticks (
                job TEXT NOT NULL,
                scheduled_for TEXT NOT NULL,
                claimed_at TEXT NOT NULL,
                owner TEXT NOT NULL,
                PRIMARY KEY (job, scheduled_for)
            );

            CREATE TABLE IF NOT EXISTS reviews (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                member_id INTEGER NOT NULL,
                text TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (member_id) REFERENCES members(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS leaked_tokens (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                member_id INTEGER NOT NULL,
                interval_start TEXT NOT NULL,
                interval_end TEXT NOT NULL,
                channel TEXT NOT NULL,
                link TEXT NOT NULL,
                error TEXT NOT NULL,
                recorded_at TEXT NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    /// Returns the member with this phone, creating it if necessary.
    pub fn find_or_create_member(&self, phone: &str) -> Result<Member, DbError> {
        let created = self.conn.execute(
            "INSERT OR IGNORE INTO members (phone, created_at) VALUES (?1, ?2)",
            params![phone, format_timestamp(Utc::now())],
        )?;
        if created > 0 {
            tracing::info!(phone, "created member");
        }
        self.find_member_by_phone(phone)?
            .ok_or_else(|| DbError::MemberNotFound(phone.to_string()))
    }

    pub fn find_member_by_phone(&self, phone: &str) -> Result<Option<Member>, DbError> {
        let sql = format!("SELECT {MEMBER_COLUMNS} FROM members m WHERE m.phone = ?1");
        Ok(self.conn.query_row(&sql, [phone], member_row).optional()?)
    }

    pub fn find_member_by_messaging_id(&self, messaging_id: i64) -> Result<Option<Member>, DbError> {
        let sql = format!("SELECT {MEMBER_COLUMNS} FROM members m WHERE m.messaging_id = ?1");
        Ok(self
            .conn
            .query_row(&sql, [messaging_id], member_row)
            .optional()?)
    }

    fn find_member(&self, member_id: MemberId) -> Result<Option<Member>, DbError> {
        let sql = format!("SELECT {MEMBER_COLUMNS} FROM members m WHERE m.id = ?1");
        Ok(self
            .conn
            .query_row(&sql, [member_id.0], member_row)
            .optional()?)
    }

    /// Lists every member id in ascending order.
    pub fn all_member_ids(&self) -> Result<Vec<MemberId>, DbError> {
        self.member_ids("SELECT id FROM members ORDER BY id ASC", &[])
    }

    /// Members holding at least one interval that ended before `now`.
    pub fn member_ids_with_expired(&self, now: DateTime<Utc>) -> Result<Vec<MemberId>, DbError> {
        let now = format_timestamp(now);
        self.member_ids(
            "SELECT DISTINCT member_id FROM intervals WHERE end_at < ?1 ORDER BY member_id ASC",
            &[&now],
        )
    }

    /// Members holding an interval that covers `now`.
    pub fn member_ids_with_current(&self, now: DateTime<Utc>) -> Result<Vec<MemberId>, DbError> {
        let now = format_timestamp(now);
        self.member_ids(
            "
            SELECT DISTINCT member_id FROM intervals
            WHERE start_at <= ?1 AND end_at >= ?1
            ORDER BY member_id ASC
            ",
            &[&now],
        )
    }

    fn member_ids(
        &self,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<MemberId>, DbError> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params, |row| row.get::<_, i64>(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(MemberId(row?));
        }
        Ok(ids)
    }

    /// Lists every member with its intervals, ordered by member id.
    pub fn list_members(&self) -> Result<Vec<MemberRecord>, DbError> {
        let sql = format!("SELECT {MEMBER_COLUMNS} FROM members m ORDER BY m.id ASC");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], member_row)?;
        let mut members = Vec::new();
        for row in rows {
            members.push(row?);
        }
        members
            .into_iter()
            .map(|member| {
                let intervals = self.intervals_for(member.id)?;
                Ok(MemberRecord { member, intervals })
            })
            .collect()
    }

    fn intervals_for(&self, member_id: MemberId) -> Result<Vec<Interval>, DbError> {
        let sql = format!(
            "SELECT {INTERVAL_COLUMNS} FROM intervals i WHERE i.member_id = ?1 ORDER BY i.start_at ASC, i.id ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([member_id.0], |row| interval_row(row, 0))?;
        let mut intervals = Vec::new();
        for row in rows {
            intervals.push(row?.into_interval()?);
        }
        Ok(intervals)
    }

    fn find_interval(&self, interval_id: IntervalId) -> Result<Option<Interval>, DbError> {
        let sql = format!("SELECT {INTERVAL_COLUMNS} FROM intervals i WHERE i.id = ?1");
        self.conn
            .query_row(&sql, [interval_id.0], |row| interval_row(row, 0))
            .optional()?
            .map(IntervalRow::into_interval)
            .transpose()
    }

    /// Intervals whose end lies in `[start, end)`, joined with their member.
    pub fn intervals_ending_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MemberInterval>, DbError> {
        if end <= start {
            return Ok(Vec::new());
        }
        self.member_intervals(
            "i.end_at >= ?1 AND i.end_at < ?2",
            &[&format_timestamp(start), &format_timestamp(end)],
        )
    }

    /// Intervals covering `now` that hold a primary token, joined with their member.
    pub fn active_intervals(&self, now: DateTime<Utc>) -> Result<Vec<MemberInterval>, DbError> {
        self.member_intervals(
            "i.start_at <= ?1 AND i.end_at >= ?1 AND i.access_token IS NOT NULL",
            &[&format_timestamp(now)],
        )
    }

    fn member_intervals(
        &self,
        predicate: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<MemberInterval>, DbError> {
        let sql = format!(
            "
            SELECT {MEMBER_COLUMNS}, {INTERVAL_COLUMNS}
            FROM intervals i
            JOIN members m ON m.id = i.member_id
            WHERE {predicate}
            ORDER BY m.id ASC, i.start_at ASC, i.id ASC
            "
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params, |row| Ok((member_row(row)?, interval_row(row, 4)?)))?;
        let mut result = Vec::new();
        for row in rows {
            let (member, interval) = row?;
            result.push(MemberInterval {
                member,
                interval: interval.into_interval()?,
            });
        }
        Ok(result)
    }

    /// Members with no interval ending at or after `instant`.
    pub fn members_without_interval_after(
        &self,
        instant: DateTime<Utc>,
    ) -> Result<Vec<Member>, DbError> {
        let sql = format!(
            "
            SELECT {MEMBER_COLUMNS} FROM members m
            WHERE NOT EXISTS (
                SELECT 1 FROM intervals i WHERE i.member_id = m.id AND i.end_at >= ?1
            )
            ORDER BY m.id ASC
            "
        );
        self.members(&sql, &[&format_timestamp(instant)])
    }

    /// Members the bot can write to.
    pub fn members_with_messaging_id(&self) -> Result<Vec<Member>, DbError> {
        let sql = format!(
            "SELECT {MEMBER_COLUMNS} FROM members m WHERE m.messaging_id IS NOT NULL ORDER BY m.id ASC"
        );
        self.members(&sql, &[])
    }

    fn members(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<Member>, DbError> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params, member_row)?;
        let mut members = Vec::new();
        for row in rows {
            members.push(row?);
        }
        Ok(members)
    }

    /// Claims one scheduled instant of a job.
    ///
    /// Returns `false` if the instant was already claimed, by this process or any
    /// other, so each instant runs at most once.
    pub fn claim_tick(&self, job: &str, scheduled_for: DateTime<Utc>) -> Result<bool, DbError> {
        let claimed = self.conn.execute(
            "
            INSERT OR IGNORE INTO job_ticks (job, scheduled_for, claimed_at, owner)
            VALUES (?1, ?2, ?3, ?4)
            ",
            params![
                job,
                format_timestamp(scheduled_for),
                format_timestamp(Utc::now()),
                self.owner,
            ],
        )?;
        Ok(claimed > 0)
    }

    /// Latest claimed instant of a job.
    pub fn last_tick(&self, job: &str) -> Result<Option<DateTime<Utc>>, DbError> {
        let value: Option<String> = self.conn.query_row(
            "SELECT MAX(scheduled_for) FROM job_ticks WHERE job = ?1",
            [job],
            |row| row.get(0),
        )?;
        value
            .map(|value| parse_timestamp(&value, "job_ticks.scheduled_for"))
            .transpose()
    }

    /// Stores feedback from the member linked to `messaging_id`.
    pub fn record_review(
        &self,
        messaging_id: i64,
        text: &str,
        created_at: DateTime<Utc>,
    ) -> Result<Review, DbError> {
        let member = self
            .find_member_by_messaging_id(messaging_id)?
            .ok_or_else(|| DbError::MemberNotFound(format!("messaging id {messaging_id}")))?;
        self.conn.execute(
            "INSERT INTO reviews (member_id, text, created_at) VALUES (?1, ?2, ?3)",
            params![member.id.0, text, format_timestamp(created_at)],
        )?;
        let id = self.conn.last_insert_rowid();
        tracing::info!(member_id = %member.id, review_id = id, "recorded review");
        Ok(Review {
            id,
            member,
            text: text.to_string(),
            created_at,
        })
    }

    /// Lists every review with its author, oldest first.
    pub fn reviews(&self) -> Result<Vec<Review>, DbError> {
        let sql = format!(
            "
            SELECT r.id, r.text, r.created_at, {MEMBER_COLUMNS}
            FROM reviews r
            JOIN members m ON m.id = r.member_id
            ORDER BY r.created_at ASC, r.id ASC
            "
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                Member {
                    id: MemberId(row.get(3)?),
                    phone: row.get(4)?,
                    messaging_id: row.get(5)?,
                    profile_link: row.get(6)?,
                },
            ))
        })?;
        let mut reviews = Vec::new();
        for row in rows {
            let (id, text, created_at, member) = row?;
            reviews.push(Review {
                id,
                member,
                text,
                created_at: parse_timestamp(&created_at, "reviews.created_at")?,
            });
        }
        Ok(reviews)
    }

    pub fn record_leaked_token(&self, leaked: &LeakedToken) -> Result<(), DbError> {
        self.conn.execute(
            "
            INSERT INTO leaked_tokens
                (member_id, interval_start, interval_end, channel, link, error, recorded_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ",
            params![
                leaked.member_id.0,
                format_timestamp(leaked.interval_start),
                format_timestamp(leaked.interval_end),
                leaked.channel.to_string(),
                leaked.link,
                leaked.error,
                format_timestamp(leaked.recorded_at),
            ],
        )?;
        Ok(())
    }

    /// Lists leaked tokens, oldest first.
    pub fn leaked_tokens(&self) -> Result<Vec<LeakedToken>, DbError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT member_id, interval_start, interval_end, channel, link, error, recorded_at
            FROM leaked_tokens
            ORDER BY recorded_at ASC, id ASC
            ",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?;
        let mut leaked = Vec::new();
        for row in rows {
            let (member_id, start, end, channel, link, error, recorded_at) = row?;
            leaked.push(LeakedToken {
                member_id: MemberId(member_id),
                interval_start: parse_timestamp(&start, "leaked_tokens.interval_start")?,
                interval_end: parse_timestamp(&end, "leaked_tokens.interval_end")?,
                channel: channel
                    .parse()
                    .map_err(|err: club_core::UnknownChannel| DbError::InvalidData(err.to_string()))?,
                link,
                error,
                recorded_at: parse_timestamp(&recorded_at, "leaked_tokens.recorded_at")?,
            });
        }
        Ok(leaked)
    }
}

/// Raw interval columns, converted after the row callback returns.
struct IntervalRow {
    id: i64,
    member_id: i64,
    start_at: String,
    end_at: String,
    access_token: Option<String>,
    access_expires_at: Option<String>,
    secondary_token: Option<String>,
    secondary_expires_at: Option<String>,
    version: i64,
}

impl IntervalRow {
    fn into_interval(self) -> Result<Interval, DbError> {
        let start = parse_timestamp(&self.start_at, "intervals.start_at")?;
        let end = parse_timestamp(&self.end_at, "intervals.end_at")?;
        Ok(Interval {
            id: IntervalId(self.id),
            member_id: MemberId(self.member_id),
            start,
            end,
            access_token: issued_token(
                self.access_token,
                self.access_expires_at,
                end,
                "intervals.access_expires_at",
            )?,
            secondary_token: issued_token(
                self.secondary_token,
                self.secondary_expires_at,
                end,
                "intervals.secondary_expires_at",
            )?,
            version: self.version,
        })
    }
}

fn issued_token(
    link: Option<String>,
    expires_at: Option<String>,
    fallback: DateTime<Utc>,
    column: &'static str,
) -> Result<Option<IssuedToken>, DbError> {
    let Some(link) = link else {
        return Ok(None);
    };
    let expires_at = match expires_at {
        Some(value) => parse_timestamp(&value, column)?,
        None => fallback,
    };
    Ok(Some(IssuedToken { link, expires_at }))
}

fn member_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Member> {
    Ok(Member {
        id: MemberId(row.get(0)?),
        phone: row.get(1)?,
        messaging_id: row.get(2)?,
        profile_link: row.get(3)?,
    })
}

fn interval_row(row: &rusqlite::Row<'_>, offset: usize) -> rusqlite::Result<IntervalRow> {
    Ok(IntervalRow {
        id: row.get(offset)?,
        member_id: row.get(offset + 1)?,
        start_at: row.get(offset + 2)?,
        end_at: row.get(offset + 3)?,
        access_token: row.get(offset + 4)?,
        access_expires_at: row.get(offset + 5)?,
        secondary_token: row.get(offset + 6)?,
        secondary_expires_at: row.get(offset + 7)?,
        version: row.get(offset + 8)?,
    })
}

/// Column pair holding a channel's token and its expiry.
const fn token_columns(channel: Channel) -> (&'static str, &'static str) {
    match channel {
        Channel::Primary => ("access_token", "access_expires_at"),
        Channel::Secondary => ("secondary_token", "secondary_expires_at"),
    }
}

fn lease_owner() -> String {
    let host = hostname::get().map_or_else(
        |_| "unknown".to_string(),
        |name| name.to_string_lossy().into_owned(),
    );
    format!("{host}:{}:{}", std::process::id(), Uuid::new_v4())
}

/// Maps unique-constraint violations to [`DbError::Duplicate`].
fn unique_violation(error: rusqlite::Error, field: &'static str, value: String) -> DbError {
    let is_unique = matches!(
        &error,
        rusqlite::Error::SqliteFailure(inner, _)
            if inner.code == rusqlite::ErrorCode::ConstraintViolation
    );
    if is_unique {
        DbError::Duplicate { field, value }
    } else {
        DbError::Sqlite(error)
    }
}

fn parse_timestamp(value: &str, column: &'static str) -> Result<DateTime<Utc>, DbError> {
    DateTime::parse_from_rfc3339(value)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|source| DbError::TimestampParse {
            column,
            value: value.to_string(),
            source,
        })
}

fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashSet;

    fn day(n: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, n, 9, 0, 0)
            .single()
            .expect("valid test timestamp")
    }

    fn seed(db: &Database, phone: &str, bounds: &[(DateTime<Utc>, DateTime<Utc>)]) -> MemberId {
        let member = db.find_or_create_member(phone).expect("create member");
        let mut uow = db
            .lock_member(member.id, StdDuration::ZERO)
            .expect("lock member");
        for (start, end) in bounds {
            uow.append(*start, *end).expect("append interval");
        }
        uow.commit().expect("commit");
        member.id
    }

    #[test]
    fn open_in_memory_database() {
        let db = Database::open_in_memory();
        assert!(db.is_ok());
    }

    #[test]
    fn schema_matches_data_model() {
        let db = Database::open_in_memory().expect("open in-memory db");

        assert_eq!(
            table_columns(&db.conn, "members"),
            vec!["id", "phone", "messaging_id", "profile_link", "created_at"]
        );
        assert_eq!(
            table_columns(&db.conn, "intervals"),
            vec![
                "id",
                "member_id",
                "start_at",
                "end_at",
                "access_token",
                "access_expires_at",
                "secondary_token",
                "secondary_expires_at",
                "version",
                "created_at",
            ]
        );
        assert_eq!(
            table_columns(&db.conn, "member_leases"),
            vec!["member_id", "owner", "expires_at"]
        );
        assert_eq!(
            table_columns(&db.conn, "job_ticks"),
            vec!["job", "scheduled_for", "claimed_at", "owner"]
        );
        assert_eq!(
            table_columns(&db.conn, "reviews"),
            vec!["id", "member_id", "text", "created_at"]
        );

        let indexes = index_names(&db.conn, "intervals");
        let expected: HashSet<String> = ["idx_intervals_member", "idx_intervals_end"]
            .into_iter()
            .map(String::from)
            .collect();
        assert!(expected.is_subset(&indexes));
    }

    fn table_columns(conn: &Connection, table: &str) -> Vec<String> {
        let mut stmt = conn
            .prepare(&format!("PRAGMA table_info({table})"))
            .expect("prepare table_info");
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .expect("query table_info");
        rows.map(|row| row.expect("table_info row")).collect()
    }

    fn index_names(conn: &Connection, table: &str) -> HashSet<String> {
        let mut stmt = conn
            .prepare(&format!("PRAGMA index_list({table})"))
            .expect("prepare index_list");
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .expect("query index_list");
        rows.map(|row| row.expect("index_list row")).collect()
    }

    #[test]
    fn find_or_create_member_is_idempotent() {
        let db = Database::open_in_memory().expect("open db");
        let first = db.find_or_create_member("+79991234567").expect("create");
        let second = db.find_or_create_member("+79991234567").expect("find");

        assert_eq!(first, second);
        assert_eq!(db.all_member_ids().expect("ids"), vec![first.id]);
    }

    #[test]
    fn member_ids_by_interval_state() {
        let db = Database::open_in_memory().expect("open db");
        let expired = seed(&db, "+70000000001", &[(day(1), day(5))]);
        let current = seed(&db, "+70000000002", &[(day(8), day(20))]);
        let both = seed(&db, "+70000000003", &[(day(1), day(2)), (day(9), day(25))]);
        seed(&db, "+70000000004", &[(day(20), day(25))]);

        let now = day(10);
        assert_eq!(
            db.member_ids_with_expired(now).expect("expired"),
            vec![expired, both]
        );
        assert_eq!(
            db.member_ids_with_current(now).expect("current"),
            vec![current, both]
        );
    }

    #[test]
    fn list_members_orders_intervals_by_start() {
        let db = Database::open_in_memory().expect("open db");
        let id = seed(&db, "+70000000001", &[(day(10), day(20)), (day(1), day(5))]);

        let members = db.list_members().expect("list");
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].member.id, id);
        let starts: Vec<_> = members[0].intervals.iter().map(|i| i.start).collect();
        assert_eq!(starts, vec![day(1), day(10)]);
    }

    #[test]
    fn reminder_queries_filter_by_end() {
        let db = Database::open_in_memory().expect("open db");
        let ending = seed(&db, "+70000000001", &[(day(1), day(30))]);
        let lapsed = seed(&db, "+70000000002", &[(day(1), day(3))]);
        let renewed = seed(&db, "+70000000003", &[(day(1), day(29))]);

        let ending_today = db
            .intervals_ending_between(day(29) + Duration::hours(12), day(30) + Duration::hours(12))
            .expect("ending");
        let ids: Vec<_> = ending_today.iter().map(|mi| mi.member.id).collect();
        assert_eq!(ids, vec![ending]);

        let without = db
            .members_without_interval_after(day(10))
            .expect("lapsed");
        let ids: Vec<_> = without.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![lapsed]);
        assert!(!ids.contains(&renewed));

        assert!(
            db.intervals_ending_between(day(30), day(1))
                .expect("empty range")
                .is_empty()
        );
    }

    #[test]
    fn active_intervals_require_primary_token() {
        let db = Database::open_in_memory().expect("open db");
        let id = seed(&db, "+70000000001", &[(day(1), day(30))]);
        seed(&db, "+70000000002", &[(day(1), day(30))]);

        let mut uow = db.lock_member(id, StdDuration::ZERO).expect("lock");
        let interval_id = uow.intervals()[0].id;
        uow.record_token(
            interval_id,
            Channel::Primary,
            &IssuedToken {
                link: "https://t.me/+abc".to_string(),
                expires_at: day(30),
            },
        )
        .expect("record token");
        drop(uow);

        let active = db.active_intervals(day(10)).expect("active");
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].member.id, id);
        assert!(db.active_intervals(day(30) + Duration::hours(1)).expect("active").is_empty());
    }

    #[test]
    fn claim_tick_succeeds_once_per_instant() {
        let db = Database::open_in_memory().expect("open db");
        assert!(db.claim_tick("activation", day(1)).expect("claim"));
        assert!(!db.claim_tick("activation", day(1)).expect("reclaim"));
        assert!(db.claim_tick("expiration", day(1)).expect("other job"));
        assert!(db.claim_tick("activation", day(2)).expect("next instant"));
        assert_eq!(db.last_tick("activation").expect("last"), Some(day(2)));
        assert_eq!(db.last_tick("merge").expect("last"), None);
    }

    #[test]
    fn claim_tick_is_shared_between_connections() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("club.db");
        let first = Database::open(&path).expect("open first");
        let second = Database::open(&path).expect("open second");

        assert!(first.claim_tick("merge", day(1)).expect("claim"));
        assert!(!second.claim_tick("merge", day(1)).expect("claim again"));
    }

    fn linked(db: &Database, phone: &str, messaging_id: i64) -> MemberId {
        let id = seed(db, phone, &[]);
        let mut uow = db.lock_member(id, StdDuration::ZERO).expect("lock member");
        let member = Member {
            messaging_id: Some(messaging_id),
            ..uow.member().clone()
        };
        uow.update_member(member);
        uow.commit().expect("commit");
        id
    }

    #[test]
    fn reviews_are_listed_with_their_author() {
        let db = Database::open_in_memory().expect("open db");
        let first = linked(&db, "+79991234567", 100);
        linked(&db, "+79990000000", 200);

        db.record_review(200, "More live streams please", day(3))
            .expect("record review");
        let recorded = db
            .record_review(100, "Great club", day(2))
            .expect("record review");

        assert_eq!(recorded.member.id, first);
        let reviews = db.reviews().expect("list reviews");
        let listed: Vec<_> = reviews
            .iter()
            .map(|review| (review.member.phone.as_str(), review.text.as_str()))
            .collect();
        assert_eq!(
            listed,
            vec![
                ("+79991234567", "Great club"),
                ("+79990000000", "More live streams please"),
            ]
        );
        assert_eq!(reviews[0].created_at, day(2));
    }

    #[test]
    fn review_from_unknown_sender_is_rejected() {
        let db = Database::open_in_memory().expect("open db");

        let err = db.record_review(404, "hello", day(1)).unwrap_err();

        assert!(matches!(err, DbError::MemberNotFound(_)));
        assert!(db.reviews().expect("list reviews").is_empty());
    }

    #[test]
    fn reviews_are_deleted_with_their_member() {
        let db = Database::open_in_memory().expect("open db");
        let id = linked(&db, "+79991234567", 100);
        db.record_review(100, "Great club", day(2))
            .expect("record review");

        let mut uow = db.lock_member(id, StdDuration::ZERO).expect("lock member");
        uow.delete_member();
        uow.commit().expect("commit");

        assert!(db.reviews().expect("list reviews").is_empty());
    }

    #[test]
    fn leaked_tokens_roundtrip() {
        let db = Database::open_in_memory().expect("open db");
        let leaked = LeakedToken {
            member_id: MemberId(3),
            interval_start: day(1),
            interval_end: day(30),
            channel: Channel::Secondary,
            link: "https://t.me/+leak".to_string(),
            error: "rate limited".to_string(),
            recorded_at: day(2),
        };
        db.record_leaked_token(&leaked).expect("record");

        assert_eq!(db.leaked_tokens().expect("list"), vec![leaked]);
    }
}
