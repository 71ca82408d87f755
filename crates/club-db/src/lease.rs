//! Member leases and the unit of work built on them.

use std::time::{Duration as StdDuration, Instant};

use chrono::{DateTime, Utc};
use club_core::{Channel, Interval, IntervalId, IssuedToken, Member, MemberId, validate_bounds};
use rusqlite::params;

use crate::{Database, DbError, format_timestamp, token_columns, unique_violation};

/// Pause between lease acquisition attempts.
const LOCK_POLL_INTERVAL: StdDuration = StdDuration::from_millis(25);

/// A held member lease. Released on drop.
struct Lease<'a> {
    db: &'a Database,
    member_id: MemberId,
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        let released = self.db.conn.execute(
            "DELETE FROM member_leases WHERE member_id = ?1 AND owner = ?2",
            params![self.member_id.0, self.db.owner],
        );
        match released {
            Ok(0) => tracing::warn!(member_id = %self.member_id, "member lease was taken over before release"),
            Ok(_) => tracing::trace!(member_id = %self.member_id, "released member lease"),
            Err(error) => tracing::error!(member_id = %self.member_id, %error, "failed to release member lease"),
        }
    }
}

/// A change staged inside a [`MemberUnitOfWork`].
#[derive(Debug)]
enum Staged {
    Save(Interval),
    Delete { id: IntervalId, version: i64 },
    Append { start: DateTime<Utc>, end: DateTime<Utc> },
    UpdateMember(Member),
    DeleteMember,
}

/// Exclusive, transactional access to one member's intervals.
///
/// Obtained from [`Database::lock_member`]. Writes are staged and applied in a
/// single transaction by [`commit`](Self::commit); dropping the unit of work
/// without committing discards them. The member lease is released on every
/// exit path.
///
/// [`record_token`](Self::record_token) is the exception: it writes through
/// immediately, so an issued capability is persisted even if the rest of the
/// unit of work is later abandoned.
pub struct MemberUnitOfWork<'a> {
    lease: Lease<'a>,
    member: Member,
    intervals: Vec<Interval>,
    staged: Vec<Staged>,
}

impl Database {
    /// Takes the member's lease and loads its intervals, ordered by `(start, id)`.
    ///
    /// Polls until `timeout` elapses. A zero timeout makes exactly one attempt.
    pub fn lock_member(
        &self,
        member_id: MemberId,
        timeout: StdDuration,
    ) -> Result<MemberUnitOfWork<'_>, DbError> {
        let started = Instant::now();
        loop {
            if self.try_acquire_lease(member_id)? {
                break;
            }
            let waited = started.elapsed();
            if waited >= timeout {
                tracing::warn!(member_id = %member_id, ?waited, "member lock timed out");
                return Err(DbError::LockTimeout { member_id, waited });
            }
            std::thread::sleep(LOCK_POLL_INTERVAL.min(timeout - waited));
        }
        let lease = Lease {
            db: self,
            member_id,
        };
        tracing::trace!(member_id = %member_id, owner = %self.owner, "acquired member lease");

        let member = self
            .find_member(member_id)?
            .ok_or_else(|| DbError::MemberNotFound(member_id.to_string()))?;
        let intervals = self.intervals_for(member_id)?;
        Ok(MemberUnitOfWork {
            lease,
            member,
            intervals,
            staged: Vec::new(),
        })
    }

    /// Looks the member up by phone, then locks it.
    pub fn lock_member_by_phone(
        &self,
        phone: &str,
        timeout: StdDuration,
    ) -> Result<MemberUnitOfWork<'_>, DbError> {
        let member = self
            .find_member_by_phone(phone)?
            .ok_or_else(|| DbError::MemberNotFound(phone.to_string()))?;
        self.lock_member(member.id, timeout)
    }

    fn try_acquire_lease(&self, member_id: MemberId) -> Result<bool, DbError> {
        let now = Utc::now();
        let acquired = self.conn.execute(
            "
            INSERT INTO member_leases (member_id, owner, expires_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(member_id) DO UPDATE SET
                owner = excluded.owner,
                expires_at = excluded.expires_at
            WHERE member_leases.expires_at < ?4
            ",
            params![
                member_id.0,
                self.owner,
                format_timestamp(now + self.lease_ttl),
                format_timestamp(now),
            ],
        )?;
        Ok(acquired > 0)
    }
}

impl MemberUnitOfWork<'_> {
    pub const fn member(&self) -> &Member {
        &self.member
    }

    /// The member's intervals, ordered by `(start, id)`, with staged saves and
    /// deletes applied. Staged appends appear only after commit.
    pub fn intervals(&self) -> &[Interval] {
        &self.intervals
    }

    /// Stages an update of the interval's bounds and tokens.
    ///
    /// Fails at commit with [`DbError::Conflict`] if the stored version moved.
    pub fn save(&mut self, interval: &Interval) -> Result<(), DbError> {
        validate_bounds(interval.start, interval.end)?;
        if let Some(slot) = self.intervals.iter_mut().find(|i| i.id == interval.id) {
            *slot = interval.clone();
        }
        self.sort_intervals();
        self.staged.push(Staged::Save(interval.clone()));
        Ok(())
    }

    /// Stages removal of the interval record.
    pub fn delete(&mut self, interval: &Interval) {
        self.intervals.retain(|i| i.id != interval.id);
        self.staged.push(Staged::Delete {
            id: interval.id,
            version: interval.version,
        });
    }

    /// Stages a new tokenless interval.
    pub fn append(&mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<(), DbError> {
        validate_bounds(start, end)?;
        self.staged.push(Staged::Append { start, end });
        Ok(())
    }

    /// Stages new member fields (phone, messaging id, profile link).
    pub fn update_member(&mut self, member: Member) {
        self.member = member.clone();
        self.staged.push(Staged::UpdateMember(member));
    }

    /// Stages deletion of the member and, by cascade, its intervals.
    pub fn delete_member(&mut self) {
        self.intervals.clear();
        self.staged.push(Staged::DeleteMember);
    }

    /// Persists a freshly issued token immediately.
    ///
    /// The write only succeeds while the channel's token column is still empty.
    /// If another writer got there first the call fails with
    /// [`DbError::Conflict`] and the caller owns the unreferenced token.
    pub fn record_token(
        &mut self,
        interval_id: IntervalId,
        channel: Channel,
        token: &IssuedToken,
    ) -> Result<Interval, DbError> {
        let (link_column, expires_column) = token_columns(channel);
        let sql = format!(
            "
            UPDATE intervals
            SET {link_column} = ?1, {expires_column} = ?2, version = version + 1
            WHERE id = ?3 AND member_id = ?4 AND {link_column} IS NULL
            "
        );
        let db = self.lease.db;
        let updated = db.conn.execute(
            &sql,
            params![
                token.link,
                format_timestamp(token.expires_at),
                interval_id.0,
                self.member.id.0,
            ],
        )?;
        if updated == 0 {
            return Err(DbError::Conflict { interval_id });
        }
        let stored = db
            .find_interval(interval_id)?
            .ok_or(DbError::Conflict { interval_id })?;
        if let Some(slot) = self.intervals.iter_mut().find(|i| i.id == interval_id) {
            *slot = stored.clone();
        }
        tracing::debug!(member_id = %self.member.id, interval_id = %interval_id, %channel, "recorded token");
        Ok(stored)
    }

    /// Returns true if nothing is staged.
    pub fn is_clean(&self) -> bool {
        self.staged.is_empty()
    }

    /// Applies every staged change in one transaction, then releases the lease.
    ///
    /// Returns the ids of appended intervals.
    pub fn commit(mut self) -> Result<Vec<IntervalId>, DbError> {
        let staged = std::mem::take(&mut self.staged);
        if staged.is_empty() {
            return Ok(Vec::new());
        }
        let db = self.lease.db;
        let member_id = self.member.id;
        let now = format_timestamp(Utc::now());
        let tx = db.conn.unchecked_transaction()?;
        // First write of the transaction; SQLite's write lock is held from here on.
        let held = tx.execute(
            "UPDATE member_leases SET expires_at = ?3 WHERE member_id = ?1 AND owner = ?2",
            params![
                member_id.0,
                db.owner,
                format_timestamp(Utc::now() + db.lease_ttl)
            ],
        )?;
        if held == 0 {
            tracing::warn!(member_id = %member_id, "member lease lost before commit");
            return Err(DbError::LeaseLost { member_id });
        }
        let mut appended = Vec::new();
        for change in staged {
            match change {
                Staged::Save(interval) => {
                    let token = |channel| {
                        interval.token(channel).map(|token: &IssuedToken| {
                            (token.link.clone(), format_timestamp(token.expires_at))
                        })
                    };
                    let (access, access_expires) = token(Channel::Primary).unzip();
                    let (secondary, secondary_expires) = token(Channel::Secondary).unzip();
                    let updated = tx.execute(
                        "
                        UPDATE intervals
                        SET start_at = ?1, end_at = ?2,
                            access_token = ?3, access_expires_at = ?4,
                            secondary_token = ?5, secondary_expires_at = ?6,
                            version = version + 1
                        WHERE id = ?7 AND member_id = ?8 AND version = ?9
                        ",
                        params![
                            format_timestamp(interval.start),
                            format_timestamp(interval.end),
                            access,
                            access_expires,
                            secondary,
                            secondary_expires,
                            interval.id.0,
                            member_id.0,
                            interval.version,
                        ],
                    )?;
                    if updated == 0 {
                        return Err(DbError::Conflict {
                            interval_id: interval.id,
                        });
                    }
                }
                Staged::Delete { id, version } => {
                    let deleted = tx.execute(
                        "DELETE FROM intervals WHERE id = ?1 AND member_id = ?2 AND version = ?3",
                        params![id.0, member_id.0, version],
                    )?;
                    if deleted == 0 {
                        return Err(DbError::Conflict { interval_id: id });
                    }
                }
                Staged::Append { start, end } => {
                    tx.execute(
                        "
                        INSERT INTO intervals (member_id, start_at, end_at, created_at)
                        VALUES (?1, ?2, ?3, ?4)
                        ",
                        params![
                            member_id.0,
                            format_timestamp(start),
                            format_timestamp(end),
                            now,
                        ],
                    )?;
                    appended.push(IntervalId(tx.last_insert_rowid()));
                }
                Staged::UpdateMember(member) => {
                    tx.execute(
                        "UPDATE members SET phone = ?1, messaging_id = ?2, profile_link = ?3 WHERE id = ?4",
                        params![member.phone, member.messaging_id, member.profile_link, member_id.0],
                    )
                    .map_err(|error| {
                        let value = member
                            .messaging_id
                            .map_or_else(|| member.phone.clone(), |id| format!("{} / {id}", member.phone));
                        unique_violation(error, "phone or messaging id", value)
                    })?;
                }
                Staged::DeleteMember => {
                    tx.execute("DELETE FROM members WHERE id = ?1", [member_id.0])?;
                }
            }
        }
        tx.commit()?;
        tracing::debug!(member_id = %member_id, appended = appended.len(), "committed unit of work");
        Ok(appended)
    }

    fn sort_intervals(&mut self) {
        self.intervals
            .sort_by_key(|interval| (interval.start, interval.id));
    }
}
