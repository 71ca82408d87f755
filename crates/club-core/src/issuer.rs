//! Token issuance with bounded retry.
//!
//! Wraps the platform's invite-link primitive. Retryable failures wait a
//! backoff and try again up to [`IssuePolicy::max_attempts`] times:
//! - rate limits wait the flood backoff (or the platform's `retry_after`, if
//!   longer, up to [`MAX_FLOOD_MULTIPLIER`] times the flood backoff)
//! - other transient failures wait the default backoff, doubled after each attempt
//!
//! Rejections are returned immediately. The loop blocks the calling thread; it
//! never hands work to a background queue.

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::channel::{ChannelError, INVITE_MEMBER_LIMIT, MembershipChannel};
use crate::interval::{Channel, Interval, IssuedToken};

/// Blocks the current thread between attempts.
pub trait Sleeper {
    fn sleep(&self, duration: Duration);
}

/// [`Sleeper`] backed by [`std::thread::sleep`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Upper bound on a platform-requested wait, as a multiple of the flood backoff.
pub const MAX_FLOOD_MULTIPLIER: u32 = 10;

/// Retry bounds and backoffs for token issuance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IssuePolicy {
    pub max_attempts: u32,
    pub default_backoff: Duration,
    pub flood_backoff: Duration,
}

impl Default for IssuePolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            default_backoff: Duration::from_secs(3),
            flood_backoff: Duration::from_secs(40),
        }
    }
}

impl IssuePolicy {
    /// Wait before the attempt following `attempt` (1-based) failed with `error`.
    pub fn backoff_after(&self, attempt: u32, error: &ChannelError) -> Duration {
        match error {
            ChannelError::RateLimited { retry_after } => {
                let ceiling = self.flood_backoff.saturating_mul(MAX_FLOOD_MULTIPLIER);
                retry_after.map_or(self.flood_backoff, |wait| {
                    wait.clamp(self.flood_backoff, ceiling)
                })
            }
            _ => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                self.default_backoff.saturating_mul(factor)
            }
        }
    }
}

/// Token issuance failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IssueError {
    #[error("gave up issuing {channel} token after {attempts} attempts: {last}")]
    Exhausted {
        channel: Channel,
        attempts: u32,
        last: ChannelError,
    },
    #[error("{channel} token request was rejected: {source}")]
    Rejected {
        channel: Channel,
        #[source]
        source: ChannelError,
    },
}

/// Token revocation failure. Callers log it and carry on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed to revoke {channel} token {link}: {source}")]
pub struct RevokeError {
    pub channel: Channel,
    pub link: String,
    #[source]
    pub source: ChannelError,
}

/// Outcome of issuing a token for a specific interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Issuance {
    Issued(IssuedToken),
    /// The interval already holds a token for the channel; nothing was requested.
    AlreadyIssued,
}

/// Issues and revokes channel tokens.
pub struct TokenIssuer<'a, P, S> {
    platform: &'a P,
    sleeper: &'a S,
    policy: IssuePolicy,
}

impl<'a, P: MembershipChannel, S: Sleeper> TokenIssuer<'a, P, S> {
    pub const fn new(platform: &'a P, sleeper: &'a S, policy: IssuePolicy) -> Self {
        Self {
            platform,
            sleeper,
            policy,
        }
    }

    /// Requests a single-use token for `channel` expiring at `expires_at`.
    pub fn issue(
        &self,
        channel: Channel,
        expires_at: DateTime<Utc>,
    ) -> Result<IssuedToken, IssueError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let error = match self.platform.issue_invite_link(
                channel,
                expires_at,
                INVITE_MEMBER_LIMIT,
            ) {
                Ok(token) => {
                    tracing::debug!(%channel, attempt, "issued token");
                    return Ok(token);
                }
                Err(error) => error,
            };

            if !error.is_retryable() {
                tracing::error!(%channel, attempt, %error, "token request rejected");
                return Err(IssueError::Rejected {
                    channel,
                    source: error,
                });
            }
            if attempt >= max_attempts {
                tracing::error!(%channel, attempts = attempt, %error, "token issuance exhausted");
                return Err(IssueError::Exhausted {
                    channel,
                    attempts: attempt,
                    last: error,
                });
            }

            let wait = self.policy.backoff_after(attempt, &error);
            tracing::warn!(%channel, attempt, %error, wait_ms = wait.as_millis(), "token request failed, retrying");
            self.sleeper.sleep(wait);
        }
    }

    /// Issues a token for `interval` unless it already holds one for `channel`.
    ///
    /// The token expires with the interval. This check only avoids redundant
    /// platform calls; the store still enforces check-then-set when the token
    /// is persisted.
    pub fn issue_for(&self, interval: &Interval, channel: Channel) -> Result<Issuance, IssueError> {
        if interval.token(channel).is_some() {
            tracing::debug!(interval_id = %interval.id, %channel, "token already issued");
            return Ok(Issuance::AlreadyIssued);
        }
        self.issue(channel, interval.end).map(Issuance::Issued)
    }

    pub fn revoke(&self, channel: Channel, token: &IssuedToken) -> Result<(), RevokeError> {
        self.platform
            .revoke_invite_link(channel, &token.link)
            .map_err(|source| RevokeError {
                channel,
                link: token.link.clone(),
                source,
            })
    }
}
