//! Members, subscription intervals and the lifecycle state derived from them.
//!
//! The lifecycle state of an interval is never stored. It is computed from
//! `(now, start, end, tokens)` every time it is needed, so there is no stored
//! field that could drift from the timestamps.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Store-assigned member identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemberId(pub i64);

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Store-assigned interval identifier. Ordering follows creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IntervalId(pub i64);

impl fmt::Display for IntervalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A paying member of the club.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: MemberId,
    /// Stable contact key in E.164 form (e.g. `+79991234567`).
    pub phone: String,
    /// Messaging-platform user id, assigned on first contact.
    pub messaging_id: Option<i64>,
    /// Public profile link (e.g. `https://t.me/someone`).
    pub profile_link: Option<String>,
}

/// The external channels a member is granted access to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Channel {
    /// The paid content channel.
    Primary,
    /// The auxiliary discussion chat.
    Secondary,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Channel {
    type Err = UnknownChannel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "primary" => Ok(Self::Primary),
            "secondary" => Ok(Self::Secondary),
            _ => Err(UnknownChannel(s.to_string())),
        }
    }
}

/// Error type for unknown channel strings.
#[derive(Debug, Clone, Error)]
#[error("unknown channel: {0}")]
pub struct UnknownChannel(String);

/// Which tokens an interval must hold to count as active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequiredTokens {
    #[default]
    PrimaryOnly,
    PrimaryAndSecondary,
}

impl RequiredTokens {
    pub const fn channels(self) -> &'static [Channel] {
        match self {
            Self::PrimaryOnly => &[Channel::Primary],
            Self::PrimaryAndSecondary => &[Channel::Primary, Channel::Secondary],
        }
    }
}

/// An external access capability (invite link) issued for one interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedToken {
    pub link: String,
    pub expires_at: DateTime<Utc>,
}

/// Lifecycle state derived from an interval's bounds and tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// `now < start`.
    Future,
    /// Inside the bounds but not every required token has been issued.
    Activatable,
    /// Inside the bounds with every required token issued.
    Active,
    /// `now > end`.
    Expired,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Future => "future",
            Self::Activatable => "activatable",
            Self::Active => "active",
            Self::Expired => "expired",
        };
        write!(f, "{s}")
    }
}

/// A member's paid entitlement window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    pub id: IntervalId,
    pub member_id: MemberId,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub access_token: Option<IssuedToken>,
    pub secondary_token: Option<IssuedToken>,
    /// Optimistic-concurrency version, bumped on every persisted write.
    pub version: i64,
}

impl Interval {
    pub const fn token(&self, channel: Channel) -> Option<&IssuedToken> {
        match channel {
            Channel::Primary => self.access_token.as_ref(),
            Channel::Secondary => self.secondary_token.as_ref(),
        }
    }

    pub fn set_token(&mut self, channel: Channel, token: IssuedToken) {
        match channel {
            Channel::Primary => self.access_token = Some(token),
            Channel::Secondary => self.secondary_token = Some(token),
        }
    }

    /// Returns every token currently held, primary first.
    pub fn tokens(&self) -> Vec<(Channel, &IssuedToken)> {
        [Channel::Primary, Channel::Secondary]
            .into_iter()
            .filter_map(|channel| self.token(channel).map(|token| (channel, token)))
            .collect()
    }

    pub const fn holds_tokens(&self) -> bool {
        self.access_token.is_some() || self.secondary_token.is_some()
    }

    /// Channels in `required` for which no token has been issued yet.
    pub fn missing_tokens(&self, required: RequiredTokens) -> Vec<Channel> {
        required
            .channels()
            .iter()
            .copied()
            .filter(|channel| self.token(*channel).is_none())
            .collect()
    }

    /// Returns true if `now` lies within `[start, end]`.
    pub fn covers(&self, now: DateTime<Utc>) -> bool {
        self.start <= now && now <= self.end
    }

    pub fn state_at(&self, now: DateTime<Utc>, required: RequiredTokens) -> LifecycleState {
        if now < self.start {
            LifecycleState::Future
        } else if now > self.end {
            LifecycleState::Expired
        } else if self.missing_tokens(required).is_empty() {
            LifecycleState::Active
        } else {
            LifecycleState::Activatable
        }
    }
}

/// Rejected input that must never reach the store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("interval start {start} is after its end {end}")]
    InvertedBounds {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    #[error("paid months must be at least 1, got {0}")]
    NonPositiveMonths(i64),
    #[error("month must be between 1 and 12, got {0}")]
    InvalidMonth(u32),
    #[error("{year}-{month:02}-{day:02} {hour:02}:{minute:02} does not exist in the configured time zone")]
    NonexistentLocalTime {
        year: i32,
        month: u32,
        day: u32,
        hour: u32,
        minute: u32,
    },
}

/// Checks the `start <= end` invariant.
pub fn validate_bounds(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<(), ValidationError> {
    if start > end {
        return Err(ValidationError::InvertedBounds { start, end });
    }
    Ok(())
}
