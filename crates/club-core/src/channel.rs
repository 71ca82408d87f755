//! Contracts for the external messaging platform.
//!
//! The lifecycle core talks to the platform only through these traits, so
//! the same code drives the real bot client and the recording fakes used in
//! tests.

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::interval::{Channel, IssuedToken};

/// Invite links are always single-use.
pub const INVITE_MEMBER_LIMIT: u32 = 1;

/// Failure reported by a platform call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// The platform asked us to slow down.
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    /// Network trouble or a server-side error; worth retrying.
    #[error("transient failure: {0}")]
    Transient(String),
    /// The platform refused the request; retrying will not help.
    #[error("rejected: {0}")]
    Rejected(String),
}

impl ChannelError {
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::Rejected(_))
    }
}

/// A member's standing in a channel as reported by the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberStatus {
    Creator,
    Administrator,
    Member,
    Restricted,
    Left,
    Kicked,
    Other(String),
}

impl MemberStatus {
    pub fn from_platform(status: &str) -> Self {
        match status {
            "creator" => Self::Creator,
            "administrator" => Self::Administrator,
            "member" => Self::Member,
            "restricted" => Self::Restricted,
            "left" => Self::Left,
            "kicked" => Self::Kicked,
            other => Self::Other(other.to_string()),
        }
    }

    /// Returns true if the user can currently read the channel.
    pub const fn is_present(&self) -> bool {
        matches!(self, Self::Creator | Self::Administrator | Self::Member)
    }
}

/// Invite, revoke and kick primitives of the membership channels.
pub trait MembershipChannel {
    fn issue_invite_link(
        &self,
        channel: Channel,
        expires_at: DateTime<Utc>,
        member_limit: u32,
    ) -> Result<IssuedToken, ChannelError>;

    fn revoke_invite_link(&self, channel: Channel, link: &str) -> Result<(), ChannelError>;

    /// Removes the user from the channel while still allowing a later rejoin.
    fn remove_member(&self, channel: Channel, messaging_id: i64) -> Result<(), ChannelError>;

    fn member_status(
        &self,
        channel: Channel,
        messaging_id: i64,
    ) -> Result<MemberStatus, ChannelError>;
}

/// Outbound direct messages.
pub trait MessageDispatch {
    fn send_message(&self, recipient: i64, text: &str) -> Result<(), ChannelError>;
}
