//! Core domain logic for the club membership lifecycle.
//!
//! This crate contains the fundamental types and logic for:
//! - Intervals: members, paid windows and their derived lifecycle state
//! - Merging: collapsing overlapping or adjacent intervals
//! - Billing periods and calendar triggers in the club's time zone
//! - Token issuance: bounded-retry invite links over the platform traits

pub mod channel;
pub mod interval;
pub mod issuer;
pub mod merge;
pub mod period;
pub mod schedule;

pub use channel::{
    ChannelError, INVITE_MEMBER_LIMIT, MemberStatus, MembershipChannel, MessageDispatch,
};
pub use interval::{
    Channel, Interval, IntervalId, IssuedToken, LifecycleState, Member, MemberId,
    RequiredTokens, UnknownChannel, ValidationError, validate_bounds,
};
pub use issuer::{
    IssueError, IssuePolicy, Issuance, RevokeError, Sleeper, ThreadSleeper, TokenIssuer,
};
pub use merge::{DEFAULT_ADJACENCY_WINDOW, MergePlan, merge};
pub use period::{
    BillingPeriod, billing_period, last_day_bounds, local_day_bounds, local_month_start,
};
pub use schedule::{MonthDay, Trigger, TriggerParseError};
