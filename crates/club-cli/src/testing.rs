//! Recording fakes for the platform traits.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use club_core::{
    Channel, ChannelError, IssuedToken, MemberStatus, MembershipChannel, MessageDispatch, Sleeper,
};

use crate::reconcile::LifecycleSettings;

#[derive(Debug, Default)]
pub struct FakeState {
    pub issued: Vec<(Channel, IssuedToken)>,
    pub revoked: Vec<(Channel, String)>,
    pub removed: Vec<(Channel, i64)>,
    pub sent: Vec<(i64, String)>,
    pub status_lookups: Vec<(Channel, i64)>,
    pub issue_failures: HashMap<Channel, ChannelError>,
    pub revoke_failure: Option<ChannelError>,
    pub remove_failure: Option<ChannelError>,
    pub unreachable_recipients: HashSet<i64>,
    pub statuses: HashMap<i64, MemberStatus>,
    pub status_failure: Option<ChannelError>,
}

/// In-memory platform that records every call.
#[derive(Debug, Default)]
pub struct FakePlatform {
    state: Mutex<FakeState>,
}

impl FakePlatform {
    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().expect("fake platform state poisoned")
    }

    pub fn sent_to(&self, recipient: i64) -> Vec<String> {
        self.state()
            .sent
            .iter()
            .filter(|(to, _)| *to == recipient)
            .map(|(_, text)| text.clone())
            .collect()
    }
}

impl MembershipChannel for FakePlatform {
    fn issue_invite_link(
        &self,
        channel: Channel,
        expires_at: DateTime<Utc>,
        _member_limit: u32,
    ) -> Result<IssuedToken, ChannelError> {
        let mut state = self.state();
        if let Some(error) = state.issue_failures.get(&channel) {
            return Err(error.clone());
        }
        let token = IssuedToken {
            link: format!("https://t.me/+{channel}{}", state.issued.len() + 1),
            expires_at,
        };
        state.issued.push((channel, token.clone()));
        Ok(token)
    }

    fn revoke_invite_link(&self, channel: Channel, link: &str) -> Result<(), ChannelError> {
        let mut state = self.state();
        if let Some(error) = &state.revoke_failure {
            return Err(error.clone());
        }
        state.revoked.push((channel, link.to_string()));
        Ok(())
    }

    fn remove_member(&self, channel: Channel, messaging_id: i64) -> Result<(), ChannelError> {
        let mut state = self.state();
        if let Some(error) = &state.remove_failure {
            return Err(error.clone());
        }
        state.removed.push((channel, messaging_id));
        Ok(())
    }

    fn member_status(
        &self,
        channel: Channel,
        messaging_id: i64,
    ) -> Result<MemberStatus, ChannelError> {
        let mut state = self.state();
        state.status_lookups.push((channel, messaging_id));
        if let Some(error) = &state.status_failure {
            return Err(error.clone());
        }
        Ok(state
            .statuses
            .get(&messaging_id)
            .cloned()
            .unwrap_or(MemberStatus::Left))
    }
}

impl MessageDispatch for FakePlatform {
    fn send_message(&self, recipient: i64, text: &str) -> Result<(), ChannelError> {
        let mut state = self.state();
        if state.unreachable_recipients.contains(&recipient) {
            return Err(ChannelError::Rejected("bot was blocked by the user".to_string()));
        }
        state.sent.push((recipient, text.to_string()));
        Ok(())
    }
}

/// Sleeper that returns immediately.
#[derive(Debug, Default)]
pub struct NoSleep;

impl Sleeper for NoSleep {
    fn sleep(&self, _duration: Duration) {}
}

pub fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, min, 0)
        .single()
        .expect("valid test timestamp")
}

pub fn settings() -> LifecycleSettings {
    LifecycleSettings {
        lock_timeout: Duration::ZERO,
        ..LifecycleSettings::default()
    }
}
