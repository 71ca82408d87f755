//! Configuration loading and management.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;

use anyhow::{Context, anyhow};
use chrono::TimeDelta;
use chrono_tz::Tz;
use club_core::{IssuePolicy, RequiredTokens};
use club_telegram::{ChatIds, Client, DEFAULT_API_URL, TelegramBot};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use crate::notify::Messages;
use crate::reconcile::LifecycleSettings;
use crate::scheduler::ScheduleConfig;

/// Application configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to the database file.
    pub database_path: PathBuf,
    /// Bot API token. Never logged.
    pub bot_token: Option<String>,
    pub api_url: String,
    /// Chat id of the paid content channel.
    pub channel_id: Option<i64>,
    /// Chat id of the discussion chat. When set, members also need a chat token.
    pub chat_id: Option<i64>,
    /// IANA name of the club's time zone.
    pub timezone: String,
    /// Payment page appended to renewal messages.
    pub payment_url: Option<String>,
    pub lifecycle: LifecycleConfig,
    pub issue: IssueConfig,
    pub schedule: ScheduleConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    pub adjacency_window_hours: i64,
    pub activation_window_days: i64,
    pub lock_timeout_ms: u64,
    pub lease_ttl_secs: i64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            adjacency_window_hours: 24,
            activation_window_days: 31,
            lock_timeout_ms: 5000,
            lease_ttl_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueConfig {
    pub max_attempts: u32,
    pub default_backoff_ms: u64,
    pub flood_backoff_ms: u64,
}

impl Default for IssueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            default_backoff_ms: 3000,
            flood_backoff_ms: 40_000,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("database_path", &self.database_path)
            .field("bot_token", &self.bot_token.as_ref().map(|_| "[REDACTED]"))
            .field("api_url", &self.api_url)
            .field("channel_id", &self.channel_id)
            .field("chat_id", &self.chat_id)
            .field("timezone", &self.timezone)
            .field("payment_url", &self.payment_url)
            .field("lifecycle", &self.lifecycle)
            .field("issue", &self.issue)
            .field("schedule", &self.schedule)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs_data_path().unwrap_or_else(|| PathBuf::from("."));
        Self {
            database_path: data_dir.join("club.db"),
            bot_token: None,
            api_url: DEFAULT_API_URL.to_string(),
            channel_id: None,
            chat_id: None,
            timezone: "Europe/Moscow".to_string(),
            payment_url: None,
            lifecycle: LifecycleConfig::default(),
            issue: IssueConfig::default(),
            schedule: ScheduleConfig::default(),
        }
    }
}

impl Config {
    /// Loads configuration, optionally from a specific file.
    #[expect(
        clippy::result_large_err,
        reason = "figment::Error is large but only returned at startup"
    )]
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, figment::Error> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Some(config_dir) = dirs_config_path() {
            figment = figment.merge(Toml::file(config_dir.join("config.toml")));
        }

        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        // CLUB_LIFECYCLE__LOCK_TIMEOUT_MS sets lifecycle.lock_timeout_ms
        figment = figment.merge(Env::prefixed("CLUB_").split("__"));

        figment.extract()
    }

    pub fn timezone(&self) -> anyhow::Result<Tz> {
        self.timezone
            .parse()
            .map_err(|error| anyhow!("invalid timezone {}: {error}", self.timezone))
    }

    pub const fn required_tokens(&self) -> RequiredTokens {
        if self.chat_id.is_some() {
            RequiredTokens::PrimaryAndSecondary
        } else {
            RequiredTokens::PrimaryOnly
        }
    }

    pub fn lease_ttl(&self) -> anyhow::Result<TimeDelta> {
        config_span(
            "lifecycle.lease_ttl_secs",
            self.lifecycle.lease_ttl_secs,
            TimeDelta::try_seconds,
        )
    }

    pub fn settings(&self) -> anyhow::Result<LifecycleSettings> {
        Ok(LifecycleSettings {
            adjacency_window: config_span(
                "lifecycle.adjacency_window_hours",
                self.lifecycle.adjacency_window_hours,
                TimeDelta::try_hours,
            )?,
            activation_window: config_span(
                "lifecycle.activation_window_days",
                self.lifecycle.activation_window_days,
                TimeDelta::try_days,
            )?,
            lock_timeout: StdDuration::from_millis(self.lifecycle.lock_timeout_ms),
            issue_policy: IssuePolicy {
                max_attempts: self.issue.max_attempts,
                default_backoff: StdDuration::from_millis(self.issue.default_backoff_ms),
                flood_backoff: StdDuration::from_millis(self.issue.flood_backoff_ms),
            },
            required_tokens: self.required_tokens(),
            timezone: self.timezone()?,
            messages: Messages {
                payment_url: self.payment_url.clone(),
            },
        })
    }

    /// Builds the Telegram adapter from `bot_token` and the chat ids.
    pub fn telegram(&self) -> anyhow::Result<TelegramBot> {
        let token = self
            .bot_token
            .as_deref()
            .context("bot_token is not configured (set CLUB_BOT_TOKEN)")?;
        let primary = self
            .channel_id
            .context("channel_id is not configured (set CLUB_CHANNEL_ID)")?;
        let client = Client::new(token, self.api_url.as_str())
            .context("failed to build Telegram client")?;
        let chats = ChatIds {
            primary,
            secondary: self.chat_id,
        };
        TelegramBot::new(client, chats).context("failed to start Telegram adapter")
    }
}

/// Converts a configured count of units, rejecting negative or out-of-range values.
fn config_span(
    key: &str,
    value: i64,
    convert: fn(i64) -> Option<TimeDelta>,
) -> anyhow::Result<TimeDelta> {
    if value < 0 {
        anyhow::bail!("{key} must not be negative, got {value}");
    }
    convert(value).with_context(|| format!("{key} is out of range: {value}"))
}

/// Returns the platform-specific config directory for club.
fn dirs_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("club"))
}

/// Returns the platform-specific data directory for club.
///
/// On Linux: `~/.local/share/club`
pub fn dirs_data_path() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join("club"))
}
