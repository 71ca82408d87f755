//! Telegram Bot API integration for the club.
//!
//! Provides:
//! - [`Client`]: an async client for the handful of Bot API methods the club needs
//! - [`TelegramBot`]: a blocking adapter that implements the `club-core`
//!   platform traits on top of the client

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use club_core::{
    Channel, ChannelError, IssuedToken, MemberStatus, MembershipChannel, MessageDispatch,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default request timeout for API calls.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// Attempts at lifting the ban placed by `remove_member`.
const UNBAN_ATTEMPTS: u32 = 3;
const UNBAN_BACKOFF: Duration = Duration::from_secs(1);
pub const DEFAULT_API_URL: &str = "https://api.telegram.org";

/// Telegram client errors.
#[derive(Debug, Error)]
pub enum TelegramError {
    /// The provided bot token was invalid.
    #[error("invalid bot token: {reason}")]
    InvalidToken { reason: &'static str },
    /// Failed to build HTTP client.
    #[error("failed to build HTTP client: {0}")]
    ClientBuild(#[source] reqwest::Error),
    /// Failed to start the async runtime behind the blocking adapter.
    #[error("failed to start async runtime: {0}")]
    Runtime(#[source] std::io::Error),
    /// HTTP request failed.
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// The API asked the bot to slow down.
    #[error("rate limited: {description}")]
    RateLimited {
        retry_after: Option<Duration>,
        description: String,
    },
    /// The API reported a server-side failure.
    #[error("server error {status}: {description}")]
    Server { status: u16, description: String },
    /// The API refused the request.
    #[error("API error {status}: {description}")]
    Api { status: u16, description: String },
    /// Failed to parse response.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl From<TelegramError> for ChannelError {
    fn from(error: TelegramError) -> Self {
        match error {
            TelegramError::RateLimited { retry_after, .. } => Self::RateLimited { retry_after },
            TelegramError::Request(_)
            | TelegramError::Server { .. }
            | TelegramError::InvalidResponse(_) => Self::Transient(error.to_string()),
            TelegramError::Api { .. }
            | TelegramError::InvalidToken { .. }
            | TelegramError::ClientBuild(_)
            | TelegramError::Runtime(_) => Self::Rejected(error.to_string()),
        }
    }
}

/// Telegram Bot API client.
///
/// # Thread Safety
///
/// The client is safe to clone and share across threads. Each clone shares
/// the underlying HTTP connection pool.
#[derive(Clone)]
pub struct Client {
    http: reqwest::Client,
    api_url: String,
    token: String,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("api_url", &self.api_url)
            .field("token", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

/// An invite link as returned by `createChatInviteLink`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChatInviteLink {
    pub invite_link: String,
    #[serde(default)]
    pub expire_date: Option<i64>,
    #[serde(default)]
    pub member_limit: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChatMember {
    pub status: String,
}

#[derive(Debug, Serialize)]
struct CreateInviteLink {
    chat_id: i64,
    expire_date: i64,
    member_limit: u32,
}

#[derive(Debug, Serialize)]
struct RevokeInviteLink<'a> {
    chat_id: i64,
    invite_link: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatUser {
    chat_id: i64,
    user_id: i64,
}

#[derive(Debug, Serialize)]
struct UnbanChatMember {
    chat_id: i64,
    user_id: i64,
    only_if_banned: bool,
}

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: i64,
    text: &'a str,
    disable_web_page_preview: bool,
}

impl Client {
    /// Creates a new client for the given bot token.
    ///
    /// # Errors
    ///
    /// Returns an error if the token is empty or whitespace-only, or if the
    /// HTTP client fails to build.
    pub fn new(token: impl Into<String>, api_url: impl Into<String>) -> Result<Self, TelegramError> {
        let token = token.into();
        if token.is_empty() {
            return Err(TelegramError::InvalidToken {
                reason: "bot token cannot be empty",
            });
        }
        if token.trim().is_empty() {
            return Err(TelegramError::InvalidToken {
                reason: "bot token cannot be whitespace-only",
            });
        }

        let http = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(TelegramError::ClientBuild)?;

        Ok(Self {
            http,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    pub async fn create_chat_invite_link(
        &self,
        chat_id: i64,
        expires_at: DateTime<Utc>,
        member_limit: u32,
    ) -> Result<ChatInviteLink, TelegramError> {
        self.call(
            "createChatInviteLink",
            &CreateInviteLink {
                chat_id,
                expire_date: expires_at.timestamp(),
                member_limit,
            },
        )
        .await
    }

    pub async fn revoke_chat_invite_link(
        &self,
        chat_id: i64,
        invite_link: &str,
    ) -> Result<ChatInviteLink, TelegramError> {
        self.call(
            "revokeChatInviteLink",
            &RevokeInviteLink {
                chat_id,
                invite_link,
            },
        )
        .await
    }

    pub async fn ban_chat_member(&self, chat_id: i64, user_id: i64) -> Result<bool, TelegramError> {
        self.call("banChatMember", &ChatUser { chat_id, user_id })
            .await
    }

    /// Lifts a ban. With `only_if_banned` a current member is left untouched.
    pub async fn unban_chat_member(
        &self,
        chat_id: i64,
        user_id: i64,
        only_if_banned: bool,
    ) -> Result<bool, TelegramError> {
        self.call(
            "unbanChatMember",
            &UnbanChatMember {
                chat_id,
                user_id,
                only_if_banned,
            },
        )
        .await
    }

    pub async fn get_chat_member(
        &self,
        chat_id: i64,
        user_id: i64,
    ) -> Result<ChatMember, TelegramError> {
        self.call("getChatMember", &ChatUser { chat_id, user_id })
            .await
    }

    pub async fn send_message(&self, chat_id: i64, text: &str) -> Result<(), TelegramError> {
        let _: serde_json::Value = self
            .call(
                "sendMessage",
                &SendMessage {
                    chat_id,
                    text,
                    disable_web_page_preview: true,
                },
            )
            .await?;
        Ok(())
    }

    async fn call<P, R>(&self, method: &str, params: &P) -> Result<R, TelegramError>
    where
        P: Serialize + Sync,
        R: DeserializeOwned,
    {
        let url = format!("{}/bot{}/{method}", self.api_url, self.token);
        // The URL embeds the bot token; keep it out of error messages.
        let response = self
            .http
            .post(&url)
            .json(params)
            .send()
            .await
            .map_err(reqwest::Error::without_url)?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(reqwest::Error::without_url)?;
        let result = parse_response(status, &body);
        if let Err(error) = &result {
            tracing::debug!(method, status, %error, "bot API call failed");
        }
        result
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse<R> {
    ok: bool,
    result: Option<R>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    #[serde(default)]
    retry_after: Option<u64>,
}

/// Decodes a Bot API response body.
///
/// Flood-control refusals are reported as [`TelegramError::RateLimited`]
/// whether they arrive as HTTP 429 or only in the description.
fn parse_response<R: DeserializeOwned>(status: u16, body: &str) -> Result<R, TelegramError> {
    let payload: ApiResponse<R> = match serde_json::from_str(body) {
        Ok(payload) => payload,
        Err(err) if status >= 500 => {
            return Err(TelegramError::Server {
                status,
                description: truncate(body, err.to_string()),
            });
        }
        Err(err) => return Err(TelegramError::InvalidResponse(err.to_string())),
    };

    if payload.ok {
        return payload
            .result
            .ok_or_else(|| TelegramError::InvalidResponse("missing result".to_string()));
    }

    let description = payload
        .description
        .unwrap_or_else(|| format!("status {status}"));
    let retry_after = payload
        .parameters
        .and_then(|parameters| parameters.retry_after)
        .map(Duration::from_secs);
    if status == 429 || retry_after.is_some() || description.contains("Flood control exceeded") {
        return Err(TelegramError::RateLimited {
            retry_after,
            description,
        });
    }
    if status >= 500 {
        return Err(TelegramError::Server {
            status,
            description,
        });
    }
    Err(TelegramError::Api {
        status,
        description,
    })
}

fn truncate(body: &str, fallback: String) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return fallback;
    }
    trimmed.chars().take(200).collect()
}

/// Chat ids backing the club's channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChatIds {
    pub primary: i64,
    pub secondary: Option<i64>,
}

/// Blocking adapter over [`Client`].
///
/// Owns a small multi-thread runtime; every trait call is a `block_on`, so one
/// instance can be shared (`Arc`) by all job threads.
pub struct TelegramBot {
    runtime: tokio::runtime::Runtime,
    client: Client,
    chats: ChatIds,
    unban_attempts: u32,
    unban_backoff: Duration,
}

impl fmt::Debug for TelegramBot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelegramBot")
            .field("client", &self.client)
            .field("chats", &self.chats)
            .finish_non_exhaustive()
    }
}

impl TelegramBot {
    pub fn new(client: Client, chats: ChatIds) -> Result<Self, TelegramError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .map_err(TelegramError::Runtime)?;
        Ok(Self {
            runtime,
            client,
            chats,
            unban_attempts: UNBAN_ATTEMPTS,
            unban_backoff: UNBAN_BACKOFF,
        })
    }

    /// Sets how often a failed unban is retried and the initial wait between tries.
    #[must_use]
    pub fn with_unban_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.unban_attempts = attempts.max(1);
        self.unban_backoff = backoff;
        self
    }

    /// Lifts the ban placed by `remove_member`, retrying with doubling waits.
    async fn unban(&self, chat_id: i64, user_id: i64) -> Result<(), TelegramError> {
        let mut backoff = self.unban_backoff;
        let mut attempt = 1;
        loop {
            match self.client.unban_chat_member(chat_id, user_id, true).await {
                Ok(_) => return Ok(()),
                Err(error) if attempt >= self.unban_attempts => return Err(error),
                Err(error) => {
                    tracing::warn!(chat_id, user_id, attempt, %error, "unban failed, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                    attempt += 1;
                }
            }
        }
    }

    fn chat_id(&self, channel: Channel) -> Result<i64, ChannelError> {
        match channel {
            Channel::Primary => Ok(self.chats.primary),
            Channel::Secondary => self
                .chats
                .secondary
                .ok_or_else(|| ChannelError::Rejected("secondary chat is not configured".to_string())),
        }
    }
}

impl MembershipChannel for TelegramBot {
    fn issue_invite_link(
        &self,
        channel: Channel,
        expires_at: DateTime<Utc>,
        member_limit: u32,
    ) -> Result<IssuedToken, ChannelError> {
        let chat_id = self.chat_id(channel)?;
        let link = self.runtime.block_on(self.client.create_chat_invite_link(
            chat_id,
            expires_at,
            member_limit,
        ))?;
        let expires_at = link
            .expire_date
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .unwrap_or(expires_at);
        Ok(IssuedToken {
            link: link.invite_link,
            expires_at,
        })
    }

    fn revoke_invite_link(&self, channel: Channel, link: &str) -> Result<(), ChannelError> {
        let chat_id = self.chat_id(channel)?;
        self.runtime
            .block_on(self.client.revoke_chat_invite_link(chat_id, link))?;
        Ok(())
    }

    /// Ban followed by unban-if-banned: the user is removed but may rejoin later.
    ///
    /// If the unban still fails after its retries the user stays banned and the
    /// error says so.
    fn remove_member(&self, channel: Channel, messaging_id: i64) -> Result<(), ChannelError> {
        let chat_id = self.chat_id(channel)?;
        self.runtime
            .block_on(self.client.ban_chat_member(chat_id, messaging_id))?;
        self.runtime
            .block_on(self.unban(chat_id, messaging_id))
            .map_err(|error| {
                tracing::error!(chat_id, user_id = messaging_id, %error, "user left banned");
                ChannelError::Transient(format!(
                    "user {messaging_id} is still banned from chat {chat_id}: {error}"
                ))
            })
    }

    fn member_status(
        &self,
        channel: Channel,
        messaging_id: i64,
    ) -> Result<MemberStatus, ChannelError> {
        let chat_id = self.chat_id(channel)?;
        let member = self
            .runtime
            .block_on(self.client.get_chat_member(chat_id, messaging_id))?;
        Ok(MemberStatus::from_platform(&member.status))
    }
}

impl MessageDispatch for TelegramBot {
    fn send_message(&self, recipient: i64, text: &str) -> Result<(), ChannelError> {
        self.runtime
            .block_on(self.client.send_message(recipient, text))?;
        Ok(())
    }
}
