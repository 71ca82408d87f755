//! Outbound message texts and delivery bookkeeping.

use club_core::{Channel, IssuedToken, Member, MessageDispatch};

use crate::reconcile::TickReport;

pub const RENEWAL_CONFIRMED: &str = "A new subscription period starts today and yours has been extended. \
     Nothing else to do: posts keep arriving in the same channel.";

pub const ACTIVATION_REMINDER: &str = "Your subscription is paid but you have not joined the channel yet. \
     Open the invite link from my previous message so you don't miss the first post.";

pub const FEEDBACK_REQUEST: &str = "We work on the club every day and would love your feedback. \
     Reply to this message with your thoughts, all in one message.";

const RENEWAL_REMINDER: &str = "A new month starts soon, and with it a new subscription period. \
     Content stays available only for the paid period; when the subscription ends \
     you will be removed from the channel automatically.";

const FINAL_RENEWAL: &str = "Today is the last day of your subscription. Renew it to keep your access.";

const WIN_BACK: &str = "You used to be a member of the club. If you were just taking a break, \
     you are welcome back any time.";

/// Invitation carrying one single-use link per channel.
pub fn invitation(tokens: &[(Channel, &IssuedToken)]) -> String {
    let links: String = tokens
        .iter()
        .map(|(channel, token)| {
            let label = match channel {
                Channel::Primary => "Channel",
                Channel::Secondary => "Chat",
            };
            format!("\n{label}: {}", token.link)
        })
        .collect();
    format!(
        "Welcome to the club!\n\nYour personal invite links are below. Each link works once and only for you:\n\
         {links}\n\nThe links expire when your paid period ends."
    )
}

/// Renewal texts, which point at the payment page when one is configured.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Messages {
    pub payment_url: Option<String>,
}

impl Messages {
    pub fn renewal_reminder(&self) -> String {
        self.with_payment_link(RENEWAL_REMINDER)
    }

    pub fn final_renewal(&self) -> String {
        self.with_payment_link(FINAL_RENEWAL)
    }

    pub fn win_back(&self) -> String {
        self.with_payment_link(WIN_BACK)
    }

    fn with_payment_link(&self, text: &str) -> String {
        match &self.payment_url {
            Some(url) => format!("{text}\n\n{url}"),
            None => text.to_string(),
        }
    }
}

/// Sends `text` to the member, counting the outcome in `report`.
///
/// Delivery failures are logged and never propagated.
pub fn deliver<D: MessageDispatch>(
    dispatch: &D,
    member: &Member,
    text: &str,
    report: &mut TickReport,
) -> bool {
    let Some(recipient) = member.messaging_id else {
        tracing::warn!(member_id = %member.id, phone = %member.phone, "member has no messaging id");
        report.unreachable += 1;
        return false;
    };
    match dispatch.send_message(recipient, text) {
        Ok(()) => {
            report.messages_sent += 1;
            true
        }
        Err(error) => {
            tracing::warn!(member_id = %member.id, phone = %member.phone, %error, "message delivery failed");
            report.messages_failed += 1;
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn invitation_lists_every_link() {
        let expires_at = Utc
            .with_ymd_and_hms(2024, 9, 30, 20, 59, 0)
            .single()
            .expect("valid test timestamp");
        let primary = IssuedToken {
            link: "https://t.me/+primary".to_string(),
            expires_at,
        };
        let secondary = IssuedToken {
            link: "https://t.me/+chat".to_string(),
            expires_at,
        };
        let text = invitation(&[
            (Channel::Primary, &primary),
            (Channel::Secondary, &secondary),
        ]);
        insta::assert_snapshot!(text, @r"
        Welcome to the club!

        Your personal invite links are below. Each link works once and only for you:

        Channel: https://t.me/+primary
        Chat: https://t.me/+chat

        The links expire when your paid period ends.
        ");
    }

    #[test]
    fn payment_link_is_appended_when_configured() {
        let messages = Messages {
            payment_url: Some("https://club.example/pay".to_string()),
        };
        assert!(messages.final_renewal().ends_with("\n\nhttps://club.example/pay"));
        assert!(!Messages::default().final_renewal().contains("https://"));
    }
}
