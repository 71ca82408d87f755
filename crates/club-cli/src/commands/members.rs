//! Member listing.

use std::io::Write;

use anyhow::Result;
use chrono::{DateTime, Utc};
use club_core::{Channel, LifecycleState, RequiredTokens};
use club_db::{Database, MemberRecord};
use serde::Serialize;

use super::util::local;
use crate::reconcile::LifecycleSettings;

#[derive(Debug, Serialize)]
struct JsonMember<'a> {
    id: i64,
    phone: &'a str,
    messaging_id: Option<i64>,
    profile_link: Option<&'a str>,
    intervals: Vec<JsonInterval>,
}

#[derive(Debug, Serialize)]
struct JsonInterval {
    id: i64,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    state: LifecycleState,
    tokens: Vec<String>,
}

pub fn format_members_json(
    records: &[MemberRecord],
    now: DateTime<Utc>,
    required: RequiredTokens,
) -> Result<String> {
    let members: Vec<JsonMember<'_>> = records
        .iter()
        .map(|record| JsonMember {
            id: record.member.id.0,
            phone: &record.member.phone,
            messaging_id: record.member.messaging_id,
            profile_link: record.member.profile_link.as_deref(),
            intervals: record
                .intervals
                .iter()
                .map(|interval| JsonInterval {
                    id: interval.id.0,
                    start: interval.start,
                    end: interval.end,
                    state: interval.state_at(now, required),
                    tokens: channel_names(&interval.tokens()),
                })
                .collect(),
        })
        .collect();
    Ok(serde_json::to_string_pretty(&members)?)
}

pub fn format_members_text(
    records: &[MemberRecord],
    now: DateTime<Utc>,
    settings: &LifecycleSettings,
) -> String {
    if records.is_empty() {
        return "No members.\n".to_string();
    }
    let tz = settings.timezone;
    let mut out = String::new();
    for record in records {
        let member = &record.member;
        let telegram = member
            .messaging_id
            .map_or_else(|| "not linked".to_string(), |id| format!("tg {id}"));
        let header = match &member.profile_link {
            Some(link) => format!("{} ({telegram}, {link})\n", member.phone),
            None => format!("{} ({telegram})\n", member.phone),
        };
        out.push_str(&header);
        if record.intervals.is_empty() {
            out.push_str("  no subscriptions\n");
        }
        for interval in &record.intervals {
            let state = interval.state_at(now, settings.required_tokens);
            let tokens = channel_names(&interval.tokens());
            out.push_str(&format!(
                "  {} - {}  {state}",
                local(interval.start, tz),
                local(interval.end, tz)
            ));
            if !tokens.is_empty() {
                out.push_str(&format!("  [{}]", tokens.join(", ")));
            }
            out.push('\n');
        }
    }
    out
}

fn channel_names<T>(tokens: &[(Channel, T)]) -> Vec<String> {
    tokens.iter().map(|(channel, _)| channel.to_string()).collect()
}

pub fn run<W: Write>(
    writer: &mut W,
    db: &Database,
    settings: &LifecycleSettings,
    now: DateTime<Utc>,
    json: bool,
) -> Result<()> {
    let records = db.list_members()?;
    if json {
        writeln!(
            writer,
            "{}",
            format_members_json(&records, now, settings.required_tokens)?
        )?;
    } else {
        write!(writer, "{}", format_members_text(&records, now, settings))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::{Payment, append_interval, link_member};
    use crate::testing::{settings, utc};
    use club_core::IssuedToken;
    use std::time::Duration;

    fn seeded() -> Database {
        let db = Database::open_in_memory().expect("open db");
        let settings = settings();
        append_interval(
            &db,
            &settings,
            &Payment {
                phone: "+79991234567".to_string(),
                paid_months: 1,
                start_month: 9,
                start_year: 2024,
                username: Some("someone".to_string()),
            },
        )
        .expect("append interval");
        link_member(&db, &settings, "+79991234567", 100, None).expect("link");
        db.find_or_create_member("+79990000000").expect("create member");

        let mut uow = db
            .lock_member_by_phone("+79991234567", Duration::ZERO)
            .expect("lock member");
        let interval = uow.intervals()[0].clone();
        let token = IssuedToken {
            link: "https://t.me/+abc".to_string(),
            expires_at: interval.end,
        };
        uow.record_token(interval.id, Channel::Primary, &token)
            .expect("record token");
        drop(uow);
        db
    }

    #[test]
    fn text_listing_shows_local_bounds_and_state() {
        let db = seeded();
        let records = db.list_members().expect("list members");

        let output = format_members_text(&records, utc(2024, 9, 15, 9, 0), &settings());

        insta::assert_snapshot!(output, @r"
        +79991234567 (tg 100, https://t.me/someone)
          2024-09-01 12:00 - 2024-09-30 23:59  active  [primary]
        +79990000000 (not linked)
          no subscriptions
        ");
    }

    #[test]
    fn json_listing_hides_links() {
        let db = seeded();
        let records = db.list_members().expect("list members");

        let output = format_members_json(&records, utc(2024, 10, 2, 0, 0), RequiredTokens::PrimaryOnly)
            .expect("format json");

        let value: serde_json::Value = serde_json::from_str(&output).expect("valid json");
        assert_eq!(value[0]["intervals"][0]["state"], "expired");
        assert_eq!(value[0]["intervals"][0]["tokens"][0], "primary");
        assert_eq!(value[1]["messaging_id"], serde_json::Value::Null);
        assert!(!output.contains("https://t.me/+abc"));
    }

    #[test]
    fn empty_database_says_so() {
        let db = Database::open_in_memory().expect("open db");
        let mut output = Vec::new();
        run(&mut output, &db, &settings(), utc(2024, 9, 1, 0, 0), false).expect("run");
        assert_eq!(String::from_utf8(output).expect("utf8 output"), "No members.\n");
    }
}
