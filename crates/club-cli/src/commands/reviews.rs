//! Member feedback: recording replies and listing them.

use std::io::Write;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use club_db::{Database, Review};
use serde::Serialize;

use super::util::local;

#[derive(Debug, Serialize)]
struct JsonReview<'a> {
    id: i64,
    phone: &'a str,
    profile_link: Option<&'a str>,
    text: &'a str,
    created_at: DateTime<Utc>,
}

/// Stores a member's reply to the feedback request.
pub fn record<W: Write>(
    writer: &mut W,
    db: &Database,
    messaging_id: i64,
    text: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    let text = text.trim();
    if text.is_empty() {
        anyhow::bail!("Review text is empty");
    }
    let review = db
        .record_review(messaging_id, text, now)
        .context("failed to record review")?;
    writeln!(writer, "Recorded review from {}", review.member.phone)?;
    Ok(())
}

pub fn format_reviews_json(reviews: &[Review]) -> Result<String> {
    let reviews: Vec<JsonReview<'_>> = reviews
        .iter()
        .map(|review| JsonReview {
            id: review.id,
            phone: &review.member.phone,
            profile_link: review.member.profile_link.as_deref(),
            text: &review.text,
            created_at: review.created_at,
        })
        .collect();
    Ok(serde_json::to_string_pretty(&reviews)?)
}

pub fn format_reviews_text(reviews: &[Review], tz: Tz) -> String {
    if reviews.is_empty() {
        return "No reviews.\n".to_string();
    }
    reviews
        .iter()
        .map(|review| {
            let author = match &review.member.profile_link {
                Some(link) => format!("{} ({link})", review.member.phone),
                None => review.member.phone.clone(),
            };
            format!(
                "{}  {author}\n  {}\n",
                local(review.created_at, tz),
                review.text.replace('\n', "\n  ")
            )
        })
        .collect()
}

pub fn run<W: Write>(writer: &mut W, db: &Database, tz: Tz, json: bool) -> Result<()> {
    let reviews = db.reviews()?;
    if json {
        writeln!(writer, "{}", format_reviews_json(&reviews)?)?;
    } else {
        write!(writer, "{}", format_reviews_text(&reviews, tz))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::link_member;
    use crate::testing::{settings, utc};

    fn linked() -> Database {
        let db = Database::open_in_memory().expect("open db");
        let settings = settings();
        link_member(&db, &settings, "+79991234567", 100, Some("someone")).expect("link");
        link_member(&db, &settings, "+79990000000", 200, None).expect("link");
        db
    }

    #[test]
    fn recorded_reviews_are_listed_in_local_time() {
        let db = linked();
        let mut output = Vec::new();
        record(&mut output, &db, 100, "  Great club\nthanks  ", utc(2024, 9, 26, 11, 0))
            .expect("record");
        record(&mut output, &db, 200, "More streams", utc(2024, 9, 27, 8, 30))
            .expect("record");
        assert_eq!(
            String::from_utf8(output).expect("utf8 output"),
            "Recorded review from +79991234567\nRecorded review from +79990000000\n"
        );

        let reviews = db.reviews().expect("list reviews");
        let text = format_reviews_text(&reviews, settings().timezone);

        insta::assert_snapshot!(text, @r"
        2024-09-26 14:00  +79991234567 (https://t.me/someone)
          Great club
          thanks
        2024-09-27 11:30  +79990000000
          More streams
        ");
    }

    #[test]
    fn blank_review_is_rejected() {
        let db = linked();
        let mut output = Vec::new();

        let err = record(&mut output, &db, 100, "   ", utc(2024, 9, 26, 11, 0)).unwrap_err();

        assert!(err.to_string().contains("empty"));
        assert!(db.reviews().expect("list reviews").is_empty());
    }

    #[test]
    fn review_from_unlinked_sender_fails() {
        let db = linked();
        let mut output = Vec::new();

        let err = record(&mut output, &db, 999, "hello", utc(2024, 9, 26, 11, 0)).unwrap_err();

        assert!(format!("{err:#}").contains("member not found"));
    }

    #[test]
    fn json_listing_carries_author_and_text() {
        let db = linked();
        db.record_review(100, "Great club", utc(2024, 9, 26, 11, 0))
            .expect("record review");

        let output = format_reviews_json(&db.reviews().expect("list reviews")).expect("format json");

        let value: serde_json::Value = serde_json::from_str(&output).expect("valid json");
        assert_eq!(value[0]["phone"], "+79991234567");
        assert_eq!(value[0]["text"], "Great club");
        assert_eq!(value[0]["created_at"], "2024-09-26T11:00:00Z");
    }

    #[test]
    fn empty_database_says_so() {
        let db = Database::open_in_memory().expect("open db");
        let mut output = Vec::new();
        run(&mut output, &db, settings().timezone, false).expect("run");
        assert_eq!(String::from_utf8(output).expect("utf8 output"), "No reviews.\n");
    }
}
