//! Date and time parsing for model output, and the calendar the model sees.
//!
//! The model answers in the formats it was shown: `DD.MM.YYYY`, `DD.MM`
//! (current year) or ISO `YYYY-MM-DD` for dates and `HH:MM` for times.

use std::sync::LazyLock;

use chrono::{Datelike, Duration, NaiveDate, NaiveTime, Weekday};
use regex::Regex;

static DAY_MONTH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{1,2})\.(\d{1,2})\.?$").expect("Invalid day-month regex"));

static CLOCK_TIME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{1,2})[:.](\d{2})$").expect("Invalid time regex"));

/// Parse a date, resolving `DD.MM` against `today`'s year.
pub fn parse_date(raw: &str, today: NaiveDate) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%d.%m.%Y") {
        return Some(date);
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(date);
    }
    let caps = DAY_MONTH.captures(raw)?;
    let day: u32 = caps[1].parse().ok()?;
    let month: u32 = caps[2].parse().ok()?;
    NaiveDate::from_ymd_opt(today.year(), month, day)
}

/// Parse `HH:MM` (also `H:MM` and `HH.MM`).
pub fn parse_time(raw: &str) -> Option<NaiveTime> {
    let caps = CLOCK_TIME.captures(raw.trim())?;
    let hour: u32 = caps[1].parse().ok()?;
    let minute: u32 = caps[2].parse().ok()?;
    NaiveTime::from_hms_opt(hour, minute, 0)
}

pub fn format_date(date: NaiveDate) -> String {
    date.format("%d.%m.%Y").to_string()
}

pub fn format_time(time: NaiveTime) -> String {
    time.format("%H:%M").to_string()
}

fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "Monday",
        Weekday::Tue => "Tuesday",
        Weekday::Wed => "Wednesday",
        Weekday::Thu => "Thursday",
        Weekday::Fri => "Friday",
        Weekday::Sat => "Saturday",
        Weekday::Sun => "Sunday",
    }
}

/// `days` lines of `DD.MM.YYYY - Weekday`, starting at `today`, which is
/// marked.
pub fn calendar(today: NaiveDate, days: u32) -> String {
    (0..i64::from(days))
        .map(|offset| {
            let date = today + Duration::days(offset);
            let mut line = format!("{} - {}", format_date(date), weekday_name(date.weekday()));
            if offset == 0 {
                line.push_str(" (today)");
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n")
}
