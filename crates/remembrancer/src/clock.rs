//! Conversions between chat-local and UTC instants.
//!
//! A chat's timezone is a whole number of hours added to UTC. All reminder
//! timestamps are stored as naive UTC at minute precision; these helpers are
//! the only place arithmetic between the two happens.

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime};

/// Largest accepted UTC offset, in hours (either direction).
pub const MAX_OFFSET_HOURS: i32 = 24;

/// Checks that `text` is a `D/M` or `D/M/Y` date token.
///
/// The year-less form is validated against a non-leap reference year, so
/// `29/2` is only accepted with an explicit leap year.
pub fn validate_date(text: &str) -> bool {
    let parts: Vec<&str> = text.split('/').collect();
    match parts.as_slice() {
        [day, month] => day_month(day, month, 1900).is_some(),
        [day, month, year] => year
            .parse::<u32>()
            .ok()
            .and_then(|year| day_month(day, month, year as i32))
            .is_some(),
        _ => false,
    }
}

fn day_month(day: &str, month: &str, year: i32) -> Option<NaiveDate> {
    let day: u32 = day.parse().ok()?;
    let month: u32 = month.parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Checks that `text` is an `H:MM` 24-hour time token.
pub fn validate_time(text: &str) -> bool {
    let parts: Vec<&str> = text.split(':').collect();
    let [hour, minute] = parts.as_slice() else {
        return false;
    };
    match (hour.parse::<u32>(), minute.parse::<u32>()) {
        (Ok(hour), Ok(minute)) => hour < 24 && minute < 60,
        _ => false,
    }
}

/// Completes a year-less `D/M` token to `D/M/Y` using the chat's local year.
///
/// If the end of that day (`23:59` chat-local) is already behind `now_utc`,
/// the date rolls over to next year. A token that already carries a year is
/// returned untouched.
pub fn resolve_year(offset_hours: i32, now_utc: NaiveDateTime, date: &str) -> String {
    if date.matches('/').count() != 1 {
        return date.to_string();
    }

    let year = to_local(offset_hours, now_utc).year();
    let this_year = format!("{date}/{year}");
    match parse_local(&this_year, "23:59") {
        Some(end_of_day) if is_future(to_utc(offset_hours, end_of_day), now_utc) => this_year,
        _ => format!("{date}/{}", year + 1),
    }
}

/// Parses a full `D/M/Y` date and `H:MM` time pair into a local datetime.
pub fn parse_local(date: &str, time: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(&format!("{date} {time}"), "%d/%m/%Y %H:%M").ok()
}

pub fn to_utc(offset_hours: i32, local: NaiveDateTime) -> NaiveDateTime {
    local - Duration::hours(offset_hours as i64)
}

pub fn to_local(offset_hours: i32, utc: NaiveDateTime) -> NaiveDateTime {
    utc + Duration::hours(offset_hours as i64)
}

pub fn is_future(utc: NaiveDateTime, now_utc: NaiveDateTime) -> bool {
    utc > now_utc
}

/// Parses a timezone reply as whole hours within `[-24, 24]`.
pub fn parse_offset(text: &str) -> Option<i32> {
    let offset: i32 = text.trim().parse().ok()?;
    (-MAX_OFFSET_HOURS..=MAX_OFFSET_HOURS)
        .contains(&offset)
        .then_some(offset)
}
