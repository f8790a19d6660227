// Date/time parsing and formatting for the store and CSV formats

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

use crate::constants::{
    DATE_TIME_FORMAT, DATE_TIME_T_FORMAT, LEGACY_DATE_FORMAT, LEGACY_TIME_FORMAT,
};

/// Parse a stored or exported DateTime value.
/// Accepts `yyyy-MM-dd HH:mm:ss` and the `T`-separated variant; surrounding
/// whitespace (the spreadsheet leading space) is ignored.
pub fn parse_date_time(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    NaiveDateTime::parse_from_str(value, DATE_TIME_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(value, DATE_TIME_T_FORMAT))
        .ok()
}

pub fn format_date_time(dt: &NaiveDateTime) -> String {
    dt.format(DATE_TIME_FORMAT).to_string()
}

pub fn format_date_time_t(dt: &NaiveDateTime) -> String {
    dt.format(DATE_TIME_T_FORMAT).to_string()
}

/// Legacy Date column, e.g. `05-Apr-2021`.
pub fn format_legacy_date(dt: &NaiveDateTime) -> String {
    dt.format(LEGACY_DATE_FORMAT).to_string()
}

pub fn format_legacy_time(dt: &NaiveDateTime) -> String {
    dt.format(LEGACY_TIME_FORMAT).to_string()
}

/// Parse a legacy Date column. Older exports also used ISO dates.
pub fn parse_legacy_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    NaiveDate::parse_from_str(value, LEGACY_DATE_FORMAT)
        .or_else(|_| NaiveDate::parse_from_str(value, "%Y-%m-%d"))
        .ok()
}

pub fn parse_legacy_time(value: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), LEGACY_TIME_FORMAT).ok()
}

/// Combine legacy Date and Time columns into one timestamp.
pub fn combine_date_time(date: &str, time: &str) -> Option<NaiveDateTime> {
    let date = parse_legacy_date(date)?;
    let time = parse_legacy_time(time)?;
    Some(date.and_time(time))
}

/// Normalize any accepted DateTime input to the stored representation.
pub fn normalize_date_time(value: &str) -> Option<String> {
    parse_date_time(value).map(|dt| format_date_time(&dt))
}
