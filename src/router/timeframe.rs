//! Prompt timeframe parsing
//!
//! Explicit windows in the prompt are slotted into every tool that accepts
//! a range argument. Out-of-range values are clamped by the scheduler, not
//! rejected; parse failure means tool defaults.

use super::fold_accents;
use chrono::{Datelike, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedTimeframe {
    pub days: u32,
    pub source: &'static str,
}

static DAYS_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(\d{1,3})\s*(?:ngay|days?)\b").unwrap());
static MONTHS_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(\d{1,2})\s*(?:thang|months?)\b").unwrap());

fn days_in_previous_month() -> u32 {
    let today = Utc::now().date_naive();
    let (year, month) = if today.month() == 1 {
        (today.year() - 1, 12)
    } else {
        (today.year(), today.month() - 1)
    };
    let first_of_month = chrono::NaiveDate::from_ymd_opt(year, month, 1);
    let first_of_next = if month == 12 {
        chrono::NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        chrono::NaiveDate::from_ymd_opt(year, month + 1, 1)
    };
    match (first_of_month, first_of_next) {
        (Some(start), Some(end)) => (end - start).num_days().max(1) as u32,
        _ => 30,
    }
}

/// Parse an explicit analysis window from the prompt.
pub fn parse_timeframe(prompt: &str) -> Option<ParsedTimeframe> {
    let folded = fold_accents(prompt);

    if let Some(captures) = DAYS_PATTERN.captures(&folded) {
        if let Ok(days) = captures[1].parse::<u32>() {
            if days > 0 {
                return Some(ParsedTimeframe { days, source: "explicit_days" });
            }
        }
    }

    // "thang nay"/"thang truoc" would also match the bare months pattern;
    // check the calendar phrases first.
    if folded.contains("thang nay") || folded.contains("this month") {
        let days = Utc::now().day().max(1);
        return Some(ParsedTimeframe { days, source: "this_month" });
    }
    if folded.contains("thang truoc") || folded.contains("last month") {
        return Some(ParsedTimeframe { days: days_in_previous_month(), source: "last_month" });
    }

    if let Some(captures) = MONTHS_PATTERN.captures(&folded) {
        if let Ok(months) = captures[1].parse::<u32>() {
            if months > 0 {
                return Some(ParsedTimeframe { days: months * 30, source: "explicit_months" });
            }
        }
    }

    if folded.contains("gan day") || folded.contains("recent") {
        return Some(ParsedTimeframe { days: 30, source: "recent" });
    }

    None
}

/// Clamp a window to a tool's accepted bounds.
pub fn clamp_days(days: u32, min: u32, max: u32) -> u32 {
    days.clamp(min, max)
}
