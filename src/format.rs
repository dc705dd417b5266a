//! Numeric coercion and value-text formatting
//!
//! The renderer is the only authority on numeric text in responses; these
//! helpers produce the canonical `value_text` forms bound into facts.

use serde_json::Value;

pub fn safe_float(value: Option<&Value>, default: f64) -> f64 {
    match value {
        None | Some(Value::Null) => default,
        Some(Value::Number(number)) => number.as_f64().unwrap_or(default),
        Some(Value::Bool(_)) => default,
        Some(Value::String(text)) => {
            let cleaned = text.trim().replace(',', "");
            if cleaned.is_empty() {
                default
            } else {
                cleaned.parse::<f64>().unwrap_or(default)
            }
        }
        Some(_) => default,
    }
}

pub fn safe_int(value: Option<&Value>, default: i64) -> i64 {
    match value {
        None | Some(Value::Null) => default,
        Some(Value::Number(number)) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|v| v as i64))
            .unwrap_or(default),
        Some(Value::String(text)) => {
            let digits: String = text.chars().filter(|ch| ch.is_ascii_digit()).collect();
            if digits.is_empty() {
                default
            } else {
                digits.parse::<i64>().unwrap_or(default)
            }
        }
        Some(_) => default,
    }
}

fn group_thousands(value: u64) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (position, ch) in digits.chars().enumerate() {
        if position > 0 && (digits.len() - position) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

/// Grouped money text; fractional amounts keep two decimals.
pub fn fmt_money(value: f64) -> String {
    let rounded = (value * 100.0).round() / 100.0;
    let magnitude = rounded.abs();
    let sign = if rounded < 0.0 { "-" } else { "" };
    if (magnitude - magnitude.round()).abs() < 0.01 {
        format!("{}{}", sign, group_thousands(magnitude.round() as u64))
    } else {
        let whole = magnitude.trunc() as u64;
        let cents = ((magnitude - magnitude.trunc()) * 100.0).round() as u64;
        format!("{}{}.{:02}", sign, group_thousands(whole), cents)
    }
}

/// Money text with an explicit sign, for net-flow style values.
pub fn fmt_signed_money(value: f64) -> String {
    let sign = if value < 0.0 { "-" } else { "+" };
    format!("{}{}", sign, fmt_money(value.abs()))
}

/// Ratio or percent input, percent output. Values within [-1, 1] are
/// treated as ratios.
pub fn fmt_pct(value: f64) -> String {
    if value.abs() > 1.0 {
        format!("{:.2}%", value)
    } else {
        format!("{:.2}%", value * 100.0)
    }
}
