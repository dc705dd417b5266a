//! Prompt encoding gate
//!
//! Scores mojibake likelihood, attempts candidate re-decodings, and
//! normalizes the prompt before routing. Garbled input that cannot be
//! repaired fails fast with a canned retry response instead of reaching
//! the router.

use crate::config::AgentConfig;
use crate::models::{EncodingReport, EncodingVerdict};
use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

/// Byte-sequence artifacts typical of UTF-8 Vietnamese read as a
/// single-byte encoding.
const MOJIBAKE_PATTERNS: &[&str] = &["Ã", "Â", "á»", "â€", "Æ"];

const REPAIR_STRATEGIES: &[&str] = &["latin1_to_utf8", "cp1252_to_utf8"];

fn clamp01(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}

fn stable_fingerprint(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    hex::encode(digest)[..16].to_string()
}

fn normalize(text: &str, form: &str) -> String {
    match form {
        "NFD" => text.nfd().collect(),
        "NFKC" => text.nfkc().collect(),
        "NFKD" => text.nfkd().collect(),
        _ => text.nfc().collect(),
    }
}

fn replacement_char_ratio(text: &str) -> f64 {
    let total = text.chars().count().max(1);
    let hits = text.chars().filter(|ch| *ch == '\u{FFFD}').count();
    hits as f64 / total as f64
}

fn mojibake_pattern_ratio(text: &str) -> f64 {
    let total = text.chars().count().max(1);
    let hits: usize = MOJIBAKE_PATTERNS
        .iter()
        .map(|pattern| text.matches(pattern).count())
        .sum();
    hits as f64 / total as f64
}

fn control_char_ratio(text: &str) -> f64 {
    let total = text.chars().count().max(1);
    let hits = text
        .chars()
        .filter(|ch| ch.is_control() && !matches!(ch, '\n' | '\r' | '\t'))
        .count();
    hits as f64 / total as f64
}

fn score_mojibake(text: &str) -> (f64, Vec<String>) {
    let replacement_ratio = replacement_char_ratio(text);
    let pattern_ratio = mojibake_pattern_ratio(text);
    let control_ratio = control_char_ratio(text);

    let mut reasons = Vec::new();
    if replacement_ratio > 0.0 {
        reasons.push("replacement_char_detected".to_string());
    }
    if pattern_ratio > 0.0 {
        reasons.push("mojibake_pattern_detected".to_string());
    }
    if control_ratio > 0.0 {
        reasons.push("control_char_detected".to_string());
    }
    if reasons.is_empty() {
        reasons.push("clean_utf8".to_string());
    }

    // Weights tuned for Vietnamese mojibake signatures.
    let score = replacement_ratio * 0.65 + pattern_ratio * 2.5 + control_ratio * 1.8;
    (clamp01(score), reasons)
}

/// Encode a char back to its Windows-1252 byte, if one exists.
fn cp1252_byte(ch: char) -> Option<u8> {
    match ch {
        '\u{20AC}' => Some(0x80),
        '\u{201A}' => Some(0x82),
        '\u{0192}' => Some(0x83),
        '\u{201E}' => Some(0x84),
        '\u{2026}' => Some(0x85),
        '\u{2020}' => Some(0x86),
        '\u{2021}' => Some(0x87),
        '\u{02C6}' => Some(0x88),
        '\u{2030}' => Some(0x89),
        '\u{0160}' => Some(0x8A),
        '\u{2039}' => Some(0x8B),
        '\u{0152}' => Some(0x8C),
        '\u{017D}' => Some(0x8E),
        '\u{2018}' => Some(0x91),
        '\u{2019}' => Some(0x92),
        '\u{201C}' => Some(0x93),
        '\u{201D}' => Some(0x94),
        '\u{2022}' => Some(0x95),
        '\u{2013}' => Some(0x96),
        '\u{2014}' => Some(0x97),
        '\u{02DC}' => Some(0x98),
        '\u{2122}' => Some(0x99),
        '\u{0161}' => Some(0x9A),
        '\u{203A}' => Some(0x9B),
        '\u{0153}' => Some(0x9C),
        '\u{017E}' => Some(0x9E),
        '\u{0178}' => Some(0x9F),
        _ => {
            let code = ch as u32;
            // The 0x80..0x9F block has no identity mapping in cp1252.
            if code <= 0xFF && !(0x80..=0x9F).contains(&code) {
                Some(code as u8)
            } else {
                None
            }
        }
    }
}

fn latin1_byte(ch: char) -> Option<u8> {
    let code = ch as u32;
    if code <= 0xFF {
        Some(code as u8)
    } else {
        None
    }
}

/// Re-encode under the guessed source charset and decode as UTF-8.
fn attempt_repair(text: &str, strategy: &str) -> Option<String> {
    let mut bytes = Vec::with_capacity(text.len());
    for ch in text.chars() {
        let byte = match strategy {
            "latin1_to_utf8" => latin1_byte(ch)?,
            "cp1252_to_utf8" => cp1252_byte(ch)?,
            _ => return None,
        };
        bytes.push(byte);
    }
    String::from_utf8(bytes).ok()
}

/// Run the full gate: normalize, score, optionally repair, decide.
pub fn apply_prompt_encoding_gate(prompt: &str, config: &AgentConfig) -> (String, EncodingReport) {
    let form = config.encoding_normalization_form.as_str();
    let normalized_prompt = normalize(prompt, form);
    let fingerprint = stable_fingerprint(prompt);
    let (score, mut reason_codes) = score_mojibake(&normalized_prompt);
    reason_codes.push(format!("normalized_{}", form.to_lowercase()));

    if !config.encoding_gate_enabled {
        reason_codes.push("encoding_gate_disabled".to_string());
        return (
            normalized_prompt,
            finish_report(EncodingVerdict::Pass, score, false, String::new(), reason_codes, fingerprint),
        );
    }

    let mut selected_text = normalized_prompt.clone();
    let mut selected_score = score;
    let mut selected_guess = String::new();
    let mut repair_applied = false;

    if config.encoding_repair_enabled && score >= config.encoding_repair_score_min.max(0.0) {
        let mut candidates: Vec<(f64, String, String)> = Vec::new();
        for strategy in REPAIR_STRATEGIES {
            let Some(repaired) = attempt_repair(&normalized_prompt, strategy) else {
                continue;
            };
            let repaired_norm = normalize(&repaired, form);
            let (repaired_score, _) = score_mojibake(&repaired_norm);
            if score - repaired_score >= config.encoding_repair_min_delta {
                candidates.push((repaired_score, strategy.to_string(), repaired_norm));
            }
        }
        candidates.sort_by(|a, b| {
            a.0.partial_cmp(&b.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.cmp(&b.1))
        });
        if let Some((best_score, strategy, text)) = candidates.into_iter().next() {
            selected_score = best_score;
            selected_text = text;
            selected_guess = strategy.clone();
            repair_applied = true;
            reason_codes.push(format!("repair_applied_{}", strategy));
        } else {
            reason_codes.push("repair_not_improved".to_string());
        }
    }

    let mut decision = if repair_applied {
        EncodingVerdict::Repaired
    } else {
        EncodingVerdict::Pass
    };
    if selected_score >= config.encoding_failfast_score_min {
        decision = EncodingVerdict::FailFast;
        reason_codes.push("encoding_fail_fast_threshold_exceeded".to_string());
    }

    (
        selected_text,
        finish_report(decision, selected_score, repair_applied, selected_guess, reason_codes, fingerprint),
    )
}

fn finish_report(
    decision: EncodingVerdict,
    score: f64,
    repair_applied: bool,
    encoding_guess: String,
    mut reason_codes: Vec<String>,
    input_fingerprint: String,
) -> EncodingReport {
    reason_codes.sort();
    reason_codes.dedup();
    EncodingReport {
        decision,
        mojibake_score: clamp01(score),
        repair_applied,
        encoding_guess,
        reason_codes,
        input_fingerprint,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AgentConfig {
        AgentConfig::default()
    }

    #[test]
    fn test_clean_vietnamese_passes() {
        let (text, report) = apply_prompt_encoding_gate("Tóm tắt chi tiêu tháng này", &config());
        assert_eq!(report.decision, EncodingVerdict::Pass);
        assert!(!report.repair_applied);
        assert!(report.mojibake_score < 0.12);
        assert_eq!(text, "Tóm tắt chi tiêu tháng này");
        assert!(report.reason_codes.contains(&"clean_utf8".to_string()));
    }

    #[test]
    fn test_latin1_mojibake_repairs() {
        // "Tóm tắt" UTF-8 bytes re-read as latin-1.
        let garbled = "TÃ³m táº¯t chi tiÃªu";
        let (text, report) = apply_prompt_encoding_gate(garbled, &config());
        assert_eq!(report.decision, EncodingVerdict::Repaired);
        assert!(report.repair_applied);
        // Both strategies repair this sample to the same text; the
        // alphabetical tie-break picks cp1252.
        assert_eq!(report.encoding_guess, "cp1252_to_utf8");
        assert_eq!(text, "Tóm tắt chi tiêu");
    }

    #[test]
    fn test_unrepairable_garbage_fails_fast() {
        let garbled = "\u{FFFD}\u{FFFD}\u{FFFD}\u{FFFD}\u{FFFD}\u{FFFD}";
        let (_, report) = apply_prompt_encoding_gate(garbled, &config());
        assert_eq!(report.decision, EncodingVerdict::FailFast);
        assert!(report
            .reason_codes
            .contains(&"encoding_fail_fast_threshold_exceeded".to_string()));
    }

    #[test]
    fn test_disabled_gate_passes_everything() {
        let mut cfg = config();
        cfg.encoding_gate_enabled = false;
        let (_, report) = apply_prompt_encoding_gate("\u{FFFD}\u{FFFD}\u{FFFD}", &cfg);
        assert_eq!(report.decision, EncodingVerdict::Pass);
        assert!(report
            .reason_codes
            .contains(&"encoding_gate_disabled".to_string()));
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let (_, first) = apply_prompt_encoding_gate("chi tiêu", &config());
        let (_, second) = apply_prompt_encoding_gate("chi tiêu", &config());
        assert_eq!(first.input_fingerprint, second.input_fingerprint);
        assert_eq!(first.input_fingerprint.len(), 16);
    }

    #[test]
    fn test_cp1252_round_trip() {
        // The curly apostrophe only survives a cp1252 re-encode.
        let garbled = "donâ€™t";
        let repaired = attempt_repair(garbled, "cp1252_to_utf8").unwrap();
        assert_eq!(repaired, "don\u{2019}t");
        assert!(attempt_repair(garbled, "latin1_to_utf8").is_none());
    }
}
