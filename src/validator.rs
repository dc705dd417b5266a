//! Answer-plan grounding validation
//!
//! The synthesized plan is untrusted data. Numbers may only enter the
//! response through `[F:<fact_id>]` placeholders; free-form digits in any
//! text slot are rejected, with a small tolerance for cadence/ordinal
//! numbers in advisory prose. Education-only responses must not contain
//! trade-execution imperatives.

use crate::models::{AdvisoryContext, AnswerPlan};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

static INVESTMENT_EXECUTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(buy|sell|trade|execute|mua|ban|dat lenh|short|long)\b").unwrap()
});
static FACT_PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[F:([a-zA-Z0-9._-]+)\]").unwrap());
static NUMERIC_TOKEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"[-+]?\d[\d,\.]*%?").unwrap());
static LIST_MARKER: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^\s*\d+[\.\)]\s+").unwrap());

/// Numeric tokens in a text, trimmed of trailing punctuation.
pub fn extract_numeric_tokens(text: &str) -> HashSet<String> {
    NUMERIC_TOKEN
        .find_iter(text)
        .map(|token| {
            token
                .as_str()
                .trim()
                .trim_matches(|ch: char| ".,;:()[]{}".contains(ch))
                .to_string()
        })
        .filter(|token| !token.is_empty())
        .collect()
}

pub fn extract_fact_placeholders(text: &str) -> HashSet<String> {
    FACT_PLACEHOLDER
        .captures_iter(text)
        .map(|captures| captures[1].trim().to_string())
        .filter(|id| !id.is_empty())
        .collect()
}

fn strip_fact_placeholders(text: &str) -> String {
    FACT_PLACEHOLDER.replace_all(text, " ").into_owned()
}

fn strip_list_markers(text: &str) -> String {
    LIST_MARKER.replace_all(text, "").into_owned()
}

fn parse_numeric_token(token: &str) -> Option<f64> {
    let cleaned = token.trim().trim_end_matches('%').replace(',', "");
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok()
}

/// Operational cadence and ordinal numbers are tolerated in prose: small
/// percentages and integers that fit in a month.
fn is_soft_ungrounded(token: &str) -> bool {
    let Some(value) = parse_numeric_token(token) else {
        return false;
    };
    let absolute = value.abs();
    if token.trim().ends_with('%') {
        return absolute <= 25.0;
    }
    absolute.fract() == 0.0 && absolute <= 31.0
}

/// Validate the plan against the advisory context. Returns sorted,
/// deduplicated error codes; empty means grounded.
pub fn validate_answer_grounding(
    plan: &AnswerPlan,
    context: &AdvisoryContext,
    education_only: bool,
    allowed_prompt_tokens: &HashSet<String>,
) -> Vec<String> {
    let mut errors: Vec<String> = Vec::new();

    if plan.disclaimer.trim().is_empty() {
        errors.push("disclaimer_missing".to_string());
    }

    let fact_ids: HashSet<&str> = context.facts.iter().map(|fact| fact.fact_id.as_str()).collect();

    let mut placeholder_ids: HashSet<String> = HashSet::new();
    for section in plan.text_sections() {
        placeholder_ids.extend(extract_fact_placeholders(section));
    }
    let mut unknown_placeholders: Vec<&String> = placeholder_ids
        .iter()
        .filter(|id| !fact_ids.contains(id.as_str()))
        .collect();
    unknown_placeholders.sort();
    if !unknown_placeholders.is_empty() {
        errors.push("unknown_fact_placeholders".to_string());
        let sample: Vec<&str> = unknown_placeholders
            .iter()
            .take(5)
            .map(|id| id.as_str())
            .collect();
        errors.push(format!("unknown_fact_placeholders_sample:{}", sample.join(",")));
    }

    for metric in &plan.key_metrics {
        if !fact_ids.contains(metric.fact_id.as_str()) {
            errors.push(format!("unknown_metric_fact_id:{}", metric.fact_id));
        }
    }

    let mut raw_tokens: HashSet<String> = HashSet::new();
    for section in plan.text_sections() {
        let cleaned = strip_list_markers(&strip_fact_placeholders(section));
        raw_tokens.extend(extract_numeric_tokens(&cleaned));
    }

    let mut allowed_tokens: HashSet<String> = allowed_prompt_tokens
        .iter()
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
        .collect();
    for fact in &context.facts {
        allowed_tokens.extend(extract_numeric_tokens(&fact.value_text));
        allowed_tokens.extend(extract_numeric_tokens(&fact.timeframe));
        allowed_tokens.extend(extract_numeric_tokens(&fact.value.to_string()));
    }
    for action in &context.actions {
        allowed_tokens.extend(extract_numeric_tokens(&action.params.to_string()));
    }

    let mut hard_ungrounded: Vec<String> = raw_tokens
        .difference(&allowed_tokens)
        .filter(|token| !is_soft_ungrounded(token))
        .cloned()
        .collect();
    hard_ungrounded.sort();
    if !hard_ungrounded.is_empty() {
        errors.push("ungrounded_numeric_tokens".to_string());
        let sample: Vec<&str> = hard_ungrounded.iter().take(5).map(|s| s.as_str()).collect();
        errors.push(format!("ungrounded_numeric_tokens_sample:{}", sample.join(",")));
    }

    if education_only {
        // Raw text only: folding would turn the pronoun "bạn" into the
        // execution verb "ban".
        let combined: String = plan
            .text_sections()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        if INVESTMENT_EXECUTION.is_match(&combined) {
            errors.push("education_only_policy_violation".to_string());
        }
    }

    errors.sort();
    errors.dedup();
    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Fact, Intent, KeyMetric, Language};
    use serde_json::json;

    fn fact(fact_id: &str, value_text: &str) -> Fact {
        Fact {
            fact_id: fact_id.to_string(),
            label: fact_id.to_string(),
            value: json!(0),
            value_text: value_text.to_string(),
            unit: String::new(),
            timeframe: "30d".to_string(),
            source_tool: "test".to_string(),
            source_path: "test".to_string(),
        }
    }

    fn context(facts: Vec<Fact>) -> AdvisoryContext {
        AdvisoryContext {
            schema_version: "advisory_context_v1".to_string(),
            intent: Intent::Summary,
            language: Language::Vi,
            facts,
            insights: Vec::new(),
            actions: Vec::new(),
            citations: Vec::new(),
            policy_flags: serde_json::Map::new(),
        }
    }

    fn plan(summary_lines: Vec<&str>, actions: Vec<&str>) -> AnswerPlan {
        AnswerPlan {
            schema_version: "answer_plan_v2".to_string(),
            language: Language::Vi,
            summary_lines: summary_lines.into_iter().map(|s| s.to_string()).collect(),
            key_metrics: Vec::new(),
            actions: actions.into_iter().map(|s| s.to_string()).collect(),
            assumptions: Vec::new(),
            limitations: Vec::new(),
            disclaimer: "Educational guidance only.".to_string(),
            used_fact_ids: Vec::new(),
            used_insight_ids: Vec::new(),
            used_action_ids: Vec::new(),
        }
    }

    #[test]
    fn test_grounded_plan_passes() {
        let context = context(vec![fact("spend.total_spend.30d", "14,200,000")]);
        let plan = plan(
            vec![
                "Tổng chi tiêu của bạn là [F:spend.total_spend.30d].",
                "Dòng tiền đang ổn định.",
                "Theo dõi thêm để giữ kỷ luật chi tiêu.",
            ],
            vec!["Rà soát ngân sách mỗi tuần.", "Cập nhật dữ liệu sau 14 ngày."],
        );
        let errors = validate_answer_grounding(&plan, &context, false, &HashSet::new());
        assert!(errors.is_empty(), "unexpected errors: {:?}", errors);
    }

    #[test]
    fn test_unknown_placeholder_rejected() {
        let context = context(vec![fact("spend.total_spend.30d", "14,200,000")]);
        let plan = plan(
            vec!["Chi tiêu [F:spend.made_up.30d].", "x", "y"],
            vec!["a", "b"],
        );
        let errors = validate_answer_grounding(&plan, &context, false, &HashSet::new());
        assert!(errors.contains(&"unknown_fact_placeholders".to_string()));
        assert!(errors
            .iter()
            .any(|e| e.starts_with("unknown_fact_placeholders_sample:spend.made_up.30d")));
    }

    #[test]
    fn test_free_digits_rejected() {
        let context = context(vec![fact("spend.total_spend.30d", "14,200,000")]);
        let plan = plan(
            vec!["Bạn đã chi 9,999,999 trong kỳ.", "x", "y"],
            vec!["a", "b"],
        );
        let errors = validate_answer_grounding(&plan, &context, false, &HashSet::new());
        assert!(errors.contains(&"ungrounded_numeric_tokens".to_string()));
    }

    #[test]
    fn test_fact_bound_digits_allowed() {
        let context = context(vec![fact("spend.total_spend.30d", "14,200,000")]);
        // The fact's own formatted value may appear verbatim.
        let plan = plan(
            vec!["Tổng chi là 14,200,000 VND trong 30d.", "x", "y"],
            vec!["a", "b"],
        );
        let errors = validate_answer_grounding(&plan, &context, false, &HashSet::new());
        assert!(errors.is_empty(), "unexpected errors: {:?}", errors);
    }

    #[test]
    fn test_soft_tolerance_for_cadence_numbers() {
        let context = context(vec![fact("spend.total_spend.30d", "14,200,000")]);
        let plan = plan(
            vec!["Đặt mục tiêu cho 14 ngày tới.", "Giảm 10% nhóm chi lớn nhất.", "y"],
            vec!["Rà soát lại sau 7 ngày.", "b"],
        );
        let errors = validate_answer_grounding(&plan, &context, false, &HashSet::new());
        assert!(errors.is_empty(), "unexpected errors: {:?}", errors);
    }

    #[test]
    fn test_large_percent_rejected() {
        let context = context(Vec::new());
        let plan = plan(vec!["Lợi nhuận kỳ vọng 85%.", "x", "y"], vec!["a", "b"]);
        let errors = validate_answer_grounding(&plan, &context, false, &HashSet::new());
        assert!(errors.contains(&"ungrounded_numeric_tokens".to_string()));
    }

    #[test]
    fn test_education_only_blocks_imperatives() {
        let context = context(Vec::new());
        let plan = plan(
            vec!["Bạn nên mua cổ phiếu ngay hôm nay.", "x", "y"],
            vec!["a", "b"],
        );
        let errors = validate_answer_grounding(&plan, &context, true, &HashSet::new());
        assert!(errors.contains(&"education_only_policy_violation".to_string()));

        // The same text is fine when the response is not education-bound.
        let errors = validate_answer_grounding(&plan, &context, false, &HashSet::new());
        assert!(!errors.contains(&"education_only_policy_violation".to_string()));
    }

    #[test]
    fn test_missing_disclaimer_rejected() {
        let context = context(Vec::new());
        let mut plan = plan(vec!["x", "y", "z"], vec!["a", "b"]);
        plan.disclaimer = "  ".to_string();
        let errors = validate_answer_grounding(&plan, &context, false, &HashSet::new());
        assert!(errors.contains(&"disclaimer_missing".to_string()));
    }

    #[test]
    fn test_unknown_metric_fact_rejected() {
        let context = context(vec![fact("spend.total_spend.30d", "14,200,000")]);
        let mut plan = plan(vec!["x", "y", "z"], vec!["a", "b"]);
        plan.key_metrics.push(KeyMetric {
            fact_id: "spend.bogus.30d".to_string(),
            label: String::new(),
        });
        let errors = validate_answer_grounding(&plan, &context, false, &HashSet::new());
        assert!(errors.contains(&"unknown_metric_fact_id:spend.bogus.30d".to_string()));
    }

    #[test]
    fn test_prompt_tokens_are_allowed() {
        let context = context(Vec::new());
        let plan = plan(vec!["Mục tiêu 1.5 tỷ của bạn cần thêm thời gian.", "x", "y"], vec!["a", "b"]);
        let mut prompt_tokens = HashSet::new();
        prompt_tokens.insert("1.5".to_string());
        let errors = validate_answer_grounding(&plan, &context, false, &prompt_tokens);
        assert!(errors.is_empty(), "unexpected errors: {:?}", errors);
    }
}
