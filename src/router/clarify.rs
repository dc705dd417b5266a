//! Clarifying question bank
//!
//! Fixed multiple-choice questions keyed by the reason the router could
//! not commit to an execution route. At most `ROUTER_MAX_CLARIFY_QUESTIONS`
//! are emitted per turn.

use crate::models::{ClarifyingQuestion, Intent, IntentExtraction};

fn question(id: &str, text: &str, options: &[&str]) -> ClarifyingQuestion {
    ClarifyingQuestion {
        question_id: id.to_string(),
        question_text: text.to_string(),
        options: options.iter().map(|s| s.to_string()).collect(),
    }
}

/// Build up to `max_questions` clarifying questions for the given reasons.
pub fn build_clarify_questions(
    extraction: &IntentExtraction,
    reason_codes: &[String],
    max_questions: usize,
) -> Vec<ClarifyingQuestion> {
    let mut questions: Vec<ClarifyingQuestion> = Vec::new();
    let has_reason = |code: &str| reason_codes.iter().any(|item| item == code);

    if has_reason("scenario_horizon_missing") {
        questions.push(question(
            "scenario_horizon",
            "Bạn muốn phân tích kịch bản trong khoảng thời gian nào?",
            &["3 tháng", "6 tháng", "12 tháng"],
        ));
    }
    if has_reason("scenario_delta_missing") {
        questions.push(question(
            "scenario_delta_dimension",
            "Bạn muốn thay đổi biến nào trong kịch bản?",
            &["Thu nhập", "Chi tiêu", "Cả hai"],
        ));
    }

    let top_intents: Vec<Intent> = extraction.top2.iter().map(|item| item.intent).collect();
    let top2_is = |a: Intent, b: Intent| {
        top_intents.len() == 2
            && ((top_intents[0] == a && top_intents[1] == b)
                || (top_intents[0] == b && top_intents[1] == a))
    };

    if questions.is_empty() && top2_is(Intent::Planning, Intent::Scenario) {
        questions.push(question(
            "planning_vs_scenario",
            "Bạn đang muốn lập kế hoạch tiết kiệm hay so sánh kịch bản what-if?",
            &["Lập kế hoạch tiết kiệm", "So sánh kịch bản what-if"],
        ));
    }
    if questions.is_empty() && top2_is(Intent::Summary, Intent::Risk) {
        questions.push(question(
            "summary_vs_risk",
            "Bạn muốn xem tổng quan dòng tiền hay cảnh báo rủi ro?",
            &["Tổng quan dòng tiền", "Cảnh báo rủi ro"],
        ));
    }

    if questions.is_empty() {
        questions.push(question(
            "generic_intent",
            "Để tư vấn chính xác, bạn vui lòng chọn mục tiêu chính:",
            &["Tổng quan dòng tiền", "Kế hoạch tiết kiệm", "Phân tích kịch bản"],
        ));
    }

    questions.truncate(max_questions.max(1));
    questions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TopIntentScore;

    fn extraction(top2: Vec<(Intent, f64)>) -> IntentExtraction {
        IntentExtraction {
            schema_version: "intent_extraction_v1".to_string(),
            intent: top2[0].0,
            sub_intent: String::new(),
            confidence: top2[0].1,
            domain_relevance: 1.0,
            top2: top2
                .into_iter()
                .map(|(intent, score)| TopIntentScore { intent, score })
                .collect(),
            slots: serde_json::Map::new(),
            scenario_confidence: None,
            reason: String::new(),
        }
    }

    #[test]
    fn test_scenario_slot_questions_take_priority() {
        let extraction = extraction(vec![(Intent::Scenario, 0.8), (Intent::Planning, 0.5)]);
        let reasons = vec![
            "scenario_horizon_missing".to_string(),
            "scenario_delta_missing".to_string(),
        ];
        let questions = build_clarify_questions(&extraction, &reasons, 2);
        assert_eq!(questions.len(), 2);
        assert_eq!(questions[0].question_id, "scenario_horizon");
        assert_eq!(questions[1].question_id, "scenario_delta_dimension");
    }

    #[test]
    fn test_bounded_by_max_questions() {
        let extraction = extraction(vec![(Intent::Scenario, 0.8), (Intent::Planning, 0.5)]);
        let reasons = vec![
            "scenario_horizon_missing".to_string(),
            "scenario_delta_missing".to_string(),
        ];
        let questions = build_clarify_questions(&extraction, &reasons, 1);
        assert_eq!(questions.len(), 1);
    }

    #[test]
    fn test_ambiguous_top2_pairs() {
        let extraction = extraction(vec![(Intent::Summary, 0.5), (Intent::Risk, 0.45)]);
        let reasons = vec!["low_top2_gap".to_string()];
        let questions = build_clarify_questions(&extraction, &reasons, 2);
        assert_eq!(questions[0].question_id, "summary_vs_risk");
    }

    #[test]
    fn test_generic_fallback_always_yields_one() {
        let extraction = extraction(vec![(Intent::Summary, 0.5), (Intent::Planning, 0.4)]);
        let questions = build_clarify_questions(&extraction, &["low_intent_confidence".to_string()], 2);
        assert_eq!(questions.len(), 1);
        assert_eq!(questions[0].question_id, "generic_intent");
    }
}
