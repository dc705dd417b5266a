//! Advisory context
//!
//! Deterministic rules over facts emit insights and action candidates.
//! Pure functions, no I/O: the same evidence pack always yields the same
//! advisory context. The LLM consumes these, it never produces them.

use crate::format::safe_float;
use crate::models::{
    ActionCandidate, AdvisoryContext, EvidencePack, Fact, HitlBand, Insight, Intent, Severity,
};
use serde_json::{json, Value};

fn find_first<'a>(facts: &'a [Fact], prefix: &str) -> Option<&'a Fact> {
    facts.iter().find(|fact| fact.fact_id.starts_with(prefix))
}

fn find_exact<'a>(facts: &'a [Fact], fact_id: &str) -> Option<&'a Fact> {
    facts.iter().find(|fact| fact.fact_id == fact_id)
}

fn fact_value(fact: Option<&Fact>) -> f64 {
    fact.map(|fact| safe_float(Some(&fact.value), 0.0)).unwrap_or(0.0)
}

struct InsightBuilder {
    insights: Vec<Insight>,
}

impl InsightBuilder {
    fn new() -> Self {
        Self { insights: Vec::new() }
    }

    fn add(
        &mut self,
        insight_id: &str,
        kind: &str,
        severity: Severity,
        message_seed: &str,
        supporting_fact_ids: Vec<String>,
    ) {
        if self.insights.iter().any(|item| item.insight_id == insight_id) {
            return;
        }
        self.insights.push(Insight {
            insight_id: insight_id.to_string(),
            kind: kind.to_string(),
            severity,
            message_seed: message_seed.to_string(),
            supporting_fact_ids: supporting_fact_ids
                .into_iter()
                .filter(|id| !id.is_empty())
                .collect(),
        });
    }

    fn has(&self, insight_id: &str) -> bool {
        self.insights.iter().any(|item| item.insight_id == insight_id)
    }
}

fn risk_appetite(facts: &[Fact], policy_flags: &serde_json::Map<String, Value>) -> String {
    let from_policy = policy_flags
        .get("risk_appetite")
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim()
        .to_lowercase();
    if matches!(from_policy.as_str(), "conservative" | "moderate" | "aggressive") {
        return from_policy;
    }
    let from_slot = find_exact(facts, "slot.risk_appetite")
        .and_then(|fact| fact.value.as_str())
        .unwrap_or("")
        .trim()
        .to_lowercase();
    if matches!(from_slot.as_str(), "conservative" | "moderate" | "aggressive") {
        from_slot
    } else {
        "unknown".to_string()
    }
}

/// Derive insights from the evidence pack.
pub fn build_insights(pack: &EvidencePack) -> Vec<Insight> {
    let facts = &pack.facts;
    let intent = pack.intent;
    let mut builder = InsightBuilder::new();

    if facts.is_empty() {
        builder.add(
            "insight.data_gap",
            "data_gap",
            Severity::High,
            "Không có dữ liệu công cụ khả dụng cho yêu cầu này.",
            Vec::new(),
        );
    }

    let net_fact = find_first(facts, "spend.net_cashflow.");
    let runway_fact = find_first(facts, "risk.runway_months.");
    let anomaly_count_fact = find_first(facts, "anomaly.flags_count.");
    let volatility_fact = find_first(facts, "risk.cashflow_volatility.");
    let overspend_fact = find_first(facts, "risk.overspend_propensity.");
    let goal_gap_fact = find_first(facts, "goal.gap_amount");
    let goal_feasible_fact = find_first(facts, "goal.feasible");
    let jar_ratio_fact = find_first(facts, "jar.top.ratio");
    let scenario_delta_fact = find_first(facts, "scenario.best_variant.delta");
    let scenario_best_fact = find_first(facts, "scenario.best_variant.name");
    let service_savings_fact = find_exact(facts, "kb.service_category.savings_deposit");
    let service_loan_fact = find_exact(facts, "kb.service_category.loans_credit");
    let service_cards_fact = find_exact(facts, "kb.service_category.cards_payments");
    let recurring_ratio_fact = find_first(facts, "recurring.fixed_cost_ratio.");

    let net_value = fact_value(net_fact);
    let runway_value = fact_value(runway_fact);
    let anomaly_count = fact_value(anomaly_count_fact);
    let volatility_value = fact_value(volatility_fact);
    let overspend_value = fact_value(overspend_fact);
    let goal_gap_value = fact_value(goal_gap_fact);
    let scenario_delta_value = fact_value(scenario_delta_fact);
    let appetite = risk_appetite(facts, &pack.policy_flags);

    if net_fact.is_some() && net_value < 0.0 && runway_fact.is_some() && runway_value > 0.0 && runway_value < 3.0 {
        builder.add(
            "insight.cashflow_pressure",
            "cashflow",
            Severity::High,
            "Dòng tiền ròng âm và runway dự phòng thấp.",
            vec![
                net_fact.map(|f| f.fact_id.clone()).unwrap_or_default(),
                runway_fact.map(|f| f.fact_id.clone()).unwrap_or_default(),
            ],
        );
    } else if net_fact.is_some() && net_value < 0.0 {
        builder.add(
            "insight.cashflow_negative",
            "cashflow",
            Severity::High,
            "Dòng tiền ròng đang âm.",
            vec![net_fact.map(|f| f.fact_id.clone()).unwrap_or_default()],
        );
    } else if net_fact.is_some() && net_value > 0.0 {
        builder.add(
            "insight.savings_capacity",
            "planning",
            Severity::Medium,
            "Dòng tiền ròng dương cho thấy còn dư địa để tiết kiệm.",
            vec![net_fact.map(|f| f.fact_id.clone()).unwrap_or_default()],
        );
    }

    // Runway under 3 months is a critical risk on its own.
    if runway_fact.is_some() && runway_value > 0.0 && runway_value < 3.0 && !builder.has("insight.cashflow_pressure") {
        builder.add(
            "insight.runway_low",
            "risk",
            Severity::High,
            "Runway dự phòng dưới 3 tháng.",
            vec![runway_fact.map(|f| f.fact_id.clone()).unwrap_or_default()],
        );
    }

    let mut anomaly_support: Vec<String> = Vec::new();
    if anomaly_count_fact.is_some() && anomaly_count >= 1.0 {
        anomaly_support.push(anomaly_count_fact.unwrap().fact_id.clone());
    }
    if volatility_fact.is_some() && volatility_value.abs() >= 0.35 {
        anomaly_support.push(volatility_fact.unwrap().fact_id.clone());
    }
    if overspend_fact.is_some() && overspend_value.abs() >= 0.30 {
        anomaly_support.push(overspend_fact.unwrap().fact_id.clone());
    }
    if !anomaly_support.is_empty() {
        builder.add(
            "insight.spend_anomaly",
            "risk",
            if anomaly_count >= 2.0 { Severity::High } else { Severity::Medium },
            "Phát hiện dấu hiệu biến động chi tiêu bất thường.",
            anomaly_support.clone(),
        );
    }

    let goal_infeasible = goal_feasible_fact
        .map(|fact| matches!(fact.value_text.trim().to_lowercase().as_str(), "chưa khả thi" | "false"))
        .unwrap_or(false);
    if goal_infeasible {
        let mut support = vec![goal_feasible_fact.unwrap().fact_id.clone()];
        if let Some(gap) = goal_gap_fact {
            support.push(gap.fact_id.clone());
        }
        builder.add(
            "insight.goal_gap",
            "planning",
            Severity::High,
            "Mục tiêu hiện tại chưa khả thi với thông số hiện có.",
            support,
        );
    } else if goal_gap_fact.is_some() && goal_gap_value > 0.0 {
        builder.add(
            "insight.goal_gap",
            "planning",
            Severity::Medium,
            "Còn khoảng thiếu để đạt mục tiêu tài chính.",
            vec![goal_gap_fact.unwrap().fact_id.clone()],
        );
    }

    if scenario_delta_fact.is_some() && scenario_delta_value > 0.0 {
        builder.add(
            "insight.scenario_upside",
            "scenario",
            Severity::Medium,
            "Kịch bản tối ưu cho thấy delta dương so với cơ sở.",
            vec![scenario_delta_fact.unwrap().fact_id.clone()],
        );
    } else if let Some(best) = scenario_best_fact {
        let mut support = vec![best.fact_id.clone()];
        if let Some(delta) = scenario_delta_fact {
            support.push(delta.fact_id.clone());
        }
        builder.add(
            "insight.scenario_no_upside",
            "scenario",
            Severity::High,
            "Kịch bản hiện tại chưa tạo upside rõ ràng so với cơ sở.",
            support,
        );
    }

    if let Some(jar) = jar_ratio_fact {
        builder.add(
            "insight.jar_focus",
            "planning",
            Severity::Low,
            "Có thông tin nhóm phân bổ chi tiêu ưu tiên để tối ưu ngân sách.",
            vec![jar.fact_id.clone()],
        );
    }

    if let Some(recurring) = recurring_ratio_fact {
        if fact_value(Some(recurring)) >= 0.5 {
            builder.add(
                "insight.fixed_cost_heavy",
                "planning",
                Severity::Medium,
                "Chi phí cố định chiếm tỉ trọng lớn trong tổng chi.",
                vec![recurring.fact_id.clone()],
            );
        }
    }

    let appetite_support: Vec<String> = find_exact(facts, "slot.risk_appetite")
        .map(|fact| vec![fact.fact_id.clone()])
        .unwrap_or_default();
    match appetite.as_str() {
        "conservative" => builder.add(
            "insight.risk_preference_conservative",
            "profile",
            Severity::Medium,
            "Người dùng ưu tiên an toàn và ổn định dòng tiền.",
            appetite_support,
        ),
        "moderate" => builder.add(
            "insight.risk_preference_moderate",
            "profile",
            Severity::Low,
            "Người dùng ưu tiên cân bằng giữa an toàn và tốc độ đạt mục tiêu.",
            appetite_support,
        ),
        "aggressive" => builder.add(
            "insight.risk_preference_aggressive",
            "profile",
            Severity::Low,
            "Người dùng chấp nhận rủi ro cao hơn để tối ưu mục tiêu tài chính.",
            appetite_support,
        ),
        _ => {
            if matches!(intent, Intent::Planning | Intent::Scenario | Intent::Invest) {
                builder.add(
                    "insight.risk_preference_unknown",
                    "profile",
                    Severity::Medium,
                    "Chưa có thông tin khẩu vị rủi ro, cần hỏi thêm để cá nhân hóa khuyến nghị.",
                    appetite_support,
                );
            }
        }
    }

    let mut service_support: Vec<String> = Vec::new();
    for fact in [service_savings_fact, service_loan_fact, service_cards_fact].into_iter().flatten() {
        service_support.push(fact.fact_id.clone());
    }
    if !service_support.is_empty() {
        builder.add(
            "insight.service_catalog_available",
            "service",
            Severity::Low,
            "Có dữ liệu kho dịch vụ ngân hàng để đề xuất theo tình huống.",
            service_support,
        );
    }
    if service_savings_fact.is_some()
        && (net_value > 0.0 || matches!(intent, Intent::Planning | Intent::Scenario))
    {
        let mut support = vec![service_savings_fact.unwrap().fact_id.clone()];
        if net_fact.is_some() && net_value > 0.0 {
            support.push(net_fact.unwrap().fact_id.clone());
        }
        builder.add(
            "insight.service_savings_option",
            "service",
            Severity::Medium,
            "Có thể cân nhắc gói tiết kiệm định kỳ hoặc tiết kiệm kỳ hạn để tăng kỷ luật tích lũy.",
            support,
        );
    }
    if service_loan_fact.is_some()
        && (net_value < 0.0 || goal_gap_value > 0.0 || overspend_value >= 0.30)
    {
        builder.add(
            "insight.service_loan_support",
            "service",
            Severity::Medium,
            "Nên đánh giá gói vay tái cơ cấu nợ hoặc khoản vay mục tiêu để giảm áp lực dòng tiền.",
            vec![service_loan_fact.unwrap().fact_id.clone()],
        );
    }
    if service_cards_fact.is_some()
        && (!anomaly_support.is_empty() || net_value < 0.0 || overspend_value >= 0.30)
    {
        let mut support = vec![service_cards_fact.unwrap().fact_id.clone()];
        support.extend(anomaly_support.clone());
        builder.add(
            "insight.service_spend_control",
            "service",
            Severity::Medium,
            "Nên bật hạn mức chi thẻ và cảnh báo giao dịch để kiểm soát nhóm chi lớn.",
            support,
        );
    }

    let education_only = pack
        .policy_flags
        .get("education_only")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if intent == Intent::Invest || education_only {
        builder.add(
            "insight.education_only",
            "compliance",
            Severity::High,
            "Nội dung tư vấn giới hạn trong giáo dục tài chính, không hướng dẫn giao dịch.",
            Vec::new(),
        );
    }

    let mut insights = builder.insights;
    insights.sort_by(|a, b| {
        a.severity
            .rank()
            .cmp(&b.severity.rank())
            .then_with(|| a.insight_id.cmp(&b.insight_id))
    });
    insights
}

//
// ================= Action Candidates =================
//

struct ActionBuilder {
    actions: Vec<ActionCandidate>,
}

impl ActionBuilder {
    fn new() -> Self {
        Self { actions: Vec::new() }
    }

    fn add(
        &mut self,
        action_id: &str,
        priority: u8,
        action_type: &str,
        params: Value,
        hitl_band: HitlBand,
        supporting_insight_ids: Vec<&str>,
    ) {
        if self.actions.iter().any(|item| item.action_id == action_id) {
            return;
        }
        self.actions.push(ActionCandidate {
            action_id: action_id.to_string(),
            priority,
            action_type: action_type.to_string(),
            params,
            hitl_band,
            supporting_insight_ids: supporting_insight_ids
                .into_iter()
                .map(|id| id.to_string())
                .collect(),
        });
    }
}

fn service_priorities(appetite: &str) -> (u8, u8, u8, u8) {
    // (savings, cards, loan, consult)
    match appetite {
        "conservative" => (15, 20, 24, 45),
        "moderate" => (20, 18, 19, 44),
        "aggressive" => (26, 20, 15, 42),
        _ => (22, 19, 18, 46),
    }
}

/// Derive action candidates from insights. Bands gate execution: `auto`
/// actions passed suitability, `confirm` needs the user, `block` never runs.
pub fn build_action_candidates(pack: &EvidencePack, insights: &[Insight]) -> Vec<ActionCandidate> {
    let intent = pack.intent;
    let has = |id: &str| insights.iter().any(|item| item.insight_id == id);
    let appetite = risk_appetite(&pack.facts, &pack.policy_flags);
    let (savings_priority, cards_priority, loan_priority, consult_priority) =
        service_priorities(&appetite);
    let mut builder = ActionBuilder::new();

    if has("insight.cashflow_pressure") || has("insight.cashflow_negative") {
        let support: Vec<&str> = ["insight.cashflow_pressure", "insight.cashflow_negative"]
            .into_iter()
            .filter(|id| has(id))
            .collect();
        builder.add(
            "stabilize_cashflow",
            10,
            "cashflow_control",
            json!({"window_days": 14}),
            HitlBand::Confirm,
            support,
        );
    }
    if has("insight.spend_anomaly") {
        builder.add(
            "review_anomaly",
            20,
            "anomaly_review",
            json!({"lookback_days": 90}),
            HitlBand::Auto,
            vec!["insight.spend_anomaly"],
        );
    }
    if has("insight.savings_capacity") {
        builder.add(
            "buffer_build",
            20,
            "savings_buffer",
            json!({"allocation_ratio": 0.2}),
            HitlBand::Confirm,
            vec!["insight.savings_capacity"],
        );
    }
    if has("insight.jar_focus") {
        builder.add(
            "jar_optimize",
            30,
            "allocation_optimize",
            json!({"method": "top_jar_rebalance"}),
            HitlBand::Confirm,
            vec!["insight.jar_focus"],
        );
    }
    if has("insight.goal_gap") {
        builder.add(
            "goal_replan",
            25,
            "goal_recalibration",
            json!({"recheck_weeks": 4}),
            HitlBand::Confirm,
            vec!["insight.goal_gap"],
        );
    }
    if has("insight.fixed_cost_heavy") {
        let top_category = find_first(&pack.facts, "recurring.top_category.");
        builder.add(
            "recurring_cap",
            22,
            "spend_cap",
            json!({
                "target": top_category.map(|fact| fact.fact_id.clone()),
                "cadence": "monthly",
            }),
            HitlBand::Confirm,
            vec!["insight.fixed_cost_heavy"],
        );
    }
    if has("insight.scenario_upside") {
        builder.add(
            "scenario_monitor",
            30,
            "scenario_tracking",
            json!({"monitor_weeks": 2}),
            HitlBand::Auto,
            vec!["insight.scenario_upside"],
        );
    }
    if has("insight.scenario_no_upside") {
        builder.add(
            "scenario_downside_guard",
            18,
            "scenario_risk_control",
            json!({"review_days": 14, "focus": "reduce_top_spend_bucket"}),
            HitlBand::Confirm,
            vec!["insight.scenario_no_upside"],
        );
    }
    if has("insight.risk_preference_unknown")
        && matches!(intent, Intent::Planning | Intent::Scenario | Intent::Invest)
    {
        builder.add(
            "capture_risk_appetite",
            8,
            "advisor_question",
            json!({
                "question": "Bạn ưu tiên mức rủi ro nào?",
                "options": ["thấp", "vừa", "cao"],
            }),
            HitlBand::Confirm,
            vec!["insight.risk_preference_unknown"],
        );
    }
    if has("insight.service_loan_support") {
        builder.add(
            "service_loan_healthcheck",
            loan_priority,
            "service_suggestion",
            json!({
                "service_family": "loans_credit",
                "examples": ["loan_restructure", "installment_conversion"],
                "risk_appetite": appetite,
            }),
            HitlBand::Confirm,
            vec!["insight.service_loan_support"],
        );
    }
    if has("insight.service_spend_control") {
        builder.add(
            "service_spend_control_setup",
            cards_priority,
            "service_suggestion",
            json!({
                "service_family": "cards_payments",
                "examples": ["card_spend_cap", "transaction_alert"],
                "risk_appetite": appetite,
            }),
            HitlBand::Confirm,
            vec!["insight.service_spend_control"],
        );
    }
    if has("insight.service_savings_option") {
        builder.add(
            "service_savings_setup",
            savings_priority,
            "service_suggestion",
            json!({
                "service_family": "savings_deposit",
                "examples": ["recurring_savings", "term_deposit"],
                "risk_appetite": appetite,
            }),
            HitlBand::Confirm,
            vec!["insight.service_savings_option"],
        );
    }
    if has("insight.service_catalog_available") {
        builder.add(
            "service_needs_consult",
            consult_priority,
            "service_suggestion",
            json!({"service_family": "catalog", "cadence_days": 7, "risk_appetite": appetite}),
            HitlBand::Confirm,
            vec!["insight.service_catalog_available"],
        );
    }
    if has("insight.education_only") || intent == Intent::Invest {
        builder.add(
            "education_only_guard",
            5,
            "compliance",
            json!({"execution_allowed": false}),
            HitlBand::Block,
            if has("insight.education_only") { vec!["insight.education_only"] } else { Vec::new() },
        );
    }

    if builder.actions.len() < 2 {
        builder.add(
            "review_budget_weekly",
            60,
            "budget_tracking",
            json!({"cadence": "weekly"}),
            HitlBand::Auto,
            Vec::new(),
        );
        builder.add(
            "refresh_data_2w",
            65,
            "refresh_data",
            json!({"cadence": "2w"}),
            HitlBand::Auto,
            Vec::new(),
        );
    }

    let mut actions = builder.actions;
    actions.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.action_id.cmp(&b.action_id)));
    actions
}

/// Assemble the advisory context from the evidence pack.
pub fn build_advisory_context(
    pack: &EvidencePack,
    policy_version: &str,
) -> (AdvisoryContext, Vec<String>) {
    let insights = build_insights(pack);
    let actions = build_action_candidates(pack, &insights);

    let mut reason_codes: Vec<String> = Vec::new();
    if insights.is_empty() {
        reason_codes.push("insights_empty".to_string());
    }
    if actions.is_empty() {
        reason_codes.push("action_candidates_empty".to_string());
    }

    let mut policy_flags = pack.policy_flags.clone();
    policy_flags.insert("policy_version".to_string(), Value::from(policy_version));

    let context = AdvisoryContext {
        schema_version: "advisory_context_v1".to_string(),
        intent: pack.intent,
        language: pack.language,
        facts: pack.facts.clone(),
        insights,
        actions,
        citations: pack.citations.clone(),
        policy_flags,
    };
    (context, reason_codes)
}
