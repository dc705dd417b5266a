//! Evidence pack construction
//!
//! Projects each tool's payload through a static path map into typed facts
//! with stable ids. Fact ids embed the tool's effective timeframe, so
//! `anomaly.latest_change_point.45d` from two processes over the same data
//! is the same fact. The pack is the sole source of numeric truth for the
//! response; unknown payload fields stay in the raw tool output for audit
//! and are never shown to the synthesizer.

use crate::format::{fmt_money, fmt_pct, fmt_signed_money, safe_float, safe_int};
use crate::models::{EvidencePack, Fact, Intent, Language, ToolResult};
use serde_json::Value;
use std::collections::HashMap;

const ANOMALY_FLAG_PRIORITY: &[(&str, u8)] = &[
    ("change_point", 0),
    ("category_spike", 1),
    ("spend_outlier", 2),
    ("spend_drift", 3),
    ("abnormal_spend", 4),
    ("income_drop", 5),
    ("low_balance_risk", 6),
];
const ANOMALY_REASON_MAX: usize = 5;

struct FactBuilder {
    facts: Vec<Fact>,
}

impl FactBuilder {
    fn new() -> Self {
        Self { facts: Vec::new() }
    }

    #[allow(clippy::too_many_arguments)]
    fn add(
        &mut self,
        fact_id: impl Into<String>,
        label: &str,
        value: Value,
        value_text: impl Into<String>,
        unit: &str,
        timeframe: &str,
        source_tool: &str,
        source_path: &str,
    ) {
        self.facts.push(Fact {
            fact_id: fact_id.into(),
            label: label.to_string(),
            value,
            value_text: value_text.into(),
            unit: unit.to_string(),
            timeframe: timeframe.to_string(),
            source_tool: source_tool.to_string(),
            source_path: source_path.to_string(),
        });
    }

    fn has(&self, fact_id: &str) -> bool {
        self.facts.iter().any(|fact| fact.fact_id == fact_id)
    }
}

fn sanitize_timeframe(raw: Option<&Value>, default: &str) -> String {
    let text = raw
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim()
        .to_lowercase();
    if text.is_empty() {
        return default.to_string();
    }
    let cleaned: String = text
        .chars()
        .filter(|ch| ch.is_alphanumeric() || matches!(ch, '_' | '-'))
        .collect();
    if cleaned.is_empty() {
        default.to_string()
    } else {
        cleaned
    }
}

fn avg(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

//
// ================= Per-tool Extractors =================
//

fn extract_spend_facts(outputs: &HashMap<String, Value>, facts: &mut FactBuilder) {
    let Some(summary) = outputs.get("spend_analytics_v1").filter(|v| v.is_object()) else {
        return;
    };
    let timeframe = sanitize_timeframe(summary.get("range"), "30d");
    let total_income = safe_float(summary.get("total_income"), 0.0);
    let total_spend = safe_float(summary.get("total_spend"), 0.0);
    let net_cashflow = safe_float(summary.get("net_cashflow"), total_income - total_spend);

    facts.add(
        format!("spend.total_income.{}", timeframe),
        "Tổng thu nhập",
        Value::from(total_income),
        fmt_money(total_income),
        "VND",
        &timeframe,
        "spend_analytics_v1",
        "total_income",
    );
    facts.add(
        format!("spend.total_spend.{}", timeframe),
        "Tổng chi tiêu",
        Value::from(total_spend),
        fmt_money(total_spend),
        "VND",
        &timeframe,
        "spend_analytics_v1",
        "total_spend",
    );
    facts.add(
        format!("spend.net_cashflow.{}", timeframe),
        "Dòng tiền ròng",
        Value::from(net_cashflow),
        fmt_signed_money(net_cashflow),
        "VND",
        &timeframe,
        "spend_analytics_v1",
        "net_cashflow",
    );
}

fn extract_forecast_facts(outputs: &HashMap<String, Value>, facts: &mut FactBuilder) {
    let Some(forecast) = outputs.get("cashflow_forecast_v1").filter(|v| v.is_object()) else {
        return;
    };
    let points = forecast
        .get("points")
        .or_else(|| forecast.get("forecast_points"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    if points.is_empty() {
        return;
    }
    let income: Vec<f64> = points
        .iter()
        .map(|point| safe_float(point.get("income_estimate"), 0.0))
        .collect();
    let spend: Vec<f64> = points
        .iter()
        .map(|point| safe_float(point.get("spend_estimate"), 0.0))
        .collect();
    let net: Vec<f64> = points
        .iter()
        .map(|point| safe_float(point.get("p50"), 0.0))
        .collect();

    facts.add(
        "forecast.avg_income.weekly_12",
        "Thu nhập dự báo trung bình/kỳ",
        Value::from(avg(&income)),
        fmt_money(avg(&income)),
        "VND",
        "weekly_12",
        "cashflow_forecast_v1",
        "points[].income_estimate",
    );
    facts.add(
        "forecast.avg_spend.weekly_12",
        "Chi tiêu dự báo trung bình/kỳ",
        Value::from(avg(&spend)),
        fmt_money(avg(&spend)),
        "VND",
        "weekly_12",
        "cashflow_forecast_v1",
        "points[].spend_estimate",
    );
    facts.add(
        "forecast.avg_net_p50.weekly_12",
        "Net P50 dự báo trung bình/kỳ",
        Value::from(avg(&net)),
        fmt_signed_money(avg(&net)),
        "VND",
        "weekly_12",
        "cashflow_forecast_v1",
        "points[].p50",
    );
}

fn extract_risk_facts(outputs: &HashMap<String, Value>, facts: &mut FactBuilder) {
    let Some(risk) = outputs.get("risk_profile_non_investment_v1").filter(|v| v.is_object())
    else {
        return;
    };
    let risk_band = risk
        .get("risk_band")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let runway = safe_float(risk.get("emergency_runway_months"), 0.0);
    let volatility = safe_float(risk.get("cashflow_volatility"), 0.0);
    let overspend = safe_float(risk.get("overspend_propensity"), 0.0);
    let lookback_days = safe_int(risk.get("lookback_days"), 180).clamp(60, 720);
    let timeframe = format!("{}d", lookback_days);

    facts.add(
        format!("risk.risk_band.{}", timeframe),
        "Mức rủi ro",
        Value::from(risk_band.clone()),
        risk_band,
        "",
        &timeframe,
        "risk_profile_non_investment_v1",
        "risk_band",
    );
    facts.add(
        format!("risk.runway_months.{}", timeframe),
        "Runway dự phòng",
        Value::from(runway),
        format!("{:.2}", runway),
        "months",
        &timeframe,
        "risk_profile_non_investment_v1",
        "emergency_runway_months",
    );
    facts.add(
        format!("risk.cashflow_volatility.{}", timeframe),
        "Biến động dòng tiền",
        Value::from(volatility),
        fmt_pct(volatility),
        "pct",
        &timeframe,
        "risk_profile_non_investment_v1",
        "cashflow_volatility",
    );
    facts.add(
        format!("risk.overspend_propensity.{}", timeframe),
        "Xác suất vượt chi",
        Value::from(overspend),
        fmt_pct(overspend),
        "pct",
        &timeframe,
        "risk_profile_non_investment_v1",
        "overspend_propensity",
    );
}

fn flag_priority(flag: &str) -> u8 {
    ANOMALY_FLAG_PRIORITY
        .iter()
        .find(|(name, _)| *name == flag)
        .map(|(_, priority)| *priority)
        .unwrap_or(99)
}

fn anomaly_change_points(anomaly: &Value) -> Vec<String> {
    let external = anomaly
        .get("external_engines")
        .and_then(|engines| engines.get("ruptures_pelt"))
        .and_then(|ruptures| ruptures.get("change_points"))
        .and_then(Value::as_array);
    let raw = external
        .or_else(|| anomaly.get("change_points").and_then(Value::as_array))
        .cloned()
        .unwrap_or_default();

    let mut points: Vec<String> = Vec::new();
    for item in raw {
        let text = item.as_str().unwrap_or("").trim().to_string();
        if !text.is_empty() && !points.contains(&text) {
            points.push(text);
        }
    }
    points
}

fn anomaly_flag_reason(flag: &str, anomaly: &Value) -> String {
    let engines = anomaly.get("external_engines");
    match flag {
        "change_point" => {
            let points = anomaly_change_points(anomaly);
            match points.last() {
                Some(latest) => format!(
                    "Phát hiện điểm đổi chế độ chi tiêu, mốc gần nhất là {}.",
                    latest
                ),
                None => "Phát hiện dấu hiệu đổi chế độ chi tiêu theo chuỗi thời gian.".to_string(),
            }
        }
        "category_spike" => {
            let top = anomaly
                .get("category_spikes")
                .and_then(Value::as_array)
                .and_then(|spikes| spikes.first())
                .cloned()
                .unwrap_or(Value::Null);
            let category = top
                .get("category_name")
                .and_then(Value::as_str)
                .unwrap_or("Unknown");
            let delta_share = safe_float(top.get("delta_share"), 0.0);
            let recent = safe_float(top.get("recent_amount"), 0.0);
            if category != "Unknown" || delta_share > 0.0 {
                format!(
                    "Danh mục {} tăng tỉ trọng {} với mức chi {}.",
                    category,
                    fmt_pct(delta_share),
                    fmt_money(recent)
                )
            } else {
                "Có danh mục chi tiêu tăng tỉ trọng bất thường so với nền.".to_string()
            }
        }
        "spend_outlier" => {
            let probability = safe_float(
                engines
                    .and_then(|e| e.get("pyod_ecod"))
                    .and_then(|e| e.get("outlier_probability")),
                0.0,
            );
            if probability > 0.0 {
                format!(
                    "Mẫu chi tiêu gần nhất nằm trong nhóm ngoại lệ với xác suất {}.",
                    fmt_pct(probability)
                )
            } else {
                "Mẫu chi tiêu gần nhất được đánh dấu là ngoại lệ.".to_string()
            }
        }
        "spend_drift" => {
            let drift_count = engines
                .and_then(|e| e.get("river_adwin"))
                .and_then(|e| e.get("drift_points"))
                .and_then(Value::as_array)
                .map(|points| points.len())
                .unwrap_or(0);
            if drift_count > 0 {
                format!(
                    "Chuỗi chi tiêu xuất hiện dấu hiệu drift với {} mốc thay đổi.",
                    drift_count
                )
            } else {
                "Chuỗi chi tiêu xuất hiện dấu hiệu drift so với nền.".to_string()
            }
        }
        "abnormal_spend" => {
            let z_score = safe_float(
                anomaly.get("abnormal_spend").and_then(|a| a.get("z_score")),
                0.0,
            );
            if z_score > 0.0 {
                format!(
                    "Mức chi tiêu 7 ngày gần đây lệch mạnh so với trung vị nền (z={:.2}).",
                    z_score
                )
            } else {
                "Mức chi tiêu gần đây lệch đáng kể so với nền lịch sử.".to_string()
            }
        }
        "income_drop" => {
            let drop_pct = safe_float(
                anomaly.get("income_drop").and_then(|a| a.get("drop_pct")),
                0.0,
            );
            if drop_pct > 0.0 {
                format!("Thu nhập trung bình giảm {} so với giai đoạn nền.", fmt_pct(drop_pct))
            } else {
                "Thu nhập trung bình giảm đáng kể so với giai đoạn nền.".to_string()
            }
        }
        "low_balance_risk" => {
            let runway_days = safe_float(
                anomaly
                    .get("low_balance_risk")
                    .and_then(|a| a.get("runway_days_estimate")),
                0.0,
            );
            if runway_days > 0.0 {
                format!(
                    "Runway ước tính còn {:.2} ngày, dưới ngưỡng an toàn 90 ngày.",
                    runway_days
                )
            } else {
                "Runway ước tính dưới ngưỡng an toàn 90 ngày.".to_string()
            }
        }
        _ => "Phát hiện tín hiệu bất thường cần theo dõi thêm để đánh giá rủi ro.".to_string(),
    }
}

fn extract_anomaly_facts(outputs: &HashMap<String, Value>, facts: &mut FactBuilder) {
    let Some(anomaly) = outputs.get("anomaly_signals_v1").filter(|v| v.is_object()) else {
        return;
    };
    let mut flags: Vec<String> = Vec::new();
    if let Some(raw) = anomaly.get("flags").and_then(Value::as_array) {
        for item in raw {
            let flag = item.as_str().unwrap_or("").trim().to_lowercase();
            if !flag.is_empty() && !flags.contains(&flag) {
                flags.push(flag);
            }
        }
    }
    let mut prioritized = flags.clone();
    prioritized.sort_by_key(|flag| (flag_priority(flag), flag.clone()));

    let lookback_days = safe_int(anomaly.get("lookback_days"), 90).clamp(30, 365);
    let timeframe = format!("{}d", lookback_days);

    facts.add(
        format!("anomaly.flags_count.{}", timeframe),
        "Số cảnh báo bất thường",
        Value::from(flags.len() as i64),
        flags.len().to_string(),
        "",
        &timeframe,
        "anomaly_signals_v1",
        "flags",
    );
    if let Some(top) = prioritized.first() {
        facts.add(
            format!("anomaly.top_flag.{}", timeframe),
            "Cảnh báo chính",
            Value::from(top.clone()),
            top.clone(),
            "",
            &timeframe,
            "anomaly_signals_v1",
            "flags[0]",
        );
    }

    let highlights: Vec<String> = prioritized.iter().take(ANOMALY_REASON_MAX).cloned().collect();
    if !highlights.is_empty() {
        facts.add(
            format!("anomaly.top_flags.{}", timeframe),
            "Cảnh báo nổi bật",
            Value::from(highlights.clone()),
            highlights.join(", "),
            "",
            &timeframe,
            "anomaly_signals_v1",
            "flags",
        );
    }
    for (index, flag) in highlights.iter().enumerate() {
        facts.add(
            format!("anomaly.flag_reason.{}.{}", index + 1, timeframe),
            &format!("Lý do cảnh báo {}", index + 1),
            Value::from(flag.clone()),
            anomaly_flag_reason(flag, anomaly),
            "",
            &timeframe,
            "anomaly_signals_v1",
            &format!("flags::{}", flag),
        );
    }

    let change_points = anomaly_change_points(anomaly);
    if !change_points.is_empty() {
        facts.add(
            format!("anomaly.change_points.{}", timeframe),
            "Các mốc ngày biến động chi tiêu",
            Value::from(change_points.clone()),
            change_points.join(", "),
            "",
            &timeframe,
            "anomaly_signals_v1",
            "external_engines.ruptures_pelt.change_points",
        );
        let latest = change_points.last().cloned().unwrap_or_default();
        facts.add(
            format!("anomaly.latest_change_point.{}", timeframe),
            "Ngày bất thường gần nhất",
            Value::from(latest.clone()),
            latest,
            "",
            &timeframe,
            "anomaly_signals_v1",
            "external_engines.ruptures_pelt.change_points[-1]",
        );
    }
}

fn insufficient_status(payload: &Value) -> Option<(String, Vec<String>)> {
    let status = payload.get("status").and_then(Value::as_str)?.trim().to_lowercase();
    if !status.starts_with("insufficient_") {
        return None;
    }
    let reasons = payload
        .get("reason_codes")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(|code| code.trim().to_string())
                .filter(|code| !code.is_empty())
                .collect()
        })
        .unwrap_or_default();
    Some((status, reasons))
}

fn extract_goal_facts(outputs: &HashMap<String, Value>, facts: &mut FactBuilder) {
    let Some(goal) = outputs.get("goal_feasibility_v1").filter(|v| v.is_object()) else {
        return;
    };
    if let Some((status, reasons)) = insufficient_status(goal) {
        let reason_text = if reasons.is_empty() { status.clone() } else { reasons.join(", ") };
        facts.add(
            "goal.status",
            "Trạng thái dữ liệu goal feasibility",
            Value::from(status.clone()),
            status,
            "",
            "",
            "goal_feasibility_v1",
            "status",
        );
        facts.add(
            "goal.reason_codes",
            "Lý do thiếu dữ liệu goal feasibility",
            Value::from(reasons),
            reason_text,
            "",
            "",
            "goal_feasibility_v1",
            "reason_codes",
        );
        return;
    }

    let target_amount = safe_float(goal.get("target_amount"), 0.0);
    let horizon_months = safe_int(goal.get("horizon_months"), 0);
    let required_monthly = safe_float(goal.get("required_monthly_saving"), 0.0);
    let feasible = goal.get("feasible").and_then(Value::as_bool).unwrap_or(false);
    let gap_amount = safe_float(goal.get("gap_amount"), 0.0);

    if target_amount > 0.0 {
        facts.add(
            "goal.target_amount",
            "Mục tiêu tiết kiệm",
            Value::from(target_amount),
            fmt_money(target_amount),
            "VND",
            &format!("{}m", horizon_months.max(0)),
            "goal_feasibility_v1",
            "target_amount",
        );
    }
    if horizon_months > 0 {
        facts.add(
            "goal.horizon_months",
            "Kỳ hạn mục tiêu",
            Value::from(horizon_months),
            horizon_months.to_string(),
            "months",
            &format!("{}m", horizon_months),
            "goal_feasibility_v1",
            "horizon_months",
        );
    }
    if required_monthly > 0.0 {
        facts.add(
            "goal.required_monthly_saving",
            "Tiết kiệm tối thiểu mỗi tháng",
            Value::from(required_monthly),
            fmt_money(required_monthly),
            "VND",
            "",
            "goal_feasibility_v1",
            "required_monthly_saving",
        );
    }
    facts.add(
        "goal.feasible",
        "Tính khả thi mục tiêu",
        Value::from(feasible),
        if feasible { "khả thi" } else { "chưa khả thi" },
        "",
        "",
        "goal_feasibility_v1",
        "feasible",
    );
    if gap_amount > 0.0 {
        facts.add(
            "goal.gap_amount",
            "Khoảng thiếu so với mục tiêu",
            Value::from(gap_amount),
            fmt_money(gap_amount),
            "VND",
            "",
            "goal_feasibility_v1",
            "gap_amount",
        );
    }
}

fn extract_recurring_facts(outputs: &HashMap<String, Value>, facts: &mut FactBuilder) {
    let Some(recurring) = outputs.get("recurring_cashflow_detect_v1").filter(|v| v.is_object())
    else {
        return;
    };
    let fixed_cost_ratio = safe_float(recurring.get("fixed_cost_ratio"), 0.0);
    if fixed_cost_ratio <= 0.0 {
        return;
    }
    let lookback_months = safe_int(recurring.get("lookback_months"), 6).clamp(3, 24);
    let timeframe = format!("{}m", lookback_months);
    facts.add(
        format!("recurring.fixed_cost_ratio.{}", timeframe),
        "Tỷ lệ chi phí cố định",
        Value::from(fixed_cost_ratio),
        fmt_pct(fixed_cost_ratio),
        "pct",
        &timeframe,
        "recurring_cashflow_detect_v1",
        "fixed_cost_ratio",
    );
    if let Some(top_category) = recurring
        .get("top_recurring")
        .and_then(Value::as_array)
        .and_then(|rows| rows.first())
    {
        let name = top_category
            .get("category_name")
            .and_then(Value::as_str)
            .unwrap_or("Unknown");
        let amount = safe_float(top_category.get("monthly_amount"), 0.0);
        facts.add(
            format!("recurring.top_category.{}", timeframe),
            "Khoản chi định kỳ lớn nhất",
            Value::from(name),
            if amount > 0.0 {
                format!("{} ({}/tháng)", name, fmt_money(amount))
            } else {
                name.to_string()
            },
            "",
            &timeframe,
            "recurring_cashflow_detect_v1",
            "top_recurring[0]",
        );
    }
}

fn extract_jar_facts(outputs: &HashMap<String, Value>, facts: &mut FactBuilder) {
    let Some(allocation) = outputs.get("jar_allocation_suggest_v1").filter(|v| v.is_object())
    else {
        return;
    };
    if let Some((status, reasons)) = insufficient_status(allocation) {
        let reason_text = if reasons.is_empty() { status.clone() } else { reasons.join(", ") };
        facts.add(
            "jar.status",
            "Trạng thái dữ liệu jar allocation",
            Value::from(status.clone()),
            status,
            "",
            "",
            "jar_allocation_suggest_v1",
            "status",
        );
        facts.add(
            "jar.reason_codes",
            "Lý do thiếu dữ liệu jar allocation",
            Value::from(reasons),
            reason_text,
            "",
            "",
            "jar_allocation_suggest_v1",
            "reason_codes",
        );
        return;
    }
    let Some(first) = allocation
        .get("allocations")
        .and_then(Value::as_array)
        .and_then(|rows| rows.first())
        .filter(|row| row.is_object())
    else {
        return;
    };
    let jar_name = first.get("jar_name").and_then(Value::as_str).unwrap_or("Unknown");
    let ratio = safe_float(first.get("ratio"), 0.0);
    let amount = safe_float(first.get("amount"), 0.0);

    facts.add(
        "jar.top.name",
        "Nhóm phân bổ ưu tiên",
        Value::from(jar_name),
        jar_name,
        "",
        "",
        "jar_allocation_suggest_v1",
        "allocations[0].jar_name",
    );
    if ratio > 0.0 {
        facts.add(
            "jar.top.ratio",
            "Tỷ lệ phân bổ nhóm ưu tiên",
            Value::from(ratio),
            fmt_pct(ratio),
            "pct",
            "",
            "jar_allocation_suggest_v1",
            "allocations[0].ratio",
        );
    }
    if amount > 0.0 {
        facts.add(
            "jar.top.amount",
            "Số tiền phân bổ nhóm ưu tiên",
            Value::from(amount),
            fmt_money(amount),
            "VND",
            "",
            "jar_allocation_suggest_v1",
            "allocations[0].amount",
        );
    }
}

fn scenario_payload(raw: &Value) -> Value {
    if raw.get("scenario_comparison").is_some() || raw.get("best_variant_by_goal").is_some() {
        return raw.clone();
    }
    for key in ["payload", "result", "data", "output"] {
        if let Some(nested) = raw.get(key) {
            if nested.get("scenario_comparison").is_some()
                || nested.get("best_variant_by_goal").is_some()
            {
                return nested.clone();
            }
        }
    }
    raw.clone()
}

fn extract_scenario_facts(outputs: &HashMap<String, Value>, facts: &mut FactBuilder) {
    let Some(raw) = outputs.get("what_if_scenario_v1").filter(|v| v.is_object()) else {
        return;
    };
    let scenario = scenario_payload(raw);
    let base_total = safe_float(scenario.get("base_total_net_p50"), 0.0);
    let best_variant = scenario
        .get("best_variant_by_goal")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();

    facts.add(
        "scenario.base_total_net_p50",
        "Tổng net P50 cơ sở",
        Value::from(base_total),
        fmt_money(base_total),
        "VND",
        "",
        "what_if_scenario_v1",
        "base_total_net_p50",
    );
    if best_variant.is_empty() {
        return;
    }
    facts.add(
        "scenario.best_variant.name",
        "Kịch bản tốt nhất",
        Value::from(best_variant.clone()),
        best_variant.clone(),
        "",
        "",
        "what_if_scenario_v1",
        "best_variant_by_goal",
    );
    if let Some(rows) = scenario.get("scenario_comparison").and_then(Value::as_array) {
        for row in rows {
            if row.get("name").and_then(Value::as_str) != Some(best_variant.as_str()) {
                continue;
            }
            let delta = safe_float(row.get("delta_vs_base"), 0.0);
            facts.add(
                "scenario.best_variant.delta",
                "Delta kịch bản tốt nhất so với cơ sở",
                Value::from(delta),
                fmt_signed_money(delta),
                "VND",
                "",
                "what_if_scenario_v1",
                "scenario_comparison[].delta_vs_base",
            );
            break;
        }
    }
}

fn extract_guard_facts(outputs: &HashMap<String, Value>, facts: &mut FactBuilder) {
    let Some(guard) = outputs.get("suitability_guard_v1").filter(|v| v.is_object()) else {
        return;
    };
    let allow = guard.get("allow").and_then(Value::as_bool).unwrap_or(true);
    let decision = guard
        .get("decision")
        .and_then(Value::as_str)
        .unwrap_or("allow")
        .to_string();
    facts.add(
        "policy.suitability.allow",
        "Trạng thái policy cho phép",
        Value::from(allow),
        if allow { "allow" } else { "deny" },
        "",
        "",
        "suitability_guard_v1",
        "allow",
    );
    facts.add(
        "policy.suitability.decision",
        "Quyết định suitability",
        Value::from(decision.clone()),
        decision,
        "",
        "",
        "suitability_guard_v1",
        "decision",
    );
}

fn extract_slot_facts(slots: &serde_json::Map<String, Value>, facts: &mut FactBuilder) {
    let target_amount = [
        "target_amount_vnd",
        "target_amount",
        "goal_target_amount",
        "savings_goal_vnd",
        "goal_amount",
        "savings_target_vnd",
    ]
    .iter()
    .map(|key| safe_float(slots.get(*key), 0.0))
    .find(|value| *value > 0.0)
    .unwrap_or(0.0);
    if target_amount > 0.0 {
        facts.add(
            "slot.target_amount_vnd",
            "Mục tiêu số tiền từ yêu cầu",
            Value::from(target_amount),
            fmt_money(target_amount),
            "VND",
            "",
            "intent_extraction",
            "slots.target_amount_vnd",
        );
    }

    let horizon = [
        "horizon_months",
        "goal_horizon_months",
        "time_horizon_months",
        "duration_months",
        "saving_horizon_months",
    ]
    .iter()
    .map(|key| safe_int(slots.get(*key), 0))
    .find(|value| *value > 0)
    .unwrap_or(0);
    if horizon > 0 {
        facts.add(
            "slot.horizon_months",
            "Kỳ hạn từ yêu cầu",
            Value::from(horizon),
            horizon.to_string(),
            "months",
            "",
            "intent_extraction",
            "slots.horizon_months",
        );
    }

    let risk_appetite = slots
        .get("risk_appetite")
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim()
        .to_lowercase();
    if matches!(risk_appetite.as_str(), "conservative" | "moderate" | "aggressive") {
        let label = match risk_appetite.as_str() {
            "conservative" => "thận trọng",
            "moderate" => "cân bằng",
            _ => "chấp nhận rủi ro cao",
        };
        facts.add(
            "slot.risk_appetite",
            "Khẩu vị rủi ro từ yêu cầu",
            Value::from(risk_appetite.clone()),
            label,
            "",
            "",
            "intent_extraction",
            "slots.risk_appetite",
        );
    }

    for key in ["income_delta_pct", "spend_delta_pct"] {
        let Some(raw) = slots.get(key) else { continue };
        let mut parsed = safe_float(Some(raw), 0.0);
        if parsed.abs() > 1.0 {
            parsed /= 100.0;
        }
        if parsed == 0.0 {
            continue;
        }
        facts.add(
            format!("slot.{}", key),
            &format!("{} từ yêu cầu", key),
            Value::from(parsed),
            fmt_pct(parsed),
            "pct",
            "",
            "intent_extraction",
            &format!("slots.{}", key),
        );
    }
    for key in ["income_delta_amount_vnd", "spend_delta_amount_vnd"] {
        let value = safe_float(slots.get(key), 0.0);
        if value <= 0.0 {
            continue;
        }
        facts.add(
            format!("slot.{}", key),
            &format!("{} từ yêu cầu", key),
            Value::from(value),
            fmt_money(value),
            "VND",
            "",
            "intent_extraction",
            &format!("slots.{}", key),
        );
    }
}

//
// ================= Knowledge Base =================
//

fn extract_citations(kb: &Value) -> Vec<String> {
    let mut citations: Vec<String> = Vec::new();
    if let Some(matches) = kb.get("matches").and_then(Value::as_array) {
        for item in matches {
            let citation = item
                .get("citation")
                .and_then(Value::as_str)
                .unwrap_or("")
                .trim()
                .to_string();
            if !citation.is_empty() && !citations.contains(&citation) {
                citations.push(citation);
            }
        }
    }
    citations
}

fn extract_kb_service_facts(kb: &Value, facts: &mut FactBuilder) {
    let Some(matches) = kb.get("matches").and_then(Value::as_array) else {
        return;
    };
    if matches.is_empty() {
        return;
    }
    let mut corpus = String::new();
    for item in matches {
        for key in ["text", "snippet", "context", "citation"] {
            if let Some(value) = item.get(key).and_then(Value::as_str) {
                corpus.push_str(&value.to_lowercase());
                corpus.push(' ');
            }
        }
    }
    if corpus.trim().is_empty() {
        return;
    }

    let service_patterns: &[(&str, &str, &[&str])] = &[
        (
            "savings_deposit",
            "Savings and deposit service category available",
            &["saving", "tiet kiem", "deposit", "term deposit", "recurring savings", "goal bucket"],
        ),
        (
            "loans_credit",
            "Loan and credit service category available",
            &["loan", "vay", "overdraft", "debt consolidation", "installment"],
        ),
        (
            "cards_payments",
            "Card and payment control service category available",
            &["credit card", "debit card", "auto debit", "payment", "spend cap"],
        ),
        (
            "service_playbook",
            "Service advisory playbook available",
            &["advisory playbook", "service suggestion policy", "mapping guide"],
        ),
    ];

    let mut matched = 0i64;
    for (suffix, label, terms) in service_patterns {
        if !terms.iter().any(|term| corpus.contains(term)) {
            continue;
        }
        let fact_id = format!("kb.service_category.{}", suffix);
        if facts.has(&fact_id) {
            continue;
        }
        facts.add(
            fact_id,
            label,
            Value::from(true),
            "available",
            "",
            "",
            "retrieve_from_aws_kb",
            "matches[].text",
        );
        matched += 1;
    }
    if matched > 0 && !facts.has("kb.service_category.count") {
        facts.add(
            "kb.service_category.count",
            "Number of service categories supported by KB context",
            Value::from(matched),
            matched.to_string(),
            "",
            "",
            "retrieve_from_aws_kb",
            "matches[].text",
        );
    }
}

//
// ================= Pack Assembly =================
//

fn required_prefixes(intent: Intent) -> &'static [&'static str] {
    match intent {
        Intent::Summary => &["spend.", "forecast."],
        Intent::Risk => &["risk."],
        Intent::Planning => &["goal.", "spend."],
        Intent::Scenario => &["scenario."],
        Intent::Invest | Intent::OutOfScope => &["policy."],
    }
}

fn snapshot_bounds(results: &[ToolResult]) -> (Option<String>, Option<String>) {
    let mut stamps: Vec<String> = results
        .iter()
        .filter(|result| result.is_ok())
        .filter_map(|result| result.payload.get("sql_snapshot_ts"))
        .filter_map(Value::as_str)
        .map(|stamp| stamp.to_string())
        .collect();
    stamps.sort();
    (stamps.last().cloned(), stamps.first().cloned())
}

/// Build the evidence pack from tool results, KB matches and router slots.
/// Returns the pack plus data-sufficiency reason codes.
pub fn build_evidence_pack(
    intent: Intent,
    language: Language,
    results: &[ToolResult],
    kb: &Value,
    policy_flags: serde_json::Map<String, Value>,
    slots: &serde_json::Map<String, Value>,
) -> (EvidencePack, Vec<String>) {
    let outputs: HashMap<String, Value> = results
        .iter()
        .filter(|result| result.is_ok())
        .map(|result| (result.base_name.clone(), result.payload.clone()))
        .collect();

    let mut builder = FactBuilder::new();
    extract_spend_facts(&outputs, &mut builder);
    extract_forecast_facts(&outputs, &mut builder);
    extract_risk_facts(&outputs, &mut builder);
    extract_anomaly_facts(&outputs, &mut builder);
    extract_goal_facts(&outputs, &mut builder);
    extract_recurring_facts(&outputs, &mut builder);
    extract_jar_facts(&outputs, &mut builder);
    extract_scenario_facts(&outputs, &mut builder);
    extract_guard_facts(&outputs, &mut builder);
    extract_slot_facts(slots, &mut builder);
    extract_kb_service_facts(kb, &mut builder);

    let mut reason_codes: Vec<String> = Vec::new();
    let prefixes = required_prefixes(intent);
    let has_required = builder
        .facts
        .iter()
        .any(|fact| prefixes.iter().any(|prefix| fact.fact_id.starts_with(prefix)));
    if !has_required {
        reason_codes.push("insufficient_facts".to_string());
    }

    let (snapshot_newest, snapshot_oldest) = snapshot_bounds(results);
    let pack = EvidencePack {
        schema_version: "evidence_pack_v1".to_string(),
        intent,
        language,
        facts: builder.facts,
        citations: extract_citations(kb),
        policy_flags,
        snapshot_newest,
        snapshot_oldest,
    };
    (pack, reason_codes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ToolStatus;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn ok_result(tool: &str, payload: Value) -> ToolResult {
        ToolResult {
            call_id: Uuid::new_v4(),
            base_name: tool.to_string(),
            status: ToolStatus::Ok,
            payload,
            error: None,
            elapsed_ms: 5,
            started_at: Utc::now(),
        }
    }

    fn failed_result(tool: &str) -> ToolResult {
        ToolResult {
            call_id: Uuid::new_v4(),
            base_name: tool.to_string(),
            status: ToolStatus::ServerError,
            payload: Value::Null,
            error: Some("unreachable".to_string()),
            elapsed_ms: 0,
            started_at: Utc::now(),
        }
    }

    #[test]
    fn test_spend_fact_ids_embed_timeframe() {
        let results = vec![ok_result(
            "spend_analytics_v1",
            json!({
                "range": "24d",
                "total_income": 38_200_000,
                "total_spend": 14_200_000,
                "sql_snapshot_ts": "2026-08-01T00:00:00Z",
            }),
        )];
        let (pack, reasons) = build_evidence_pack(
            Intent::Summary,
            Language::Vi,
            &results,
            &Value::Null,
            serde_json::Map::new(),
            &serde_json::Map::new(),
        );
        let net = pack.fact("spend.net_cashflow.24d").unwrap();
        assert_eq!(net.value_text, "+24,000,000");
        assert_eq!(net.timeframe, "24d");
        assert!(pack.fact("spend.total_spend.24d").is_some());
        assert_eq!(pack.snapshot_newest.as_deref(), Some("2026-08-01T00:00:00Z"));
        assert!(reasons.is_empty());
    }

    #[test]
    fn test_fact_id_derivation_is_stable() {
        let payload = json!({"range": "30d", "total_income": 1, "total_spend": 1});
        let build = || {
            let results = vec![ok_result("spend_analytics_v1", payload.clone())];
            build_evidence_pack(
                Intent::Summary,
                Language::Vi,
                &results,
                &Value::Null,
                serde_json::Map::new(),
                &serde_json::Map::new(),
            )
            .0
        };
        let first: Vec<String> = build().facts.into_iter().map(|f| f.fact_id).collect();
        let second: Vec<String> = build().facts.into_iter().map(|f| f.fact_id).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_anomaly_change_points_and_reasons() {
        let results = vec![ok_result(
            "anomaly_signals_v1",
            json!({
                "lookback_days": 45,
                "flags": ["category_spike", "change_point"],
                "external_engines": {
                    "ruptures_pelt": {"change_points": ["2026-07-02", "2026-07-18"]}
                },
                "category_spikes": [
                    {"category_name": "Dining", "delta_share": 0.18, "recent_amount": 5_200_000}
                ],
            }),
        )];
        let (pack, _) = build_evidence_pack(
            Intent::Risk,
            Language::Vi,
            &results,
            &Value::Null,
            serde_json::Map::new(),
            &serde_json::Map::new(),
        );
        // change_point outranks category_spike.
        assert_eq!(pack.fact("anomaly.top_flag.45d").unwrap().value_text, "change_point");
        assert_eq!(
            pack.fact("anomaly.latest_change_point.45d").unwrap().value_text,
            "2026-07-18"
        );
        let reason = pack.fact("anomaly.flag_reason.1.45d").unwrap();
        assert!(reason.value_text.contains("2026-07-18"));
        assert_eq!(pack.fact("anomaly.flags_count.45d").unwrap().value_text, "2");
    }

    #[test]
    fn test_goal_facts_and_insufficient_path() {
        let results = vec![ok_result(
            "goal_feasibility_v1",
            json!({
                "target_amount": 1_500_000_000.0,
                "horizon_months": 60,
                "required_monthly_saving": 20_000_000.0,
                "feasible": false,
                "gap_amount": 350_000_000.0,
            }),
        )];
        let (pack, _) = build_evidence_pack(
            Intent::Planning,
            Language::Vi,
            &results,
            &Value::Null,
            serde_json::Map::new(),
            &serde_json::Map::new(),
        );
        assert_eq!(pack.fact("goal.gap_amount").unwrap().value_text, "350,000,000");
        assert_eq!(pack.fact("goal.feasible").unwrap().value_text, "chưa khả thi");

        let sparse = vec![ok_result(
            "goal_feasibility_v1",
            json!({"status": "insufficient_history", "reason_codes": ["too_few_txns"]}),
        )];
        let (pack, _) = build_evidence_pack(
            Intent::Planning,
            Language::Vi,
            &sparse,
            &Value::Null,
            serde_json::Map::new(),
            &serde_json::Map::new(),
        );
        assert_eq!(pack.fact("goal.status").unwrap().value_text, "insufficient_history");
        assert_eq!(pack.fact("goal.reason_codes").unwrap().value_text, "too_few_txns");
    }

    #[test]
    fn test_failed_tools_contribute_no_facts() {
        let results = vec![
            failed_result("spend_analytics_v1"),
            failed_result("cashflow_forecast_v1"),
        ];
        let (pack, reasons) = build_evidence_pack(
            Intent::Summary,
            Language::Vi,
            &results,
            &Value::Null,
            serde_json::Map::new(),
            &serde_json::Map::new(),
        );
        assert!(pack.facts.is_empty());
        assert!(reasons.contains(&"insufficient_facts".to_string()));
    }

    #[test]
    fn test_risk_lookback_clamped_into_fact_id() {
        let results = vec![ok_result(
            "risk_profile_non_investment_v1",
            json!({
                "risk_band": "medium",
                "emergency_runway_months": 2.4,
                "cashflow_volatility": 0.41,
                "overspend_propensity": 0.33,
                "lookback_days": 30,
            }),
        )];
        let (pack, _) = build_evidence_pack(
            Intent::Risk,
            Language::Vi,
            &results,
            &Value::Null,
            serde_json::Map::new(),
            &serde_json::Map::new(),
        );
        // 30 clamps up to the 60-day floor.
        assert!(pack.fact("risk.runway_months.60d").is_some());
        assert_eq!(pack.fact("risk.runway_months.60d").unwrap().value_text, "2.40");
    }

    #[test]
    fn test_slot_and_kb_facts() {
        let mut slots = serde_json::Map::new();
        slots.insert("target_amount_vnd".to_string(), json!(1_500_000_000.0));
        slots.insert("horizon_months".to_string(), json!(60));
        slots.insert("risk_appetite".to_string(), json!("moderate"));
        let kb = json!({
            "matches": [
                {"citation": "policy_savings.md", "text": "recurring savings and term deposit offers"},
                {"citation": "policy_savings.md", "text": "duplicate citation"},
            ]
        });
        let (pack, _) = build_evidence_pack(
            Intent::Planning,
            Language::Vi,
            &[],
            &kb,
            serde_json::Map::new(),
            &slots,
        );
        assert_eq!(pack.citations, vec!["policy_savings.md"]);
        assert_eq!(pack.fact("slot.target_amount_vnd").unwrap().value_text, "1,500,000,000");
        assert_eq!(pack.fact("slot.risk_appetite").unwrap().value_text, "cân bằng");
        assert!(pack.fact("kb.service_category.savings_deposit").is_some());
        assert_eq!(pack.fact("kb.service_category.count").unwrap().value_text, "1");
    }

    #[test]
    fn test_scenario_nested_payload_unwrap() {
        let results = vec![ok_result(
            "what_if_scenario_v1",
            json!({
                "result": {
                    "base_total_net_p50": 120_000_000.0,
                    "best_variant_by_goal": "cut_spend_10pct",
                    "scenario_comparison": [
                        {"name": "base", "delta_vs_base": 0},
                        {"name": "cut_spend_10pct", "delta_vs_base": 14_000_000.0}
                    ]
                }
            }),
        )];
        let (pack, _) = build_evidence_pack(
            Intent::Scenario,
            Language::Vi,
            &results,
            &Value::Null,
            serde_json::Map::new(),
            &serde_json::Map::new(),
        );
        assert_eq!(
            pack.fact("scenario.best_variant.name").unwrap().value_text,
            "cut_spend_10pct"
        );
        assert_eq!(
            pack.fact("scenario.best_variant.delta").unwrap().value_text,
            "+14,000,000"
        );
    }
}
