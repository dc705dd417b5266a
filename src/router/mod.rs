//! Intent router
//!
//! Two stages: an LLM-backed structured extractor and a deterministic
//! planner policy that turns the extraction into a route decision
//! (tool bundle, clarify, overrides, timeframe).

use crate::models::IntentExtraction;
use crate::Result;
use async_trait::async_trait;
use unicode_normalization::UnicodeNormalization;

pub mod clarify;
pub mod extractor;
pub mod policy;
pub mod timeframe;

pub use extractor::LlmIntentExtractor;
pub use policy::build_route_decision;

/// Trait for structured intent extraction (LLM controlled)
#[async_trait]
pub trait IntentExtractor: Send + Sync {
    async fn extract(&self, prompt: &str, trace_id: &str) -> Result<IntentExtraction>;
}

/// Strip combining marks and fold Vietnamese specifics so keyword rules
/// match regardless of diacritics.
pub(crate) fn fold_accents(text: &str) -> String {
    text.nfd()
        .filter(|ch| !unicode_normalization::char::is_combining_mark(*ch))
        .collect::<String>()
        .replace('đ', "d")
        .replace('Đ', "D")
        .to_lowercase()
}

/// Fixed-extraction mock for development & testing
pub struct MockIntentExtractor {
    extraction: IntentExtraction,
}

impl MockIntentExtractor {
    pub fn new(extraction: IntentExtraction) -> Self {
        Self { extraction }
    }
}

#[async_trait]
impl IntentExtractor for MockIntentExtractor {
    async fn extract(&self, _prompt: &str, _trace_id: &str) -> Result<IntentExtraction> {
        Ok(self.extraction.clone())
    }
}

/// Always-failing mock; exercises the rule-only degradation path.
pub struct FailingIntentExtractor;

#[async_trait]
impl IntentExtractor for FailingIntentExtractor {
    async fn extract(&self, _prompt: &str, _trace_id: &str) -> Result<IntentExtraction> {
        Err(crate::error::AgentError::RouterExtractionError(
            "extractor unavailable".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fold_accents() {
        assert_eq!(fold_accents("Tóm tắt chi tiêu"), "tom tat chi tieu");
        assert_eq!(fold_accents("đầu tư"), "dau tu");
        assert_eq!(fold_accents("Mua Nhà"), "mua nha");
    }
}
