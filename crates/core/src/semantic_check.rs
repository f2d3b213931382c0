use serde::Deserialize;
use tracing::{debug, warn};

use crate::text::{extract_code_block, strip_think_tags};

const FAIL_TOKEN: &str = "不通过";
const PASS_TOKEN: &str = "通过";
const SQL_MARKERS: &[&str] = &["SELECT ", " FROM ", " WHERE ", " GROUP BY ", " ORDER BY "];

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SemanticVerdict {
    Passed,
    Failed { reason: String },
}

impl SemanticVerdict {
    pub fn is_passed(&self) -> bool {
        matches!(self, Self::Passed)
    }
}

#[derive(Debug, Deserialize)]
struct VerdictPayload {
    is_passed: bool,
    #[serde(default)]
    reason: Option<String>,
}

/// Reads a semantic consistency answer.
///
/// A JSON object with an `is_passed` field wins. Otherwise the localized
/// pass/fail tokens decide, and an answer that echoes SQL never passes.
pub fn detect_semantic_verdict(output: &str) -> SemanticVerdict {
    let cleaned = strip_think_tags(output);
    if cleaned.is_empty() {
        warn!(event_name = "semantic_check.empty", "empty semantic check answer treated as failure");
        return SemanticVerdict::Failed { reason: "semantic check returned no answer".to_string() };
    }

    if let Ok(payload) = serde_json::from_str::<VerdictPayload>(extract_code_block(cleaned)) {
        debug!(event_name = "semantic_check.json", is_passed = payload.is_passed, "json verdict");
        return if payload.is_passed {
            SemanticVerdict::Passed
        } else {
            SemanticVerdict::Failed {
                reason: payload
                    .reason
                    .filter(|reason| !reason.trim().is_empty())
                    .unwrap_or_else(|| cleaned.to_string()),
            }
        };
    }

    legacy_verdict(cleaned)
}

fn legacy_verdict(text: &str) -> SemanticVerdict {
    let failed = || SemanticVerdict::Failed { reason: text.to_string() };

    if text.contains(FAIL_TOKEN) {
        return failed();
    }
    if !text.contains(PASS_TOKEN) {
        warn!(
            event_name = "semantic_check.unrecognized",
            "semantic check answer has no verdict token"
        );
        return failed();
    }

    let upper = text.to_uppercase();
    if SQL_MARKERS.iter().any(|marker| upper.contains(marker)) {
        warn!(
            event_name = "semantic_check.sql_echo",
            "semantic check answer contains sql, treated as failure"
        );
        return failed();
    }
    SemanticVerdict::Passed
}
