//! Review-queue rows: the audit trail for every candidate that did not become canonical.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::candidate::{CandidateValidation, EntryType};
use crate::evidence::EvidenceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Rejected,
    ReviewRequired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewReason {
    ValidationFailed,
    ConfidenceBelowHigh,
}

/// One line of `review_queue.jsonl`. Rows are only ever appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewRow {
    pub time: String,
    pub entry_type: EntryType,
    pub status: ReviewStatus,
    pub reason: ReviewReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missing: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence_errors: Option<Vec<String>>,
    /// The candidate exactly as it appeared in the queue.
    pub candidate: Value,
}

impl ReviewRow {
    pub fn rejected(
        time: String,
        entry_type: EntryType,
        validation: &CandidateValidation,
        candidate: Value,
    ) -> Self {
        Self {
            time,
            entry_type,
            status: ReviewStatus::Rejected,
            reason: ReviewReason::ValidationFailed,
            missing: Some(validation.missing.clone()),
            evidence_errors: Some(
                validation
                    .evidence_errors
                    .iter()
                    .map(EvidenceError::to_string)
                    .collect(),
            ),
            candidate,
        }
    }

    pub fn review_required(time: String, entry_type: EntryType, candidate: Value) -> Self {
        Self {
            time,
            entry_type,
            status: ReviewStatus::ReviewRequired,
            reason: ReviewReason::ConfidenceBelowHigh,
            missing: None,
            evidence_errors: None,
            candidate,
        }
    }
}
