//! Candidate queues → authoritative maps (promotion stage).
//!
//! A promotion run is a two-phase commit:
//!
//! 1. [`plan_promotion`] reads both maps and both queues, classifies every candidate
//!    and builds the new maps plus the review-queue delta, all in memory.
//! 2. [`PromotionPlan::commit`] writes both maps, appends the review rows in one batch,
//!    and truncates both queues.
//!
//! Any structural error (unreadable file, malformed JSON/JSONL) surfaces in phase 1,
//! before a single byte has been written.
//!
//! Classification per candidate:
//! - required fields or evidence invalid → `rejected` / `validation_failed`
//! - otherwise confidence other than `high` → `review_required` / `confidence_below_high`
//! - otherwise → approved, provenance stamped, upserted by composite key (last write wins)
//!
//! Approved entries keep the candidate's JSON as submitted (plus `status` and
//! `provenance`); entries already in a map are written back untouched.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::candidate::{validate_candidate, Candidate, CompositeKey, Confidence, EntryType};
use crate::config::{KbLayout, PromotionConfig};
use crate::error::{KbError, KbResult};
use crate::review::ReviewRow;
use crate::store::{
    append_jsonl, read_jsonl, truncate_file, AuthoritativeMap, MapEntry, QueueRecord,
};

pub const APPROVED_STATUS: &str = "approved";

/// Per-queue counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromoteResult {
    pub promoted: usize,
    pub review_required: usize,
    pub rejected: usize,
}

impl PromoteResult {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Promoted => self.promoted += 1,
            Outcome::ReviewRequired => self.review_required += 1,
            Outcome::Rejected => self.rejected += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.promoted + self.review_required + self.rejected
    }
}

/// What a promotion run reports; the reasons live in the review queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromotionSummary {
    pub name: PromoteResult,
    pub data: PromoteResult,
}

impl PromotionSummary {
    pub fn for_type(&self, entry_type: EntryType) -> &PromoteResult {
        match entry_type {
            EntryType::Name => &self.name,
            EntryType::Data => &self.data,
        }
    }

    fn for_type_mut(&mut self, entry_type: EntryType) -> &mut PromoteResult {
        match entry_type {
            EntryType::Name => &mut self.name,
            EntryType::Data => &mut self.data,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Promoted,
    ReviewRequired,
    Rejected,
}

// =============================================================================
// Classification
// =============================================================================

/// Classifies candidates into one map, accumulating review rows.
struct Promoter<'a> {
    repo_root: &'a Path,
    config: &'a PromotionConfig,
    rows: Vec<ReviewRow>,
}

impl<'a> Promoter<'a> {
    fn promote_queue(
        &mut self,
        entry_type: EntryType,
        queue_path: &Path,
        records: Vec<QueueRecord>,
        map: &mut AuthoritativeMap,
    ) -> KbResult<PromoteResult> {
        let mut result = PromoteResult::default();
        let mut promoted_this_run: HashSet<CompositeKey> = HashSet::new();

        for record in records {
            let raw = Value::Object(record.value.clone());
            let candidate =
                Candidate::from_value(entry_type, raw).map_err(|e| KbError::InvalidRecord {
                    context: format!("{}:{}", queue_path.display(), record.line),
                    message: e.to_string(),
                })?;
            let outcome = self.promote_single(candidate, record, map, &mut promoted_this_run);
            result.record(outcome);
        }
        Ok(result)
    }

    fn promote_single(
        &mut self,
        candidate: Candidate,
        record: QueueRecord,
        map: &mut AuthoritativeMap,
        promoted_this_run: &mut HashSet<CompositeKey>,
    ) -> Outcome {
        let entry_type = candidate.entry_type();
        let key = candidate.composite_key();
        let now = self.config.timestamp();

        let validation = validate_candidate(&candidate, self.repo_root);
        if !validation.is_valid() {
            tracing::debug!(
                %entry_type,
                key = %key,
                line = record.line,
                missing = ?validation.missing,
                evidence_errors = validation.evidence_errors.len(),
                "candidate rejected"
            );
            self.rows.push(ReviewRow::rejected(
                now,
                entry_type,
                &validation,
                Value::Object(record.value),
            ));
            return Outcome::Rejected;
        }

        if candidate.confidence_level() != Some(Confidence::High) {
            tracing::debug!(
                %entry_type,
                key = %key,
                confidence = %candidate.confidence,
                "candidate needs review"
            );
            self.rows.push(ReviewRow::review_required(
                now,
                entry_type,
                Value::Object(record.value),
            ));
            return Outcome::ReviewRequired;
        }

        let approved = approve(record.value, self.config, &now);
        if map.upsert(MapEntry::from_record(entry_type, approved)).is_some() {
            if promoted_this_run.contains(&key) {
                tracing::warn!(
                    %entry_type,
                    key = %key,
                    line = record.line,
                    "composite key promoted twice in one run; last candidate wins"
                );
            } else {
                tracing::debug!(%entry_type, key = %key, "replacing existing map entry");
            }
        }
        promoted_this_run.insert(key);
        Outcome::Promoted
    }
}

/// Mark a validated candidate record approved and stamp its provenance.
///
/// `analyst` and `created_at` are only filled when absent (or `null`); `promoted_at` is
/// always `now`. Every other key, evidence included, is kept as submitted.
pub fn approve(
    mut record: Map<String, Value>,
    config: &PromotionConfig,
    now: &str,
) -> Map<String, Value> {
    record.insert("status".into(), APPROVED_STATUS.into());
    let mut provenance = match record.remove("provenance") {
        Some(Value::Object(provenance)) => provenance,
        _ => Map::new(),
    };
    fill_if_absent(&mut provenance, "analyst", &config.analyst);
    fill_if_absent(&mut provenance, "created_at", now);
    provenance.insert("promoted_at".into(), now.into());
    record.insert("provenance".into(), Value::Object(provenance));
    record
}

fn fill_if_absent(map: &mut Map<String, Value>, key: &str, value: &str) {
    if matches!(map.get(key), None | Some(Value::Null)) {
        map.insert(key.into(), value.into());
    }
}

// =============================================================================
// Plan + commit
// =============================================================================

/// Everything a promotion run will write, computed but not yet persisted.
#[derive(Debug, Clone)]
pub struct PromotionPlan {
    name_map: AuthoritativeMap,
    data_map: AuthoritativeMap,
    review_rows: Vec<ReviewRow>,
    summary: PromotionSummary,
    layout: KbLayout,
}

impl PromotionPlan {
    pub fn summary(&self) -> PromotionSummary {
        self.summary
    }

    pub fn review_rows(&self) -> &[ReviewRow] {
        &self.review_rows
    }

    pub fn map(&self, entry_type: EntryType) -> &AuthoritativeMap {
        match entry_type {
            EntryType::Name => &self.name_map,
            EntryType::Data => &self.data_map,
        }
    }

    /// Queue files that will be left empty.
    pub fn queues_to_clear(&self) -> Vec<PathBuf> {
        EntryType::ALL
            .iter()
            .map(|t| self.layout.candidates_path(*t).to_path_buf())
            .collect()
    }

    /// Phase 2: persist maps, append review rows, drain queues.
    pub fn commit(self) -> KbResult<PromotionSummary> {
        for entry_type in EntryType::ALL {
            self.map(entry_type).persist(self.layout.map_path(entry_type))?;
        }
        append_jsonl(&self.layout.review_queue, &self.review_rows)?;
        for queue in self.queues_to_clear() {
            truncate_file(&queue)?;
        }

        tracing::info!(
            name_promoted = self.summary.name.promoted,
            name_review_required = self.summary.name.review_required,
            name_rejected = self.summary.name.rejected,
            data_promoted = self.summary.data.promoted,
            data_review_required = self.summary.data.review_required,
            data_rejected = self.summary.data.rejected,
            name_entries = self.name_map.len(),
            data_entries = self.data_map.len(),
            "promotion run committed"
        );
        Ok(self.summary)
    }
}

/// Phase 1: read every input and classify both queues in memory.
pub fn plan_promotion(layout: &KbLayout, config: &PromotionConfig) -> KbResult<PromotionPlan> {
    let generated_by = &config.generated_by;
    let mut name_map = AuthoritativeMap::load(&layout.name_map, EntryType::Name, generated_by)?;
    let mut data_map = AuthoritativeMap::load(&layout.data_map, EntryType::Data, generated_by)?;
    let name_records = read_jsonl(&layout.name_candidates)?;
    let data_records = read_jsonl(&layout.data_candidates)?;

    let mut promoter = Promoter {
        repo_root: &layout.repo_root,
        config,
        rows: Vec::new(),
    };
    let mut summary = PromotionSummary::default();

    for (entry_type, records, map) in [
        (EntryType::Name, name_records, &mut name_map),
        (EntryType::Data, data_records, &mut data_map),
    ] {
        let queue_path = layout.candidates_path(entry_type);
        *summary.for_type_mut(entry_type) =
            promoter.promote_queue(entry_type, queue_path, records, map)?;
    }

    Ok(PromotionPlan {
        name_map,
        data_map,
        review_rows: promoter.rows,
        summary,
        layout: layout.clone(),
    })
}

/// Run a full promotion: plan, then commit.
pub fn promote_candidates(
    layout: &KbLayout,
    config: &PromotionConfig,
) -> KbResult<PromotionSummary> {
    plan_promotion(layout, config)?.commit()
}
