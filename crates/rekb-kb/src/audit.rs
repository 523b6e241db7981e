//! Read-only audit of the authoritative maps (and the protocol message map/schema).
//!
//! Promotion only admits valid entries, but the map files are also edited by hand.
//! The audit re-runs the promotion rules (same required fields, same
//! [`validate_evidence`]) over what is on disk and reports `entry[i]:<error>` strings.
//! Audit findings are never fatal; only unreadable/undecodable files are.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::candidate::{Candidate, CompositeKey, Confidence, DecodeError, EntryType};
use crate::config::KbLayout;
use crate::error::{KbError, KbResult};
use crate::evidence::{check_source, text_of, validate_evidence, EvidenceList};
use crate::store::MapDocument;

pub const AUDIT_NAME_FIELDS: [&str; 8] = [
    "binary",
    "address",
    "original_name",
    "new_name",
    "kind",
    "confidence",
    "evidence",
    "status",
];

pub const AUDIT_DATA_FIELDS: [&str; 7] = [
    "binary",
    "address",
    "new_label",
    "data_type",
    "confidence",
    "evidence",
    "status",
];

pub const MESSAGE_MAP_FIELDS: [&str; 6] =
    ["scope", "code", "name", "confidence", "source", "status"];

pub const MESSAGE_SCHEMA_FIELDS: [&str; 5] = ["scope", "code", "name", "confidence", "evidence"];

/// Protocol messages that must be covered by both the message map and the schema.
pub const CORE_MESSAGES: [(&str, &str); 25] = [
    ("server", "SM_LOGIN"),
    ("server", "SM_SET_WAIT_PORT"),
    ("server", "SM_GET_PEER_ADDRESS"),
    ("server", "SM_CONNECT_TO_PEER"),
    ("server", "SM_FILE_SEARCH"),
    ("server", "SM_SEARCH_ROOM"),
    ("server", "SM_EXACT_FILE_SEARCH"),
    ("server", "SM_SEARCH_USER_FILES"),
    ("server", "SM_MESSAGE_USER"),
    ("server", "SM_MESSAGE_ACKED"),
    ("server", "SM_GET_USER_STATS"),
    ("server", "SM_GET_USER_STATUS"),
    ("server", "SM_SHARED_FOLDERS_FILES"),
    ("server", "SM_DOWNLOAD_SPEED"),
    ("server", "SM_UPLOAD_SPEED"),
    ("peer", "PM_GET_SHARED_FILE_LIST"),
    ("peer", "PM_SHARED_FILE_LIST"),
    ("peer", "PM_FILE_SEARCH_REQUEST"),
    ("peer", "PM_FILE_SEARCH_RESULT"),
    ("peer", "PM_TRANSFER_REQUEST"),
    ("peer", "PM_TRANSFER_RESPONSE"),
    ("peer", "PM_QUEUE_UPLOAD"),
    ("peer", "PM_UPLOAD_PLACE_IN_LINE"),
    ("peer", "PM_UPLOAD_FAILED"),
    ("peer", "PM_UPLOAD_DENIED"),
];

pub const CORE_HIGH_CONFIDENCE_MIN: usize = 18;
pub const CORE_MEDIUM_CONFIDENCE_MAX: usize = 7;

/// Findings per artifact; an empty list means clean.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditReport {
    pub name_map: Vec<String>,
    pub data_map: Vec<String>,
    pub message_map: Vec<String>,
    pub message_schema: Vec<String>,
}

impl AuditReport {
    pub fn has_errors(&self) -> bool {
        self.error_count() > 0
    }

    pub fn error_count(&self) -> usize {
        self.name_map.len()
            + self.data_map.len()
            + self.message_map.len()
            + self.message_schema.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRequest {
    pub repo_root: PathBuf,
    pub name_map: PathBuf,
    pub data_map: PathBuf,
    pub message_map: Option<PathBuf>,
    pub message_schema: Option<PathBuf>,
}

impl AuditRequest {
    pub fn from_layout(layout: &KbLayout) -> Self {
        Self {
            repo_root: layout.repo_root.clone(),
            name_map: layout.name_map.clone(),
            data_map: layout.data_map.clone(),
            message_map: None,
            message_schema: None,
        }
    }

    pub fn with_message_map(mut self, path: impl Into<PathBuf>) -> Self {
        self.message_map = Some(path.into());
        self
    }

    pub fn with_message_schema(mut self, path: impl Into<PathBuf>) -> Self {
        self.message_schema = Some(path.into());
        self
    }
}

/// Audit every configured artifact.
pub fn validate_maps(request: &AuditRequest) -> KbResult<AuditReport> {
    let mut report = AuditReport {
        name_map: validate_map_file(&request.name_map, EntryType::Name, &request.repo_root)?,
        data_map: validate_map_file(&request.data_map, EntryType::Data, &request.repo_root)?,
        ..AuditReport::default()
    };
    if let Some(path) = &request.message_map {
        report.message_map = validate_message_map(path, &request.repo_root)?;
    }
    if let Some(path) = &request.message_schema {
        report.message_schema = validate_message_schema(path, &request.repo_root)?;
    }

    tracing::info!(
        name_map = report.name_map.len(),
        data_map = report.data_map.len(),
        message_map = report.message_map.len(),
        message_schema = report.message_schema.len(),
        "audit finished"
    );
    Ok(report)
}

// =============================================================================
// Authoritative maps
// =============================================================================

fn audit_fields(entry_type: EntryType) -> &'static [&'static str] {
    match entry_type {
        EntryType::Name => &AUDIT_NAME_FIELDS,
        EntryType::Data => &AUDIT_DATA_FIELDS,
    }
}

/// Audit one map file in on-disk entry order. A missing file has no entries.
pub fn validate_map_file(
    path: &Path,
    entry_type: EntryType,
    repo_root: &Path,
) -> KbResult<Vec<String>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let text = fs::read_to_string(path).map_err(|e| KbError::io(path, e))?;
    let doc: MapDocument = serde_json::from_str(&text).map_err(|source| KbError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(validate_map_document(&doc, entry_type, repo_root))
}

pub fn validate_map_document(
    doc: &MapDocument,
    entry_type: EntryType,
    repo_root: &Path,
) -> Vec<String> {
    let mut errors = Vec::new();
    let mut seen: HashMap<CompositeKey, usize> = HashMap::new();

    for (index, raw) in doc.entries.iter().enumerate() {
        let entry = match Candidate::from_value(entry_type, raw.clone()) {
            Ok(entry) => entry,
            Err(DecodeError::NotAnObject) => {
                errors.push(format!("entry[{index}]:invalid_type"));
                continue;
            }
            Err(DecodeError::Provenance(_)) => {
                errors.push(format!("entry[{index}]:invalid_provenance"));
                continue;
            }
        };

        for err in validate_entry(&entry, audit_fields(entry_type), repo_root) {
            errors.push(format!("entry[{index}]:{err}"));
        }

        let key = entry.composite_key();
        if let Some(first) = seen.get(&key) {
            errors.push(format!("entry[{index}]:duplicate_key:{key}:first_at_entry[{first}]"));
        } else {
            seen.insert(key, index);
        }
    }
    errors
}

/// Required fields, confidence vocabulary, and evidence for one entry.
pub fn validate_entry(entry: &Candidate, required: &[&str], repo_root: &Path) -> Vec<String> {
    let mut errors: Vec<String> = entry
        .missing_fields(required)
        .into_iter()
        .map(|field| format!("missing_field:{field}"))
        .collect();

    if let Some(err) = confidence_error(&entry.confidence) {
        errors.push(err);
    }

    errors.extend(
        validate_evidence(&entry.evidence, repo_root)
            .iter()
            .map(ToString::to_string),
    );
    errors
}

/// Blank confidence is a missing field, not an invalid one.
fn confidence_error(raw: &str) -> Option<String> {
    let normalized = raw.trim().to_ascii_lowercase();
    if normalized.is_empty() || Confidence::parse(&normalized).is_some() {
        None
    } else {
        Some(format!("invalid_confidence:{normalized}"))
    }
}

// =============================================================================
// Protocol message map / schema
// =============================================================================

fn is_core(scope: &str, name: &str) -> bool {
    CORE_MESSAGES
        .iter()
        .any(|(s, n)| *s == scope && *n == name)
}

/// Running `(scope, name)` coverage and core-message confidence tallies.
#[derive(Debug, Default)]
struct CoreCoverage {
    seen: BTreeSet<(String, String)>,
    high: usize,
    medium: usize,
    low: usize,
}

impl CoreCoverage {
    fn observe_key(&mut self, index: usize, scope: &str, name: &str) -> Option<String> {
        if scope.is_empty() || name.is_empty() {
            return None;
        }
        if self.seen.insert((scope.to_string(), name.to_string())) {
            None
        } else {
            Some(format!("entry[{index}]:duplicate:{scope}:{name}"))
        }
    }

    /// Count a core row's confidence; low confidence on a core message is itself an error.
    fn tally(&mut self, index: usize, scope: &str, name: &str, confidence: &str) -> Option<String> {
        if !is_core(scope, name) {
            return None;
        }
        match Confidence::parse(confidence)? {
            Confidence::High => self.high += 1,
            Confidence::Medium => self.medium += 1,
            Confidence::Low => {
                self.low += 1;
                return Some(format!("entry[{index}]:low_confidence_not_allowed_for_core"));
            }
        }
        None
    }

    fn finish(self) -> Vec<String> {
        let core: BTreeSet<(String, String)> = CORE_MESSAGES
            .iter()
            .map(|(s, n)| (s.to_string(), n.to_string()))
            .collect();

        let mut errors: Vec<String> = core
            .difference(&self.seen)
            .map(|(scope, name)| format!("missing_core_message:{scope}:{name}"))
            .collect();

        let covered = core.intersection(&self.seen).count();
        if covered != CORE_MESSAGES.len() {
            errors.push(format!("core_coverage_count_invalid:{covered}"));
        }
        if self.high < CORE_HIGH_CONFIDENCE_MIN {
            errors.push(format!("core_high_confidence_below_threshold:{}", self.high));
        }
        if self.medium > CORE_MEDIUM_CONFIDENCE_MAX {
            errors.push(format!("core_medium_confidence_above_threshold:{}", self.medium));
        }
        if self.low != 0 {
            errors.push(format!("core_low_confidence_must_be_zero:{}", self.low));
        }
        errors
    }
}

/// Audit `message_map.csv` (`scope,code,name,confidence,source,status[,notes]`).
pub fn validate_message_map(path: &Path, repo_root: &Path) -> KbResult<Vec<String>> {
    if !path.exists() {
        return Ok(vec![format!("missing_file:{}", path.display())]);
    }

    let csv_err = |source| KbError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .map_err(csv_err)?;

    let mut errors = Vec::new();
    let mut coverage = CoreCoverage::default();

    for (index, row) in reader.deserialize::<HashMap<String, String>>().enumerate() {
        let row = row.map_err(csv_err)?;
        let cell = |field: &str| row.get(field).map(|v| v.trim()).unwrap_or("");

        for field in MESSAGE_MAP_FIELDS {
            if cell(field).is_empty() {
                errors.push(format!("entry[{index}]:missing_field:{field}"));
            }
        }

        let (scope, name) = (cell("scope"), cell("name"));
        errors.extend(coverage.observe_key(index, scope, name));

        let code = cell("code");
        if code.parse::<i64>().is_err() {
            errors.push(format!("entry[{index}]:invalid_code:{code}"));
        }

        let confidence = cell("confidence").to_ascii_lowercase();
        if let Some(err) = confidence_error(&confidence) {
            errors.push(format!("entry[{index}]:{err}"));
        }
        if let Some(err) = check_source(cell("source"), repo_root) {
            errors.push(format!("entry[{index}]:{err}"));
        }

        errors.extend(coverage.tally(index, scope, name, &confidence));
    }

    errors.extend(coverage.finish());
    Ok(errors)
}

/// Audit the derived message schema JSON (`{"messages": [...]}`).
pub fn validate_message_schema(path: &Path, repo_root: &Path) -> KbResult<Vec<String>> {
    if !path.exists() {
        return Ok(vec![format!("missing_file:{}", path.display())]);
    }
    let text = fs::read_to_string(path).map_err(|e| KbError::io(path, e))?;
    let payload: Value = serde_json::from_str(&text).map_err(|source| KbError::Json {
        path: path.to_path_buf(),
        source,
    })?;

    let messages = match payload.get("messages") {
        None => Vec::new(),
        Some(Value::Array(items)) => items.clone(),
        Some(_) => return Ok(vec!["invalid_schema:messages_not_list".to_string()]),
    };

    let mut errors = Vec::new();
    let mut coverage = CoreCoverage::default();

    for (index, entry) in messages.iter().enumerate() {
        let Value::Object(fields) = entry else {
            errors.push(format!("entry[{index}]:invalid_type"));
            continue;
        };

        for field in MESSAGE_SCHEMA_FIELDS {
            if value_is_blank(fields.get(field)) {
                errors.push(format!("entry[{index}]:missing_field:{field}"));
            }
        }

        let text_field = |field: &str| {
            fields
                .get(field)
                .map(|v| text_of(v).trim().to_string())
                .unwrap_or_default()
        };
        let (scope, name) = (text_field("scope"), text_field("name"));
        errors.extend(coverage.observe_key(index, &scope, &name));

        let confidence = text_field("confidence").to_ascii_lowercase();
        if let Some(err) = confidence_error(&confidence) {
            errors.push(format!("entry[{index}]:{err}"));
        }

        let evidence = fields
            .get("evidence")
            .cloned()
            .map(EvidenceList::from_value)
            .unwrap_or_default();
        for err in validate_evidence(&evidence, repo_root) {
            errors.push(format!("entry[{index}]:{err}"));
        }

        errors.extend(coverage.tally(index, &scope, &name, &confidence));
    }

    errors.extend(coverage.finish());
    Ok(errors)
}

fn value_is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Array(items)) => items.is_empty(),
        Some(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::Evidence;
    use serde_json::json;
    use tempfile::tempdir;

    fn approved_name(address: &str, source: &str) -> Value {
        let candidate = Candidate::name_rename(
            "SoulseekQt",
            address,
            "FUN_1",
            "Server_Login",
            "function_rename",
        );
        let mut value = candidate
            .with_confidence("high")
            .with_evidence(vec![Evidence::new("xref", source)])
            .to_value();
        value["status"] = json!("approved");
        value
    }

    fn doc(entries: Vec<Value>) -> MapDocument {
        let doc = json!({"version": 1, "generated_by": "t", "entries": entries});
        serde_json::from_value(doc).unwrap()
    }

    fn core_csv(confidence_for: impl Fn(usize) -> &'static str) -> String {
        let mut csv = String::from("scope,code,name,confidence,source,status,notes\n");
        for (i, (scope, name)) in CORE_MESSAGES.iter().enumerate() {
            csv.push_str(&format!(
                "{scope},{i},{name},{},https://example.com/proto,verified,\n",
                confidence_for(i)
            ));
        }
        csv
    }

    #[test]
    fn clean_map_has_no_findings() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("ev.txt"), "x").unwrap();
        let entries = vec![approved_name("0x1", "ev.txt")];
        let errors = validate_map_document(&doc(entries), EntryType::Name, dir.path());
        assert!(errors.is_empty(), "{errors:?}");
    }

    #[test]
    fn hand_edited_entries_report_in_file_order() {
        let dir = tempdir().unwrap();
        let mut bad = approved_name("0x2", "gone.txt");
        bad["confidence"] = json!("Certain");
        bad.as_object_mut().unwrap().remove("status");

        let errors = validate_map_document(
            &doc(vec![json!("not an object"), bad]),
            EntryType::Name,
            dir.path(),
        );
        assert_eq!(
            errors,
            vec![
                "entry[0]:invalid_type",
                "entry[1]:missing_field:status",
                "entry[1]:invalid_confidence:certain",
                "entry[1]:evidence[0].source_not_found:gone.txt",
            ]
        );
    }

    #[test]
    fn unparseable_provenance_is_reported_and_the_entry_skipped() {
        let dir = tempdir().unwrap();
        let mut bad = approved_name("0x1", "https://example.com/a");
        bad["provenance"] = json!({"analyst": "alice", "created_at": 1700000000});
        bad["confidence"] = json!("Certain");
        let good = approved_name("0x2", "https://example.com/b");

        let errors = validate_map_document(&doc(vec![bad, good]), EntryType::Name, dir.path());
        assert_eq!(errors, vec!["entry[0]:invalid_provenance"]);
    }

    #[test]
    fn data_map_requires_label_and_type() {
        let dir = tempdir().unwrap();
        let layout = KbLayout::under(dir.path());
        let mut unlabeled = Candidate::data_label("SoulseekQt", "0x20", "", "char *")
            .with_confidence("high")
            .with_evidence(vec![Evidence::new("string", "https://example.com/s")])
            .to_value();
        unlabeled["status"] = json!("approved");
        let mut untyped = unlabeled.clone();
        untyped["new_label"] = json!("g_table");
        untyped.as_object_mut().unwrap().remove("data_type");

        let doc = json!({"version": 1, "entries": [unlabeled, untyped]});
        fs::create_dir_all(layout.data_map.parent().unwrap()).unwrap();
        fs::write(&layout.data_map, doc.to_string()).unwrap();

        let report = validate_maps(&AuditRequest::from_layout(&layout)).unwrap();
        assert!(report.name_map.is_empty());
        assert_eq!(
            report.data_map,
            vec![
                "entry[0]:missing_field:new_label",
                "entry[1]:missing_field:data_type",
            ]
        );
    }

    #[test]
    fn duplicate_composite_keys_are_flagged() {
        let dir = tempdir().unwrap();
        let entry = approved_name("0x1", "https://example.com/a");
        let errors =
            validate_map_document(&doc(vec![entry.clone(), entry]), EntryType::Name, dir.path());
        assert_eq!(
            errors,
            vec!["entry[1]:duplicate_key:SoulseekQt::0x1::function_rename:first_at_entry[0]"]
        );
    }

    #[test]
    fn missing_map_files_audit_clean() {
        let dir = tempdir().unwrap();
        let layout = KbLayout::under(dir.path());
        let report = validate_maps(&AuditRequest::from_layout(&layout)).unwrap();
        assert!(!report.has_errors());
    }

    #[test]
    fn full_core_coverage_passes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("message_map.csv");
        fs::write(&path, core_csv(|i| if i < 18 { "high" } else { "medium" })).unwrap();
        let errors = validate_message_map(&path, dir.path()).unwrap();
        assert!(errors.is_empty(), "{errors:?}");
    }

    #[test]
    fn core_thresholds_are_enforced() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("message_map.csv");
        fs::write(&path, core_csv(|i| if i == 0 { "low" } else { "medium" })).unwrap();
        let errors = validate_message_map(&path, dir.path()).unwrap();
        assert_eq!(
            errors,
            vec![
                "entry[0]:low_confidence_not_allowed_for_core",
                "core_high_confidence_below_threshold:0",
                "core_medium_confidence_above_threshold:24",
                "core_low_confidence_must_be_zero:1",
            ]
        );
    }

    #[test]
    fn message_map_row_checks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("message_map.csv");
        fs::write(
            &path,
            "scope,code,name,confidence,source,status\n\
             server,1,SM_LOGIN,high,https://example.com,verified\n\
             server,x1,SM_LOGIN,sure,missing.md,\n",
        )
        .unwrap();
        let errors = validate_message_map(&path, dir.path()).unwrap();
        assert_eq!(
            &errors[..5],
            &[
                "entry[1]:missing_field:status",
                "entry[1]:duplicate:server:SM_LOGIN",
                "entry[1]:invalid_code:x1",
                "entry[1]:invalid_confidence:sure",
                "entry[1]:source_not_found:missing.md",
            ]
        );
        assert!(errors.contains(&"core_coverage_count_invalid:1".to_string()));
        assert_eq!(
            errors.iter().filter(|e| e.starts_with("missing_core_message:")).count(),
            24
        );
    }

    #[test]
    fn missing_message_files_are_reported_not_fatal() {
        let dir = tempdir().unwrap();
        let csv = dir.path().join("nope.csv");
        let errors = validate_message_map(&csv, dir.path()).unwrap();
        assert_eq!(errors, vec![format!("missing_file:{}", csv.display())]);
    }

    #[test]
    fn schema_shape_errors() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("schema.json");
        fs::write(&path, r#"{"messages": {"SM_LOGIN": 1}}"#).unwrap();
        assert_eq!(
            validate_message_schema(&path, dir.path()).unwrap(),
            vec!["invalid_schema:messages_not_list"]
        );

        fs::write(
            &path,
            json!({"messages": [7, {
                "scope": "peer",
                "code": 0,
                "name": "PM_X",
                "confidence": "high",
                "evidence": [],
            }]})
            .to_string(),
        )
        .unwrap();
        let errors = validate_message_schema(&path, dir.path()).unwrap();
        assert_eq!(errors[0], "entry[0]:invalid_type");
        assert_eq!(errors[1], "entry[1]:missing_field:evidence");
        assert_eq!(errors[2], "entry[1]:missing_evidence");
    }

    #[test]
    fn schema_with_full_core_coverage_passes() {
        let dir = tempdir().unwrap();
        let messages: Vec<Value> = CORE_MESSAGES
            .iter()
            .enumerate()
            .map(|(i, (scope, name))| {
                json!({
                    "scope": scope,
                    "code": i,
                    "name": name,
                    "confidence": "high",
                    "evidence": [{"kind": "capture", "source": "https://example.com/pcap"}],
                })
            })
            .collect();
        let path = dir.path().join("schema.json");
        fs::write(&path, json!({ "messages": messages }).to_string()).unwrap();
        let errors = validate_message_schema(&path, dir.path()).unwrap();
        assert!(errors.is_empty(), "{errors:?}");
    }
}
