//! Candidate records (name renames and data labels) and the required-field contract.
//!
//! Candidate queues and map files are edited by hand and by external tooling, so
//! decoding is lenient: absent or `null` fields decode as blank and are *reported* by
//! [`validate_candidate`] instead of failing the whole run.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::evidence::{text_of, validate_evidence, EvidenceError, EvidenceList};

// =============================================================================
// Entry types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    /// Function/symbol renames (`name_map.json`).
    Name,
    /// Data labels (`data_map.json`).
    Data,
}

pub const COMMON_REQUIRED_FIELDS: [&str; 4] = ["binary", "address", "confidence", "evidence"];

impl EntryType {
    pub const ALL: [EntryType; 2] = [EntryType::Name, EntryType::Data];

    pub const fn as_str(self) -> &'static str {
        match self {
            EntryType::Name => "name",
            EntryType::Data => "data",
        }
    }

    /// Fields that must be present for this entry type beyond the common set.
    pub fn variant_fields(self) -> &'static [&'static str] {
        match self {
            EntryType::Name => &NameFields::REQUIRED,
            EntryType::Data => &DataFields::REQUIRED,
        }
    }

    /// Field that distinguishes entries at the same `(binary, address)`.
    pub fn key_field(self) -> &'static str {
        match self {
            EntryType::Name => "kind",
            EntryType::Data => "new_label",
        }
    }

    /// Field used as the third component of the map sort order.
    pub fn sort_field(self) -> &'static str {
        match self {
            EntryType::Name => "new_name",
            EntryType::Data => "new_label",
        }
    }

    /// Common fields followed by the variant fields, in report order.
    pub fn required_fields(self) -> Vec<&'static str> {
        COMMON_REQUIRED_FIELDS
            .iter()
            .chain(self.variant_fields())
            .copied()
            .collect()
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl Confidence {
    /// Case-insensitive; surrounding whitespace is ignored.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "high" => Some(Confidence::High),
            "medium" => Some(Confidence::Medium),
            "low" => Some(Confidence::Low),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Confidence::High => "high",
            Confidence::Medium => "medium",
            Confidence::Low => "low",
        }
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Variant fields
// =============================================================================

/// The per-variant part of a candidate: which fields it requires, how it
/// distinguishes entries at the same address, and how it sorts.
pub trait VariantFields {
    /// Value of a variant field by name, `None` if the name is not a field of this variant.
    fn field(&self, name: &str) -> Option<&str>;
    /// Third component of the composite key.
    fn key_part(&self) -> &str;
    /// Third component of the map sort order.
    fn sort_label(&self) -> &str;
    fn write_into(&self, map: &mut Map<String, Value>);
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NameFields {
    pub original_name: String,
    pub new_name: String,
    /// e.g. `function_rename`, `thunk_rename`.
    pub kind: String,
}

impl NameFields {
    pub const REQUIRED: [&'static str; 3] = ["original_name", "new_name", "kind"];
}

impl VariantFields for NameFields {
    fn field(&self, name: &str) -> Option<&str> {
        match name {
            "original_name" => Some(&self.original_name),
            "new_name" => Some(&self.new_name),
            "kind" => Some(&self.kind),
            _ => None,
        }
    }

    fn key_part(&self) -> &str {
        &self.kind
    }

    fn sort_label(&self) -> &str {
        &self.new_name
    }

    fn write_into(&self, map: &mut Map<String, Value>) {
        map.insert("original_name".into(), self.original_name.clone().into());
        map.insert("new_name".into(), self.new_name.clone().into());
        map.insert("kind".into(), self.kind.clone().into());
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataFields {
    pub new_label: String,
    pub data_type: String,
}

impl DataFields {
    pub const REQUIRED: [&'static str; 2] = ["new_label", "data_type"];
}

impl VariantFields for DataFields {
    fn field(&self, name: &str) -> Option<&str> {
        match name {
            "new_label" => Some(&self.new_label),
            "data_type" => Some(&self.data_type),
            _ => None,
        }
    }

    fn key_part(&self) -> &str {
        &self.new_label
    }

    fn sort_label(&self) -> &str {
        &self.new_label
    }

    fn write_into(&self, map: &mut Map<String, Value>) {
        map.insert("new_label".into(), self.new_label.clone().into());
        map.insert("data_type".into(), self.data_type.clone().into());
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateKind {
    NameRename(NameFields),
    DataLabel(DataFields),
}

impl CandidateKind {
    pub fn entry_type(&self) -> EntryType {
        match self {
            CandidateKind::NameRename(_) => EntryType::Name,
            CandidateKind::DataLabel(_) => EntryType::Data,
        }
    }

    pub fn fields(&self) -> &dyn VariantFields {
        match self {
            CandidateKind::NameRename(f) => f,
            CandidateKind::DataLabel(f) => f,
        }
    }
}

// =============================================================================
// Provenance + keys
// =============================================================================

/// Who promoted an entry and when. Unknown keys are preserved.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analyst: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub promoted_at: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Identity of an entry within one authoritative map.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CompositeKey {
    pub binary: String,
    pub address: String,
    /// `kind` for name entries, `new_label` for data entries.
    pub discriminator: String,
}

impl fmt::Display for CompositeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}::{}", self.binary, self.address, self.discriminator)
    }
}

// =============================================================================
// Candidate
// =============================================================================

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("record is not a JSON object")]
    NotAnObject,
    #[error("invalid provenance: {0}")]
    Provenance(#[source] serde_json::Error),
}

/// A proposed (or, once `status = approved`, promoted) fact about a binary.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub binary: String,
    pub address: String,
    /// Kept verbatim; see [`Candidate::confidence_level`].
    pub confidence: String,
    pub evidence: EvidenceList,
    pub status: Option<String>,
    pub provenance: Option<Provenance>,
    pub kind: CandidateKind,
    /// Keys outside the known schema, carried through unchanged.
    pub extra: BTreeMap<String, Value>,
}

fn take_text(map: &mut Map<String, Value>, key: &str) -> String {
    map.remove(key).map(|v| text_of(&v)).unwrap_or_default()
}

impl Candidate {
    pub fn name_rename(
        binary: impl Into<String>,
        address: impl Into<String>,
        original_name: impl Into<String>,
        new_name: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        Self::with_kind(
            binary,
            address,
            CandidateKind::NameRename(NameFields {
                original_name: original_name.into(),
                new_name: new_name.into(),
                kind: kind.into(),
            }),
        )
    }

    pub fn data_label(
        binary: impl Into<String>,
        address: impl Into<String>,
        new_label: impl Into<String>,
        data_type: impl Into<String>,
    ) -> Self {
        Self::with_kind(
            binary,
            address,
            CandidateKind::DataLabel(DataFields {
                new_label: new_label.into(),
                data_type: data_type.into(),
            }),
        )
    }

    fn with_kind(
        binary: impl Into<String>,
        address: impl Into<String>,
        kind: CandidateKind,
    ) -> Self {
        Self {
            binary: binary.into(),
            address: address.into(),
            confidence: String::new(),
            evidence: EvidenceList::default(),
            status: None,
            provenance: None,
            kind,
            extra: BTreeMap::new(),
        }
    }

    pub fn with_confidence(mut self, confidence: impl Into<String>) -> Self {
        self.confidence = confidence.into();
        self
    }

    pub fn with_evidence(mut self, evidence: impl Into<EvidenceList>) -> Self {
        self.evidence = evidence.into();
        self
    }

    /// Decode a queue line or map entry as the given entry type.
    pub fn from_value(entry_type: EntryType, value: Value) -> Result<Self, DecodeError> {
        let Value::Object(mut map) = value else {
            return Err(DecodeError::NotAnObject);
        };

        let binary = take_text(&mut map, "binary");
        let address = take_text(&mut map, "address");
        let confidence = take_text(&mut map, "confidence");
        let evidence = map
            .remove("evidence")
            .map(EvidenceList::from_value)
            .unwrap_or_default();
        let status = match map.remove("status") {
            None | Some(Value::Null) => None,
            Some(v) => Some(text_of(&v)),
        };
        let provenance = match map.remove("provenance") {
            None | Some(Value::Null) => None,
            Some(v) => Some(serde_json::from_value(v).map_err(DecodeError::Provenance)?),
        };
        let kind = match entry_type {
            EntryType::Name => CandidateKind::NameRename(NameFields {
                original_name: take_text(&mut map, "original_name"),
                new_name: take_text(&mut map, "new_name"),
                kind: take_text(&mut map, "kind"),
            }),
            EntryType::Data => CandidateKind::DataLabel(DataFields {
                new_label: take_text(&mut map, "new_label"),
                data_type: take_text(&mut map, "data_type"),
            }),
        };

        Ok(Self {
            binary,
            address,
            confidence,
            evidence,
            status,
            provenance,
            kind,
            extra: map.into_iter().collect(),
        })
    }

    pub fn to_value(&self) -> Value {
        let mut map: Map<String, Value> = self
            .extra
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        map.insert("binary".into(), self.binary.clone().into());
        map.insert("address".into(), self.address.clone().into());
        map.insert("confidence".into(), self.confidence.clone().into());
        map.insert(
            "evidence".into(),
            serde_json::to_value(&self.evidence).unwrap_or(Value::Null),
        );
        self.kind.fields().write_into(&mut map);
        if let Some(status) = &self.status {
            map.insert("status".into(), status.clone().into());
        }
        if let Some(provenance) = &self.provenance {
            map.insert(
                "provenance".into(),
                serde_json::to_value(provenance).unwrap_or(Value::Null),
            );
        }
        Value::Object(map)
    }

    pub fn entry_type(&self) -> EntryType {
        self.kind.entry_type()
    }

    pub fn confidence_level(&self) -> Option<Confidence> {
        Confidence::parse(&self.confidence)
    }

    pub fn composite_key(&self) -> CompositeKey {
        CompositeKey {
            binary: self.binary.clone(),
            address: self.address.clone(),
            discriminator: self.kind.fields().key_part().to_string(),
        }
    }

    /// Map sort order: binary, address, distinguishing label, then the full key.
    pub fn sort_key(&self) -> (&str, &str, &str, &str) {
        let fields = self.kind.fields();
        (
            &self.binary,
            &self.address,
            fields.sort_label(),
            fields.key_part(),
        )
    }

    /// Blank in the required-field sense. Unknown field names are looked up in `extra`.
    pub fn field_is_blank(&self, field: &str) -> bool {
        match field {
            "binary" => self.binary.is_empty(),
            "address" => self.address.is_empty(),
            "confidence" => self.confidence.is_empty(),
            "evidence" => self.evidence.is_blank(),
            "status" => self.status.as_deref().unwrap_or("").is_empty(),
            other => match self.kind.fields().field(other) {
                Some(value) => value.is_empty(),
                None => match self.extra.get(other) {
                    None | Some(Value::Null) => true,
                    Some(v) => text_of(v).is_empty(),
                },
            },
        }
    }

    pub fn missing_fields<'a>(&self, required: &[&'a str]) -> Vec<&'a str> {
        required
            .iter()
            .copied()
            .filter(|field| self.field_is_blank(field))
            .collect()
    }
}

impl Serialize for Candidate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

// =============================================================================
// Validation
// =============================================================================

/// Outcome of [`validate_candidate`]; the caller decides what state it leads to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CandidateValidation {
    pub missing: Vec<String>,
    pub evidence_errors: Vec<EvidenceError>,
}

impl CandidateValidation {
    pub fn is_valid(&self) -> bool {
        self.missing.is_empty() && self.evidence_errors.is_empty()
    }
}

/// Required-field completeness plus evidence validation. Never fails.
pub fn validate_candidate(candidate: &Candidate, repo_root: &Path) -> CandidateValidation {
    let required = candidate.entry_type().required_fields();
    CandidateValidation {
        missing: candidate
            .missing_fields(&required)
            .into_iter()
            .map(str::to_string)
            .collect(),
        evidence_errors: validate_evidence(&candidate.evidence, repo_root),
    }
}
