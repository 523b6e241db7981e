//! Evidence citations and the shared evidence-resolution rule.
//!
//! Both the promotion engine and the audit validator call [`validate_evidence`], so a
//! citation that is valid at promotion time is valid at audit time (and vice versa),
//! as long as the cited file still exists.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// A single citation supporting a candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    /// Classification tag (`xref`, `string`, `runtime_capture`, ...).
    #[serde(default, deserialize_with = "lenient_text")]
    pub kind: String,
    /// An `http(s)` URL or a path (relative paths are resolved against the repo root).
    #[serde(default, deserialize_with = "lenient_text")]
    pub source: String,
    #[serde(
        default,
        deserialize_with = "lenient_opt_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub note: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Evidence {
    pub fn new(kind: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            source: source.into(),
            note: None,
            extra: BTreeMap::new(),
        }
    }
}

/// One element of an evidence list, kept verbatim when it is not an object.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EvidenceItem {
    Cited(Evidence),
    Malformed(Value),
}

impl EvidenceItem {
    fn from_value(value: Value) -> Self {
        if !value.is_object() {
            return EvidenceItem::Malformed(value);
        }
        match serde_json::from_value::<Evidence>(value.clone()) {
            Ok(ev) => EvidenceItem::Cited(ev),
            Err(_) => EvidenceItem::Malformed(value),
        }
    }
}

/// The `evidence` field of a record.
///
/// Records come from hand-edited files, so a non-list value is retained as-is and
/// reported by validation instead of failing the decode.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EvidenceList {
    Items(Vec<EvidenceItem>),
    Malformed(Value),
}

impl Default for EvidenceList {
    fn default() -> Self {
        EvidenceList::Items(Vec::new())
    }
}

impl From<Vec<Evidence>> for EvidenceList {
    fn from(items: Vec<Evidence>) -> Self {
        EvidenceList::Items(items.into_iter().map(EvidenceItem::Cited).collect())
    }
}

impl<'de> Deserialize<'de> for EvidenceList {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(EvidenceList::from_value(value))
    }
}

impl EvidenceList {
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Array(items) => {
                EvidenceList::Items(items.into_iter().map(EvidenceItem::from_value).collect())
            }
            other => EvidenceList::Malformed(other),
        }
    }

    /// Blank in the required-field sense: absent, `null`, `""` or `[]`.
    pub fn is_blank(&self) -> bool {
        match self {
            EvidenceList::Items(items) => items.is_empty(),
            EvidenceList::Malformed(Value::Null) => true,
            EvidenceList::Malformed(Value::String(s)) => s.is_empty(),
            EvidenceList::Malformed(_) => false,
        }
    }

    pub fn cited(&self) -> impl Iterator<Item = &Evidence> {
        let items: &[EvidenceItem] = match self {
            EvidenceList::Items(items) => items,
            EvidenceList::Malformed(_) => &[],
        };
        items.iter().filter_map(|item| match item {
            EvidenceItem::Cited(ev) => Some(ev),
            EvidenceItem::Malformed(_) => None,
        })
    }
}

// =============================================================================
// Error codes
// =============================================================================

/// Why a single `source` value does not resolve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    Missing,
    NotFound(String),
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceError::Missing => f.write_str("missing_source"),
            SourceError::NotFound(source) => write!(f, "source_not_found:{source}"),
        }
    }
}

/// An evidence validation failure; `Display` renders the stable error code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvidenceError {
    MissingEvidence,
    InvalidType { index: usize },
    MissingKind { index: usize },
    Source { index: usize, error: SourceError },
}

impl fmt::Display for EvidenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvidenceError::MissingEvidence => f.write_str("missing_evidence"),
            EvidenceError::InvalidType { index } => write!(f, "evidence[{index}].invalid_type"),
            EvidenceError::MissingKind { index } => write!(f, "evidence[{index}].missing_kind"),
            EvidenceError::Source { index, error } => write!(f, "evidence[{index}].{error}"),
        }
    }
}

impl Serialize for EvidenceError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

// =============================================================================
// Resolution
// =============================================================================

/// `true` for absolute `http`/`https` URLs with a non-empty host.
pub fn is_url(value: &str) -> bool {
    let Ok(parsed) = url::Url::parse(value) else {
        return false;
    };
    let scheme = parsed.scheme();
    if scheme != "http" && scheme != "https" {
        return false;
    }
    // `url` normalizes `http:host` into `http://host/`; only the explicit authority form counts.
    let raw = value.trim_matches(|c: char| c <= ' ');
    if !raw
        .get(scheme.len()..)
        .is_some_and(|rest| rest.starts_with("://"))
    {
        return false;
    }
    parsed.host_str().is_some_and(|host| !host.is_empty())
}

/// Where a non-URL source lives on disk.
pub fn resolve_source(source: &str, repo_root: &Path) -> PathBuf {
    let path = Path::new(source);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        repo_root.join(path)
    }
}

/// Check one (already trimmed) source value.
pub fn check_source(source: &str, repo_root: &Path) -> Option<SourceError> {
    if source.is_empty() {
        return Some(SourceError::Missing);
    }
    if is_url(source) {
        return None;
    }
    if resolve_source(source, repo_root).exists() {
        None
    } else {
        Some(SourceError::NotFound(source.to_string()))
    }
}

/// Validate an evidence list. Every item is checked; one bad item never hides another.
pub fn validate_evidence(evidence: &EvidenceList, repo_root: &Path) -> Vec<EvidenceError> {
    let items = match evidence {
        EvidenceList::Items(items) if !items.is_empty() => items,
        _ => return vec![EvidenceError::MissingEvidence],
    };

    let mut errors = Vec::new();
    for (index, item) in items.iter().enumerate() {
        let ev = match item {
            EvidenceItem::Cited(ev) => ev,
            EvidenceItem::Malformed(_) => {
                errors.push(EvidenceError::InvalidType { index });
                continue;
            }
        };

        if ev.kind.trim().is_empty() {
            errors.push(EvidenceError::MissingKind { index });
        }
        if let Some(error) = check_source(ev.source.trim(), repo_root) {
            errors.push(EvidenceError::Source { index, error });
        }
    }
    errors
}

// =============================================================================
// Lenient field decoding
// =============================================================================

/// Text view of a JSON value: strings verbatim, `null` and `[]` as empty, anything else as JSON.
pub(crate) fn text_of(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Array(items) if items.is_empty() => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn lenient_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(text_of(&value))
}

fn lenient_opt_text<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Null => None,
        other => Some(text_of(&other)),
    })
}
