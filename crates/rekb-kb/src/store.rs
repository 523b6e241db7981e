//! Map store: authoritative-map load/merge/sort/persist plus the JSONL queue helpers.
//!
//! Maps are rendered with sorted object keys and deterministically ordered entries, so
//! re-rendering an unchanged map is byte-identical.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::candidate::{Candidate, CompositeKey, EntryType};
use crate::config::MAP_VERSION_V1;
use crate::error::{KbError, KbResult};
use crate::evidence::text_of;

/// On-disk shape of `name_map.json` / `data_map.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapDocument {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub generated_by: String,
    #[serde(default)]
    pub entries: Vec<Value>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

fn default_version() -> u32 {
    MAP_VERSION_V1
}

/// One map entry, kept exactly as it was read (or approved).
///
/// Only the composite key and the sort label are extracted; the record itself is never
/// re-encoded, so entries a run does not touch are written back unchanged.
#[derive(Debug, Clone, PartialEq)]
pub struct MapEntry {
    key: CompositeKey,
    sort_label: String,
    record: Map<String, Value>,
}

impl MapEntry {
    pub fn from_record(entry_type: EntryType, record: Map<String, Value>) -> Self {
        let field = |name: &str| record.get(name).map(text_of).unwrap_or_default();
        let key = CompositeKey {
            binary: field("binary"),
            address: field("address"),
            discriminator: field(entry_type.key_field()),
        };
        let sort_label = field(entry_type.sort_field());
        Self {
            key,
            sort_label,
            record,
        }
    }

    pub fn from_candidate(candidate: &Candidate) -> Self {
        let record = match candidate.to_value() {
            Value::Object(record) => record,
            _ => Map::new(),
        };
        Self::from_record(candidate.entry_type(), record)
    }

    pub fn key(&self) -> &CompositeKey {
        &self.key
    }

    pub fn record(&self) -> &Map<String, Value> {
        &self.record
    }

    /// Write order: binary, address, distinguishing label, then the key part.
    pub fn sort_key(&self) -> (&str, &str, &str, &str) {
        (
            &self.key.binary,
            &self.key.address,
            &self.sort_label,
            &self.key.discriminator,
        )
    }
}

/// In-memory authoritative map, keyed by composite key.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthoritativeMap {
    pub entry_type: EntryType,
    pub version: u32,
    pub generated_by: String,
    /// Top-level keys other than `version`/`generated_by`/`entries`.
    pub extra: BTreeMap<String, Value>,
    entries: BTreeMap<CompositeKey, MapEntry>,
    /// Non-object records from a hand-edited file; written back after the keyed entries.
    unkeyed: Vec<Value>,
}

impl AuthoritativeMap {
    pub fn empty(entry_type: EntryType, generated_by: impl Into<String>) -> Self {
        Self {
            entry_type,
            version: MAP_VERSION_V1,
            generated_by: generated_by.into(),
            extra: BTreeMap::new(),
            entries: BTreeMap::new(),
            unkeyed: Vec::new(),
        }
    }

    /// Load a map; a missing file is the bootstrap case and yields an empty map.
    pub fn load(path: &Path, entry_type: EntryType, generated_by: &str) -> KbResult<Self> {
        if !path.exists() {
            tracing::debug!(
                path = %path.display(),
                %entry_type,
                "map file missing; bootstrapping empty map"
            );
            return Ok(Self::empty(entry_type, generated_by));
        }
        let text = fs::read_to_string(path).map_err(|e| KbError::io(path, e))?;
        let doc: MapDocument = serde_json::from_str(&text).map_err(|source| KbError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        let map = Self::from_document(doc, entry_type);
        if !map.unkeyed.is_empty() {
            tracing::warn!(
                path = %path.display(),
                count = map.unkeyed.len(),
                "map has non-object entries; keeping them as-is"
            );
        }
        Ok(map)
    }

    /// Later entries under a duplicate key replace earlier ones.
    pub fn from_document(doc: MapDocument, entry_type: EntryType) -> Self {
        let mut map = Self {
            entry_type,
            version: doc.version,
            generated_by: doc.generated_by,
            extra: doc.extra,
            entries: BTreeMap::new(),
            unkeyed: Vec::new(),
        };
        for raw in doc.entries {
            match raw {
                Value::Object(record) => {
                    map.upsert(MapEntry::from_record(entry_type, record));
                }
                other => map.unkeyed.push(other),
            }
        }
        map
    }

    /// Insert or replace the entry under its composite key; returns the replaced entry.
    pub fn upsert(&mut self, entry: MapEntry) -> Option<MapEntry> {
        self.entries.insert(entry.key.clone(), entry)
    }

    pub fn get(&self, key: &CompositeKey) -> Option<&MapEntry> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn sorted_entries(&self) -> Vec<&MapEntry> {
        let mut entries: Vec<&MapEntry> = self.entries.values().collect();
        entries.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        entries
    }

    pub fn to_document(&self) -> MapDocument {
        let keyed = self
            .sorted_entries()
            .into_iter()
            .map(|entry| Value::Object(entry.record.clone()));
        MapDocument {
            version: self.version,
            generated_by: self.generated_by.clone(),
            entries: keyed.chain(self.unkeyed.iter().cloned()).collect(),
            extra: self.extra.clone(),
        }
    }

    /// Pretty JSON with a trailing newline.
    pub fn render(&self) -> KbResult<String> {
        let mut text = serde_json::to_string_pretty(&self.to_document())?;
        text.push('\n');
        Ok(text)
    }

    pub fn persist(&self, path: &Path) -> KbResult<()> {
        let text = self.render()?;
        ensure_parent(path)?;
        fs::write(path, text).map_err(|e| KbError::io(path, e))
    }
}

// =============================================================================
// JSONL queues
// =============================================================================

/// One decoded queue line (1-based line number).
#[derive(Debug, Clone, PartialEq)]
pub struct QueueRecord {
    pub line: usize,
    pub value: Map<String, Value>,
}

/// Read a JSONL file; blank lines are skipped and a missing file reads as empty.
/// Every non-blank line must be a JSON object.
pub fn read_jsonl(path: &Path) -> KbResult<Vec<QueueRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let text = fs::read_to_string(path).map_err(|e| KbError::io(path, e))?;
    let mut records = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        let value: Value = serde_json::from_str(line).map_err(|source| KbError::JsonLine {
            path: path.to_path_buf(),
            line: idx + 1,
            source,
        })?;
        let Value::Object(value) = value else {
            return Err(KbError::NotAnObject {
                path: path.to_path_buf(),
                line: idx + 1,
            });
        };
        records.push(QueueRecord {
            line: idx + 1,
            value,
        });
    }
    Ok(records)
}

/// Append rows (one compact JSON object per line). No-op for an empty batch.
pub fn append_jsonl<T: Serialize>(path: &Path, rows: &[T]) -> KbResult<()> {
    if rows.is_empty() {
        return Ok(());
    }
    let mut buf = String::new();
    for row in rows {
        buf.push_str(&serde_json::to_string(row)?);
        buf.push('\n');
    }
    ensure_parent(path)?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| KbError::io(path, e))?;
    file.write_all(buf.as_bytes())
        .map_err(|e| KbError::io(path, e))
}

/// Leave an existing, empty file at `path`.
pub fn truncate_file(path: &Path) -> KbResult<()> {
    ensure_parent(path)?;
    fs::write(path, "").map_err(|e| KbError::io(path, e))
}

fn ensure_parent(path: &Path) -> KbResult<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            fs::create_dir_all(parent).map_err(|e| KbError::io(parent, e))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::Evidence;
    use serde_json::json;
    use tempfile::tempdir;

    fn candidate(address: &str, new_name: &str, kind: &str) -> Candidate {
        Candidate::name_rename("SoulseekQt", address, "FUN", new_name, kind)
            .with_confidence("high")
            .with_evidence(vec![Evidence::new("xref", "evidence/e.txt")])
    }

    fn entry(address: &str, new_name: &str, kind: &str) -> MapEntry {
        MapEntry::from_candidate(&candidate(address, new_name, kind))
    }

    #[test]
    fn missing_map_bootstraps_empty() {
        let dir = tempdir().unwrap();
        let map = AuthoritativeMap::load(&dir.path().join("nope.json"), EntryType::Name, "test")
            .unwrap();
        assert!(map.is_empty());
        assert_eq!(map.version, 1);
        assert_eq!(map.generated_by, "test");
    }

    #[test]
    fn entries_sort_by_binary_address_then_label() {
        let mut map = AuthoritativeMap::empty(EntryType::Name, "test");
        map.upsert(entry("0x2", "Zeta", "function_rename"));
        map.upsert(entry("0x1", "Beta", "thunk_rename"));
        map.upsert(entry("0x1", "Alpha", "function_rename"));

        let names: Vec<_> = map
            .sorted_entries()
            .iter()
            .map(|e| e.record()["new_name"].clone())
            .collect();
        assert_eq!(names, vec!["Alpha", "Beta", "Zeta"]);
    }

    #[test]
    fn duplicate_keys_on_load_keep_the_last_entry() {
        let doc: MapDocument = serde_json::from_value(json!({
            "version": 3,
            "generated_by": "hand",
            "entries": [
                candidate("0x1", "First", "function_rename").to_value(),
                candidate("0x1", "Second", "function_rename").to_value(),
            ],
            "notes": "kept",
        }))
        .unwrap();
        let map = AuthoritativeMap::from_document(doc, EntryType::Name);
        assert_eq!(map.len(), 1);
        assert_eq!(map.version, 3);
        assert_eq!(map.extra.get("notes"), Some(&json!("kept")));
        assert_eq!(map.sorted_entries()[0].record()["new_name"], "Second");
    }

    #[test]
    fn hand_edited_records_are_written_back_verbatim() {
        let hand_edited = json!({
            "binary": "SoulseekQt",
            "address": 4096,
            "kind": "function_rename",
            "new_name": null,
            "evidence": [{"kind": "xref", "source": "e.txt", "note": null, "line": 7}],
            "provenance": {"analyst": "a", "created_at": 1700000000},
        });
        let doc: MapDocument = serde_json::from_value(json!({
            "entries": [hand_edited.clone(), "stray"],
        }))
        .unwrap();

        let map = AuthoritativeMap::from_document(doc, EntryType::Name);
        let key = CompositeKey {
            binary: "SoulseekQt".to_string(),
            address: "4096".to_string(),
            discriminator: "function_rename".to_string(),
        };
        assert!(map.get(&key).is_some());
        assert_eq!(
            map.to_document().entries,
            vec![hand_edited, json!("stray")]
        );
    }

    #[test]
    fn render_is_byte_stable_across_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("maps/name_map.json");
        let mut map = AuthoritativeMap::empty(EntryType::Name, "test");
        map.upsert(entry("0x2", "B", "function_rename"));
        map.upsert(entry("0x1", "A", "function_rename"));
        map.persist(&path).unwrap();
        let first = fs::read_to_string(&path).unwrap();

        let reloaded = AuthoritativeMap::load(&path, EntryType::Name, "other").unwrap();
        reloaded.persist(&path).unwrap();
        let second = fs::read_to_string(&path).unwrap();
        assert_eq!(first, second);
        assert!(first.ends_with("}\n"));
    }

    #[test]
    fn jsonl_skips_blank_lines_and_reports_bad_line_numbers() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("q.jsonl");
        fs::write(&path, "{\"a\":1}\n\n   \n{\"b\":2}\n").unwrap();
        let records = read_jsonl(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].line, 4);

        fs::write(&path, "{\"a\":1}\n{not json\n").unwrap();
        match read_jsonl(&path) {
            Err(KbError::JsonLine { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected JsonLine error, got {other:?}"),
        }

        fs::write(&path, "[1,2]\n").unwrap();
        assert!(matches!(
            read_jsonl(&path),
            Err(KbError::NotAnObject { line: 1, .. })
        ));
    }

    #[test]
    fn append_and_truncate_create_parents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/queue/review.jsonl");
        append_jsonl(&path, &[json!({"n": 1})]).unwrap();
        append_jsonl(&path, &[json!({"n": 2}), json!({"n": 3})]).unwrap();
        append_jsonl::<Value>(&path, &[]).unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "{\"n\":1}\n{\"n\":2}\n{\"n\":3}\n"
        );

        let queue = dir.path().join("other/q.jsonl");
        truncate_file(&queue).unwrap();
        assert_eq!(fs::read_to_string(&queue).unwrap(), "");
    }
}
