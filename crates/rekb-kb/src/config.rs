//! File layout and promotion defaults.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::candidate::EntryType;

pub const DEFAULT_NAME_MAP: &str = "analysis/ghidra/maps/name_map.json";
pub const DEFAULT_DATA_MAP: &str = "analysis/ghidra/maps/data_map.json";
pub const DEFAULT_NAME_CANDIDATES: &str = "analysis/ghidra/queue/name_candidates.jsonl";
pub const DEFAULT_DATA_CANDIDATES: &str = "analysis/ghidra/queue/data_candidates.jsonl";
pub const DEFAULT_REVIEW_QUEUE: &str = "analysis/ghidra/queue/review_queue.jsonl";

pub const DEFAULT_ANALYST: &str = "codex";
pub const DEFAULT_GENERATED_BY: &str = "rekb kb workflow";
pub const MAP_VERSION_V1: u32 = 1;

/// Env override for the provenance analyst (read by the CLI).
pub const ANALYST_ENV: &str = "REKB_ANALYST";

/// Wall-clock source for provenance and review-row timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Always returns the same instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// RFC 3339, whole seconds, `+00:00` offset (e.g. `2026-10-16T09:30:00+00:00`).
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, false)
}

/// Defaults stamped into promoted entries.
#[derive(Clone)]
pub struct PromotionConfig {
    /// `provenance.analyst` when the candidate does not name one.
    pub analyst: String,
    /// `generated_by` for maps bootstrapped from a missing file.
    pub generated_by: String,
    pub clock: Arc<dyn Clock>,
}

impl PromotionConfig {
    pub fn with_analyst(mut self, analyst: impl Into<String>) -> Self {
        self.analyst = analyst.into();
        self
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn timestamp(&self) -> String {
        format_timestamp(self.clock.now())
    }
}

impl Default for PromotionConfig {
    fn default() -> Self {
        Self {
            analyst: DEFAULT_ANALYST.to_string(),
            generated_by: DEFAULT_GENERATED_BY.to_string(),
            clock: Arc::new(SystemClock),
        }
    }
}

impl fmt::Debug for PromotionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PromotionConfig")
            .field("analyst", &self.analyst)
            .field("generated_by", &self.generated_by)
            .field("now", &self.clock.now())
            .finish()
    }
}

/// Where the knowledge-base files live. All paths are absolute once built via
/// [`KbLayout::under`] or [`KbLayout::resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KbLayout {
    pub repo_root: PathBuf,
    pub name_map: PathBuf,
    pub data_map: PathBuf,
    pub name_candidates: PathBuf,
    pub data_candidates: PathBuf,
    pub review_queue: PathBuf,
}

impl KbLayout {
    /// Default layout under `repo_root`.
    pub fn under(repo_root: impl Into<PathBuf>) -> Self {
        let repo_root = repo_root.into();
        Self {
            name_map: repo_root.join(DEFAULT_NAME_MAP),
            data_map: repo_root.join(DEFAULT_DATA_MAP),
            name_candidates: repo_root.join(DEFAULT_NAME_CANDIDATES),
            data_candidates: repo_root.join(DEFAULT_DATA_CANDIDATES),
            review_queue: repo_root.join(DEFAULT_REVIEW_QUEUE),
            repo_root,
        }
    }

    /// Resolve a user-supplied path against the repo root (absolute paths pass through).
    pub fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.repo_root.join(path)
        }
    }

    pub fn map_path(&self, entry_type: EntryType) -> &Path {
        match entry_type {
            EntryType::Name => &self.name_map,
            EntryType::Data => &self.data_map,
        }
    }

    pub fn candidates_path(&self, entry_type: EntryType) -> &Path {
        match entry_type {
            EntryType::Name => &self.name_candidates,
            EntryType::Data => &self.data_candidates,
        }
    }
}
