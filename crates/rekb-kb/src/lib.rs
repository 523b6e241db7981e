//! Reverse-engineering knowledge base: evidence-gated promotion and audit.
//!
//! The knowledge base keeps two *authoritative maps* (symbol renames and data labels)
//! that only ever contain reviewed, evidence-backed entries:
//!
//! 1. External analysis appends *untrusted* candidates to JSONL queues.
//! 2. [`promotion`] validates every candidate against the shared rules in
//!    [`candidate`] and [`evidence`], then either upserts it into a map (high
//!    confidence, valid evidence) or records a row in the append-only review queue.
//! 3. [`audit`] re-runs the same rules over the maps at any later time to catch drift
//!    introduced by manual edits. It never writes.
//!
//! All file IO goes through [`store`]; promotion computes everything in memory first
//! and only then commits, so a structural error leaves every file untouched.

pub mod audit;
pub mod candidate;
pub mod config;
pub mod error;
pub mod evidence;
pub mod promotion;
pub mod review;
pub mod store;

pub use audit::*;
pub use candidate::*;
pub use config::*;
pub use error::{KbError, KbResult};
pub use evidence::*;
pub use promotion::*;
pub use review::*;
pub use store::*;
