//! Structured reconciliation results
//!
//! Partial, isolable failures are collected here rather than surfaced as
//! bare errors: the caller always learns what was written, what was
//! skipped, and why.

use fabrica_store::AppliedCounts;
use serde::{Deserialize, Serialize};

/// One snapshot entry reconciliation skipped, with the reason
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SkippedEntry {
    /// Table the entry belongs to
    pub table: String,
    /// Relation property, when the skip is relation-scoped
    pub relation: Option<String>,
    /// Human-readable reason
    pub reason: String,
}

/// One failed physical enum sync (phase 4, isolated per column)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnumSyncFailure {
    pub table: String,
    pub column: String,
    pub reason: String,
}

/// Result of one reconciliation run
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub started_at: u64,
    pub finished_at: u64,
    /// Definition writes performed, per entity kind
    pub counts: AppliedCounts,
    /// Entries skipped with a warning (missing targets, conflicts)
    pub skipped: Vec<SkippedEntry>,
    /// Per-column physical sync failures
    pub enum_sync_failures: Vec<EnumSyncFailure>,
}

impl ReconcileReport {
    /// Whether anything was skipped or failed
    #[must_use]
    pub fn has_issues(&self) -> bool {
        !self.skipped.is_empty() || !self.enum_sync_failures.is_empty()
    }

    /// Whether the run performed zero writes and hit zero issues
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.counts.is_zero() && !self.has_issues()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_report() {
        let report = ReconcileReport {
            started_at: 1,
            finished_at: 2,
            counts: AppliedCounts::default(),
            skipped: Vec::new(),
            enum_sync_failures: Vec::new(),
        };
        assert!(report.is_noop());
        assert!(!report.has_issues());
    }

    #[test]
    fn test_skips_are_issues() {
        let report = ReconcileReport {
            started_at: 1,
            finished_at: 2,
            counts: AppliedCounts::default(),
            skipped: vec![SkippedEntry {
                table: "post".into(),
                relation: Some("author".into()),
                reason: "target table 'user' not found".into(),
            }],
            enum_sync_failures: Vec::new(),
        };
        assert!(report.has_issues());
        assert!(!report.is_noop());
    }
}
