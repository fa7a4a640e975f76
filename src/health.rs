//! Consistency checks between the catalog and its derived tables.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::SyncResult;
use crate::store::CatalogStore;

/// Result of a health check run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    /// True iff `issues` is empty.
    pub healthy: bool,
    /// Findings in diagnostic order.
    pub issues: Vec<String>,
}

impl HealthReport {
    fn from_issues(issues: Vec<String>) -> Self {
        Self {
            healthy: issues.is_empty(),
            issues,
        }
    }
}

/// A single consistency query.
///
/// The order of [`Diagnostic::ALL`] is part of the report format: new
/// diagnostics go at the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Diagnostic {
    /// Items not covered by an archive of their format bucket.
    UncoveredItems,
    /// Items without a filename record.
    MissingFilenames,
    /// Author names no book links to.
    OrphanedNames,
    /// Mapping rows whose start is past their end.
    InvertedRanges,
    /// Same-bucket mapping rows with intersecting ranges.
    OverlappingRanges,
}

impl Diagnostic {
    /// Every diagnostic, in report order.
    pub const ALL: [Diagnostic; 5] = [
        Diagnostic::UncoveredItems,
        Diagnostic::MissingFilenames,
        Diagnostic::OrphanedNames,
        Diagnostic::InvertedRanges,
        Diagnostic::OverlappingRanges,
    ];

    /// Short identifier used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Diagnostic::UncoveredItems => "uncovered-items",
            Diagnostic::MissingFilenames => "missing-filenames",
            Diagnostic::OrphanedNames => "orphaned-names",
            Diagnostic::InvertedRanges => "inverted-ranges",
            Diagnostic::OverlappingRanges => "overlapping-ranges",
        }
    }

    fn describe(&self, count: i64) -> String {
        match self {
            Diagnostic::UncoveredItems => format!("{} items without archive mapping", count),
            Diagnostic::MissingFilenames => format!("{} items without filename record", count),
            Diagnostic::OrphanedNames => format!("{} orphaned name records", count),
            Diagnostic::InvertedRanges => {
                format!("{} archive mappings with inverted range", count)
            }
            Diagnostic::OverlappingRanges => {
                format!("{} overlapping archive mapping pairs", count)
            }
        }
    }

    async fn count(&self, store: &dyn CatalogStore, canonical_format: &str) -> SyncResult<i64> {
        match self {
            Diagnostic::UncoveredItems => store.count_uncovered_items(canonical_format).await,
            Diagnostic::MissingFilenames => store.count_items_without_filename().await,
            Diagnostic::OrphanedNames => store.count_orphaned_names().await,
            Diagnostic::InvertedRanges => store.count_inverted_ranges().await,
            Diagnostic::OverlappingRanges => store.count_overlapping_ranges().await,
        }
    }
}

/// Runs the fixed battery of diagnostics against a catalog store.
pub struct HealthChecker {
    store: Arc<dyn CatalogStore>,
    canonical_format: String,
}

impl HealthChecker {
    /// Create a checker for `store`.
    pub fn new(store: Arc<dyn CatalogStore>, canonical_format: &str) -> Self {
        Self {
            store,
            canonical_format: canonical_format.to_string(),
        }
    }

    /// Run every diagnostic.
    ///
    /// A failing diagnostic becomes a "check failed" issue and the remaining
    /// ones still run. If the store cannot be reached at all the report holds
    /// that single failure.
    pub async fn check(&self) -> HealthReport {
        if let Err(e) = self.store.ping().await {
            warn!("Catalog store unreachable: {}", e);
            return HealthReport::from_issues(vec![format!("health check failed: {}", e)]);
        }

        let mut issues = Vec::new();
        for diagnostic in Diagnostic::ALL {
            match diagnostic
                .count(self.store.as_ref(), &self.canonical_format)
                .await
            {
                Ok(0) => debug!(diagnostic = diagnostic.name(), "Diagnostic passed"),
                Ok(count) => issues.push(diagnostic.describe(count)),
                Err(e) => {
                    warn!(diagnostic = diagnostic.name(), "Diagnostic failed: {}", e);
                    issues.push(format!("check failed: {}: {}", diagnostic.name(), e));
                }
            }
        }

        let report = HealthReport::from_issues(issues);
        if report.healthy {
            info!("Catalog health check passed");
        } else {
            info!("Catalog health check found {} issue(s)", report.issues.len());
        }
        report
    }
}
