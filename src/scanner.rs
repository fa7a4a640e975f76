//! Rebuilding the archive mapping table from a directory of archives.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::SyncResult;
use crate::filename::{ArchiveFilenameParser, Rejection};
use crate::store::{ArchiveMapping, CatalogStore};

/// An archive left out of the mapping table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedArchive {
    /// Archive filename.
    pub filename: String,
    /// Why it was skipped.
    pub reason: Rejection,
}

/// Outcome of a mapping rebuild.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebuildSummary {
    /// `.zip` entries found in the directory.
    pub scanned: usize,
    /// Rows inserted into the mapping table.
    pub inserted: usize,
    /// Filenames skipped as malformed or excluded.
    pub skipped: Vec<String>,
    /// Filenames whose row could not be inserted.
    pub failed: Vec<String>,
}

/// List the names of regular `.zip` files in `dir`, sorted.
pub async fn list_zip_files(dir: &Path) -> SyncResult<Vec<String>> {
    let mut names = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        match entry.file_name().into_string() {
            Ok(name) if name.ends_with(".zip") => names.push(name),
            Ok(name) => debug!("Ignoring non-archive entry {}", name),
            Err(name) => warn!("Ignoring non UTF-8 entry {:?}", name),
        }
    }
    names.sort();
    Ok(names)
}

/// Builds the identifier-range mapping from distribution archive filenames.
pub struct ArchiveIndexer {
    parser: ArchiveFilenameParser,
    store: Arc<dyn CatalogStore>,
}

impl ArchiveIndexer {
    /// Create an indexer writing to `store`.
    pub fn new(parser: ArchiveFilenameParser, store: Arc<dyn CatalogStore>) -> Self {
        Self { parser, store }
    }

    /// Parse every archive in `dir` into mapping rows.
    pub async fn scan(&self, dir: &Path) -> SyncResult<(Vec<ArchiveMapping>, Vec<SkippedArchive>)> {
        let mut rows = Vec::new();
        let mut skipped = Vec::new();

        for filename in list_zip_files(dir).await? {
            match self.parser.parse(&filename) {
                Ok(descriptor) => {
                    rows.push(ArchiveMapping::from_descriptor(&filename, &descriptor));
                }
                Err(reason) => {
                    debug!(filename = %filename, "Skipping archive: {}", reason);
                    skipped.push(SkippedArchive { filename, reason });
                }
            }
        }

        Ok((rows, skipped))
    }

    /// Replace the mapping table with the archives currently in `dir`.
    ///
    /// Unparsable and excluded names are skipped; rows the store refuses are
    /// logged and counted, and the rest of the scan still lands.
    pub async fn rebuild(&self, dir: &Path) -> SyncResult<RebuildSummary> {
        info!("Rebuilding archive mappings from {}", dir.display());

        let (rows, skipped) = self.scan(dir).await?;
        let scanned = rows.len() + skipped.len();
        if !skipped.is_empty() {
            info!("Skipped {} archive(s)", skipped.len());
        }

        let outcome = self.store.replace_archive_mappings(&rows).await?;
        for (filename, error) in &outcome.failed {
            warn!(filename = %filename, "Archive mapping not inserted: {}", error);
        }

        info!(
            "Archive mappings rebuilt: {} inserted, {} skipped, {} failed",
            outcome.inserted,
            skipped.len(),
            outcome.failed.len()
        );

        Ok(RebuildSummary {
            scanned,
            inserted: outcome.inserted,
            skipped: skipped.into_iter().map(|s| s.filename).collect(),
            failed: outcome.failed.into_iter().map(|(f, _)| f).collect(),
        })
    }
}
