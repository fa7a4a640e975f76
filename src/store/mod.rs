//! Catalog store abstraction.
//!
//! The catalog itself (items, filename records, author tables) is owned by
//! the external dump loader; this engine reads it, maintains the archive
//! mapping table and repairs missing filename records.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SyncResult;
use crate::filename::ArchiveDescriptor;

mod memory;
mod postgres;

pub use memory::MemoryCatalogStore;
pub use postgres::PgCatalogStore;

/// Association between a distribution archive and the identifiers it holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveMapping {
    /// Archive filename, unique.
    pub filename: String,
    /// First identifier, inclusive.
    pub start_id: i64,
    /// Last identifier, inclusive.
    pub end_id: i64,
    /// Whether the archive holds non-canonical formats.
    pub is_user_format: bool,
}

impl ArchiveMapping {
    /// Build a mapping row from a parsed archive filename.
    pub fn from_descriptor(filename: &str, descriptor: &ArchiveDescriptor) -> Self {
        Self {
            filename: filename.to_string(),
            start_id: descriptor.start_id,
            end_id: descriptor.end_id,
            is_user_format: descriptor.is_user_format,
        }
    }

    /// Whether `book_id` falls inside this archive's range.
    pub fn contains(&self, book_id: i64) -> bool {
        self.start_id <= book_id && book_id <= self.end_id
    }
}

/// A book in the source-of-truth catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogItem {
    /// Book identifier.
    pub id: i64,
    /// Format tag, e.g. `fb2`.
    pub format: String,
    /// Whether the item has been withdrawn.
    pub deleted: bool,
}

/// Display filename for a catalog item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilenameRecord {
    /// Book identifier.
    pub book_id: i64,
    /// Filename shown to readers.
    pub filename: String,
}

/// Outcome of replacing the archive mapping table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingReplaceOutcome {
    /// Rows that made it into the table.
    pub inserted: usize,
    /// Rows that failed, with the store's error message.
    pub failed: Vec<(String, String)>,
}

/// Summary counters over the catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogStats {
    /// All catalog items.
    pub items: i64,
    /// Withdrawn catalog items.
    pub deleted_items: i64,
    /// Rows in the archive mapping table.
    pub archive_mappings: i64,
    /// Mapping rows in the user-format bucket.
    pub user_format_mappings: i64,
    /// Filename records.
    pub filename_records: i64,
}

/// Access to the catalog and its derived tables.
///
/// `canonical_format` is passed to every bucket-sensitive query: an item is
/// in the user-format bucket exactly when its format differs from it.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Cheap connectivity probe.
    async fn ping(&self) -> SyncResult<()>;

    /// Clear the archive mapping table and insert `rows`.
    ///
    /// Per-row failures are reported in the outcome rather than aborting the
    /// replacement. Duplicate filenames keep the first row.
    async fn replace_archive_mappings(
        &self,
        rows: &[ArchiveMapping],
    ) -> SyncResult<MappingReplaceOutcome>;

    /// All archive mappings ordered by filename.
    async fn archive_mappings(&self) -> SyncResult<Vec<ArchiveMapping>>;

    /// The archive holding `book_id`, honouring its format bucket.
    async fn find_archive(
        &self,
        book_id: i64,
        canonical_format: &str,
    ) -> SyncResult<Option<ArchiveMapping>>;

    /// Non-deleted items not covered by any mapping of their bucket.
    async fn count_uncovered_items(&self, canonical_format: &str) -> SyncResult<i64>;

    /// Non-deleted items lacking a filename record.
    async fn count_items_without_filename(&self) -> SyncResult<i64>;

    /// Author name rows whose author is not linked from any book.
    async fn count_orphaned_names(&self) -> SyncResult<i64>;

    /// Mapping rows with `start_id > end_id`.
    async fn count_inverted_ranges(&self) -> SyncResult<i64>;

    /// Pairs of same-bucket mapping rows whose ranges intersect.
    async fn count_overlapping_ranges(&self) -> SyncResult<i64>;

    /// Non-deleted items lacking a filename record, ordered by identifier.
    async fn items_without_filename(&self) -> SyncResult<Vec<CatalogItem>>;

    /// Insert a filename record unless the item already has one.
    ///
    /// Returns whether a row was created.
    async fn insert_filename_record(&self, record: &FilenameRecord) -> SyncResult<bool>;

    /// Refresh the full-text search vectors.
    async fn refresh_search_vectors(&self) -> SyncResult<()>;

    /// Run an SQL script, typically a dump, against the store.
    async fn execute_script(&self, script: &str) -> SyncResult<()>;

    /// Summary counters.
    async fn stats(&self) -> SyncResult<CatalogStats>;
}

/// Whether two inclusive ranges intersect.
pub(crate) fn ranges_overlap(a: &ArchiveMapping, b: &ArchiveMapping) -> bool {
    a.start_id <= b.end_id && b.start_id <= a.end_id
}
