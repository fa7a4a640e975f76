//! In-memory catalog store.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{
    ranges_overlap, ArchiveMapping, CatalogItem, CatalogStats, CatalogStore, FilenameRecord,
    MappingReplaceOutcome,
};
use crate::error::{SyncError, SyncResult};

#[derive(Debug, Default)]
struct State {
    items: BTreeMap<i64, CatalogItem>,
    filenames: BTreeMap<i64, String>,
    author_names: BTreeSet<i64>,
    author_links: BTreeSet<(i64, i64)>,
    mappings: BTreeMap<String, ArchiveMapping>,
    scripts: Vec<String>,
    search_refreshes: usize,
    unavailable: bool,
    failing: HashSet<String>,
    rejected_rows: HashSet<String>,
}

impl State {
    fn check(&self, operation: &str) -> SyncResult<()> {
        if self.unavailable {
            return Err(SyncError::Store("store unavailable".to_string()));
        }
        if self.failing.contains(operation) {
            return Err(SyncError::Store(format!("{} failed", operation)));
        }
        Ok(())
    }

    fn is_user_format(item: &CatalogItem, canonical_format: &str) -> bool {
        item.format != canonical_format
    }

    fn covering(&self, item: &CatalogItem, canonical_format: &str) -> Option<&ArchiveMapping> {
        let bucket = Self::is_user_format(item, canonical_format);
        self.mappings
            .values()
            .find(|m| m.is_user_format == bucket && m.contains(item.id))
    }
}

/// Catalog store held entirely in memory.
///
/// Used by tests and dry runs. Operations can be made to fail by name with
/// [`MemoryCatalogStore::fail_operation`], and the whole store can be taken
/// offline with [`MemoryCatalogStore::set_unavailable`].
#[derive(Debug, Default)]
pub struct MemoryCatalogStore {
    state: RwLock<State>,
}

impl MemoryCatalogStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a catalog item.
    pub async fn add_item(&self, id: i64, format: &str, deleted: bool) {
        let item = CatalogItem {
            id,
            format: format.to_string(),
            deleted,
        };
        self.state.write().await.items.insert(id, item);
    }

    /// Add a filename record directly.
    pub async fn add_filename(&self, book_id: i64, filename: &str) {
        self.state
            .write()
            .await
            .filenames
            .insert(book_id, filename.to_string());
    }

    /// Add an author name row.
    pub async fn add_author_name(&self, author_id: i64) {
        self.state.write().await.author_names.insert(author_id);
    }

    /// Link an author to a book.
    pub async fn link_author(&self, book_id: i64, author_id: i64) {
        self.state
            .write()
            .await
            .author_links
            .insert((book_id, author_id));
    }

    /// All filename records ordered by book identifier.
    pub async fn filename_records(&self) -> Vec<FilenameRecord> {
        self.state
            .read()
            .await
            .filenames
            .iter()
            .map(|(book_id, filename)| FilenameRecord {
                book_id: *book_id,
                filename: filename.clone(),
            })
            .collect()
    }

    /// Scripts passed to [`CatalogStore::execute_script`], in order.
    pub async fn executed_scripts(&self) -> Vec<String> {
        self.state.read().await.scripts.clone()
    }

    /// Number of search vector refreshes performed.
    pub async fn search_refreshes(&self) -> usize {
        self.state.read().await.search_refreshes
    }

    /// Make every operation fail.
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.write().await.unavailable = unavailable;
    }

    /// Make a single operation, named after its trait method, fail.
    pub async fn fail_operation(&self, operation: &str) {
        self.state
            .write()
            .await
            .failing
            .insert(operation.to_string());
    }

    /// Make inserting the mapping row for `filename` fail.
    pub async fn reject_mapping_row(&self, filename: &str) {
        self.state
            .write()
            .await
            .rejected_rows
            .insert(filename.to_string());
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalogStore {
    async fn ping(&self) -> SyncResult<()> {
        self.state.read().await.check("ping")
    }

    async fn replace_archive_mappings(
        &self,
        rows: &[ArchiveMapping],
    ) -> SyncResult<MappingReplaceOutcome> {
        let mut state = self.state.write().await;
        state.check("replace_archive_mappings")?;

        let mut replacement = BTreeMap::new();
        let mut outcome = MappingReplaceOutcome::default();
        for row in rows {
            if state.rejected_rows.contains(&row.filename) {
                outcome
                    .failed
                    .push((row.filename.clone(), "row rejected".to_string()));
                continue;
            }
            if replacement.contains_key(&row.filename) {
                continue;
            }
            replacement.insert(row.filename.clone(), row.clone());
            outcome.inserted += 1;
        }
        state.mappings = replacement;
        Ok(outcome)
    }

    async fn archive_mappings(&self) -> SyncResult<Vec<ArchiveMapping>> {
        let state = self.state.read().await;
        state.check("archive_mappings")?;
        Ok(state.mappings.values().cloned().collect())
    }

    async fn find_archive(
        &self,
        book_id: i64,
        canonical_format: &str,
    ) -> SyncResult<Option<ArchiveMapping>> {
        let state = self.state.read().await;
        state.check("find_archive")?;
        Ok(state
            .items
            .get(&book_id)
            .and_then(|item| state.covering(item, canonical_format))
            .cloned())
    }

    async fn count_uncovered_items(&self, canonical_format: &str) -> SyncResult<i64> {
        let state = self.state.read().await;
        state.check("count_uncovered_items")?;
        Ok(state
            .items
            .values()
            .filter(|item| !item.deleted && state.covering(item, canonical_format).is_none())
            .count() as i64)
    }

    async fn count_items_without_filename(&self) -> SyncResult<i64> {
        let state = self.state.read().await;
        state.check("count_items_without_filename")?;
        Ok(state
            .items
            .values()
            .filter(|item| !item.deleted && !state.filenames.contains_key(&item.id))
            .count() as i64)
    }

    async fn count_orphaned_names(&self) -> SyncResult<i64> {
        let state = self.state.read().await;
        state.check("count_orphaned_names")?;
        let linked: BTreeSet<i64> = state.author_links.iter().map(|(_, a)| *a).collect();
        Ok(state
            .author_names
            .iter()
            .filter(|author_id| !linked.contains(author_id))
            .count() as i64)
    }

    async fn count_inverted_ranges(&self) -> SyncResult<i64> {
        let state = self.state.read().await;
        state.check("count_inverted_ranges")?;
        Ok(state
            .mappings
            .values()
            .filter(|m| m.start_id > m.end_id)
            .count() as i64)
    }

    async fn count_overlapping_ranges(&self) -> SyncResult<i64> {
        let state = self.state.read().await;
        state.check("count_overlapping_ranges")?;
        let rows: Vec<&ArchiveMapping> = state.mappings.values().collect();
        let mut pairs = 0;
        for (i, a) in rows.iter().enumerate() {
            for b in &rows[i + 1..] {
                if a.is_user_format == b.is_user_format && ranges_overlap(a, b) {
                    pairs += 1;
                }
            }
        }
        Ok(pairs)
    }

    async fn items_without_filename(&self) -> SyncResult<Vec<CatalogItem>> {
        let state = self.state.read().await;
        state.check("items_without_filename")?;
        Ok(state
            .items
            .values()
            .filter(|item| !item.deleted && !state.filenames.contains_key(&item.id))
            .cloned()
            .collect())
    }

    async fn insert_filename_record(&self, record: &FilenameRecord) -> SyncResult<bool> {
        let mut state = self.state.write().await;
        state.check("insert_filename_record")?;
        if state.filenames.contains_key(&record.book_id) {
            return Ok(false);
        }
        state
            .filenames
            .insert(record.book_id, record.filename.clone());
        Ok(true)
    }

    async fn refresh_search_vectors(&self) -> SyncResult<()> {
        let mut state = self.state.write().await;
        state.check("refresh_search_vectors")?;
        state.search_refreshes += 1;
        Ok(())
    }

    async fn execute_script(&self, script: &str) -> SyncResult<()> {
        let mut state = self.state.write().await;
        state.check("execute_script")?;
        state.scripts.push(script.to_string());
        Ok(())
    }

    async fn stats(&self) -> SyncResult<CatalogStats> {
        let state = self.state.read().await;
        state.check("stats")?;
        Ok(CatalogStats {
            items: state.items.len() as i64,
            deleted_items: state.items.values().filter(|i| i.deleted).count() as i64,
            archive_mappings: state.mappings.len() as i64,
            user_format_mappings: state
                .mappings
                .values()
                .filter(|m| m.is_user_format)
                .count() as i64,
            filename_records: state.filenames.len() as i64,
        })
    }
}
