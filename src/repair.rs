//! Synthesis of missing filename records.

use std::sync::Arc;

use tracing::{debug, info};

use crate::error::SyncResult;
use crate::store::{CatalogItem, CatalogStore, FilenameRecord};

/// Synthetic filename for an item: `<id>.<format>`.
pub fn synthetic_filename(item: &CatalogItem) -> String {
    format!("{}.{}", item.id, item.format)
}

/// Give every non-deleted catalog item lacking a filename record one.
///
/// Existing records are never touched, so a second run creates nothing.
/// Returns the number of records created.
pub async fn repair_missing_filenames(store: &Arc<dyn CatalogStore>) -> SyncResult<u64> {
    let missing = store.items_without_filename().await?;
    if missing.is_empty() {
        debug!("No items without filename record");
        return Ok(0);
    }

    let mut created = 0;
    for item in &missing {
        let record = FilenameRecord {
            book_id: item.id,
            filename: synthetic_filename(item),
        };
        if store.insert_filename_record(&record).await? {
            created += 1;
        }
    }

    info!(
        "Created {} filename record(s) for {} item(s) without one",
        created,
        missing.len()
    );
    Ok(created)
}
