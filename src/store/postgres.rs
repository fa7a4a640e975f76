//! PostgreSQL-backed catalog store.
//!
//! The catalog tables come from the upstream dumps: `libbook` (items),
//! `libfilename` (display filenames), `libavtor` (book/author links) and
//! `libavtorname` (author names). `deleted` is compared against `'0'`, which
//! matches both the dump's character flag and a boolean column.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::{debug, info, warn};

use super::{
    ArchiveMapping, CatalogItem, CatalogStats, CatalogStore, FilenameRecord,
    MappingReplaceOutcome,
};
use crate::config::DatabaseConfig;
use crate::error::SyncResult;

const CREATE_MAPPING_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS archive_mapping (
        filename TEXT PRIMARY KEY,
        start_id BIGINT NOT NULL,
        end_id BIGINT NOT NULL,
        is_user_format BOOLEAN NOT NULL
    )
"#;

/// Catalog store backed by a PostgreSQL pool.
pub struct PgCatalogStore {
    pool: PgPool,
    search_refresh_statement: String,
}

impl PgCatalogStore {
    /// Wrap an existing pool.
    pub fn new(pool: PgPool, search_refresh_statement: &str) -> Self {
        Self {
            pool,
            search_refresh_statement: search_refresh_statement.to_string(),
        }
    }

    /// Connect using the database configuration.
    pub async fn connect(
        config: &DatabaseConfig,
        search_refresh_statement: &str,
    ) -> SyncResult<Self> {
        info!("Connecting to catalog database");
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connection_timeout))
            .connect(&config.url)
            .await?;
        Ok(Self::new(pool, search_refresh_statement))
    }

    /// Set up a pool that opens its first connection on first use.
    pub fn connect_lazy(
        config: &DatabaseConfig,
        search_refresh_statement: &str,
    ) -> SyncResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connection_timeout))
            .connect_lazy(&config.url)?;
        Ok(Self::new(pool, search_refresh_statement))
    }

    /// Create the archive mapping table if it does not exist yet.
    pub async fn ensure_schema(&self) -> SyncResult<()> {
        sqlx::query(CREATE_MAPPING_TABLE).execute(&self.pool).await?;
        Ok(())
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn scalar(&self, query: &str) -> SyncResult<i64> {
        let row = sqlx::query(query).fetch_one(&self.pool).await?;
        Ok(row.get::<i64, _>(0))
    }
}

#[async_trait]
impl CatalogStore for PgCatalogStore {
    async fn ping(&self) -> SyncResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn replace_archive_mappings(
        &self,
        rows: &[ArchiveMapping],
    ) -> SyncResult<MappingReplaceOutcome> {
        let mut outcome = MappingReplaceOutcome::default();

        // DELETE rather than TRUNCATE so concurrent readers keep seeing the
        // previous table until commit.
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM archive_mapping")
            .execute(&mut *tx)
            .await?;

        for row in rows {
            sqlx::query("SAVEPOINT mapping_row")
                .execute(&mut *tx)
                .await?;
            let result = sqlx::query(
                r#"
                INSERT INTO archive_mapping (filename, start_id, end_id, is_user_format)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (filename) DO NOTHING
                "#,
            )
            .bind(&row.filename)
            .bind(row.start_id)
            .bind(row.end_id)
            .bind(row.is_user_format)
            .execute(&mut *tx)
            .await;

            match result {
                Ok(done) => {
                    sqlx::query("RELEASE SAVEPOINT mapping_row")
                        .execute(&mut *tx)
                        .await?;
                    outcome.inserted += done.rows_affected() as usize;
                }
                Err(e) => {
                    warn!(filename = %row.filename, "Failed to insert archive mapping: {}", e);
                    sqlx::query("ROLLBACK TO SAVEPOINT mapping_row")
                        .execute(&mut *tx)
                        .await?;
                    outcome.failed.push((row.filename.clone(), e.to_string()));
                }
            }
        }

        tx.commit().await?;
        debug!(
            "Replaced archive mappings: {} inserted, {} failed",
            outcome.inserted,
            outcome.failed.len()
        );
        Ok(outcome)
    }

    async fn archive_mappings(&self) -> SyncResult<Vec<ArchiveMapping>> {
        let rows = sqlx::query(
            "SELECT filename, start_id, end_id, is_user_format FROM archive_mapping ORDER BY filename",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| ArchiveMapping {
                filename: row.get("filename"),
                start_id: row.get("start_id"),
                end_id: row.get("end_id"),
                is_user_format: row.get("is_user_format"),
            })
            .collect())
    }

    async fn find_archive(
        &self,
        book_id: i64,
        canonical_format: &str,
    ) -> SyncResult<Option<ArchiveMapping>> {
        let row = sqlx::query(
            r#"
            SELECT m.filename, m.start_id, m.end_id, m.is_user_format
            FROM libbook b
            JOIN archive_mapping m
              ON b.bookid BETWEEN m.start_id AND m.end_id
             AND m.is_user_format = (b.filetype <> $2)
            WHERE b.bookid = $1
            ORDER BY m.filename
            LIMIT 1
            "#,
        )
        .bind(book_id)
        .bind(canonical_format)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| ArchiveMapping {
            filename: row.get("filename"),
            start_id: row.get("start_id"),
            end_id: row.get("end_id"),
            is_user_format: row.get("is_user_format"),
        }))
    }

    async fn count_uncovered_items(&self, canonical_format: &str) -> SyncResult<i64> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*)
            FROM libbook b
            WHERE b.deleted = '0'
              AND NOT EXISTS (
                SELECT 1 FROM archive_mapping m
                WHERE b.bookid BETWEEN m.start_id AND m.end_id
                  AND m.is_user_format = (b.filetype <> $1)
              )
            "#,
        )
        .bind(canonical_format)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>(0))
    }

    async fn count_items_without_filename(&self) -> SyncResult<i64> {
        self.scalar(
            r#"
            SELECT COUNT(*)
            FROM libbook b
            WHERE b.deleted = '0'
              AND NOT EXISTS (SELECT 1 FROM libfilename f WHERE f.bookid = b.bookid)
            "#,
        )
        .await
    }

    async fn count_orphaned_names(&self) -> SyncResult<i64> {
        self.scalar(
            r#"
            SELECT COUNT(*)
            FROM libavtorname n
            WHERE NOT EXISTS (SELECT 1 FROM libavtor a WHERE a.avtorid = n.avtorid)
            "#,
        )
        .await
    }

    async fn count_inverted_ranges(&self) -> SyncResult<i64> {
        self.scalar("SELECT COUNT(*) FROM archive_mapping WHERE start_id > end_id")
            .await
    }

    async fn count_overlapping_ranges(&self) -> SyncResult<i64> {
        self.scalar(
            r#"
            SELECT COUNT(*)
            FROM archive_mapping a
            JOIN archive_mapping b
              ON a.filename < b.filename
             AND a.is_user_format = b.is_user_format
             AND a.start_id <= b.end_id
             AND b.start_id <= a.end_id
            "#,
        )
        .await
    }

    async fn items_without_filename(&self) -> SyncResult<Vec<CatalogItem>> {
        let rows = sqlx::query(
            r#"
            SELECT b.bookid::BIGINT AS id, b.filetype::TEXT AS format
            FROM libbook b
            WHERE b.deleted = '0'
              AND NOT EXISTS (SELECT 1 FROM libfilename f WHERE f.bookid = b.bookid)
            ORDER BY b.bookid
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| CatalogItem {
                id: row.get("id"),
                format: row.get("format"),
                deleted: false,
            })
            .collect())
    }

    async fn insert_filename_record(&self, record: &FilenameRecord) -> SyncResult<bool> {
        let done = sqlx::query(
            r#"
            INSERT INTO libfilename (bookid, filename)
            SELECT $1, $2
            WHERE NOT EXISTS (SELECT 1 FROM libfilename WHERE bookid = $1)
            "#,
        )
        .bind(record.book_id)
        .bind(&record.filename)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() > 0)
    }

    async fn refresh_search_vectors(&self) -> SyncResult<()> {
        info!("Refreshing search vectors");
        sqlx::raw_sql(&self.search_refresh_statement)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn execute_script(&self, script: &str) -> SyncResult<()> {
        sqlx::raw_sql(script).execute(&self.pool).await?;
        Ok(())
    }

    async fn stats(&self) -> SyncResult<CatalogStats> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM libbook) AS items,
                (SELECT COUNT(*) FROM libbook WHERE deleted <> '0') AS deleted_items,
                (SELECT COUNT(*) FROM archive_mapping) AS archive_mappings,
                (SELECT COUNT(*) FROM archive_mapping WHERE is_user_format) AS user_format_mappings,
                (SELECT COUNT(*) FROM libfilename) AS filename_records
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(CatalogStats {
            items: row.get("items"),
            deleted_items: row.get("deleted_items"),
            archive_mappings: row.get("archive_mappings"),
            user_format_mappings: row.get("user_format_mappings"),
            filename_records: row.get("filename_records"),
        })
    }
}
