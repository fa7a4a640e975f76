//! Shared fixtures for integration tests.
#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use catalog_sync::artifacts::{ArtifactFetcher, LocalFetcher};
use catalog_sync::config::SyncConfig;
use catalog_sync::manager::MaintenanceOrchestrator;
use catalog_sync::store::{CatalogStore, MemoryCatalogStore};
use tempfile::TempDir;

/// A mirror origin plus local working directories.
pub struct Fixture {
    pub mirror: TempDir,
    pub work: TempDir,
    pub store: Arc<MemoryCatalogStore>,
    pub orchestrator: MaintenanceOrchestrator,
}

impl Fixture {
    pub fn new() -> Self {
        let mirror = TempDir::new().unwrap();
        for collection in ["sql", "covers", "daily"] {
            std::fs::create_dir(mirror.path().join(collection)).unwrap();
        }
        let work = TempDir::new().unwrap();

        let mut config = SyncConfig::default();
        config.paths.archive_dir = work.path().join("archives");
        config.paths.cover_dir = work.path().join("cache");
        config.paths.sql_dir = work.path().join("sql");
        config.origin.mirror_dir = Some(mirror.path().to_path_buf());
        std::fs::create_dir(&config.paths.archive_dir).unwrap();

        let store = Arc::new(MemoryCatalogStore::new());
        let fetcher: Arc<dyn ArtifactFetcher> = Arc::new(LocalFetcher::new(mirror.path()));
        let orchestrator = MaintenanceOrchestrator::new(
            config,
            Arc::clone(&store) as Arc<dyn CatalogStore>,
            fetcher,
        )
        .unwrap();

        Self {
            mirror,
            work,
            store,
            orchestrator,
        }
    }

    /// Publish an artifact on the mirror.
    pub fn publish(&self, collection: &str, name: &str, content: &[u8]) {
        std::fs::write(self.mirror.path().join(collection).join(name), content).unwrap();
    }

    /// Place an archive in the local archive directory.
    pub fn place_archive(&self, name: &str) {
        std::fs::write(self.archive_dir().join(name), b"PK").unwrap();
    }

    pub fn archive_dir(&self) -> &Path {
        &self.orchestrator.config().paths.archive_dir
    }
}
