//! End-to-end maintenance runs against an in-memory catalog and a local mirror.

mod common;

use std::io::Write;

use catalog_sync::manager::{
    BULK_DOWNLOAD_TASK, DAILY_UPDATE_TASK, HEALTH_CHECK_TASK, SEARCH_VECTORS_TASK,
};
use catalog_sync::progress::BulkStatus;
use catalog_sync::registry::{handler, TriggerOutcome};
use catalog_sync::store::{CatalogStore, FilenameRecord};
use catalog_sync::SyncError;
use common::Fixture;

fn gzip(content: &[u8]) -> Vec<u8> {
    let mut encoder =
        flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(content).unwrap();
    encoder.finish().unwrap()
}

#[tokio::test]
async fn test_rebuild_skips_deny_listed_archive() {
    let fixture = Fixture::new();
    fixture.place_archive("f.fb2.000001-000100.zip");
    fixture.place_archive("f.fb2.000101-000200.zip");
    fixture.place_archive("d.fb2-009999.zip");

    let summary = fixture.orchestrator.update_zip_mappings().await.unwrap();
    assert_eq!(summary.inserted, 2);

    let mappings = fixture.store.archive_mappings().await.unwrap();
    assert_eq!(mappings.len(), 2);
    assert!(mappings.iter().all(|m| !m.is_user_format));
    assert!(mappings.iter().all(|m| m.filename != "d.fb2-009999.zip"));
}

#[tokio::test]
async fn test_health_check_reports_uncovered_item() {
    let fixture = Fixture::new();
    fixture.store.add_item(150, "fb2", false).await;
    fixture.store.add_filename(150, "150.fb2").await;

    let report = fixture.orchestrator.health_check().await;
    assert!(!report.healthy);
    assert_eq!(report.issues, vec!["1 items without archive mapping".to_string()]);
}

#[tokio::test]
async fn test_duplicate_registration_changes_nothing() {
    let fixture = Fixture::new();
    let registry = fixture.orchestrator.registry();
    fixture.orchestrator.register_tasks().await.unwrap();
    registry.set_enabled(DAILY_UPDATE_TASK, false).await.unwrap();

    let result = registry
        .register(DAILY_UPDATE_TASK, "0 3 * * *", handler(|| async { Ok(()) }))
        .await;
    assert!(matches!(result, Err(SyncError::DuplicateTask(_))));

    let status = fixture.orchestrator.status().await;
    assert_eq!(status.len(), 4);
    assert!(!status[DAILY_UPDATE_TASK].enabled);

    // Registering the bound tasks again keeps the operator's choice too.
    fixture.orchestrator.register_tasks().await.unwrap();
    assert!(!fixture.orchestrator.status().await[DAILY_UPDATE_TASK].enabled);
}

#[tokio::test]
async fn test_unknown_task_names() {
    let fixture = Fixture::new();
    fixture.orchestrator.register_tasks().await.unwrap();

    assert!(matches!(
        fixture.orchestrator.set_enabled("nonexistent", false).await,
        Err(SyncError::TaskNotFound(_))
    ));
    assert!(matches!(
        fixture.orchestrator.run_now("nonexistent").await,
        Err(SyncError::TaskNotFound(_))
    ));
}

#[tokio::test]
async fn test_create_missing_filenames() {
    let fixture = Fixture::new();
    fixture.store.add_item(1, "fb2", false).await;
    fixture.store.add_item(2, "fb2", false).await;
    fixture.store.add_item(3, "fb2", false).await;
    fixture.store.add_filename(1, "Existing.fb2").await;

    assert_eq!(fixture.orchestrator.create_missing_filenames().await.unwrap(), 2);
    assert_eq!(fixture.orchestrator.create_missing_filenames().await.unwrap(), 0);
    assert_eq!(
        fixture.store.filename_records().await[0],
        FilenameRecord {
            book_id: 1,
            filename: "Existing.fb2".to_string(),
        }
    );
}

#[tokio::test]
async fn test_daily_update_task() {
    let fixture = Fixture::new();
    fixture.publish("daily", "f.fb2.000001-000100.zip", b"PK");
    fixture.publish("daily", "f.usr.000101-000150.zip", b"PK");
    fixture.publish("daily", "d.fb2-009999.zip", b"PK");
    fixture.publish("daily", "index.html", b"<html/>");
    fixture.place_archive("f.fb2.000200-000300.zip");

    fixture.store.add_item(50, "fb2", false).await;
    fixture.store.add_item(120, "pdf", false).await;
    fixture.store.add_item(250, "fb2", false).await;

    fixture.orchestrator.register_tasks().await.unwrap();
    assert_eq!(
        fixture.orchestrator.run_now(DAILY_UPDATE_TASK).await.unwrap(),
        TriggerOutcome::Completed
    );

    assert!(fixture.archive_dir().join("f.fb2.000001-000100.zip").exists());
    assert!(!fixture.archive_dir().join("d.fb2-009999.zip").exists());
    assert!(!fixture.archive_dir().join("index.html").exists());

    let mappings = fixture.store.archive_mappings().await.unwrap();
    assert_eq!(mappings.len(), 3);
    assert_eq!(mappings.iter().filter(|m| m.is_user_format).count(), 1);
    assert_eq!(fixture.store.filename_records().await.len(), 3);

    assert!(fixture.orchestrator.health_check().await.healthy);

    let status = fixture.orchestrator.status().await;
    assert!(status[DAILY_UPDATE_TASK].last_run.is_some());
    assert!(status[DAILY_UPDATE_TASK].last_error.is_none());
}

#[tokio::test]
async fn test_daily_update_survives_unreachable_origin() {
    let fixture = Fixture::new();
    std::fs::remove_dir(fixture.mirror.path().join("daily")).unwrap();
    fixture.place_archive("f.fb2.000001-000100.zip");
    fixture.store.add_item(1, "fb2", false).await;

    let summary = fixture.orchestrator.daily_update_task().await.unwrap();
    assert!(summary.fetch.is_none());
    assert_eq!(summary.rebuild.inserted, 1);
    assert_eq!(summary.filenames_created, 1);
}

#[tokio::test]
async fn test_update_daily_fetches_only_new_archives() {
    let fixture = Fixture::new();
    fixture.publish("daily", "f.fb2.000001-000100.zip", b"new");
    fixture.publish("daily", "f.fb2.000101-000200.zip", b"new");
    std::fs::write(fixture.archive_dir().join("f.fb2.000001-000100.zip"), b"old").unwrap();

    let summary = fixture.orchestrator.update_daily().await.unwrap();
    assert_eq!(summary.fetched, vec!["f.fb2.000101-000200.zip".to_string()]);
    assert_eq!(summary.skipped, 1);
    assert_eq!(
        std::fs::read(fixture.archive_dir().join("f.fb2.000001-000100.zip")).unwrap(),
        b"old"
    );

    let progress = fixture.orchestrator.bulk_progress().await;
    assert_eq!(progress.status, BulkStatus::Completed);
    assert_eq!(progress.operation.as_deref(), Some("update-daily"));
    assert_eq!((progress.processed, progress.total), (1, 1));
}

#[tokio::test]
async fn test_bulk_download_task() {
    let fixture = Fixture::new();
    fixture.publish("sql", "lib.libbook.sql", b"INSERT INTO libbook VALUES (1);");
    fixture.publish("sql", "lib.libavtor.sql.gz", &gzip(b"INSERT INTO libavtor VALUES (1, 7);"));
    fixture.publish("sql", "README", b"ignored");
    fixture.publish("covers", "f.n.000001-000100.zip", b"covers");

    fixture.orchestrator.register_tasks().await.unwrap();
    assert_eq!(
        fixture.orchestrator.run_now(BULK_DOWNLOAD_TASK).await.unwrap(),
        TriggerOutcome::Completed
    );

    let mut scripts = fixture.store.executed_scripts().await;
    scripts.sort();
    assert_eq!(
        scripts,
        vec![
            "INSERT INTO libavtor VALUES (1, 7);".to_string(),
            "INSERT INTO libbook VALUES (1);".to_string(),
        ]
    );

    let config = fixture.orchestrator.config();
    assert!(config.paths.cover_dir.join("f.n.000001-000100.zip").exists());
    assert!(!config.paths.sql_dir.join("README").exists());

    let progress = fixture.orchestrator.bulk_progress().await;
    assert_eq!(progress.operation.as_deref(), Some("download-covers"));
    assert_eq!(progress.status, BulkStatus::Completed);
}

#[tokio::test]
async fn test_sql_import_failures_are_counted() {
    let fixture = Fixture::new();
    fixture.publish("sql", "lib.libbook.sql", b"SELECT 1;");
    fixture.publish("sql", "lib.broken.sql.gz", b"not gzip at all");
    fixture.store.fail_operation("execute_script").await;

    let summary = fixture.orchestrator.download_sql().await.unwrap();
    assert_eq!(summary.fetch.fetched.len(), 2);
    assert!(summary.imported.is_empty());
    assert_eq!(summary.failed.len(), 2);

    let progress = fixture.orchestrator.bulk_progress().await;
    assert_eq!(progress.status, BulkStatus::Completed);
    assert_eq!(progress.errors, 2);
}

#[tokio::test]
async fn test_covers_are_refreshed() {
    let fixture = Fixture::new();
    let cover_dir = fixture.orchestrator.config().paths.cover_dir.clone();
    std::fs::create_dir_all(&cover_dir).unwrap();
    std::fs::write(cover_dir.join("covers.zip"), b"stale").unwrap();
    fixture.publish("covers", "covers.zip", b"fresh");

    let summary = fixture.orchestrator.download_covers().await.unwrap();
    assert_eq!(summary.fetched, vec!["covers.zip".to_string()]);
    assert_eq!(std::fs::read(cover_dir.join("covers.zip")).unwrap(), b"fresh");
}

#[tokio::test]
async fn test_unreachable_sql_collection_marks_progress_error() {
    let fixture = Fixture::new();
    std::fs::remove_dir(fixture.mirror.path().join("sql")).unwrap();

    assert!(matches!(
        fixture.orchestrator.download_sql().await,
        Err(SyncError::ExternalFetch(_))
    ));
    assert_eq!(
        fixture.orchestrator.bulk_progress().await.status,
        BulkStatus::Error
    );
}

#[tokio::test]
async fn test_bulk_download_fetches_covers_when_sql_unreachable() {
    let fixture = Fixture::new();
    std::fs::remove_dir(fixture.mirror.path().join("sql")).unwrap();
    fixture.publish("covers", "f.n.000001-000100.zip", b"covers");

    fixture.orchestrator.register_tasks().await.unwrap();
    assert_eq!(
        fixture.orchestrator.run_now(BULK_DOWNLOAD_TASK).await.unwrap(),
        TriggerOutcome::Completed
    );

    let cover_dir = &fixture.orchestrator.config().paths.cover_dir;
    assert!(cover_dir.join("f.n.000001-000100.zip").exists());
    assert!(fixture.store.executed_scripts().await.is_empty());
}

#[tokio::test]
async fn test_bulk_download_fails_when_origin_unreachable() {
    let fixture = Fixture::new();
    std::fs::remove_dir(fixture.mirror.path().join("sql")).unwrap();
    std::fs::remove_dir(fixture.mirror.path().join("covers")).unwrap();

    assert!(matches!(
        fixture.orchestrator.bulk_download_task().await,
        Err(SyncError::ExternalFetch(ref e)) if e.starts_with("sql")
    ));
}

#[tokio::test]
async fn test_failed_task_stays_registered() {
    let fixture = Fixture::new();
    fixture.orchestrator.register_tasks().await.unwrap();
    fixture.store.set_unavailable(true).await;

    let outcome = fixture.orchestrator.run_now(SEARCH_VECTORS_TASK).await.unwrap();
    assert!(matches!(outcome, TriggerOutcome::Failed(_)));
    let status = fixture.orchestrator.status().await;
    assert!(status[SEARCH_VECTORS_TASK].last_error.is_some());

    fixture.store.set_unavailable(false).await;
    assert_eq!(
        fixture.orchestrator.run_now(SEARCH_VECTORS_TASK).await.unwrap(),
        TriggerOutcome::Completed
    );
    assert_eq!(fixture.store.search_refreshes().await, 1);
    assert!(fixture.orchestrator.status().await[SEARCH_VECTORS_TASK]
        .last_error
        .is_none());
}

#[tokio::test]
async fn test_health_check_task_does_not_fail_on_findings() {
    let fixture = Fixture::new();
    fixture.store.add_item(150, "fb2", false).await;
    fixture.orchestrator.register_tasks().await.unwrap();

    assert_eq!(
        fixture.orchestrator.run_now(HEALTH_CHECK_TASK).await.unwrap(),
        TriggerOutcome::Completed
    );
}

#[tokio::test]
async fn test_disabled_schedule_from_config() {
    let mut fixture = Fixture::new();
    let mut config = fixture.orchestrator.config().clone();
    config.schedule.bulk_download.enabled = false;
    fixture.orchestrator = catalog_sync::manager::MaintenanceOrchestrator::new(
        config,
        fixture.store.clone(),
        std::sync::Arc::new(catalog_sync::artifacts::LocalFetcher::new(fixture.mirror.path())),
    )
    .unwrap();

    fixture.orchestrator.register_tasks().await.unwrap();
    let status = fixture.orchestrator.status().await;
    assert!(!status[BULK_DOWNLOAD_TASK].enabled);
    assert!(status[BULK_DOWNLOAD_TASK].next_run.is_none());
    assert!(status[HEALTH_CHECK_TASK].enabled);
    assert!(status[HEALTH_CHECK_TASK].next_run.is_some());

    // Disabled schedules can still be run by hand.
    assert_eq!(
        fixture.orchestrator.run_now(BULK_DOWNLOAD_TASK).await.unwrap(),
        TriggerOutcome::Completed
    );
}

#[tokio::test]
async fn test_start_and_stop() {
    let fixture = Fixture::new();
    fixture.orchestrator.start().await.unwrap();
    fixture.orchestrator.start().await.unwrap();
    assert!(fixture.orchestrator.registry().is_started().await);
    assert_eq!(fixture.orchestrator.status().await.len(), 4);

    fixture.orchestrator.stop().await;
    assert!(!fixture.orchestrator.registry().is_started().await);
    assert!(fixture.orchestrator.status().await.is_empty());

    // A stopped orchestrator can be started again.
    fixture.orchestrator.start().await.unwrap();
    assert_eq!(fixture.orchestrator.status().await.len(), 4);
    fixture.orchestrator.stop().await;
}

#[tokio::test]
async fn test_find_archive_and_stats() {
    let fixture = Fixture::new();
    fixture.place_archive("f.fb2.000001-000100.zip");
    fixture.place_archive("f.usr.000001-000100.zip");
    fixture.store.add_item(42, "epub", false).await;
    fixture.store.add_item(43, "fb2", true).await;
    fixture.orchestrator.update_zip_mappings().await.unwrap();

    let mapping = fixture.orchestrator.find_archive(42).await.unwrap().unwrap();
    assert_eq!(mapping.filename, "f.usr.000001-000100.zip");
    assert!(fixture.orchestrator.find_archive(500).await.unwrap().is_none());

    let stats = fixture.orchestrator.stats().await.unwrap();
    assert_eq!(stats.items, 2);
    assert_eq!(stats.deleted_items, 1);
    assert_eq!(stats.archive_mappings, 2);
    assert_eq!(stats.user_format_mappings, 1);
    assert_eq!(stats.filename_records, 0);
}
