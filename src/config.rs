//! Configuration for the catalog synchronization engine.
//!
//! Values are resolved from defaults, then an optional JSON file, then
//! `CATALOG_SYNC_*` environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::env::EnvParser;
use crate::error::{SyncError, SyncResult};
use crate::filename::{ArchiveFilenameParser, DEFAULT_CANONICAL_FORMAT, DEFAULT_EXCLUDED_ARCHIVES};
use crate::registry::Schedule;

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "CATALOG_SYNC";

/// Local directories the engine reads and writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Distribution archives (`f.<format>.<start>-<end>.zip`).
    pub archive_dir: PathBuf,
    /// Cover archives.
    pub cover_dir: PathBuf,
    /// SQL dumps.
    pub sql_dir: PathBuf,
}

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database connection URL.
    pub url: String,
    /// Maximum number of connections in pool.
    pub max_connections: u32,
    /// Connection timeout (seconds).
    pub connection_timeout: u64,
}

/// Where distribution artifacts are fetched from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OriginConfig {
    /// Base URL of the HTTP origin.
    pub base_url: String,
    /// Local mirror directory; takes precedence over `base_url` when set.
    pub mirror_dir: Option<PathBuf>,
    /// Per-request timeout (seconds).
    pub timeout: u64,
}

/// Schedule for one maintenance task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskScheduleConfig {
    /// Five-field cron expression.
    pub cron: String,
    /// Whether the schedule is armed at start-up.
    pub enabled: bool,
}

impl TaskScheduleConfig {
    fn new(cron: &str) -> Self {
        Self {
            cron: cron.to_string(),
            enabled: true,
        }
    }
}

/// Schedules for the bound maintenance tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// IANA time zone the cron expressions are interpreted in.
    pub timezone: String,
    /// Daily delta fetch, mapping rebuild and filename repair.
    pub daily_update: TaskScheduleConfig,
    /// Full-text search vector refresh.
    pub search_vectors: TaskScheduleConfig,
    /// Catalog health check.
    pub health_check: TaskScheduleConfig,
    /// Bulk SQL dump and cover download.
    pub bulk_download: TaskScheduleConfig,
}

/// Admin HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_address: String,
}

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Local directories.
    pub paths: PathsConfig,
    /// Database configuration.
    pub database: DatabaseConfig,
    /// Artifact origin.
    pub origin: OriginConfig,
    /// Task schedules.
    pub schedule: ScheduleConfig,
    /// Admin server.
    pub server: ServerConfig,
    /// Canonical ebook format; every other format is a user format.
    pub canonical_format: String,
    /// Archive filenames never indexed or fetched.
    pub excluded_archives: Vec<String>,
    /// Statement run to refresh full-text search vectors.
    pub search_refresh_statement: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            archive_dir: PathBuf::from("/var/lib/catalog-sync/archives"),
            cover_dir: PathBuf::from("/var/lib/catalog-sync/cache"),
            sql_dir: PathBuf::from("/var/lib/catalog-sync/sql"),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost/catalog".to_string(),
            max_connections: 10,
            connection_timeout: 30,
        }
    }
}

impl Default for OriginConfig {
    fn default() -> Self {
        Self {
            base_url: "http://flibusta.is".to_string(),
            mirror_dir: None,
            timeout: 60 * 30,
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            timezone: "UTC".to_string(),
            daily_update: TaskScheduleConfig::new("0 3 * * *"),
            search_vectors: TaskScheduleConfig::new("30 4 * * *"),
            health_check: TaskScheduleConfig::new("0 */6 * * *"),
            bulk_download: TaskScheduleConfig::new("0 2 * * 0"),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:9090".to_string(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            database: DatabaseConfig::default(),
            origin: OriginConfig::default(),
            schedule: ScheduleConfig::default(),
            server: ServerConfig::default(),
            canonical_format: DEFAULT_CANONICAL_FORMAT.to_string(),
            excluded_archives: DEFAULT_EXCLUDED_ARCHIVES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            search_refresh_statement: "SELECT update_search_vectors()".to_string(),
        }
    }
}

impl OriginConfig {
    /// Request timeout as a duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

impl SyncConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> SyncResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SyncError::Configuration(format!("Failed to read config file: {}", e))
        })?;

        serde_json::from_str(&content)
            .map_err(|e| SyncError::Configuration(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to a JSON file.
    pub fn to_file(&self, path: &Path) -> SyncResult<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load from `path` when it exists, apply environment overrides and validate.
    pub fn load(path: Option<&Path>) -> SyncResult<Self> {
        let mut config = match path {
            Some(path) if path.exists() => Self::from_file(path)?,
            Some(path) => {
                return Err(SyncError::Configuration(format!(
                    "Config file not found: {}",
                    path.display()
                )))
            }
            None => Self::default(),
        };
        config.apply_env(&EnvParser::with_prefix(ENV_PREFIX))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides.
    ///
    /// The time zone falls back to the unprefixed `TZ` variable.
    pub fn apply_env(&mut self, parser: &EnvParser) -> SyncResult<()> {
        if let Some(dir) = parser.get_string("ARCHIVE_DIR") {
            self.paths.archive_dir = PathBuf::from(dir);
        }
        if let Some(dir) = parser.get_string("COVER_DIR") {
            self.paths.cover_dir = PathBuf::from(dir);
        }
        if let Some(dir) = parser.get_string("SQL_DIR") {
            self.paths.sql_dir = PathBuf::from(dir);
        }
        if let Some(url) = parser.get_string("DATABASE_URL") {
            self.database.url = url;
        }
        if let Some(max) = parser.get_u32("DATABASE_MAX_CONNECTIONS")? {
            self.database.max_connections = max;
        }
        if let Some(url) = parser.get_string("ORIGIN_URL") {
            self.origin.base_url = url;
        }
        if let Some(dir) = parser.get_string("MIRROR_DIR") {
            self.origin.mirror_dir = Some(PathBuf::from(dir));
        }
        if let Some(timeout) = parser.get_u64("ORIGIN_TIMEOUT")? {
            self.origin.timeout = timeout;
        }
        if let Some(format) = parser.get_string("CANONICAL_FORMAT") {
            self.canonical_format = format;
        }
        if let Some(excluded) = parser.get_string_list("EXCLUDED_ARCHIVES") {
            self.excluded_archives = excluded;
        }
        if let Some(bind) = parser.get_string("BIND_ADDRESS") {
            self.server.bind_address = bind;
        }
        if let Some(timezone) = parser
            .get_string("TIMEZONE")
            .or_else(|| EnvParser::new().get_string("TZ"))
        {
            self.schedule.timezone = timezone;
        }
        if let Some(enabled) = parser.get_bool("DAILY_UPDATE_ENABLED")? {
            self.schedule.daily_update.enabled = enabled;
        }
        if let Some(cron) = parser.get_string("DAILY_UPDATE_CRON") {
            self.schedule.daily_update.cron = cron;
        }
        if let Some(cron) = parser.get_string("SEARCH_VECTORS_CRON") {
            self.schedule.search_vectors.cron = cron;
        }
        if let Some(cron) = parser.get_string("HEALTH_CHECK_CRON") {
            self.schedule.health_check.cron = cron;
        }
        if let Some(cron) = parser.get_string("BULK_DOWNLOAD_CRON") {
            self.schedule.bulk_download.cron = cron;
        }
        Ok(())
    }

    /// Validate the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.canonical_format.is_empty() || self.canonical_format.contains('.') {
            return Err(SyncError::Configuration(format!(
                "Invalid canonical format '{}'",
                self.canonical_format
            )));
        }

        if self.database.url.is_empty() {
            return Err(SyncError::Configuration(
                "Database URL cannot be empty".to_string(),
            ));
        }

        self.timezone()?;

        for task in [
            &self.schedule.daily_update,
            &self.schedule.search_vectors,
            &self.schedule.health_check,
            &self.schedule.bulk_download,
        ] {
            Schedule::parse(&task.cron)?;
        }

        Ok(())
    }

    /// The configured scheduling time zone.
    pub fn timezone(&self) -> SyncResult<Tz> {
        self.schedule.timezone.parse::<Tz>().map_err(|e| {
            SyncError::Configuration(format!(
                "Invalid time zone '{}': {}",
                self.schedule.timezone, e
            ))
        })
    }

    /// Filename parser for the configured format and deny-list.
    pub fn filename_parser(&self) -> ArchiveFilenameParser {
        ArchiveFilenameParser::new(&self.canonical_format, self.excluded_archives.iter().cloned())
    }
}
