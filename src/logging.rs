//! Logging setup shared by the binary's subcommands.

use tracing_subscriber::EnvFilter;

#[derive(clap::Args, Debug, Clone, Default)]
#[group()]
pub struct LoggingArgs {
    /// Enable debug mode.
    #[arg(long, default_value_t = false)]
    pub debug: bool,

    /// Emit logs as JSON lines.
    #[arg(long, default_value_t = false, env = "CATALOG_SYNC_JSON_LOGS")]
    pub json_logs: bool,
}

impl LoggingArgs {
    pub fn init(&self) {
        init_logging(self.json_logs, self.debug);
    }
}

/// Filter used when `RUST_LOG` is not set.
fn default_directives(debug_mode: bool) -> &'static str {
    if debug_mode {
        "catalog_sync=debug,tower_http=debug,info"
    } else {
        "catalog_sync=info,warn"
    }
}

pub fn init_logging(json: bool, debug_mode: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(debug_mode)));

    let builder = tracing_subscriber::fmt().with_env_filter(env_filter);
    // A subscriber may already be installed, e.g. by a test harness.
    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if let Err(e) = result {
        eprintln!("Logging already initialized: {}", e);
    }
}
