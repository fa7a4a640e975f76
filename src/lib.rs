//! Catalog archive synchronization and maintenance engine.
//!
//! Keeps a book catalog's derived tables in step with the distribution
//! archives it is published as: the identifier-range archive mapping, the
//! filename records and the search vectors. Work runs on a cron-style
//! schedule and on demand through the admin interface or the CLI.

pub mod artifacts;
pub mod config;
pub mod env;
pub mod error;
pub mod filename;
pub mod health;
pub mod logging;
pub mod manager;
pub mod progress;
pub mod registry;
pub mod repair;
pub mod scanner;
pub mod store;
pub mod web;

pub use error::{SyncError, SyncResult};
