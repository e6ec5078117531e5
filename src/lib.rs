#[macro_use]
extern crate diesel;
#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate diesel_migrations;

pub mod archive;
pub mod backup;
pub mod catalog;
pub mod config;
pub mod database;
pub mod diff;
pub mod error;
pub mod hash;
pub mod lock;
pub mod models;
pub mod query;
pub mod scan;
pub mod schema;
pub mod store;

pub use archive::{Archive, SaveOptions};
pub use backup::{Backup, BackupOptions, CancelToken, RunReport, RunStatus};
pub use catalog::{Catalog, DeletePolicy};
pub use config::{Config, ConfigManager};
pub use database::Database;
pub use error::{CatalogError, Error, StoreError};
pub use store::{DiskStore, FileStore};
