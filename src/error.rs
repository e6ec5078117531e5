use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Conditions that abort a whole run (or a save-level operation).
///
/// Per-file problems never show up here, they are collected as
/// [`PathOutcome`](crate::backup::PathOutcome)s in the run report instead.
#[derive(Error, Debug)]
pub enum Error {
    #[error("save root \"{}\" is unavailable: {source}", path.display())]
    SaveUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no save with id {0} exists")]
    SaveNotFound(i32),

    #[error("catalog transaction failed: {0}")]
    CatalogTransaction(#[from] CatalogError),

    #[error("a backup of save {save_id} is already running")]
    ConcurrentRunConflict { save_id: i32 },

    #[error("backup run was cancelled")]
    Cancelled,

    #[error("file store error: {0}")]
    Store(#[from] StoreError),

    #[error("invalid save: {0}")]
    InvalidSave(String),

    #[error("unable to start worker threads: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    SaveUnavailable,
    SaveNotFound,
    CatalogTransaction,
    ConcurrentRunConflict,
    Cancelled,
    Other,
}

impl Error {
    pub fn kind(&self) -> FailureKind {
        match self {
            Error::SaveUnavailable { .. } => FailureKind::SaveUnavailable,
            Error::SaveNotFound(_) => FailureKind::SaveNotFound,
            Error::CatalogTransaction(_) => FailureKind::CatalogTransaction,
            Error::ConcurrentRunConflict { .. } => FailureKind::ConcurrentRunConflict,
            Error::Cancelled => FailureKind::Cancelled,
            _ => FailureKind::Other,
        }
    }
}

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("unable to get a database connection: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),

    #[error("unable to run database migrations: {0}")]
    Migration(#[from] diesel_migrations::RunMigrationsError),

    #[error("{0} not found")]
    NotFound(String),

    #[error("catalog row for \"{path}\" in save {save_id} changed underneath this commit")]
    Conflict { save_id: i32, path: String },

    #[error("invalid save: {0}")]
    InvalidSave(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("blob {0} not found")]
    NotFound(String),

    #[error("expected digest {expected} but the written content hashed to {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl StoreError {
    /// Whether retrying the same put could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Io(_))
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("unable to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("unable to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("unable to determine parent directory of {}", .0.display())]
    NoParent(PathBuf),
}
