//! The catalog's contract: what the backup engine needs from whatever
//! persists the `saves` and `files` records.

use crate::error::CatalogError;
use crate::hash::Digest;
use crate::models::{File, Save};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// What happens to the record of a path that disappeared from disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeletePolicy {
    /// Keep the row as a tombstone. A path that comes back gets its old UUID.
    Soft,
    /// Remove the row. A path that comes back gets a fresh UUID.
    Hard,
}

impl Default for DeletePolicy {
    fn default() -> Self {
        DeletePolicy::Soft
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddedFile {
    pub path: String,
    pub hash: Digest,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifiedFile {
    pub path: String,
    pub previous_hash: Vec<u8>,
    pub hash: Digest,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletedFile {
    pub path: String,
    pub previous_hash: Vec<u8>,
}

/// Every catalog mutation of one run, applied all at once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub added: Vec<AddedFile>,
    pub modified: Vec<ModifiedFile>,
    pub deleted: Vec<DeletedFile>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    pub fn len(&self) -> usize {
        self.added.len() + self.modified.len() + self.deleted.len()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitSummary {
    pub inserted: usize,
    /// Tombstones brought back to life, keeping their UUID.
    pub revived: usize,
    pub updated: usize,
    pub deleted: usize,
}

impl CommitSummary {
    pub fn total(&self) -> usize {
        self.inserted + self.revived + self.updated + self.deleted
    }
}

pub trait Catalog: Send + Sync {
    fn create_save(
        &self,
        friendly_name: &str,
        save_path: &str,
        backup_path: &str,
        user_id: i32,
    ) -> Result<Save, CatalogError>;

    /// Fails with [`CatalogError::NotFound`] if there is no such save.
    fn get_save(&self, id: i32) -> Result<Save, CatalogError>;

    /// Live (not tombstoned) file records of a save.
    fn list_files(&self, save_id: i32) -> Result<Vec<File>, CatalogError>;

    /// Applies `changes` in a single transaction. Either every change is
    /// committed or none is.
    fn commit_file_changes(
        &self,
        save_id: i32,
        changes: &ChangeSet,
        policy: DeletePolicy,
        time: NaiveDateTime,
    ) -> Result<CommitSummary, CatalogError>;

    fn touch_save_modified(&self, save_id: i32, time: NaiveDateTime) -> Result<(), CatalogError>;

    /// Removes a save and every file record (tombstones included) that
    /// references it, in one transaction.
    fn delete_save(&self, save_id: i32) -> Result<(), CatalogError>;
}
