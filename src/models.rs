use crate::schema::{files, saves, users};
use chrono::naive::NaiveDateTime;

#[derive(Clone, Debug, PartialEq, Eq, Queryable)]
pub struct Save {
    pub id: i32,
    pub friendly_name: String,
    pub save_path: String,
    pub backup_path: String,
    pub user_id: i32,
    pub created_at: NaiveDateTime,
    pub modified_at: NaiveDateTime,
}

#[derive(Clone, Copy, Debug, Insertable)]
#[table_name = "saves"]
pub struct NewSave<'a> {
    pub friendly_name: &'a str,
    pub save_path: &'a str,
    pub backup_path: &'a str,
    pub user_id: i32,
    pub created_at: NaiveDateTime,
    pub modified_at: NaiveDateTime,
}

/// One tracked path of a save.
///
/// `uuid` is the path's stable identity. It survives content changes and is
/// only replaced when the path disappears and later comes back under the
/// hard delete policy. `deleted_at` is set on tombstoned rows (soft delete).
#[derive(Clone, Debug, PartialEq, Eq, Queryable)]
pub struct File {
    pub id: i32,
    pub file_path: String,
    pub file_hash: Vec<u8>,
    pub uuid: String,
    pub save_id: i32,
    pub created_at: NaiveDateTime,
    pub modified_at: NaiveDateTime,
    pub deleted_at: Option<NaiveDateTime>,
}

impl File {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

#[derive(Clone, Copy, Debug, Insertable)]
#[table_name = "files"]
pub struct NewFile<'a> {
    pub file_path: &'a str,
    pub file_hash: &'a [u8],
    pub uuid: &'a str,
    pub save_id: i32,
    pub created_at: NaiveDateTime,
    pub modified_at: NaiveDateTime,
}

#[derive(Clone, Debug, PartialEq, Eq, Queryable)]
pub struct User {
    pub id: i32,
    pub username: String,
    pub created_at: NaiveDateTime,
    pub modified_at: NaiveDateTime,
}

#[derive(Clone, Copy, Debug, Insertable)]
#[table_name = "users"]
pub struct NewUser<'a> {
    pub username: &'a str,
    pub created_at: NaiveDateTime,
    pub modified_at: NaiveDateTime,
}

impl PartialEq<NewUser<'_>> for User {
    fn eq(&self, other: &NewUser) -> bool {
        self.username == other.username
            && self.created_at == other.created_at
            && self.modified_at == other.modified_at
    }
}
