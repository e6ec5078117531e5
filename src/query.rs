use std::path::{Path, PathBuf};

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SaveQuery {
    pub id: Option<i32>,
    pub friendly_name: Option<String>,
    pub path: Option<PathBuf>,
    pub user_id: Option<i32>,
}

impl SaveQuery {
    pub fn new() -> SaveQuery {
        SaveQuery::default()
    }

    pub fn with_id(mut self, id: i32) -> SaveQuery {
        self.id = Some(id);
        self
    }

    pub fn with_path<P: AsRef<Path>>(mut self, path: P) -> SaveQuery {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn with_friendly_name(mut self, name: &str) -> SaveQuery {
        self.friendly_name = Some(name.to_string());
        self
    }

    pub fn with_user_id(mut self, id: i32) -> SaveQuery {
        self.user_id = Some(id);
        self
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct FileQuery {
    pub save_id: Option<i32>,
    pub path: Option<String>,
    pub hash: Option<Vec<u8>>,
    pub include_deleted: bool,
}

impl FileQuery {
    pub fn new() -> FileQuery {
        FileQuery::default()
    }

    pub fn with_save_id(mut self, save_id: i32) -> FileQuery {
        self.save_id = Some(save_id);
        self
    }

    /// Path relative to the save root, `/` separated.
    pub fn with_path(mut self, path: &str) -> FileQuery {
        self.path = Some(path.to_string());
        self
    }

    pub fn with_hash(mut self, hash: Vec<u8>) -> FileQuery {
        self.hash = Some(hash);
        self
    }

    /// Also match tombstoned records.
    pub fn including_deleted(mut self) -> FileQuery {
        self.include_deleted = true;
        self
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct UserQuery {
    pub id: Option<i32>,
    pub username: Option<String>,
}

impl UserQuery {
    pub fn new() -> UserQuery {
        UserQuery::default()
    }

    pub fn with_id(mut self, id: i32) -> UserQuery {
        self.id = Some(id);
        self
    }

    pub fn with_username(mut self, name: &str) -> UserQuery {
        self.username = Some(name.to_string());
        self
    }
}
