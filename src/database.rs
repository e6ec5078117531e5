use crate::catalog::{AddedFile, Catalog, ChangeSet, CommitSummary, DeletePolicy};
use crate::error::CatalogError;
use crate::models::*;
use crate::query::{FileQuery, SaveQuery, UserQuery};
use crate::schema::{files, saves, users};
use chrono::NaiveDateTime;
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool, PooledConnection};
use diesel::SqliteConnection;
use std::fs;
use std::path::Path;
use tracing::debug;
use uuid::Uuid;

type SqlitePool = Pool<ConnectionManager<SqliteConnection>>;

#[derive(Debug)]
struct ConnectionOptions;

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for ConnectionOptions {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), diesel::r2d2::Error> {
        // SQLite leaves foreign keys off unless asked, per connection
        conn.batch_execute("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")
            .map_err(diesel::r2d2::Error::QueryError)
    }
}

/// SQLite backed catalog.
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens (or creates) the database at `db_path` and runs pending migrations.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Database, CatalogError> {
        let db_path = db_path.as_ref();

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let manager = ConnectionManager::new(db_path.to_string_lossy());
        let pool = Pool::builder()
            .max_size(15)
            .connection_customizer(Box::new(ConnectionOptions))
            .build(manager)?;

        Self::check_db(&pool)?;

        Ok(Database { pool })
    }

    fn check_db(pool: &SqlitePool) -> Result<(), CatalogError> {
        let conn = &pool.get()?;

        embed_migrations!("./migrations");
        embedded_migrations::run(conn)?;

        Ok(())
    }

    fn get_conn(&self) -> Result<PooledConnection<ConnectionManager<SqliteConnection>>, CatalogError> {
        Ok(self.pool.get()?)
    }

    pub fn find_saves(&self, query: SaveQuery) -> Result<Vec<Save>, CatalogError> {
        let conn = self.get_conn()?;
        let mut select = saves::table.into_boxed();

        if let Some(search_id) = query.id {
            select = select.filter(saves::id.eq(search_id));
        }

        if let Some(name) = query.friendly_name {
            select = select.filter(saves::friendly_name.eq(name));
        }

        if let Some(path) = query.path {
            match path.to_str() {
                Some(path_str) => select = select.filter(saves::save_path.eq(path_str.to_string())),
                None => return Ok(vec![]),
            }
        }

        if let Some(search_user_id) = query.user_id {
            select = select.filter(saves::user_id.eq(search_user_id));
        }

        Ok(select.order(saves::id.asc()).load::<Save>(&conn)?)
    }

    pub fn get_files(&self, query: FileQuery) -> Result<Vec<File>, CatalogError> {
        let conn = self.get_conn()?;
        let mut select = files::table.into_boxed();

        if let Some(search_save_id) = query.save_id {
            select = select.filter(files::save_id.eq(search_save_id));
        }

        if let Some(path) = query.path {
            select = select.filter(files::file_path.eq(path));
        }

        if let Some(hash) = query.hash {
            select = select.filter(files::file_hash.eq(hash));
        }

        if !query.include_deleted {
            select = select.filter(files::deleted_at.is_null());
        }

        Ok(select.order(files::file_path.asc()).load::<File>(&conn)?)
    }

    pub fn create_user(&self, user: NewUser) -> Result<User, CatalogError> {
        let conn = self.get_conn()?;

        diesel::insert_into(users::table)
            .values(&user)
            .execute(&conn)?;

        Ok(users::table
            .filter(users::username.eq(user.username))
            .first::<User>(&conn)?)
    }

    pub fn get_user(&self, query: UserQuery) -> Result<Option<User>, CatalogError> {
        let conn = self.get_conn()?;

        let user = if let Some(search_id) = query.id {
            users::table.find(search_id).first::<User>(&conn).optional()?
        } else if let Some(name) = query.username {
            users::table
                .filter(users::username.eq(name))
                .first::<User>(&conn)
                .optional()?
        } else {
            None
        };

        Ok(user)
    }

    pub fn get_all_users(&self) -> Result<Vec<User>, CatalogError> {
        let conn = self.get_conn()?;
        Ok(users::table.order(users::id.asc()).load::<User>(&conn)?)
    }
}

fn insert_file(
    conn: &SqliteConnection,
    save_id: i32,
    added: &AddedFile,
    time: NaiveDateTime,
) -> Result<(), CatalogError> {
    let uuid = Uuid::new_v4().to_hyphenated().to_string();
    let hash = added.hash.to_vec();

    let new_file = NewFile {
        file_path: &added.path,
        file_hash: &hash,
        uuid: &uuid,
        save_id,
        created_at: time,
        modified_at: time,
    };

    diesel::insert_into(files::table)
        .values(&new_file)
        .execute(conn)?;

    Ok(())
}

/// Inserts an added path, or brings its tombstone back to life. Returns
/// whether a tombstone was revived.
fn add_file(
    conn: &SqliteConnection,
    save_id: i32,
    added: &AddedFile,
    policy: DeletePolicy,
    time: NaiveDateTime,
) -> Result<bool, CatalogError> {
    let existing = files::table
        .filter(files::save_id.eq(save_id))
        .filter(files::file_path.eq(&added.path))
        .first::<File>(conn)
        .optional()?;

    let tombstone = match existing {
        None => {
            insert_file(conn, save_id, added, time)?;
            return Ok(false);
        }
        Some(row) if !row.is_deleted() => {
            return Err(CatalogError::Conflict {
                save_id,
                path: added.path.clone(),
            })
        }
        Some(row) => row,
    };

    match policy {
        DeletePolicy::Soft => {
            diesel::update(files::table.find(tombstone.id))
                .set((
                    files::file_hash.eq(added.hash.to_vec()),
                    files::modified_at.eq(time),
                    files::deleted_at.eq(None::<NaiveDateTime>),
                ))
                .execute(conn)?;

            debug!(path = %added.path, uuid = %tombstone.uuid, "revived file record");
            Ok(true)
        }
        DeletePolicy::Hard => {
            // Left over from a soft delete policy. Identity is not reused.
            diesel::delete(files::table.find(tombstone.id)).execute(conn)?;
            insert_file(conn, save_id, added, time)?;
            Ok(false)
        }
    }
}

fn apply_changes(
    conn: &SqliteConnection,
    save_id: i32,
    changes: &ChangeSet,
    policy: DeletePolicy,
    time: NaiveDateTime,
) -> Result<CommitSummary, CatalogError> {
    let mut summary = CommitSummary::default();

    for added in &changes.added {
        if add_file(conn, save_id, added, policy, time)? {
            summary.revived += 1;
        } else {
            summary.inserted += 1;
        }
    }

    for modified in &changes.modified {
        let count = diesel::update(
            files::table
                .filter(files::save_id.eq(save_id))
                .filter(files::file_path.eq(&modified.path))
                .filter(files::file_hash.eq(&modified.previous_hash))
                .filter(files::deleted_at.is_null()),
        )
        .set((
            files::file_hash.eq(modified.hash.to_vec()),
            files::modified_at.eq(time),
        ))
        .execute(conn)?;

        if count != 1 {
            return Err(CatalogError::Conflict {
                save_id,
                path: modified.path.clone(),
            });
        }
        summary.updated += 1;
    }

    for deleted in &changes.deleted {
        let target = files::table
            .filter(files::save_id.eq(save_id))
            .filter(files::file_path.eq(&deleted.path))
            .filter(files::file_hash.eq(&deleted.previous_hash))
            .filter(files::deleted_at.is_null());

        let count = match policy {
            DeletePolicy::Soft => diesel::update(target)
                .set(files::deleted_at.eq(Some(time)))
                .execute(conn)?,
            DeletePolicy::Hard => diesel::delete(target).execute(conn)?,
        };

        if count != 1 {
            return Err(CatalogError::Conflict {
                save_id,
                path: deleted.path.clone(),
            });
        }
        summary.deleted += 1;
    }

    Ok(summary)
}

fn validate_save(friendly_name: &str, save_path: &str, backup_path: &str) -> Result<(), CatalogError> {
    if friendly_name.trim().is_empty() {
        return Err(CatalogError::InvalidSave(
            "the friendly name must not be empty".to_string(),
        ));
    }

    let save = Path::new(save_path);
    let backup = Path::new(backup_path);

    if save.starts_with(backup) || backup.starts_with(save) {
        return Err(CatalogError::InvalidSave(format!(
            "save path \"{}\" and backup path \"{}\" overlap",
            save_path, backup_path
        )));
    }

    Ok(())
}

impl Catalog for Database {
    fn create_save(
        &self,
        friendly_name: &str,
        save_path: &str,
        backup_path: &str,
        user_id: i32,
    ) -> Result<Save, CatalogError> {
        validate_save(friendly_name, save_path, backup_path)?;

        let conn = self.get_conn()?;
        let time = chrono::Utc::now().naive_utc();

        let new_save = NewSave {
            friendly_name,
            save_path,
            backup_path,
            user_id,
            created_at: time,
            modified_at: time,
        };

        diesel::insert_into(saves::table)
            .values(&new_save)
            .execute(&conn)?;

        Ok(saves::table
            .filter(saves::backup_path.eq(backup_path))
            .first::<Save>(&conn)?)
    }

    fn get_save(&self, id: i32) -> Result<Save, CatalogError> {
        let conn = self.get_conn()?;

        saves::table
            .find(id)
            .first::<Save>(&conn)
            .optional()?
            .ok_or_else(|| CatalogError::NotFound(format!("save {}", id)))
    }

    fn list_files(&self, save_id: i32) -> Result<Vec<File>, CatalogError> {
        self.get_files(FileQuery::new().with_save_id(save_id))
    }

    fn commit_file_changes(
        &self,
        save_id: i32,
        changes: &ChangeSet,
        policy: DeletePolicy,
        time: NaiveDateTime,
    ) -> Result<CommitSummary, CatalogError> {
        let pooled = self.get_conn()?;
        let conn: &SqliteConnection = &pooled;

        let summary = conn.transaction::<_, CatalogError, _>(|| {
            apply_changes(conn, save_id, changes, policy, time)
        })?;

        debug!(save_id, ?summary, "committed file changes");
        Ok(summary)
    }

    fn touch_save_modified(&self, save_id: i32, time: NaiveDateTime) -> Result<(), CatalogError> {
        let conn = self.get_conn()?;

        let count = diesel::update(saves::table.find(save_id))
            .set(saves::modified_at.eq(time))
            .execute(&conn)?;

        match count {
            0 => Err(CatalogError::NotFound(format!("save {}", save_id))),
            _ => Ok(()),
        }
    }

    fn delete_save(&self, save_id: i32) -> Result<(), CatalogError> {
        let pooled = self.get_conn()?;
        let conn: &SqliteConnection = &pooled;

        conn.transaction::<_, CatalogError, _>(|| {
            // Files first, the foreign key restricts deleting the save
            diesel::delete(files::table.filter(files::save_id.eq(save_id))).execute(conn)?;

            let count = diesel::delete(saves::table.find(save_id)).execute(conn)?;
            match count {
                0 => Err(CatalogError::NotFound(format!("save {}", save_id))),
                _ => Ok(()),
            }
        })
    }
}
