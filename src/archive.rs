//! Save administration: everything done to a save outside of a backup run.

use crate::catalog::Catalog;
use crate::error::{CatalogError, Error, StoreError};
use crate::hash::{Digest, HashingReader};
use crate::models::{File, Save};
use crate::store::FileStore;
use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use tar::{Builder as TarBuilder, Header};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default)]
pub struct SaveOptions<'a> {
    pub friendly_name: Option<&'a str>,
}

/// Result of checking a save's blobs against its catalog records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Verification {
    pub checked: usize,
    pub missing: Vec<String>,
    pub corrupt: Vec<String>,
}

impl Verification {
    pub fn is_intact(&self) -> bool {
        self.missing.is_empty() && self.corrupt.is_empty()
    }
}

pub struct Archive<'a, C, S> {
    catalog: &'a C,
    store: &'a S,
    data_location: &'a Path,
}

impl<'a, C: Catalog, S: FileStore> Archive<'a, C, S> {
    pub fn new(catalog: &'a C, store: &'a S, data_location: &'a Path) -> Archive<'a, C, S> {
        Archive {
            catalog,
            store,
            data_location,
        }
    }

    /// Starts tracking the directory at `path`. Nothing is backed up until
    /// the first run.
    pub fn register_save<P: AsRef<Path>>(
        &self,
        user_id: i32,
        path: P,
        opt: SaveOptions,
    ) -> Result<Save, Error> {
        let path = path.as_ref();
        let save_path = fs::canonicalize(path).map_err(|source| Error::SaveUnavailable {
            path: path.to_path_buf(),
            source,
        })?;

        if !save_path.is_dir() {
            let msg = format!("\"{}\" is not a directory", save_path.display());
            return Err(Error::InvalidSave(msg));
        }

        let dir_name = save_path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| {
                let msg = format!("unable to determine the name of \"{}\"", save_path.display());
                Error::InvalidSave(msg)
            })?;
        let friendly_name = opt.friendly_name.unwrap_or(dir_name);

        let uuid = Uuid::new_v4().to_hyphenated().to_string();
        let backup_path = self.data_location.join(&uuid).join(dir_name);

        let save_str = utf8(&save_path)?;
        let backup_str = utf8(&backup_path)?;

        fs::create_dir_all(&backup_path)?;

        match self
            .catalog
            .create_save(friendly_name, save_str, backup_str, user_id)
        {
            Ok(save) => {
                info!(save_id = save.id, path = save_str, "registered save");
                Ok(save)
            }
            Err(err) => {
                // An empty backup region is useless without its catalog row
                let _ = fs::remove_dir_all(self.data_location.join(&uuid));
                Err(err.into())
            }
        }
    }

    /// Forgets a save and removes its backup region. Blobs stay in the
    /// store, they may be shared with other saves.
    pub fn delete_save(&self, save_id: i32) -> Result<(), Error> {
        let save = self.get_save(save_id)?;
        self.catalog.delete_save(save.id)?;

        let backup_path = Path::new(&save.backup_path);
        if backup_path.exists() {
            fs::remove_dir_all(backup_path)?;
        }

        if let Some(region) = backup_path.parent() {
            if region != self.data_location && region.starts_with(self.data_location) {
                // Only goes away once empty
                let _ = fs::remove_dir(region);
            }
        }

        info!(save_id, "deleted save");
        Ok(())
    }

    /// Writes the latest backed up state of a save into `target`.
    /// Returns the restored relative paths.
    pub fn restore<P: AsRef<Path>>(&self, save_id: i32, target: P) -> Result<Vec<String>, Error> {
        let target = target.as_ref();
        let files = self.tracked_files(save_id)?;
        let mut restored = vec![];

        fs::create_dir_all(target)?;

        for file in &files {
            let digest = record_digest(file)?;
            let destination = target.join(relative_path(&file.file_path)?);

            if let Some(parent) = destination.parent() {
                fs::create_dir_all(parent)?;
            }

            let mut reader = HashingReader::new(self.store.open(&digest)?);
            let mut out = fs::File::create(&destination)?;
            io::copy(&mut reader, &mut out)?;
            out.flush()?;

            let (actual, _) = reader.finish();
            if actual != digest {
                drop(out);
                let _ = fs::remove_file(&destination);

                return Err(StoreError::DigestMismatch {
                    expected: digest.to_hex(),
                    actual: actual.to_hex(),
                }
                .into());
            }

            debug!(path = %file.file_path, "restored file");
            restored.push(file.file_path.clone());
        }

        info!(save_id, files = restored.len(), target = %target.display(), "restored save");
        Ok(restored)
    }

    /// Writes the latest backed up state of a save as a `.tar.zst` archive.
    /// Entries live under a directory named after the save.
    pub fn export<P: AsRef<Path>>(
        &self,
        save_id: i32,
        archive_path: P,
        compression_level: i32,
    ) -> Result<usize, Error> {
        let save = self.get_save(save_id)?;
        let files = self.tracked_files(save.id)?;
        let base_name = Path::new(&save.backup_path)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(&save.friendly_name)
            .to_string();

        if let Some(parent) = archive_path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let tar_file = fs::File::create(archive_path.as_ref())?;
        let zstd_encoder = zstd::stream::Encoder::new(tar_file, compression_level)?;
        let mut archive = TarBuilder::new(zstd_encoder);

        for file in &files {
            let digest = record_digest(file)?;
            let size = self.verified_len(&digest)?;

            let mut header = Header::new_gnu();
            header.set_size(size);
            header.set_mode(0o644);
            header.set_mtime(file.modified_at.timestamp().max(0) as u64);
            header.set_cksum();

            let entry_path = Path::new(&base_name).join(relative_path(&file.file_path)?);
            archive.append_data(&mut header, entry_path, self.store.open(&digest)?)?;
        }

        let zstd_encoder = archive.into_inner()?;
        zstd_encoder.finish()?;

        info!(save_id, files = files.len(), "exported save");
        Ok(files.len())
    }

    /// Checks every live file record of a save against the store.
    pub fn verify(&self, save_id: i32) -> Result<Verification, Error> {
        let files = self.tracked_files(save_id)?;
        let mut verification = Verification::default();

        for file in &files {
            verification.checked += 1;

            let digest = match Digest::from_slice(&file.file_hash) {
                Some(digest) => digest,
                None => {
                    verification.corrupt.push(file.file_path.clone());
                    continue;
                }
            };

            match self.store.open(&digest) {
                Err(StoreError::NotFound(_)) => verification.missing.push(file.file_path.clone()),
                Err(_) => verification.corrupt.push(file.file_path.clone()),
                Ok(mut reader) => {
                    let mut hashing = HashingReader::new(&mut reader);
                    let intact = io::copy(&mut hashing, &mut io::sink()).is_ok()
                        && hashing.finish().0 == digest;

                    if !intact {
                        verification.corrupt.push(file.file_path.clone());
                    }
                }
            }
        }

        if !verification.is_intact() {
            warn!(
                save_id,
                missing = verification.missing.len(),
                corrupt = verification.corrupt.len(),
                "save failed verification"
            );
        }
        Ok(verification)
    }

    fn get_save(&self, save_id: i32) -> Result<Save, Error> {
        match self.catalog.get_save(save_id) {
            Ok(save) => Ok(save),
            Err(CatalogError::NotFound(_)) => Err(Error::SaveNotFound(save_id)),
            Err(err) => Err(err.into()),
        }
    }

    /// Streams a blob once to learn its length and check it against `digest`.
    fn verified_len(&self, digest: &Digest) -> Result<u64, Error> {
        let mut reader = HashingReader::new(self.store.open(digest)?);
        io::copy(&mut reader, &mut io::sink())?;

        let (actual, len) = reader.finish();
        if actual != *digest {
            return Err(StoreError::DigestMismatch {
                expected: digest.to_hex(),
                actual: actual.to_hex(),
            }
            .into());
        }

        Ok(len)
    }

    fn tracked_files(&self, save_id: i32) -> Result<Vec<File>, Error> {
        let save = self.get_save(save_id)?;
        let mut files = self.catalog.list_files(save.id)?;
        files.sort_by(|a, b| a.file_path.cmp(&b.file_path));

        Ok(files)
    }
}

fn utf8(path: &Path) -> Result<&str, Error> {
    path.to_str().ok_or_else(|| {
        let msg = format!("\"{}\" is not a UTF-8 compliant path", path.to_string_lossy());
        Error::InvalidSave(msg)
    })
}

fn record_digest(file: &File) -> Result<Digest, Error> {
    Digest::from_slice(&file.file_hash).ok_or_else(|| {
        let msg = format!("record of \"{}\" holds a malformed hash", file.file_path);
        Error::InvalidSave(msg)
    })
}

/// Turns a catalog path into a relative native path that stays below the
/// directory it is joined to.
fn relative_path(file_path: &str) -> Result<PathBuf, Error> {
    let bad_segment = file_path
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..");
    let path: PathBuf = file_path.split('/').collect();
    let not_relative = path
        .components()
        .any(|component| !matches!(component, Component::Normal(_)));

    if bad_segment || not_relative {
        let msg = format!("refusing to write outside the target: \"{}\"", file_path);
        return Err(Error::InvalidSave(msg));
    }

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::{Backup, BackupOptions, RunStatus};
    use crate::database::tests::setup_db;
    use crate::database::Database;
    use crate::hash::hash_bytes;
    use crate::models::User;
    use crate::store::{DiskStore, PutOutcome};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    struct Fixture {
        test_dir: TempDir,
        backup: Backup<Database, DiskStore>,
        user: User,
    }

    impl Fixture {
        fn new() -> Fixture {
            let test_dir = TempDir::new().unwrap();
            let (db, user) = setup_db(test_dir.path());
            let store = DiskStore::new(test_dir.path().join("data").join("store")).unwrap();
            let backup = Backup::new(db, store, BackupOptions::default()).unwrap();

            Fixture {
                test_dir,
                backup,
                user,
            }
        }

        fn data_location(&self) -> PathBuf {
            self.test_dir.path().join("data")
        }

        fn save_dir(&self, name: &str, files: &[(&str, &[u8])]) -> PathBuf {
            let root = self.test_dir.path().join("games").join(name);
            fs::create_dir_all(&root).unwrap();

            for (path, bytes) in files {
                let full = root.join(path);
                fs::create_dir_all(full.parent().unwrap()).unwrap();
                fs::write(full, bytes).unwrap();
            }
            root
        }
    }

    fn read_tree(root: &Path) -> BTreeMap<String, Vec<u8>> {
        walkdir::WalkDir::new(root)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| {
                let rel = entry.path().strip_prefix(root).unwrap();
                let rel = rel
                    .components()
                    .map(|c| c.as_os_str().to_str().unwrap())
                    .collect::<Vec<_>>()
                    .join("/");
                (rel, fs::read(entry.path()).unwrap())
            })
            .collect()
    }

    #[test]
    fn register_save_defaults_name_and_allocates_region() {
        let fixture = Fixture::new();
        let data = fixture.data_location();
        let archive = Archive::new(fixture.backup.catalog(), fixture.backup.store(), &data);
        let path = fixture.save_dir("Celeste", &[]);

        let save = archive
            .register_save(fixture.user.id, &path, SaveOptions::default())
            .unwrap();

        assert_eq!(save.friendly_name, "Celeste");
        assert_eq!(Path::new(&save.save_path), fs::canonicalize(&path).unwrap());
        assert!(Path::new(&save.backup_path).is_dir());
        assert!(Path::new(&save.backup_path).starts_with(&data));
        assert!(save.backup_path.ends_with("Celeste"));
    }

    #[test]
    fn register_save_uses_given_name() {
        let fixture = Fixture::new();
        let data = fixture.data_location();
        let archive = Archive::new(fixture.backup.catalog(), fixture.backup.store(), &data);
        let path = fixture.save_dir("slot_dir", &[]);

        let opt = SaveOptions {
            friendly_name: Some("Hollow Knight"),
        };
        let save = archive.register_save(fixture.user.id, &path, opt).unwrap();

        assert_eq!(save.friendly_name, "Hollow Knight");
    }

    #[test]
    fn register_save_rejects_missing_and_non_directories() {
        let fixture = Fixture::new();
        let data = fixture.data_location();
        let archive = Archive::new(fixture.backup.catalog(), fixture.backup.store(), &data);
        let root = fixture.save_dir("game", &[("file.sav", b"x")]);

        let missing = archive.register_save(fixture.user.id, root.join("nope"), SaveOptions::default());
        let file = archive.register_save(fixture.user.id, root.join("file.sav"), SaveOptions::default());

        assert!(matches!(missing, Err(Error::SaveUnavailable { .. })));
        assert!(matches!(file, Err(Error::InvalidSave(_))));
    }

    #[test]
    fn rejected_save_leaves_no_stray_region() {
        let fixture = Fixture::new();
        let data = fixture.data_location();
        let archive = Archive::new(fixture.backup.catalog(), fixture.backup.store(), &data);
        let path = fixture.save_dir("game", &[]);

        let opt = SaveOptions {
            friendly_name: Some("  "),
        };
        let result = archive.register_save(fixture.user.id, &path, opt);

        assert!(matches!(
            result,
            Err(Error::CatalogTransaction(CatalogError::InvalidSave(_)))
        ));

        let regions = fs::read_dir(&data)
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name() != "store")
            .count();
        assert_eq!(regions, 0);
    }

    #[test]
    fn delete_save_removes_records_and_region() {
        let fixture = Fixture::new();
        let data = fixture.data_location();
        let archive = Archive::new(fixture.backup.catalog(), fixture.backup.store(), &data);
        let path = fixture.save_dir("game", &[("a.sav", b"a")]);
        let save = archive
            .register_save(fixture.user.id, &path, SaveOptions::default())
            .unwrap();
        assert!(matches!(fixture.backup.run(save.id).status, RunStatus::Done));

        archive.delete_save(save.id).unwrap();

        assert!(matches!(
            fixture.backup.catalog().get_save(save.id),
            Err(CatalogError::NotFound(_))
        ));
        assert!(!Path::new(&save.backup_path).exists());
        assert!(!Path::new(&save.backup_path).parent().unwrap().exists());
        // Blobs are left for garbage collection
        assert!(fixture.backup.store().exists(&hash_bytes(b"a")));
        assert!(matches!(archive.delete_save(save.id), Err(Error::SaveNotFound(_))));
    }

    #[test]
    fn restore_reproduces_the_backed_up_tree() {
        let fixture = Fixture::new();
        let data = fixture.data_location();
        let archive = Archive::new(fixture.backup.catalog(), fixture.backup.store(), &data);
        let payload: [u8; 32] = rand::random();
        let path = fixture.save_dir(
            "game",
            &[("slot1.sav", &payload), ("profiles/main/settings.ini", b"volume=3")],
        );
        let save = archive
            .register_save(fixture.user.id, &path, SaveOptions::default())
            .unwrap();
        assert!(matches!(fixture.backup.run(save.id).status, RunStatus::Done));

        let target = fixture.test_dir.path().join("restored");
        let restored = archive.restore(save.id, &target).unwrap();

        assert_eq!(restored, vec!["profiles/main/settings.ini", "slot1.sav"]);
        assert_eq!(read_tree(&target), read_tree(&path));
    }

    #[test]
    fn restore_rejects_corrupt_blob() {
        let fixture = Fixture::new();
        let data = fixture.data_location();
        let archive = Archive::new(fixture.backup.catalog(), fixture.backup.store(), &data);
        let path = fixture.save_dir("game", &[("a.sav", b"original")]);
        let save = archive
            .register_save(fixture.user.id, &path, SaveOptions::default())
            .unwrap();
        fixture.backup.run(save.id);

        let blob = fixture.backup.store().blob_path(&hash_bytes(b"original"));
        let mut encoder = zstd::stream::Encoder::new(fs::File::create(&blob).unwrap(), 3).unwrap();
        encoder.write_all(b"tampered").unwrap();
        encoder.finish().unwrap();

        let target = fixture.test_dir.path().join("restored");
        let result = archive.restore(save.id, &target);

        assert!(matches!(result, Err(Error::Store(StoreError::DigestMismatch { .. }))));
        assert!(!target.join("a.sav").exists());
    }

    #[test]
    fn export_writes_tar_zst() {
        let fixture = Fixture::new();
        let data = fixture.data_location();
        let archive = Archive::new(fixture.backup.catalog(), fixture.backup.store(), &data);
        let path = fixture.save_dir("game", &[("a.sav", b"aaa"), ("dir/b.sav", b"bbb")]);
        let save = archive
            .register_save(fixture.user.id, &path, SaveOptions::default())
            .unwrap();
        fixture.backup.run(save.id);

        let archive_path = Path::new(&save.backup_path).join("export.tar.zst");
        let count = archive.export(save.id, &archive_path, 3).unwrap();
        assert_eq!(count, 2);

        let decoder = zstd::stream::Decoder::new(fs::File::open(&archive_path).unwrap()).unwrap();
        let mut tar = tar::Archive::new(decoder);
        let unpacked = fixture.test_dir.path().join("unpacked");
        tar.unpack(&unpacked).unwrap();

        assert_eq!(read_tree(&unpacked.join("game")), read_tree(&path));
    }

    /// Store that only hands out blobs as streams.
    struct StreamingStore<'a> {
        inner: &'a DiskStore,
    }

    impl FileStore for StreamingStore<'_> {
        fn put(&self, digest: &Digest, src: &mut dyn io::Read) -> Result<PutOutcome, StoreError> {
            self.inner.put(digest, src)
        }

        fn get(&self, _digest: &Digest) -> Result<Vec<u8>, StoreError> {
            Err(io::Error::new(io::ErrorKind::Other, "whole blob reads are disabled").into())
        }

        fn open(&self, digest: &Digest) -> Result<Box<dyn io::Read + Send>, StoreError> {
            self.inner.open(digest)
        }

        fn exists(&self, digest: &Digest) -> bool {
            self.inner.exists(digest)
        }
    }

    #[test]
    fn export_streams_blobs() {
        let fixture = Fixture::new();
        let data = fixture.data_location();
        let streaming = StreamingStore {
            inner: fixture.backup.store(),
        };
        let archive = Archive::new(fixture.backup.catalog(), &streaming, &data);
        let big: Vec<u8> = (0..256 * 1024).map(|_| rand::random::<u8>()).collect();
        let path = fixture.save_dir("game", &[("big.sav", &big), ("small.sav", b"s")]);
        let save = archive
            .register_save(fixture.user.id, &path, SaveOptions::default())
            .unwrap();
        fixture.backup.run(save.id);

        let archive_path = fixture.test_dir.path().join("out").join("game.tar.zst");
        assert_eq!(archive.export(save.id, &archive_path, 3).unwrap(), 2);

        let decoder = zstd::stream::Decoder::new(fs::File::open(&archive_path).unwrap()).unwrap();
        let unpacked = fixture.test_dir.path().join("unpacked");
        tar::Archive::new(decoder).unpack(&unpacked).unwrap();

        assert_eq!(read_tree(&unpacked.join("game")), read_tree(&path));
    }

    #[test]
    fn export_rejects_blob_with_wrong_content() {
        let fixture = Fixture::new();
        let data = fixture.data_location();
        let archive = Archive::new(fixture.backup.catalog(), fixture.backup.store(), &data);
        let path = fixture.save_dir("game", &[("a.sav", b"original")]);
        let save = archive
            .register_save(fixture.user.id, &path, SaveOptions::default())
            .unwrap();
        fixture.backup.run(save.id);

        let store = fixture.backup.store();
        let mut encoder = zstd::stream::Encoder::new(
            fs::File::create(store.blob_path(&hash_bytes(b"original"))).unwrap(),
            3,
        )
        .unwrap();
        encoder.write_all(b"tampered").unwrap();
        encoder.finish().unwrap();

        let result = archive.export(save.id, fixture.test_dir.path().join("out.tar.zst"), 3);

        assert!(matches!(result, Err(Error::Store(StoreError::DigestMismatch { .. }))));
    }

    #[test]
    fn verify_reports_missing_and_corrupt_blobs() {
        let fixture = Fixture::new();
        let data = fixture.data_location();
        let archive = Archive::new(fixture.backup.catalog(), fixture.backup.store(), &data);
        let path = fixture.save_dir(
            "game",
            &[("fine.sav", b"fine"), ("gone.sav", b"gone"), ("bad.sav", b"bad")],
        );
        let save = archive
            .register_save(fixture.user.id, &path, SaveOptions::default())
            .unwrap();
        fixture.backup.run(save.id);

        assert!(archive.verify(save.id).unwrap().is_intact());

        let store = fixture.backup.store();
        fs::remove_file(store.blob_path(&hash_bytes(b"gone"))).unwrap();
        fs::write(store.blob_path(&hash_bytes(b"bad")), b"not zstd at all").unwrap();

        let verification = archive.verify(save.id).unwrap();

        assert_eq!(verification.checked, 3);
        assert_eq!(verification.missing, vec!["gone.sav"]);
        assert_eq!(verification.corrupt, vec!["bad.sav"]);
    }

    #[test]
    fn relative_path_stays_inside_target() {
        assert_eq!(relative_path("a/b.sav").unwrap(), Path::new("a").join("b.sav"));
        assert!(relative_path("../escape").is_err());
        assert!(relative_path("/etc/passwd").is_err());
        assert!(relative_path("").is_err());
    }
}
