//! Content addressed blob storage.
//!
//! Blobs are keyed strictly by the digest of their uncompressed content, so
//! identical files share one copy no matter which save, path or version they
//! belong to. Each blob is zstd compressed on disk under
//! `<root>/<hex[0..2]>/<hex[2..4]>/<hex>`.
//!
//! Writes land in `<root>/tmp` first and are renamed into place once synced,
//! so a digest key never points at a partially written blob.

use crate::error::StoreError;
use crate::hash::{Digest, HashingReader};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

const TMP_DIR: &str = "tmp";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// The blob was written.
    Stored,
    /// A blob with this digest was already present.
    AlreadyPresent,
    /// The existing blob failed verification and was rewritten.
    Repaired,
}

pub trait FileStore: Send + Sync {
    /// Stores the bytes read from `src` under `digest`.
    ///
    /// Idempotent. Fails with [`StoreError::DigestMismatch`] if the bytes do
    /// not hash to `digest`.
    fn put(&self, digest: &Digest, src: &mut dyn Read) -> Result<PutOutcome, StoreError>;

    fn get(&self, digest: &Digest) -> Result<Vec<u8>, StoreError>;

    /// Streaming counterpart of [`FileStore::get`].
    fn open(&self, digest: &Digest) -> Result<Box<dyn Read + Send>, StoreError>;

    fn exists(&self, digest: &Digest) -> bool;
}

#[derive(Debug, Clone)]
pub struct DiskStore {
    root: PathBuf,
    compression_level: i32,
    verify_existing: bool,
}

impl DiskStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<DiskStore, StoreError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join(TMP_DIR))?;

        Ok(DiskStore {
            root,
            compression_level: 3,
            verify_existing: false,
        })
    }

    pub fn with_compression_level(mut self, level: i32) -> DiskStore {
        self.compression_level = level;
        self
    }

    /// Re-hash already present blobs on `put` and rewrite them if corrupt.
    pub fn with_verify_existing(mut self, verify: bool) -> DiskStore {
        self.verify_existing = verify;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        let hex = digest.to_hex();
        self.root.join(&hex[0..2]).join(&hex[2..4]).join(&hex)
    }

    fn is_intact(&self, digest: &Digest) -> Result<bool, StoreError> {
        let file = File::open(self.blob_path(digest))?;

        // A truncated or garbled zstd frame counts as corruption
        let intact = zstd::stream::Decoder::new(file)
            .and_then(|mut decoder| crate::hash::hash_reader(&mut decoder))
            .map(|actual| actual == *digest)
            .unwrap_or(false);

        Ok(intact)
    }

    fn write_blob(&self, digest: &Digest, src: &mut dyn Read) -> Result<(), StoreError> {
        let tmp_path = self
            .root
            .join(TMP_DIR)
            .join(Uuid::new_v4().to_hyphenated().to_string());

        let result = self.write_tmp(digest, src, &tmp_path);
        if result.is_err() {
            // Leftover temp files are harmless, but don't pile them up
            let _ = fs::remove_file(&tmp_path);
        }
        result
    }

    fn write_tmp(&self, digest: &Digest, src: &mut dyn Read, tmp_path: &Path) -> Result<(), StoreError> {
        let tmp_file = File::create(tmp_path)?;
        let mut encoder = zstd::stream::Encoder::new(tmp_file, self.compression_level)?;
        let mut reader = HashingReader::new(src);

        io::copy(&mut reader, &mut encoder)?;
        let tmp_file = encoder.finish()?;

        let (actual, len) = reader.finish();
        if actual != *digest {
            return Err(StoreError::DigestMismatch {
                expected: digest.to_hex(),
                actual: actual.to_hex(),
            });
        }

        tmp_file.sync_all()?;
        drop(tmp_file);

        let target = self.blob_path(digest);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(tmp_path, &target)?;

        debug!(digest = %digest, bytes = len, "stored blob");
        Ok(())
    }
}

impl FileStore for DiskStore {
    fn put(&self, digest: &Digest, src: &mut dyn Read) -> Result<PutOutcome, StoreError> {
        if self.exists(digest) {
            if !self.verify_existing || self.is_intact(digest)? {
                return Ok(PutOutcome::AlreadyPresent);
            }

            warn!(digest = %digest, "stored blob is corrupt, rewriting it");
            self.write_blob(digest, src)?;
            return Ok(PutOutcome::Repaired);
        }

        self.write_blob(digest, src)?;
        Ok(PutOutcome::Stored)
    }

    fn get(&self, digest: &Digest) -> Result<Vec<u8>, StoreError> {
        let mut reader = self.open(digest)?;
        let mut bytes = vec![];
        reader.read_to_end(&mut bytes)?;

        Ok(bytes)
    }

    fn open(&self, digest: &Digest) -> Result<Box<dyn Read + Send>, StoreError> {
        let file = match File::open(self.blob_path(digest)) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(digest.to_hex()))
            }
            Err(err) => return Err(err.into()),
        };

        let decoder = zstd::stream::Decoder::new(file)?;
        Ok(Box::new(decoder))
    }

    fn exists(&self, digest: &Digest) -> bool {
        self.blob_path(digest).is_file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_bytes;
    use std::io::Write;
    use tempfile::TempDir;

    fn count_blobs(root: &Path) -> usize {
        walkdir::WalkDir::new(root)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter(|entry| !entry.path().starts_with(root.join(TMP_DIR)))
            .count()
    }

    #[test]
    fn put_and_get_file() {
        let test_dir = TempDir::new().unwrap();
        let store = DiskStore::new(test_dir.path()).unwrap();

        let expected: [u8; 32] = rand::random();
        let digest = hash_bytes(&expected);

        let outcome = store.put(&digest, &mut &expected[..]).unwrap();
        let actual = store.get(&digest).unwrap();

        assert_eq!(outcome, PutOutcome::Stored);
        assert!(store.exists(&digest));
        assert_eq!(actual, expected.to_vec());
    }

    #[test]
    fn identical_content_is_stored_once() {
        let test_dir = TempDir::new().unwrap();
        let store = DiskStore::new(test_dir.path()).unwrap();

        let bytes = b"identical save data";
        let digest = hash_bytes(bytes);

        let first = store.put(&digest, &mut &bytes[..]).unwrap();
        let second = store.put(&digest, &mut &bytes[..]).unwrap();

        assert_eq!(first, PutOutcome::Stored);
        assert_eq!(second, PutOutcome::AlreadyPresent);
        assert_eq!(count_blobs(test_dir.path()), 1);
    }

    #[test]
    fn put_rejects_content_that_does_not_match_digest() {
        let test_dir = TempDir::new().unwrap();
        let store = DiskStore::new(test_dir.path()).unwrap();

        let digest = hash_bytes(b"what the scanner saw");
        let result = store.put(&digest, &mut &b"what is on disk now"[..]);

        match result {
            Err(StoreError::DigestMismatch { .. }) => {}
            other => panic!("expected a digest mismatch, got {:?}", other),
        }
        assert!(!store.exists(&digest));
        assert_eq!(count_blobs(test_dir.path()), 0);
    }

    #[test]
    fn get_missing_blob_is_not_found() {
        let test_dir = TempDir::new().unwrap();
        let store = DiskStore::new(test_dir.path()).unwrap();

        match store.get(&hash_bytes(b"never stored")) {
            Err(StoreError::NotFound(_)) => {}
            other => panic!("expected NotFound, got {:?}", other),
        }
    }

    #[test]
    fn verify_existing_repairs_corrupt_blob() {
        let test_dir = TempDir::new().unwrap();
        let store = DiskStore::new(test_dir.path())
            .unwrap()
            .with_verify_existing(true);

        let bytes = b"precious save";
        let digest = hash_bytes(bytes);
        store.put(&digest, &mut &bytes[..]).unwrap();

        let mut blob = File::create(store.blob_path(&digest)).unwrap();
        blob.write_all(b"garbage").unwrap();
        drop(blob);

        let outcome = store.put(&digest, &mut &bytes[..]).unwrap();

        assert_eq!(outcome, PutOutcome::Repaired);
        assert_eq!(store.get(&digest).unwrap(), bytes.to_vec());
    }

    #[test]
    fn blobs_are_laid_out_by_digest() {
        let test_dir = TempDir::new().unwrap();
        let store = DiskStore::new(test_dir.path()).unwrap();
        let digest = hash_bytes(b"layout");
        let hex = digest.to_hex();

        let expected: PathBuf = [
            test_dir.path(),
            Path::new(&hex[0..2]),
            Path::new(&hex[2..4]),
            Path::new(&hex),
        ]
        .iter()
        .collect();

        assert_eq!(store.blob_path(&digest), expected);
    }
}
