//! Walks a save's root and produces its current file list.
//!
//! The walk never follows symbolic links. Every link found in the tree is
//! resolved and classified instead: links leading out of the save root, back
//! into one of their own ancestors, or to something the walk reaches on its
//! own are reported as skipped. This keeps each real path visited at most
//! once per scan and makes cycles impossible.

use crate::error::Error;
use crate::hash::{self, Digest};
use rayon::prelude::*;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Link resolving to a location outside the save root.
    OutsideRoot,
    /// Link resolving to a directory that contains the link.
    Cycle,
    /// Link resolving to a path inside the root, which is scanned directly.
    Alias,
    /// Socket, FIFO, device or other non regular file.
    Special,
}

/// A regular file found by the walk, not hashed yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub relative_path: String,
    pub absolute_path: PathBuf,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFile {
    pub relative_path: String,
    pub absolute_path: PathBuf,
    pub size: u64,
    pub digest: Digest,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Discovered {
    File(Candidate),
    Skipped { path: String, reason: SkipReason },
    Unreadable { path: String, error: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEntry {
    File(ScannedFile),
    Skipped { path: String, reason: SkipReason },
    Unreadable { path: String, error: String },
}

impl ScanEntry {
    pub fn path(&self) -> &str {
        match self {
            ScanEntry::File(file) => &file.relative_path,
            ScanEntry::Skipped { path, .. } => path,
            ScanEntry::Unreadable { path, .. } => path,
        }
    }
}

impl Candidate {
    /// Reads and hashes the file. A read failure becomes
    /// [`ScanEntry::Unreadable`] rather than an error.
    pub fn hash(&self) -> ScanEntry {
        match hash::hash_file(&self.absolute_path) {
            Ok(digest) => ScanEntry::File(ScannedFile {
                relative_path: self.relative_path.clone(),
                absolute_path: self.absolute_path.clone(),
                size: self.size,
                digest,
            }),
            Err(err) => ScanEntry::Unreadable {
                path: self.relative_path.clone(),
                error: err.to_string(),
            },
        }
    }
}

impl From<Discovered> for ScanEntry {
    fn from(found: Discovered) -> Self {
        match found {
            Discovered::File(candidate) => candidate.hash(),
            Discovered::Skipped { path, reason } => ScanEntry::Skipped { path, reason },
            Discovered::Unreadable { path, error } => ScanEntry::Unreadable { path, error },
        }
    }
}

/// Walks a save root and hashes what it finds.
///
/// Hard links are not detected: every link to the same inode is scanned and
/// tracked as its own path. The file store keeps their shared content once.
#[derive(Debug, Clone)]
pub struct TreeScanner {
    root: PathBuf,
}

impl TreeScanner {
    /// Fails with [`Error::SaveUnavailable`] if `save_path` is missing, not a
    /// directory or not readable.
    pub fn new<P: AsRef<Path>>(save_path: P) -> Result<TreeScanner, Error> {
        let save_path = save_path.as_ref();
        let unavailable = |source: io::Error| Error::SaveUnavailable {
            path: save_path.to_path_buf(),
            source,
        };

        let root = fs::canonicalize(save_path).map_err(unavailable)?;
        let metadata = fs::metadata(&root).map_err(unavailable)?;

        if !metadata.is_dir() {
            let err = io::Error::new(io::ErrorKind::Other, "not a directory");
            return Err(unavailable(err));
        }

        fs::read_dir(&root).map_err(unavailable)?;

        Ok(TreeScanner { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Lazily walks the tree without reading file contents.
    ///
    /// Each call starts a fresh walk, so re-scanning is always safe.
    pub fn walk(&self) -> Walk {
        let inner = WalkDir::new(&self.root)
            .follow_links(false)
            .sort_by(|a, b| a.file_name().cmp(b.file_name()))
            .into_iter();

        Walk {
            root: self.root.clone(),
            inner,
        }
    }

    /// Lazily walks and hashes the tree, one file at a time.
    pub fn scan(&self) -> impl Iterator<Item = ScanEntry> {
        self.walk().map(ScanEntry::from)
    }

    /// Walks the tree, then hashes every file on the current rayon pool.
    ///
    /// The result is sorted by relative path.
    pub fn scan_all(&self) -> Vec<ScanEntry> {
        let found: Vec<Discovered> = self.walk().collect();
        let mut entries: Vec<ScanEntry> = found.into_par_iter().map(ScanEntry::from).collect();

        entries.sort_by(|a, b| a.path().cmp(b.path()));
        entries
    }
}

pub struct Walk {
    root: PathBuf,
    inner: walkdir::IntoIter,
}

impl Walk {
    fn classify(&mut self, entry: walkdir::DirEntry) -> Option<Discovered> {
        let path = entry.path();
        let file_type = entry.file_type();

        let relative = match relative_path(&self.root, path) {
            Ok(relative) => relative,
            Err(error) => {
                if file_type.is_dir() {
                    self.inner.skip_current_dir();
                }
                return Some(Discovered::Unreadable {
                    path: lossy_relative_path(&self.root, path),
                    error,
                });
            }
        };

        if file_type.is_symlink() {
            return Some(self.classify_link(path, relative));
        }

        if file_type.is_dir() {
            return None;
        }

        if !file_type.is_file() {
            return Some(Discovered::Skipped {
                path: relative,
                reason: SkipReason::Special,
            });
        }

        match entry.metadata() {
            Ok(metadata) => Some(Discovered::File(Candidate {
                relative_path: relative,
                absolute_path: path.to_path_buf(),
                size: metadata.len(),
            })),
            Err(err) => Some(Discovered::Unreadable {
                path: relative,
                error: err.to_string(),
            }),
        }
    }

    fn classify_link(&self, path: &Path, relative: String) -> Discovered {
        let target = match fs::canonicalize(path) {
            Ok(target) => target,
            Err(err) => {
                return Discovered::Unreadable {
                    path: relative,
                    error: format!("unable to resolve symbolic link: {}", err),
                }
            }
        };

        let reason = if !target.starts_with(&self.root) {
            SkipReason::OutsideRoot
        } else if target.is_dir() && path.starts_with(&target) {
            SkipReason::Cycle
        } else {
            SkipReason::Alias
        };

        Discovered::Skipped {
            path: relative,
            reason,
        }
    }
}

impl Iterator for Walk {
    type Item = Discovered;

    fn next(&mut self) -> Option<Discovered> {
        loop {
            let entry = match self.inner.next()? {
                Ok(entry) => entry,
                Err(err) => {
                    let path = err
                        .path()
                        .map(|path| lossy_relative_path(&self.root, path))
                        .unwrap_or_default();

                    return Some(Discovered::Unreadable {
                        path,
                        error: err.to_string(),
                    });
                }
            };

            if entry.depth() == 0 {
                continue;
            }

            if let Some(found) = self.classify(entry) {
                return Some(found);
            }
        }
    }
}

/// `/` separated path of `path` relative to `root`, on every platform.
fn relative_path(root: &Path, path: &Path) -> Result<String, String> {
    let stripped = path
        .strip_prefix(root)
        .map_err(|_| format!("{} is not inside the save root", path.display()))?;

    let mut parts = vec![];
    for component in stripped.components() {
        match component {
            Component::Normal(part) => match part.to_str() {
                Some(part) => parts.push(part),
                None => return Err("path is not valid UTF-8".to_string()),
            },
            _ => return Err(format!("unexpected component in {}", path.display())),
        }
    }

    Ok(parts.join("/"))
}

fn lossy_relative_path(root: &Path, path: &Path) -> String {
    let stripped = path.strip_prefix(root).unwrap_or(path);

    stripped
        .components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
