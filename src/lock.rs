//! Keeps at most one backup run per save active at a time.
//!
//! A second request for a save that is already running is rejected with
//! [`Error::ConcurrentRunConflict`]; it neither waits nor gets merged into
//! the running one.
//!
//! Registries made with [`SaveLocks::new`] only see runs of the same process.
//! Registries made with [`SaveLocks::in_dir`] also take a lock file per save,
//! `<dir>/<save_id>.lock`, so orchestrators in other processes sharing the
//! directory are rejected too. On unix the file is held with `flock`, which
//! the kernel releases if the process dies. Elsewhere the file itself is the
//! lock and is removed when the run ends.

use crate::error::Error;
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct SaveLocks {
    active: Arc<Mutex<HashSet<i32>>>,
    dir: Option<PathBuf>,
}

impl SaveLocks {
    pub fn new() -> SaveLocks {
        SaveLocks::default()
    }

    /// A registry that also coordinates through lock files in `dir`.
    pub fn in_dir<P: AsRef<Path>>(dir: P) -> Result<SaveLocks, Error> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;

        Ok(SaveLocks {
            active: Arc::default(),
            dir: Some(dir.to_path_buf()),
        })
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub fn try_acquire(&self, save_id: i32) -> Result<SaveLock, Error> {
        if !lock_set(&self.active).insert(save_id) {
            return Err(Error::ConcurrentRunConflict { save_id });
        }

        let file = match &self.dir {
            Some(dir) => match LockFile::acquire(dir, save_id) {
                Ok(file) => Some(file),
                Err(err) => {
                    lock_set(&self.active).remove(&save_id);
                    return Err(err);
                }
            },
            None => None,
        };

        Ok(SaveLock {
            save_id,
            active: Arc::clone(&self.active),
            _file: file,
        })
    }

    /// Whether a run of `save_id` is active in this process.
    pub fn is_locked(&self, save_id: i32) -> bool {
        lock_set(&self.active).contains(&save_id)
    }
}

/// Proof that the holder owns the save's run. Released on drop.
#[derive(Debug)]
pub struct SaveLock {
    save_id: i32,
    active: Arc<Mutex<HashSet<i32>>>,
    _file: Option<LockFile>,
}

impl SaveLock {
    pub fn save_id(&self) -> i32 {
        self.save_id
    }
}

impl Drop for SaveLock {
    fn drop(&mut self) {
        lock_set(&self.active).remove(&self.save_id);
    }
}

fn lock_set(active: &Mutex<HashSet<i32>>) -> MutexGuard<'_, HashSet<i32>> {
    // The set stays consistent even if a holder panicked
    active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn lock_path(dir: &Path, save_id: i32) -> PathBuf {
    dir.join(format!("{}.lock", save_id))
}

fn write_pid(file: &mut File) -> io::Result<()> {
    file.set_len(0)?;
    writeln!(file, "{}", std::process::id())?;
    file.sync_data()
}

#[cfg(unix)]
struct LockFile {
    path: PathBuf,
    // Unlocked when dropped. The file is left in place: unlinking it would
    // let a newcomer lock a fresh inode while a waiter still holds the old one.
    _flock: nix::fcntl::Flock<File>,
}

#[cfg(unix)]
impl std::fmt::Debug for LockFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockFile").field("path", &self.path).finish()
    }
}

#[cfg(unix)]
impl LockFile {
    fn acquire(dir: &Path, save_id: i32) -> Result<LockFile, Error> {
        use nix::errno::Errno;
        use nix::fcntl::{Flock, FlockArg};

        let path = lock_path(dir, save_id);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let mut flock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(flock) => flock,
            Err((_, Errno::EWOULDBLOCK)) => {
                debug!(save_id, path = %path.display(), "lock file is held elsewhere");
                return Err(Error::ConcurrentRunConflict { save_id });
            }
            Err((_, errno)) => return Err(io::Error::from(errno).into()),
        };

        write_pid(&mut flock)?;
        Ok(LockFile {
            path,
            _flock: flock,
        })
    }
}

#[cfg(not(unix))]
#[derive(Debug)]
struct LockFile {
    path: PathBuf,
}

#[cfg(not(unix))]
impl LockFile {
    fn acquire(dir: &Path, save_id: i32) -> Result<LockFile, Error> {
        let path = lock_path(dir, save_id);
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                debug!(save_id, path = %path.display(), "lock file is held elsewhere");
                return Err(Error::ConcurrentRunConflict { save_id });
            }
            Err(err) => return Err(err.into()),
        };

        let lock = LockFile { path };
        write_pid(&mut file)?;
        Ok(lock)
    }
}

#[cfg(not(unix))]
impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %err, "unable to remove lock file");
        }
    }
}
