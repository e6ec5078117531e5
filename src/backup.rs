//! Drives one backup run of one save.
//!
//! A run moves through `Idle → Scanning → Diffing → Storing → Committing →
//! Done`, or ends in `Failed` from any of them. Every stage completes before
//! the next one starts. Inside the scanning and storing stages, files are
//! processed in parallel.
//!
//! Content reaches the file store before the catalog learns about it, and the
//! catalog is updated in one transaction. A run that dies or is cancelled
//! anywhere before that transaction leaves the catalog exactly as it was; at
//! worst some unreferenced blobs remain in the store.

use crate::catalog::{
    AddedFile, Catalog, ChangeSet, CommitSummary, DeletePolicy, DeletedFile, ModifiedFile,
};
use crate::config::Config;
use crate::diff::{self, Change, Diff};
use crate::error::{CatalogError, Error, FailureKind};
use crate::lock::{SaveLock, SaveLocks};
use crate::models::Save;
use crate::scan::{Discovered, ScanEntry, ScannedFile, SkipReason, TreeScanner};
use crate::store::{FileStore, PutOutcome};
use chrono::{NaiveDateTime, Utc};
use rayon::prelude::*;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, info_span, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Scanning,
    Diffing,
    Storing,
    Committing,
    Done,
    Failed(FailureKind),
}

#[derive(Debug)]
pub enum RunStatus {
    Done,
    /// Committed, but some paths could not be backed up this run.
    DoneWithWarnings,
    Failed(Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Added,
    Modified,
    Unchanged,
    Deleted,
    Skipped(SkipReason),
    /// FileReadError: the path could not be read, its catalog state is kept.
    ReadFailed(String),
    /// FileStoreError: the content could not be written to the file store.
    StoreFailed(String),
}

impl Outcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::ReadFailed(_) | Outcome::StoreFailed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathOutcome {
    pub path: String,
    pub outcome: Outcome,
}

/// Everything a caller needs to know about one run.
///
/// `Added`, `Modified` and `Deleted` outcomes are only listed once the
/// catalog commit succeeded. Per-path failures and skips are listed as soon
/// as they are known, so a failed run still tells which files were a problem.
#[derive(Debug)]
pub struct RunReport {
    pub save_id: i32,
    pub status: RunStatus,
    pub transitions: Vec<RunState>,
    pub outcomes: Vec<PathOutcome>,
    pub committed: CommitSummary,
    pub started_at: NaiveDateTime,
    pub finished_at: NaiveDateTime,
}

impl RunReport {
    pub fn state(&self) -> RunState {
        self.transitions.last().copied().unwrap_or(RunState::Idle)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, RunStatus::Failed(_))
    }

    pub fn error(&self) -> Option<&Error> {
        match &self.status {
            RunStatus::Failed(err) => Some(err),
            _ => None,
        }
    }

    pub fn outcome(&self, path: &str) -> Option<&Outcome> {
        self.outcomes
            .iter()
            .find(|outcome| outcome.path == path)
            .map(|outcome| &outcome.outcome)
    }

    pub fn failed_paths(&self) -> impl Iterator<Item = &PathOutcome> {
        self.outcomes.iter().filter(|outcome| outcome.outcome.is_failure())
    }

    pub fn count(&self, predicate: impl Fn(&Outcome) -> bool) -> usize {
        self.outcomes.iter().filter(|o| predicate(&o.outcome)).count()
    }
}

/// Cooperative cancellation, checked between file level operations.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    /// Treats reaching `deadline` as a cancellation.
    pub fn with_deadline(mut self, deadline: Instant) -> CancelToken {
        self.deadline = Some(deadline);
        self
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
            || self.deadline.map_or(false, |deadline| Instant::now() >= deadline)
    }

    fn check(&self) -> Result<(), Error> {
        match self.is_cancelled() {
            true => Err(Error::Cancelled),
            false => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupOptions {
    pub delete_policy: DeletePolicy,
    /// 0 lets rayon pick.
    pub threads: usize,
    /// Extra attempts for a put that failed with an IO error.
    pub store_retries: u32,
}

impl Default for BackupOptions {
    fn default() -> Self {
        BackupOptions {
            delete_policy: DeletePolicy::Soft,
            threads: 0,
            store_retries: 2,
        }
    }
}

impl From<&Config> for BackupOptions {
    fn from(config: &Config) -> Self {
        BackupOptions {
            delete_policy: config.delete_policy,
            threads: config.threads,
            store_retries: config.store_retries,
        }
    }
}

/// Bookkeeping of a run in progress.
struct Run {
    save_id: i32,
    transitions: Vec<RunState>,
    outcomes: Vec<PathOutcome>,
    committed: CommitSummary,
    started_at: NaiveDateTime,
}

impl Run {
    fn new(save_id: i32) -> Run {
        Run {
            save_id,
            transitions: vec![RunState::Idle],
            outcomes: vec![],
            committed: CommitSummary::default(),
            started_at: Utc::now().naive_utc(),
        }
    }

    fn enter(&mut self, state: RunState) {
        info!(save_id = self.save_id, ?state, "backup run state");
        self.transitions.push(state);
    }

    fn record(&mut self, path: &str, outcome: Outcome) {
        match &outcome {
            Outcome::ReadFailed(err) => warn!(path, error = %err, "unable to read file"),
            Outcome::StoreFailed(err) => warn!(path, error = %err, "unable to store file"),
            Outcome::Skipped(reason) => debug!(path, ?reason, "skipped path"),
            _ => {}
        }

        self.outcomes.push(PathOutcome {
            path: path.to_string(),
            outcome,
        });
    }

    fn finish(mut self, result: Result<(), Error>) -> RunReport {
        let status = match result {
            Ok(()) => {
                self.enter(RunState::Done);
                if self.outcomes.iter().any(|o| o.outcome.is_failure()) {
                    RunStatus::DoneWithWarnings
                } else {
                    RunStatus::Done
                }
            }
            Err(err) => {
                warn!(save_id = self.save_id, error = %err, "backup run failed");
                self.enter(RunState::Failed(err.kind()));
                RunStatus::Failed(err)
            }
        };

        self.outcomes.sort_by(|a, b| a.path.cmp(&b.path));

        RunReport {
            save_id: self.save_id,
            status,
            transitions: self.transitions,
            outcomes: self.outcomes,
            committed: self.committed,
            started_at: self.started_at,
            finished_at: Utc::now().naive_utc(),
        }
    }
}

/// The backup orchestrator.
pub struct Backup<C, S> {
    catalog: C,
    store: S,
    locks: SaveLocks,
    options: BackupOptions,
    pool: rayon::ThreadPool,
}

impl<C: Catalog, S: FileStore> Backup<C, S> {
    pub fn new(catalog: C, store: S, options: BackupOptions) -> Result<Backup<C, S>, Error> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(options.threads)
            .thread_name(|i| format!("save-backup-{}", i))
            .build()?;

        Ok(Backup {
            catalog,
            store,
            locks: SaveLocks::new(),
            options,
            pool,
        })
    }

    /// Shares a lock registry with other orchestrators over the same catalog.
    /// Use [`SaveLocks::in_dir`] to exclude orchestrators in other processes.
    pub fn with_locks(mut self, locks: SaveLocks) -> Backup<C, S> {
        self.locks = locks;
        self
    }

    pub fn catalog(&self) -> &C {
        &self.catalog
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn locks(&self) -> &SaveLocks {
        &self.locks
    }

    pub fn run(&self, save_id: i32) -> RunReport {
        self.run_with(save_id, &CancelToken::new())
    }

    pub fn run_with(&self, save_id: i32, cancel: &CancelToken) -> RunReport {
        let span = info_span!("backup", save_id);
        let _enter = span.enter();

        let mut run = Run::new(save_id);
        let result = self
            .locks
            .try_acquire(save_id)
            .and_then(|lock| self.execute(&lock, &mut run, cancel));

        let report = run.finish(result);
        info!(
            status = ?report.status,
            committed = report.committed.total(),
            failed = report.failed_paths().count(),
            "backup run finished"
        );
        report
    }

    /// Scans and diffs a save without storing or committing anything.
    pub fn plan(&self, save_id: i32) -> Result<Diff, Error> {
        let lock = self.locks.try_acquire(save_id)?;
        let save = self.load_save(&lock)?;
        let cancel = CancelToken::new();

        let current = self.scan(&lock, &save, &cancel)?;
        let previous = self.catalog.list_files(lock.save_id())?;

        Ok(diff::diff(&current, &previous))
    }

    fn execute(&self, lock: &SaveLock, run: &mut Run, cancel: &CancelToken) -> Result<(), Error> {
        let save = self.load_save(lock)?;
        cancel.check()?;

        run.enter(RunState::Scanning);
        let current = self.scan(lock, &save, cancel)?;

        run.enter(RunState::Diffing);
        let previous = self.catalog.list_files(lock.save_id())?;
        let diff = diff::diff(&current, &previous);

        for (path, reason) in &diff.skipped {
            run.record(path, Outcome::Skipped(*reason));
        }
        for entry in diff.with_change(Change::Unscannable) {
            let error = entry.error.clone().unwrap_or_default();
            run.record(&entry.path, Outcome::ReadFailed(error));
        }
        cancel.check()?;

        run.enter(RunState::Storing);
        let changes = self.store_changes(lock, &diff, run, cancel)?;
        cancel.check()?;

        run.enter(RunState::Committing);
        self.commit(lock, &diff, &changes, run)?;

        Ok(())
    }

    fn load_save(&self, lock: &SaveLock) -> Result<Save, Error> {
        match self.catalog.get_save(lock.save_id()) {
            Ok(save) => Ok(save),
            Err(CatalogError::NotFound(_)) => Err(Error::SaveNotFound(lock.save_id())),
            Err(err) => Err(err.into()),
        }
    }

    fn scan(&self, lock: &SaveLock, save: &Save, cancel: &CancelToken) -> Result<Vec<ScanEntry>, Error> {
        let scanner = TreeScanner::new(&save.save_path)?;

        let mut found: Vec<Discovered> = vec![];
        for discovered in scanner.walk() {
            cancel.check()?;
            found.push(discovered);
        }

        let hashed: Vec<Option<ScanEntry>> = self.pool.install(|| {
            found
                .into_par_iter()
                .map(|discovered| match cancel.is_cancelled() {
                    true => None,
                    false => Some(ScanEntry::from(discovered)),
                })
                .collect()
        });

        let mut entries = hashed
            .into_iter()
            .collect::<Option<Vec<ScanEntry>>>()
            .ok_or(Error::Cancelled)?;
        entries.sort_by(|a, b| a.path().cmp(b.path()));

        debug!(save_id = lock.save_id(), entries = entries.len(), "scanned save");
        Ok(entries)
    }

    /// Puts the content of every added or modified path into the file store.
    /// Returns the change set covering only what was stored successfully.
    fn store_changes(
        &self,
        lock: &SaveLock,
        diff: &Diff,
        run: &mut Run,
        cancel: &CancelToken,
    ) -> Result<ChangeSet, Error> {
        let pending: Vec<(Change, &ScannedFile, Option<&Vec<u8>>)> = diff
            .entries
            .iter()
            .filter(|entry| matches!(entry.change, Change::Added | Change::Modified))
            .filter_map(|entry| {
                entry
                    .current
                    .as_ref()
                    .map(|file| (entry.change, file, entry.previous_hash.as_ref()))
            })
            .collect();

        let results: Vec<Option<Result<PutOutcome, Outcome>>> = self.pool.install(|| {
            pending
                .par_iter()
                .map(|(_, file, _)| match cancel.is_cancelled() {
                    true => None,
                    false => Some(self.store_file(file)),
                })
                .collect()
        });

        let mut changes = ChangeSet::default();

        for ((change, file, previous_hash), result) in pending.into_iter().zip(results) {
            match result {
                None => return Err(Error::Cancelled),
                Some(Err(failure)) => run.record(&file.relative_path, failure),
                Some(Ok(_)) if change == Change::Added => changes.added.push(AddedFile {
                    path: file.relative_path.clone(),
                    hash: file.digest,
                }),
                Some(Ok(_)) => changes.modified.push(ModifiedFile {
                    path: file.relative_path.clone(),
                    previous_hash: previous_hash.cloned().unwrap_or_default(),
                    hash: file.digest,
                }),
            }
        }

        for entry in diff.with_change(Change::Deleted) {
            changes.deleted.push(DeletedFile {
                path: entry.path.clone(),
                previous_hash: entry.previous_hash.clone().unwrap_or_default(),
            });
        }

        debug!(
            save_id = lock.save_id(),
            added = changes.added.len(),
            modified = changes.modified.len(),
            deleted = changes.deleted.len(),
            "stored file contents"
        );
        Ok(changes)
    }

    fn store_file(&self, file: &ScannedFile) -> Result<PutOutcome, Outcome> {
        let mut attempt = 0;

        loop {
            let mut src = fs::File::open(&file.absolute_path)
                .map_err(|err| Outcome::ReadFailed(err.to_string()))?;

            match self.store.put(&file.digest, &mut src) {
                Ok(outcome) => {
                    debug!(path = %file.relative_path, ?outcome, "put file");
                    return Ok(outcome);
                }
                Err(err) if err.is_transient() && attempt < self.options.store_retries => {
                    attempt += 1;
                    warn!(path = %file.relative_path, attempt, error = %err, "retrying put");
                }
                Err(err) => return Err(Outcome::StoreFailed(err.to_string())),
            }
        }
    }

    fn commit(&self, lock: &SaveLock, diff: &Diff, changes: &ChangeSet, run: &mut Run) -> Result<(), Error> {
        let save_id = lock.save_id();

        if !changes.is_empty() {
            let time = Utc::now().naive_utc();
            run.committed =
                self.catalog
                    .commit_file_changes(save_id, changes, self.options.delete_policy, time)?;

            if run.committed.total() > 0 {
                if let Err(err) = self.catalog.touch_save_modified(save_id, time) {
                    // The file rows are consistent either way
                    warn!(save_id, error = %err, "unable to bump save modified_at");
                }
            }
        }

        for added in &changes.added {
            run.record(&added.path, Outcome::Added);
        }
        for modified in &changes.modified {
            run.record(&modified.path, Outcome::Modified);
        }
        for deleted in &changes.deleted {
            run.record(&deleted.path, Outcome::Deleted);
        }
        for entry in diff.with_change(Change::Unchanged) {
            run.record(&entry.path, Outcome::Unchanged);
        }

        Ok(())
    }
}
