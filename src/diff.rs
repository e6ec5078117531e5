//! Classifies every path of a save by comparing a fresh scan against the
//! catalog's last known state.
//!
//! Content hashes are the only source of truth. Renames are not detected: a
//! moved file shows up as one `Deleted` plus one `Added` entry.
//!
//! A skipped path (a link or special file) is never `Deleted`, and neither is
//! anything tracked beneath it. Its record stays as it was and the path is
//! only listed in [`Diff::skipped`].

use crate::models::File;
use crate::scan::{ScanEntry, ScannedFile, SkipReason};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Change {
    Added,
    Modified,
    Unchanged,
    Deleted,
    /// The path could not be read this run. Its catalog state is left alone.
    Unscannable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffEntry {
    pub path: String,
    pub change: Change,
    /// What the scan found, for `Added`, `Modified` and `Unchanged`.
    pub current: Option<ScannedFile>,
    /// Hash recorded in the catalog, if the path was tracked.
    pub previous_hash: Option<Vec<u8>>,
    /// Why the path could not be scanned, for `Unscannable`.
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diff {
    /// Sorted by path.
    pub entries: Vec<DiffEntry>,
    pub skipped: Vec<(String, SkipReason)>,
}

impl Diff {
    pub fn with_change(&self, change: Change) -> impl Iterator<Item = &DiffEntry> {
        self.entries.iter().filter(move |entry| entry.change == change)
    }

    pub fn count(&self, change: Change) -> usize {
        self.with_change(change).count()
    }

    /// Whether committing this diff would touch the catalog at all.
    pub fn has_changes(&self) -> bool {
        self.entries.iter().any(|entry| {
            matches!(
                entry.change,
                Change::Added | Change::Modified | Change::Deleted
            )
        })
    }

    pub fn get(&self, path: &str) -> Option<&DiffEntry> {
        self.entries
            .binary_search_by(|entry| entry.path.as_str().cmp(path))
            .ok()
            .map(|i| &self.entries[i])
    }
}

pub fn diff(current: &[ScanEntry], previous: &[File]) -> Diff {
    let mut scanned: BTreeMap<&str, &ScannedFile> = BTreeMap::new();
    let mut unscannable: BTreeMap<&str, &str> = BTreeMap::new();
    let mut skipped = vec![];

    for entry in current {
        match entry {
            ScanEntry::File(file) => {
                scanned.insert(&file.relative_path, file);
            }
            ScanEntry::Unreadable { path, error } => {
                unscannable.insert(path, error);
            }
            ScanEntry::Skipped { path, reason } => skipped.push((path.clone(), *reason)),
        }
    }

    let tracked: BTreeMap<&str, &File> = previous
        .iter()
        .filter(|file| !file.is_deleted())
        .map(|file| (file.file_path.as_str(), file))
        .collect();

    let skipped_paths: BTreeMap<&str, SkipReason> = skipped
        .iter()
        .map(|(path, reason)| (path.as_str(), *reason))
        .collect();

    let mut entries = vec![];

    for (path, file) in &tracked {
        if unscannable.contains_key(path) {
            continue; // reported below, with its own error
        }
        if skipped_paths.contains_key(path) || ancestor_in(&skipped_paths, path).is_some() {
            continue;
        }

        let entry = match scanned.get(path) {
            Some(current) => {
                let change = if current.digest.as_bytes()[..] == file.file_hash[..] {
                    Change::Unchanged
                } else {
                    Change::Modified
                };

                DiffEntry {
                    path: path.to_string(),
                    change,
                    current: Some((*current).clone()),
                    previous_hash: Some(file.file_hash.clone()),
                    error: None,
                }
            }
            None => match ancestor_in(&unscannable, path) {
                // Everything under an unreadable directory is unknown, not gone
                Some((dir, error)) => DiffEntry {
                    path: path.to_string(),
                    change: Change::Unscannable,
                    current: None,
                    previous_hash: Some(file.file_hash.clone()),
                    error: Some(format!("directory \"{}\" is unreadable: {}", dir, error)),
                },
                None => DiffEntry {
                    path: path.to_string(),
                    change: Change::Deleted,
                    current: None,
                    previous_hash: Some(file.file_hash.clone()),
                    error: None,
                },
            },
        };

        entries.push(entry);
    }

    for (path, current) in &scanned {
        if !tracked.contains_key(path) {
            entries.push(DiffEntry {
                path: path.to_string(),
                change: Change::Added,
                current: Some((*current).clone()),
                previous_hash: None,
                error: None,
            });
        }
    }

    for (path, error) in &unscannable {
        entries.push(DiffEntry {
            path: path.to_string(),
            change: Change::Unscannable,
            current: None,
            previous_hash: tracked.get(path).map(|file| file.file_hash.clone()),
            error: Some(error.to_string()),
        });
    }

    entries.sort_by(|a, b| a.path.cmp(&b.path));

    Diff { entries, skipped }
}

/// The first directory of `dirs` that `path` lies beneath.
fn ancestor_in<'a, V: Copy>(dirs: &BTreeMap<&'a str, V>, path: &str) -> Option<(&'a str, V)> {
    dirs.iter()
        .find(|(dir, _)| !dir.is_empty() && path.starts_with(*dir) && path[dir.len()..].starts_with('/'))
        .map(|(dir, value)| (*dir, *value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::{hash_bytes, Digest};
    use chrono::Utc;
    use std::path::PathBuf;

    fn scanned(path: &str, bytes: &[u8]) -> ScanEntry {
        ScanEntry::File(ScannedFile {
            relative_path: path.to_string(),
            absolute_path: PathBuf::from("/saves/game").join(path),
            size: bytes.len() as u64,
            digest: hash_bytes(bytes),
        })
    }

    fn tracked(id: i32, path: &str, digest: Digest) -> File {
        let time = Utc::now().naive_utc();

        File {
            id,
            file_path: path.to_string(),
            file_hash: digest.to_vec(),
            uuid: format!("00000000-0000-4000-8000-{:012}", id),
            save_id: 1,
            created_at: time,
            modified_at: time,
            deleted_at: None,
        }
    }

    fn changes(diff: &Diff) -> Vec<(&str, Change)> {
        diff.entries
            .iter()
            .map(|entry| (entry.path.as_str(), entry.change))
            .collect()
    }

    #[test]
    fn first_backup_is_all_added() {
        let current = vec![scanned("a.txt", b"hello"), scanned("b.txt", b"world")];
        let result = diff(&current, &[]);

        assert_eq!(
            changes(&result),
            vec![("a.txt", Change::Added), ("b.txt", Change::Added)]
        );
        assert!(result.has_changes());
    }

    #[test]
    fn classify_every_kind_of_change() {
        let current = vec![
            scanned("kept.sav", b"same"),
            scanned("edited.sav", b"new bytes"),
            scanned("fresh.sav", b"fresh"),
        ];
        let previous = vec![
            tracked(1, "kept.sav", hash_bytes(b"same")),
            tracked(2, "edited.sav", hash_bytes(b"old bytes")),
            tracked(3, "gone.sav", hash_bytes(b"gone")),
        ];

        let result = diff(&current, &previous);

        assert_eq!(
            changes(&result),
            vec![
                ("edited.sav", Change::Modified),
                ("fresh.sav", Change::Added),
                ("gone.sav", Change::Deleted),
                ("kept.sav", Change::Unchanged),
            ]
        );
        assert_eq!(
            result.get("edited.sav").unwrap().previous_hash,
            Some(hash_bytes(b"old bytes").to_vec())
        );
    }

    #[test]
    fn unchanged_tree_has_no_changes() {
        let current = vec![scanned("a.txt", b"hello"), scanned("b.txt", b"world")];
        let previous = vec![
            tracked(1, "a.txt", hash_bytes(b"hello")),
            tracked(2, "b.txt", hash_bytes(b"world")),
        ];

        let result = diff(&current, &previous);

        assert!(!result.has_changes());
        assert_eq!(result.count(Change::Unchanged), 2);
    }

    #[test]
    fn rename_is_delete_plus_add() {
        let current = vec![scanned("renamed.sav", b"content")];
        let previous = vec![tracked(1, "original.sav", hash_bytes(b"content"))];

        let result = diff(&current, &previous);

        assert_eq!(
            changes(&result),
            vec![
                ("original.sav", Change::Deleted),
                ("renamed.sav", Change::Added),
            ]
        );
    }

    #[test]
    fn unreadable_file_is_reported_not_deleted() {
        let current = vec![
            scanned("a.sav", b"a"),
            ScanEntry::Unreadable {
                path: "b.sav".to_string(),
                error: "permission denied".to_string(),
            },
        ];
        let previous = vec![
            tracked(1, "a.sav", hash_bytes(b"a")),
            tracked(2, "b.sav", hash_bytes(b"b")),
        ];

        let result = diff(&current, &previous);
        let entry = result.get("b.sav").unwrap();

        assert_eq!(entry.change, Change::Unscannable);
        assert_eq!(entry.error.as_deref(), Some("permission denied"));
        assert_eq!(result.count(Change::Deleted), 0);
    }

    #[test]
    fn unreadable_directory_protects_tracked_children() {
        let current = vec![ScanEntry::Unreadable {
            path: "profiles".to_string(),
            error: "permission denied".to_string(),
        }];
        let previous = vec![
            tracked(1, "profiles/p1.sav", hash_bytes(b"p1")),
            tracked(2, "profiles_backup.sav", hash_bytes(b"other")),
        ];

        let result = diff(&current, &previous);

        assert_eq!(
            changes(&result),
            vec![
                ("profiles", Change::Unscannable),
                ("profiles/p1.sav", Change::Unscannable),
                ("profiles_backup.sav", Change::Deleted),
            ]
        );
    }

    #[test]
    fn skipped_paths_are_kept_aside() {
        let current = vec![
            scanned("a.sav", b"a"),
            ScanEntry::Skipped {
                path: "link".to_string(),
                reason: SkipReason::OutsideRoot,
            },
        ];

        let result = diff(&current, &[]);

        assert_eq!(changes(&result), vec![("a.sav", Change::Added)]);
        assert_eq!(result.skipped, vec![("link".to_string(), SkipReason::OutsideRoot)]);
    }

    #[test]
    fn tracked_file_turned_link_is_skipped_not_deleted() {
        let current = vec![
            ScanEntry::Skipped {
                path: "slot.sav".to_string(),
                reason: SkipReason::OutsideRoot,
            },
            ScanEntry::Skipped {
                path: "profiles".to_string(),
                reason: SkipReason::Alias,
            },
        ];
        let previous = vec![
            tracked(1, "slot.sav", hash_bytes(b"slot")),
            tracked(2, "profiles/p1.sav", hash_bytes(b"p1")),
            tracked(3, "gone.sav", hash_bytes(b"gone")),
        ];

        let result = diff(&current, &previous);

        assert_eq!(changes(&result), vec![("gone.sav", Change::Deleted)]);
        assert_eq!(result.skipped.len(), 2);
        assert!(result.get("slot.sav").is_none());
        assert!(result.get("profiles/p1.sav").is_none());
    }

    #[test]
    fn tombstoned_records_are_ignored() {
        let mut tombstone = tracked(1, "a.sav", hash_bytes(b"old"));
        tombstone.deleted_at = Some(Utc::now().naive_utc());

        let result = diff(&[scanned("a.sav", b"new")], &[tombstone]);

        assert_eq!(changes(&result), vec![("a.sav", Change::Added)]);
    }
}
