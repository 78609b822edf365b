//! In-memory path-indexed archive tree (C5).
//!
//! An [`Archive`] is the model that the oiCA codec serializes. It never
//! touches bytes on disk itself — [`crate::formats::oica`] is the only
//! consumer of its ordering and lookup contracts.

use std::collections::BTreeMap;

use crate::error::{OxError, OxResult};

/// Whether an [`ArchiveEntry`] is a file or a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Folder,
}

/// One entry in the archive tree.
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    pub path: String,
    pub kind: EntryKind,
    /// Nanoseconds since Unix epoch, or zero if unknown.
    pub timestamp: u64,
    /// Only meaningful for `EntryKind::File`.
    pub data: Vec<u8>,
}

/// Path-indexed tree of files and directories.
///
/// Paths are stored case-preserving but compared case-insensitively for
/// uniqueness, lookup, and sort order (Open Question #2 in `DESIGN.md`).
#[derive(Debug, Clone, Default)]
pub struct Archive {
    /// Keyed by lowercased path for case-insensitive lookup; the entry
    /// itself keeps the original-case path.
    entries: BTreeMap<String, ArchiveEntry>,
}

fn normalize(path: &str) -> String {
    path.trim_matches('/').to_string()
}

fn lower_key(path: &str) -> String {
    normalize(path).to_lowercase()
}

fn depth(path: &str) -> usize {
    if path.is_empty() {
        0
    } else {
        path.matches('/').count() + 1
    }
}

fn parent_of(path: &str) -> Option<String> {
    let path = normalize(path);
    match path.rfind('/') {
        Some(idx) => Some(path[..idx].to_string()),
        None => {
            if path.is_empty() {
                None
            } else {
                Some(String::new())
            }
        }
    }
}

fn basename(path: &str) -> &str {
    let path = path.trim_end_matches('/');
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

/// Validates a single path component per `spec.md` §3 Path primitive:
/// non-empty, none of `: < > ? * " |` or control codes.
pub fn is_valid_component(name: &str) -> bool {
    if name.is_empty() {
        return false;
    }
    const FORBIDDEN: &[char] = &[':', '<', '>', '?', '*', '"', '|', '/'];
    !name.chars().any(|c| FORBIDDEN.contains(&c) || c.is_control())
}

/// Validates an entire relative path: non-empty components, no `..`.
pub fn is_valid_path(path: &str) -> bool {
    let path = normalize(path);
    if path.is_empty() {
        return true; // root
    }
    path.split('/').all(|c| c != ".." && is_valid_component(c))
}

impl Archive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn has(&self, path: &str) -> bool {
        self.entries.contains_key(&lower_key(path))
    }

    pub fn has_file(&self, path: &str) -> bool {
        matches!(self.entries.get(&lower_key(path)), Some(e) if e.kind == EntryKind::File)
    }

    pub fn has_folder(&self, path: &str) -> bool {
        matches!(self.entries.get(&lower_key(path)), Some(e) if e.kind == EntryKind::Folder)
    }

    /// Creates `p` and any missing ancestors as folders. Idempotent if `p`
    /// already exists as a folder; fails `AlreadyDefined` if it exists as a
    /// file.
    pub fn add_directory(&mut self, path: &str) -> OxResult<()> {
        let path = normalize(path);
        if path.is_empty() {
            return Ok(());
        }
        if !is_valid_path(&path) {
            return Err(OxError::InvalidParameter(format!("invalid path: {path}")));
        }
        if let Some(existing) = self.entries.get(&lower_key(&path)) {
            return match existing.kind {
                EntryKind::Folder => Ok(()),
                EntryKind::File => Err(OxError::AlreadyDefined(format!(
                    "{path} already exists as a file"
                ))),
            };
        }
        if let Some(parent) = parent_of(&path) {
            if !parent.is_empty() {
                self.add_directory(&parent)?;
            }
        }
        self.entries.insert(
            lower_key(&path),
            ArchiveEntry {
                path,
                kind: EntryKind::Folder,
                timestamp: 0,
                data: Vec::new(),
            },
        );
        Ok(())
    }

    /// Adds a file at `path`, auto-creating missing ancestor directories.
    /// Fails `AlreadyDefined` if `path` already exists.
    pub fn add_file(&mut self, path: &str, data: Vec<u8>, timestamp: u64) -> OxResult<()> {
        let path = normalize(path);
        if path.is_empty() || !is_valid_path(&path) {
            return Err(OxError::InvalidParameter(format!("invalid path: {path}")));
        }
        if self.entries.contains_key(&lower_key(&path)) {
            return Err(OxError::AlreadyDefined(format!("{path} already exists")));
        }
        if let Some(parent) = parent_of(&path) {
            if !parent.is_empty() {
                self.add_directory(&parent)?;
            }
        }
        self.entries.insert(
            lower_key(&path),
            ArchiveEntry {
                path,
                kind: EntryKind::File,
                timestamp,
                data,
            },
        );
        Ok(())
    }

    /// Removes `path`; if it is a folder, recursively removes descendants.
    pub fn remove(&mut self, path: &str) -> OxResult<()> {
        let key = lower_key(path);
        if !self.entries.contains_key(&key) {
            return Err(OxError::NotFound(format!("{path} not found")));
        }
        let prefix = format!("{key}/");
        let doomed: Vec<String> = self
            .entries
            .keys()
            .filter(|k| **k == key || k.starts_with(&prefix))
            .cloned()
            .collect();
        for k in doomed {
            self.entries.remove(&k);
        }
        Ok(())
    }

    /// Changes the last component of `path` to `new_name`. `new_name` must
    /// be a valid filename and unique within the parent.
    pub fn rename(&mut self, path: &str, new_name: &str) -> OxResult<()> {
        if !is_valid_component(new_name) {
            return Err(OxError::InvalidParameter(format!("invalid name: {new_name}")));
        }
        let path = normalize(path);
        let entry = self
            .entries
            .get(&lower_key(&path))
            .cloned()
            .ok_or_else(|| OxError::NotFound(format!("{path} not found")))?;
        let new_path = match parent_of(&path) {
            Some(parent) if !parent.is_empty() => format!("{parent}/{new_name}"),
            _ => new_name.to_string(),
        };
        self.move_subtree(&path, &entry.path, &new_path)
    }

    /// Reparents `path` into existing folder `dir`.
    pub fn r#move(&mut self, path: &str, dir: &str) -> OxResult<()> {
        let path = normalize(path);
        let dir = normalize(dir);
        if !dir.is_empty() && !self.has_folder(&dir) {
            return Err(OxError::NotFound(format!("target folder {dir} not found")));
        }
        let entry = self
            .entries
            .get(&lower_key(&path))
            .cloned()
            .ok_or_else(|| OxError::NotFound(format!("{path} not found")))?;
        let name = basename(&path);
        let new_path = if dir.is_empty() {
            name.to_string()
        } else {
            format!("{dir}/{name}")
        };
        self.move_subtree(&path, &entry.path, &new_path)
    }

    fn move_subtree(&mut self, old_path: &str, _orig_case: &str, new_path: &str) -> OxResult<()> {
        let old_key = lower_key(old_path);
        let new_key = lower_key(new_path);
        if old_key != new_key && self.entries.contains_key(&new_key) {
            return Err(OxError::AlreadyDefined(format!("{new_path} already exists")));
        }
        let prefix = format!("{old_key}/");
        let moved: Vec<(String, ArchiveEntry)> = self
            .entries
            .iter()
            .filter(|(k, _)| **k == old_key || k.starts_with(&prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (old_k, mut entry) in moved {
            let suffix = &old_k[old_key.len()..];
            let rebased = format!("{new_path}{suffix}");
            entry.path = rebased.clone();
            self.entries.remove(&old_k);
            self.entries.insert(lower_key(&rebased), entry);
        }
        Ok(())
    }

    pub fn get_info(&self, path: &str) -> OxResult<&ArchiveEntry> {
        self.entries
            .get(&lower_key(path))
            .ok_or_else(|| OxError::NotFound(format!("{path} not found")))
    }

    pub fn get_data(&self, path: &str) -> OxResult<&[u8]> {
        let entry = self.get_info(path)?;
        match entry.kind {
            EntryKind::File => Ok(&entry.data),
            EntryKind::Folder => Err(OxError::InvalidState(format!("{path} is a folder"))),
        }
    }

    /// Entries in canonical order: parents before children, and within a
    /// depth, case-insensitive ascending by path.
    pub fn canonical_order(&self) -> Vec<&ArchiveEntry> {
        let mut v: Vec<&ArchiveEntry> = self.entries.values().collect();
        v.sort_by(|a, b| {
            depth(&a.path)
                .cmp(&depth(&b.path))
                .then_with(|| a.path.to_lowercase().cmp(&b.path.to_lowercase()))
        });
        v
    }

    /// Visits entries at or beneath `root` in canonical order.
    ///
    /// `recursive = false` visits only the direct children of `root`
    /// (plus `root` itself if it matches `kind_filter`). The callback may
    /// short-circuit by returning `false`.
    pub fn foreach<F>(&self, root: &str, recursive: bool, kind_filter: Option<EntryKind>, mut cb: F)
    where
        F: FnMut(&ArchiveEntry) -> bool,
    {
        let root = normalize(root);
        let root_depth = if root.is_empty() { 0 } else { depth(&root) };
        for entry in self.canonical_order() {
            let under_root = root.is_empty()
                || entry.path.to_lowercase() == root.to_lowercase()
                || entry
                    .path
                    .to_lowercase()
                    .starts_with(&format!("{}/", root.to_lowercase()));
            if !under_root {
                continue;
            }
            if !recursive && entry.path.to_lowercase() != root.to_lowercase() {
                let is_direct_child = depth(&entry.path) == root_depth + 1;
                if !is_direct_child {
                    continue;
                }
            }
            if let Some(kind) = kind_filter {
                if entry.kind != kind {
                    continue;
                }
            }
            if !cb(entry) {
                break;
            }
        }
    }

    pub fn query_file_count(&self) -> usize {
        self.entries.values().filter(|e| e.kind == EntryKind::File).count()
    }

    pub fn query_folder_count(&self) -> usize {
        self.entries.values().filter(|e| e.kind == EntryKind::Folder).count()
    }

    pub fn query_file_entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Merges `other` into a fresh archive alongside `self`. Fails
    /// `AlreadyDefined` if any path collides (case-insensitively).
    pub fn combine(&self, other: &Archive) -> OxResult<Archive> {
        let mut result = self.clone();
        for entry in other.canonical_order() {
            match entry.kind {
                EntryKind::Folder => result.add_directory(&entry.path)?,
                EntryKind::File => {
                    if result.has(&entry.path) {
                        return Err(OxError::AlreadyDefined(format!(
                            "{} already exists",
                            entry.path
                        )));
                    }
                    result.add_file(&entry.path, entry.data.clone(), entry.timestamp)?;
                }
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_file_autocreates_parents() {
        let mut a = Archive::new();
        a.add_file("x/y/file.txt", b"hi".to_vec(), 0).unwrap();
        assert!(a.has_folder("x"));
        assert!(a.has_folder("x/y"));
        assert!(a.has_file("x/y/file.txt"));
    }

    #[test]
    fn add_file_rejects_duplicate() {
        let mut a = Archive::new();
        a.add_file("f.txt", vec![], 0).unwrap();
        assert!(matches!(a.add_file("f.txt", vec![], 0), Err(OxError::AlreadyDefined(_))));
    }

    #[test]
    fn case_insensitive_collision() {
        let mut a = Archive::new();
        a.add_file("Foo.txt", vec![], 0).unwrap();
        assert!(matches!(a.add_file("foo.TXT", vec![], 0), Err(OxError::AlreadyDefined(_))));
    }

    #[test]
    fn canonical_order_parents_first() {
        let mut a = Archive::new();
        a.add_file("b/2.txt", vec![], 0).unwrap();
        a.add_file("a/1.txt", vec![], 0).unwrap();
        let order: Vec<&str> = a.canonical_order().iter().map(|e| e.path.as_str()).collect();
        // depth 1 (a, b) before depth 2 (a/1.txt, b/2.txt); alphabetical within depth.
        assert_eq!(order, vec!["a", "b", "a/1.txt", "b/2.txt"]);
    }

    #[test]
    fn combine_disjoint_ok() {
        let mut a = Archive::new();
        a.add_file("x/1", vec![], 0).unwrap();
        let mut b = Archive::new();
        b.add_file("y/2", vec![], 0).unwrap();
        let c = a.combine(&b).unwrap();
        assert!(c.has_file("x/1"));
        assert!(c.has_file("y/2"));
    }

    #[test]
    fn combine_collision_fails() {
        let mut a = Archive::new();
        a.add_file("x/1", vec![], 0).unwrap();
        let mut b = Archive::new();
        b.add_file("x/1", vec![], 0).unwrap();
        assert!(matches!(a.combine(&b), Err(OxError::AlreadyDefined(_))));
    }

    #[test]
    fn remove_recursive() {
        let mut a = Archive::new();
        a.add_file("dir/a.txt", vec![], 0).unwrap();
        a.add_file("dir/b.txt", vec![], 0).unwrap();
        a.remove("dir").unwrap();
        assert!(!a.has("dir"));
        assert!(!a.has("dir/a.txt"));
    }

    #[test]
    fn rename_and_move() {
        let mut a = Archive::new();
        a.add_file("dir/a.txt", vec![], 0).unwrap();
        a.rename("dir/a.txt", "b.txt").unwrap();
        assert!(a.has_file("dir/b.txt"));
        a.add_directory("other").unwrap();
        a.r#move("dir/b.txt", "other").unwrap();
        assert!(a.has_file("other/b.txt"));
    }
}
