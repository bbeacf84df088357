use std::{
    collections::HashSet,
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub path: String,
    pub is_dir: bool,
    pub delete_marker: bool,
    /// Index into the owning container, `-1` when not backed by archived bytes.
    pub archive_index: i64,
}

impl Entry {
    pub fn file(path: impl AsRef<str>) -> Self {
        Self {
            path: normalize_path(path.as_ref()),
            is_dir: false,
            delete_marker: false,
            archive_index: -1,
        }
    }

    pub fn dir(path: impl AsRef<str>) -> Self {
        Self {
            path: normalize_path(path.as_ref()),
            is_dir: true,
            delete_marker: false,
            archive_index: -1,
        }
    }

    pub fn with_index(mut self, index: i64) -> Self {
        self.archive_index = index;
        self
    }

    pub fn marked_for_delete(mut self) -> Self {
        self.delete_marker = true;
        self
    }

    pub fn depth(&self) -> usize {
        self.path.split('/').count()
    }

    pub fn resolve(&self, root: &Path) -> PathBuf {
        let mut out = root.to_path_buf();
        for part in self.path.split('/') {
            out.push(part);
        }
        out
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryManifest {
    entries: Vec<Entry>,
}

impl EntryManifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps entries as given. Backups list copy and delete sides over the same
    /// path space, so a path may appear once on each side.
    pub fn from_entries(entries: Vec<Entry>) -> Self {
        Self { entries }
    }

    pub fn push(&mut self, entry: Entry) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Entry> {
        self.entries.iter()
    }

    pub fn as_slice(&self) -> &[Entry] {
        &self.entries
    }

    pub fn get(&self, index: usize) -> Option<&Entry> {
        self.entries.get(index)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn contains_path(&self, path: &str) -> bool {
        self.entries.iter().any(|entry| entry.path == path)
    }

    pub fn push_unique(&mut self, entry: Entry) -> bool {
        if entry.path.is_empty() || self.contains_path(&entry.path) {
            return false;
        }
        self.entries.push(entry);
        true
    }

    /// Appends an entry, first adding any parent directory not yet listed so the
    /// manifest stays in pre-order.
    pub fn push_with_parents(&mut self, entry: Entry) -> bool {
        let parts: Vec<&str> = entry.path.split('/').collect();
        for depth in 1..parts.len() {
            let parent = parts[..depth].join("/");
            if !self.contains_path(&parent) {
                self.entries.push(Entry::dir(parent));
            }
        }
        self.push_unique(entry)
    }

    pub fn files(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter().filter(|entry| !entry.is_dir)
    }

    pub fn copies(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter().filter(|entry| !entry.delete_marker)
    }

    pub fn deletions(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter().filter(|entry| entry.delete_marker)
    }

    /// Delete-markers ordered children before parents: deepest path first,
    /// equal depths in reverse list order.
    pub fn deletion_order(&self) -> Vec<&Entry> {
        let mut out: Vec<&Entry> = self.deletions().collect();
        out.reverse();
        out.sort_by(|a, b| b.depth().cmp(&a.depth()));
        out
    }

    pub fn overlaps(&self, other: &EntryManifest) -> bool {
        let (small, large) = if self.len() <= other.len() {
            (self, other)
        } else {
            (other, self)
        };
        let paths: HashSet<&str> = small.files().map(|entry| entry.path.as_str()).collect();
        if paths.is_empty() {
            return false;
        }
        large.files().any(|entry| paths.contains(entry.path.as_str()))
    }

    pub fn directory_paths(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(|entry| entry.is_dir)
            .map(|entry| entry.path.as_str())
    }
}

impl<'a> IntoIterator for &'a EntryManifest {
    type Item = &'a Entry;
    type IntoIter = std::slice::Iter<'a, Entry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

impl FromIterator<Entry> for EntryManifest {
    fn from_iter<T: IntoIterator<Item = Entry>>(iter: T) -> Self {
        let mut manifest = EntryManifest::new();
        for entry in iter {
            manifest.push_unique(entry);
        }
        manifest
    }
}

pub fn normalize_path(raw: &str) -> String {
    raw.replace('\\', "/")
        .split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Strips `prefix/` from an archive path. An empty prefix matches everything.
pub fn strip_root<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    if prefix.is_empty() {
        return Some(path);
    }
    let rest = path.strip_prefix(prefix)?;
    if rest.is_empty() {
        return Some(rest);
    }
    rest.strip_prefix('/')
}

pub fn join_root(prefix: &str, path: &str) -> String {
    if prefix.is_empty() {
        path.to_string()
    } else {
        format!("{prefix}/{path}")
    }
}
