use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use effect_ledger_core::{hash_bytes, now_utc, InputsSnapshot};

/// One file observed by a content source, addressed by its relative path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentEntry {
    pub path: String,
    pub bytes: u64,
    pub hash: String,
}

impl ContentEntry {
    #[must_use]
    pub fn is_note(&self) -> bool {
        Path::new(&self.path)
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("md"))
    }
}

/// The content an operation is planned against.
pub trait ContentSource: Send + Sync {
    fn describe(&self) -> String;

    #[allow(clippy::missing_errors_doc)]
    fn entries(&self) -> Result<Vec<ContentEntry>>;

    /// Hash over sorted `(path, file hash)` pairs plus file, note and byte counts.
    #[allow(clippy::missing_errors_doc)]
    fn snapshot(&self) -> Result<InputsSnapshot> {
        let entries = self.entries()?;
        Ok(snapshot_of(&entries))
    }
}

#[must_use]
pub fn snapshot_of(entries: &[ContentEntry]) -> InputsSnapshot {
    let mut sorted: Vec<&ContentEntry> = entries.iter().collect();
    sorted.sort_by(|left, right| left.path.cmp(&right.path));

    let mut digest_input = String::new();
    let mut bytes = 0_u64;
    let mut notes = 0_u64;
    for entry in &sorted {
        digest_input.push_str(&entry.path);
        digest_input.push('\0');
        digest_input.push_str(&entry.hash);
        digest_input.push('\n');
        bytes = bytes.saturating_add(entry.bytes);
        if entry.is_note() {
            notes += 1;
        }
    }

    let mut counts = BTreeMap::new();
    counts.insert("bytes".to_string(), bytes);
    counts.insert("files".to_string(), u64::try_from(sorted.len()).unwrap_or(u64::MAX));
    counts.insert("notes".to_string(), notes);

    InputsSnapshot {
        content_hash: hash_bytes(digest_input.as_bytes()),
        counts,
        timestamp: now_utc(),
    }
}

/// Every regular file below `root`, skipping dot-directories and dot-files.
#[derive(Debug, Clone)]
pub struct DirectoryContentSource {
    root: PathBuf,
}

impl DirectoryContentSource {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn walk(&self, dir: &Path, out: &mut Vec<ContentEntry>) -> Result<()> {
        let listing = fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))?;
        for item in listing {
            let item = item.with_context(|| format!("failed to read entry in {}", dir.display()))?;
            let name = item.file_name();
            if name.to_string_lossy().starts_with('.') {
                continue;
            }
            let path = item.path();
            let file_type = item
                .file_type()
                .with_context(|| format!("failed to stat {}", path.display()))?;
            if file_type.is_dir() {
                self.walk(&path, out)?;
            } else if file_type.is_file() {
                let bytes = fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
                out.push(ContentEntry {
                    path: relative_path(&self.root, &path),
                    bytes: u64::try_from(bytes.len()).unwrap_or(u64::MAX),
                    hash: hash_bytes(&bytes),
                });
            }
        }
        Ok(())
    }
}

impl ContentSource for DirectoryContentSource {
    fn describe(&self) -> String {
        format!("directory:{}", self.root.display())
    }

    fn entries(&self) -> Result<Vec<ContentEntry>> {
        let mut entries = Vec::new();
        self.walk(&self.root, &mut entries)
            .with_context(|| format!("failed to scan content under {}", self.root.display()))?;
        entries.sort_by(|left, right| left.path.cmp(&right.path));
        Ok(entries)
    }
}

/// A source with nothing in it, for operations that read no content.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyContentSource;

impl ContentSource for EmptyContentSource {
    fn describe(&self) -> String {
        "empty".to_string()
    }

    fn entries(&self) -> Result<Vec<ContentEntry>> {
        Ok(Vec::new())
    }
}

fn relative_path(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn temp_vault() -> PathBuf {
        let root = std::env::temp_dir().join(format!("elg-source-{}", Ulid::new()));
        must(fs::create_dir_all(root.join("daily")).map_err(anyhow::Error::from));
        must(fs::create_dir_all(root.join(".obsidian")).map_err(anyhow::Error::from));
        must(fs::write(root.join("index.md"), "# Index\n").map_err(anyhow::Error::from));
        must(fs::write(root.join("daily/2026-10-01.md"), "today\n").map_err(anyhow::Error::from));
        must(fs::write(root.join("daily/image.png"), [0_u8, 1, 2]).map_err(anyhow::Error::from));
        must(fs::write(root.join(".obsidian/app.json"), "{}").map_err(anyhow::Error::from));
        root
    }

    #[test]
    fn directory_snapshot_counts_files_notes_and_bytes() {
        let root = temp_vault();
        let source = DirectoryContentSource::new(&root);

        let entries = must(source.entries());
        let paths: Vec<&str> = entries.iter().map(|entry| entry.path.as_str()).collect();
        assert_eq!(paths, vec!["daily/2026-10-01.md", "daily/image.png", "index.md"]);

        let snapshot = must(source.snapshot());
        assert_eq!(snapshot.counts.get("files"), Some(&3));
        assert_eq!(snapshot.counts.get("notes"), Some(&2));
        assert_eq!(snapshot.counts.get("bytes"), Some(&17));

        let again = must(source.snapshot());
        assert_eq!(snapshot.content_hash, again.content_hash);

        must(fs::write(root.join("index.md"), "# Index v2\n").map_err(anyhow::Error::from));
        let changed = must(source.snapshot());
        assert_ne!(snapshot.content_hash, changed.content_hash);

        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn missing_root_is_an_error_and_empty_source_still_hashes() {
        let source = DirectoryContentSource::new(std::env::temp_dir().join(format!("elg-missing-{}", Ulid::new())));
        assert!(source.snapshot().is_err());

        let empty = must(EmptyContentSource.snapshot());
        assert!(!empty.content_hash.is_empty());
        assert_eq!(empty.counts.get("files"), Some(&0));
    }
}
