//! Immutable snapshots of the source directory handed to the pipeline.
//!
//! A snapshot is taken once per invocation. Everything downstream (builder containers, the
//! version derived from the digest, the explore image) sees that snapshot rather than the live
//! directory, so edits made while a pipeline runs cannot leak into half of it.

use crate::archive::{ArchiveWriter, MODE_EXECUTABLE, MODE_FILE};
use bytes::Bytes;
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

#[derive(thiserror::Error, Debug)]
pub enum SourceError {
    #[error("source path '{0}' is not a directory")]
    NotADirectory(PathBuf),

    #[error("invalid exclusion pattern; {0}")]
    Pattern(#[from] globset::Error),

    #[error("could not walk source tree; {0}")]
    Walk(#[from] walkdir::Error),

    #[error("file '{0}' not found in source tree")]
    MissingFile(String),

    #[error("could not read source tree; {0}")]
    Io(#[from] std::io::Error),
}

/// Dockerignore-like exclusion patterns, matched against paths relative to the source root.
///
/// `*` does not cross directory separators, so `*.tgz` only matches archives at the root while
/// `**/.git` matches git metadata at any depth. A path is excluded when it, or any directory
/// above it, matches.
#[derive(Debug, Clone)]
pub struct ExclusionFilter {
    set: GlobSet,
}

impl ExclusionFilter {
    pub fn new(patterns: &[String]) -> Result<Self, SourceError> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let pattern = pattern.trim_start_matches("./").trim_end_matches('/');
            builder.add(GlobBuilder::new(pattern).literal_separator(true).build()?);
        }

        Ok(Self {
            set: builder.build()?,
        })
    }

    pub fn is_excluded(&self, relative: &Path) -> bool {
        relative
            .ancestors()
            .filter(|path| !path.as_os_str().is_empty())
            .any(|path| self.set.is_match(path))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum EntryKind {
    Directory,
    File { data: Bytes, executable: bool },
    Symlink { target: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    /// Relative path with `/` separators.
    path: String,
    kind: EntryKind,
}

/// A content addressed snapshot of a directory.
#[derive(Clone)]
pub struct SourceTree {
    root: PathBuf,
    entries: Vec<Entry>,
    digest: String,
}

impl Debug for SourceTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceTree")
            .field("root", &self.root)
            .field("entries", &self.entries.len())
            .field("digest", &self.digest)
            .finish()
    }
}

impl SourceTree {
    /// Snapshot the directory at `root`, skipping everything the filter excludes.
    pub fn snapshot(root: &Path, filter: &ExclusionFilter) -> Result<Self, SourceError> {
        if !root.is_dir() {
            return Err(SourceError::NotADirectory(root.to_path_buf()));
        }

        let mut entries = vec![];
        let walker = WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .min_depth(1)
            .into_iter()
            .filter_entry(|entry| {
                entry
                    .path()
                    .strip_prefix(root)
                    .map(|relative| !filter.is_excluded(relative))
                    .unwrap_or(false)
            });

        for entry in walker {
            let entry = entry?;
            let relative = entry
                .path()
                .strip_prefix(root)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
            let path = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");

            let file_type = entry.file_type();
            let kind = if file_type.is_dir() {
                EntryKind::Directory
            } else if file_type.is_symlink() {
                EntryKind::Symlink {
                    target: std::fs::read_link(entry.path())?,
                }
            } else if file_type.is_file() {
                let metadata = entry.metadata()?;
                EntryKind::File {
                    data: Bytes::from(std::fs::read(entry.path())?),
                    executable: is_executable(&metadata),
                }
            } else {
                // Sockets, fifos and device nodes have no place in a build context.
                continue;
            };

            entries.push(Entry { path, kind });
        }

        let mut tree = Self {
            root: root.to_path_buf(),
            entries,
            digest: String::new(),
        };

        let mut hasher = Sha256::new();
        hasher.update(tree.archive("")?);
        tree.digest = format!("sha256:{}", hex::encode(hasher.finalize()));

        debug!(
            root = %tree.root.display(),
            entries = tree.entries.len(),
            digest = %tree.digest,
            "Snapshotted source tree"
        );

        Ok(tree)
    }

    /// Snapshot on the blocking pool.
    pub async fn open(root: PathBuf, exclude: Vec<String>) -> Result<Self, SourceError> {
        tokio::task::spawn_blocking(move || {
            let filter = ExclusionFilter::new(&exclude)?;
            Self::snapshot(&root, &filter)
        })
        .await
        .map_err(|e| SourceError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
    }

    /// Content digest in `<algorithm>:<hex>` form.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    #[cfg(test)]
    pub fn contains(&self, path: &str) -> bool {
        self.entries.iter().any(|entry| entry.path == path)
    }

    /// Number of regular files in the snapshot.
    pub fn file_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| matches!(entry.kind, EntryKind::File { .. }))
            .count()
    }

    /// Renders the whole snapshot as a tar archive rooted at `prefix`.
    pub fn archive(&self, prefix: &str) -> Result<Bytes, SourceError> {
        let mut writer = ArchiveWriter::new();
        if !prefix.is_empty() {
            writer.directory(prefix)?;
        }

        for entry in &self.entries {
            write_entry(&mut writer, &prefixed(prefix, &entry.path), &entry.kind)?;
        }

        Ok(writer.finish()?)
    }

    /// Renders only the named files, failing if any of them is absent from the snapshot.
    pub fn subset_archive(&self, prefix: &str, files: &[&str]) -> Result<Bytes, SourceError> {
        let mut writer = ArchiveWriter::new();
        if !prefix.is_empty() {
            writer.directory(prefix)?;
        }

        for file in files {
            let entry = self
                .entries
                .iter()
                .find(|entry| entry.path == *file && matches!(entry.kind, EntryKind::File { .. }))
                .ok_or_else(|| SourceError::MissingFile(file.to_string()))?;
            write_entry(&mut writer, &prefixed(prefix, &entry.path), &entry.kind)?;
        }

        Ok(writer.finish()?)
    }
}

fn prefixed(prefix: &str, path: &str) -> String {
    if prefix.is_empty() {
        path.to_string()
    } else {
        format!("{}/{}", prefix.trim_end_matches('/'), path)
    }
}

fn write_entry(writer: &mut ArchiveWriter, path: &str, kind: &EntryKind) -> std::io::Result<()> {
    match kind {
        EntryKind::Directory => writer.directory(path),
        EntryKind::File { data, executable } => {
            let mode = if *executable { MODE_EXECUTABLE } else { MODE_FILE };
            writer.file(path, data, mode)
        }
        EntryKind::Symlink { target } => writer.symlink(path, target),
    }
}

fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;

    metadata.permissions().mode() & 0o111 != 0
}
