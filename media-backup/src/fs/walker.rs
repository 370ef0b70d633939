//! Directory traversal for staging and extraction trees.
//!
//! The archive builder needs a strict walk (any unreadable entry aborts the
//! archive), while restore needs a lossy one that keeps going and reports
//! what it could not read.

use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Suffix of files still being written (downloads, decryption output).
pub const PARTIAL_SUFFIX: &str = ".part";

/// Options for directory walking
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// Skip entries shallower than this depth (1 = skip files directly under root)
    pub min_depth: Option<usize>,

    /// Report directories as well as files
    pub include_dirs: bool,

    /// Exclude entries whose file name ends with any of these
    pub exclude_suffixes: Vec<String>,
}

/// Information about a file discovered during walking
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Full path to the file
    pub path: PathBuf,

    /// Relative path from the root
    pub relative_path: PathBuf,

    /// File size in bytes
    pub size: u64,

    /// Depth from root (1 = directly under root)
    pub depth: usize,

    pub is_dir: bool,
}

impl FileInfo {
    fn from_entry(entry: &DirEntry, root: &Path) -> std::io::Result<Self> {
        let metadata = entry.metadata().map_err(std::io::Error::from)?;
        let path = entry.path().to_path_buf();
        let relative_path = path.strip_prefix(root).unwrap_or(&path).to_path_buf();

        Ok(Self {
            path,
            relative_path,
            size: metadata.len(),
            depth: entry.depth(),
            is_dir: entry.file_type().is_dir(),
        })
    }

    /// Relative path with `/` separators regardless of platform.
    pub fn relative_slash_path(&self) -> String {
        self.relative_path
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }
}

/// Result of a lossy walk
#[derive(Debug, Default)]
pub struct WalkReport {
    pub files: Vec<FileInfo>,
    /// Entries that could not be read, with the reason
    pub errors: Vec<String>,
}

fn walker(root: &Path, options: &WalkOptions) -> WalkDir {
    // Depth 0 is the root itself, never reported
    let min_depth = options.min_depth.unwrap_or(1).max(1);
    WalkDir::new(root).min_depth(min_depth).sort_by_file_name()
}

/// Whether an entry is left out of the walk result.
fn skip(entry: &DirEntry, options: &WalkOptions) -> bool {
    if entry.file_type().is_dir() {
        return !options.include_dirs;
    }
    let file_name = entry.file_name().to_string_lossy();
    options
        .exclude_suffixes
        .iter()
        .any(|suffix| file_name.ends_with(suffix.as_str()))
}

/// Walk a directory tree and collect its files (and directories when asked),
/// failing on the first unreadable entry.
pub fn walk_directory(root: &Path, options: WalkOptions) -> std::io::Result<Vec<FileInfo>> {
    let mut files = Vec::new();

    for entry in walker(root, &options) {
        let entry = entry?;

        if skip(&entry, &options) {
            continue;
        }

        files.push(FileInfo::from_entry(&entry, root)?);
    }

    Ok(files)
}

/// Walk a directory tree, skipping entries that cannot be read.
pub fn walk_directory_lossy(root: &Path, options: WalkOptions) -> WalkReport {
    let mut report = WalkReport::default();

    for entry in walker(root, &options) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let at = e
                    .path()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| root.display().to_string());
                report.errors.push(format!("{}: {}", at, e));
                continue;
            }
        };

        if skip(&entry, &options) {
            continue;
        }

        match FileInfo::from_entry(&entry, root) {
            Ok(info) => report.files.push(info),
            Err(e) => report.errors.push(format!("{}: {}", entry.path().display(), e)),
        }
    }

    report
}
