//! Zip archive builder and extractor for staging directories.

use crate::fs::walker::{walk_directory, FileInfo, WalkOptions, PARTIAL_SUFFIX};
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use zip::result::ZipError;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Deflate level used for every entry.
const MAX_COMPRESSION: i64 = 9;

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("{0}")]
    Corrupt(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<ZipError> for ArchiveError {
    fn from(err: ZipError) -> Self {
        match err {
            ZipError::Io(e) => ArchiveError::Io(e),
            other => ArchiveError::Corrupt(other.to_string()),
        }
    }
}

/// Zip every file under `source_dir` into `output`, keeping relative paths.
///
/// Directories get their own entries so empty folders survive extraction.
/// Leftover `.part` files are not archived. Files are streamed one at a time,
/// so trees with thousands of entries are never held in memory. A partial
/// archive is removed on failure.
pub fn create_archive(source_dir: &Path, output: &Path) -> Result<PathBuf, ArchiveError> {
    let options = WalkOptions {
        include_dirs: true,
        exclude_suffixes: vec![PARTIAL_SUFFIX.to_string()],
        ..WalkOptions::default()
    };
    let files = walk_directory(source_dir, options)?;

    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)?;
    }

    let result = write_archive(&files, output);
    if result.is_err() {
        let _ = fs::remove_file(output);
    }
    let entries = result?;

    tracing::info!(
        archive = %output.display(),
        entries,
        "Archive created"
    );
    Ok(output.to_path_buf())
}

fn write_archive(files: &[FileInfo], output: &Path) -> Result<usize, ArchiveError> {
    let mut zip = ZipWriter::new(BufWriter::new(File::create(output)?));

    for info in files {
        if info.is_dir {
            zip.add_directory(info.relative_slash_path(), SimpleFileOptions::default())?;
            continue;
        }

        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .compression_level(Some(MAX_COMPRESSION))
            .large_file(info.size >= u32::MAX as u64);

        zip.start_file(info.relative_slash_path(), options)?;
        let mut source = File::open(&info.path)?;
        io::copy(&mut source, &mut zip)?;
    }

    let mut writer = zip.finish()?;
    writer.flush()?;
    Ok(files.len())
}

/// Extract `archive` into `dest`, returning the sorted top-level entry names.
///
/// `dest` is created if missing and existing files are overwritten. Entries
/// that would land outside `dest` make the archive count as corrupt.
pub fn extract_archive(archive: &Path, dest: &Path) -> Result<Vec<String>, ArchiveError> {
    let file = File::open(archive)?;
    let mut zip = ZipArchive::new(BufReader::new(file))?;
    fs::create_dir_all(dest)?;

    let mut top_level = BTreeSet::new();

    for index in 0..zip.len() {
        let mut entry = zip.by_index(index)?;
        let relative = match entry.enclosed_name() {
            Some(path) => path.to_path_buf(),
            None => {
                return Err(ArchiveError::Corrupt(format!(
                    "entry escapes the extraction directory: {}",
                    entry.name()
                )))
            }
        };

        if let Some(first) = relative.components().next() {
            top_level.insert(first.as_os_str().to_string_lossy().into_owned());
        }

        let target = dest.join(&relative);
        if entry.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut out = File::create(&target)?;
        io::copy(&mut entry, &mut out).map_err(|e| match e.kind() {
            io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof => {
                ArchiveError::Corrupt(format!("{}: {}", relative.display(), e))
            }
            _ => ArchiveError::Io(e),
        })?;
    }

    tracing::debug!(
        archive = %archive.display(),
        dest = %dest.display(),
        entries = zip.len(),
        "Archive extracted"
    );
    Ok(top_level.into_iter().collect())
}
