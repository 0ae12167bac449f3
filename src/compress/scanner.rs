use crate::error::{CompressError, Result};
use std::ffi::OsStr;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::debug;
use walkdir::{DirEntry, WalkDir};

/// Totals gathered by the pre-scan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub total_files: u64,
    pub total_size: u64,
}

/// A name starting with `.` is hidden, except `.` and `..` themselves
pub fn is_hidden_name(name: &OsStr) -> bool {
    let name = name.to_string_lossy();
    name.starts_with('.') && name != "." && name != ".."
}

// The walk root is never hidden, whatever its name
fn is_hidden_entry(entry: &DirEntry) -> bool {
    entry.depth() > 0 && is_hidden_name(entry.file_name())
}

/// Canonical location `target` will occupy, so a walk can recognise it.
///
/// The file itself need not exist yet; only its parent is resolved.
pub(crate) fn archive_location(target: &Path) -> Option<PathBuf> {
    let parent = match target.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let name = target.file_name()?;
    std::fs::canonicalize(parent).ok().map(|dir| dir.join(name))
}

// Whether `entry` is the file at the canonical path `skip`
fn is_skipped_entry(entry: &DirEntry, skip: Option<&Path>) -> bool {
    let Some(skip) = skip else {
        return false;
    };
    if entry.file_type().is_dir() || skip.file_name() != Some(entry.file_name()) {
        return false;
    }
    std::fs::canonicalize(entry.path())
        .map(|path| path == skip)
        .unwrap_or(false)
}

/// Walk `root` in name order, pruning hidden directories and skipping hidden
/// files unless `include_hidden` is set. The file at `skip` (a canonical
/// path, usually the archive being written) is left out.
pub(crate) fn walk_eligible(
    root: &Path,
    include_hidden: bool,
    skip: Option<PathBuf>,
) -> impl Iterator<Item = walkdir::Result<DirEntry>> {
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(move |entry| {
            (include_hidden || !is_hidden_entry(entry)) && !is_skipped_entry(entry, skip.as_deref())
        })
}

pub(crate) fn walk_error(root: &Path, err: walkdir::Error) -> CompressError {
    let path = err
        .path()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| root.to_path_buf());
    CompressError::ScanFailed {
        path,
        source: Arc::new(io::Error::from(err)),
    }
}

/// Count eligible files under `root` and sum their sizes, leaving out the
/// file at the canonical path `skip`
pub fn scan_tree(root: &Path, include_hidden: bool, skip: Option<&Path>) -> Result<ScanSummary> {
    let mut summary = ScanSummary::default();

    for entry in walk_eligible(root, include_hidden, skip.map(Path::to_path_buf)) {
        let entry = entry.map_err(|e| walk_error(root, e))?;
        if entry.file_type().is_dir() {
            continue;
        }

        let metadata = entry.metadata().map_err(|e| walk_error(root, e))?;
        summary.total_files += 1;
        summary.total_size += metadata.len();
    }

    debug!(
        "Scanned {}: {} files, {} bytes",
        root.display(),
        summary.total_files,
        summary.total_size
    );

    Ok(summary)
}

/// Directories under `parent` selected by `depth`.
///
/// * `0` returns `parent` itself
/// * `1` returns the immediate child directories
/// * `n > 1` returns directories up to `n` levels down
/// * `n < 0` returns every nested directory
///
/// `parent` is excluded for any non-zero depth.
pub fn get_sub_directories(parent: &Path, depth: i32) -> Result<Vec<PathBuf>> {
    let metadata = std::fs::metadata(parent)
        .map_err(|e| CompressError::from_source_io(parent.to_path_buf(), e))?;
    if !metadata.is_dir() {
        return Err(CompressError::SourceNotDirectory(parent.to_path_buf()));
    }

    if depth == 0 {
        return Ok(vec![parent.to_path_buf()]);
    }

    let mut walker = WalkDir::new(parent).min_depth(1).sort_by_file_name();
    if depth > 0 {
        walker = walker.max_depth(depth as usize);
    }

    let mut dirs = Vec::new();
    for entry in walker {
        let entry = entry.map_err(|e| walk_error(parent, e))?;
        if entry.file_type().is_dir() {
            dirs.push(entry.into_path());
        }
    }

    Ok(dirs)
}

/// Resolve the directories one input path expands to.
///
/// Depth 1 splits the path into one archive per child directory; any other
/// depth packages the whole tree as a single archive.
pub fn select_directories(path: &Path, depth: i32) -> Result<Vec<PathBuf>> {
    let absolute = absolute_path(path)
        .map_err(|e| CompressError::from_source_io(path.to_path_buf(), e))?;

    let metadata = std::fs::metadata(&absolute)
        .map_err(|e| CompressError::from_source_io(absolute.clone(), e))?;
    if !metadata.is_dir() {
        return Err(CompressError::SourceNotDirectory(absolute));
    }

    if depth == 1 {
        get_sub_directories(&absolute, 1)
    } else {
        Ok(vec![absolute])
    }
}

/// Make `path` absolute against the working directory and fold `.`/`..`
/// lexically, without touching symlinks.
pub fn absolute_path(path: &Path) -> io::Result<PathBuf> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };

    let mut cleaned = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                cleaned.pop();
            }
            other => cleaned.push(other.as_os_str()),
        }
    }

    Ok(cleaned)
}
