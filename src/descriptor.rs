//! Backend descriptor files
//!
//! A descriptor is a plain text file of `key: value` lines. Everything after
//! the first `:` is the value; lines without a `:` are ignored.

use crate::entry::{BackendEntry, Params};
use crate::error::DescriptorError;
use std::path::{Path, PathBuf};
use tracing::info;

/// File suffix a descriptor must carry to be loaded
pub const DESCRIPTOR_SUFFIX: &str = ".conf";

/// Parse descriptor text into parameters
pub fn parse(content: &str) -> Params {
    content
        .lines()
        .filter_map(|line| line.trim().split_once(':'))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .collect()
}

/// Read and parse a single descriptor file
pub fn read(path: &Path) -> Result<Params, DescriptorError> {
    let content = std::fs::read_to_string(path).map_err(|source| DescriptorError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(parse(&content))
}

/// Entry name for a descriptor path: the file name up to its last `.`
pub fn entry_name(path: &Path) -> String {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    match file_name.rsplit_once('.') {
        Some((stem, _)) => stem.to_string(),
        None => file_name,
    }
}

/// Load every descriptor in `dir`, sorted by file name.
///
/// The first invalid descriptor aborts the whole load.
pub fn load_dir(dir: &Path) -> Result<Vec<BackendEntry>, DescriptorError> {
    info!(path = %dir.display(), "Reading descriptors");

    let read_dir = std::fs::read_dir(dir).map_err(|source| DescriptorError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut paths: Vec<PathBuf> = Vec::new();
    for dirent in read_dir {
        let dirent = dirent.map_err(|source| DescriptorError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = dirent.path();
        let matches = path
            .file_name()
            .map(|n| n.to_string_lossy().ends_with(DESCRIPTOR_SUFFIX))
            .unwrap_or(false);
        if matches && path.is_file() {
            paths.push(path);
        }
    }
    paths.sort();

    let mut entries = Vec::with_capacity(paths.len());
    for path in paths {
        info!(path = %path.display(), "Reading descriptor");
        entries.push(BackendEntry::from_file(&path)?);
    }

    Ok(entries)
}
