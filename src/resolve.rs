//! Path resolution: canonical paths for identity comparisons and
//! conversion between `file://` URIs and filesystem paths.

use std::fs;
use std::path::{Path, PathBuf};

use url::Url;

use crate::error::{Result, WatcherError};
use crate::types::Resolution;

/// A path together with how far it could be canonicalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    pub path: PathBuf,
    pub resolution: Resolution,
}

impl ResolvedPath {
    pub fn is_canonical(&self) -> bool {
        self.resolution == Resolution::Canonical
    }
}

/// Resolves `directory/file`, following symlinks.
///
/// Falls back to canonicalizing only the directory when the entry itself is
/// gone, and to the joined path as reported when the directory is gone too.
pub fn resolve_entry(directory: &Path, file: &Path) -> ResolvedPath {
    let joined = directory.join(file);
    if let Ok(path) = fs::canonicalize(&joined) {
        return ResolvedPath {
            path,
            resolution: Resolution::Canonical,
        };
    }
    if let Ok(parent) = fs::canonicalize(directory) {
        return ResolvedPath {
            path: parent.join(file),
            resolution: Resolution::ParentCanonical,
        };
    }
    ResolvedPath {
        path: joined,
        resolution: Resolution::Raw,
    }
}

/// Resolves a full path with the same fallbacks as [`resolve_entry`].
pub fn resolve_path(path: &Path) -> ResolvedPath {
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => resolve_entry(parent, Path::new(name)),
        _ => match fs::canonicalize(path) {
            Ok(path) => ResolvedPath {
                path,
                resolution: Resolution::Canonical,
            },
            Err(_) => ResolvedPath {
                path: path.to_path_buf(),
                resolution: Resolution::Raw,
            },
        },
    }
}

/// Converts a `file://` URI or an absolute path into a filesystem path.
pub fn uri_to_path(uri: &str) -> Result<PathBuf> {
    let as_path = Path::new(uri);
    if as_path.is_absolute() {
        return Ok(as_path.to_path_buf());
    }

    let url = Url::parse(uri).map_err(|error| WatcherError::InvalidUri(format!("{uri}: {error}")))?;
    if url.scheme() != "file" {
        return Err(WatcherError::InvalidUri(format!(
            "{uri}: unsupported scheme {}",
            url.scheme()
        )));
    }
    url.to_file_path()
        .map_err(|_| WatcherError::InvalidUri(format!("{uri}: not a local file path")))
}

/// Builds the scheme-qualified identifier used in change events.
pub fn path_to_uri(path: &Path) -> String {
    match Url::from_file_path(path) {
        Ok(url) => url.to_string(),
        Err(_) => format!("file://{}", path.display()),
    }
}

/// Checks whether `candidate` lies at or below `root`, comparing components.
pub fn path_in_scope(root: &Path, candidate: &Path) -> bool {
    candidate == root || candidate.starts_with(root)
}
