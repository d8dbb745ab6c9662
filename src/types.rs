//! Core types shared by the watcher server, its pipeline stages and clients.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Identifier of a live watch, allocated by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WatchId(pub u32);

impl fmt::Display for WatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Options supplied with a watch request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchOptions {
    /// Glob patterns matched against absolute paths; matching events are dropped.
    pub ignored: Vec<String>,
}

impl WatchOptions {
    pub fn ignoring<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ignored: patterns.into_iter().map(Into::into).collect(),
        }
    }
}

/// Kind of change delivered to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Updated,
    Added,
    Deleted,
}

impl ChangeType {
    /// Wire value used by the file service protocol.
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Updated => 0,
            Self::Added => 1,
            Self::Deleted => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Updated => "updated",
            Self::Added => "added",
            Self::Deleted => "deleted",
        }
    }
}

/// How the path behind a change was resolved before it became a URI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Resolution {
    /// The full path was canonicalized.
    #[default]
    Canonical,
    /// Only the parent directory could be canonicalized (entry is gone).
    ParentCanonical,
    /// Nothing could be canonicalized; the reported path is used as-is.
    Raw,
}

/// A single semantic change for one URI.
///
/// Equality ignores `resolution`, which is diagnostic only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub uri: String,
    #[serde(rename = "type")]
    pub change_type: ChangeType,
    #[serde(skip)]
    pub resolution: Resolution,
}

impl ChangeEvent {
    pub fn new(uri: impl Into<String>, change_type: ChangeType) -> Self {
        Self {
            uri: uri.into(),
            change_type,
            resolution: Resolution::Canonical,
        }
    }
}

impl PartialEq for ChangeEvent {
    fn eq(&self, other: &Self) -> bool {
        self.uri == other.uri && self.change_type == other.change_type
    }
}

impl Eq for ChangeEvent {}

/// Payload of one debounced delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DidFilesChangedParams {
    pub changes: Vec<ChangeEvent>,
}

/// Lifecycle of a watch handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Requested,
    Polling,
    Active,
    Disposed,
}

impl WatchState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Polling => "polling",
            Self::Active => "active",
            Self::Disposed => "disposed",
        }
    }
}

/// Action reported by the native watch primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawAction {
    Created,
    Deleted,
    Modified,
    Renamed,
}

/// A single OS-level notification, normalized to directory + entry name.
///
/// Renames carry `old_file`/`new_file` instead of `file`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub action: RawAction,
    pub directory: PathBuf,
    pub file: Option<PathBuf>,
    pub old_file: Option<PathBuf>,
    pub new_file: Option<PathBuf>,
}

impl RawEvent {
    /// Builds a non-rename event from a full path.
    pub fn for_path(action: RawAction, path: &Path) -> Self {
        let (directory, file) = split_path(path);
        Self {
            action,
            directory,
            file: Some(file),
            old_file: None,
            new_file: None,
        }
    }

    /// Builds a rename event. Both entries are expressed relative to the old
    /// path's directory.
    pub fn renamed(from: &Path, to: &Path) -> Self {
        let (directory, old_file) = split_path(from);
        let new_file = match to.strip_prefix(&directory) {
            Ok(relative) => relative.to_path_buf(),
            Err(_) => to.to_path_buf(),
        };
        Self {
            action: RawAction::Renamed,
            directory,
            file: None,
            old_file: Some(old_file),
            new_file: Some(new_file),
        }
    }

    /// Full path of the affected entry, for non-rename events.
    pub fn path(&self) -> Option<PathBuf> {
        self.file.as_ref().map(|file| self.directory.join(file))
    }
}

fn split_path(path: &Path) -> (PathBuf, PathBuf) {
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => (parent.to_path_buf(), PathBuf::from(name)),
        _ => (path.to_path_buf(), PathBuf::new()),
    }
}
