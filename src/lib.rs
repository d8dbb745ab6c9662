//! Filesystem change watching service.
//!
//! This crate watches directory roots and delivers de-noised, debounced
//! batches of semantic changes to a single client:
//! - Native watches through `notify`, with rename and atomic-save handling
//! - Per-watch glob exclusion
//! - Existence polling for roots that do not exist yet
//! - Debounced last-write-wins aggregation per URI

pub mod config;
pub mod dispatch;
pub mod dispose;
pub mod error;
pub mod resolve;
pub mod server;
pub mod types;
pub mod watcher;

// Re-export main types
pub use config::{BackendKind, WatcherConfig};
pub use dispatch::{ChangeWindow, Dispatcher, FileSystemWatcherClient};
pub use dispose::DisposeChain;
pub use error::{Result, WatcherError};
pub use server::FileWatcherServer;
pub use types::{
    ChangeEvent, ChangeType, DidFilesChangedParams, RawAction, RawEvent, Resolution, WatchId,
    WatchOptions, WatchState,
};
pub use watcher::{NativeBackend, NativeWatch, RawEventSink};
