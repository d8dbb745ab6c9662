//! Watch pipeline stages.
//!
//! - `native` - notify-backed native watch adapter and raw event translation
//! - `trim` - same-path raw event coalescing within one batch
//! - `ignore` - per-watch glob exclusion
//! - `poller` - existence polling for roots that do not exist yet

mod ignore;
mod native;
mod poller;
mod trim;

pub use ignore::IgnoreFilter;
pub use native::{
    backend_for, translate_event, NativeBackend, NativeSignal, NativeWatch, NotifyBackend,
    RawEventSink,
};
pub use poller::spawn_existence_poll;
pub use trim::trim_change_events;
