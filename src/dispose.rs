//! Scoped release actions for watch handles.
//!
//! A [`DisposeChain`] is an ordered list of independent release actions
//! (registry entry, poll task, native watch, event pump). Each action runs at
//! most once; actions pushed after disposal run immediately, which is how a
//! native watch whose startup finished after `unwatch` gets stopped.

use std::fmt;

use parking_lot::Mutex;

type Action = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct ChainState {
    disposed: bool,
    actions: Vec<(&'static str, Action)>,
}

#[derive(Default)]
pub struct DisposeChain {
    state: Mutex<ChainState>,
}

impl fmt::Debug for DisposeChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("DisposeChain")
            .field("disposed", &state.disposed)
            .field(
                "actions",
                &state.actions.iter().map(|(name, _)| *name).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl DisposeChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a release action. Runs it right away if the chain is already
    /// disposed.
    pub fn push<F>(&self, name: &'static str, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.state.lock();
        if state.disposed {
            drop(state);
            log::debug!("dispose chain already released, running {name} now");
            action();
            return;
        }
        state.actions.push((name, Box::new(action)));
    }

    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }

    /// Runs every pending action, last pushed first. Returns `false` if the
    /// chain was already disposed.
    pub fn dispose(&self) -> bool {
        let actions = {
            let mut state = self.state.lock();
            if state.disposed {
                return false;
            }
            state.disposed = true;
            std::mem::take(&mut state.actions)
        };
        for (name, action) in actions.into_iter().rev() {
            log::trace!("releasing {name}");
            action();
        }
        true
    }
}

impl Drop for DisposeChain {
    fn drop(&mut self) {
        self.dispose();
    }
}
