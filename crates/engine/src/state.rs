// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared handle over the persisted project state.
//!
//! Reads take the lock briefly; every mutation is written back to disk
//! before the lock is released, so any crash point sees a consistent
//! file.

use parking_lot::Mutex;
use tccp_storage::{ProjectState, StateStore};
use tracing::warn;

pub struct StateHandle {
    state: Mutex<ProjectState>,
    store: StateStore,
}

impl StateHandle {
    /// Load (or initialize) state from the store.
    pub fn load(store: StateStore) -> Self {
        let state = store.load();
        Self {
            state: Mutex::new(state),
            store,
        }
    }

    /// Read-only access.
    pub fn with<R>(&self, f: impl FnOnce(&ProjectState) -> R) -> R {
        f(&self.state.lock())
    }

    /// Mutate and persist atomically with respect to other callers.
    pub fn update<R>(&self, f: impl FnOnce(&mut ProjectState) -> R) -> R {
        let mut state = self.state.lock();
        let result = f(&mut state);
        if let Err(e) = self.store.save(&state) {
            warn!(error = %e, "failed to persist project state");
        }
        result
    }

    /// Replace the in-memory state with a fresh load from disk.
    pub fn reload(&self) {
        let fresh = self.store.load();
        *self.state.lock() = fresh;
    }

    /// Snapshot of the whole state.
    pub fn snapshot(&self) -> ProjectState {
        self.state.lock().clone()
    }
}

#[cfg(test)]
#[path = "state_tests.rs"]
mod tests;
