//! Memory governor: applies the configured ceiling to the VM and
//! opens pause windows around host-side work.
//!
//! The ceiling itself is enforced by the VM's limit-aware allocator
//! (which refuses growth only, never shrinks); this module owns the
//! policy of when the ceiling is in force. Whenever host code runs on
//! behalf of the VM the ceiling is lifted, because an allocation
//! failure there would unwind through frames that still hold host
//! resources.

use std::cell::Cell;

use mlua::Lua;

pub(crate) struct MemoryGovernor {
    limit: usize,
    /// Depth of nested pause windows; the ceiling is re-applied only
    /// when the outermost window closes.
    paused: Cell<usize>,
}

impl MemoryGovernor {
    pub(crate) fn new(limit: usize) -> Self {
        MemoryGovernor {
            limit,
            paused: Cell::new(0),
        }
    }

    #[inline]
    pub(crate) fn limit(&self) -> usize {
        self.limit
    }

    fn apply(&self, lua: &Lua, limit: usize) {
        if let Err(err) = lua.set_memory_limit(limit) {
            log::warn!("memory limit not applied: {}", err);
        }
    }

    /// Put the configured ceiling in force (no-op inside a pause
    /// window; the window re-applies it on close).
    pub(crate) fn engage(&self, lua: &Lua) {
        if self.paused.get() == 0 {
            self.apply(lua, self.limit);
        }
    }

    /// Lift the ceiling until the returned guard drops. Nesting-safe,
    /// and restores the prior state on both normal and error paths.
    pub(crate) fn pause<'a>(&'a self, lua: &'a Lua) -> MemoryPause<'a> {
        let depth = self.paused.get();
        self.paused.set(depth + 1);
        if depth == 0 {
            self.apply(lua, 0);
        }
        MemoryPause { governor: self, lua }
    }
}

pub(crate) struct MemoryPause<'a> {
    governor: &'a MemoryGovernor,
    lua: &'a Lua,
}

impl Drop for MemoryPause<'_> {
    fn drop(&mut self) {
        let depth = self.governor.paused.get();
        self.governor.paused.set(depth.saturating_sub(1));
        if depth == 1 {
            self.governor.apply(self.lua, self.governor.limit);
        }
    }
}
