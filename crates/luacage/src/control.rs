//! Per-VM control block.
//!
//! One block is installed into each VM as app data at construction,
//! so every callback — metamethods, hooks, marshalling — can locate
//! the governors from the VM handle alone. Capsule finalisation is
//! the one place that must not go through here: it can run during VM
//! teardown, after the block is gone, so capsules carry their own
//! retention handle instead.

use std::cell::RefCell;
use std::sync::{Arc, Weak};

use mlua::{AppDataRef, Lua};

use crate::memory::MemoryGovernor;
use crate::retention::Retention;
use crate::runtime::Deadline;
use crate::sandbox::{SandboxInner, SandboxOptions};

pub(crate) struct ControlBlock {
    pub(crate) mem: MemoryGovernor,
    pub(crate) retention: Arc<Retention>,
    /// Deadline of the execution currently in flight, if any. The
    /// capsule call bridge consults it after host upcalls, during
    /// which the instruction hook is silent.
    pub(crate) deadline: RefCell<Option<Deadline>>,
    pub(crate) max_depth: usize,
    /// Back-reference to the owning executor, for VM functions handed
    /// out to the host. Set right after the executor is allocated.
    pub(crate) executor: RefCell<Weak<SandboxInner>>,
}

impl ControlBlock {
    pub(crate) fn install(lua: &Lua, options: &SandboxOptions, retention: Arc<Retention>) {
        let block = ControlBlock {
            mem: MemoryGovernor::new(options.max_memory),
            retention,
            deadline: RefCell::new(None),
            max_depth: options.max_depth,
            executor: RefCell::new(Weak::new()),
        };
        block.mem.engage(lua);
        lua.set_app_data(block);
    }

    /// Locate the block from the VM handle.
    pub(crate) fn fetch(lua: &Lua) -> mlua::Result<AppDataRef<'_, ControlBlock>> {
        lua.app_data_ref::<ControlBlock>()
            .ok_or_else(|| mlua::Error::RuntimeError("sandbox control block missing".to_string()))
    }
}
