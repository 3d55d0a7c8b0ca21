//! The sandbox executor: owns one VM instance, seeds globals, runs
//! scripts under the governors, and marshals results back out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError, Weak};
use std::time::Duration;

use mlua::{ChunkMode, Function, Lua, LuaOptions, MultiValue, StdLib};

use crate::control::ControlBlock;
use crate::error::{SandboxError, SandboxResult};
use crate::host::{CapsuleFlags, HostError, HostObject, HostValue};
use crate::limits;
use crate::marshal;
use crate::retention::Retention;
use crate::runtime::{self, Deadline};

/// Resource budgets for a sandbox instance.
#[derive(Debug, Clone)]
pub struct SandboxOptions {
    /// Memory ceiling in bytes. 0 means unbounded.
    pub max_memory: usize,
    /// Wall-clock budget per script run. Zero means unbounded.
    pub max_runtime: Duration,
    /// VM instructions between runtime-budget checks.
    pub hook_interval: u32,
    /// Maximum marshalling recursion depth.
    pub max_depth: usize,
}

impl Default for SandboxOptions {
    fn default() -> Self {
        SandboxOptions {
            max_memory: limits::DEFAULT_MAX_MEMORY,
            max_runtime: limits::DEFAULT_MAX_RUNTIME,
            hook_interval: limits::DEFAULT_HOOK_INTERVAL,
            max_depth: limits::DEFAULT_MAX_DEPTH,
        }
    }
}

pub(crate) struct SandboxInner {
    /// The VM lock. `None` once the instance is closed.
    vm: Mutex<Option<Lua>>,
    retention: Arc<Retention>,
    options: SandboxOptions,
    /// Set after an allocation failure inside the VM; such a VM is
    /// unusable and only `close` remains.
    poisoned: AtomicBool,
}

/// A sandboxed Lua VM with hard memory and runtime limits.
///
/// One instance runs one script at a time; a second `execute` while
/// one is in flight is rejected with [`SandboxError::Busy`].
pub struct Sandbox {
    inner: Arc<SandboxInner>,
}

impl Sandbox {
    /// Create a sandbox with the given budgets. Fails with
    /// `OutOfMemory` if the VM itself cannot be created.
    pub fn new(options: SandboxOptions) -> SandboxResult<Sandbox> {
        let lua =
            Lua::new_with(StdLib::ALL_SAFE, LuaOptions::new()).map_err(SandboxError::from_lua)?;
        let retention = Arc::new(Retention::new());
        ControlBlock::install(&lua, &options, retention.clone());

        let inner = Arc::new(SandboxInner {
            vm: Mutex::new(Some(lua)),
            retention,
            options,
            poisoned: AtomicBool::new(false),
        });

        // publish the executor back-reference for VM functions handed
        // out to the host
        {
            let guard = inner.lock_vm();
            if let Some(lua) = guard.as_ref() {
                if let Ok(ctl) = ControlBlock::fetch(lua) {
                    *ctl.executor.borrow_mut() = Arc::downgrade(&inner);
                }
            }
        }

        Ok(Sandbox { inner })
    }

    /// Execute `source` with the given globals seeded first, and
    /// return every value the script returned.
    pub fn execute<S, I>(
        &self,
        source: impl AsRef<[u8]>,
        globals: I,
    ) -> SandboxResult<Vec<HostValue>>
    where
        S: AsRef<str>,
        I: IntoIterator<Item = (S, HostValue)>,
    {
        self.inner.execute(source.as_ref(), globals)
    }

    /// Tear the instance down. Idempotent; every other operation on a
    /// closed instance fails with [`SandboxError::Closed`].
    pub fn close(&self) {
        let mut guard = self.inner.lock_vm();
        // dropping the VM runs pending finalisers; capsules release
        // their retention pins through their own handles
        *guard = None;
    }

    /// Bytes currently allocated inside the VM.
    pub fn used_memory(&self) -> SandboxResult<usize> {
        let guard = self.inner.try_lock_vm()?;
        let lua = guard.as_ref().ok_or(SandboxError::Closed)?;
        Ok(lua.used_memory())
    }

    /// Number of live capsules across all host objects. Leak probe:
    /// zero once every capsule has been collected.
    pub fn retained_objects(&self) -> usize {
        self.inner.retention.total()
    }

    /// Run a full garbage-collection cycle, including finalisers.
    pub fn collect_garbage(&self) -> SandboxResult<()> {
        let guard = self.inner.try_lock_vm()?;
        let lua = guard.as_ref().ok_or(SandboxError::Closed)?;
        // twice: collection then finalisation debt
        lua.gc_collect().map_err(SandboxError::from_lua)?;
        lua.gc_collect().map_err(SandboxError::from_lua)
    }

    /// Whether the VM has hit an allocation failure and is unusable.
    pub fn is_poisoned(&self) -> bool {
        self.inner.poisoned.load(Ordering::Acquire)
    }

    pub fn options(&self) -> &SandboxOptions {
        &self.inner.options
    }
}

impl SandboxInner {
    fn lock_vm(&self) -> MutexGuard<'_, Option<Lua>> {
        self.vm.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn try_lock_vm(&self) -> SandboxResult<MutexGuard<'_, Option<Lua>>> {
        match self.vm.try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::WouldBlock) => Err(SandboxError::Busy),
            Err(TryLockError::Poisoned(poisoned)) => Ok(poisoned.into_inner()),
        }
    }

    fn check_poisoned(&self) -> SandboxResult<()> {
        if self.poisoned.load(Ordering::Acquire) {
            return Err(SandboxError::OutOfMemory(
                "virtual machine poisoned by an earlier allocation failure".to_string(),
            ));
        }
        Ok(())
    }

    fn poison_on_oom(&self, err: &SandboxError) {
        if err.is_out_of_memory() {
            self.poisoned.store(true, Ordering::Release);
        }
    }

    fn execute<S, I>(&self, source: &[u8], globals: I) -> SandboxResult<Vec<HostValue>>
    where
        S: AsRef<str>,
        I: IntoIterator<Item = (S, HostValue)>,
    {
        let guard = self.try_lock_vm()?;
        let lua = guard.as_ref().ok_or(SandboxError::Closed)?;
        self.check_poisoned()?;
        let ctl =
            ControlBlock::fetch(lua).map_err(|e| SandboxError::Internal(e.to_string()))?;

        // seed globals and compile with the ceiling lifted: neither is
        // user code, and a capsule-encoding failure here must unwind
        // as a plain host error
        {
            let _pause = ctl.mem.pause(lua);
            let table = lua.globals();
            for (name, value) in globals {
                let encoded =
                    marshal::encode(lua, &ctl, &value, 0).map_err(SandboxError::from_lua)?;
                table
                    .raw_set(name.as_ref(), encoded)
                    .map_err(SandboxError::from_lua)?;
            }
        }

        let func = {
            let _pause = ctl.mem.pause(lua);
            // text mode only: untrusted code must not smuggle
            // precompiled chunks
            lua.load(source)
                .set_name(limits::CHUNK_NAME)
                .set_mode(ChunkMode::Text)
                .into_function()
                .map_err(SandboxError::from_lua)?
        };

        let deadline = Deadline::new(self.options.max_runtime);
        *ctl.deadline.borrow_mut() = Some(deadline);
        runtime::engage(lua, deadline, self.options.hook_interval);
        ctl.mem.engage(lua);

        let result = func.call::<MultiValue>(());

        runtime::disengage(lua);
        *ctl.deadline.borrow_mut() = None;

        let values = match result {
            Ok(values) => values,
            Err(err) => {
                let err = SandboxError::from_lua(err);
                self.poison_on_oom(&err);
                return Err(err);
            }
        };

        let _pause = ctl.mem.pause(lua);
        marshal::decode_multi(lua, &ctl, values).map_err(SandboxError::from_lua)
    }

    /// Invoke a VM function from the host side (decoded-function
    /// handles). Runs under the same governors as `execute`.
    fn call_function(&self, func: &Function, args: Vec<HostValue>) -> SandboxResult<HostValue> {
        let guard = self.try_lock_vm()?;
        let lua = guard.as_ref().ok_or(SandboxError::Closed)?;
        self.check_poisoned()?;
        let ctl =
            ControlBlock::fetch(lua).map_err(|e| SandboxError::Internal(e.to_string()))?;

        let encoded = {
            let _pause = ctl.mem.pause(lua);
            let mut encoded = Vec::with_capacity(args.len());
            for arg in &args {
                encoded.push(marshal::encode(lua, &ctl, arg, 0).map_err(SandboxError::from_lua)?);
            }
            encoded
        };

        let deadline = Deadline::new(self.options.max_runtime);
        *ctl.deadline.borrow_mut() = Some(deadline);
        runtime::engage(lua, deadline, self.options.hook_interval);
        ctl.mem.engage(lua);

        let result = func.call::<MultiValue>(MultiValue::from_iter(encoded));

        runtime::disengage(lua);
        *ctl.deadline.borrow_mut() = None;

        match result {
            Ok(values) => {
                let _pause = ctl.mem.pause(lua);
                let mut decoded = marshal::decode_multi(lua, &ctl, values)
                    .map_err(SandboxError::from_lua)?;
                if decoded.is_empty() {
                    Ok(HostValue::Nil)
                } else {
                    Ok(decoded.swap_remove(0))
                }
            }
            Err(err) => {
                let err = SandboxError::from_lua(err);
                self.poison_on_oom(&err);
                Err(err)
            }
        }
    }
}

/// Host-side handle to a VM function produced by decoding. Calling it
/// re-enters the VM under the usual governors; rejected while a
/// script is in flight or after the sandbox is closed.
pub(crate) struct LuaFunctionHandle {
    func: Function,
    executor: Weak<SandboxInner>,
}

impl LuaFunctionHandle {
    pub(crate) fn new(func: Function, executor: Weak<SandboxInner>) -> Self {
        LuaFunctionHandle { func, executor }
    }
}

impl HostObject for LuaFunctionHandle {
    fn type_name(&self) -> &str {
        "lua function"
    }

    fn is_callable(&self) -> bool {
        true
    }

    fn flags(&self) -> CapsuleFlags {
        CapsuleFlags {
            cache: false,
            recursive: false,
            raw_args: false,
        }
    }

    fn call(&self, args: Vec<HostValue>) -> Result<HostValue, HostError> {
        let inner = self
            .executor
            .upgrade()
            .ok_or_else(|| HostError::new("sandbox has been closed"))?;
        inner
            .call_function(&self.func, args)
            .map_err(|err| HostError::new(err.to_string()))
    }
}
