//! Capsules: opaque VM values carrying a handle to a host object.
//!
//! A capsule never owns its object — it holds a weak handle, and the
//! retention table holds one strong reference per live capsule. The
//! finaliser (`Drop`) pops that reference through the capsule's own
//! retention handle, never through the control block, because
//! finalisers may run during VM teardown.

use std::cell::RefCell;
use std::sync::{Arc, Weak};

use mlua::{AnyUserData, Lua, MetaMethod, MultiValue, Table, UserData, UserDataMethods, Value};

use crate::control::ControlBlock;
use crate::host::{CapsuleFlags, HostObject};
use crate::marshal;
use crate::retention::Retention;

pub(crate) struct Capsule {
    pub(crate) val: Weak<dyn HostObject>,
    pub(crate) id: usize,
    pub(crate) type_name: String,
    pub(crate) flags: CapsuleFlags,
    retention: Arc<Retention>,
    /// Lazily created attribute cache. Values are stored in one-slot
    /// wrapper tables so a cached nil is distinguishable from a miss.
    cache: RefCell<Option<Table>>,
}

/// Wrap `val` in a new capsule userdata and pin it in the retention
/// table.
pub(crate) fn store(
    lua: &Lua,
    retention: &Arc<Retention>,
    val: Arc<dyn HostObject>,
    flags: CapsuleFlags,
) -> mlua::Result<AnyUserData> {
    let id = retention.retain(&val);
    let capsule = Capsule {
        type_name: val.type_name().to_string(),
        val: Arc::downgrade(&val),
        id,
        flags,
        retention: retention.clone(),
        cache: RefCell::new(None),
    };
    lua.create_userdata(capsule)
}

impl Capsule {
    /// Re-acquire a strong handle on the wrapped object. A dead
    /// handle means the retention invariant was broken somewhere.
    fn value(&self) -> mlua::Result<Arc<dyn HostObject>> {
        self.val.upgrade().ok_or_else(|| {
            log::warn!("capsule<{}> outlived its retention entry", self.type_name);
            mlua::Error::RuntimeError(format!("capsule<{}> is dangling", self.type_name))
        })
    }
}

impl Drop for Capsule {
    fn drop(&mut self) {
        self.retention.release(self.id, &self.type_name);
    }
}

/// `__index`: attribute access with an optional lazy cache.
fn lazy_index(lua: &Lua, this: &Capsule, key: Value) -> mlua::Result<Value> {
    let ctl = ControlBlock::fetch(lua)?;
    // host work ahead; lift the ceiling for the whole access
    let _pause = ctl.mem.pause(lua);

    if this.flags.cache {
        if let Some(cache) = &*this.cache.borrow() {
            let slot = cache.raw_get::<Value>(key.clone())?;
            if let Value::Table(wrapper) = slot {
                return wrapper.raw_get::<Value>(1);
            }
        }
    }

    let obj = this.value()?;
    let host_key = marshal::decode(lua, &ctl, &key, 0)?;
    let attr = obj.attr(&host_key).map_err(mlua::Error::external)?;
    let result = match attr {
        Some(value) => marshal::encode_with(lua, &ctl, &value, 0, this.flags.recursive)?,
        None => Value::Nil,
    };

    if this.flags.cache {
        let mut slot = this.cache.borrow_mut();
        if slot.is_none() {
            *slot = Some(lua.create_table()?);
        }
        let cache = slot.as_ref().expect("cache table just created");
        let wrapper = lua.create_table()?;
        wrapper.raw_set(1, result.clone())?;
        cache.raw_set(key, wrapper)?;
    }

    Ok(result)
}

/// `__call`: the VM-into-host bridge.
fn call_host(lua: &Lua, this: &Capsule, args: MultiValue) -> mlua::Result<Value> {
    let ctl = ControlBlock::fetch(lua)?;
    let _pause = ctl.mem.pause(lua);

    let obj = this.value()?;

    let result = if this.flags.raw_args {
        obj.call_raw(lua, args).map_err(mlua::Error::external)?
    } else {
        let host_args = marshal::decode_multi(lua, &ctl, args)?;
        let ret = obj.call(host_args).map_err(mlua::Error::external)?;
        marshal::encode(lua, &ctl, &ret, 0)?
    };

    // the host call may have been slow and the hook was silent for
    // its duration
    if let Some(deadline) = *ctl.deadline.borrow() {
        deadline.check()?;
    }

    Ok(result)
}

impl UserData for Capsule {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_meta_method(MetaMethod::Index, lazy_index);
        methods.add_meta_method(MetaMethod::Call, call_host);
        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| {
            Ok(format!("capsule<{}>", this.type_name))
        });
    }
}
