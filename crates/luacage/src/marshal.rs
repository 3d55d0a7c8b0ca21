//! Bounded-recursion marshalling between host values and VM values.
//!
//! Depth is checked on every recursive call against the configured
//! limit; self-referential structures are the caller's problem, the
//! depth bound is what keeps them from recursing forever.

use std::sync::Arc;

use mlua::{Lua, MultiValue, Value};

use crate::capsule::{self, Capsule};
use crate::control::ControlBlock;
use crate::error::SandboxError;
use crate::host::HostValue;
use crate::sandbox::LuaFunctionHandle;

fn too_deep(max_depth: usize) -> mlua::Error {
    SandboxError::Serialization(format!("marshalling recursed too deep (limit {})", max_depth))
        .into()
}

/// Encode a host value into the VM, capsule-wrapping opaque objects.
pub(crate) fn encode(
    lua: &Lua,
    ctl: &ControlBlock,
    value: &HostValue,
    depth: usize,
) -> mlua::Result<Value> {
    encode_with(lua, ctl, value, depth, true)
}

/// Encode with an explicit policy for opaque objects. Non-recursive
/// capsules use `wrap_objects = false` for their attribute results.
pub(crate) fn encode_with(
    lua: &Lua,
    ctl: &ControlBlock,
    value: &HostValue,
    depth: usize,
    wrap_objects: bool,
) -> mlua::Result<Value> {
    if depth > ctl.max_depth {
        return Err(too_deep(ctl.max_depth));
    }

    match value {
        HostValue::Nil => Ok(Value::Nil),
        HostValue::Bool(b) => Ok(Value::Boolean(*b)),
        HostValue::Int(n) => Ok(Value::Integer(*n)),
        HostValue::Float(n) => Ok(Value::Number(*n)),
        HostValue::Str(s) => Ok(Value::String(lua.create_string(s)?)),
        HostValue::Bytes(b) => Ok(Value::String(lua.create_string(b)?)),
        HostValue::List(items) => {
            let table = lua.create_table()?;
            for (i, item) in items.iter().enumerate() {
                let encoded = encode_with(lua, ctl, item, depth + 1, wrap_objects)?;
                table.raw_set(i as i64 + 1, encoded)?;
            }
            Ok(Value::Table(table))
        }
        HostValue::Map(pairs) => {
            let table = lua.create_table()?;
            for (key, val) in pairs {
                let lkey = encode_with(lua, ctl, key, depth + 1, wrap_objects)?;
                if lkey.is_nil() {
                    return Err(
                        SandboxError::Serialization("nil is not usable as a map key".into())
                            .into(),
                    );
                }
                let lval = encode_with(lua, ctl, val, depth + 1, wrap_objects)?;
                table.raw_set(lkey, lval)?;
            }
            Ok(Value::Table(table))
        }
        HostValue::Object(obj) => {
            if !wrap_objects {
                return Err(SandboxError::Serialization(format!(
                    "cannot serialize {} through a non-recursive capsule",
                    obj.type_name()
                ))
                .into());
            }
            let mut flags = obj.flags();
            if obj.is_callable() {
                flags.cache = false;
            }
            let ud = capsule::store(lua, &ctl.retention, obj.clone(), flags)?;
            Ok(Value::UserData(ud))
        }
    }
}

/// Decode a VM value into a host value.
pub(crate) fn decode(
    lua: &Lua,
    ctl: &ControlBlock,
    value: &Value,
    depth: usize,
) -> mlua::Result<HostValue> {
    if depth > ctl.max_depth {
        return Err(too_deep(ctl.max_depth));
    }

    match value {
        Value::Nil => Ok(HostValue::Nil),
        Value::Boolean(b) => Ok(HostValue::Bool(*b)),
        Value::Integer(n) => Ok(HostValue::Int(*n)),
        Value::Number(n) => Ok(HostValue::Float(*n)),
        Value::String(s) => {
            let bytes = s.as_bytes().to_vec();
            Ok(match String::from_utf8(bytes) {
                Ok(text) => HostValue::Str(text),
                Err(raw) => HostValue::Bytes(raw.into_bytes()),
            })
        }
        Value::Table(table) => {
            let mut pairs = Vec::new();
            for entry in table.clone().pairs::<Value, Value>() {
                let (key, val) = entry?;
                pairs.push((
                    decode(lua, ctl, &key, depth + 1)?,
                    decode(lua, ctl, &val, depth + 1)?,
                ));
            }
            Ok(HostValue::Map(pairs))
        }
        Value::UserData(ud) => match ud.borrow::<Capsule>() {
            // a new strong reference, independent of the capsule
            Ok(capsule) => capsule.val.upgrade().map(HostValue::Object).ok_or_else(|| {
                SandboxError::Serialization(format!(
                    "capsule<{}> is dangling",
                    capsule.type_name
                ))
                .into()
            }),
            Err(_) => Err(SandboxError::Serialization(
                "cannot deserialize foreign userdata".into(),
            )
            .into()),
        },
        Value::Function(func) => {
            let executor = ctl.executor.borrow().clone();
            Ok(HostValue::Object(Arc::new(LuaFunctionHandle::new(
                func.clone(),
                executor,
            ))))
        }
        other => Err(SandboxError::Serialization(format!(
            "cannot deserialize Lua type {}",
            other.type_name()
        ))
        .into()),
    }
}

/// Decode an ordered sequence of VM values.
pub(crate) fn decode_multi(
    lua: &Lua,
    ctl: &ControlBlock,
    values: MultiValue,
) -> mlua::Result<Vec<HostValue>> {
    values
        .into_iter()
        .map(|value| decode(lua, ctl, &value, 0))
        .collect()
}
