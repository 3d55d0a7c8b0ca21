//! Host-side value model for the sandbox boundary.
//!
//! [`HostValue`] is the dynamic value type that crosses between the
//! host and the VM. Scalars, strings, lists and maps are copied;
//! anything opaque implements [`HostObject`] and crosses as a capsule
//! that the VM can index and call but never owns.

use std::fmt;
use std::sync::Arc;

/// Error raised by a host object while serving the VM (attribute
/// lookup or call). Crosses into the VM as a script-visible error
/// whose text contains this message.
#[derive(Debug, Clone)]
pub struct HostError {
    message: String,
}

impl HostError {
    pub fn new(message: impl Into<String>) -> Self {
        HostError {
            message: message.into(),
        }
    }

    #[inline]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for HostError {}

/// Per-capsule behaviour flags, chosen by the wrapped object via
/// [`HostObject::flags`].
#[derive(Debug, Clone, Copy)]
pub struct CapsuleFlags {
    /// Cache attribute lookups in a per-capsule VM-side table.
    pub cache: bool,
    /// Whether attribute results may themselves be capsule-wrapped.
    /// When off, an attribute that is an opaque object is a
    /// serialization error instead.
    pub recursive: bool,
    /// When called from Lua, receive the raw VM arguments through
    /// [`HostObject::call_raw`] instead of marshalled [`HostValue`]s.
    pub raw_args: bool,
}

impl Default for CapsuleFlags {
    fn default() -> Self {
        CapsuleFlags {
            cache: true,
            recursive: true,
            raw_args: false,
        }
    }
}

/// An opaque host object exposed to scripts through a capsule.
///
/// Implementations decide what the VM may see: attribute lookup,
/// callability, and the capsule flags. All hooks have conservative
/// defaults, so a unit impl yields an inert opaque value.
pub trait HostObject: 'static {
    /// Name shown in capsule `tostring` and error messages.
    fn type_name(&self) -> &str {
        "object"
    }

    /// Attribute lookup. `Ok(None)` means the attribute is absent
    /// (the script sees nil, and absence is cacheable).
    fn attr(&self, key: &HostValue) -> Result<Option<HostValue>, HostError> {
        let _ = key;
        Ok(None)
    }

    /// Invoke the object with marshalled arguments, returning one
    /// value.
    fn call(&self, args: Vec<HostValue>) -> Result<HostValue, HostError> {
        let _ = args;
        Err(HostError::new(format!(
            "{} is not callable",
            self.type_name()
        )))
    }

    /// Invoke the object with the raw VM arguments. Only consulted
    /// when [`CapsuleFlags::raw_args`] is set; the returned value is
    /// handed to the VM as-is.
    fn call_raw(
        &self,
        lua: &mlua::Lua,
        args: mlua::MultiValue,
    ) -> Result<mlua::Value, HostError> {
        let _ = (lua, args);
        Err(HostError::new(format!(
            "{} does not accept raw arguments",
            self.type_name()
        )))
    }

    fn is_callable(&self) -> bool {
        false
    }

    /// Capsule behaviour for this object. Callable wrappers built via
    /// [`HostValue::function`] disable the attribute cache.
    fn flags(&self) -> CapsuleFlags {
        CapsuleFlags::default()
    }
}

/// Adapter exposing a plain closure as a callable [`HostObject`].
struct FnObject<F> {
    f: F,
}

impl<F> HostObject for FnObject<F>
where
    F: Fn(Vec<HostValue>) -> Result<HostValue, HostError> + 'static,
{
    fn type_name(&self) -> &str {
        "function"
    }

    fn call(&self, args: Vec<HostValue>) -> Result<HostValue, HostError> {
        (self.f)(args)
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
}

/// A dynamically typed host value.
#[derive(Clone)]
pub enum HostValue {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// UTF-8 text. Encodes to a VM string.
    Str(String),
    /// Arbitrary bytes. Encodes to a VM string byte-exactly; VM
    /// strings that are not valid UTF-8 decode back to this.
    Bytes(Vec<u8>),
    /// Encodes to a table indexed from 1.
    List(Vec<HostValue>),
    /// Association list; keys may be any encodable value. VM tables
    /// decode to this (pair order follows table iteration order).
    Map(Vec<(HostValue, HostValue)>),
    /// Opaque host object; crosses as a capsule.
    Object(Arc<dyn HostObject>),
}

impl HostValue {
    /// Wrap a closure as a callable value for scripts.
    pub fn function<F>(f: F) -> HostValue
    where
        F: Fn(Vec<HostValue>) -> Result<HostValue, HostError> + 'static,
    {
        HostValue::Object(Arc::new(FnObject { f }))
    }

    /// Wrap a host object.
    pub fn object(obj: impl HostObject) -> HostValue {
        HostValue::Object(Arc::new(obj))
    }

    #[inline]
    pub fn is_nil(&self) -> bool {
        matches!(self, HostValue::Nil)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            HostValue::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            HostValue::Float(n) => Some(*n),
            HostValue::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            HostValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HostValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Name of the value's type, for error messages.
    pub fn type_name(&self) -> &str {
        match self {
            HostValue::Nil => "nil",
            HostValue::Bool(_) => "boolean",
            HostValue::Int(_) => "integer",
            HostValue::Float(_) => "float",
            HostValue::Str(_) => "string",
            HostValue::Bytes(_) => "bytes",
            HostValue::List(_) => "list",
            HostValue::Map(_) => "map",
            HostValue::Object(obj) => obj.type_name(),
        }
    }
}

impl fmt::Debug for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostValue::Nil => write!(f, "Nil"),
            HostValue::Bool(b) => write!(f, "Bool({})", b),
            HostValue::Int(n) => write!(f, "Int({})", n),
            HostValue::Float(n) => write!(f, "Float({})", n),
            HostValue::Str(s) => write!(f, "Str({:?})", s),
            HostValue::Bytes(b) => write!(f, "Bytes({:?})", b),
            HostValue::List(items) => f.debug_tuple("List").field(items).finish(),
            HostValue::Map(pairs) => f.debug_tuple("Map").field(pairs).finish(),
            HostValue::Object(obj) => write!(f, "Object({})", obj.type_name()),
        }
    }
}

// Structural equality for data; objects compare by identity.
impl PartialEq for HostValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (HostValue::Nil, HostValue::Nil) => true,
            (HostValue::Bool(a), HostValue::Bool(b)) => a == b,
            (HostValue::Int(a), HostValue::Int(b)) => a == b,
            (HostValue::Float(a), HostValue::Float(b)) => a == b,
            (HostValue::Str(a), HostValue::Str(b)) => a == b,
            (HostValue::Bytes(a), HostValue::Bytes(b)) => a == b,
            (HostValue::List(a), HostValue::List(b)) => a == b,
            (HostValue::Map(a), HostValue::Map(b)) => a == b,
            (HostValue::Object(a), HostValue::Object(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<bool> for HostValue {
    fn from(v: bool) -> Self {
        HostValue::Bool(v)
    }
}

impl From<i64> for HostValue {
    fn from(v: i64) -> Self {
        HostValue::Int(v)
    }
}

impl From<i32> for HostValue {
    fn from(v: i32) -> Self {
        HostValue::Int(v as i64)
    }
}

impl From<f64> for HostValue {
    fn from(v: f64) -> Self {
        HostValue::Float(v)
    }
}

impl From<&str> for HostValue {
    fn from(v: &str) -> Self {
        HostValue::Str(v.to_owned())
    }
}

impl From<String> for HostValue {
    fn from(v: String) -> Self {
        HostValue::Str(v)
    }
}

impl From<Vec<u8>> for HostValue {
    fn from(v: Vec<u8>) -> Self {
        HostValue::Bytes(v)
    }
}

impl From<Vec<HostValue>> for HostValue {
    fn from(v: Vec<HostValue>) -> Self {
        HostValue::List(v)
    }
}

impl<T: Into<HostValue>> From<Option<T>> for HostValue {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(inner) => inner.into(),
            None => HostValue::Nil,
        }
    }
}
