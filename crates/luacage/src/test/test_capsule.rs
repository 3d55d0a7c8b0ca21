// Tests for capsules: host objects and callables inside the VM
use std::cell::Cell;
use std::sync::Arc;

use super::{no_env, sandbox};
use crate::{CapsuleFlags, HostError, HostObject, HostValue, SandboxError};

/// Counts attribute lookups so cache behaviour is observable.
struct Counted {
    hits: Cell<u32>,
}

impl HostObject for Counted {
    fn type_name(&self) -> &str {
        "counted"
    }

    fn attr(&self, key: &HostValue) -> Result<Option<HostValue>, HostError> {
        self.hits.set(self.hits.get() + 1);
        match key.as_str() {
            Some("x") => Ok(Some(HostValue::Int(7))),
            _ => Ok(None),
        }
    }
}

struct Inert;

impl HostObject for Inert {
    fn type_name(&self) -> &str {
        "inert"
    }
}

#[test]
fn test_host_callable() {
    let vm = sandbox();
    let f = HostValue::function(|args| {
        let n = args.first().and_then(|v| v.as_int()).unwrap_or(0);
        Ok(HostValue::Int(n + 1))
    });
    let results = vm.execute("return f(41)", [("f", f)]).unwrap();
    assert_eq!(results, vec![HostValue::Int(42)]);
}

#[test]
fn test_host_error_reaches_the_script() {
    let vm = sandbox();
    let boom = HostValue::function(|_| Err(HostError::new("nope")));
    let err = vm.execute("return boom()", [("boom", boom)]).unwrap_err();
    match err {
        SandboxError::Script(msg) => assert!(msg.contains("nope"), "{}", msg),
        other => panic!("expected script error, got {:?}", other),
    }
}

#[test]
fn test_host_error_is_catchable_with_pcall() {
    let vm = sandbox();
    let boom = HostValue::function(|_| Err(HostError::new("nope")));
    let results = vm
        .execute(
            "local ok, err = pcall(boom) return ok, tostring(err)",
            [("boom", boom)],
        )
        .unwrap();
    assert_eq!(results[0], HostValue::Bool(false));
    match &results[1] {
        HostValue::Str(msg) => assert!(msg.contains("nope"), "{}", msg),
        other => panic!("expected string, got {:?}", other),
    }
}

#[test]
fn test_attribute_access_is_cached() {
    let vm = sandbox();
    let obj = Arc::new(Counted { hits: Cell::new(0) });
    let handle: Arc<dyn HostObject> = obj.clone();
    let results = vm
        .execute("return o.x, o.x, o.x", [("o", HostValue::Object(handle))])
        .unwrap();
    assert_eq!(
        results,
        vec![HostValue::Int(7), HostValue::Int(7), HostValue::Int(7)]
    );
    assert_eq!(obj.hits.get(), 1, "second and third lookups must hit the cache");
}

#[test]
fn test_absent_attribute_is_cached_as_nil() {
    let vm = sandbox();
    let obj = Arc::new(Counted { hits: Cell::new(0) });
    let handle: Arc<dyn HostObject> = obj.clone();
    let results = vm
        .execute(
            "return o.missing, o.missing",
            [("o", HostValue::Object(handle))],
        )
        .unwrap();
    assert_eq!(results, vec![HostValue::Nil, HostValue::Nil]);
    assert_eq!(obj.hits.get(), 1, "cached nil must be distinguishable from a miss");
}

struct Leaf;

impl HostObject for Leaf {
    fn type_name(&self) -> &str {
        "leaf"
    }

    fn attr(&self, key: &HostValue) -> Result<Option<HostValue>, HostError> {
        match key.as_str() {
            Some("value") => Ok(Some(HostValue::Int(5))),
            _ => Ok(None),
        }
    }
}

struct Tree {
    recursive: bool,
}

impl HostObject for Tree {
    fn type_name(&self) -> &str {
        "tree"
    }

    fn attr(&self, key: &HostValue) -> Result<Option<HostValue>, HostError> {
        match key.as_str() {
            Some("child") => Ok(Some(HostValue::object(Leaf))),
            _ => Ok(None),
        }
    }

    fn flags(&self) -> CapsuleFlags {
        CapsuleFlags {
            recursive: self.recursive,
            ..CapsuleFlags::default()
        }
    }
}

#[test]
fn test_recursive_attribute_wraps_nested_objects() {
    let vm = sandbox();
    let results = vm
        .execute(
            "return o.child.value",
            [("o", HostValue::object(Tree { recursive: true }))],
        )
        .unwrap();
    assert_eq!(results, vec![HostValue::Int(5)]);
}

#[test]
fn test_non_recursive_attribute_rejects_nested_objects() {
    let vm = sandbox();
    let err = vm
        .execute(
            "return o.child",
            [("o", HostValue::object(Tree { recursive: false }))],
        )
        .unwrap_err();
    assert!(matches!(err, SandboxError::Serialization(_)), "{:?}", err);
}

#[test]
fn test_calling_a_non_callable_object_fails() {
    let vm = sandbox();
    let err = vm
        .execute("return o()", [("o", HostValue::object(Inert))])
        .unwrap_err();
    match err {
        SandboxError::Script(msg) => assert!(msg.contains("not callable"), "{}", msg),
        other => panic!("expected script error, got {:?}", other),
    }
}

#[test]
fn test_capsule_tostring_names_the_type() {
    let vm = sandbox();
    let results = vm
        .execute("return tostring(o)", [("o", HostValue::object(Inert))])
        .unwrap();
    match &results[0] {
        HostValue::Str(s) => assert!(s.contains("capsule<inert>"), "{}", s),
        other => panic!("expected string, got {:?}", other),
    }
}

#[test]
fn test_retention_tracks_live_capsules() {
    let vm = sandbox();
    let obj: Arc<dyn HostObject> = Arc::new(Inert);

    vm.execute(
        "keep1, keep2 = a, b",
        [
            ("a", HostValue::Object(obj.clone())),
            ("b", HostValue::Object(obj.clone())),
        ],
    )
    .unwrap();
    assert_eq!(vm.retained_objects(), 2);

    // release the globals and collect; the pins must go with them
    vm.execute("keep1, keep2, a, b = nil, nil, nil, nil", no_env())
        .unwrap();
    vm.collect_garbage().unwrap();
    assert_eq!(vm.retained_objects(), 0);
}

#[test]
fn test_close_releases_all_pins() {
    let vm = sandbox();
    let obj: Arc<dyn HostObject> = Arc::new(Inert);
    let weak = Arc::downgrade(&obj);

    vm.execute("keep = o", [("o", HostValue::Object(obj))]).unwrap();
    assert_eq!(vm.retained_objects(), 1);
    assert!(weak.upgrade().is_some());

    vm.close();
    assert_eq!(vm.retained_objects(), 0);
    assert!(weak.upgrade().is_none(), "close must unpin host objects");
}

#[test]
fn test_decoded_function_is_callable_from_host() {
    let vm = sandbox();
    let results = vm
        .execute("return function(x) return x * 2 end", no_env())
        .unwrap();
    let func = match &results[0] {
        HostValue::Object(obj) => obj.clone(),
        other => panic!("expected object, got {:?}", other),
    };
    assert!(func.is_callable());

    let doubled = func.call(vec![HostValue::Int(21)]).unwrap();
    assert_eq!(doubled, HostValue::Int(42));

    vm.close();
    let err = func.call(vec![HostValue::Int(1)]).unwrap_err();
    assert!(err.message().contains("closed"), "{}", err.message());
}

#[test]
fn test_decoded_function_rejected_while_script_runs() {
    let vm = sandbox();
    let callback = HostValue::function(|args| match args.first() {
        Some(HostValue::Object(obj)) => match obj.call(Vec::new()) {
            Err(err) => Ok(HostValue::Str(err.message().to_string())),
            Ok(_) => Ok(HostValue::Str("unexpected success".to_string())),
        },
        _ => Err(HostError::new("expected a function argument")),
    });

    let results = vm
        .execute("return f(function() return 1 end)", [("f", callback)])
        .unwrap();
    match &results[0] {
        HostValue::Str(msg) => assert!(msg.contains("in progress"), "{}", msg),
        other => panic!("expected string, got {:?}", other),
    }
}

struct RawCounter;

impl HostObject for RawCounter {
    fn type_name(&self) -> &str {
        "raw counter"
    }

    fn is_callable(&self) -> bool {
        true
    }

    fn flags(&self) -> CapsuleFlags {
        CapsuleFlags {
            cache: false,
            recursive: false,
            raw_args: true,
        }
    }

    fn call_raw(
        &self,
        _lua: &mlua::Lua,
        args: mlua::MultiValue,
    ) -> Result<mlua::Value, HostError> {
        Ok(mlua::Value::Integer(args.len() as i64))
    }
}

#[test]
fn test_raw_args_capsule_sees_vm_values() {
    let vm = sandbox();
    let results = vm
        .execute("return r(1, 'a', true)", [("r", HostValue::object(RawCounter))])
        .unwrap();
    assert_eq!(results, vec![HostValue::Int(3)]);
}
