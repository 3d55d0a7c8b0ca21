// Test suite for the sandbox core
mod test_capsule;

use crate::{HostValue, Sandbox, SandboxOptions};

pub(crate) fn sandbox() -> Sandbox {
    Sandbox::new(SandboxOptions::default()).unwrap()
}

pub(crate) fn no_env() -> Vec<(&'static str, HostValue)> {
    Vec::new()
}
