// Lua sandbox
// Executes untrusted Lua under hard memory/time limits with a
// bidirectional host bridge: host values flow in, host callables are
// invocable from scripts, results flow back out.

#[cfg(test)]
mod test;

mod capsule;
mod control;
mod marshal;
mod memory;
mod retention;
mod runtime;

pub mod error;
pub mod host;
pub mod limits;
pub mod sandbox;

pub use error::{SandboxError, SandboxResult};
pub use host::{CapsuleFlags, HostError, HostObject, HostValue};
pub use sandbox::{Sandbox, SandboxOptions};

// Re-exported so `HostObject::call_raw` implementations can name the
// VM types.
pub use mlua;
