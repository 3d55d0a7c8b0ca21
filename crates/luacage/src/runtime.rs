//! Runtime limiter: a wall-clock deadline enforced by a
//! per-instruction-count VM hook.

use std::time::{Duration, Instant};

use mlua::{HookTriggers, Lua, VmState};

/// A script deadline. The expiry instant is precomputed at `new` so
/// the hook performs a plain comparison on every check.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline {
    started: Instant,
    expires: Instant,
    budget: Duration,
}

impl Deadline {
    pub(crate) fn new(budget: Duration) -> Self {
        let started = Instant::now();
        Deadline {
            started,
            expires: started + budget,
            budget,
        }
    }

    /// Raise the quota error once the budget is exhausted. A zero
    /// budget means unlimited.
    pub(crate) fn check(&self) -> mlua::Result<()> {
        if self.budget.is_zero() {
            return Ok(());
        }
        let now = Instant::now();
        if now > self.expires {
            let elapsed = now.duration_since(self.started);
            return Err(mlua::Error::RuntimeError(format!(
                "runtime quota exceeded {:.3}>{:.3}",
                elapsed.as_secs_f64(),
                self.budget.as_secs_f64()
            )));
        }
        Ok(())
    }
}

/// Install the instruction-count hook enforcing `deadline`.
///
/// The hook does not fire while a host upcall is running; the capsule
/// call bridge re-checks the deadline on return instead.
pub(crate) fn engage(lua: &Lua, deadline: Deadline, interval: u32) {
    if deadline.budget.is_zero() {
        return;
    }
    let triggers = HookTriggers {
        every_nth_instruction: Some(interval.max(1)),
        ..Default::default()
    };
    let _ = lua.set_hook(triggers, move |_lua, _debug| {
        deadline.check()?;
        Ok(VmState::Continue)
    });
}

/// Remove the instruction hook.
pub(crate) fn disengage(lua: &Lua) {
    lua.remove_hook();
}
