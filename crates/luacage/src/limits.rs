//! Centralized sandbox limits and configuration constants.
//!
//! All tunables that control resource governance are collected here
//! so defaults live in one place.

use std::time::Duration;

/// Default memory ceiling for a sandbox instance.
///
/// The standard libraries need roughly 100 KiB on their own; the
/// default gives them that plus breathing room for user data.
pub const DEFAULT_MAX_MEMORY: usize = 2 * 1024 * 1024;

/// Default wall-clock budget for a single script run.
pub const DEFAULT_MAX_RUNTIME: Duration = Duration::from_secs(1);

/// How many VM instructions execute between runtime-budget checks.
///
/// Smaller values detect expiry sooner at the cost of more hook
/// invocations.
pub const DEFAULT_HOOK_INTERVAL: u32 = 500_000;

/// Default maximum recursion depth when marshalling values across the
/// host/VM boundary, in either direction.
pub const DEFAULT_MAX_DEPTH: usize = 10;

/// Chunk name attached to compiled sources, so script errors carry a
/// stable source annotation ("sandbox:3: ...").
pub const CHUNK_NAME: &str = "sandbox";
