//! Stable exit codes for fixloop commands.

/// Invocation finished: PR opened or updated, or review posted.
pub const OK: i32 = 0;
/// Hard failure: bad config or input, or an external call failed.
pub const INVALID: i32 = 1;
/// The cycle's iteration cap is reached; nothing more will be attempted.
pub const EXHAUSTED: i32 = 2;
/// A fix attempt was consumed without producing a commit.
pub const NO_EFFECT: i32 = 3;
