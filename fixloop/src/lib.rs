//! Automated issue-to-pull-request fix loop.
//!
//! A code-fix invocation turns an issue into a patch on a pull request; a
//! review invocation checks that pull request and either approves it or sends
//! it back for another attempt. Cycle state survives between invocations as a
//! hidden blob in a single comment.
//!
//! - **[`core`]**: Pure logic (state codec, output recovery, ranking, review
//!   policy, comment text). No I/O.
//! - **[`io`]**: Adapters for settings, processes, git, the hosting API, the
//!   model, and checkout files. Each external service sits behind a trait.
//!
//! [`code_fix`], [`review`] and [`escalation`] coordinate the two.

pub mod code_fix;
pub mod core;
pub mod escalation;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod review;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
