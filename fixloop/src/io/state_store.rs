//! Persists the cycle state as a single comment on an issue or pull request.
//!
//! The comment is found by the state marker and edited in place. Writes are
//! last-writer-wins; there is no locking across invocations.

use anyhow::{Context, Result};
use tracing::{debug, instrument, warn};

use crate::core::report;
use crate::core::state_codec::{self, STATE_MARKER};
use crate::core::types::IterationState;
use crate::io::hosting::HostingApi;

/// The issue or pull request carrying a state comment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateHome {
    pub repo: String,
    pub number: u64,
}

impl StateHome {
    pub fn new(repo: impl Into<String>, number: u64) -> Self {
        Self {
            repo: repo.into(),
            number,
        }
    }
}

/// Recover state from `home`. `None` when no comment carries a readable blob.
#[instrument(skip_all, fields(repo = %home.repo, number = home.number))]
pub fn load_state(
    hosting: &dyn HostingApi,
    home: &StateHome,
    default_max_iterations: u32,
) -> Result<Option<IterationState>> {
    let comment = hosting
        .find_comment_containing(&home.repo, home.number, STATE_MARKER)
        .with_context(|| format!("look up state comment on {}#{}", home.repo, home.number))?;
    let Some(comment) = comment else {
        debug!("no state comment");
        return Ok(None);
    };
    let state = state_codec::decode(&comment.body, default_max_iterations);
    if state.is_none() {
        warn!(comment_id = comment.id, "state comment unreadable, treating as absent");
    }
    Ok(state)
}

/// Create or overwrite the state comment on `home`.
#[instrument(skip_all, fields(repo = %home.repo, number = home.number, iteration = state.iteration))]
pub fn persist_state(hosting: &dyn HostingApi, home: &StateHome, state: &IterationState) -> Result<()> {
    hosting
        .upsert_comment(
            &home.repo,
            home.number,
            STATE_MARKER,
            &report::state_comment(state),
        )
        .with_context(|| format!("persist state on {}#{}", home.repo, home.number))?;
    debug!(verdict = %state.last_verdict, "state persisted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Verdict;
    use crate::test_support::FakeHosting;

    fn home() -> StateHome {
        StateHome::new("acme/widgets", 9)
    }

    #[test]
    fn missing_comment_means_no_state() {
        let hosting = FakeHosting::new();
        hosting.add_comment("acme/widgets", 9, "LGTM");
        assert_eq!(load_state(&hosting, &home(), 5).expect("load"), None);
    }

    /// Verifies repeated persists edit one comment instead of adding new ones.
    #[test]
    fn persist_overwrites_single_comment() {
        let hosting = FakeHosting::new();
        hosting.add_comment("acme/widgets", 9, "unrelated");
        let first = IterationState::new("acme/widgets", "https://github.com/acme/agent/issues/3", 5, "t0")
            .advance(Verdict::InProgress);
        persist_state(&hosting, &home(), &first).expect("persist");
        let second = first.with_verdict(Verdict::PendingReview);
        persist_state(&hosting, &home(), &second).expect("persist");

        let comments = hosting.comments_on("acme/widgets", 9);
        assert_eq!(comments.len(), 2);
        assert_eq!(comments[0], "unrelated");
        assert_eq!(load_state(&hosting, &home(), 5).expect("load"), Some(second));
    }

    /// Verifies a human comment that merely names the marker is left alone.
    #[test]
    fn bare_marker_mention_is_not_the_state_comment() {
        let hosting = FakeHosting::new();
        hosting.add_comment("acme/widgets", 9, "Why does the bot write FIXLOOP_STATE here?");
        assert_eq!(load_state(&hosting, &home(), 5).expect("load"), None);

        let state = IterationState::new("acme/widgets", "u", 5, "t0").advance(Verdict::InProgress);
        persist_state(&hosting, &home(), &state).expect("persist");
        let comments = hosting.comments_on("acme/widgets", 9);
        assert_eq!(comments.len(), 2);
        assert_eq!(comments[0], "Why does the bot write FIXLOOP_STATE here?");
        assert_eq!(load_state(&hosting, &home(), 5).expect("load"), Some(state));
    }

    #[test]
    fn unreadable_blob_is_treated_as_absent() {
        let hosting = FakeHosting::new();
        hosting.add_comment("acme/widgets", 9, "<!-- FIXLOOP_STATE: {broken -->");
        assert_eq!(load_state(&hosting, &home(), 5).expect("load"), None);
    }
}
