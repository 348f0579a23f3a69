//! Optimistic like/dislike toggling.
//!
//! A tap mutates the cached message immediately; the REST call confirms or
//! rolls back afterward. At most one reaction per user per message: tapping
//! the active kind clears it, tapping the other kind swaps. Rollback
//! restores the last server-confirmed state, not merely the previous tap, so
//! repeated taps during one in-flight request cannot corrupt the tallies.

use std::collections::HashMap;

use tracing::debug;

use crate::store::MessageStore;
use shared::domain::{MessageId, ReactionKind};
use shared::protocol::ReactionSummary;

/// Apply one toggle to a reaction state, returning the new tallies and the
/// caller's new active reaction.
pub fn toggled(
    reactions: ReactionSummary,
    mine: Option<ReactionKind>,
    tapped: ReactionKind,
) -> (ReactionSummary, Option<ReactionKind>) {
    let mut next = reactions;
    let bump = |summary: &mut ReactionSummary, kind: ReactionKind, delta: i32| {
        let tally = match kind {
            ReactionKind::Like => &mut summary.like,
            ReactionKind::Dislike => &mut summary.dislike,
        };
        tally.count = if delta < 0 {
            tally.count.saturating_sub(1)
        } else {
            tally.count + 1
        };
    };
    match mine {
        Some(active) if active == tapped => {
            bump(&mut next, tapped, -1);
            (next, None)
        }
        Some(active) => {
            bump(&mut next, active, -1);
            bump(&mut next, tapped, 1);
            (next, Some(tapped))
        }
        None => {
            bump(&mut next, tapped, 1);
            (next, Some(tapped))
        }
    }
}

#[derive(Clone, Copy)]
struct Baseline {
    reactions: ReactionSummary,
    mine: Option<ReactionKind>,
}

#[derive(Default)]
pub struct ReactionController {
    baselines: HashMap<MessageId, Baseline>,
}

impl ReactionController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle `tapped` on the cached message, recording the pre-toggle state
    /// as the rollback baseline the first time the message is touched.
    /// Returns false when the message is not cached.
    pub fn apply_toggle(
        &mut self,
        store: &mut MessageStore,
        message_id: MessageId,
        tapped: ReactionKind,
    ) -> bool {
        let Some(current) = store.get(message_id) else {
            return false;
        };
        self.baselines.entry(message_id).or_insert(Baseline {
            reactions: current.reactions,
            mine: current.my_reaction,
        });
        store.update_message(message_id, |message| {
            let (reactions, mine) = toggled(message.reactions, message.my_reaction, tapped);
            message.reactions = reactions;
            message.my_reaction = mine;
        })
    }

    /// The server accepted the reaction: the optimistic state is now
    /// authoritative.
    pub fn confirm(&mut self, message_id: MessageId) {
        self.baselines.remove(&message_id);
    }

    /// The request failed: restore the last server-confirmed state.
    pub fn rollback(&mut self, store: &mut MessageStore, message_id: MessageId) {
        if let Some(baseline) = self.baselines.remove(&message_id) {
            debug!(message_id = message_id.0, "reaction rolled back");
            store.update_message(message_id, |message| {
                message.reactions = baseline.reactions;
                message.my_reaction = baseline.mine;
            });
        }
    }

    /// A server refresh of this message arrived; whatever it carries wins.
    pub fn forget(&mut self, message_id: MessageId) {
        self.baselines.remove(&message_id);
    }

    pub fn clear(&mut self) {
        self.baselines.clear();
    }
}
