//! Jump-to-mention resolution.
//!
//! Tapping a mention notification targets a message that may sit many pages
//! deep in history. The resolver walks older pages through the paginator
//! until the target materializes in the store or the cursor chain ends, so
//! the walk is bounded by the room's history depth.

use tracing::debug;

use crate::error::ClientError;
use crate::pagination::Paginator;
use crate::store::MessageStore;
use shared::domain::MessageId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MentionState {
    Idle,
    /// Older pages are being fetched looking for this message.
    Searching(MessageId),
    /// The target is cached; the view should scroll to and highlight it.
    Anchored(MessageId),
    /// Every older page was consulted and the target was absent
    /// (deleted, or the deep link was bad).
    Exhausted(MessageId),
}

#[derive(Default)]
pub struct MentionResolver {
    state: MentionState,
}

impl Default for MentionState {
    fn default() -> Self {
        Self::Idle
    }
}

impl MentionResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MentionState {
        self.state
    }

    /// The message the view should currently be anchored to, if any.
    pub fn anchor(&self) -> Option<MessageId> {
        match self.state {
            MentionState::Anchored(id) => Some(id),
            _ => None,
        }
    }

    /// Forget any target, e.g. when the user navigates to another room or
    /// scrolls away from a highlighted mention.
    pub fn clear(&mut self) {
        self.state = MentionState::Idle;
    }

    /// Drive older-page fetches until `target` is cached or history runs
    /// out. Progress is preserved: every fetched page stays in the store, so
    /// the user lands deep in history with all intervening messages loaded.
    pub async fn resolve(
        &mut self,
        target: MessageId,
        paginator: &mut Paginator,
        store: &mut MessageStore,
    ) -> Result<MessageId, ClientError> {
        self.state = MentionState::Searching(target);

        while !store.contains(target) {
            if !store.has_older() {
                self.state = MentionState::Exhausted(target);
                return Err(ClientError::MessageNotFound { message_id: target });
            }
            let cursor_before = store.next_cursor().map(str::to_string);
            let inserted = paginator.fetch_older(store).await.map_err(|err| {
                self.state = MentionState::Idle;
                err
            })?;
            // A page that overlaps entirely with cached history inserts
            // nothing but can still advance the cursor; that is progress.
            // A page that moves neither count nor cursor never will, so the
            // walk stops instead of spinning.
            if inserted == 0
                && !store.contains(target)
                && store.next_cursor() == cursor_before.as_deref()
            {
                self.state = MentionState::Exhausted(target);
                return Err(ClientError::MessageNotFound { message_id: target });
            }
        }

        debug!(message_id = target.0, "mention target anchored");
        self.state = MentionState::Anchored(target);
        Ok(target)
    }
}
