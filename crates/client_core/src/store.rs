//! Per-room message cache.
//!
//! The store merges two competing inputs — cursor-paginated history fetched
//! over REST and push-delivered socket messages — into one deduplicated,
//! time-ordered sequence. Both arrival orders must converge to the same
//! final state: the merge is idempotent and order-correcting.

use std::collections::HashMap;

use shared::domain::{MessageId, RoomId, UserId};
use shared::protocol::{MessagePage, MessagePayload, RoomSummary};
use uuid::Uuid;

use crate::error::ClientError;

/// Client-side message identity. Optimistically queued messages have no
/// server id yet; they are keyed by the client-generated send key until the
/// echo retires them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKey {
    Server(MessageId),
    Local(Uuid),
}

/// Which end of history a fetched page belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageDirection {
    /// The newest page, fetched with no cursor on room open.
    Initial,
    /// An older page reached through `next_cursor`.
    Older,
    /// A forward page reached through `previous_cursor` (reserved).
    Newer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Inserted,
    /// The push was the echo of a local optimistic message; the local entry
    /// was retired (exactly once) and replaced by the confirmed payload.
    ReplacedLocal,
    /// A message with this server id was already cached; its payload was
    /// refreshed in place (last write wins).
    Refreshed,
}

#[derive(Debug, Clone)]
struct Entry {
    key: MessageKey,
    payload: MessagePayload,
}

pub struct MessageStore {
    room_id: RoomId,
    /// Oldest-to-newest insertion order: history pages prepend, pushes and
    /// local messages append. `snapshot` re-sorts, so this order only has to
    /// be roughly right.
    entries: Vec<Entry>,
    room: Option<RoomSummary>,
    next_cursor: Option<String>,
    previous_cursor: Option<String>,
    initial_loaded: bool,
}

impl MessageStore {
    pub fn new(room_id: RoomId) -> Self {
        Self {
            room_id,
            entries: Vec::new(),
            room: None,
            next_cursor: None,
            previous_cursor: None,
            initial_loaded: false,
        }
    }

    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    /// The room header from the most recent page response. `chat_blocked`
    /// and `can_send` in here are authoritative.
    pub fn room(&self) -> Option<&RoomSummary> {
        self.room.as_ref()
    }

    pub fn has_older(&self) -> bool {
        self.next_cursor.is_some()
    }

    pub fn next_cursor(&self) -> Option<&str> {
        self.next_cursor.as_deref()
    }

    pub fn previous_cursor(&self) -> Option<&str> {
        self.previous_cursor.as_deref()
    }

    pub fn initial_loaded(&self) -> bool {
        self.initial_loaded
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.key == MessageKey::Server(id))
    }

    pub fn pending_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| matches!(entry.key, MessageKey::Local(_)))
            .count()
    }

    /// Merge a fetched history page. Older pages land before everything
    /// currently known; ids already present are never duplicated. A page for
    /// a different room is rejected and the cache is left untouched.
    pub fn apply_history_page(
        &mut self,
        page: MessagePage,
        direction: PageDirection,
    ) -> Result<usize, ClientError> {
        if page.room.room_id != self.room_id {
            return Err(ClientError::StaleRoom {
                expected: self.room_id,
                got: page.room.room_id,
            });
        }

        self.room = Some(page.room);
        match direction {
            PageDirection::Initial => {
                self.next_cursor = page.next_cursor;
                self.previous_cursor = page.previous_cursor;
                self.initial_loaded = true;
            }
            PageDirection::Older => {
                self.next_cursor = page.next_cursor;
            }
            PageDirection::Newer => {
                self.previous_cursor = page.previous_cursor;
            }
        }

        // Wire order is newest-first; flip to oldest-first before insertion.
        let mut fresh: Vec<Entry> = page
            .results
            .into_iter()
            .rev()
            .filter(|message| !self.contains(message.message_id))
            .map(|message| Entry {
                key: MessageKey::Server(message.message_id),
                payload: message,
            })
            .collect();
        let inserted = fresh.len();

        match direction {
            PageDirection::Initial | PageDirection::Older => {
                fresh.append(&mut self.entries);
                self.entries = fresh;
            }
            PageDirection::Newer => {
                self.entries.append(&mut fresh);
            }
        }
        Ok(inserted)
    }

    /// Insert a push-delivered message at the newest position. An echo
    /// carrying a known `client_key` retires the matching local entry.
    pub fn apply_push(&mut self, message: MessagePayload) -> PushOutcome {
        if let Some(key) = message.client_key {
            let local = MessageKey::Local(key);
            if let Some(index) = self.entries.iter().position(|entry| entry.key == local) {
                self.entries.remove(index);
                self.entries.push(Entry {
                    key: MessageKey::Server(message.message_id),
                    payload: message,
                });
                return PushOutcome::ReplacedLocal;
            }
        }

        let key = MessageKey::Server(message.message_id);
        if let Some(existing) = self.entries.iter_mut().find(|entry| entry.key == key) {
            existing.payload = message;
            return PushOutcome::Refreshed;
        }

        self.entries.push(Entry { key, payload: message });
        PushOutcome::Inserted
    }

    /// Queue an optimistic local message pending its socket echo.
    pub fn queue_local(&mut self, client_key: Uuid, payload: MessagePayload) {
        self.entries.push(Entry {
            key: MessageKey::Local(client_key),
            payload,
        });
    }

    /// Drop a local message whose send failed, so the UI does not render a
    /// ghost that will never be confirmed.
    pub fn discard_local(&mut self, client_key: Uuid) -> bool {
        let key = MessageKey::Local(client_key);
        let before = self.entries.len();
        self.entries.retain(|entry| entry.key != key);
        before != self.entries.len()
    }

    /// Record a read receipt: the seer is unioned into each named message.
    pub fn apply_seen(&mut self, message_ids: &[MessageId], seen_by: UserId) {
        for entry in &mut self.entries {
            if let MessageKey::Server(id) = entry.key {
                if message_ids.contains(&id) && !entry.payload.seen_by.contains(&seen_by) {
                    entry.payload.seen_by.push(seen_by);
                }
            }
        }
    }

    /// Mutate one cached message in place (reaction reconciliation).
    pub fn update_message<F>(&mut self, id: MessageId, apply: F) -> bool
    where
        F: FnOnce(&mut MessagePayload),
    {
        let key = MessageKey::Server(id);
        match self.entries.iter_mut().find(|entry| entry.key == key) {
            Some(entry) => {
                apply(&mut entry.payload);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: MessageId) -> Option<&MessagePayload> {
        let key = MessageKey::Server(id);
        self.entries
            .iter()
            .find(|entry| entry.key == key)
            .map(|entry| &entry.payload)
    }

    /// The rendered sequence: collapsed on identity key (last write wins),
    /// then stably sorted ascending by `created_at`.
    pub fn snapshot(&self) -> Vec<MessagePayload> {
        let mut order: Vec<MessageKey> = Vec::with_capacity(self.entries.len());
        let mut latest: HashMap<MessageKey, &MessagePayload> =
            HashMap::with_capacity(self.entries.len());
        for entry in &self.entries {
            if latest.insert(entry.key, &entry.payload).is_none() {
                order.push(entry.key);
            }
        }

        let mut result: Vec<MessagePayload> = order
            .into_iter()
            .filter_map(|key| latest.get(&key).copied().cloned())
            .collect();
        result.sort_by_key(|message| message.created_at);
        result
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
