//! Client-side synchronization engine for clinic chat rooms.
//!
//! One room is open at a time. History arrives through cursor-paginated REST
//! pages, live updates through a receive-only socket, and the per-room
//! [`MessageStore`] merges both into a single deduplicated timeline. The
//! [`RoomClient`] is the facade views talk to: it owns the open room's
//! store, paginator, composer, and reaction state, and broadcasts
//! [`ClientEvent`]s as the timeline changes.

use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use shared::domain::{MessageId, ReactionKind, RoomId, RoomKind, UserId};
use shared::protocol::{
    BlockAction, BlockMemberRequest, InboundFrame, MessagePayload, RoomEvent, RoomSummary,
    SenderSummary,
};

pub mod compose;
pub mod config;
pub mod error;
pub mod mention;
pub mod pagination;
pub mod reaction;
pub mod rest;
pub mod store;
pub mod transport;

pub use compose::{AttachmentDraft, ComposeBlock, OutgoingMessage};
pub use config::{ClientConfig, FetchPolicy};
pub use error::ClientError;
pub use mention::MentionState;
pub use pagination::{
    anchored_scroll_top, push_disposition, should_fetch_older, PushDisposition, ScrollMetrics,
};
pub use store::PushOutcome;
pub use transport::RoomChannel;

use compose::ComposeController;
use mention::MentionResolver;
use pagination::Paginator;
use reaction::ReactionController;
use rest::{ChatApi, HttpChatApi, PageFetcher};
use store::MessageStore;

/// Source of the caller's identity and bearer token. The token authorizes
/// both REST calls and socket subscriptions.
pub trait AuthProvider: Send + Sync {
    fn bearer_token(&self) -> Option<String>;
    fn user_id(&self) -> UserId;
}

pub struct StaticAuth {
    token: Option<String>,
    user_id: UserId,
}

impl StaticAuth {
    pub fn new(user_id: UserId, token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            user_id,
        }
    }

    /// No token: REST calls go out unauthenticated and socket subscriptions
    /// fail with [`ClientError::TransportUnavailable`].
    pub fn unauthenticated(user_id: UserId) -> Self {
        Self {
            token: None,
            user_id,
        }
    }
}

impl AuthProvider for StaticAuth {
    fn bearer_token(&self) -> Option<String> {
        self.token.clone()
    }

    fn user_id(&self) -> UserId {
        self.user_id
    }
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    RoomOpened {
        room_id: RoomId,
    },
    /// A push-delivered message landed in the open room's timeline.
    MessageReceived {
        message: MessagePayload,
    },
    /// The open room's timeline changed; re-render from `snapshot`.
    MessagesChanged {
        room_id: RoomId,
    },
    SeenUpdated {
        room_id: RoomId,
        message_ids: Vec<MessageId>,
        seen_by: UserId,
    },
    /// The assistant answered; composing is unblocked.
    AssistantReplied {
        room_id: RoomId,
    },
    RoomListUpdated {
        rooms: Vec<RoomSummary>,
    },
    MentionAnchored {
        message_id: MessageId,
    },
    /// A socket frame this client does not understand, forwarded verbatim.
    Unhandled(serde_json::Value),
    /// The room's socket could not be opened or has dropped; the room keeps
    /// working over REST but no longer receives pushes.
    LiveUpdatesUnavailable {
        room_id: RoomId,
    },
}

/// Everything owned by the currently open room. Replaced wholesale on room
/// switch; anything still in flight for the old room resolves against a
/// store that no longer exists.
struct RoomSession {
    store: MessageStore,
    paginator: Paginator,
    composer: ComposeController,
    reactions: ReactionController,
    mentions: MentionResolver,
    socket_task: Option<JoinHandle<()>>,
    has_socket: bool,
}

impl Drop for RoomSession {
    fn drop(&mut self) {
        if let Some(task) = self.socket_task.take() {
            task.abort();
        }
    }
}

pub struct RoomClient {
    api: Arc<dyn ChatApi>,
    fetcher: Arc<dyn PageFetcher>,
    auth: Arc<dyn AuthProvider>,
    config: ClientConfig,
    inner: Mutex<Option<RoomSession>>,
    list_task: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<ClientEvent>,
}

impl RoomClient {
    pub fn new<A>(config: ClientConfig, api: Arc<A>, auth: Arc<dyn AuthProvider>) -> Arc<Self>
    where
        A: ChatApi + 'static,
    {
        let (events, _) = broadcast::channel(config.event_buffer);
        Arc::new(Self {
            fetcher: api.clone(),
            api,
            auth,
            config,
            inner: Mutex::new(None),
            list_task: Mutex::new(None),
            events,
        })
    }

    /// Production constructor: REST over HTTP against `config.server_url`.
    pub fn with_http(config: ClientConfig, auth: Arc<dyn AuthProvider>) -> Arc<Self> {
        let api = Arc::new(HttpChatApi::new(config.server_url.clone(), auth.clone()));
        Self::new(config, api, auth)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Open a room: tear down the previous session, fetch the newest history
    /// page, and subscribe to the room's socket channel. A failed socket
    /// leaves the room usable over REST; a failed history fetch fails the
    /// open.
    pub async fn open_room(self: &Arc<Self>, room_id: RoomId) -> Result<RoomSummary, ClientError> {
        let mut guard = self.inner.lock().await;
        // Dropping the old session aborts its socket reader, so late frames
        // for the old room can no longer arrive.
        guard.take();

        let mut store = MessageStore::new(room_id);
        let mut paginator = Paginator::new(
            room_id,
            self.fetcher.clone(),
            self.config.fetch_policy,
        );
        paginator.fetch_initial(&mut store).await?;
        let room = store.room().cloned().ok_or(ClientError::NoOpenRoom)?;

        let mut session = RoomSession {
            store,
            paginator,
            composer: ComposeController::new(room.kind),
            reactions: ReactionController::new(),
            mentions: MentionResolver::new(),
            socket_task: None,
            has_socket: false,
        };

        match transport::subscribe(
            &self.config.server_url,
            RoomChannel::Room(room_id),
            self.auth.as_ref(),
            self.config.socket_buffer,
        )
        .await
        {
            Ok(mut subscription) => {
                let client = Arc::clone(self);
                session.socket_task = Some(tokio::spawn(async move {
                    while let Some(frame) = subscription.recv().await {
                        client.handle_frame(frame).await;
                    }
                    debug!(room_id = room_id.0, "room socket ended");
                    client.mark_push_less(room_id).await;
                }));
                session.has_socket = true;
            }
            Err(err) => {
                warn!(room_id = room_id.0, error = %err, "room opened without live updates");
                let _ = self
                    .events
                    .send(ClientEvent::LiveUpdatesUnavailable { room_id });
            }
        }

        *guard = Some(session);
        info!(room_id = room_id.0, "room opened");
        let _ = self.events.send(ClientEvent::RoomOpened { room_id });
        Ok(room)
    }

    pub async fn close_room(&self) {
        let mut guard = self.inner.lock().await;
        if let Some(session) = guard.take() {
            debug!(room_id = session.store.room_id().0, "room closed");
        }
    }

    /// The rendered timeline of the open room, oldest first.
    pub async fn snapshot(&self) -> Result<Vec<MessagePayload>, ClientError> {
        let guard = self.inner.lock().await;
        let session = guard.as_ref().ok_or(ClientError::NoOpenRoom)?;
        Ok(session.store.snapshot())
    }

    pub async fn room(&self) -> Result<RoomSummary, ClientError> {
        let guard = self.inner.lock().await;
        let session = guard.as_ref().ok_or(ClientError::NoOpenRoom)?;
        session.store.room().cloned().ok_or(ClientError::NoOpenRoom)
    }

    pub async fn has_older(&self) -> Result<bool, ClientError> {
        let guard = self.inner.lock().await;
        let session = guard.as_ref().ok_or(ClientError::NoOpenRoom)?;
        Ok(session.store.has_older())
    }

    /// Whether the open room has a live socket feeding it pushes. `false`
    /// means the timeline only advances through the caller's own sends and
    /// explicit fetches.
    pub async fn live_updates_available(&self) -> Result<bool, ClientError> {
        let guard = self.inner.lock().await;
        let session = guard.as_ref().ok_or(ClientError::NoOpenRoom)?;
        Ok(session.has_socket)
    }

    /// Load one older history page. Returns the number of messages added;
    /// the caller re-anchors the viewport with [`anchored_scroll_top`].
    pub async fn fetch_older(&self) -> Result<usize, ClientError> {
        let mut guard = self.inner.lock().await;
        let session = guard.as_mut().ok_or(ClientError::NoOpenRoom)?;
        let room_id = session.store.room_id();
        let inserted = session.paginator.fetch_older(&mut session.store).await?;
        if inserted > 0 {
            let _ = self.events.send(ClientEvent::MessagesChanged { room_id });
        }
        Ok(inserted)
    }

    pub async fn set_draft(&self, text: impl Into<String>) -> Result<(), ClientError> {
        let mut guard = self.inner.lock().await;
        let session = guard.as_mut().ok_or(ClientError::NoOpenRoom)?;
        session.composer.set_draft(text);
        Ok(())
    }

    pub async fn draft(&self) -> Result<String, ClientError> {
        let guard = self.inner.lock().await;
        let session = guard.as_ref().ok_or(ClientError::NoOpenRoom)?;
        Ok(session.composer.draft().to_string())
    }

    /// Stage a forwarded message body to be quoted above the next send.
    pub async fn set_forward(&self, source: impl Into<String>) -> Result<(), ClientError> {
        let mut guard = self.inner.lock().await;
        let session = guard.as_mut().ok_or(ClientError::NoOpenRoom)?;
        session.composer.set_forward(source);
        Ok(())
    }

    pub async fn stage_attachment(&self, draft: AttachmentDraft) -> Result<(), ClientError> {
        let mut guard = self.inner.lock().await;
        let session = guard.as_mut().ok_or(ClientError::NoOpenRoom)?;
        session
            .composer
            .attach(draft)
            .map_err(ClientError::Attachment)
    }

    /// Why sending is currently disabled, or `None` when the composer is
    /// ready.
    pub async fn compose_block(&self) -> Result<Option<ComposeBlock>, ClientError> {
        let guard = self.inner.lock().await;
        let session = guard.as_ref().ok_or(ClientError::NoOpenRoom)?;
        let room = session.store.room().ok_or(ClientError::NoOpenRoom)?;
        Ok(session.composer.block_reason(room))
    }

    /// Send the current draft. The message appears in the timeline
    /// immediately as an optimistic local copy; the socket echo carrying the
    /// same client key retires it. On failure the local copy is removed and
    /// the draft restored.
    pub async fn send(&self) -> Result<(), ClientError> {
        let mut guard = self.inner.lock().await;
        let session = guard.as_mut().ok_or(ClientError::NoOpenRoom)?;
        let room = session.store.room().cloned().ok_or(ClientError::NoOpenRoom)?;
        let outgoing = session
            .composer
            .begin_send(&room)
            .map_err(ClientError::ComposeBlocked)?;
        self.dispatch(session, room.room_id, outgoing).await
    }

    /// Ask a charting assistant to start a fresh case.
    pub async fn reset_conversation(&self) -> Result<(), ClientError> {
        let mut guard = self.inner.lock().await;
        let session = guard.as_mut().ok_or(ClientError::NoOpenRoom)?;
        let room = session.store.room().cloned().ok_or(ClientError::NoOpenRoom)?;
        if !room.kind.supports_reset() {
            return Err(ClientError::Unsupported {
                action: "new case reset",
            });
        }
        let outgoing = session
            .composer
            .begin_reset(&room)
            .map_err(ClientError::ComposeBlocked)?;
        self.dispatch(session, room.room_id, outgoing).await
    }

    async fn dispatch(
        &self,
        session: &mut RoomSession,
        room_id: RoomId,
        outgoing: OutgoingMessage,
    ) -> Result<(), ClientError> {
        let client_key = outgoing.client_key;
        session
            .store
            .queue_local(client_key, self.local_echo(room_id, &outgoing));
        let _ = self.events.send(ClientEvent::MessagesChanged { room_id });

        match self.api.send_message(room_id, &outgoing).await {
            Ok(confirmed) => {
                session.composer.complete_send();
                if !session.has_socket {
                    // No echo will come; materialize the server copy from
                    // the REST response instead.
                    session.store.apply_push(confirmed);
                    let _ = self.events.send(ClientEvent::MessagesChanged { room_id });
                }
                Ok(())
            }
            Err(err) => {
                session.store.discard_local(client_key);
                session.composer.fail_send(outgoing);
                let _ = self.events.send(ClientEvent::MessagesChanged { room_id });
                Err(err)
            }
        }
    }

    /// The optimistic local rendition of an outgoing message. The server id
    /// is a placeholder; identity is the client key until the echo arrives.
    fn local_echo(&self, room_id: RoomId, outgoing: &OutgoingMessage) -> MessagePayload {
        MessagePayload {
            message_id: MessageId(0),
            room_id,
            sender: Some(SenderSummary {
                user_id: self.auth.user_id(),
                display_name: None,
            }),
            is_ai: false,
            content: outgoing.content.clone(),
            created_at: chrono::Utc::now(),
            attachments: Vec::new(),
            reactions: Default::default(),
            my_reaction: None,
            seen_by: Vec::new(),
            client_key: Some(outgoing.client_key),
        }
    }

    /// Toggle a reaction optimistically and confirm it with the server,
    /// rolling the cached message back if the request fails.
    pub async fn toggle_reaction(
        &self,
        message_id: MessageId,
        reaction: ReactionKind,
    ) -> Result<(), ClientError> {
        let mut guard = self.inner.lock().await;
        let session = guard.as_mut().ok_or(ClientError::NoOpenRoom)?;
        let room_id = session.store.room_id();
        match session.store.get(message_id) {
            None => return Err(ClientError::MessageNotFound { message_id }),
            // Reactions are feedback on assistant answers only.
            Some(message) if !message.is_ai => {
                return Err(ClientError::Unsupported { action: "reactions" });
            }
            Some(_) => {}
        }
        if !session
            .reactions
            .apply_toggle(&mut session.store, message_id, reaction)
        {
            return Err(ClientError::MessageNotFound { message_id });
        }
        let _ = self.events.send(ClientEvent::MessagesChanged { room_id });

        match self.api.react(message_id, reaction).await {
            Ok(()) => {
                session.reactions.confirm(message_id);
                Ok(())
            }
            Err(err) => {
                session.reactions.rollback(&mut session.store, message_id);
                let _ = self.events.send(ClientEvent::MessagesChanged { room_id });
                Err(err)
            }
        }
    }

    /// Walk older history until `target` is cached, then anchor on it.
    pub async fn resolve_mention(&self, target: MessageId) -> Result<(), ClientError> {
        let mut guard = self.inner.lock().await;
        let session = guard.as_mut().ok_or(ClientError::NoOpenRoom)?;
        let room_id = session.store.room_id();
        let RoomSession {
            store,
            paginator,
            mentions,
            ..
        } = session;
        let anchored = mentions.resolve(target, paginator, store).await?;
        let _ = self.events.send(ClientEvent::MessagesChanged { room_id });
        let _ = self.events.send(ClientEvent::MentionAnchored {
            message_id: anchored,
        });
        Ok(())
    }

    pub async fn mention_state(&self) -> Result<MentionState, ClientError> {
        let guard = self.inner.lock().await;
        let session = guard.as_ref().ok_or(ClientError::NoOpenRoom)?;
        Ok(session.mentions.state())
    }

    /// Block or unblock a member of the open group room.
    pub async fn block_member(
        &self,
        user_id: UserId,
        action: BlockAction,
    ) -> Result<(), ClientError> {
        let guard = self.inner.lock().await;
        let session = guard.as_ref().ok_or(ClientError::NoOpenRoom)?;
        let room = session.store.room().ok_or(ClientError::NoOpenRoom)?;
        if room.kind != RoomKind::Group {
            return Err(ClientError::Unsupported {
                action: "member moderation",
            });
        }
        self.api
            .block_member(room.room_id, &BlockMemberRequest { user_id, action })
            .await
    }

    /// Subscribe to account-wide room list updates, independent of which
    /// room is open. Replaces any previous watcher.
    pub async fn watch_room_list(self: &Arc<Self>) -> Result<(), ClientError> {
        let mut subscription = transport::subscribe(
            &self.config.server_url,
            RoomChannel::List,
            self.auth.as_ref(),
            self.config.socket_buffer,
        )
        .await?;

        let client = Arc::clone(self);
        let task = tokio::spawn(async move {
            while let Some(frame) = subscription.recv().await {
                client.handle_frame(frame).await;
            }
            debug!("room list socket ended");
        });

        let mut guard = self.list_task.lock().await;
        if let Some(previous) = guard.replace(task) {
            previous.abort();
        }
        Ok(())
    }

    pub async fn stop_watching_room_list(&self) {
        let mut guard = self.list_task.lock().await;
        if let Some(task) = guard.take() {
            task.abort();
        }
    }

    /// The room's socket reader has ended. Record the loss so callers can
    /// poll for it, and tell subscribers the room went push-less.
    async fn mark_push_less(&self, room_id: RoomId) {
        let mut guard = self.inner.lock().await;
        match guard.as_mut() {
            Some(session) if session.store.room_id() == room_id => {
                session.has_socket = false;
            }
            _ => return,
        }
        drop(guard);
        let _ = self
            .events
            .send(ClientEvent::LiveUpdatesUnavailable { room_id });
    }

    async fn handle_frame(self: &Arc<Self>, frame: InboundFrame) {
        match frame {
            InboundFrame::Event(RoomEvent::Message { message }) => {
                self.handle_push(message).await;
            }
            InboundFrame::Event(RoomEvent::MessagesSeenUpdate {
                message_ids,
                seen_by,
            }) => {
                let mut guard = self.inner.lock().await;
                if let Some(session) = guard.as_mut() {
                    session.store.apply_seen(&message_ids, seen_by);
                    let _ = self.events.send(ClientEvent::SeenUpdated {
                        room_id: session.store.room_id(),
                        message_ids,
                        seen_by,
                    });
                }
            }
            InboundFrame::Event(RoomEvent::RoomListUpdate { rooms }) => {
                let _ = self.events.send(ClientEvent::RoomListUpdated { rooms });
            }
            InboundFrame::Other(value) => {
                let _ = self.events.send(ClientEvent::Unhandled(value));
            }
        }
    }

    async fn handle_push(self: &Arc<Self>, message: MessagePayload) {
        let mut guard = self.inner.lock().await;
        let Some(session) = guard.as_mut() else {
            return;
        };
        let room_id = session.store.room_id();
        if message.room_id != room_id {
            // A frame raced the room switch; it belongs to a closed room.
            debug!(
                got = message.room_id.0,
                open = room_id.0,
                "discarding push for closed room"
            );
            return;
        }

        // The pushed payload is authoritative for this message.
        session.reactions.forget(message.message_id);
        if message.is_ai {
            session.composer.assistant_replied();
            let _ = self.events.send(ClientEvent::AssistantReplied { room_id });
        }
        session.store.apply_push(message.clone());
        let _ = self.events.send(ClientEvent::MessageReceived { message });
        let _ = self.events.send(ClientEvent::MessagesChanged { room_id });
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
