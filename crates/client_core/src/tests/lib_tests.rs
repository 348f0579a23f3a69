use super::*;

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Multipart, Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use tokio::net::TcpListener;
use uuid::Uuid;

use shared::error::{ApiError, ErrorCode};
use shared::protocol::MessagePage;

#[derive(Clone)]
struct ChatServerState {
    pages: Arc<StdMutex<HashMap<Option<String>, MessagePage>>>,
    sent: Arc<StdMutex<Vec<(String, Option<Uuid>)>>>,
    blocks: Arc<StdMutex<Vec<BlockMemberRequest>>>,
    next_message_id: Arc<AtomicI64>,
    fail_send: bool,
    fail_react: bool,
    /// Push the server copy of each accepted send over the room socket,
    /// the way the real backend echoes.
    echo_on_send: bool,
    room_frames: tokio::sync::broadcast::Sender<String>,
    list_frames: tokio::sync::broadcast::Sender<String>,
}

impl ChatServerState {
    fn new(pages: HashMap<Option<String>, MessagePage>) -> Self {
        let (room_frames, _) = tokio::sync::broadcast::channel(64);
        let (list_frames, _) = tokio::sync::broadcast::channel(64);
        Self {
            pages: Arc::new(StdMutex::new(pages)),
            sent: Arc::new(StdMutex::new(Vec::new())),
            blocks: Arc::new(StdMutex::new(Vec::new())),
            next_message_id: Arc::new(AtomicI64::new(100)),
            fail_send: false,
            fail_react: false,
            echo_on_send: false,
            room_frames,
            list_frames,
        }
    }

    fn push_room_frame(&self, event: &RoomEvent) {
        let frame = serde_json::to_string(event).expect("serialize frame");
        let _ = self.room_frames.send(frame);
    }

    fn push_list_frame(&self, event: &RoomEvent) {
        let frame = serde_json::to_string(event).expect("serialize frame");
        let _ = self.list_frames.send(frame);
    }

    fn sent_messages(&self) -> Vec<(String, Option<Uuid>)> {
        self.sent.lock().expect("sent lock").clone()
    }
}

fn api_error(status: StatusCode, code: ErrorCode, message: &str) -> Response {
    (status, Json(ApiError::new(code, message))).into_response()
}

async fn handle_messages(
    State(state): State<ChatServerState>,
    Path(_room_id): Path<i64>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let pages = state.pages.lock().expect("pages lock");
    match pages.get(&params.get("cursor").cloned()) {
        Some(page) => Json(page.clone()).into_response(),
        None => api_error(StatusCode::NOT_FOUND, ErrorCode::NotFound, "no such page"),
    }
}

async fn handle_send(
    State(state): State<ChatServerState>,
    Path(room_id): Path<i64>,
    mut multipart: Multipart,
) -> Response {
    if state.fail_send {
        return api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::Internal,
            "send failed",
        );
    }

    let mut content = String::new();
    let mut client_key = None;
    while let Some(field) = multipart.next_field().await.expect("multipart field") {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("content") => content = field.text().await.expect("content field"),
            Some("client_key") => {
                client_key = Uuid::parse_str(&field.text().await.expect("client_key field")).ok();
            }
            _ => {
                let _ = field.bytes().await;
            }
        }
    }
    state
        .sent
        .lock()
        .expect("sent lock")
        .push((content.clone(), client_key));

    let message = MessagePayload {
        message_id: MessageId(state.next_message_id.fetch_add(1, Ordering::SeqCst)),
        room_id: RoomId(room_id),
        sender: Some(SenderSummary {
            user_id: UserId(7),
            display_name: Some("sender".to_string()),
        }),
        is_ai: false,
        content,
        created_at: Utc::now(),
        attachments: Vec::new(),
        reactions: Default::default(),
        my_reaction: None,
        seen_by: Vec::new(),
        client_key,
    };
    if state.echo_on_send {
        state.push_room_frame(&RoomEvent::Message {
            message: message.clone(),
        });
    }
    Json(message).into_response()
}

async fn handle_react(
    State(state): State<ChatServerState>,
    Path(_message_id): Path<i64>,
) -> Response {
    if state.fail_react {
        return api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::Internal,
            "reaction failed",
        );
    }
    StatusCode::OK.into_response()
}

async fn handle_block(
    State(state): State<ChatServerState>,
    Path(_room_id): Path<i64>,
    Json(request): Json<BlockMemberRequest>,
) -> Response {
    state.blocks.lock().expect("blocks lock").push(request);
    StatusCode::OK.into_response()
}

async fn forward_frames(
    mut rx: tokio::sync::broadcast::Receiver<String>,
    mut socket: WebSocket,
) {
    while let Ok(frame) = rx.recv().await {
        if socket.send(WsMessage::Text(frame)).await.is_err() {
            break;
        }
    }
}

async fn handle_room_ws(
    State(state): State<ChatServerState>,
    Path(_room_id): Path<i64>,
    ws: WebSocketUpgrade,
) -> Response {
    let rx = state.room_frames.subscribe();
    ws.on_upgrade(move |socket| forward_frames(rx, socket))
}

async fn handle_list_ws(State(state): State<ChatServerState>, ws: WebSocketUpgrade) -> Response {
    let rx = state.list_frames.subscribe();
    ws.on_upgrade(move |socket| forward_frames(rx, socket))
}

async fn spawn_chat_server(state: ChatServerState) -> String {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let app = Router::new()
        .route("/rooms/:room_id/messages/", get(handle_messages))
        .route("/rooms/:room_id/send/", post(handle_send))
        .route("/messages/:message_id/react/", post(handle_react))
        .route("/rooms/:room_id/member/block/", post(handle_block))
        .route("/ws/rooms/", get(handle_list_ws))
        .route("/ws/rooms/:room_id/", get(handle_room_ws))
        .with_state(state);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

fn test_room(kind: RoomKind) -> RoomSummary {
    RoomSummary {
        room_id: RoomId(1),
        kind,
        name: "dr-kim".to_string(),
        image: None,
        chat_blocked: false,
        can_send: true,
        member_count: 2,
    }
}

fn history_message(id: i64, content: &str) -> MessagePayload {
    MessagePayload {
        message_id: MessageId(id),
        room_id: RoomId(1),
        sender: Some(SenderSummary {
            user_id: UserId(9),
            display_name: Some("Dr. Kim".to_string()),
        }),
        is_ai: false,
        content: content.to_string(),
        created_at: chrono::TimeZone::with_ymd_and_hms(&Utc, 2024, 1, 1, 0, 0, 0).unwrap()
            + chrono::Duration::seconds(id),
        attachments: Vec::new(),
        reactions: Default::default(),
        my_reaction: None,
        seen_by: Vec::new(),
        client_key: None,
    }
}

/// Newest-first wire page, the order the backend serializes.
fn newest_page(room: &RoomSummary, messages: Vec<MessagePayload>) -> MessagePage {
    let mut results = messages;
    results.sort_by_key(|message| std::cmp::Reverse(message.created_at));
    MessagePage {
        results,
        next_cursor: None,
        previous_cursor: None,
        room: room.clone(),
    }
}

fn client_for(server_url: &str) -> Arc<RoomClient> {
    let auth: Arc<dyn AuthProvider> = Arc::new(StaticAuth::new(UserId(7), "test-token"));
    RoomClient::with_http(ClientConfig::new(server_url), auth)
}

async fn wait_for_event(
    rx: &mut broadcast::Receiver<ClientEvent>,
    mut pred: impl FnMut(&ClientEvent) -> bool,
) -> ClientEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.expect("event stream ended");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test]
async fn open_room_presents_newest_page_oldest_first() {
    let room = test_room(RoomKind::Private);
    let page = newest_page(
        &room,
        vec![
            history_message(1, "first"),
            history_message(2, "second"),
            history_message(3, "third"),
        ],
    );
    let state = ChatServerState::new(HashMap::from([(None, page)]));
    let server_url = spawn_chat_server(state).await;

    let client = client_for(&server_url);
    let opened = client.open_room(RoomId(1)).await.expect("open room");
    assert_eq!(opened.room_id, RoomId(1));
    assert_eq!(opened.name, "dr-kim");

    let timeline = client.snapshot().await.expect("snapshot");
    let contents: Vec<&str> = timeline.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["first", "second", "third"]);
    assert!(!client.has_older().await.expect("has_older"));
}

#[tokio::test]
async fn send_converges_on_the_socket_echo() {
    let room = test_room(RoomKind::Private);
    let page = newest_page(&room, vec![history_message(1, "hello")]);
    let mut state = ChatServerState::new(HashMap::from([(None, page)]));
    state.echo_on_send = true;
    let server_state = state.clone();
    let server_url = spawn_chat_server(state).await;

    let client = client_for(&server_url);
    let mut events = client.subscribe_events();
    client.open_room(RoomId(1)).await.expect("open room");

    client.set_draft("checking in").await.expect("draft");
    client.send().await.expect("send");

    wait_for_event(&mut events, |event| {
        matches!(event, ClientEvent::MessageReceived { message } if message.content == "checking in")
    })
    .await;

    let timeline = client.snapshot().await.expect("snapshot");
    // Exactly one copy: the optimistic local entry was retired by the echo
    // carrying the same client key.
    let copies: Vec<_> = timeline
        .iter()
        .filter(|m| m.content == "checking in")
        .collect();
    assert_eq!(copies.len(), 1);
    assert_ne!(copies[0].message_id, MessageId(0));

    let sent = server_state.sent_messages();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "checking in");
    assert!(sent[0].1.is_some());
}

#[tokio::test]
async fn send_without_socket_materializes_the_rest_response() {
    let room = test_room(RoomKind::Private);
    let page = newest_page(&room, vec![history_message(1, "hello")]);
    let state = ChatServerState::new(HashMap::from([(None, page)]));
    let server_url = spawn_chat_server(state).await;

    // No token: the socket subscription fails, the room opens anyway.
    let auth: Arc<dyn AuthProvider> = Arc::new(StaticAuth::unauthenticated(UserId(7)));
    let client = RoomClient::with_http(ClientConfig::new(server_url.as_str()), auth);
    client.open_room(RoomId(1)).await.expect("open room");

    client.set_draft("no live updates").await.expect("draft");
    client.send().await.expect("send");

    let timeline = client.snapshot().await.expect("snapshot");
    assert_eq!(timeline.len(), 2);
    // No ghost: every rendered message carries a confirmed server id.
    assert!(timeline.iter().all(|m| m.message_id != MessageId(0)));
}

#[tokio::test]
async fn socket_failure_is_reported_to_subscribers() {
    let room = test_room(RoomKind::Private);
    let page = newest_page(&room, vec![history_message(1, "hello")]);
    let state = ChatServerState::new(HashMap::from([(None, page)]));
    let server_url = spawn_chat_server(state).await;

    // No token: the socket subscription fails while the open succeeds.
    let auth: Arc<dyn AuthProvider> = Arc::new(StaticAuth::unauthenticated(UserId(7)));
    let client = RoomClient::with_http(ClientConfig::new(server_url.as_str()), auth);
    let mut events = client.subscribe_events();
    client.open_room(RoomId(1)).await.expect("open room");

    let event = wait_for_event(&mut events, |event| {
        matches!(event, ClientEvent::LiveUpdatesUnavailable { .. })
    })
    .await;
    assert!(matches!(
        event,
        ClientEvent::LiveUpdatesUnavailable { room_id: RoomId(1) }
    ));
    assert!(!client.live_updates_available().await.expect("open room"));
}

#[tokio::test]
async fn failed_send_restores_the_draft_and_removes_the_ghost() {
    let room = test_room(RoomKind::Private);
    let page = newest_page(&room, vec![history_message(1, "hello")]);
    let mut state = ChatServerState::new(HashMap::from([(None, page)]));
    state.fail_send = true;
    let server_url = spawn_chat_server(state).await;

    let client = client_for(&server_url);
    client.open_room(RoomId(1)).await.expect("open room");

    client.set_draft("will not go through").await.expect("draft");
    let err = client.send().await.expect_err("send must fail");
    assert!(matches!(err, ClientError::Api(_)));

    assert_eq!(client.draft().await.expect("draft"), "will not go through");
    let timeline = client.snapshot().await.expect("snapshot");
    assert_eq!(timeline.len(), 1);
}

#[tokio::test]
async fn blocked_room_rejects_sends_locally() {
    let mut room = test_room(RoomKind::Private);
    room.chat_blocked = true;
    let page = newest_page(&room, vec![history_message(1, "hello")]);
    let state = ChatServerState::new(HashMap::from([(None, page)]));
    let server_state = state.clone();
    let server_url = spawn_chat_server(state).await;

    let client = client_for(&server_url);
    client.open_room(RoomId(1)).await.expect("open room");
    assert_eq!(
        client.compose_block().await.expect("compose block"),
        Some(ComposeBlock::RoomBlocked)
    );

    client.set_draft("should not send").await.expect("draft");
    let err = client.send().await.expect_err("blocked");
    assert!(matches!(
        err,
        ClientError::ComposeBlocked(ComposeBlock::RoomBlocked)
    ));
    // Nothing reached the server and the draft survived.
    assert!(server_state.sent_messages().is_empty());
    assert_eq!(client.draft().await.expect("draft"), "should not send");
}

#[tokio::test]
async fn pushes_for_other_rooms_are_discarded() {
    let room = test_room(RoomKind::Private);
    let page = newest_page(&room, vec![history_message(1, "hello")]);
    let state = ChatServerState::new(HashMap::from([(None, page)]));
    let server_state = state.clone();
    let server_url = spawn_chat_server(state).await;

    let client = client_for(&server_url);
    let mut events = client.subscribe_events();
    client.open_room(RoomId(1)).await.expect("open room");

    let mut stray = history_message(50, "wrong room");
    stray.room_id = RoomId(99);
    server_state.push_room_frame(&RoomEvent::Message { message: stray });
    let mut expected = history_message(51, "right room");
    expected.room_id = RoomId(1);
    server_state.push_room_frame(&RoomEvent::Message { message: expected });

    wait_for_event(&mut events, |event| {
        matches!(event, ClientEvent::MessageReceived { message } if message.content == "right room")
    })
    .await;

    let timeline = client.snapshot().await.expect("snapshot");
    assert!(timeline.iter().all(|m| m.room_id == RoomId(1)));
    assert!(timeline.iter().any(|m| m.content == "right room"));
    assert!(timeline.iter().all(|m| m.content != "wrong room"));
}

#[tokio::test]
async fn seen_updates_union_into_cached_messages() {
    let room = test_room(RoomKind::Group);
    let page = newest_page(
        &room,
        vec![history_message(1, "a"), history_message(2, "b")],
    );
    let state = ChatServerState::new(HashMap::from([(None, page)]));
    let server_state = state.clone();
    let server_url = spawn_chat_server(state).await;

    let client = client_for(&server_url);
    let mut events = client.subscribe_events();
    client.open_room(RoomId(1)).await.expect("open room");

    server_state.push_room_frame(&RoomEvent::MessagesSeenUpdate {
        message_ids: vec![MessageId(1), MessageId(2)],
        seen_by: UserId(4),
    });
    wait_for_event(&mut events, |event| {
        matches!(event, ClientEvent::SeenUpdated { seen_by, .. } if *seen_by == UserId(4))
    })
    .await;

    let timeline = client.snapshot().await.expect("snapshot");
    assert!(timeline.iter().all(|m| m.seen_by.contains(&UserId(4))));
}

#[tokio::test]
async fn rejected_reaction_rolls_back_to_server_state() {
    let room = test_room(RoomKind::Ai);
    let mut message = history_message(1, "an assistant answer");
    message.is_ai = true;
    message.reactions.like.count = 2;
    let page = newest_page(&room, vec![message]);
    let mut state = ChatServerState::new(HashMap::from([(None, page)]));
    state.fail_react = true;
    let server_url = spawn_chat_server(state).await;

    let client = client_for(&server_url);
    client.open_room(RoomId(1)).await.expect("open room");

    let err = client
        .toggle_reaction(MessageId(1), ReactionKind::Like)
        .await
        .expect_err("reaction must fail");
    assert!(matches!(err, ClientError::Api(_)));

    let timeline = client.snapshot().await.expect("snapshot");
    assert_eq!(timeline[0].reactions.like.count, 2);
    assert_eq!(timeline[0].my_reaction, None);
}

#[tokio::test]
async fn assistant_reply_unblocks_the_composer() {
    let room = test_room(RoomKind::Ai);
    let page = newest_page(&room, vec![history_message(1, "how can I help?")]);
    let mut state = ChatServerState::new(HashMap::from([(None, page)]));
    state.echo_on_send = true;
    let server_state = state.clone();
    let server_url = spawn_chat_server(state).await;

    let client = client_for(&server_url);
    let mut events = client.subscribe_events();
    client.open_room(RoomId(1)).await.expect("open room");

    client.set_draft("patient has a fever").await.expect("draft");
    client.send().await.expect("send");
    assert_eq!(
        client.compose_block().await.expect("compose block"),
        Some(ComposeBlock::AwaitingAssistant)
    );

    let mut reply = history_message(60, "noted; any other symptoms?");
    reply.is_ai = true;
    server_state.push_room_frame(&RoomEvent::Message { message: reply });
    wait_for_event(&mut events, |event| {
        matches!(event, ClientEvent::AssistantReplied { .. })
    })
    .await;

    assert_eq!(client.compose_block().await.expect("compose block"), None);
}

#[tokio::test]
async fn block_member_posts_to_the_moderation_endpoint() {
    let room = test_room(RoomKind::Group);
    let page = newest_page(&room, vec![history_message(1, "hello")]);
    let state = ChatServerState::new(HashMap::from([(None, page)]));
    let server_state = state.clone();
    let server_url = spawn_chat_server(state).await;

    let client = client_for(&server_url);
    client.open_room(RoomId(1)).await.expect("open room");
    client
        .block_member(UserId(5), BlockAction::Block)
        .await
        .expect("block");

    let blocks = server_state.blocks.lock().expect("blocks lock").clone();
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].user_id, UserId(5));
    assert_eq!(blocks[0].action, BlockAction::Block);
}

#[tokio::test]
async fn block_member_requires_a_group_room() {
    let room = test_room(RoomKind::Private);
    let page = newest_page(&room, vec![history_message(1, "hello")]);
    let state = ChatServerState::new(HashMap::from([(None, page)]));
    let server_url = spawn_chat_server(state).await;

    let client = client_for(&server_url);
    client.open_room(RoomId(1)).await.expect("open room");
    let err = client
        .block_member(UserId(5), BlockAction::Block)
        .await
        .expect_err("not a group");
    assert!(matches!(err, ClientError::Unsupported { .. }));
}

#[tokio::test]
async fn room_list_watcher_forwards_updates() {
    let room = test_room(RoomKind::Private);
    let state = ChatServerState::new(HashMap::new());
    let server_state = state.clone();
    let server_url = spawn_chat_server(state).await;

    let client = client_for(&server_url);
    let mut events = client.subscribe_events();
    client.watch_room_list().await.expect("watch");

    let mut other = test_room(RoomKind::Group);
    other.room_id = RoomId(2);
    other.name = "ward-3".to_string();
    server_state.push_list_frame(&RoomEvent::RoomListUpdate {
        rooms: vec![room.clone(), other],
    });

    let event = wait_for_event(&mut events, |event| {
        matches!(event, ClientEvent::RoomListUpdated { .. })
    })
    .await;
    match event {
        ClientEvent::RoomListUpdated { rooms } => {
            assert_eq!(rooms.len(), 2);
            assert_eq!(rooms[1].name, "ward-3");
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn switching_rooms_replaces_the_session() {
    let room_one = test_room(RoomKind::Private);
    let page_one = newest_page(&room_one, vec![history_message(1, "room one")]);
    let state_one = ChatServerState::new(HashMap::from([(None, page_one)]));
    let url_one = spawn_chat_server(state_one).await;

    let client = client_for(&url_one);
    client.open_room(RoomId(1)).await.expect("open");
    client.set_draft("unsent").await.expect("draft");

    // Re-opening resets the store and the compose state.
    client.open_room(RoomId(1)).await.expect("reopen");
    assert_eq!(client.draft().await.expect("draft"), "");
    let timeline = client.snapshot().await.expect("snapshot");
    assert_eq!(timeline.len(), 1);
    assert_eq!(timeline[0].content, "room one");
}

#[tokio::test]
async fn calls_with_no_open_room_fail_cleanly() {
    let state = ChatServerState::new(HashMap::new());
    let server_url = spawn_chat_server(state).await;

    let client = client_for(&server_url);
    assert!(matches!(
        client.snapshot().await,
        Err(ClientError::NoOpenRoom)
    ));
    assert!(matches!(client.send().await, Err(ClientError::NoOpenRoom)));
    assert!(matches!(
        client.fetch_older().await,
        Err(ClientError::NoOpenRoom)
    ));
}
