use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{FileId, MessageId, ReactionKind, RoomId, RoomKind, UserId};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SenderSummary {
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttachmentPayload {
    pub file_id: FileId,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReactionTally {
    pub count: u32,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReactionSummary {
    #[serde(default)]
    pub like: ReactionTally,
    #[serde(default)]
    pub dislike: ReactionTally,
}

/// A message as delivered by the server, over REST pages and socket pushes
/// alike. `client_key` is echoed back verbatim for messages this client
/// posted, so optimistic local copies can be retired deterministically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message_id: MessageId,
    pub room_id: RoomId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<SenderSummary>,
    #[serde(default)]
    pub is_ai: bool,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<AttachmentPayload>,
    #[serde(default)]
    pub reactions: ReactionSummary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub my_reaction: Option<ReactionKind>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub seen_by: Vec<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key: Option<Uuid>,
}

/// Room header. `chat_blocked` and `can_send` are authoritative from the
/// server and ride along with every history page response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomSummary {
    pub room_id: RoomId,
    pub kind: RoomKind,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default)]
    pub chat_blocked: bool,
    #[serde(default = "default_can_send")]
    pub can_send: bool,
    #[serde(default)]
    pub member_count: u32,
}

fn default_can_send() -> bool {
    true
}

/// One page of history. `results` arrive newest-first at the wire level;
/// `next_cursor` points toward older history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePage {
    pub results: Vec<MessagePayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_cursor: Option<String>,
    pub room: RoomSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactRequest {
    pub reaction: ReactionKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockAction {
    Block,
    Unblock,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockMemberRequest {
    pub user_id: UserId,
    pub action: BlockAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoomEvent {
    Message {
        message: MessagePayload,
    },
    MessagesSeenUpdate {
        message_ids: Vec<MessageId>,
        seen_by: UserId,
    },
    RoomListUpdate {
        rooms: Vec<RoomSummary>,
    },
}

/// A parsed inbound socket frame. Frames with an unrecognized `type`
/// discriminator are forwarded as [`InboundFrame::Other`] instead of being
/// dropped, so a newer server cannot silently starve the client.
#[derive(Debug, Clone)]
pub enum InboundFrame {
    Event(RoomEvent),
    Other(serde_json::Value),
}

impl InboundFrame {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        match RoomEvent::deserialize(&value) {
            Ok(event) => Ok(Self::Event(event)),
            Err(_) => Ok(Self::Other(value)),
        }
    }
}
