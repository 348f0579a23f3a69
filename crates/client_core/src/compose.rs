//! Draft assembly and send gating.
//!
//! The composer turns UI-side draft state (typed text with inline mention
//! markup, a forwarded message, staged attachments) into the wire payload,
//! and decides when sending is disabled outright. Room capability checks
//! live on [`RoomKind`]; this module enforces them at the send boundary.

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;
use uuid::Uuid;

use shared::domain::{RoomKind, UserId};
use shared::protocol::RoomSummary;

/// Magic body that asks a charting assistant to discard its conversation
/// context and start a fresh case.
pub const NEW_CASE_SENTINEL: &str = "NEW_CASE";

pub const MAX_ATTACHMENT_BYTES: usize = 10 * 1024 * 1024;

const ALLOWED_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "webp", "svg", "xls", "xlsx", "csv", "doc", "docx",
];

/// Inline mention markup as produced by the mention picker:
/// `@[Display Name](42)`.
static MENTION_MARKUP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"@\[([^\]]+)\]\((\d+)\)").unwrap());

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentDraft {
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// A fully assembled message ready to post. `client_key` travels to the
/// server and is echoed back on the socket, pairing the echo with the
/// optimistic local copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub content: String,
    pub mention_user_ids: Vec<UserId>,
    pub attachments: Vec<AttachmentDraft>,
    pub client_key: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComposeBlock {
    /// The server flagged the conversation as blocked.
    RoomBlocked,
    /// The caller's account may read but not post here.
    SendingDisabled,
    /// An assistant reply is still pending; AI rooms are strictly
    /// turn-taking.
    AwaitingAssistant,
    /// Nothing to send: no text and no attachments.
    EmptyDraft,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentRejection {
    UnsupportedType,
    TooLarge,
    NotAllowedHere,
}

struct DraftBackup {
    draft: String,
    forward: Option<String>,
}

pub struct ComposeController {
    kind: RoomKind,
    draft: String,
    forward: Option<String>,
    attachments: Vec<AttachmentDraft>,
    assistant_pending: bool,
    backup: Option<DraftBackup>,
}

impl ComposeController {
    pub fn new(kind: RoomKind) -> Self {
        Self {
            kind,
            draft: String::new(),
            forward: None,
            attachments: Vec::new(),
            assistant_pending: false,
            backup: None,
        }
    }

    pub fn draft(&self) -> &str {
        &self.draft
    }

    pub fn set_draft(&mut self, text: impl Into<String>) {
        self.draft = text.into();
    }

    pub fn forward(&self) -> Option<&str> {
        self.forward.as_deref()
    }

    /// Stage a message body to forward. It is rendered as a block quote
    /// above the typed text of the next send.
    pub fn set_forward(&mut self, source: impl Into<String>) {
        self.forward = Some(source.into());
    }

    pub fn clear_forward(&mut self) {
        self.forward = None;
    }

    pub fn attachments(&self) -> &[AttachmentDraft] {
        &self.attachments
    }

    /// Stage an attachment, enforcing the type allow-list and size cap.
    pub fn attach(&mut self, draft: AttachmentDraft) -> Result<(), AttachmentRejection> {
        if !self.kind.supports_attachments() {
            return Err(AttachmentRejection::NotAllowedHere);
        }
        let extension = draft
            .filename
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase());
        match extension {
            Some(ext) if ALLOWED_EXTENSIONS.contains(&ext.as_str()) => {}
            _ => return Err(AttachmentRejection::UnsupportedType),
        }
        if draft.bytes.len() > MAX_ATTACHMENT_BYTES {
            return Err(AttachmentRejection::TooLarge);
        }
        self.attachments.push(draft);
        Ok(())
    }

    pub fn remove_attachment(&mut self, index: usize) {
        if index < self.attachments.len() {
            self.attachments.remove(index);
        }
    }

    pub fn assistant_pending(&self) -> bool {
        self.assistant_pending
    }

    /// Called when an assistant message lands for this room.
    pub fn assistant_replied(&mut self) {
        self.assistant_pending = false;
    }

    /// Why sending is currently disabled, if it is.
    pub fn block_reason(&self, room: &RoomSummary) -> Option<ComposeBlock> {
        if room.chat_blocked {
            return Some(ComposeBlock::RoomBlocked);
        }
        if !room.can_send {
            return Some(ComposeBlock::SendingDisabled);
        }
        if self.assistant_pending && self.kind.is_ai() {
            return Some(ComposeBlock::AwaitingAssistant);
        }
        None
    }

    /// Assemble the draft into an [`OutgoingMessage`] and clear the compose
    /// state. On a blocked room this is a no-op and the draft is untouched.
    /// If the send later fails, [`fail_send`](Self::fail_send) restores the
    /// state cleared here.
    pub fn begin_send(&mut self, room: &RoomSummary) -> Result<OutgoingMessage, ComposeBlock> {
        if let Some(block) = self.block_reason(room) {
            return Err(block);
        }
        if self.draft.trim().is_empty() && self.attachments.is_empty() {
            return Err(ComposeBlock::EmptyDraft);
        }

        let (plain, mention_user_ids) = render_mentions(&self.draft);
        let mention_user_ids = if self.kind.supports_mentions() {
            mention_user_ids
        } else {
            Vec::new()
        };
        let content = match &self.forward {
            Some(source) => format!("{}\n\n{}", quote_block(source), plain),
            None => plain,
        };

        self.backup = Some(DraftBackup {
            draft: std::mem::take(&mut self.draft),
            forward: self.forward.take(),
        });
        let attachments = std::mem::take(&mut self.attachments);
        if self.kind.is_ai() {
            self.assistant_pending = true;
        }

        Ok(OutgoingMessage {
            content,
            mention_user_ids,
            attachments,
            client_key: Uuid::new_v4(),
        })
    }

    /// Assemble the "new case" reset for a charting conversation. The
    /// sentinel body bypasses the empty-draft check but respects every other
    /// gate.
    pub fn begin_reset(&mut self, room: &RoomSummary) -> Result<OutgoingMessage, ComposeBlock> {
        debug_assert!(self.kind.supports_reset());
        if let Some(block) = self.block_reason(room) {
            return Err(block);
        }
        self.assistant_pending = true;
        Ok(OutgoingMessage {
            content: NEW_CASE_SENTINEL.to_string(),
            mention_user_ids: Vec::new(),
            attachments: Vec::new(),
            client_key: Uuid::new_v4(),
        })
    }

    /// The send was accepted by the server; drop the restore point.
    pub fn complete_send(&mut self) {
        self.backup = None;
    }

    /// The send failed: put the draft, forward, and attachments back so the
    /// user can retry, and stop waiting for an assistant that will not come.
    pub fn fail_send(&mut self, outgoing: OutgoingMessage) {
        if let Some(backup) = self.backup.take() {
            self.draft = backup.draft;
            self.forward = backup.forward;
        }
        self.attachments = outgoing.attachments;
        self.assistant_pending = false;
        debug!("send failed; draft restored");
    }
}

/// Replace mention markup with its display form and collect the mentioned
/// user ids, first-occurrence order, duplicates dropped.
fn render_mentions(raw: &str) -> (String, Vec<UserId>) {
    let mut ids: Vec<UserId> = Vec::new();
    let plain = MENTION_MARKUP.replace_all(raw, |caps: &regex::Captures<'_>| {
        if let Ok(id) = caps[2].parse::<i64>() {
            let id = UserId(id);
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        format!("@{}", &caps[1])
    });
    (plain.into_owned(), ids)
}

/// Prefix every line of a forwarded body with a quote marker.
fn quote_block(source: &str) -> String {
    source
        .lines()
        .map(|line| format!("> {line}"))
        .collect::<Vec<_>>()
        .join("\n")
}
