use shared::domain::{MessageId, RoomId};
use shared::error::ApiError;
use thiserror::Error;

use crate::compose::{AttachmentRejection, ComposeBlock};

/// Failure taxonomy for the synchronization engine.
///
/// Every variant maps to local UI state rather than a crash: a failed fetch
/// leaves the cache untouched, a failed send leaves the draft intact, a
/// stale-room result is discarded silently.
#[derive(Debug, Error)]
pub enum ClientError {
    /// No bearer token was resolvable, or the socket could not be opened.
    /// The room stays usable over REST; live updates are unavailable.
    #[error("live updates unavailable: {0}")]
    TransportUnavailable(String),

    /// A history-page, send, or reaction request failed over the network.
    #[error("request failed: {0}")]
    Fetch(#[from] reqwest::Error),

    /// The server answered with a structured error envelope.
    #[error("api error: {}", .0.message)]
    Api(ApiError),

    /// The named message is not in the cached history, and for mention
    /// resolution, not in any older page either.
    #[error("message {} not found in room history", .message_id.0)]
    MessageNotFound { message_id: MessageId },

    /// A response arrived for a room the user has already navigated away
    /// from. Callers discard this; it is never surfaced as a failure.
    #[error("stale result for room {} (current room {})", .got.0, .expected.0)]
    StaleRoom { expected: RoomId, got: RoomId },

    /// A history fetch exceeded its timeout budget on every attempt.
    #[error("history fetch timed out after {attempts} attempt(s)")]
    FetchTimeout { attempts: u32 },

    /// The staged file failed the type allow-list or size cap.
    #[error("attachment rejected: {0:?}")]
    Attachment(AttachmentRejection),

    /// Sending is disabled in the open room; the draft stays intact.
    #[error("sending is unavailable: {0:?}")]
    ComposeBlocked(ComposeBlock),

    /// A room-scoped call was made with no room open.
    #[error("no room is open")]
    NoOpenRoom,

    /// The open room's kind does not support the requested action.
    #[error("{action} is not available in this room")]
    Unsupported { action: &'static str },
}
