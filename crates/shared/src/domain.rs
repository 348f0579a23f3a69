use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub i64);
    };
}

id_newtype!(UserId);
id_newtype!(RoomId);
id_newtype!(MessageId);
id_newtype!(FileId);

/// Conversation kind. Compose affordances vary per kind, so the variants
/// expose capability queries instead of letting callers compare strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomKind {
    Private,
    Group,
    Ai,
    AiCharting,
}

impl RoomKind {
    /// AI rooms converse with an assistant; sends block until it answers.
    pub fn is_ai(self) -> bool {
        matches!(self, Self::Ai | Self::AiCharting)
    }

    /// Inline `@` mentions only make sense where other humans can be named.
    pub fn supports_mentions(self) -> bool {
        matches!(self, Self::Group)
    }

    /// The "new case" reset action exists only for charting conversations.
    pub fn supports_reset(self) -> bool {
        matches!(self, Self::AiCharting)
    }

    pub fn supports_attachments(self) -> bool {
        matches!(self, Self::Private | Self::Group)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReactionKind {
    Like,
    Dislike,
}
