use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

id_newtype!(ProfileId);
id_newtype!(MessageId);

const PROVISIONAL_PREFIX: &str = "pending-";

impl MessageId {
    /// Locally generated id for an optimistic entry awaiting server confirmation.
    pub fn provisional() -> Self {
        Self(format!("{PROVISIONAL_PREFIX}{}", Uuid::new_v4()))
    }

    /// Stand-in id for a push event that arrived without one.
    pub fn synthesized(sender: &ProfileId, at: DateTime<Utc>) -> Self {
        let nonce = Uuid::new_v4().simple().to_string();
        Self(format!("local-{}-{sender}-{}", at.timestamp_millis(), &nonce[..9]))
    }

    pub fn is_provisional(&self) -> bool {
        self.0.starts_with(PROVISIONAL_PREFIX)
    }
}

pub const CHATBOT_CONVERSATION: &str = "chatbot";

/// Either a one-to-one thread with a peer profile or the local-only chatbot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConversationId {
    Peer(ProfileId),
    Chatbot,
}

impl ConversationId {
    pub fn parse(raw: &str) -> Self {
        if raw == CHATBOT_CONVERSATION {
            Self::Chatbot
        } else {
            Self::Peer(ProfileId::new(raw))
        }
    }

    pub fn peer(&self) -> Option<&ProfileId> {
        match self {
            Self::Peer(peer) => Some(peer),
            Self::Chatbot => None,
        }
    }

    pub fn is_chatbot(&self) -> bool {
        matches!(self, Self::Chatbot)
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Peer(peer) => write!(f, "{peer}"),
            Self::Chatbot => f.write_str(CHATBOT_CONVERSATION),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationHandle {
    pub conversation_id: ConversationId,
    pub display_name: String,
    pub avatar_ref: Option<String>,
}

impl ConversationHandle {
    pub fn peer(peer: ProfileId, display_name: impl Into<String>) -> Self {
        Self {
            conversation_id: ConversationId::Peer(peer),
            display_name: display_name.into(),
            avatar_ref: None,
        }
    }

    pub fn chatbot(display_name: impl Into<String>) -> Self {
        Self {
            conversation_id: ConversationId::Chatbot,
            display_name: display_name.into(),
            avatar_ref: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageOrigin {
    Fetched,
    Optimistic,
    Pushed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size_bytes: Option<u64>,
}

/// One entry of a conversation timeline.
///
/// `conversation_id` is always the peer's profile id, independent of which side sent the
/// message, so a timeline can be filtered without knowing the viewer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ProfileId,
    pub sender_id: ProfileId,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
    pub created_at: DateTime<Utc>,
    pub seen: bool,
    pub origin: MessageOrigin,
}

impl Message {
    /// Total order used by every timeline: timestamp first, id as a deterministic tie-break.
    pub fn order_key(&self) -> (DateTime<Utc>, &str) {
        (self.created_at, self.id.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSend {
    pub provisional_id: MessageId,
    pub conversation_id: ProfileId,
    pub body: String,
    pub attachment: Option<Attachment>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeenRecord {
    pub message_id: MessageId,
    pub observed_by: ProfileId,
    pub observed_at: DateTime<Utc>,
}
