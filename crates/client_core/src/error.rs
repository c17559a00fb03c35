use shared::error::ApiError;
use thiserror::Error;

/// Rejections raised before any network call. They never mutate the timeline.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("message has neither text nor attachment")]
    EmptyMessage,
    #[error("attachment is {size} bytes; the limit is {limit} bytes")]
    AttachmentTooLarge { size: u64, limit: u64 },
    #[error("attachment type {0} is not supported; use an image (JPG, PNG, GIF, WEBP) or PDF")]
    UnsupportedAttachmentType(String),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("push transport negotiation failed over {transport}: {reason}")]
    Negotiation {
        transport: &'static str,
        reason: String,
    },
    #[error("push transport closed")]
    Closed,
    #[error("push transport gave up after {attempts} reconnect attempts")]
    Exhausted { attempts: u32 },
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("network request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("server rejected request: {0}")]
    Api(#[from] ApiError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("invalid server payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("server accepted the message but returned no record")]
    MissingConfirmation,
    #[error("no conversation is active")]
    NoActiveConversation,
    #[error("conversation {0} is local-only and never reaches the network")]
    LocalOnlyConversation(String),
}

impl SyncError {
    /// True for failures of a single network operation; the timeline stays consistent.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Api(_) | Self::Transport(_) | Self::MissingConfirmation
        )
    }
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;
