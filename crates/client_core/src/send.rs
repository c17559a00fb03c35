//! Compose action to optimistic entry to confirmed record.

use std::{collections::HashMap, time::Duration};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use shared::{
    attachment::{infer_mime_type, is_allowed_mime_type},
    domain::{Attachment, Message, MessageId, MessageOrigin, PendingSend, ProfileId},
};
use tokio::time::Instant;
use tracing::debug;

use crate::{
    api::{EncodedAttachment, SendRequest},
    error::ValidationError,
};

/// A file picked for sending, before encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentUpload {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl AttachmentUpload {
    /// Builds an upload, guessing the type from the file name when `mime_type` is empty.
    pub fn new(file_name: impl Into<String>, mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        let file_name = file_name.into();
        let mut mime_type = mime_type.into();
        if mime_type.trim().is_empty() {
            mime_type = infer_mime_type(&file_name);
        }
        Self {
            file_name,
            mime_type,
            bytes,
        }
    }

    pub fn size_bytes(&self) -> u64 {
        self.bytes.len() as u64
    }
}

#[derive(Debug, Clone)]
pub struct PreparedSend {
    pub pending: PendingSend,
    pub optimistic: Message,
    pub request: SendRequest,
}

pub struct SendPipeline {
    max_attachment_bytes: u64,
    settle_window: Duration,
    pending: HashMap<MessageId, PendingSend>,
    settling: HashMap<MessageId, Instant>,
}

impl SendPipeline {
    pub fn new(max_attachment_bytes: u64, settle_window: Duration) -> Self {
        Self {
            max_attachment_bytes,
            settle_window,
            pending: HashMap::new(),
            settling: HashMap::new(),
        }
    }

    /// Rejects a compose action before anything is inserted or sent. Returns the trimmed body.
    pub fn validate(
        &self,
        body: &str,
        attachment: Option<&AttachmentUpload>,
    ) -> Result<String, ValidationError> {
        let body = body.trim();
        let Some(attachment) = attachment.filter(|upload| !upload.bytes.is_empty()) else {
            if body.is_empty() {
                return Err(ValidationError::EmptyMessage);
            }
            return Ok(body.to_string());
        };

        if attachment.size_bytes() > self.max_attachment_bytes {
            return Err(ValidationError::AttachmentTooLarge {
                size: attachment.size_bytes(),
                limit: self.max_attachment_bytes,
            });
        }
        if !is_allowed_mime_type(&attachment.mime_type) {
            return Err(ValidationError::UnsupportedAttachmentType(
                attachment.mime_type.clone(),
            ));
        }
        Ok(body.to_string())
    }

    /// Validates and builds everything one send needs. The pending entry is tracked until
    /// [`confirm`](Self::confirm), [`fail`](Self::fail) or a conversation switch.
    pub fn prepare(
        &mut self,
        peer: &ProfileId,
        viewer: &ProfileId,
        body: &str,
        attachment: Option<AttachmentUpload>,
        now: DateTime<Utc>,
    ) -> Result<PreparedSend, ValidationError> {
        let body = self.validate(body, attachment.as_ref())?;
        let encoded = attachment
            .filter(|upload| !upload.bytes.is_empty())
            .map(|upload| EncodedAttachment {
                data_url: format!("data:{};base64,{}", upload.mime_type, STANDARD.encode(&upload.bytes)),
                size_bytes: upload.size_bytes(),
                mime_type: upload.mime_type,
                file_name: upload.file_name,
            });
        let local_attachment = encoded.as_ref().map(|encoded| Attachment {
            url: encoded.data_url.clone(),
            mime_type: encoded.mime_type.clone(),
            file_name: Some(encoded.file_name.clone()),
            file_size_bytes: Some(encoded.size_bytes),
        });

        let provisional_id = MessageId::provisional();
        let pending = PendingSend {
            provisional_id: provisional_id.clone(),
            conversation_id: peer.clone(),
            body: body.clone(),
            attachment: local_attachment.clone(),
            created_at: now,
        };
        let optimistic = Message {
            id: provisional_id.clone(),
            conversation_id: peer.clone(),
            sender_id: viewer.clone(),
            body: body.clone(),
            attachment: local_attachment,
            created_at: now,
            seen: false,
            origin: MessageOrigin::Optimistic,
        };
        let request = SendRequest {
            peer: peer.clone(),
            sender: viewer.clone(),
            body,
            attachment: encoded,
        };

        self.pending.insert(provisional_id, pending.clone());
        Ok(PreparedSend {
            pending,
            optimistic,
            request,
        })
    }

    /// Resolves a pending send and opens the settling window for its confirmed id.
    pub fn confirm(
        &mut self,
        provisional: &MessageId,
        confirmed: &MessageId,
        now: Instant,
    ) -> Option<PendingSend> {
        self.prune(now);
        self.settling.insert(confirmed.clone(), now + self.settle_window);
        self.pending.remove(provisional)
    }

    pub fn fail(&mut self, provisional: &MessageId) -> Option<PendingSend> {
        self.pending.remove(provisional)
    }

    /// True while a push event for `id` should be treated as already applied.
    pub fn is_settling(&mut self, id: &MessageId, now: Instant) -> bool {
        self.prune(now);
        self.settling.contains_key(id)
    }

    pub fn is_pending(&self, provisional: &MessageId) -> bool {
        self.pending.contains_key(provisional)
    }

    /// Drops every pending send; their results will land on a conversation that is gone.
    pub fn discard_pending(&mut self) -> usize {
        let discarded = self.pending.len();
        self.pending.clear();
        if discarded > 0 {
            debug!(discarded, "send: discarded pending sends on conversation switch");
        }
        discarded
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn prune(&mut self, now: Instant) {
        self.settling.retain(|_, until| *until > now);
    }
}

#[cfg(test)]
#[path = "tests/send_tests.rs"]
mod tests;
