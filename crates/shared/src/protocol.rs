use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    attachment::attachment_from_parts,
    domain::{Message, MessageId, MessageOrigin, ProfileId},
};

/// Query string of the history endpoint. Pages are 1-based, newest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryQuery {
    pub page: u32,
    pub limit: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRequestBody {
    pub sender_id: ProfileId,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    #[serde(default)]
    pub total_pages: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryResponse {
    #[serde(default)]
    pub messages: Vec<WireMessage>,
    #[serde(default)]
    pub pagination: Pagination,
}

/// A persisted message as the REST endpoints return it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    #[serde(rename = "_id", alias = "id")]
    pub id: String,
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub seen: bool,
}

impl WireMessage {
    /// Converts into a timeline entry of the conversation with `peer`.
    pub fn into_message(self, peer: &ProfileId, origin: MessageOrigin) -> Message {
        Message {
            id: MessageId(self.id),
            conversation_id: peer.clone(),
            sender_id: ProfileId(self.sender_id),
            body: self.message.unwrap_or_default(),
            attachment: attachment_from_parts(
                self.image,
                self.file_type,
                self.file_name,
                self.file_size,
            ),
            created_at: self.created_at,
            seen: self.seen,
            origin,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageBody {
    pub sender_id: ProfileId,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
}

/// Send response. Current servers answer `{ success, newMessage }`; older ones put the
/// record under `message`, which on failure is a plain error string instead.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_message: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Value>,
}

impl SendMessageResponse {
    pub fn into_confirmed(self) -> Result<Option<WireMessage>, serde_json::Error> {
        let record = match (self.new_message, self.message) {
            (Some(record), _) => record,
            (None, Some(record)) if record.is_object() => record,
            _ => return Ok(None),
        };
        serde_json::from_value(record).map(Some)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeenRequestBody {
    pub viewer_id: ProfileId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushSessionResponse {
    pub session_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageMetadata {
    #[serde(default)]
    pub file_type: Option<String>,
    #[serde(default)]
    pub original_file_name: Option<String>,
    #[serde(default)]
    pub file_size: Option<u64>,
}

/// Inbound `receiveMessage` payload. Every field is optional on the wire and several
/// generations of the backend used different names for the same thing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushMessage {
    #[serde(default, alias = "senderProfileId", alias = "sender")]
    pub sender_id: Option<String>,
    #[serde(default, alias = "receiverProfileId", alias = "receiver")]
    pub receiver_id: Option<String>,
    #[serde(default, alias = "text", alias = "content")]
    pub message: Option<String>,
    #[serde(default, alias = "imageUrl")]
    pub image: Option<String>,
    #[serde(default, alias = "_id", alias = "id")]
    pub message_id: Option<String>,
    #[serde(default, alias = "createdAt")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub file_type: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub file_size: Option<u64>,
    #[serde(default)]
    pub image_metadata: Option<ImageMetadata>,
    #[serde(default)]
    pub seen: bool,
}

/// Inbound `messageSeen` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeenAck {
    pub message_id: String,
    #[serde(default, alias = "receiverId")]
    pub viewer_id: Option<String>,
    #[serde(default)]
    pub seen_at: Option<DateTime<Utc>>,
}

/// One frame on the push transport, in either direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum PushFrame {
    #[serde(rename = "receiveMessage")]
    ReceiveMessage(PushMessage),
    #[serde(rename = "messageSeen")]
    MessageSeen(SeenAck),
    #[serde(rename = "registerUser")]
    RegisterUser(ProfileId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_message_accepts_legacy_field_names() {
        let raw = r#"{
            "event": "receiveMessage",
            "data": {
                "senderProfileId": "p-2",
                "receiverProfileId": "p-1",
                "text": "hello",
                "_id": "m-9",
                "createdAt": "2024-05-01T10:00:00Z",
                "imageMetadata": { "originalFileName": "scan.pdf", "fileSize": 42 }
            }
        }"#;
        let PushFrame::ReceiveMessage(message) = serde_json::from_str(raw).expect("frame") else {
            panic!("expected receiveMessage frame");
        };
        assert_eq!(message.sender_id.as_deref(), Some("p-2"));
        assert_eq!(message.receiver_id.as_deref(), Some("p-1"));
        assert_eq!(message.message.as_deref(), Some("hello"));
        assert_eq!(message.message_id.as_deref(), Some("m-9"));
        assert!(message.timestamp.is_some());
        let metadata = message.image_metadata.expect("metadata");
        assert_eq!(metadata.original_file_name.as_deref(), Some("scan.pdf"));
    }

    #[test]
    fn register_user_serializes_as_plain_profile_id() {
        let frame = PushFrame::RegisterUser(ProfileId::new("p-1"));
        assert_eq!(
            serde_json::to_string(&frame).expect("encode"),
            r#"{"event":"registerUser","data":"p-1"}"#
        );
    }

    #[test]
    fn send_response_reads_either_record_field() {
        let current: SendMessageResponse = serde_json::from_str(
            r#"{"success":true,"newMessage":{"_id":"m1","senderId":"a","message":"hi","createdAt":"2024-05-01T10:00:00Z"}}"#,
        )
        .expect("decode");
        assert_eq!(current.into_confirmed().expect("record").expect("some").id, "m1");

        let legacy: SendMessageResponse = serde_json::from_str(
            r#"{"success":true,"message":{"_id":"m2","senderId":"a","message":"hi","createdAt":"2024-05-01T10:00:00Z"}}"#,
        )
        .expect("decode");
        assert_eq!(legacy.into_confirmed().expect("record").expect("some").id, "m2");

        let failed: SendMessageResponse =
            serde_json::from_str(r#"{"success":false,"message":"receiver not found"}"#)
                .expect("decode");
        assert!(failed.into_confirmed().expect("no record").is_none());
    }

    #[test]
    fn wire_message_infers_attachment_type_from_url() {
        let wire: WireMessage = serde_json::from_str(
            r#"{"_id":"m1","senderId":"a","image":"https://cdn.example.com/r.pdf","createdAt":"2024-05-01T10:00:00Z"}"#,
        )
        .expect("decode");
        let message = wire.into_message(&ProfileId::new("a"), MessageOrigin::Fetched);
        let attachment = message.attachment.expect("attachment");
        assert_eq!(attachment.mime_type, "application/pdf");
        assert_eq!(attachment.file_name.as_deref(), Some("Document.pdf"));
        assert!(message.body.is_empty());
    }
}
