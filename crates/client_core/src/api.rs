use async_trait::async_trait;
use reqwest::{Client, Response};
use shared::{
    domain::{Message, MessageId, MessageOrigin, ProfileId},
    error::ApiError,
    protocol::{
        HistoryQuery, HistoryRequestBody, HistoryResponse, SeenRequestBody, SendMessageBody,
        SendMessageResponse,
    },
};

use crate::{
    config::SyncSettings,
    error::{SyncError, SyncResult},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRequest {
    pub peer: ProfileId,
    pub viewer: ProfileId,
    pub query: HistoryQuery,
}

#[derive(Debug, Clone)]
pub struct HistoryPage {
    pub messages: Vec<Message>,
    pub total_pages: u32,
}

/// Attachment as it goes over the wire: a base64 `data:` URL plus its metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedAttachment {
    pub data_url: String,
    pub mime_type: String,
    pub file_name: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRequest {
    pub peer: ProfileId,
    pub sender: ProfileId,
    pub body: String,
    pub attachment: Option<EncodedAttachment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeenRequest {
    pub message_id: MessageId,
    pub viewer: ProfileId,
}

/// The three durable request/response endpoints the engine depends on.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn fetch_history(&self, request: HistoryRequest) -> SyncResult<HistoryPage>;
    async fn send_message(&self, request: SendRequest) -> SyncResult<Message>;
    async fn mark_seen(&self, request: SeenRequest) -> SyncResult<()>;
}

pub struct HttpChatApi {
    http: Client,
    base_url: String,
}

impl HttpChatApi {
    pub fn new(settings: &SyncSettings) -> SyncResult<Self> {
        let http = Client::builder()
            .timeout(settings.request_timeout())
            .build()?;
        Ok(Self {
            http,
            base_url: settings.rest_base_url().to_string(),
        })
    }

    pub fn with_client(http: Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

async fn ensure_success(response: Response) -> SyncResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ApiError::from_response(status.as_u16(), &body).into())
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn fetch_history(&self, request: HistoryRequest) -> SyncResult<HistoryPage> {
        let response = self
            .http
            .post(format!("{}/user/all/{}", self.base_url, request.peer))
            .query(&request.query)
            .json(&HistoryRequestBody {
                sender_id: request.viewer.clone(),
            })
            .send()
            .await?;
        let body: HistoryResponse = ensure_success(response).await?.json().await?;

        let messages = body
            .messages
            .into_iter()
            .map(|wire| wire.into_message(&request.peer, MessageOrigin::Fetched))
            .collect();
        Ok(HistoryPage {
            messages,
            total_pages: body.pagination.total_pages,
        })
    }

    async fn send_message(&self, request: SendRequest) -> SyncResult<Message> {
        let (image, file_type, file_name, file_size) = match request.attachment {
            Some(attachment) => (
                Some(attachment.data_url),
                Some(attachment.mime_type),
                Some(attachment.file_name),
                Some(attachment.size_bytes),
            ),
            None => (None, None, None, None),
        };
        let response = self
            .http
            .post(format!("{}/user/send/{}", self.base_url, request.peer))
            .json(&SendMessageBody {
                sender_id: request.sender,
                message: request.body,
                image,
                file_type,
                file_name,
                file_size,
            })
            .send()
            .await?;
        let body: SendMessageResponse = ensure_success(response).await?.json().await?;

        match body.into_confirmed()? {
            Some(wire) => Ok(wire.into_message(&request.peer, MessageOrigin::Fetched)),
            None => Err(SyncError::MissingConfirmation),
        }
    }

    async fn mark_seen(&self, request: SeenRequest) -> SyncResult<()> {
        let response = self
            .http
            .put(format!(
                "{}/user/message/{}/seen",
                self.base_url, request.message_id
            ))
            .json(&SeenRequestBody {
                viewer_id: request.viewer,
            })
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
