//! REST surface consumed by the engine.
//!
//! History pages, sends, reactions, and group moderation all go over HTTP;
//! the socket is receive-only. The traits here are the seam the controllers
//! depend on, so tests can script page sequences without a server.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::multipart;
use shared::domain::{MessageId, ReactionKind, RoomId};
use shared::error::ApiError;
use shared::protocol::{BlockMemberRequest, MessagePage, MessagePayload, ReactRequest};

use crate::compose::OutgoingMessage;
use crate::error::ClientError;
use crate::AuthProvider;

/// Cursor-paginated history access. `cursor = None` fetches the newest page;
/// `next_cursor` from a page points toward older history.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_page(
        &self,
        room_id: RoomId,
        cursor: Option<&str>,
    ) -> Result<MessagePage, ClientError>;
}

#[async_trait]
pub trait ChatApi: PageFetcher {
    /// Post a message. The returned payload is informational only: the
    /// authoritative materialization into the store happens via the socket
    /// echo carrying the same `client_key`.
    async fn send_message(
        &self,
        room_id: RoomId,
        outgoing: &OutgoingMessage,
    ) -> Result<MessagePayload, ClientError>;

    async fn react(
        &self,
        message_id: MessageId,
        reaction: ReactionKind,
    ) -> Result<(), ClientError>;

    async fn block_member(
        &self,
        room_id: RoomId,
        request: &BlockMemberRequest,
    ) -> Result<(), ClientError>;
}

pub struct HttpChatApi {
    http: reqwest::Client,
    server_url: String,
    auth: Arc<dyn AuthProvider>,
}

impl HttpChatApi {
    pub fn new(server_url: impl Into<String>, auth: Arc<dyn AuthProvider>) -> Self {
        Self {
            http: reqwest::Client::new(),
            server_url: server_url.into(),
            auth,
        }
    }

    fn bearer(&self) -> String {
        self.auth.bearer_token().unwrap_or_default()
    }
}

/// Convert a non-2xx response into the structured API error when the server
/// sent one, otherwise surface the transport-level failure.
async fn check(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status_err = response.error_for_status_ref().err();
    match response.json::<ApiError>().await {
        Ok(api_error) => Err(ClientError::Api(api_error)),
        Err(_) => match status_err {
            Some(err) => Err(ClientError::Fetch(err)),
            None => Err(ClientError::TransportUnavailable(
                "unreadable error response".to_string(),
            )),
        },
    }
}

#[async_trait]
impl PageFetcher for HttpChatApi {
    async fn fetch_page(
        &self,
        room_id: RoomId,
        cursor: Option<&str>,
    ) -> Result<MessagePage, ClientError> {
        let mut request = self
            .http
            .get(format!("{}/rooms/{}/messages/", self.server_url, room_id.0))
            .bearer_auth(self.bearer());
        if let Some(cursor) = cursor {
            request = request.query(&[("cursor", cursor)]);
        }
        let page = check(request.send().await?).await?.json().await?;
        Ok(page)
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn send_message(
        &self,
        room_id: RoomId,
        outgoing: &OutgoingMessage,
    ) -> Result<MessagePayload, ClientError> {
        let mut form = multipart::Form::new()
            .text("content", outgoing.content.clone())
            .text("client_key", outgoing.client_key.to_string());
        if !outgoing.mention_user_ids.is_empty() {
            let joined = outgoing
                .mention_user_ids
                .iter()
                .map(|id| id.0.to_string())
                .collect::<Vec<_>>()
                .join(",");
            form = form.text("mention_user_ids", joined);
        }
        for attachment in &outgoing.attachments {
            let part = multipart::Part::bytes(attachment.bytes.clone())
                .file_name(attachment.filename.clone());
            form = form.part("attachments", part);
        }

        let response = self
            .http
            .post(format!("{}/rooms/{}/send/", self.server_url, room_id.0))
            .bearer_auth(self.bearer())
            .multipart(form)
            .send()
            .await?;
        let message = check(response).await?.json().await?;
        Ok(message)
    }

    async fn react(
        &self,
        message_id: MessageId,
        reaction: ReactionKind,
    ) -> Result<(), ClientError> {
        let response = self
            .http
            .post(format!(
                "{}/messages/{}/react/",
                self.server_url, message_id.0
            ))
            .bearer_auth(self.bearer())
            .json(&ReactRequest { reaction })
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn block_member(
        &self,
        room_id: RoomId,
        request: &BlockMemberRequest,
    ) -> Result<(), ClientError> {
        let response = self
            .http
            .post(format!(
                "{}/rooms/{}/member/block/",
                self.server_url, room_id.0
            ))
            .bearer_auth(self.bearer())
            .json(request)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }
}
