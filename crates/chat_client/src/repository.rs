//! REST backend access for chats, messages and archives.

use async_trait::async_trait;
use reqwest::{
    header::ACCEPT,
    multipart::{Form, Part},
    Client, RequestBuilder, Response, StatusCode,
};
use serde::de::DeserializeOwned;
use shared::{
    domain::{MessageId, RoomId},
    error::ApiError,
    protocol::{
        DataEnvelope, MarkReadRequest, PaginatedMessages, ReportChatRequest, RoomMessages,
        SendMessageRequest, TypingStatusRequest, WireChat, WireMessage,
    },
};
use thiserror::Error;
use tracing::debug;

use crate::credentials::CredentialSource;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RepositoryError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("request failed with status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid response: {0}")]
    Decode(String),
}

/// File attached to an outgoing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileUpload {
    pub file_name: String,
    pub mime_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl FileUpload {
    pub fn new(file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            mime_type: None,
            bytes,
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }
}

#[async_trait]
pub trait ChatRepository: Send + Sync {
    async fn get_chats(&self, include_archived: bool) -> Result<Vec<WireChat>, RepositoryError>;
    async fn get_messages(&self, room_id: RoomId) -> Result<RoomMessages, RepositoryError>;
    async fn send_message(
        &self,
        room_id: RoomId,
        message: &str,
    ) -> Result<WireMessage, RepositoryError>;
    async fn send_file_message(
        &self,
        room_id: RoomId,
        file: FileUpload,
        caption: Option<&str>,
    ) -> Result<WireMessage, RepositoryError>;
    async fn mark_as_read(
        &self,
        room_id: RoomId,
        message_ids: &[MessageId],
    ) -> Result<(), RepositoryError>;
    async fn send_typing_status(&self, room_id: RoomId, is_typing: bool)
        -> Result<(), RepositoryError>;
    async fn get_archived_chats(&self) -> Result<Vec<WireChat>, RepositoryError>;
    async fn get_archived_messages(
        &self,
        room_id: RoomId,
        page: u32,
        per_page: u32,
    ) -> Result<PaginatedMessages, RepositoryError>;
    async fn report_archived_chat(&self, room_id: RoomId, reason: &str)
        -> Result<(), RepositoryError>;
    async fn export_archived_chat(&self, room_id: RoomId) -> Result<Vec<u8>, RepositoryError>;
}

/// Repository backed by the Laravel JSON API. Every request carries the
/// bearer token currently held by the credential source.
pub struct HttpChatRepository {
    http: Client,
    base_url: String,
    credentials: CredentialSource,
}

impl HttpChatRepository {
    pub fn new(base_url: impl Into<String>, credentials: CredentialSource) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn execute(&self, request: RequestBuilder) -> Result<Response, RepositoryError> {
        let credential = self
            .credentials
            .current()
            .ok_or_else(|| RepositoryError::Unauthorized("no credential available".into()))?;
        let res = request
            .bearer_auth(&credential.token)
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(|err| RepositoryError::Network(err.to_string()))?;

        let status = res.status();
        if status.is_success() {
            return Ok(res);
        }
        let body = res.text().await.unwrap_or_default();
        let api = ApiError::from_response(status.as_u16(), &body);
        debug!(status = status.as_u16(), "chat api: request rejected: {}", api.message);
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(RepositoryError::Unauthorized(api.message));
        }
        Err(RepositoryError::Status {
            status: status.as_u16(),
            message: api.message,
        })
    }

    async fn decode<T: DeserializeOwned>(res: Response) -> Result<T, RepositoryError> {
        res.json::<T>()
            .await
            .map_err(|err| RepositoryError::Decode(err.to_string()))
    }
}

#[async_trait]
impl ChatRepository for HttpChatRepository {
    async fn get_chats(&self, include_archived: bool) -> Result<Vec<WireChat>, RepositoryError> {
        let flag = if include_archived { "1" } else { "0" };
        let res = self
            .execute(
                self.http
                    .get(self.url("chats"))
                    .query(&[("include_archived", flag)]),
            )
            .await?;
        let body: DataEnvelope<Vec<WireChat>> = Self::decode(res).await?;
        Ok(body.data)
    }

    async fn get_messages(&self, room_id: RoomId) -> Result<RoomMessages, RepositoryError> {
        let res = self
            .execute(self.http.get(self.url(&format!("chats/{room_id}/messages"))))
            .await?;
        let body: DataEnvelope<RoomMessages> = Self::decode(res).await?;
        Ok(body.data)
    }

    async fn send_message(
        &self,
        room_id: RoomId,
        message: &str,
    ) -> Result<WireMessage, RepositoryError> {
        let res = self
            .execute(
                self.http
                    .post(self.url(&format!("chats/{room_id}/messages")))
                    .json(&SendMessageRequest {
                        message: message.to_string(),
                    }),
            )
            .await?;
        let body: DataEnvelope<WireMessage> = Self::decode(res).await?;
        Ok(body.data)
    }

    async fn send_file_message(
        &self,
        room_id: RoomId,
        file: FileUpload,
        caption: Option<&str>,
    ) -> Result<WireMessage, RepositoryError> {
        let mut part = Part::bytes(file.bytes).file_name(file.file_name);
        if let Some(mime_type) = file.mime_type.as_deref() {
            part = part.mime_str(mime_type).map_err(|err| RepositoryError::Status {
                status: 422,
                message: format!("invalid mime type '{mime_type}': {err}"),
            })?;
        }
        let mut form = Form::new().part("file", part);
        if let Some(caption) = caption {
            form = form.text("message", caption.to_string());
        }
        let res = self
            .execute(
                self.http
                    .post(self.url(&format!("chats/{room_id}/messages/file")))
                    .multipart(form),
            )
            .await?;
        let body: DataEnvelope<WireMessage> = Self::decode(res).await?;
        Ok(body.data)
    }

    async fn mark_as_read(
        &self,
        room_id: RoomId,
        message_ids: &[MessageId],
    ) -> Result<(), RepositoryError> {
        self.execute(
            self.http
                .post(self.url(&format!("chats/{room_id}/read")))
                .json(&MarkReadRequest {
                    message_ids: message_ids.to_vec(),
                }),
        )
        .await?;
        Ok(())
    }

    async fn send_typing_status(
        &self,
        room_id: RoomId,
        is_typing: bool,
    ) -> Result<(), RepositoryError> {
        self.execute(
            self.http
                .post(self.url(&format!("chats/{room_id}/typing")))
                .json(&TypingStatusRequest { is_typing }),
        )
        .await?;
        Ok(())
    }

    async fn get_archived_chats(&self) -> Result<Vec<WireChat>, RepositoryError> {
        let res = self
            .execute(self.http.get(self.url("chats/archived")))
            .await?;
        let body: DataEnvelope<Vec<WireChat>> = Self::decode(res).await?;
        Ok(body.data)
    }

    async fn get_archived_messages(
        &self,
        room_id: RoomId,
        page: u32,
        per_page: u32,
    ) -> Result<PaginatedMessages, RepositoryError> {
        let res = self
            .execute(
                self.http
                    .get(self.url(&format!("chats/archived/{room_id}/messages")))
                    .query(&[("page", page), ("per_page", per_page)]),
            )
            .await?;
        Self::decode(res).await
    }

    async fn report_archived_chat(
        &self,
        room_id: RoomId,
        reason: &str,
    ) -> Result<(), RepositoryError> {
        self.execute(
            self.http
                .post(self.url(&format!("chats/archived/{room_id}/report")))
                .json(&ReportChatRequest {
                    reason: reason.to_string(),
                }),
        )
        .await?;
        Ok(())
    }

    async fn export_archived_chat(&self, room_id: RoomId) -> Result<Vec<u8>, RepositoryError> {
        let res = self
            .execute(self.http.get(self.url(&format!("chats/archived/{room_id}/export"))))
            .await?;
        let bytes = res
            .bytes()
            .await
            .map_err(|err| RepositoryError::Network(err.to_string()))?;
        Ok(bytes.to_vec())
    }
}
