//! Async seam between the app and the server API.

use async_trait::async_trait;

use opencode_api::{
    ApiError, CancellationSignal, EventStream, MessageWithParts, OpencodeClient, Session,
};

/// Remote operations the client consumes.
///
/// Implementations must be shareable with the subscription task, hence the
/// `Send + Sync + 'static` bound.
#[async_trait]
pub trait SessionApi: Send + Sync + 'static {
    async fn list_sessions(&self) -> Result<Vec<Session>, ApiError>;

    async fn session_messages(&self, session_id: &str) -> Result<Vec<MessageWithParts>, ApiError>;

    /// Open the global event stream. The returned stream is independent of `self`.
    async fn subscribe_events(
        &self,
        cancellation: &CancellationSignal,
    ) -> Result<EventStream, ApiError>;
}

#[async_trait]
impl SessionApi for OpencodeClient {
    async fn list_sessions(&self) -> Result<Vec<Session>, ApiError> {
        OpencodeClient::list_sessions(self).await
    }

    async fn session_messages(&self, session_id: &str) -> Result<Vec<MessageWithParts>, ApiError> {
        OpencodeClient::session_messages(self, session_id).await
    }

    async fn subscribe_events(
        &self,
        cancellation: &CancellationSignal,
    ) -> Result<EventStream, ApiError> {
        OpencodeClient::subscribe_events(self, Some(cancellation)).await
    }
}
