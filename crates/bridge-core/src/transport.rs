use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::error;

use crate::error::{AuthError, RemoteError};

/// Produces authenticated connections to a homeserver.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn login_with_token(
        &self,
        identity: &str,
        token: &str,
    ) -> Result<Arc<dyn Connection>, AuthError>;

    async fn login_with_password(
        &self,
        identity: &str,
        password: &str,
    ) -> Result<Arc<dyn Connection>, AuthError>;
}

/// A live, authenticated session with the homeserver.
#[async_trait]
pub trait Connection: Send + Sync {
    fn user_id(&self) -> &str;

    /// Session token currently in use; persisted after a password login.
    fn access_token(&self) -> Option<String>;

    /// Every room this session is currently joined to.
    async fn joined_rooms(&self) -> Vec<Arc<dyn RemoteRoom>>;

    /// Joins by room ID or alias. Must never be called for a room that is
    /// already joined.
    async fn join_room(&self, room_ref: &str) -> Result<Arc<dyn RemoteRoom>, RemoteError>;

    /// Starts delivering inbound room messages to `handler` in the background.
    async fn start_listening(&self, handler: Arc<dyn InboundHandler>) -> Result<()>;

    async fn stop_listening(&self);
}

#[async_trait]
pub trait RemoteRoom: Send + Sync {
    /// Canonical room ID.
    fn room_id(&self) -> &str;

    /// Remote lookup of every alias that points at this room.
    async fn fetch_aliases(&self) -> Result<Vec<String>, RemoteError>;

    async fn send_text(&self, body: &str) -> Result<(), RemoteError>;
}

/// Receives everything the background listener delivers.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn on_message(&self, message: InboundMessage);

    /// Listener failures never stop the listener; the default only logs.
    fn on_listener_error(&self, err: &dyn core::error::Error) {
        error!(error = %err, "Matrix listener error");
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageContent {
    Text(String),
    /// Any other `msgtype`, kept only for diagnostics.
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub room_id: String,
    pub sender: String,
    pub content: MessageContent,
}

impl InboundMessage {
    pub fn text(
        room_id: impl Into<String>,
        sender: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            room_id: room_id.into(),
            sender: sender.into(),
            content: MessageContent::Text(body.into()),
        }
    }

    #[must_use]
    pub fn body(&self) -> Option<&str> {
        match &self.content {
            MessageContent::Text(body) => Some(body),
            MessageContent::Other(_) => None,
        }
    }
}
