//! matrix-sdk implementation of the bridge transport.

use core::time::Duration;
use std::sync::{Arc, Mutex};

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use bridge_core::{
    AuthError, Connection, Connector, InboundHandler, InboundMessage, MessageContent, RemoteError,
    RemoteRoom,
};
use matrix_sdk::{
    Client, LoopCtrl, SessionMeta,
    authentication::{SessionTokens, matrix::MatrixSession},
    config::SyncSettings,
    room::Room,
    ruma::{
        RoomOrAliasId,
        events::room::message::{MessageType, OriginalSyncRoomMessageEvent, RoomMessageEventContent},
    },
};
use reqwest::Url;
use serde::Deserialize;
use tokio::{sync::OnceCell, task::JoinHandle};
use tracing::{debug, info, warn};

const SYNC_TIMEOUT: Duration = Duration::from_secs(30);
const SYNC_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct WhoAmI {
    user_id: String,
    #[serde(default)]
    device_id: Option<String>,
}

/// Builds matrix-sdk clients for one homeserver.
#[derive(Debug, Clone)]
pub(crate) struct MatrixConnector {
    homeserver: Url,
    verify_ssl: bool,
    device_name: String,
    http: reqwest::Client,
}

impl MatrixConnector {
    pub(crate) fn new(homeserver: Url, verify_ssl: bool, device_name: String) -> Result<Self> {
        if !verify_ssl {
            warn!(homeserver = %homeserver, "TLS certificate verification is disabled");
        }
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(!verify_ssl)
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            homeserver,
            verify_ssl,
            device_name,
            http,
        })
    }

    async fn client(&self) -> Result<Client, AuthError> {
        let mut builder = Client::builder().homeserver_url(self.homeserver.as_str());
        if !self.verify_ssl {
            builder = builder.disable_ssl_verification();
        }
        builder
            .build()
            .await
            .map_err(|e| AuthError::new(0, format!("building matrix client: {e}")))
    }

    /// Validates a token and learns its device, which restoring a session
    /// requires.
    async fn whoami(&self, token: &str) -> Result<WhoAmI, AuthError> {
        let url = self
            .homeserver
            .join("_matrix/client/v3/account/whoami")
            .map_err(|e| AuthError::new(0, e.to_string()))?;
        let resp = self
            .http
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| AuthError::new(0, e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AuthError::new(status.as_u16(), body));
        }
        resp.json()
            .await
            .map_err(|e| AuthError::new(status.as_u16(), format!("unexpected whoami response: {e}")))
    }
}

#[async_trait]
impl Connector for MatrixConnector {
    async fn login_with_token(
        &self,
        identity: &str,
        token: &str,
    ) -> Result<Arc<dyn Connection>, AuthError> {
        let whoami = self.whoami(token).await?;
        if whoami.user_id != identity {
            warn!(
                configured = %identity,
                whoami = %whoami.user_id,
                "Stored token belongs to a different user"
            );
            return Err(AuthError::new(
                401,
                format!("token belongs to {}", whoami.user_id),
            ));
        }
        let device_id = whoami
            .device_id
            .ok_or_else(|| AuthError::new(0, "whoami response did not include device_id"))?;

        let client = self.client().await?;
        let session = MatrixSession {
            meta: SessionMeta {
                user_id: whoami
                    .user_id
                    .parse()
                    .map_err(|e| AuthError::new(0, format!("invalid user_id: {e}")))?,
                device_id: device_id.into(),
            },
            tokens: SessionTokens {
                access_token: token.to_owned(),
                refresh_token: None,
            },
        };
        client
            .restore_session(session)
            .await
            .map_err(|e| auth_error(&e))?;
        Ok(Arc::new(MatrixConnection::new(client, identity)))
    }

    async fn login_with_password(
        &self,
        identity: &str,
        password: &str,
    ) -> Result<Arc<dyn Connection>, AuthError> {
        let client = self.client().await?;
        info!(user = %identity, "Logging in with password");
        let response = client
            .matrix_auth()
            .login_username(identity, password)
            .initial_device_display_name(&self.device_name)
            .send()
            .await
            .map_err(|e| auth_error(&e))?;
        info!(user = %response.user_id, device = %response.device_id, "Logged in");
        Ok(Arc::new(MatrixConnection::new(client, identity)))
    }
}

fn remote_error(err: &matrix_sdk::Error) -> RemoteError {
    let code = err
        .as_client_api_error()
        .map_or(0, |api| api.status_code.as_u16());
    RemoteError::new(code, err.to_string())
}

fn auth_error(err: &matrix_sdk::Error) -> AuthError {
    remote_error(err).into()
}

pub(crate) struct MatrixConnection {
    client: Client,
    user_id: String,
    /// `next_batch` of the first sync; listening continues from here.
    initial_sync: OnceCell<String>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl core::fmt::Debug for MatrixConnection {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MatrixConnection")
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}

impl MatrixConnection {
    fn new(client: Client, user_id: &str) -> Self {
        Self {
            client,
            user_id: user_id.to_owned(),
            initial_sync: OnceCell::new(),
            listener: Mutex::new(None),
        }
    }

    /// Without one sync the client does not know which rooms it is in.
    async fn ensure_synced(&self) -> Result<&str, matrix_sdk::Error> {
        self.initial_sync
            .get_or_try_init(|| async {
                debug!("Running initial sync");
                let response = self.client.sync_once(SyncSettings::default()).await?;
                Ok(response.next_batch)
            })
            .await
            .map(String::as_str)
    }
}

#[async_trait]
impl Connection for MatrixConnection {
    fn user_id(&self) -> &str {
        &self.user_id
    }

    fn access_token(&self) -> Option<String> {
        self.client.access_token()
    }

    async fn joined_rooms(&self) -> Vec<Arc<dyn RemoteRoom>> {
        if let Err(e) = self.ensure_synced().await {
            warn!(error = %e, "Initial sync failed; joined rooms may be incomplete");
        }
        self.client
            .joined_rooms()
            .into_iter()
            .map(|room| Arc::new(MatrixRoom::new(room)) as Arc<dyn RemoteRoom>)
            .collect()
    }

    async fn join_room(&self, room_ref: &str) -> Result<Arc<dyn RemoteRoom>, RemoteError> {
        let target = RoomOrAliasId::parse(room_ref).map_err(|e| {
            RemoteError::transport(format!(
                "invalid room reference (expect !room_id or #alias): {e}"
            ))
        })?;
        let room = self
            .client
            .join_room_by_id_or_alias(&target, &[])
            .await
            .map_err(|e| remote_error(&e))?;
        Ok(Arc::new(MatrixRoom::new(room)))
    }

    async fn start_listening(&self, handler: Arc<dyn InboundHandler>) -> Result<()> {
        let since = self
            .ensure_synced()
            .await
            .context("initial sync before listening")?
            .to_owned();

        let message_handler = Arc::clone(&handler);
        self.client.add_event_handler(
            move |ev: OriginalSyncRoomMessageEvent, room: Room| {
                let handler = Arc::clone(&message_handler);
                async move {
                    let message = inbound_message(&ev, &room);
                    debug!(
                        room_id = %message.room_id,
                        sender = %message.sender,
                        body = ?message.body().map(|b| truncate(b, 200)),
                        "Incoming message"
                    );
                    handler.on_message(message).await;
                }
            },
        );

        let client = self.client.clone();
        let task = tokio::spawn(async move {
            let settings = SyncSettings::default().token(since).timeout(SYNC_TIMEOUT);
            let result = client
                .sync_with_result_callback(settings, |sync_result| {
                    let handler = Arc::clone(&handler);
                    async move {
                        if let Err(e) = sync_result {
                            handler.on_listener_error(&e);
                            tokio::time::sleep(SYNC_RETRY_DELAY).await;
                        }
                        Ok(LoopCtrl::Continue)
                    }
                })
                .await;
            if let Err(e) = result {
                warn!(error = %e, "Sync loop terminated");
            }
        });

        let previous = self
            .listener
            .lock()
            .map_err(|_| anyhow::anyhow!("listener lock poisoned"))?
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
        info!(timeout_secs = SYNC_TIMEOUT.as_secs(), "Listening for room messages");
        Ok(())
    }

    async fn stop_listening(&self) {
        let task = match self.listener.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(task) = task {
            task.abort();
            debug!("Sync task aborted");
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

fn inbound_message(ev: &OriginalSyncRoomMessageEvent, room: &Room) -> InboundMessage {
    let content = match &ev.content.msgtype {
        MessageType::Text(t) => MessageContent::Text(t.body.clone()),
        other => MessageContent::Other(other.msgtype().to_owned()),
    };
    InboundMessage {
        room_id: room.room_id().to_string(),
        sender: ev.sender.to_string(),
        content,
    }
}

pub(crate) struct MatrixRoom {
    room: Room,
    room_id: String,
}

impl core::fmt::Debug for MatrixRoom {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MatrixRoom")
            .field("room_id", &self.room_id)
            .finish_non_exhaustive()
    }
}

impl MatrixRoom {
    fn new(room: Room) -> Self {
        let room_id = room.room_id().to_string();
        Self { room, room_id }
    }
}

#[async_trait]
impl RemoteRoom for MatrixRoom {
    fn room_id(&self) -> &str {
        &self.room_id
    }

    async fn fetch_aliases(&self) -> Result<Vec<String>, RemoteError> {
        let mut aliases: Vec<String> = self
            .room
            .canonical_alias()
            .into_iter()
            .map(|alias| alias.to_string())
            .collect();
        aliases.extend(self.room.alt_aliases().iter().map(ToString::to_string));
        debug!(room_id = %self.room_id, aliases = ?aliases, "Fetched room aliases");
        Ok(aliases)
    }

    async fn send_text(&self, body: &str) -> Result<(), RemoteError> {
        let response = self
            .room
            .send(RoomMessageEventContent::text_plain(body))
            .await
            .map_err(|e| remote_error(&e))?;
        debug!(room_id = %self.room_id, event_id = %response.event_id, "Sent message");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_counts_chars_not_bytes() {
        assert_eq!(truncate("héllo wörld", 5), "héllo");
        assert_eq!(truncate("ok", 200), "ok");
    }
}
