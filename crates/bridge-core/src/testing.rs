//! In-memory transport used by the engine tests.

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use anyhow::Result;
use async_trait::async_trait;

use crate::{
    command::CommandEvent,
    dispatcher::EventSink,
    error::{AuthError, RemoteError},
    transport::{Connection, Connector, InboundHandler, RemoteRoom},
};

#[derive(Debug)]
pub struct FakeRoom {
    id: String,
    aliases: Vec<String>,
    pub alias_fetches: AtomicUsize,
    pub sent: Mutex<Vec<String>>,
    reject_sends: bool,
}

impl FakeRoom {
    pub fn new(id: &str, aliases: &[&str]) -> Self {
        Self {
            id: id.to_owned(),
            aliases: aliases.iter().map(|a| (*a).to_owned()).collect(),
            alias_fetches: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
            reject_sends: false,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.reject_sends = true;
        self
    }

    pub fn fetches(&self) -> usize {
        self.alias_fetches.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteRoom for FakeRoom {
    fn room_id(&self) -> &str {
        &self.id
    }

    async fn fetch_aliases(&self) -> Result<Vec<String>, RemoteError> {
        self.alias_fetches.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        Ok(self.aliases.clone())
    }

    async fn send_text(&self, body: &str) -> Result<(), RemoteError> {
        if self.reject_sends {
            return Err(RemoteError::new(403, "M_FORBIDDEN: cannot post here"));
        }
        self.sent.lock().unwrap().push(body.to_owned());
        Ok(())
    }
}

/// A homeserver with some rooms already joined and some joinable ones.
#[derive(Default)]
pub struct FakeConnection {
    user_id: String,
    token: Option<String>,
    joined: Mutex<Vec<Arc<FakeRoom>>>,
    /// Rooms that exist on the server, keyed by every ref that reaches them.
    directory: Mutex<HashMap<String, Arc<FakeRoom>>>,
    pub join_calls: AtomicUsize,
    pub listening: AtomicBool,
    pub stop_calls: AtomicUsize,
    pub handler: Mutex<Option<Arc<dyn InboundHandler>>>,
    fail_next_listen: AtomicBool,
}

impl FakeConnection {
    pub fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_owned(),
            ..Self::default()
        }
    }

    pub fn with_token(mut self, token: &str) -> Self {
        self.token = Some(token.to_owned());
        self
    }

    pub fn already_joined(self, room: &Arc<FakeRoom>) -> Self {
        self.joined.lock().unwrap().push(Arc::clone(room));
        self
    }

    pub fn joinable(self, room: &Arc<FakeRoom>) -> Self {
        {
            let mut directory = self.directory.lock().unwrap();
            directory.insert(room.id.clone(), Arc::clone(room));
            for alias in &room.aliases {
                directory.insert(alias.clone(), Arc::clone(room));
            }
        }
        self
    }

    /// The first `start_listening` fails as if the initial sync timed out.
    pub fn failing_first_listen(self) -> Self {
        self.fail_next_listen.store(true, Ordering::SeqCst);
        self
    }

    pub fn joins(&self) -> usize {
        self.join_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connection for FakeConnection {
    fn user_id(&self) -> &str {
        &self.user_id
    }

    fn access_token(&self) -> Option<String> {
        self.token.clone()
    }

    async fn joined_rooms(&self) -> Vec<Arc<dyn RemoteRoom>> {
        self.joined
            .lock()
            .unwrap()
            .iter()
            .map(|r| Arc::clone(r) as Arc<dyn RemoteRoom>)
            .collect()
    }

    async fn join_room(&self, room_ref: &str) -> Result<Arc<dyn RemoteRoom>, RemoteError> {
        self.join_calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        let room = self
            .directory
            .lock()
            .unwrap()
            .get(room_ref)
            .cloned()
            .ok_or_else(|| RemoteError::new(404, "M_NOT_FOUND: No known servers"))?;
        let mut joined = self.joined.lock().unwrap();
        if joined.iter().any(|r| r.id == room.id) {
            return Err(RemoteError::transport("joined an already joined room"));
        }
        joined.push(Arc::clone(&room));
        Ok(room)
    }

    async fn start_listening(&self, handler: Arc<dyn InboundHandler>) -> Result<()> {
        if self.fail_next_listen.swap(false, Ordering::SeqCst) {
            anyhow::bail!("initial sync timed out");
        }
        *self.handler.lock().unwrap() = Some(handler);
        self.listening.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_listening(&self) {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.listening.store(false, Ordering::SeqCst);
    }
}

/// Scripted login outcomes plus call counters.
#[derive(Debug, Default)]
pub struct FakeConnector {
    pub valid_token: Option<String>,
    pub valid_password: Option<String>,
    pub issued_token: String,
    pub token_logins: AtomicUsize,
    pub password_logins: AtomicUsize,
}

#[async_trait]
impl Connector for FakeConnector {
    async fn login_with_token(
        &self,
        identity: &str,
        token: &str,
    ) -> Result<Arc<dyn Connection>, AuthError> {
        self.token_logins.fetch_add(1, Ordering::SeqCst);
        if self.valid_token.as_deref() == Some(token) {
            Ok(Arc::new(FakeConnection::new(identity).with_token(token)))
        } else {
            Err(AuthError::new(401, "M_UNKNOWN_TOKEN: Invalid access token passed."))
        }
    }

    async fn login_with_password(
        &self,
        identity: &str,
        password: &str,
    ) -> Result<Arc<dyn Connection>, AuthError> {
        self.password_logins.fetch_add(1, Ordering::SeqCst);
        if self.valid_password.as_deref() == Some(password) {
            Ok(Arc::new(
                FakeConnection::new(identity).with_token(&self.issued_token),
            ))
        } else {
            Err(AuthError::new(403, "M_FORBIDDEN: Invalid password"))
        }
    }
}

/// Collects every emitted event; optionally fails each emit.
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub events: Mutex<Vec<(String, CommandEvent)>>,
    pub fail: bool,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<CommandEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|(_, e)| e.clone())
            .collect()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn emit(&self, name: &str, event: &CommandEvent) -> Result<()> {
        self.events
            .lock()
            .unwrap()
            .push((name.to_owned(), event.clone()));
        if self.fail {
            anyhow::bail!("bus unavailable");
        }
        Ok(())
    }
}
