use core::sync::atomic::{AtomicBool, Ordering};
use std::{collections::HashMap, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, error, info, trace, warn};

use crate::{
    command::{COMMAND_EVENT, CommandEvent, CommandRouter},
    error::{RoomJoinError, SendError},
    resolver::RoomResolver,
    transport::{Connection, InboundHandler, InboundMessage},
};

/// Where command events go: the host's event bus.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, name: &str, event: &CommandEvent) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct StartReport {
    /// Configured refs that are now bound, with their canonical room IDs.
    pub joined: Vec<(String, String)>,
    pub failed: Vec<RoomJoinError>,
}

#[derive(Debug, Default)]
pub struct SendReport {
    pub delivered: Vec<String>,
    pub failed: Vec<SendError>,
}

impl SendReport {
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct MessageDispatcher {
    listening_rooms: Vec<String>,
    router: Arc<CommandRouter>,
    resolver: RoomResolver,
    connection: Arc<dyn Connection>,
    sink: Arc<dyn EventSink>,
    /// Canonical room ID -> configured refs routed for that room.
    bindings: RwLock<HashMap<String, Vec<String>>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl core::fmt::Debug for MessageDispatcher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MessageDispatcher")
            .field("listening_rooms", &self.listening_rooms)
            .field("router", &self.router)
            .field("started", &self.started)
            .field("stopped", &self.stopped)
            .finish_non_exhaustive()
    }
}

impl MessageDispatcher {
    pub fn new(
        connection: Arc<dyn Connection>,
        router: Arc<CommandRouter>,
        listening_rooms: Vec<String>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            listening_rooms,
            router,
            resolver: RoomResolver::new(Arc::clone(&connection)),
            connection,
            sink,
            bindings: RwLock::new(HashMap::new()),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    /// Starts the listener and joins every listening room. A room that
    /// cannot be joined is logged and skipped; the others keep working. If
    /// the listener itself fails to start, nothing is joined and the call
    /// can be repeated.
    pub async fn start(self: &Arc<Self>) -> Result<StartReport> {
        if self.started.swap(true, Ordering::SeqCst) {
            debug!("Dispatcher already started, nothing to do");
            return Ok(StartReport::default());
        }

        let handler: Arc<dyn InboundHandler> = Arc::clone(self) as Arc<dyn InboundHandler>;
        if let Err(e) = self.connection.start_listening(handler).await {
            // Not started; a later call may try again.
            self.started.store(false, Ordering::SeqCst);
            return Err(e);
        }

        let mut report = StartReport::default();
        for room_ref in &self.listening_rooms {
            match self.resolver.resolve_or_join(room_ref).await {
                Ok(room) => {
                    let room_id = room.room_id().to_owned();
                    self.bind(&room_id, room_ref).await;
                    report.joined.push((room_ref.clone(), room_id));
                }
                Err(e) => {
                    error!(room = %e.room, code = e.code, error = %e.message, "Could not join room");
                    report.failed.push(e);
                }
            }
        }
        info!(
            joined = report.joined.len(),
            failed = report.failed.len(),
            "Listening rooms ready"
        );
        Ok(report)
    }

    async fn bind(&self, room_id: &str, room_ref: &str) {
        let mut bindings = self.bindings.write().await;
        let refs = bindings.entry(room_id.to_owned()).or_default();
        if !refs.iter().any(|r| r == room_ref) {
            refs.push(room_ref.to_owned());
        }
    }

    /// Routes one inbound message for every ref bound to its room and emits
    /// the resulting events. Messages from unbound rooms are dropped.
    pub async fn route_message(&self, message: &InboundMessage) {
        let refs = self
            .bindings
            .read()
            .await
            .get(&message.room_id)
            .cloned()
            .unwrap_or_default();
        if refs.is_empty() {
            trace!(room_id = %message.room_id, "Message from unbound room");
            return;
        }

        for room_ref in refs {
            for event in self.router.route(&room_ref, message) {
                info!(command = %event.command, room = %event.room, sender = %event.sender, "Command matched");
                if let Err(e) = self.sink.emit(COMMAND_EVENT, &event).await {
                    warn!(command = %event.command, error = %e, "Emitting command event failed");
                }
            }
        }
    }

    /// Sends `message` to every target. Failures are logged per target and
    /// collected in the report; they never stop the remaining sends.
    pub async fn send(&self, message: &str, targets: &[String]) -> SendReport {
        let mut report = SendReport::default();
        for target in targets {
            match self.send_one(message, target).await {
                Ok(()) => {
                    debug!(room = %target, "Message delivered");
                    report.delivered.push(target.clone());
                }
                Err(e) => {
                    error!(
                        room = %e.target,
                        code = e.code,
                        error = %e.message,
                        "Unable to deliver message to room"
                    );
                    report.failed.push(e);
                }
            }
        }
        report
    }

    async fn send_one(&self, message: &str, target: &str) -> Result<(), SendError> {
        let room = self.resolver.resolve_or_join(target).await?;
        room.send_text(message)
            .await
            .map_err(|e| SendError::new(target, e))
    }

    /// Stops the listener. Safe to call more than once.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.connection.stop_listening().await;
        info!("Listener stopped");
    }
}

#[async_trait]
impl InboundHandler for MessageDispatcher {
    async fn on_message(&self, message: InboundMessage) {
        self.route_message(&message).await;
    }
}
