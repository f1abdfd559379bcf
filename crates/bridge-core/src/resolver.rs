//! Join-or-get for room IDs and aliases.
//!
//! Joining a room the session is already in is never attempted: the room is
//! found first by canonical ID, then through aliases. Alias lookups are
//! remote calls, so each room's aliases are fetched once and cached.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    error::RoomJoinError,
    transport::{Connection, RemoteRoom},
};

#[derive(Clone)]
pub struct JoinedRoom {
    pub handle: Arc<dyn RemoteRoom>,
    pub aliases: HashSet<String>,
    pub aliases_fetched: bool,
}

impl core::fmt::Debug for JoinedRoom {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JoinedRoom")
            .field("room_id", &self.handle.room_id())
            .field("aliases", &self.aliases)
            .field("aliases_fetched", &self.aliases_fetched)
            .finish()
    }
}

impl JoinedRoom {
    fn new(handle: Arc<dyn RemoteRoom>) -> Self {
        Self {
            handle,
            aliases: HashSet::new(),
            aliases_fetched: false,
        }
    }
}

pub struct RoomResolver {
    connection: Arc<dyn Connection>,
    // One lock for the whole resolution so a ref is never joined twice.
    rooms: Mutex<HashMap<String, JoinedRoom>>,
}

impl core::fmt::Debug for RoomResolver {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RoomResolver")
            .field("user_id", &self.connection.user_id())
            .finish_non_exhaustive()
    }
}

impl RoomResolver {
    pub fn new(connection: Arc<dyn Connection>) -> Self {
        Self {
            connection,
            rooms: Mutex::new(HashMap::new()),
        }
    }

    pub async fn resolve_or_join(
        &self,
        room_ref: &str,
    ) -> Result<Arc<dyn RemoteRoom>, RoomJoinError> {
        let mut rooms = self.rooms.lock().await;

        // Rooms joined outside this resolver (earlier runs, invites) count too.
        for handle in self.connection.joined_rooms().await {
            rooms
                .entry(handle.room_id().to_owned())
                .or_insert_with(|| JoinedRoom::new(handle));
        }

        if let Some(room) = rooms.get(room_ref) {
            debug!(room = %room_ref, "Already in room");
            return Ok(Arc::clone(&room.handle));
        }

        for (room_id, room) in rooms.iter_mut() {
            if !room.aliases.contains(room_ref) && !room.aliases_fetched {
                match room.handle.fetch_aliases().await {
                    Ok(aliases) => room.aliases.extend(aliases),
                    Err(e) => {
                        warn!(room_id = %room_id, code = e.code, error = %e.message, "Fetching room aliases failed");
                    }
                }
                room.aliases_fetched = true;
            }
            if room.aliases.contains(room_ref) {
                debug!(room_id = %room_id, alias = %room_ref, "Already in room (known by alias)");
                return Ok(Arc::clone(&room.handle));
            }
        }

        let handle = self
            .connection
            .join_room(room_ref)
            .await
            .map_err(|e| RoomJoinError::new(room_ref, e))?;
        let room_id = handle.room_id().to_owned();
        info!(room_id = %room_id, known_as = %room_ref, "Joined room");

        let room = rooms
            .entry(room_id.clone())
            .or_insert_with(|| JoinedRoom::new(Arc::clone(&handle)));
        if room_id != room_ref {
            room.aliases.insert(room_ref.to_owned());
        }
        Ok(handle)
    }

    /// Forgets the cached aliases of one room so the next miss refetches them.
    pub async fn invalidate_aliases(&self, room_id: &str) {
        if let Some(room) = self.rooms.lock().await.get_mut(room_id) {
            room.aliases.clear();
            room.aliases_fetched = false;
        }
    }

    /// Snapshot of every room known to the resolver.
    #[cfg(test)]
    pub async fn joined(&self) -> Vec<JoinedRoom> {
        self.rooms.lock().await.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeConnection, FakeRoom};

    const BOT: &str = "@bot:example.org";

    fn resolver(conn: FakeConnection) -> (Arc<FakeConnection>, RoomResolver) {
        let conn = Arc::new(conn);
        let resolver = RoomResolver::new(Arc::clone(&conn) as Arc<dyn Connection>);
        (conn, resolver)
    }

    #[tokio::test]
    async fn joined_room_by_id_needs_no_remote_call() {
        let lobby = Arc::new(FakeRoom::new("!lobby:example.org", &["#lobby:example.org"]));
        let (conn, resolver) = resolver(FakeConnection::new(BOT).already_joined(&lobby));

        let room = resolver.resolve_or_join("!lobby:example.org").await.unwrap();
        assert_eq!(room.room_id(), "!lobby:example.org");
        assert_eq!(conn.joins(), 0);
        assert_eq!(lobby.fetches(), 0);
    }

    #[tokio::test]
    async fn alias_of_joined_room_is_resolved_without_join() {
        let lobby = Arc::new(FakeRoom::new("!lobby:example.org", &["#lobby:example.org"]));
        let (conn, resolver) = resolver(
            FakeConnection::new(BOT)
                .already_joined(&lobby)
                .joinable(&lobby),
        );

        for _ in 0..5 {
            let room = resolver.resolve_or_join("#lobby:example.org").await.unwrap();
            assert_eq!(room.room_id(), "!lobby:example.org");
        }
        assert_eq!(conn.joins(), 0);
        assert_eq!(lobby.fetches(), 1);
    }

    #[tokio::test]
    async fn aliases_fetched_once_across_different_unseen_aliases() {
        let lobby = Arc::new(FakeRoom::new("!lobby:example.org", &["#lobby:example.org"]));
        let ops = Arc::new(FakeRoom::new("!ops:example.org", &["#ops:example.org"]));
        let news = Arc::new(FakeRoom::new("!news:example.org", &["#news:example.org"]));
        let (conn, resolver) = resolver(
            FakeConnection::new(BOT)
                .already_joined(&lobby)
                .already_joined(&ops)
                .joinable(&news),
        );

        resolver.resolve_or_join("#news:example.org").await.unwrap();
        resolver.resolve_or_join("#ops:example.org").await.unwrap();
        resolver.resolve_or_join("#lobby:example.org").await.unwrap();
        resolver.resolve_or_join("#news:example.org").await.unwrap();
        assert!(resolver.resolve_or_join("#missing:example.org").await.is_err());

        assert_eq!(lobby.fetches(), 1);
        assert_eq!(ops.fetches(), 1);
        assert!(news.fetches() <= 1);
        // One successful join for #news plus the failed #missing attempt.
        assert_eq!(conn.joins(), 2);
    }

    #[tokio::test]
    async fn newly_joined_room_is_reused_by_id_and_join_ref() {
        let news = Arc::new(FakeRoom::new("!news:example.org", &["#news:example.org"]));
        let (conn, resolver) = resolver(FakeConnection::new(BOT).joinable(&news));

        let joined = resolver.resolve_or_join("#news:example.org").await.unwrap();
        assert_eq!(joined.room_id(), "!news:example.org");
        resolver.resolve_or_join("#news:example.org").await.unwrap();
        resolver.resolve_or_join("!news:example.org").await.unwrap();

        assert_eq!(conn.joins(), 1);
        assert_eq!(news.fetches(), 0);
    }

    #[tokio::test]
    async fn join_failure_carries_ref_and_server_error() {
        let (conn, resolver) = resolver(FakeConnection::new(BOT));
        let Err(err) = resolver.resolve_or_join("#nowhere:example.org").await else {
            panic!("joined a room that does not exist");
        };
        assert_eq!(err.room, "#nowhere:example.org");
        assert_eq!(err.code, 404);
        assert!(err.message.contains("M_NOT_FOUND"));
        assert_eq!(conn.joins(), 1);
    }

    #[tokio::test]
    async fn concurrent_resolves_of_one_alias_join_once() {
        let news = Arc::new(FakeRoom::new("!news:example.org", &["#news:example.org"]));
        let (conn, resolver) = resolver(FakeConnection::new(BOT).joinable(&news));
        let resolver = Arc::new(resolver);

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let resolver = Arc::clone(&resolver);
                tokio::spawn(async move { resolver.resolve_or_join("#news:example.org").await })
            })
            .collect();
        for task in tasks {
            let room = task.await.unwrap().unwrap();
            assert_eq!(room.room_id(), "!news:example.org");
        }
        assert_eq!(conn.joins(), 1);
    }

    #[tokio::test]
    async fn invalidation_allows_one_refetch() {
        let lobby = Arc::new(FakeRoom::new("!lobby:example.org", &["#lobby:example.org"]));
        let (_conn, resolver) = resolver(FakeConnection::new(BOT).already_joined(&lobby));

        resolver.resolve_or_join("#lobby:example.org").await.unwrap();
        resolver.invalidate_aliases("!lobby:example.org").await;
        resolver.resolve_or_join("#lobby:example.org").await.unwrap();
        resolver.resolve_or_join("#lobby:example.org").await.unwrap();

        assert_eq!(lobby.fetches(), 2);
        let joined = resolver.joined().await;
        assert_eq!(joined.len(), 1);
        assert!(joined[0].aliases_fetched);
    }
}
