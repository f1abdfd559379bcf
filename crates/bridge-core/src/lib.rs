//! Engine of the Matrix command bridge: session login, room resolution,
//! command matching and dispatch. The homeserver is reached only through the
//! traits in [`transport`], so everything here runs against any transport.

pub mod auth;
pub mod command;
pub mod dispatcher;
pub mod error;
pub mod resolver;
pub mod token_store;
pub mod transport;

#[cfg(test)]
mod testing;

pub use auth::SessionAuthenticator;
pub use command::{COMMAND_EVENT, CommandArgs, CommandEvent, CommandRouter, CommandSpec, Trigger};
pub use dispatcher::{EventSink, MessageDispatcher, SendReport, StartReport};
pub use error::{AuthError, PersistenceError, RemoteError, RoomJoinError, SendError};
pub use resolver::{JoinedRoom, RoomResolver};
pub use token_store::TokenStore;
pub use transport::{
    Connection, Connector, InboundHandler, InboundMessage, MessageContent, RemoteRoom,
};
