//! Command table and message matching.
//!
//! The table is built once from configuration and never changes afterwards,
//! so a single `CommandRouter` can be shared across every inbound event.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::transport::InboundMessage;

/// Name of the event emitted for every command match.
pub const COMMAND_EVENT: &str = "matrix_command";

/// A regular expression that only matches at the start of a message body.
#[derive(Debug, Clone)]
pub struct Expression {
    regex: Regex,
}

impl Expression {
    /// The pattern is compiled unchanged, so flags and trailing `(?x)`
    /// comments behave exactly as written.
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            regex: Regex::new(pattern)?,
        })
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        self.regex.as_str()
    }

    /// Named captures of a prefix match. Named groups that did not take part
    /// in the match are present with `None`; unnamed groups are dropped.
    #[must_use]
    pub fn captures(&self, body: &str) -> Option<BTreeMap<String, Option<String>>> {
        // Leftmost-first search reports a match at offset 0 whenever one exists.
        let caps = self.regex.captures(body)?;
        if caps.get(0)?.start() != 0 {
            return None;
        }
        Some(
            self.regex
                .capture_names()
                .flatten()
                .map(|name| {
                    let value = caps.name(name).map(|m| m.as_str().to_owned());
                    (name.to_owned(), value)
                })
                .collect(),
        )
    }
}

#[derive(Debug, Clone)]
pub enum Trigger {
    /// Fires when the first token of a message is `!<word>`.
    Word(String),
    Expression(Expression),
}

#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub name: String,
    pub trigger: Trigger,
    /// Rooms the command is active in. Empty means every listening room.
    pub rooms: Vec<String>,
}

impl CommandSpec {
    pub fn word(name: impl Into<String>, word: impl Into<String>, rooms: Vec<String>) -> Self {
        Self {
            name: name.into(),
            trigger: Trigger::Word(word.into()),
            rooms,
        }
    }

    pub fn expression(
        name: impl Into<String>,
        pattern: &str,
        rooms: Vec<String>,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            name: name.into(),
            trigger: Trigger::Expression(Expression::new(pattern)?),
            rooms,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum CommandArgs {
    Words(Vec<String>),
    Captures(BTreeMap<String, Option<String>>),
}

/// Payload of a `matrix_command` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandEvent {
    pub command: String,
    pub sender: String,
    pub room: String,
    pub args: CommandArgs,
}

#[derive(Debug, Default)]
struct CommandTable {
    words: HashMap<String, HashMap<String, Arc<CommandSpec>>>,
    expressions: HashMap<String, Vec<Arc<CommandSpec>>>,
}

#[derive(Debug)]
pub struct CommandRouter {
    identity: String,
    table: CommandTable,
}

impl CommandRouter {
    /// Builds the table. Commands without rooms are expanded to
    /// `listening_rooms` here, once; a word command that collides with an
    /// earlier one in the same room replaces it.
    pub fn new(
        identity: impl Into<String>,
        commands: impl IntoIterator<Item = CommandSpec>,
        listening_rooms: &[String],
    ) -> Self {
        let mut table = CommandTable::default();
        for mut command in commands {
            if command.rooms.is_empty() {
                command.rooms = listening_rooms.to_vec();
            }
            let command = Arc::new(command);
            for room in &command.rooms {
                match &command.trigger {
                    Trigger::Word(word) => {
                        table
                            .words
                            .entry(room.clone())
                            .or_default()
                            .insert(word.clone(), Arc::clone(&command));
                    }
                    Trigger::Expression(_) => {
                        table
                            .expressions
                            .entry(room.clone())
                            .or_default()
                            .push(Arc::clone(&command));
                    }
                }
            }
        }
        Self {
            identity: identity.into(),
            table,
        }
    }

    #[must_use]
    pub fn word_command(&self, room: &str, word: &str) -> Option<&CommandSpec> {
        self.table
            .words
            .get(room)
            .and_then(|words| words.get(word))
            .map(Arc::as_ref)
    }

    pub fn expression_commands(&self, room: &str) -> impl Iterator<Item = &CommandSpec> {
        self.table
            .expressions
            .get(room)
            .into_iter()
            .flatten()
            .map(Arc::as_ref)
    }

    /// Every room that has at least one command.
    pub fn rooms(&self) -> impl Iterator<Item = &str> {
        let mut rooms: Vec<&str> = self
            .table
            .words
            .keys()
            .chain(self.table.expressions.keys())
            .map(String::as_str)
            .collect();
        rooms.sort_unstable();
        rooms.dedup();
        rooms.into_iter()
    }

    /// Matches one message received in `room` (as configured, ID or alias).
    /// At most one word command fires, followed by every matching expression
    /// in registration order.
    #[must_use]
    pub fn route(&self, room: &str, message: &InboundMessage) -> Vec<CommandEvent> {
        let Some(body) = message.body() else {
            return Vec::new();
        };
        if message.sender == self.identity {
            return Vec::new();
        }
        debug!(room = %room, body = %body, "Handling message");

        let mut events = Vec::new();
        if let Some(rest) = body.strip_prefix('!') {
            let mut pieces = rest.split_whitespace();
            let word = if rest.starts_with(char::is_whitespace) {
                ""
            } else {
                pieces.next().unwrap_or_default()
            };
            if let Some(command) = self.word_command(room, word) {
                events.push(CommandEvent {
                    command: command.name.clone(),
                    sender: message.sender.clone(),
                    room: room.to_owned(),
                    args: CommandArgs::Words(pieces.map(ToOwned::to_owned).collect()),
                });
            }
        }

        for command in self.expression_commands(room) {
            let Trigger::Expression(expression) = &command.trigger else {
                continue;
            };
            if let Some(captures) = expression.captures(body) {
                events.push(CommandEvent {
                    command: command.name.clone(),
                    sender: message.sender.clone(),
                    room: room.to_owned(),
                    args: CommandArgs::Captures(captures),
                });
            }
        }
        events
    }
}
