//! Wire messages exchanged between the supervisor and its children.
//!
//! Every message is one JSON object tagged by `action`:
//!
//! ```text
//! {"action":"worker-ready","to":"master"}
//! {"action":"realport","to":"master","data":7001}
//! {"action":"sticky-session:connection"}            + one socket handle
//! {"action":"log-reload"}
//! ```

use std::net::TcpStream;

use serde::{Deserialize, Serialize};

/// Addressee of a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    Master,
    Agent,
    App,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum Message {
    /// The sender's readiness gate fired `Ready`.
    #[serde(rename = "worker-ready")]
    WorkerReady { to: Target },

    /// The sender is listening; `data` is the port it actually bound
    /// (`0` for a unix-socket listener).
    #[serde(rename = "realport")]
    RealPort { to: Target, data: u16 },

    /// Supervisor → app worker: adopt the accompanying connection.
    #[serde(rename = "sticky-session:connection")]
    StickyConnection,

    /// Reopen log outputs. Children send it to the supervisor, which relays it
    /// to every other live child.
    #[serde(rename = "log-reload")]
    LogReload,
}

impl Message {
    pub fn as_label(&self) -> &'static str {
        match self {
            Message::WorkerReady { .. } => "worker-ready",
            Message::RealPort { .. } => "realport",
            Message::StickyConnection => "sticky-session:connection",
            Message::LogReload => "log-reload",
        }
    }
}

/// A message plus an optional connection handle travelling with it.
///
/// Whoever sends an envelope with a connection gives up that handle.
#[derive(Debug)]
pub struct Envelope {
    pub message: Message,
    pub connection: Option<TcpStream>,
}

impl Envelope {
    pub fn new(message: Message) -> Self {
        Self {
            message,
            connection: None,
        }
    }

    /// A sticky handoff of `stream`.
    pub fn handoff(stream: TcpStream) -> Self {
        Self {
            message: Message::StickyConnection,
            connection: Some(stream),
        }
    }
}

impl From<Message> for Envelope {
    fn from(message: Message) -> Self {
        Self::new(message)
    }
}
