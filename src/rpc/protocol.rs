//! Wire protocol between the host and the in-container runner.
//!
//! # Protocol Format
//!
//! - **Transport**: the runner's stdin (requests) and stdout (responses)
//! - **Encoding**: JSON
//! - **Framing**: Newline-delimited (each message ends with `\n`)
//!
//! # Flow
//!
//! ```text
//! Host                                       Runner
//!   |                                          |
//!   |  {"type":"ready","version":"1"}\n        |
//!   |<-----------------------------------------|
//!   |                                          |
//!   |  {"id":7,"function":"app:greet",...}\n   |
//!   |----------------------------------------->|
//!   |                                          |
//!   |  {"type":"item","id":7,"value":...}\n    |  zero or more
//!   |  {"type":"error","id":7,...}\n           |  zero or more
//!   |  {"type":"end","id":7}\n                 |  exactly one
//!   |<-----------------------------------------|
//! ```
//!
//! # Function Names
//!
//! `W(.W)*` or `W(.W)*:W(.W)*`, where `W` is an identifier. The part before
//! the colon names a module, the part after an object inside it.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// =============================================================================
// Requests
// =============================================================================

/// Host → runner: invoke a function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRequest {
    pub id: u64,
    pub function: String,
    #[serde(default)]
    pub body: Value,
    #[serde(default)]
    pub extras: Map<String, Value>,
}

// =============================================================================
// Responses
// =============================================================================

/// Runner → host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunnerMessage {
    /// Sent once at startup.
    Ready { version: String },
    /// One value produced by a call.
    Item { id: u64, value: Value },
    /// A call failed, or part of it did.
    Error {
        id: u64,
        code: ErrorCode,
        message: String,
    },
    /// No more messages for this call.
    End { id: u64 },
}

impl RunnerMessage {
    /// The call this message belongs to (`None` for `ready`).
    pub fn id(&self) -> Option<u64> {
        match self {
            Self::Ready { .. } => None,
            Self::Item { id, .. } | Self::Error { id, .. } | Self::End { id } => Some(*id),
        }
    }

    pub fn error(id: u64, code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            id,
            code,
            message: message.into(),
        }
    }
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// No function registered under the requested name.
    NotFound,
    /// Request line could not be parsed, or the name is malformed.
    InvalidRequest,
    /// The handler returned an error or panicked.
    HandlerFailed,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => write!(f, "not_found"),
            Self::InvalidRequest => write!(f, "invalid_request"),
            Self::HandlerFailed => write!(f, "handler_failed"),
        }
    }
}

/// An error reported by the runner inside a call's response stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub code: ErrorCode,
    pub message: String,
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

// =============================================================================
// Wire Format Helpers
// =============================================================================

impl CallRequest {
    /// Serializes request to JSON line (with newline).
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s.trim())
    }
}

impl RunnerMessage {
    /// Serializes message to JSON line (with newline).
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s.trim())
    }
}

// =============================================================================
// Function Names
// =============================================================================

fn is_identifier(word: &str) -> bool {
    let mut chars = word.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || c == '_')
}

fn is_dotted(words: &str) -> bool {
    words.split('.').all(is_identifier)
}

/// Checks `W(.W)*` or `W(.W)*:W(.W)*`.
pub fn is_valid_function_name(name: &str) -> bool {
    match name.split_once(':') {
        Some((module, object)) => is_dotted(module) && is_dotted(object),
        None => is_dotted(name),
    }
}
