//! Server replies.
//!
//! Each reply is one line. [`Reply`] renders through `Display` on the
//! server and is parsed back with [`Reply::parse`] by clients.

use std::fmt;

use crate::error::ProtocolError;

/// Message sent with `get_error`/`delete_error` for a missing key.
pub const KEY_NOT_FOUND: &str = "key is not found!";

/// Message sent with `put_error`/`delete_error` when the caller does not own the key.
pub const NOT_OWNER: &str = "current user is not the owner of this key, no write requests allowed";

/// Message sent with `put_error` when a size limit is exceeded.
pub const TOO_LONG: &str = "key or value are too long!";

/// A server reply line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    PutSuccess(String),
    PutUpdate(String),
    PutError { key: String, msg: String },
    GetSuccess { key: String, value: String },
    GetError { key: String, msg: String },
    DeleteSuccess(String),
    DeleteError { key: String, msg: String },
    KeyrangeSuccess(String),
    KeyrangeReadSuccess(String),
    /// The key is outside every range this node serves.
    NotResponsible,
    /// The node is handing off data and rejects writes.
    WriteLock,
    /// The node has left the ring.
    Stopped,
    Error(String),
}

impl Reply {
    /// Parses one reply line.
    pub fn parse(line: &str) -> Result<Reply, ProtocolError> {
        let line = line.trim();
        let (name, rest) = split_word(line);
        let malformed = || ProtocolError::MalformedReply(line.to_string());

        let reply = match name {
            "put_success" => Reply::PutSuccess(single(rest).ok_or_else(malformed)?),
            "put_update" => Reply::PutUpdate(single(rest).ok_or_else(malformed)?),
            "delete_success" => Reply::DeleteSuccess(single(rest).ok_or_else(malformed)?),
            "put_error" | "get_error" | "delete_error" | "get_success" => {
                let (key, tail) = split_word(rest);
                if key.is_empty() {
                    return Err(malformed());
                }
                let (key, tail) = (key.to_string(), tail.to_string());
                match name {
                    "put_error" => Reply::PutError { key, msg: tail },
                    "get_error" => Reply::GetError { key, msg: tail },
                    "delete_error" => Reply::DeleteError { key, msg: tail },
                    _ => Reply::GetSuccess { key, value: tail },
                }
            }
            "keyrange_success" => Reply::KeyrangeSuccess(rest.to_string()),
            "keyrange_read_success" => Reply::KeyrangeReadSuccess(rest.to_string()),
            "server_not_responsible" => Reply::NotResponsible,
            "server_write_lock" => Reply::WriteLock,
            "server_stopped" => Reply::Stopped,
            "error" => Reply::Error(rest.to_string()),
            _ => return Err(malformed()),
        };
        Ok(reply)
    }

    /// Returns true for replies a client should retry after refreshing
    /// its routing or backing off.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Reply::NotResponsible | Reply::WriteLock | Reply::Stopped)
    }
}

impl From<&ProtocolError> for Reply {
    fn from(e: &ProtocolError) -> Self {
        match e {
            ProtocolError::TooLong(key) => Reply::PutError {
                key: key.clone(),
                msg: TOO_LONG.into(),
            },
            ProtocolError::UnknownCommand(_) => Reply::Error("unknown command!".into()),
            other => Reply::Error(other.to_string()),
        }
    }
}

fn split_word(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.find(char::is_whitespace) {
        Some(i) => (&s[..i], s[i..].trim_start()),
        None => (s, ""),
    }
}

fn single(s: &str) -> Option<String> {
    let (word, rest) = split_word(s);
    (!word.is_empty() && rest.is_empty()).then(|| word.to_string())
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::PutSuccess(key) => write!(f, "put_success {key}"),
            Reply::PutUpdate(key) => write!(f, "put_update {key}"),
            Reply::PutError { key, msg } => write!(f, "put_error {key} {msg}"),
            Reply::GetSuccess { key, value } => write!(f, "get_success {key} {value}"),
            Reply::GetError { key, msg } => write!(f, "get_error {key} {msg}"),
            Reply::DeleteSuccess(key) => write!(f, "delete_success {key}"),
            Reply::DeleteError { key, msg } => write!(f, "delete_error {key} {msg}"),
            Reply::KeyrangeSuccess(s) => write!(f, "keyrange_success {s}"),
            Reply::KeyrangeReadSuccess(s) => write!(f, "keyrange_read_success {s}"),
            Reply::NotResponsible => f.write_str("server_not_responsible"),
            Reply::WriteLock => f.write_str("server_write_lock"),
            Reply::Stopped => f.write_str("server_stopped"),
            Reply::Error(msg) => write!(f, "error {msg}"),
        }
    }
}
