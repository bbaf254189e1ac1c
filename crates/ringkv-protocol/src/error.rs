//! Protocol error types for the client line protocol.

use thiserror::Error;

/// Errors that can occur when parsing a client request or server reply.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The line held nothing but whitespace.
    #[error("empty request")]
    Empty,

    /// The first word didn't match any known command.
    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    /// A known command had the wrong number of arguments.
    #[error("wrong number of arguments for '{0}'")]
    WrongArity(&'static str),

    /// A put whose key or value exceeds the size limits.
    #[error("key or value too long for key '{0}'")]
    TooLong(String),

    /// A server reply that didn't match any known form.
    #[error("malformed reply '{0}'")]
    MalformedReply(String),
}
