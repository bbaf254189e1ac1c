//! Client request parsing.
//!
//! Requests are single whitespace-separated lines. A put value is the
//! rest of the line after the key, inner whitespace included.

use std::fmt;

use crate::error::ProtocolError;

/// Longest accepted key, in bytes.
pub const MAX_KEY_LEN: usize = 20;

/// Longest accepted value, in bytes (120 KiB).
pub const MAX_VALUE_LEN: usize = 120 * 1024;

/// A parsed client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `put <user> <key> <value...>`. Inserts or updates a key owned by `user`.
    Put {
        user: String,
        key: String,
        value: String,
    },

    /// `get <key>`. Served from the local range or a replica slot.
    Get { key: String },

    /// `delete <user> <key>`. Removes a key owned by `user`.
    Delete { user: String, key: String },

    /// `keyrange`. Returns the write-routing snapshot.
    Keyrange,

    /// `keyrange_read`. Returns the snapshot including replica holders.
    KeyrangeRead,

    /// `quit`. Closes the connection.
    Quit,
}

impl Command {
    /// Parses one request line.
    pub fn parse(line: &str) -> Result<Command, ProtocolError> {
        let words: Vec<&str> = line.split_whitespace().collect();
        let Some((&name, args)) = words.split_first() else {
            return Err(ProtocolError::Empty);
        };

        match name {
            "put" => {
                let [user, key, _, ..] = args else {
                    return Err(ProtocolError::WrongArity("put"));
                };
                let value = rest_after(line, 3);
                if key.len() > MAX_KEY_LEN || value.len() > MAX_VALUE_LEN {
                    return Err(ProtocolError::TooLong(key.to_string()));
                }
                Ok(Command::Put {
                    user: user.to_string(),
                    key: key.to_string(),
                    value: value.to_string(),
                })
            }
            "get" => match args {
                [key] => Ok(Command::Get {
                    key: key.to_string(),
                }),
                _ => Err(ProtocolError::WrongArity("get")),
            },
            "delete" => match args {
                [user, key] => Ok(Command::Delete {
                    user: user.to_string(),
                    key: key.to_string(),
                }),
                _ => Err(ProtocolError::WrongArity("delete")),
            },
            "keyrange" => no_args(args, "keyrange", Command::Keyrange),
            "keyrange_read" => no_args(args, "keyrange_read", Command::KeyrangeRead),
            "quit" => no_args(args, "quit", Command::Quit),
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }

    /// Lowercase command name, as sent on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Put { .. } => "put",
            Command::Get { .. } => "get",
            Command::Delete { .. } => "delete",
            Command::Keyrange => "keyrange",
            Command::KeyrangeRead => "keyrange_read",
            Command::Quit => "quit",
        }
    }

    /// The key a command routes on, if any.
    pub fn key(&self) -> Option<&str> {
        match self {
            Command::Put { key, .. } | Command::Get { key } | Command::Delete { key, .. } => {
                Some(key)
            }
            _ => None,
        }
    }

    /// Returns true for commands that modify data.
    pub fn is_write(&self) -> bool {
        matches!(self, Command::Put { .. } | Command::Delete { .. })
    }
}

/// The remainder of `line` after skipping `words` words, trimmed at both
/// ends. Inner whitespace is kept as sent.
fn rest_after(line: &str, words: usize) -> &str {
    let mut rest = line.trim_end();
    for _ in 0..words {
        rest = rest.trim_start();
        rest = match rest.find(char::is_whitespace) {
            Some(i) => &rest[i..],
            None => "",
        };
    }
    rest.trim_start()
}

fn no_args(args: &[&str], name: &'static str, cmd: Command) -> Result<Command, ProtocolError> {
    if args.is_empty() {
        Ok(cmd)
    } else {
        Err(ProtocolError::WrongArity(name))
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Put { user, key, value } => write!(f, "put {user} {key} {value}"),
            Command::Get { key } => write!(f, "get {key}"),
            Command::Delete { user, key } => write!(f, "delete {user} {key}"),
            other => f.write_str(other.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_with_multiword_value() {
        let cmd = Command::parse("put alice greeting hello big world\r\n").unwrap();
        assert_eq!(
            cmd,
            Command::Put {
                user: "alice".into(),
                key: "greeting".into(),
                value: "hello big world".into(),
            }
        );
        assert_eq!(cmd.to_string(), "put alice greeting hello big world");
        assert!(cmd.is_write());
    }

    #[test]
    fn put_value_keeps_inner_whitespace() {
        let cmd = Command::parse("put  alice\tgreeting   a  b\tc\r\n").unwrap();
        assert_eq!(
            cmd,
            Command::Put {
                user: "alice".into(),
                key: "greeting".into(),
                value: "a  b\tc".into(),
            }
        );
        assert_eq!(cmd.to_string(), "put alice greeting a  b\tc");
    }

    #[test]
    fn put_needs_a_value() {
        assert_eq!(
            Command::parse("put alice key"),
            Err(ProtocolError::WrongArity("put"))
        );
    }

    #[test]
    fn put_size_limits() {
        let long_key = "k".repeat(MAX_KEY_LEN + 1);
        assert_eq!(
            Command::parse(&format!("put alice {long_key} v")),
            Err(ProtocolError::TooLong(long_key))
        );

        let long_value = "v".repeat(MAX_VALUE_LEN + 1);
        assert_eq!(
            Command::parse(&format!("put alice key {long_value}")),
            Err(ProtocolError::TooLong("key".into()))
        );

        let max_key = "k".repeat(MAX_KEY_LEN);
        assert!(Command::parse(&format!("put alice {max_key} v")).is_ok());
    }

    #[test]
    fn get_and_delete() {
        assert_eq!(
            Command::parse("get foo").unwrap(),
            Command::Get { key: "foo".into() }
        );
        assert_eq!(
            Command::parse("delete bob foo").unwrap(),
            Command::Delete {
                user: "bob".into(),
                key: "foo".into()
            }
        );
        assert_eq!(
            Command::parse("get a b"),
            Err(ProtocolError::WrongArity("get"))
        );
        assert_eq!(
            Command::parse("delete foo"),
            Err(ProtocolError::WrongArity("delete"))
        );
    }

    #[test]
    fn bare_commands() {
        assert_eq!(Command::parse("keyrange").unwrap(), Command::Keyrange);
        assert_eq!(Command::parse(" keyrange_read ").unwrap(), Command::KeyrangeRead);
        assert_eq!(Command::parse("quit").unwrap(), Command::Quit);
        assert_eq!(
            Command::parse("keyrange now"),
            Err(ProtocolError::WrongArity("keyrange"))
        );
        assert_eq!(Command::KeyrangeRead.key(), None);
    }

    #[test]
    fn empty_and_unknown() {
        assert_eq!(Command::parse("  \r\n"), Err(ProtocolError::Empty));
        assert_eq!(
            Command::parse("PUT a b c"),
            Err(ProtocolError::UnknownCommand("PUT".into()))
        );
    }
}
