//! ringkv-protocol: the client-facing line protocol.
//!
//! Clients send one request per line and read one reply line back.
//!
//! ```
//! use ringkv_protocol::{Command, Reply};
//!
//! let cmd = Command::parse("put alice greeting hello world").unwrap();
//! assert_eq!(cmd.key(), Some("greeting"));
//!
//! let reply = Reply::PutSuccess("greeting".into());
//! assert_eq!(reply.to_string(), "put_success greeting");
//! ```

pub mod command;
pub mod error;
pub mod reply;

pub use command::{Command, MAX_KEY_LEN, MAX_VALUE_LEN};
pub use error::ProtocolError;
pub use reply::{Reply, KEY_NOT_FOUND, NOT_OWNER, TOO_LONG};
