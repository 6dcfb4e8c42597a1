//! # wsmux - write-path coordination for WebSocket connections
//!
//! One WebSocket stream can carry one write at a time, but many parts of a
//! program want to write to it: application messages, explicit pings and
//! pongs, periodic keep-alive pings, automatic replies produced while
//! reading, and the close frame. `wsmux` serializes all of them behind a
//! small priority lock so frames never interleave, a close always jumps the
//! queue, and every pending writer finishes with [`Error::Aborted`] when the
//! connection goes away.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use wsmux::{Config, Connection, Message, Role};
//!
//! // `stream` has already completed the HTTP upgrade.
//! let conn = Arc::new(Connection::new(stream, Role::Client, Config::default()));
//! conn.spawn_keepalive();
//!
//! conn.send(Message::text("hello")).await?;
//! conn.async_send_ping(b"probe", |result| {
//!     if let Err(err) = result {
//!         eprintln!("ping failed: {err}");
//!     }
//! });
//! ```

pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod message;
pub mod protocol;

pub use config::{Config, Limits, Timeouts};
pub use connection::{Connection, ConnectionState, Role, WriteLock, WriterId};
pub use error::{Error, Result};
pub use message::{CloseCode, CloseFrame, Message};
pub use protocol::{Frame, OpCode};
