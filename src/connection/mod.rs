//! WebSocket connection management and the write path.
//!
//! A [`Connection`] splits its stream into a read half and a write half. Any
//! number of writers may want the write half at once: application data,
//! explicit pings and pongs, idle keep-alive pings, replies produced while
//! reading, and close frames. Each kind of writer is a [`WriterId`]; the
//! [`WriteLock`] lets exactly one of them write at a time and hands the lock
//! on in priority order when it is released.
//!
//! ## Connection Lifecycle
//!
//! 1. **Open** - Initial state after successful handshake
//! 2. **Closing** - Close frame sent or received; only control traffic goes out
//! 3. **Closed** - Connection fully closed; pending writers abort
//!
//! A frame write that stops partway leaves the connection **Failed**:
//! nothing more is written and every pending writer aborts.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use wsmux::{CloseCode, Config, Connection, Role};
//!
//! let stream = tokio::net::TcpStream::connect("example.com:80").await?;
//! let conn = Arc::new(Connection::new(stream, Role::Client, Config::default()));
//! conn.spawn_keepalive();
//!
//! let pinger = conn.clone();
//! tokio::spawn(async move { pinger.send_ping(b"hello").await });
//!
//! conn.close(CloseCode::Normal, "done").await?;
//! ```

mod keepalive;
mod ping;
mod role;
mod shared;
mod state;
mod write_lock;
mod write_op;

#[allow(clippy::module_inception)]
mod connection;

pub use connection::Connection;
pub use role::Role;
pub use state::ConnectionState;
pub use write_lock::{WriteLock, WriterId};
