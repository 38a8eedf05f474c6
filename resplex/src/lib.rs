//! resplex is a pipelined driver core for RESP-speaking servers.
//!
//! A single task owns each transport. Commands from any number of handles
//! are written in submission order, replies are correlated positionally
//! against a FIFO of reply slots, and out-of-band push frames bypass the
//! queue entirely. On top of that sits an optional supervisor that replaces
//! a failed transport with exponential backoff while the handle stays valid.
//!
//! # Basic operation
//!
//! ```no_run
//! use resplex::{cmd, ConnectionOptions, PipelinedConnection, Value};
//!
//! # async fn run() -> resplex::RespResult<()> {
//! let stream = tokio::net::TcpStream::connect("127.0.0.1:6379").await?;
//! let (conn, driver) = PipelinedConnection::new(stream, ConnectionOptions::default());
//! tokio::spawn(driver);
//!
//! let reply = conn.send(&cmd("PING")).await?;
//! assert_eq!(reply, Value::SimpleString("PONG".into()));
//! # Ok(()) }
//! ```
//!
//! # Self-healing connections
//!
//! [`ManagedConnection`] wraps the same driver behind a supervisor task:
//!
//! ```no_run
//! use resplex::{cmd, ManagedConnection, ReconnectConfig, TcpConnector};
//!
//! # async fn run() -> resplex::RespResult<()> {
//! let conn = ManagedConnection::connect(
//!     TcpConnector::new("127.0.0.1:6379"),
//!     ReconnectConfig::default(),
//! )
//! .await?;
//! conn.send(&cmd("PING")).await?;
//! # Ok(()) }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cmd;
mod codec;
mod dispatch;
mod errors;
mod events;
mod handler;
mod output;
mod push;
mod reconnect;
mod value;

pub use crate::cmd::{cmd, Cmd};
pub use crate::codec::{parse_resp_value, AggregateKind, ReplyCodec, ReplyEvent};
pub use crate::dispatch::{CommandHandle, CommandState};
pub use crate::errors::{Error, ErrorKind, RespResult, ServerError};
pub use crate::events::{ConnectionEvent, EventListener};
pub use crate::handler::{ConnectionOptions, PipelinedConnection};
pub use crate::output::{ReplyShape, StreamSubscriber, VecSubscriber};
pub use crate::push::{ListenerId, OutOfBandRouter, PushInfo, PushKind, PushSender, SendError};
pub use crate::reconnect::{
    Connect, ManagedConnection, ReconnectConfig, ReplayPolicy, TcpConnector,
};
pub use crate::value::Value;
