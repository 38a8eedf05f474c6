//! Testing support
//!
//! In-memory transports and a scripted connector for exercising connection
//! behavior without a server. [`pipe`] hands out a duplex transport whose far
//! end plays the peer: assert what the connection wrote with
//! [`expect_bytes`], then answer with [`reply`]. [`QueueConnector`] feeds a
//! prearranged sequence of such transports to a reconnecting connection.
//!
//! # Example
//!
//! ```rust
//! use resplex::{cmd, ConnectionOptions, PipelinedConnection, Value};
//! use resplex_test::{expect_command, pipe, reply};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let (local, mut peer) = pipe();
//! let (conn, driver) = PipelinedConnection::new(local, ConnectionOptions::default());
//! tokio::spawn(driver);
//!
//! let ping = cmd("PING");
//! let pending = tokio::spawn(async move { conn.send(&ping).await });
//!
//! expect_command(&mut peer, &cmd("PING")).await;
//! reply(&mut peer, b"+PONG\r\n").await;
//!
//! let value = pending.await.unwrap().unwrap();
//! assert_eq!(value, Value::SimpleString("PONG".into()));
//! # }
//! ```

use std::collections::VecDeque;
use std::io;
use std::sync::Mutex;

use resplex::{Cmd, Connect};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

/// Creates an in-memory transport pair. Drive the first end, script the
/// second.
pub fn pipe() -> (DuplexStream, DuplexStream) {
    tokio::io::duplex(4096)
}

/// Reads exactly `expected.len()` bytes from the peer and asserts they match.
pub async fn expect_bytes(peer: &mut DuplexStream, expected: &[u8]) {
    let mut buf = vec![0u8; expected.len()];
    peer.read_exact(&mut buf).await.expect("peer read failed");
    assert_eq!(
        buf,
        expected,
        "peer received {:?}, expected {:?}",
        String::from_utf8_lossy(&buf),
        String::from_utf8_lossy(expected)
    );
}

/// Asserts that the peer receives exactly the wire form of `cmd` next.
pub async fn expect_command(peer: &mut DuplexStream, cmd: &Cmd) {
    expect_bytes(peer, &cmd.get_packed_command()).await
}

/// Writes reply bytes from the scripted peer.
pub async fn reply(peer: &mut DuplexStream, bytes: &[u8]) {
    peer.write_all(bytes).await.expect("peer write failed");
    peer.flush().await.expect("peer flush failed");
}

/// A connector yielding a prearranged sequence of in-memory transports.
///
/// Each connection attempt pops the next transport; once the queue is empty,
/// attempts are refused. Dropping the peer end of the current transport is
/// how a test simulates a connection loss.
#[derive(Default)]
pub struct QueueConnector {
    streams: Mutex<VecDeque<DuplexStream>>,
}

impl QueueConnector {
    /// Creates a connector over the given transports, in connection order.
    pub fn new(streams: impl IntoIterator<Item = DuplexStream>) -> Self {
        QueueConnector {
            streams: Mutex::new(streams.into_iter().collect()),
        }
    }

    /// Appends another transport for a later connection attempt.
    pub fn push(&self, stream: DuplexStream) {
        self.streams.lock().unwrap().push_back(stream);
    }
}

impl Connect for QueueConnector {
    type Stream = DuplexStream;

    async fn connect(&self) -> io::Result<DuplexStream> {
        self.streams.lock().unwrap().pop_front().ok_or_else(|| {
            io::Error::new(io::ErrorKind::ConnectionRefused, "no transport scripted")
        })
    }
}
