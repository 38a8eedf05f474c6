//! Self-healing connection wrapper.
//!
//! A supervisor task drives the connection and, when it fails, replaces the
//! transport with exponential backoff while the handle stays valid. What
//! happens to commands stranded by a disconnect depends on how far they got:
//! commands never written are replayed on the new transport, written but
//! unanswered commands follow the configured [`ReplayPolicy`], and commands
//! whose reply was partially decoded always fail.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

use crate::cmd::Cmd;
use crate::dispatch::{CommandHandle, CommandState, InFlight};
use crate::errors::{Error, ErrorKind, RespResult};
use crate::events::{ConnectionEvent, EventListener};
use crate::handler::{
    drive, fail_all, notify_disconnect, ConnectionOptions, DriveEnd, HandleInner, Request, Shared,
};
use crate::output::ReplyShape;
use crate::push::{ListenerId, OutOfBandRouter, PushKind, PushSender};
use crate::value::Value;

/// Establishes transports for a [`ManagedConnection`].
pub trait Connect: Send + Sync + 'static {
    /// The transport this connector produces.
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Opens a fresh transport.
    fn connect(&self) -> impl std::future::Future<Output = io::Result<Self::Stream>> + Send;
}

/// Connects plain TCP transports to a fixed address.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    /// Creates a connector for `addr` (`host:port`).
    pub fn new(addr: impl Into<String>) -> Self {
        TcpConnector { addr: addr.into() }
    }
}

impl Connect for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self) -> io::Result<TcpStream> {
        let stream = TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

/// What to do with commands that were written but not yet answered when the
/// connection was lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplayPolicy {
    /// Fail them: the command may have executed and resending could apply a
    /// non-idempotent effect twice.
    #[default]
    FailUnconfirmed,
    /// Resend them on the replacement transport.
    RetryUnconfirmed,
}

/// Configuration of a [`ManagedConnection`].
pub struct ReconnectConfig {
    factor: f32,
    delay_base: Duration,
    max_delay: Option<Duration>,
    number_of_retries: usize,
    connection_timeout: Option<Duration>,
    replay_policy: ReplayPolicy,
    options: ConnectionOptions,
    listeners: Vec<Arc<dyn EventListener>>,
    push_senders: Vec<(Option<PushKind>, Arc<dyn PushSender>)>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        ReconnectConfig {
            factor: 2.0,
            delay_base: Duration::from_millis(100),
            max_delay: None,
            number_of_retries: 6,
            connection_timeout: None,
            replay_policy: ReplayPolicy::default(),
            options: ConnectionOptions::default(),
            listeners: Vec::new(),
            push_senders: Vec::new(),
        }
    }
}

impl ReconnectConfig {
    /// Multiplier applied to the delay after each failed attempt.
    pub fn factor(mut self, factor: f32) -> Self {
        self.factor = factor;
        self
    }

    /// Delay before the first retry.
    pub fn delay_base(mut self, delay: Duration) -> Self {
        self.delay_base = delay;
        self
    }

    /// Upper bound for the backoff delay.
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    /// Number of reconnection attempts before giving up for good.
    pub fn number_of_retries(mut self, retries: usize) -> Self {
        self.number_of_retries = retries;
        self
    }

    /// Time limit for a single connection attempt.
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = Some(timeout);
        self
    }

    /// Policy for written-but-unanswered commands, see [`ReplayPolicy`].
    pub fn replay_policy(mut self, policy: ReplayPolicy) -> Self {
        self.replay_policy = policy;
        self
    }

    /// Per-connection tunables.
    pub fn connection_options(mut self, options: ConnectionOptions) -> Self {
        self.options = options;
        self
    }

    /// Registers a lifecycle listener before the first connect, so the
    /// initial `Connected` event is observable.
    pub fn event_listener(mut self, listener: impl EventListener) -> Self {
        self.listeners.push(Arc::new(listener));
        self
    }

    /// Registers a push listener before the first connect.
    pub fn push_sender(mut self, filter: Option<PushKind>, sender: impl PushSender) -> Self {
        self.push_senders.push((filter, Arc::new(sender)));
        self
    }
}

impl fmt::Debug for ReconnectConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconnectConfig")
            .field("factor", &self.factor)
            .field("delay_base", &self.delay_base)
            .field("max_delay", &self.max_delay)
            .field("number_of_retries", &self.number_of_retries)
            .field("connection_timeout", &self.connection_timeout)
            .field("replay_policy", &self.replay_policy)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

struct TaskGuard(JoinHandle<()>);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// A pipelined connection that transparently replaces its transport.
///
/// Cloning is cheap; the supervisor task is aborted once the last clone is
/// dropped.
#[derive(Clone)]
pub struct ManagedConnection {
    inner: Arc<HandleInner>,
    _task: Arc<TaskGuard>,
}

impl ManagedConnection {
    /// Connects and spawns the supervisor task on the current runtime.
    pub async fn connect<C: Connect>(
        connector: C,
        config: ReconnectConfig,
    ) -> RespResult<ManagedConnection> {
        let (inner, rx) = HandleInner::new(config.options.clone());
        for listener in &config.listeners {
            inner.shared.events.add(listener.clone());
        }
        for (filter, sender) in &config.push_senders {
            inner.shared.pushes.register(filter.clone(), sender.clone());
        }

        let first = connect_with_backoff(&connector, &config)
            .await
            .map_err(Error::from)?;
        inner.shared.events.emit(ConnectionEvent::Connected);

        let shared = inner.shared.clone();
        let task = tokio::spawn(supervise(connector, config, shared, rx, first));
        Ok(ManagedConnection {
            inner,
            _task: Arc::new(TaskGuard(task)),
        })
    }

    /// Sends a command and waits for its reply.
    pub async fn send(&self, cmd: &Cmd) -> RespResult<Value> {
        self.inner.send(cmd, ReplyShape::Value).await
    }

    /// Sends a command and waits for its reply, validated against `shape`.
    pub async fn send_with_shape(&self, cmd: &Cmd, shape: ReplyShape) -> RespResult<Value> {
        self.inner.send(cmd, shape).await
    }

    /// Submits a command without waiting, returning a handle that resolves
    /// with the reply. Waits for a free pipeline slot.
    pub async fn submit(&self, cmd: &Cmd, shape: ReplyShape) -> RespResult<CommandHandle> {
        self.inner.submit(cmd, shape).await
    }

    /// Like [`submit`](Self::submit) but fails with
    /// [`ErrorKind::Backpressure`](crate::ErrorKind::Backpressure) instead of
    /// waiting for a slot.
    pub fn try_submit(&self, cmd: &Cmd, shape: ReplyShape) -> RespResult<CommandHandle> {
        self.inner.try_submit(cmd, shape)
    }

    /// Cancels all outstanding commands while keeping the connection usable.
    pub fn reset(&self) {
        self.inner.reset()
    }

    /// Access to push message listener registration.
    pub fn out_of_band(&self) -> &OutOfBandRouter {
        &self.inner.shared.pushes
    }

    /// Registers a lifecycle event listener.
    pub fn add_event_listener(&self, listener: impl EventListener) -> ListenerId {
        self.inner.shared.events.add(Arc::new(listener))
    }

    /// Removes a lifecycle event listener. Returns false if it was already
    /// gone.
    pub fn remove_event_listener(&self, id: ListenerId) -> bool {
        self.inner.shared.events.remove(id)
    }
}

async fn connect_with_backoff<C: Connect>(
    connector: &C,
    config: &ReconnectConfig,
) -> io::Result<C::Stream> {
    let mut strategy = ExponentialBuilder::default()
        .with_factor(config.factor)
        .with_min_delay(config.delay_base)
        .with_max_times(config.number_of_retries)
        .with_jitter();
    if let Some(max_delay) = config.max_delay {
        strategy = strategy.with_max_delay(max_delay);
    }

    let attempt = || async {
        match config.connection_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, connector.connect()).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "connection attempt timed out",
                )),
            },
            None => connector.connect().await,
        }
    };

    attempt
        .retry(strategy)
        .notify(|err, delay| warn!("connection attempt failed ({err}), retrying in {delay:?}"))
        .await
}

/// Splits the stranded queue into entries to replay and entries to fail.
/// Returns `None` when the cause makes the whole queue unreplayable.
fn partition_stranded(
    entries: Vec<InFlight>,
    cause: &Error,
    policy: ReplayPolicy,
) -> Option<Vec<InFlight>> {
    if matches!(
        cause.kind(),
        ErrorKind::Protocol | ErrorKind::OrderingViolation
    ) {
        // Correlation is broken; no entry can be trusted to line up again.
        for mut entry in entries {
            entry
                .slot
                .resolve(Err(cause.clone_mostly("command failed with the connection")));
        }
        return None;
    }

    let mut replay = Vec::new();
    for mut entry in entries {
        if entry.cell.is_cancelled() {
            continue;
        }
        let keep = match entry.state {
            CommandState::Pending => true,
            CommandState::Sent => policy == ReplayPolicy::RetryUnconfirmed,
            _ => false,
        };
        if keep {
            replay.push(entry);
        } else {
            entry
                .slot
                .resolve(Err(cause.clone_mostly("command failed with the connection")));
        }
    }
    Some(replay)
}

async fn supervise<C: Connect>(
    connector: C,
    config: ReconnectConfig,
    shared: Arc<Shared>,
    mut rx: UnboundedReceiver<Request>,
    first: C::Stream,
) {
    let mut current = first;
    let mut replay = Vec::new();

    loop {
        let cause = match drive(current, &shared, &mut rx, std::mem::take(&mut replay)).await {
            DriveEnd::Clean => return,
            DriveEnd::Disconnected(err) => err,
        };
        debug!("connection lost: {cause}");
        notify_disconnect(&shared, cause.kind());

        let stranded = shared.queue.lock().unwrap().drain();
        match partition_stranded(stranded, &cause, config.replay_policy) {
            Some(entries) => replay = entries,
            None => {
                fail_all(&shared, &mut rx, &cause);
                return;
            }
        }

        shared.events.emit(ConnectionEvent::Reconnecting);
        match connect_with_backoff(&connector, &config).await {
            Ok(next) => {
                debug!("connection reestablished");
                shared.events.emit(ConnectionEvent::Reconnected);
                current = next;
            }
            Err(err) => {
                warn!("giving up after {} reconnect attempts: {err}", config.number_of_retries);
                let err = Error::from(err);
                for mut entry in std::mem::take(&mut replay) {
                    entry
                        .slot
                        .resolve(Err(err.clone_mostly("reconnect failed")));
                }
                fail_all(&shared, &mut rx, &err);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::new_command;
    use crate::output::ReplyBuilder;

    fn entry(state: CommandState) -> (InFlight, CommandHandle) {
        let (slot, cell, handle) = new_command();
        (
            InFlight {
                bytes: b"*1\r\n$4\r\nPING\r\n".to_vec(),
                builder: ReplyBuilder::new(ReplyShape::Value),
                slot,
                cell,
                state,
                _permit: None,
            },
            handle,
        )
    }

    #[tokio::test]
    async fn unwritten_commands_are_replayed() {
        let (pending, _pending_handle) = entry(CommandState::Pending);
        let (sent, sent_handle) = entry(CommandState::Sent);
        let cause = Error::from(io::Error::from(io::ErrorKind::ConnectionReset));

        let replay =
            partition_stranded(vec![pending, sent], &cause, ReplayPolicy::FailUnconfirmed)
                .unwrap();

        assert_eq!(replay.len(), 1);
        assert_eq!(replay[0].state, CommandState::Pending);
        let err = sent_handle.wait().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionLost);
    }

    #[tokio::test]
    async fn retry_policy_replays_written_commands() {
        let (sent, _handle) = entry(CommandState::Sent);
        let cause = Error::from(io::Error::from(io::ErrorKind::ConnectionReset));

        let replay =
            partition_stranded(vec![sent], &cause, ReplayPolicy::RetryUnconfirmed).unwrap();
        assert_eq!(replay.len(), 1);
    }

    #[tokio::test]
    async fn protocol_errors_fail_everything() {
        let (pending, pending_handle) = entry(CommandState::Pending);
        let cause = Error::from((ErrorKind::Protocol, "parse error"));

        assert!(
            partition_stranded(vec![pending], &cause, ReplayPolicy::RetryUnconfirmed).is_none()
        );
        let err = pending_handle.wait().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[tokio::test]
    async fn half_decoded_commands_always_fail() {
        let (completing, handle) = entry(CommandState::Completing);
        let cause = Error::from(io::Error::from(io::ErrorKind::ConnectionReset));

        let replay =
            partition_stranded(vec![completing], &cause, ReplayPolicy::RetryUnconfirmed).unwrap();
        assert!(replay.is_empty());
        assert!(handle.wait().await.is_err());
    }
}
