//! The pipelined connection driver.
//!
//! A single task owns the socket. Submissions arrive over a channel, are
//! written in submission order and occupy a reply slot each; decoded events
//! are correlated against the slot queue head. Pipelining depth is bounded
//! by a semaphore whose permits travel with the in-flight commands.

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use log::{debug, trace};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{Semaphore, TryAcquireError};
use tokio_util::codec::Decoder;

use crate::cmd::Cmd;
use crate::codec::{AggregateKind, ReplyCodec, ReplyEvent};
use crate::dispatch::{
    new_command, CommandCell, CommandHandle, CommandState, DispatchQueue, InFlight, ReplySlot,
};
use crate::errors::{Error, ErrorKind, RespResult};
use crate::events::{ConnectionEvent, EventListener, LifecycleListeners};
use crate::output::{ReplyBuilder, ReplyShape, ValueAssembler};
use crate::push::{ListenerId, OutOfBandRouter, PushInfo, PushKind};
use crate::value::Value;

const DEFAULT_PIPELINE_DEPTH: usize = 50;

/// Tunables of a single connection.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub(crate) pipeline_depth: usize,
    pub(crate) response_timeout: Option<Duration>,
    pub(crate) max_argument_size: Option<usize>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        ConnectionOptions {
            pipeline_depth: DEFAULT_PIPELINE_DEPTH,
            response_timeout: None,
            max_argument_size: None,
        }
    }
}

impl ConnectionOptions {
    /// Maximum number of commands awaiting replies at once. Submissions
    /// beyond the limit wait (or fail fast with `try_submit`).
    pub fn pipeline_depth(mut self, depth: usize) -> Self {
        self.pipeline_depth = depth.max(1);
        self
    }

    /// Cancels a command whose reply has not resolved within `timeout`.
    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = Some(timeout);
        self
    }

    /// Rejects commands carrying any argument larger than `ceiling` bytes.
    pub fn max_argument_size(mut self, ceiling: usize) -> Self {
        self.max_argument_size = Some(ceiling);
        self
    }
}

/// State shared between command handles and the driver task.
pub(crate) struct Shared {
    pub(crate) queue: Mutex<DispatchQueue>,
    pub(crate) generation: AtomicU64,
    pub(crate) slots: Arc<Semaphore>,
    pub(crate) pushes: OutOfBandRouter,
    pub(crate) events: LifecycleListeners,
}

pub(crate) struct Request {
    bytes: Vec<u8>,
    builder: ReplyBuilder,
    slot: ReplySlot,
    cell: Arc<CommandCell>,
    permit: Option<tokio::sync::OwnedSemaphorePermit>,
    generation: u64,
}

/// Routes decoded events to the queue head or, for push frames, past the
/// queue to the out-of-band listeners.
#[derive(Default)]
struct ReplyRouter {
    // assembler of a push frame currently being received
    push: Option<ValueAssembler>,
}

impl ReplyRouter {
    fn route(&mut self, event: ReplyEvent, shared: &Shared) -> RespResult<()> {
        if let Some(assembler) = &mut self.push {
            if let Some(value) = assembler.feed(event)? {
                self.push = None;
                dispatch_push(shared, value);
            }
            return Ok(());
        }

        let opens_push = matches!(
            &event,
            ReplyEvent::Header {
                kind: AggregateKind::Push,
                ..
            } | ReplyEvent::Item(Value::Push { .. })
        );
        if opens_push {
            let at_boundary = {
                let mut queue = shared.queue.lock().unwrap();
                match queue.head_mut() {
                    None => true,
                    Some(head) => head.builder.is_fresh(),
                }
            };
            if !at_boundary {
                return Err(Error::from((
                    ErrorKind::Protocol,
                    "push frame inside a command reply",
                )));
            }
            match event {
                // a negative push length decoded to a complete empty frame
                ReplyEvent::Item(value) => dispatch_push(shared, value),
                event => {
                    let mut assembler = ValueAssembler::new();
                    match assembler.feed(event)? {
                        Some(value) => dispatch_push(shared, value),
                        None => self.push = Some(assembler),
                    }
                }
            }
            return Ok(());
        }

        let mut queue = shared.queue.lock().unwrap();
        let head = match queue.head_mut() {
            Some(head) => head,
            None => {
                return Err(Error::from((
                    ErrorKind::OrderingViolation,
                    "reply arrived with no command in flight",
                )))
            }
        };

        // An error reply at a reply boundary fails exactly the head command.
        let event = if head.builder.is_fresh() {
            match event {
                ReplyEvent::Item(Value::ServerError(server_err)) => {
                    let entry = queue.pop_head();
                    drop(queue);
                    if let Some(mut entry) = entry {
                        if entry.cell.is_cancelled()
                            || !entry.slot.resolve(Err(server_err.into()))
                        {
                            debug!("discarding error reply for a cancelled command");
                        }
                    }
                    return Ok(());
                }
                event => event,
            }
        } else {
            event
        };

        let complete = {
            let head = match queue.head_mut() {
                Some(head) => head,
                None => {
                    return Err(Error::from((
                        ErrorKind::OrderingViolation,
                        "reply arrived with no command in flight",
                    )))
                }
            };
            if head.cell.is_cancelled() {
                head.state = CommandState::Cancelled;
                head.builder.mute();
            } else {
                head.state = CommandState::Completing;
            }
            head.builder.feed(event)?;
            head.builder.is_complete()
        };

        if complete {
            let entry = queue.pop_head();
            drop(queue);
            if let Some(mut entry) = entry {
                entry.state = CommandState::Done;
                let result = entry.builder.finish();
                if entry.cell.is_cancelled() || !entry.slot.resolve(result) {
                    debug!("discarding reply for a cancelled command");
                }
            }
        }
        Ok(())
    }
}

fn dispatch_push(shared: &Shared, value: Value) {
    if let Value::Push { kind, data } = value {
        trace!("push message: {kind:?}");
        shared.pushes.dispatch(PushInfo { kind, data });
    }
}

pub(crate) enum DriveEnd {
    /// All submitters went away and the queue drained.
    Clean,
    /// The transport failed, or decoding hit a fatal error.
    Disconnected(Error),
}

/// Runs one connection until it ends. `replay` entries are written before
/// any new submission; the caller owns what happens to the queue afterwards.
pub(crate) async fn drive<C>(
    stream: C,
    shared: &Shared,
    rx: &mut UnboundedReceiver<Request>,
    replay: Vec<InFlight>,
) -> DriveEnd
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    let framed = ReplyCodec::default().framed(stream);
    let (mut sink, mut stream) = framed.split();
    let mut router = ReplyRouter::default();

    for mut entry in replay {
        let bytes = entry.bytes.clone();
        entry.state = CommandState::Pending;
        shared.queue.lock().unwrap().push_back(entry);
        if let Err(err) = sink.send(bytes).await {
            return DriveEnd::Disconnected(err);
        }
        shared.queue.lock().unwrap().mark_sent_back();
    }

    let mut accepting = true;
    loop {
        tokio::select! {
            biased;
            item = stream.next() => {
                match item {
                    Some(Ok(event)) => {
                        if let Err(err) = router.route(event, shared) {
                            return DriveEnd::Disconnected(err);
                        }
                        if !accepting && shared.queue.lock().unwrap().is_empty() {
                            return DriveEnd::Clean;
                        }
                    }
                    Some(Err(err)) => return DriveEnd::Disconnected(err),
                    None => {
                        if !accepting && shared.queue.lock().unwrap().is_empty() {
                            return DriveEnd::Clean;
                        }
                        return DriveEnd::Disconnected(Error::from(io::Error::from(
                            io::ErrorKind::UnexpectedEof,
                        )));
                    }
                }
            }
            req = rx.recv(), if accepting => {
                match req {
                    Some(mut req) => {
                        let stale =
                            req.generation != shared.generation.load(Ordering::SeqCst);
                        if stale || req.cell.is_cancelled() {
                            req.cell.cancel();
                            req.slot.cancel();
                            continue;
                        }
                        let entry = InFlight {
                            bytes: req.bytes.clone(),
                            builder: req.builder,
                            slot: req.slot,
                            cell: req.cell,
                            state: CommandState::Pending,
                            _permit: req.permit,
                        };
                        shared.queue.lock().unwrap().push_back(entry);
                        if let Err(err) = sink.send(req.bytes).await {
                            return DriveEnd::Disconnected(err);
                        }
                        shared.queue.lock().unwrap().mark_sent_back();
                    }
                    None => {
                        accepting = false;
                        if shared.queue.lock().unwrap().is_empty() {
                            return DriveEnd::Clean;
                        }
                    }
                }
            }
        }
    }
}

/// Announces a disconnect to push listeners and lifecycle listeners.
pub(crate) fn notify_disconnect(shared: &Shared, kind: ErrorKind) {
    shared.pushes.dispatch(PushInfo {
        kind: PushKind::Disconnection,
        data: Vec::new(),
    });
    shared.events.emit(ConnectionEvent::Disconnected(kind));
}

/// Permanently tears the connection down: fails everything queued or still
/// in the submission channel and refuses future submissions.
pub(crate) fn fail_all(shared: &Shared, rx: &mut UnboundedReceiver<Request>, cause: &Error) {
    shared.slots.close();
    let stranded = shared.queue.lock().unwrap().drain();
    for mut entry in stranded {
        entry
            .slot
            .resolve(Err(cause.clone_mostly("command failed with the connection")));
    }
    rx.close();
    while let Ok(mut req) = rx.try_recv() {
        req.slot
            .resolve(Err(cause.clone_mostly("command failed with the connection")));
    }
}

pub(crate) struct HandleInner {
    sender: UnboundedSender<Request>,
    pub(crate) shared: Arc<Shared>,
    options: ConnectionOptions,
}

impl HandleInner {
    pub(crate) fn new(options: ConnectionOptions) -> (Arc<Self>, UnboundedReceiver<Request>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            queue: Mutex::new(DispatchQueue::default()),
            generation: AtomicU64::new(0),
            slots: Arc::new(Semaphore::new(options.pipeline_depth)),
            pushes: OutOfBandRouter::default(),
            events: LifecycleListeners::default(),
        });
        (
            Arc::new(HandleInner {
                sender,
                shared,
                options,
            }),
            receiver,
        )
    }

    pub(crate) async fn submit(&self, cmd: &Cmd, shape: ReplyShape) -> RespResult<CommandHandle> {
        let bytes = cmd.pack(self.options.max_argument_size)?;
        let permit = self
            .shared
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| closed_error())?;
        self.submit_packed(bytes, shape, Some(permit))
    }

    pub(crate) fn try_submit(&self, cmd: &Cmd, shape: ReplyShape) -> RespResult<CommandHandle> {
        let bytes = cmd.pack(self.options.max_argument_size)?;
        let permit = match self.shared.slots.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => {
                return Err(Error::from((
                    ErrorKind::Backpressure,
                    "pipeline depth limit reached",
                )))
            }
            Err(TryAcquireError::Closed) => return Err(closed_error()),
        };
        self.submit_packed(bytes, shape, Some(permit))
    }

    fn submit_packed(
        &self,
        bytes: Vec<u8>,
        shape: ReplyShape,
        permit: Option<tokio::sync::OwnedSemaphorePermit>,
    ) -> RespResult<CommandHandle> {
        let (slot, cell, handle) = new_command();
        let request = Request {
            bytes,
            builder: ReplyBuilder::new(shape),
            slot,
            cell,
            permit,
            generation: self.shared.generation.load(Ordering::SeqCst),
        };
        self.sender.send(request).map_err(|_| closed_error())?;
        Ok(handle)
    }

    pub(crate) async fn send(&self, cmd: &Cmd, shape: ReplyShape) -> RespResult<Value> {
        let handle = self.submit(cmd, shape).await?;
        match self.options.response_timeout {
            None => handle.wait().await,
            Some(timeout) => {
                let cell = handle.cell();
                match tokio::time::timeout(timeout, handle.wait()).await {
                    Ok(result) => result,
                    Err(_) => {
                        cell.cancel();
                        Err(Error::from((
                            ErrorKind::Cancelled,
                            "response timeout elapsed",
                        )))
                    }
                }
            }
        }
    }

    /// Cancels everything in flight and everything still queued for
    /// submission. Replies owed on the wire are still consumed, so later
    /// commands keep their alignment.
    pub(crate) fn reset(&self) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        self.shared.queue.lock().unwrap().cancel_all();
    }
}

fn closed_error() -> Error {
    Error::from(io::Error::new(
        io::ErrorKind::BrokenPipe,
        "connection is closed",
    ))
}

/// A pipelined connection over a single transport.
///
/// Cloning is cheap and every clone talks to the same driver task, so one
/// connection can be shared across tasks.
#[derive(Clone)]
pub struct PipelinedConnection {
    inner: Arc<HandleInner>,
}

impl PipelinedConnection {
    /// Wraps an established transport. Returns the connection and the driver
    /// future; the caller decides where the driver runs, usually
    /// `tokio::spawn`.
    pub fn new<C>(stream: C, options: ConnectionOptions) -> (Self, impl Future<Output = ()>)
    where
        C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (inner, mut rx) = HandleInner::new(options);
        let shared = inner.shared.clone();
        let driver = async move {
            match drive(stream, &shared, &mut rx, Vec::new()).await {
                DriveEnd::Clean => {}
                DriveEnd::Disconnected(err) => {
                    debug!("connection closed: {err}");
                    notify_disconnect(&shared, err.kind());
                    fail_all(&shared, &mut rx, &err);
                }
            }
        };
        (PipelinedConnection { inner }, driver)
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
    /// [`ErrorKind::Backpressure`] instead of waiting for a slot.
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
