//! Reply assembly.
//!
//! The codec yields flat events; this module folds them back into complete
//! [`Value`]s. Nesting lives in an explicit frame stack so decoding stays
//! non-recursive, and a command may opt into streaming delivery where each
//! top-level element of its reply is handed out as soon as it completes.

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::codec::{AggregateKind, ReplyEvent};
use crate::errors::{Error, ErrorKind, RespResult};
use crate::push::PushKind;
use crate::value::Value;

const MAX_NESTING_DEPTH: usize = 100;

struct Frame {
    kind: AggregateKind,
    expected: usize,
    items: Vec<Value>,
}

fn finish_frame(frame: Frame) -> RespResult<Value> {
    match frame.kind {
        AggregateKind::Array => Ok(Value::Array(frame.items)),
        AggregateKind::Map => {
            let mut it = frame.items.into_iter();
            let mut pairs = Vec::with_capacity(it.len() / 2);
            while let (Some(k), Some(v)) = (it.next(), it.next()) {
                pairs.push((k, v));
            }
            Ok(Value::Map(pairs))
        }
        AggregateKind::Push => {
            let mut it = frame.items.into_iter();
            let kind = match it.next() {
                None => PushKind::Other(String::new()),
                Some(Value::BulkString(kind)) => {
                    let kind = String::from_utf8(kind).map_err(|_| {
                        Error::from((ErrorKind::Protocol, "push kind is not valid utf-8"))
                    })?;
                    PushKind::parse(kind)
                }
                Some(Value::SimpleString(kind)) => PushKind::parse(kind),
                Some(_) => {
                    return Err(Error::from((
                        ErrorKind::Protocol,
                        "push kind is not a string",
                    )))
                }
            };
            Ok(Value::Push {
                kind,
                data: it.collect(),
            })
        }
    }
}

/// Folds a stream of protocol events into complete values.
///
/// `feed` returns `Some` exactly when a top-level value finished, so the
/// caller decides what a "top level" is: the whole reply for ordinary
/// commands, one element at a time for streaming consumers.
pub(crate) struct ValueAssembler {
    frames: Vec<Frame>,
}

impl ValueAssembler {
    pub(crate) fn new() -> Self {
        ValueAssembler { frames: Vec::new() }
    }

    /// True while an aggregate is open and waiting for more elements.
    pub(crate) fn in_progress(&self) -> bool {
        !self.frames.is_empty()
    }

    pub(crate) fn feed(&mut self, event: ReplyEvent) -> RespResult<Option<Value>> {
        match event {
            ReplyEvent::Header { kind, len } => {
                if kind == AggregateKind::Push && self.in_progress() {
                    // Push frames are only legal between replies.
                    return Err(Error::from((
                        ErrorKind::Protocol,
                        "push frame inside an aggregate reply",
                    )));
                }
                if self.frames.len() >= MAX_NESTING_DEPTH {
                    return Err(Error::from((
                        ErrorKind::Protocol,
                        "maximum nesting depth exceeded",
                    )));
                }
                let expected = match kind {
                    AggregateKind::Map => len * 2,
                    _ => len,
                };
                if expected == 0 {
                    let value = finish_frame(Frame {
                        kind,
                        expected,
                        items: Vec::new(),
                    })?;
                    self.complete_element(value)
                } else {
                    self.frames.push(Frame {
                        kind,
                        expected,
                        items: Vec::with_capacity(expected),
                    });
                    Ok(None)
                }
            }
            ReplyEvent::Item(value) => self.complete_element(value),
        }
    }

    fn complete_element(&mut self, value: Value) -> RespResult<Option<Value>> {
        let mut value = value;
        loop {
            let frame = match self.frames.last_mut() {
                Some(frame) => frame,
                None => return Ok(Some(value)),
            };
            frame.items.push(value);
            if frame.items.len() < frame.expected {
                return Ok(None);
            }
            match self.frames.pop() {
                Some(frame) => value = finish_frame(frame)?,
                None => return Ok(None),
            }
        }
    }
}

/// Receives the elements of a streamed reply, in server order.
pub trait StreamSubscriber: Send {
    /// Called once per completed top-level element.
    fn on_element(&mut self, element: Value);
}

impl<F> StreamSubscriber for F
where
    F: FnMut(Value) + Send,
{
    fn on_element(&mut self, element: Value) {
        self(element)
    }
}

/// A subscriber that collects streamed elements into a shared vector.
#[derive(Clone, Default)]
pub struct VecSubscriber {
    items: Arc<Mutex<Vec<Value>>>,
}

impl VecSubscriber {
    /// Creates an empty subscriber.
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes all elements received so far.
    pub fn take(&self) -> Vec<Value> {
        std::mem::take(&mut self.items.lock().unwrap())
    }
}

impl StreamSubscriber for VecSubscriber {
    fn on_element(&mut self, element: Value) {
        self.items.lock().unwrap().push(element);
    }
}

/// How a command wants its reply delivered.
pub enum ReplyShape {
    /// The reply as decoded, no shape requirement.
    Value,
    /// Any scalar element. Aggregates are rejected.
    Scalar,
    /// An integer reply.
    Integer,
    /// A sequence reply; `Nil` converts to an empty sequence.
    List,
    /// Key-value pairs, either a native map reply or a flat even-length
    /// array of alternating keys and values.
    Map,
    /// Like [`ReplyShape::Map`], for commands whose reply is documented as
    /// field-value pairs rather than a map proper.
    KeyValuePairs,
    /// Deliver top-level elements to the subscriber as they complete. The
    /// command resolves to `Value::Int(n)` where `n` is the element count.
    Streaming(Box<dyn StreamSubscriber>),
}

impl fmt::Debug for ReplyShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReplyShape::Value => "Value",
            ReplyShape::Scalar => "Scalar",
            ReplyShape::Integer => "Integer",
            ReplyShape::List => "List",
            ReplyShape::Map => "Map",
            ReplyShape::KeyValuePairs => "KeyValuePairs",
            ReplyShape::Streaming(_) => "Streaming",
        };
        f.write_str(name)
    }
}

fn shape_mismatch(expected: &'static str, value: &Value) -> Error {
    Error::from((
        ErrorKind::UnexpectedReturnType,
        expected,
        format!("got {value:?}"),
    ))
}

fn convert(shape: &ReplyShape, value: Value) -> RespResult<Value> {
    match shape {
        ReplyShape::Value | ReplyShape::Streaming(_) => Ok(value),
        ReplyShape::Scalar => {
            if value.is_aggregate() {
                Err(shape_mismatch("expected a scalar reply", &value))
            } else {
                Ok(value)
            }
        }
        ReplyShape::Integer => match value {
            Value::Int(_) => Ok(value),
            other => Err(shape_mismatch("expected an integer reply", &other)),
        },
        ReplyShape::List => match value {
            Value::Nil => Ok(Value::Array(Vec::new())),
            Value::Array(_) => Ok(value),
            other => Err(shape_mismatch("expected a sequence reply", &other)),
        },
        ReplyShape::Map | ReplyShape::KeyValuePairs => {
            let descr = "expected a map-shaped reply";
            match value {
                Value::Map(pairs) => Ok(Value::Map(pairs)),
                other => match other.into_map_pairs() {
                    Some(pairs) => Ok(Value::Map(pairs)),
                    None => Err(Error::from((ErrorKind::UnexpectedReturnType, descr))),
                },
            }
        }
    }
}

enum BuilderInner {
    Assemble {
        shape: ReplyShape,
        assembler: ValueAssembler,
        done: Option<Value>,
    },
    Streaming {
        subscriber: Box<dyn StreamSubscriber>,
        assembler: ValueAssembler,
        // element count declared by the top-level header, None until seen
        remaining: Option<usize>,
        delivered: usize,
        done: bool,
    },
}

/// Per-command reply accumulator.
///
/// The connection driver feeds it the events belonging to one reply slot and
/// asks for the final value once the reply is complete.
pub(crate) struct ReplyBuilder {
    inner: BuilderInner,
}

impl ReplyBuilder {
    pub(crate) fn new(shape: ReplyShape) -> Self {
        let inner = match shape {
            ReplyShape::Streaming(subscriber) => BuilderInner::Streaming {
                subscriber,
                assembler: ValueAssembler::new(),
                remaining: None,
                delivered: 0,
                done: false,
            },
            shape => BuilderInner::Assemble {
                shape,
                assembler: ValueAssembler::new(),
                done: None,
            },
        };
        ReplyBuilder { inner }
    }

    /// True while no event of this reply has been consumed yet. The driver
    /// uses this to recognize reply boundaries.
    pub(crate) fn is_fresh(&self) -> bool {
        match &self.inner {
            BuilderInner::Assemble {
                assembler, done, ..
            } => done.is_none() && !assembler.in_progress(),
            BuilderInner::Streaming {
                assembler,
                remaining,
                delivered,
                done,
                ..
            } => !done && remaining.is_none() && *delivered == 0 && !assembler.in_progress(),
        }
    }

    /// Stops a streaming reply from reaching its subscriber. Assembly keeps
    /// going so the rest of the reply is still consumed.
    pub(crate) fn mute(&mut self) {
        if let BuilderInner::Streaming { subscriber, .. } = &mut self.inner {
            *subscriber = Box::new(|_: Value| {});
        }
    }

    pub(crate) fn is_complete(&self) -> bool {
        match &self.inner {
            BuilderInner::Assemble { done, .. } => done.is_some(),
            BuilderInner::Streaming { done, .. } => *done,
        }
    }

    pub(crate) fn feed(&mut self, event: ReplyEvent) -> RespResult<()> {
        match &mut self.inner {
            BuilderInner::Assemble {
                assembler, done, ..
            } => {
                if let Some(value) = assembler.feed(event)? {
                    *done = Some(value);
                }
                Ok(())
            }
            BuilderInner::Streaming {
                subscriber,
                assembler,
                remaining,
                delivered,
                done,
            } => {
                if remaining.is_none() && !assembler.in_progress() {
                    // First event of the reply decides the streaming mode.
                    match event {
                        ReplyEvent::Header {
                            kind: AggregateKind::Array,
                            len,
                        } => {
                            *remaining = Some(len);
                            if len == 0 {
                                *done = true;
                            }
                            return Ok(());
                        }
                        ReplyEvent::Header {
                            kind: AggregateKind::Map,
                            len,
                        } => {
                            *remaining = Some(len * 2);
                            if len == 0 {
                                *done = true;
                            }
                            return Ok(());
                        }
                        ReplyEvent::Header {
                            kind: AggregateKind::Push,
                            ..
                        } => {
                            return Err(Error::from((
                                ErrorKind::Protocol,
                                "push frame in a command reply slot",
                            )));
                        }
                        ReplyEvent::Item(Value::Nil) => {
                            *done = true;
                            return Ok(());
                        }
                        ReplyEvent::Item(value) => {
                            subscriber.on_element(value);
                            *delivered += 1;
                            *done = true;
                            return Ok(());
                        }
                    }
                }

                if let Some(value) = assembler.feed(event)? {
                    subscriber.on_element(value);
                    *delivered += 1;
                    if let Some(remaining) = remaining {
                        *remaining -= 1;
                        if *remaining == 0 {
                            *done = true;
                        }
                    }
                }
                Ok(())
            }
        }
    }

    pub(crate) fn finish(self) -> RespResult<Value> {
        match self.inner {
            BuilderInner::Assemble { shape, done, .. } => match done {
                Some(value) => convert(&shape, value),
                None => Err(Error::from((
                    ErrorKind::Client,
                    "reply finished before it was complete",
                ))),
            },
            BuilderInner::Streaming { delivered, .. } => Ok(Value::Int(delivered as i64)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn events(bytes: &[u8]) -> Vec<ReplyEvent> {
        use bytes::BytesMut;
        use tokio_util::codec::Decoder;

        let mut codec = crate::codec::ReplyCodec::default();
        let mut bytes = BytesMut::from(bytes);
        let mut out = Vec::new();
        while let Some(event) = codec.decode(&mut bytes).unwrap() {
            out.push(event);
        }
        out
    }

    #[test]
    fn assembles_nested_aggregates() {
        let mut assembler = ValueAssembler::new();
        let mut result = None;
        for event in events(b"*2\r\n*1\r\n:1\r\n$2\r\nab\r\n") {
            if let Some(value) = assembler.feed(event).unwrap() {
                result = Some(value);
            }
        }
        assert_eq!(
            result,
            Some(Value::Array(vec![
                Value::Array(vec![Value::Int(1)]),
                Value::BulkString(b"ab".to_vec()),
            ]))
        );
    }

    #[test]
    fn empty_aggregate_completes_immediately() {
        let mut assembler = ValueAssembler::new();
        let result = assembler
            .feed(ReplyEvent::Header {
                kind: AggregateKind::Array,
                len: 0,
            })
            .unwrap();
        assert_eq!(result, Some(Value::Array(Vec::new())));
    }

    #[test]
    fn push_inside_aggregate_is_rejected() {
        let mut assembler = ValueAssembler::new();
        assembler
            .feed(ReplyEvent::Header {
                kind: AggregateKind::Array,
                len: 2,
            })
            .unwrap();
        let err = assembler
            .feed(ReplyEvent::Header {
                kind: AggregateKind::Push,
                len: 3,
            })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn integer_shape_rejects_strings() {
        let mut builder = ReplyBuilder::new(ReplyShape::Integer);
        builder
            .feed(ReplyEvent::Item(Value::SimpleString("QUEUED".into())))
            .unwrap();
        assert!(builder.is_complete());
        let err = builder.finish().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedReturnType);
    }

    #[test]
    fn list_shape_turns_nil_into_empty() {
        let mut builder = ReplyBuilder::new(ReplyShape::List);
        builder.feed(ReplyEvent::Item(Value::Nil)).unwrap();
        assert_eq!(builder.finish().unwrap(), Value::Array(Vec::new()));
    }

    #[test]
    fn map_shape_accepts_flat_pairs() {
        let mut builder = ReplyBuilder::new(ReplyShape::Map);
        for event in events(b"*2\r\n+field\r\n$1\r\nv\r\n") {
            builder.feed(event).unwrap();
        }
        assert!(builder.is_complete());
        assert_eq!(
            builder.finish().unwrap(),
            Value::Map(vec![(
                Value::SimpleString("field".into()),
                Value::BulkString(b"v".to_vec())
            )])
        );
    }

    #[test]
    fn streaming_delivers_elements_in_order() {
        let sink = VecSubscriber::new();
        let mut builder = ReplyBuilder::new(ReplyShape::Streaming(Box::new(sink.clone())));
        for event in events(b"*3\r\n:1\r\n*1\r\n:2\r\n:3\r\n") {
            builder.feed(event).unwrap();
        }
        assert!(builder.is_complete());
        assert_eq!(builder.finish().unwrap(), Value::Int(3));
        assert_eq!(
            sink.take(),
            vec![
                Value::Int(1),
                Value::Array(vec![Value::Int(2)]),
                Value::Int(3)
            ]
        );
    }

    #[test]
    fn streaming_scalar_reply_is_a_single_element() {
        let sink = VecSubscriber::new();
        let mut builder = ReplyBuilder::new(ReplyShape::Streaming(Box::new(sink.clone())));
        builder
            .feed(ReplyEvent::Item(Value::BulkString(b"one".to_vec())))
            .unwrap();
        assert!(builder.is_complete());
        assert_eq!(builder.finish().unwrap(), Value::Int(1));
        assert_eq!(sink.take(), vec![Value::BulkString(b"one".to_vec())]);
    }

    #[test]
    fn muted_streaming_builder_stops_delivering() {
        let sink = VecSubscriber::new();
        let mut builder = ReplyBuilder::new(ReplyShape::Streaming(Box::new(sink.clone())));
        let mut stream = events(b"*3\r\n:1\r\n:2\r\n:3\r\n").into_iter();
        builder.feed(stream.next().unwrap()).unwrap();
        builder.feed(stream.next().unwrap()).unwrap();

        builder.mute();
        for event in stream {
            builder.feed(event).unwrap();
        }

        assert!(builder.is_complete());
        assert_eq!(sink.take(), vec![Value::Int(1)]);
    }

    #[test]
    fn streaming_nil_reply_is_empty() {
        let sink = VecSubscriber::new();
        let mut builder = ReplyBuilder::new(ReplyShape::Streaming(Box::new(sink.clone())));
        builder.feed(ReplyEvent::Item(Value::Nil)).unwrap();
        assert!(builder.is_complete());
        assert_eq!(builder.finish().unwrap(), Value::Int(0));
        assert!(sink.take().is_empty());
    }

    #[test]
    fn fresh_builder_becomes_stale_after_first_event() {
        let mut builder = ReplyBuilder::new(ReplyShape::Value);
        assert!(builder.is_fresh());
        builder
            .feed(ReplyEvent::Header {
                kind: AggregateKind::Array,
                len: 2,
            })
            .unwrap();
        assert!(!builder.is_fresh());
        assert!(!builder.is_complete());
    }
}
