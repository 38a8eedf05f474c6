//! The wire codec.
//!
//! Decoding is event granular: every invocation yields at most one scalar
//! element or one aggregate header. Nesting state lives outside the parser,
//! in [`ValueAssembler`](crate::output::ValueAssembler), so a partially
//! received aggregate never blocks the read loop and streaming consumers can
//! observe elements before the enclosing reply is complete.

use std::{io, str};

use bytes::{Buf, BytesMut};
use combine::{
    any,
    error::StreamError,
    opaque,
    parser::{
        byte::{crlf, take_until_bytes},
        combinator::{any_send_sync_partial_state, AnySendSyncPartialState},
        range::{recognize, take},
    },
    stream::{RangeStream, StreamErrorFor},
    ParseError, Parser as _,
};
use tokio_util::codec::{Decoder, Encoder};

use crate::errors::{Error, ErrorKind, RespResult, ServerError};
use crate::output::ValueAssembler;
use crate::push::PushKind;
use crate::value::Value;

/// The aggregate families the wire protocol can open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateKind {
    /// An ordered sequence of elements.
    Array,
    /// Key-value pairs; the declared length counts pairs, not elements.
    Map,
    /// An out-of-band push frame.
    Push,
}

/// One decoded protocol event.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyEvent {
    /// A complete scalar element.
    Item(Value),
    /// An aggregate header announcing `len` upcoming elements (or pairs).
    Header {
        /// Which aggregate family was opened.
        kind: AggregateKind,
        /// Declared element count. Negative wire lengths never reach here;
        /// they decode to an `Item` instead: `Nil` for arrays and maps, an
        /// empty `Push` for the push marker.
        len: usize,
    },
}

fn event<'a, I>(
) -> impl combine::Parser<I, Output = ReplyEvent, PartialState = AnySendSyncPartialState>
where
    I: RangeStream<Token = u8, Range = &'a [u8]>,
    I::Error: combine::ParseError<u8, &'a [u8], I::Position>,
{
    opaque!(any_send_sync_partial_state(any().then_partial(move |&mut b| {
        let line = || {
            recognize(take_until_bytes(&b"\r\n"[..]).with(take(2).map(|_| ()))).and_then(
                |line: &[u8]| {
                    str::from_utf8(&line[..line.len() - 2]).map_err(StreamErrorFor::<I>::other)
                },
            )
        };

        let simple_string = || {
            line().map(|line| {
                if line == "OK" {
                    Value::Okay
                } else {
                    Value::SimpleString(line.into())
                }
            })
        };

        let int = || {
            line().and_then(|line| {
                line.trim().parse::<i64>().map_err(|_| {
                    StreamErrorFor::<I>::message_static_message("Expected integer, got garbage")
                })
            })
        };

        let bulk_string = || {
            int().then_partial(move |size| {
                if *size < 0 {
                    combine::produce(|| Value::Nil).left()
                } else {
                    take(*size as usize)
                        .map(|bs: &[u8]| Value::BulkString(bs.to_vec()))
                        .skip(crlf())
                        .right()
                }
            })
        };

        let header = move |kind: AggregateKind| {
            int().map(move |len| {
                if len < 0 {
                    match kind {
                        AggregateKind::Push => ReplyEvent::Item(Value::Push {
                            kind: PushKind::Other(String::new()),
                            data: Vec::new(),
                        }),
                        _ => ReplyEvent::Item(Value::Nil),
                    }
                } else {
                    ReplyEvent::Header {
                        kind,
                        len: len as usize,
                    }
                }
            })
        };

        let error = || line().map(|line| Value::ServerError(ServerError::parse(line)));
        let null = || line().map(|_| Value::Nil);
        let double = || {
            line().and_then(|line| {
                line.trim()
                    .parse::<f64>()
                    .map_err(StreamErrorFor::<I>::other)
            })
        };
        let boolean = || {
            line().and_then(|line: &str| match line {
                "t" => Ok(true),
                "f" => Ok(false),
                _ => Err(StreamErrorFor::<I>::message_static_message(
                    "Expected boolean, got garbage",
                )),
            })
        };

        combine::dispatch!(b;
            b'+' => simple_string().map(ReplyEvent::Item),
            b':' => int().map(|i| ReplyEvent::Item(Value::Int(i))),
            b'$' => bulk_string().map(ReplyEvent::Item),
            b'*' => header(AggregateKind::Array),
            b'%' => header(AggregateKind::Map),
            b'>' => header(AggregateKind::Push),
            b'-' => error().map(ReplyEvent::Item),
            b'_' => null().map(ReplyEvent::Item),
            b',' => double().map(|d| ReplyEvent::Item(Value::Double(d))),
            b'#' => boolean().map(|b| ReplyEvent::Item(Value::Boolean(b))),
            b => combine::unexpected_any(combine::error::Token(b))
        )
    })))
}

/// Stateful codec over a byte stream of protocol events.
///
/// Partial input is resumable: a decode call that runs out of bytes returns
/// `None` and the next call picks up exactly where the previous one stopped,
/// so chunk boundaries may fall anywhere, including inside a length prefix
/// or a `\r\n` terminator.
#[derive(Default)]
pub struct ReplyCodec {
    state: AnySendSyncPartialState,
}

impl ReplyCodec {
    fn decode_stream(&mut self, bytes: &mut BytesMut, eof: bool) -> RespResult<Option<ReplyEvent>> {
        let (opt, removed_len) = {
            let buffer = &bytes[..];
            let mut stream =
                combine::easy::Stream(combine::stream::MaybePartialStream(buffer, !eof));
            match combine::stream::decode_tokio(event(), &mut stream, &mut self.state) {
                Ok(x) => x,
                Err(err) => {
                    if eof && err.is_unexpected_end_of_input() {
                        // The peer closed mid element. A connection event,
                        // not a protocol violation.
                        return Err(Error::from(io::Error::from(io::ErrorKind::UnexpectedEof)));
                    }
                    let err = err
                        .map_position(|pos| pos.translate_position(buffer))
                        .map_range(|range| format!("{range:?}"))
                        .to_string();
                    return Err(Error::from((ErrorKind::Protocol, "parse error", err)));
                }
            }
        };

        bytes.advance(removed_len);
        Ok(opt)
    }
}

impl Encoder<Vec<u8>> for ReplyCodec {
    type Error = Error;
    fn encode(&mut self, item: Vec<u8>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(item.as_ref());
        Ok(())
    }
}

impl Decoder for ReplyCodec {
    type Item = ReplyEvent;
    type Error = Error;

    fn decode(&mut self, bytes: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.decode_stream(bytes, false)
    }

    fn decode_eof(&mut self, bytes: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.decode_stream(bytes, true)
    }
}

/// Parses a single complete reply out of a byte slice.
///
/// This is the straightforward way to turn captured wire bytes into a
/// [`Value`] without driving a connection. A top-level error reply is
/// returned as `Err`; errors nested inside an aggregate stay embedded as
/// [`Value::ServerError`] elements.
pub fn parse_resp_value(bytes: &[u8]) -> RespResult<Value> {
    let mut codec = ReplyCodec::default();
    let mut bytes = BytesMut::from(bytes);
    let mut assembler = ValueAssembler::new();

    loop {
        let event = match codec.decode_stream(&mut bytes, true)? {
            Some(event) => event,
            None => {
                return Err(Error::from(io::Error::from(io::ErrorKind::UnexpectedEof)));
            }
        };
        if let Some(value) = assembler.feed(event)? {
            return match value {
                Value::ServerError(err) => Err(err.into()),
                value => Ok(value),
            };
        }
    }
}
