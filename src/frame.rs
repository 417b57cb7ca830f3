//! Frame-level codec: the payload units carried inside QUIC packets.

use std::fmt;
use std::io::Cursor;
use std::ops::Range;

use bytes::{Buf, BufMut, Bytes};
use slog;

use coding::{self, BufExt, BufMutExt};
use packet::ConnectionId;
use range_set::RangeSet;
use spaces::SpaceId;
use {Directionality, StreamId, MAX_CID_SIZE, RESET_TOKEN_SIZE};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Type(pub u64);

macro_rules! frame_types {
    {$($name:ident = $val:expr,)*} => {
        impl Type {
            $(pub const $name: Type = Type($val);)*
        }

        impl fmt::Display for Type {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                match self.0 {
                    $($val => f.write_str(stringify!($name)),)*
                    x if STREAM_TYS.contains(&x) => f.write_str("STREAM"),
                    _ => write!(f, "<unknown {:02x}>", self.0),
                }
            }
        }
    }
}

frame_types! {
    PADDING = 0x00,
    PING = 0x01,
    ACK = 0x02,
    ACK_ECN = 0x03,
    RESET_STREAM = 0x04,
    STOP_SENDING = 0x05,
    CRYPTO = 0x06,
    NEW_TOKEN = 0x07,
    MAX_DATA = 0x10,
    MAX_STREAM_DATA = 0x11,
    MAX_STREAMS_BIDI = 0x12,
    MAX_STREAMS_UNI = 0x13,
    DATA_BLOCKED = 0x14,
    STREAM_DATA_BLOCKED = 0x15,
    STREAMS_BLOCKED_BIDI = 0x16,
    STREAMS_BLOCKED_UNI = 0x17,
    NEW_CONNECTION_ID = 0x18,
    RETIRE_CONNECTION_ID = 0x19,
    PATH_CHALLENGE = 0x1a,
    PATH_RESPONSE = 0x1b,
    CONNECTION_CLOSE = 0x1c,
    APPLICATION_CLOSE = 0x1d,
    HANDSHAKE_DONE = 0x1e,
}

const STREAM_TYS: Range<u64> = 0x08..0x10;
const STREAM_FIN_BIT: u64 = 0x01;
const STREAM_LEN_BIT: u64 = 0x02;
const STREAM_OFF_BIT: u64 = 0x04;

impl From<Type> for u8 {
    fn from(x: Type) -> u8 {
        x.0 as u8
    }
}

impl coding::Codec for Type {
    fn decode<B: Buf>(buf: &mut B) -> coding::Result<Type> {
        Ok(Type(buf.get_var()?))
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.write_var(self.0);
    }
}

impl slog::Value for Type {
    fn serialize(
        &self,
        _: &slog::Record,
        key: slog::Key,
        serializer: &mut slog::Serializer,
    ) -> slog::Result {
        serializer.emit_arguments(key, &format_args!("{}", self))
    }
}

#[derive(Debug, Clone)]
pub enum Frame {
    Padding,
    Ping,
    Ack(Ack),
    ResetStream(ResetStream),
    StopSending { id: StreamId, error_code: u64 },
    Crypto(Crypto),
    NewToken { token: Bytes },
    Stream(Stream),
    MaxData(u64),
    MaxStreamData { id: StreamId, offset: u64 },
    MaxStreams { directionality: Directionality, count: u64 },
    DataBlocked { offset: u64 },
    StreamDataBlocked { id: StreamId, offset: u64 },
    StreamsBlocked { directionality: Directionality, limit: u64 },
    NewConnectionId(NewConnectionId),
    RetireConnectionId { sequence: u64 },
    PathChallenge(u64),
    PathResponse(u64),
    ConnectionClose(ConnectionClose),
    ApplicationClose(ApplicationClose),
    HandshakeDone,
    Invalid(Type),
}

impl Frame {
    pub fn ty(&self) -> Type {
        use self::Frame::*;
        match *self {
            Padding => Type::PADDING,
            Ping => Type::PING,
            Ack(_) => Type::ACK,
            ResetStream(_) => Type::RESET_STREAM,
            StopSending { .. } => Type::STOP_SENDING,
            Crypto(_) => Type::CRYPTO,
            NewToken { .. } => Type::NEW_TOKEN,
            Stream(ref x) => {
                let mut ty = STREAM_TYS.start;
                if x.offset != 0 {
                    ty |= STREAM_OFF_BIT;
                }
                if x.fin {
                    ty |= STREAM_FIN_BIT;
                }
                Type(ty)
            }
            MaxData(_) => Type::MAX_DATA,
            MaxStreamData { .. } => Type::MAX_STREAM_DATA,
            MaxStreams {
                directionality: Directionality::Bi,
                ..
            } => Type::MAX_STREAMS_BIDI,
            MaxStreams { .. } => Type::MAX_STREAMS_UNI,
            DataBlocked { .. } => Type::DATA_BLOCKED,
            StreamDataBlocked { .. } => Type::STREAM_DATA_BLOCKED,
            StreamsBlocked {
                directionality: Directionality::Bi,
                ..
            } => Type::STREAMS_BLOCKED_BIDI,
            StreamsBlocked { .. } => Type::STREAMS_BLOCKED_UNI,
            NewConnectionId(_) => Type::NEW_CONNECTION_ID,
            RetireConnectionId { .. } => Type::RETIRE_CONNECTION_ID,
            PathChallenge(_) => Type::PATH_CHALLENGE,
            PathResponse(_) => Type::PATH_RESPONSE,
            ConnectionClose(_) => Type::CONNECTION_CLOSE,
            ApplicationClose(_) => Type::APPLICATION_CLOSE,
            HandshakeDone => Type::HANDSHAKE_DONE,
            Invalid(ty) => ty,
        }
    }

    /// Whether a packet carrying this frame obliges the peer to acknowledge it
    pub fn is_ack_eliciting(&self) -> bool {
        use self::Frame::*;
        match *self {
            Padding | Ack(_) | ConnectionClose(_) | ApplicationClose(_) => false,
            _ => true,
        }
    }

    /// Whether this frame may appear at the given encryption level
    pub fn allowed_in(&self, space: SpaceId) -> bool {
        use self::Frame::*;
        if space == SpaceId::Data {
            return true;
        }
        match *self {
            Padding | Ping | Ack(_) | Crypto(_) | ConnectionClose(_) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Ack {
    pub largest: u64,
    pub delay: u64,
    /// Acknowledged ranges, in descending packet-number order
    pub ranges: Vec<Range<u64>>,
    pub ecn: Option<EcnCounts>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct EcnCounts {
    pub ect0: u64,
    pub ect1: u64,
    pub ce: u64,
}

impl Ack {
    pub fn encode<W: BufMut>(delay: u64, ranges: &RangeSet, buf: &mut W) {
        debug_assert!(!ranges.is_empty());
        let mut rest = ranges.iter().rev();
        let first = rest.next().unwrap();
        let largest = first.end - 1;
        buf.write(Type::ACK);
        buf.write_var(largest);
        buf.write_var(delay);
        buf.write_var(ranges.len() as u64 - 1);
        buf.write_var(first.end - first.start - 1);
        let mut prev = first.start;
        for block in rest {
            buf.write_var(prev - block.end - 1); // gap
            buf.write_var(block.end - block.start - 1);
            prev = block.start;
        }
    }

    fn decode<B: Buf>(buf: &mut B, ecn: bool) -> Result<Ack, IterErr> {
        let largest = buf.get_var()?;
        let delay = buf.get_var()?;
        let extra_blocks = buf.get_var()?;
        let first = buf.get_var()?;
        let mut smallest = largest.checked_sub(first).ok_or(IterErr::Malformed)?;
        let mut ranges = Vec::with_capacity(extra_blocks as usize + 1);
        ranges.push(smallest..largest + 1);
        for _ in 0..extra_blocks {
            let gap = buf.get_var()?;
            let largest = smallest
                .checked_sub(gap.checked_add(2).ok_or(IterErr::Malformed)?)
                .ok_or(IterErr::Malformed)?;
            let len = buf.get_var()?;
            smallest = largest.checked_sub(len).ok_or(IterErr::Malformed)?;
            ranges.push(smallest..largest + 1);
        }
        let ecn = if ecn {
            Some(EcnCounts {
                ect0: buf.get_var()?,
                ect1: buf.get_var()?,
                ce: buf.get_var()?,
            })
        } else {
            None
        };
        Ok(Ack {
            largest,
            delay,
            ranges,
            ecn,
        })
    }

    pub fn iter(&self) -> ::std::iter::Cloned<::std::slice::Iter<Range<u64>>> {
        self.ranges.iter().cloned()
    }
}

impl<'a> IntoIterator for &'a Ack {
    type Item = Range<u64>;
    type IntoIter = ::std::iter::Cloned<::std::slice::Iter<'a, Range<u64>>>;
    fn into_iter(self) -> Self::IntoIter {
        self.ranges.iter().cloned()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ResetStream {
    pub id: StreamId,
    pub error_code: u64,
    pub final_offset: u64,
}

impl ResetStream {
    pub fn encode<W: BufMut>(&self, buf: &mut W) {
        buf.write(Type::RESET_STREAM);
        buf.write(self.id);
        buf.write_var(self.error_code);
        buf.write_var(self.final_offset);
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Crypto {
    pub offset: u64,
    pub data: Bytes,
}

impl Crypto {
    /// Bytes of overhead for a CRYPTO frame header, assuming worst-case varints
    pub const SIZE_BOUND: usize = 17;

    pub fn encode<W: BufMut>(&self, buf: &mut W) {
        buf.write(Type::CRYPTO);
        buf.write_var(self.offset);
        buf.write_var(self.data.len() as u64);
        buf.put_slice(&self.data);
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Stream {
    pub id: StreamId,
    pub offset: u64,
    pub fin: bool,
    pub data: Bytes,
}

impl Stream {
    /// Bytes of overhead for a STREAM frame header, assuming worst-case varints
    pub const SIZE_BOUND: usize = 25;

    pub fn encode<W: BufMut>(&self, length_suffix: bool, buf: &mut W) {
        let mut ty = STREAM_TYS.start;
        if self.offset != 0 {
            ty |= STREAM_OFF_BIT;
        }
        if length_suffix {
            ty |= STREAM_LEN_BIT;
        }
        if self.fin {
            ty |= STREAM_FIN_BIT;
        }
        buf.write_var(ty);
        buf.write(self.id);
        if self.offset != 0 {
            buf.write_var(self.offset);
        }
        if length_suffix {
            buf.write_var(self.data.len() as u64);
        }
        buf.put_slice(&self.data);
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct NewConnectionId {
    pub sequence: u64,
    pub retire_prior_to: u64,
    pub id: ConnectionId,
    pub reset_token: [u8; RESET_TOKEN_SIZE],
}

impl NewConnectionId {
    pub fn encode<W: BufMut>(&self, buf: &mut W) {
        buf.write(Type::NEW_CONNECTION_ID);
        buf.write_var(self.sequence);
        buf.write_var(self.retire_prior_to);
        buf.write(self.id.len);
        buf.put_slice(&self.id);
        buf.put_slice(&self.reset_token);
    }
}

/// Connection close at the transport level
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ConnectionClose {
    pub error_code: u64,
    pub frame_type: Option<Type>,
    pub reason: Bytes,
}

impl fmt::Display for ConnectionClose {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "code {:#x}", self.error_code)?;
        if !self.reason.is_empty() {
            write!(f, ": {}", String::from_utf8_lossy(&self.reason))?;
        }
        Ok(())
    }
}

impl ConnectionClose {
    pub fn encode<W: BufMut>(&self, buf: &mut W, max_len: usize) {
        buf.write(Type::CONNECTION_CLOSE);
        buf.write_var(self.error_code);
        buf.write(self.frame_type.unwrap_or(Type::PADDING));
        let max_reason = max_len.saturating_sub(12);
        let reason_len = self.reason.len().min(max_reason);
        buf.write_var(reason_len as u64);
        buf.put_slice(&self.reason[..reason_len]);
    }
}

/// Connection close at the application level
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ApplicationClose {
    pub error_code: u64,
    pub reason: Bytes,
}

impl fmt::Display for ApplicationClose {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "code {:#x}", self.error_code)?;
        if !self.reason.is_empty() {
            write!(f, ": {}", String::from_utf8_lossy(&self.reason))?;
        }
        Ok(())
    }
}

impl ApplicationClose {
    pub fn encode<W: BufMut>(&self, buf: &mut W, max_len: usize) {
        buf.write(Type::APPLICATION_CLOSE);
        buf.write_var(self.error_code);
        let max_reason = max_len.saturating_sub(11);
        let reason_len = self.reason.len().min(max_reason);
        buf.write_var(reason_len as u64);
        buf.put_slice(&self.reason[..reason_len]);
    }
}

/// Iterator over the frames in a packet payload
///
/// A malformed frame yields `Frame::Invalid` carrying the offending type, then ends the
/// iteration; the connection closes with FRAME_ENCODING_ERROR in response.
pub struct Iter {
    bytes: Cursor<Bytes>,
    last_ty: Type,
}

enum IterErr {
    UnexpectedEnd,
    Malformed,
    UnknownType,
}

impl From<coding::UnexpectedEnd> for IterErr {
    fn from(_: coding::UnexpectedEnd) -> Self {
        IterErr::UnexpectedEnd
    }
}

impl Iter {
    pub fn new(payload: Bytes) -> Self {
        Iter {
            bytes: Cursor::new(payload),
            last_ty: Type::PADDING,
        }
    }

    fn take_len(&mut self) -> Result<Bytes, IterErr> {
        let len = self.bytes.get_var()?;
        if len > self.bytes.remaining() as u64 {
            return Err(IterErr::UnexpectedEnd);
        }
        Ok(self.take(len as usize))
    }

    fn take_remaining(&mut self) -> Bytes {
        let len = self.bytes.remaining();
        self.take(len)
    }

    fn take(&mut self, len: usize) -> Bytes {
        let start = self.bytes.position() as usize;
        self.bytes.advance(len);
        self.bytes.get_ref().slice(start, start + len)
    }

    fn try_next(&mut self) -> Result<Frame, IterErr> {
        let ty = self.bytes.get::<Type>()?;
        self.last_ty = ty;
        Ok(match ty {
            Type::PADDING => Frame::Padding,
            Type::PING => Frame::Ping,
            Type::ACK | Type::ACK_ECN => {
                Frame::Ack(Ack::decode(&mut self.bytes, ty == Type::ACK_ECN)?)
            }
            Type::RESET_STREAM => Frame::ResetStream(ResetStream {
                id: self.bytes.get()?,
                error_code: self.bytes.get_var()?,
                final_offset: self.bytes.get_var()?,
            }),
            Type::STOP_SENDING => Frame::StopSending {
                id: self.bytes.get()?,
                error_code: self.bytes.get_var()?,
            },
            Type::CRYPTO => {
                let offset = self.bytes.get_var()?;
                let data = self.take_len()?;
                Frame::Crypto(Crypto { offset, data })
            }
            Type::NEW_TOKEN => {
                let token = self.take_len()?;
                if token.is_empty() {
                    return Err(IterErr::Malformed);
                }
                Frame::NewToken { token }
            }
            Type::MAX_DATA => Frame::MaxData(self.bytes.get_var()?),
            Type::MAX_STREAM_DATA => Frame::MaxStreamData {
                id: self.bytes.get()?,
                offset: self.bytes.get_var()?,
            },
            Type::MAX_STREAMS_BIDI => Frame::MaxStreams {
                directionality: Directionality::Bi,
                count: self.bytes.get_var()?,
            },
            Type::MAX_STREAMS_UNI => Frame::MaxStreams {
                directionality: Directionality::Uni,
                count: self.bytes.get_var()?,
            },
            Type::DATA_BLOCKED => Frame::DataBlocked {
                offset: self.bytes.get_var()?,
            },
            Type::STREAM_DATA_BLOCKED => Frame::StreamDataBlocked {
                id: self.bytes.get()?,
                offset: self.bytes.get_var()?,
            },
            Type::STREAMS_BLOCKED_BIDI => Frame::StreamsBlocked {
                directionality: Directionality::Bi,
                limit: self.bytes.get_var()?,
            },
            Type::STREAMS_BLOCKED_UNI => Frame::StreamsBlocked {
                directionality: Directionality::Uni,
                limit: self.bytes.get_var()?,
            },
            Type::NEW_CONNECTION_ID => {
                let sequence = self.bytes.get_var()?;
                let retire_prior_to = self.bytes.get_var()?;
                if retire_prior_to > sequence {
                    return Err(IterErr::Malformed);
                }
                let len = self.bytes.get::<u8>()? as usize;
                if len == 0 || len > MAX_CID_SIZE {
                    return Err(IterErr::Malformed);
                }
                if self.bytes.remaining() < len + RESET_TOKEN_SIZE {
                    return Err(IterErr::UnexpectedEnd);
                }
                let id = ConnectionId::new(&self.take(len));
                let mut reset_token = [0; RESET_TOKEN_SIZE];
                self.bytes.copy_to_slice(&mut reset_token);
                Frame::NewConnectionId(NewConnectionId {
                    sequence,
                    retire_prior_to,
                    id,
                    reset_token,
                })
            }
            Type::RETIRE_CONNECTION_ID => Frame::RetireConnectionId {
                sequence: self.bytes.get_var()?,
            },
            Type::PATH_CHALLENGE => Frame::PathChallenge(self.bytes.get()?),
            Type::PATH_RESPONSE => Frame::PathResponse(self.bytes.get()?),
            Type::CONNECTION_CLOSE => {
                let error_code = self.bytes.get_var()?;
                let frame_type = self.bytes.get::<Type>()?;
                let reason = self.take_len()?;
                Frame::ConnectionClose(ConnectionClose {
                    error_code,
                    frame_type: if frame_type == Type::PADDING {
                        None
                    } else {
                        Some(frame_type)
                    },
                    reason,
                })
            }
            Type::APPLICATION_CLOSE => Frame::ApplicationClose(ApplicationClose {
                error_code: self.bytes.get_var()?,
                reason: self.take_len()?,
            }),
            Type::HANDSHAKE_DONE => Frame::HandshakeDone,
            Type(x) if STREAM_TYS.contains(&x) => {
                let id = self.bytes.get()?;
                let offset = if x & STREAM_OFF_BIT != 0 {
                    self.bytes.get_var()?
                } else {
                    0
                };
                let data = if x & STREAM_LEN_BIT != 0 {
                    self.take_len()?
                } else {
                    self.take_remaining()
                };
                Frame::Stream(Stream {
                    id,
                    offset,
                    fin: x & STREAM_FIN_BIT != 0,
                    data,
                })
            }
            _ => return Err(IterErr::UnknownType),
        })
    }
}

impl Iterator for Iter {
    type Item = Frame;
    fn next(&mut self) -> Option<Frame> {
        if !self.bytes.has_remaining() {
            return None;
        }
        match self.try_next() {
            Ok(x) => Some(x),
            Err(_) => {
                // Abandon the rest of the payload; the caller closes the connection
                let end = self.bytes.get_ref().len() as u64;
                self.bytes.set_position(end);
                Some(Frame::Invalid(self.last_ty))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(buf: Vec<u8>) -> Vec<Frame> {
        Iter::new(Bytes::from(buf)).collect()
    }

    #[test]
    fn ack_round_trip() {
        let mut ranges = RangeSet::new();
        ranges.insert(0..3);
        ranges.insert(6..7);
        ranges.insert(10..14);
        let mut buf = Vec::new();
        Ack::encode(42, &ranges, &mut buf);
        let decoded = frames(buf);
        assert_eq!(decoded.len(), 1);
        match decoded[0] {
            Frame::Ack(ref ack) => {
                assert_eq!(ack.largest, 13);
                assert_eq!(ack.delay, 42);
                assert_eq!(ack.ranges, &[10..14, 6..7, 0..3]);
                assert_eq!(ack.ecn, None);
            }
            ref x => panic!("unexpected frame {:?}", x),
        }
    }

    #[test]
    fn ack_malformed_range() {
        // First range larger than the largest acknowledged
        let mut buf = Vec::new();
        buf.write(Type::ACK);
        buf.write_var(4); // largest
        buf.write_var(0); // delay
        buf.write_var(0); // extra blocks
        buf.write_var(10); // first range
        assert_matches!(frames(buf)[0], Frame::Invalid(Type::ACK));
    }

    #[test]
    fn stream_subtypes() {
        for &offset in &[0u64, 7] {
            for &fin in &[false, true] {
                let frame = Stream {
                    id: StreamId(3),
                    offset,
                    fin,
                    data: Bytes::from(&b"hi there"[..]),
                };
                let mut buf = Vec::new();
                frame.encode(true, &mut buf);
                let decoded = frames(buf);
                assert_eq!(decoded.len(), 1);
                assert_matches!(decoded[0], Frame::Stream(ref x) if *x == frame);
            }
        }
    }

    #[test]
    fn stream_no_length_extends_to_end() {
        let frame = Stream {
            id: StreamId(0),
            offset: 0,
            fin: false,
            data: Bytes::from(&b"payload"[..]),
        };
        let mut buf = Vec::new();
        frame.encode(false, &mut buf);
        let decoded = frames(buf);
        assert_matches!(decoded[0], Frame::Stream(ref x) if x.data == frame.data);
    }

    #[test]
    fn new_connection_id_round_trip() {
        let frame = NewConnectionId {
            sequence: 7,
            retire_prior_to: 3,
            id: ConnectionId::new(&[0xab; 8]),
            reset_token: [0xcd; RESET_TOKEN_SIZE],
        };
        let mut buf = Vec::new();
        frame.encode(&mut buf);
        let decoded = frames(buf);
        assert_matches!(decoded[0], Frame::NewConnectionId(x) if x == frame);
    }

    #[test]
    fn close_reason_truncated_to_budget() {
        let close = ConnectionClose {
            error_code: 0xa,
            frame_type: Some(Type::CRYPTO),
            reason: Bytes::from(&[b'x'; 300][..]),
        };
        let mut buf = Vec::new();
        close.encode(&mut buf, 64);
        assert!(buf.len() <= 64);
        assert_matches!(frames(buf)[0], Frame::ConnectionClose(ref x) if x.error_code == 0xa);
    }

    #[test]
    fn empty_new_token_rejected() {
        let mut buf = Vec::new();
        buf.write(Type::NEW_TOKEN);
        buf.write_var(0);
        assert_matches!(frames(buf)[0], Frame::Invalid(Type::NEW_TOKEN));
    }

    #[test]
    fn scalar_frames_round_trip() {
        // Frames the packetizer writes field-by-field decode to the same values
        let mut buf = Vec::new();
        buf.write(Type::PING);
        ResetStream {
            id: StreamId(4),
            error_code: 7,
            final_offset: 3000,
        }.encode(&mut buf);
        buf.write(Type::STOP_SENDING);
        buf.write(StreamId(8));
        buf.write_var(11);
        buf.write(Type::MAX_DATA);
        buf.write_var(1 << 20);
        buf.write(Type::MAX_STREAM_DATA);
        buf.write(StreamId(12));
        buf.write_var(65536);
        buf.write(Type::MAX_STREAMS_UNI);
        buf.write_var(9);
        buf.write(Type::DATA_BLOCKED);
        buf.write_var(500);
        buf.write(Type::STREAM_DATA_BLOCKED);
        buf.write(StreamId(3));
        buf.write_var(200);
        buf.write(Type::STREAMS_BLOCKED_BIDI);
        buf.write_var(16);
        buf.write(Type::RETIRE_CONNECTION_ID);
        buf.write_var(2);
        buf.write(Type::PATH_CHALLENGE);
        buf.write(0xfeed_f00d_dead_beefu64);
        buf.write(Type::PATH_RESPONSE);
        buf.write(0xfeed_f00d_dead_beefu64);
        buf.write(Type::HANDSHAKE_DONE);
        Crypto {
            offset: 64,
            data: Bytes::from(&b"tls bits"[..]),
        }.encode(&mut buf);
        let decoded = frames(buf);
        assert_eq!(decoded.len(), 14);
        assert_matches!(decoded[0], Frame::Ping);
        assert_matches!(
            decoded[1],
            Frame::ResetStream(ResetStream {
                id: StreamId(4),
                error_code: 7,
                final_offset: 3000,
            })
        );
        assert_matches!(
            decoded[2],
            Frame::StopSending {
                id: StreamId(8),
                error_code: 11,
            }
        );
        assert_matches!(decoded[3], Frame::MaxData(x) if x == 1 << 20);
        assert_matches!(
            decoded[4],
            Frame::MaxStreamData {
                id: StreamId(12),
                offset: 65536,
            }
        );
        assert_matches!(
            decoded[5],
            Frame::MaxStreams {
                directionality: Directionality::Uni,
                count: 9,
            }
        );
        assert_matches!(decoded[6], Frame::DataBlocked { offset: 500 });
        assert_matches!(
            decoded[7],
            Frame::StreamDataBlocked {
                id: StreamId(3),
                offset: 200,
            }
        );
        assert_matches!(
            decoded[8],
            Frame::StreamsBlocked {
                directionality: Directionality::Bi,
                limit: 16,
            }
        );
        assert_matches!(decoded[9], Frame::RetireConnectionId { sequence: 2 });
        assert_matches!(decoded[10], Frame::PathChallenge(0xfeed_f00d_dead_beef));
        assert_matches!(decoded[11], Frame::PathResponse(0xfeed_f00d_dead_beef));
        assert_matches!(decoded[12], Frame::HandshakeDone);
        assert_matches!(decoded[13], Frame::Crypto(ref x) if x.offset == 64 && &x.data[..] == b"tls bits");
    }

    #[test]
    fn level_permissions() {
        assert!(Frame::Ping.allowed_in(SpaceId::Initial));
        assert!(
            !Frame::Stream(Stream {
                id: StreamId(0),
                offset: 0,
                fin: false,
                data: Bytes::new(),
            }).allowed_in(SpaceId::Handshake)
        );
        assert!(Frame::HandshakeDone.allowed_in(SpaceId::Data));
        assert!(!Frame::HandshakeDone.allowed_in(SpaceId::Initial));
    }
}
