//! Stream-level state: reassembly of out-of-order data, the fixed-size receive ring, flow
//! control bookkeeping for both directions, and the table of active streams.

use std::cmp;

use bytes::Bytes;
use fnv::FnvHashMap;

use {Directionality, Side, StreamId, TransportError};

/// Most data a stream will buffer unacknowledged before blocking the writer
pub const UNACKED_BUDGET: u64 = 64 * 1024;

/// In-order reassembly of an offset-addressed byte stream
///
/// Segments beyond the contiguous frontier are kept sorted and non-overlapping; duplicate
/// spans are dropped on insertion.
#[derive(Debug, Default)]
pub struct Assembler {
    offset: u64,
    end: u64,
    segments: Vec<Segment>,
    buffered: usize,
}

#[derive(Debug)]
struct Segment {
    offset: u64,
    data: Bytes,
}

impl Assembler {
    pub fn new() -> Self {
        Assembler::default()
    }

    /// Highest contiguous offset delivered
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Highest offset seen, including gaps
    pub fn end(&self) -> u64 {
        self.end
    }

    /// Bytes currently buffered out of order
    pub fn buffered(&self) -> usize {
        self.buffered
    }

    pub fn insert(&mut self, offset: u64, data: Bytes) {
        let mut offset = offset;
        let mut data = data;
        self.end = cmp::max(self.end, offset + data.len() as u64);
        if offset < self.offset {
            // Leading duplicate of already-delivered data
            let diff = (self.offset - offset) as usize;
            if diff >= data.len() {
                return;
            }
            data.advance(diff);
            offset = self.offset;
        }
        let mut i = 0;
        while !data.is_empty() {
            if i == self.segments.len() {
                self.buffered += data.len();
                self.segments.push(Segment { offset, data });
                return;
            }
            let (seg_offset, seg_end) = {
                let seg = &self.segments[i];
                (seg.offset, seg.offset + seg.data.len() as u64)
            };
            if offset < seg_offset {
                let len = cmp::min((seg_offset - offset) as usize, data.len());
                let head = data.split_to(len);
                self.buffered += head.len();
                self.segments.insert(i, Segment { offset, data: head });
                offset += len as u64;
            } else if offset < seg_end {
                // Duplicate of buffered data
                let dup = cmp::min((seg_end - offset) as usize, data.len());
                data.advance(dup);
                offset += dup as u64;
            }
            i += 1;
        }
    }

    /// Pop up to `max` contiguous bytes
    pub fn next(&mut self, max: usize) -> Option<Bytes> {
        if max == 0
            || self.segments.is_empty()
            || self.segments[0].offset != self.offset
            || self.segments[0].data.is_empty()
        {
            return None;
        }
        let taken = if self.segments[0].data.len() <= max {
            self.segments.remove(0).data
        } else {
            let head = self.segments[0].data.split_to(max);
            self.segments[0].offset += max as u64;
            head
        };
        self.offset += taken.len() as u64;
        self.buffered -= taken.len();
        Some(taken)
    }

    /// Whether contiguous data is waiting to be popped
    pub fn has_contiguous(&self) -> bool {
        self.segments
            .first()
            .map_or(false, |seg| seg.offset == self.offset)
    }
}

/// Fixed-capacity wrap-around buffer holding contiguous received bytes until the
/// application consumes them
#[derive(Debug)]
pub struct RecvRing {
    buf: Box<[u8]>,
    start: usize,
    len: usize,
}

impl RecvRing {
    pub fn new(capacity: usize) -> Self {
        RecvRing {
            buf: vec![0; capacity].into_boxed_slice(),
            start: 0,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn free(&self) -> usize {
        self.buf.len() - self.len
    }

    /// Append as much of `data` as fits, returning the number of bytes taken
    pub fn write(&mut self, data: &[u8]) -> usize {
        let n = cmp::min(data.len(), self.free());
        let cap = self.buf.len();
        let mut pos = (self.start + self.len) % cap;
        let first = cmp::min(n, cap - pos);
        self.buf[pos..pos + first].copy_from_slice(&data[..first]);
        pos = (pos + first) % cap;
        self.buf[pos..pos + (n - first)].copy_from_slice(&data[first..n]);
        self.len += n;
        n
    }

    /// Pop bytes into `out`, returning the number copied
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let n = cmp::min(out.len(), self.len);
        let cap = self.buf.len();
        let first = cmp::min(n, cap - self.start);
        out[..first].copy_from_slice(&self.buf[self.start..self.start + first]);
        out[first..n].copy_from_slice(&self.buf[..n - first]);
        self.start = (self.start + n) % cap;
        self.len -= n;
        n
    }
}

#[derive(Debug, Fail, Clone, Copy, Eq, PartialEq)]
pub enum ReadError {
    /// No data is available at present; retry after the next `StreamReadable` event
    #[fail(display = "blocked")]
    Blocked,
    /// The peer abandoned transmitting data on this stream
    #[fail(display = "reset by peer: error {}", error_code)]
    Reset { error_code: u64 },
    /// The stream was finished and all data has been read
    #[fail(display = "finished")]
    Finished,
}

#[derive(Debug, Fail, Clone, Copy, Eq, PartialEq)]
pub enum WriteError {
    /// Writing would exceed flow control or the unacknowledged-data budget
    #[fail(display = "blocked")]
    Blocked,
    /// The peer is no longer accepting data on this stream
    #[fail(display = "stopped by peer: error {}", error_code)]
    Stopped { error_code: u64 },
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RecvState {
    Recv { size: Option<u64> },
    DataRecvd { size: u64 },
    ResetRecvd { size: u64, error_code: u64 },
    /// EOF or reset has been delivered to the application
    Closed,
}

/// Receive half of a stream
#[derive(Debug)]
pub struct Recv {
    pub state: RecvState,
    pub assembler: Assembler,
    pub ring: RecvRing,
    /// Flow-control limit we have advertised for this stream
    pub max_data: u64,
    /// Set until the first readable event has been delivered
    pub fresh: bool,
}

impl Recv {
    pub fn new(window: u64) -> Self {
        Recv {
            state: RecvState::Recv { size: None },
            assembler: Assembler::new(),
            ring: RecvRing::new(window as usize),
            max_data: window,
            fresh: true,
        }
    }

    /// Accept stream data. Returns bytes extending this stream's high-water mark, which count
    /// against the connection-level window.
    pub fn ingest(&mut self, offset: u64, data: Bytes, fin: bool) -> Result<u64, TransportError> {
        let end = offset + data.len() as u64;
        if let Some(final_offset) = self.final_offset() {
            if end > final_offset || (fin && end != final_offset) {
                return Err(TransportError::FINAL_SIZE_ERROR);
            }
        }
        if end > self.max_data {
            return Err(TransportError::FLOW_CONTROL_ERROR);
        }
        let new_bytes = end.saturating_sub(self.limit());
        if fin {
            if let RecvState::Recv { ref mut size } = self.state {
                *size = Some(end);
            }
        }
        self.assembler.insert(offset, data);
        self.drain()?;
        if let RecvState::Recv { size: Some(size) } = self.state {
            if self.assembler.offset() == size {
                self.state = RecvState::DataRecvd { size };
            }
        }
        Ok(new_bytes)
    }

    /// Move contiguous bytes into the ring
    ///
    /// The ring cannot overflow unless the peer ignored our advertised window, since the
    /// window is exactly consumed bytes plus ring capacity.
    fn drain(&mut self) -> Result<(), TransportError> {
        loop {
            let free = self.ring.free();
            let chunk = match self.assembler.next(free) {
                Some(x) => x,
                None => break,
            };
            let n = self.ring.write(&chunk);
            debug_assert_eq!(n, chunk.len());
        }
        if self.ring.free() == 0 && self.assembler.has_contiguous() {
            return Err(TransportError::FLOW_CONTROL_ERROR);
        }
        Ok(())
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, ReadError> {
        let n = self.ring.read(buf);
        if n > 0 {
            self.max_data += n as u64;
            let _ = self.drain();
            return Ok(n);
        }
        match self.state {
            RecvState::DataRecvd { .. } => {
                self.state = RecvState::Closed;
                Err(ReadError::Finished)
            }
            RecvState::ResetRecvd { error_code, .. } => {
                self.state = RecvState::Closed;
                Err(ReadError::Reset { error_code })
            }
            _ => Err(ReadError::Blocked),
        }
    }

    pub fn reset(&mut self, size: u64, error_code: u64) {
        if self.is_closed() {
            return;
        }
        self.state = RecvState::ResetRecvd { size, error_code };
    }

    pub fn final_offset(&self) -> Option<u64> {
        match self.state {
            RecvState::Recv { size } => size,
            RecvState::DataRecvd { size }
            | RecvState::ResetRecvd { size, .. } => Some(size),
            RecvState::Closed => None,
        }
    }

    /// High-water mark: the largest end offset seen so far
    pub fn limit(&self) -> u64 {
        self.assembler.end()
    }

    /// Whether no further data can arrive
    pub fn is_finished(&self) -> bool {
        match self.state {
            RecvState::Recv { .. } => false,
            _ => true,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state == RecvState::Closed
    }

    /// Whether the peer has not yet promised a final size, i.e. window updates are useful
    pub fn receiving_unknown_size(&self) -> bool {
        match self.state {
            RecvState::Recv { size: None } => true,
            _ => false,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SendState {
    Ready,
    /// All data submitted and a FIN queued; retransmissions may remain
    DataSent,
    /// Everything delivered and acknowledged
    DataRecvd,
    ResetSent { stop_reason: Option<u64> },
    ResetRecvd { stop_reason: Option<u64> },
}

impl SendState {
    pub fn was_reset(&self) -> bool {
        match *self {
            SendState::ResetSent { .. } | SendState::ResetRecvd { .. } => true,
            _ => false,
        }
    }
}

/// Send half of a stream
#[derive(Debug)]
pub struct Send {
    /// Bytes submitted for transmission
    pub offset: u64,
    /// Bytes the peer has acknowledged
    pub acked: u64,
    /// Peer-granted flow-control limit
    pub max_data: u64,
    pub state: SendState,
    pub bytes_in_flight: u64,
}

impl Send {
    pub fn new(max_data: u64) -> Self {
        Send {
            offset: 0,
            acked: 0,
            max_data,
            state: SendState::Ready,
            bytes_in_flight: 0,
        }
    }

    /// How much more data this stream will accept from the application right now
    pub fn write_budget(&self) -> Result<u64, WriteError> {
        match self.state {
            SendState::ResetSent { stop_reason } | SendState::ResetRecvd { stop_reason } => {
                return Err(WriteError::Stopped {
                    error_code: stop_reason.unwrap_or(0),
                });
            }
            _ => {}
        }
        let unacked = self.offset - self.acked;
        if unacked >= UNACKED_BUDGET {
            return Err(WriteError::Blocked);
        }
        let window = self.max_data.saturating_sub(self.offset);
        if window == 0 {
            return Err(WriteError::Blocked);
        }
        Ok(cmp::min(window, UNACKED_BUDGET - unacked))
    }

    pub fn is_closed(&self) -> bool {
        match self.state {
            SendState::DataRecvd | SendState::ResetRecvd { .. } => true,
            _ => false,
        }
    }
}

/// A stream's two halves; unidirectional streams have one
#[derive(Debug)]
pub struct Stream {
    pub send: Option<Send>,
    pub recv: Option<Recv>,
}

impl Stream {
    pub fn new_bi(recv_window: u64, send_window: u64) -> Self {
        Stream {
            send: Some(Send::new(send_window)),
            recv: Some(Recv::new(recv_window)),
        }
    }

    pub fn new_recv(recv_window: u64) -> Self {
        Stream {
            send: None,
            recv: Some(Recv::new(recv_window)),
        }
    }

    pub fn new_send(send_window: u64) -> Self {
        Stream {
            send: Some(Send::new(send_window)),
            recv: None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.send.as_ref().map_or(true, |x| x.is_closed())
            && self.recv.as_ref().map_or(true, |x| x.is_closed())
    }
}

/// Outcome of resolving a peer-referenced stream id
#[derive(Debug)]
pub enum RemoteStream {
    /// The stream is (now) open; any intermediate streams opened to fill an id gap are listed
    /// in order, ending with the target
    Open { opened: Vec<StreamId> },
    /// The stream existed and has already been reaped; the frame is a no-op
    Gone,
}

/// The set of streams that are currently open, plus id-space accounting
pub struct Streams {
    pub streams: FnvHashMap<StreamId, Stream>,
    /// Next index for locally-initiated streams
    pub next_uni: u64,
    pub next_bi: u64,
    /// Peer-granted limits on locally-initiated streams
    pub max_uni: u64,
    pub max_bi: u64,
    /// Lowest peer-initiated index that has never been opened
    pub next_remote_uni: u64,
    pub next_remote_bi: u64,
    /// Advertised limits on peer-initiated streams
    pub max_remote_uni: u64,
    pub max_remote_bi: u64,
    /// Streams whose outgoing data was fully acknowledged since the last poll
    pub finished: Vec<StreamId>,
}

impl Streams {
    pub fn new(max_remote_bi: u64, max_remote_uni: u64) -> Self {
        Streams {
            streams: FnvHashMap::default(),
            next_uni: 0,
            next_bi: 0,
            max_uni: 0,
            max_bi: 0,
            next_remote_uni: 0,
            next_remote_bi: 0,
            max_remote_uni,
            max_remote_bi,
            finished: Vec::new(),
        }
    }

    /// Resolve a peer frame referencing stream `id`, opening it (and any intermediate ids of
    /// its type) if it is new
    pub fn ensure_remote(
        &mut self,
        side: Side,
        id: StreamId,
        recv_window: u64,
        send_window: u64,
    ) -> Result<RemoteStream, TransportError> {
        if id.initiator() == side {
            // The peer may reference our streams, but never create them
            let next = match id.directionality() {
                Directionality::Uni => self.next_uni,
                Directionality::Bi => self.next_bi,
            };
            if id.index() >= next {
                return Err(TransportError::STREAM_STATE_ERROR);
            }
            return Ok(if self.streams.contains_key(&id) {
                RemoteStream::Open { opened: Vec::new() }
            } else {
                RemoteStream::Gone
            });
        }
        let (next, limit) = match id.directionality() {
            Directionality::Uni => (self.next_remote_uni, self.max_remote_uni),
            Directionality::Bi => (self.next_remote_bi, self.max_remote_bi),
        };
        if id.index() >= limit {
            return Err(TransportError::STREAM_LIMIT_ERROR);
        }
        if id.index() < next {
            return Ok(if self.streams.contains_key(&id) {
                RemoteStream::Open { opened: Vec::new() }
            } else {
                RemoteStream::Gone
            });
        }
        // Ids of a type are used in order; every id below this one opens implicitly
        let mut opened = Vec::with_capacity((id.index() - next + 1) as usize);
        for index in next..=id.index() {
            let new_id = StreamId::new(!side, id.directionality(), index);
            let stream = match id.directionality() {
                Directionality::Uni => Stream::new_recv(recv_window),
                Directionality::Bi => Stream::new_bi(recv_window, send_window),
            };
            self.streams.insert(new_id, stream);
            opened.push(new_id);
        }
        match id.directionality() {
            Directionality::Uni => {
                self.next_remote_uni = id.index() + 1;
            }
            Directionality::Bi => {
                self.next_remote_bi = id.index() + 1;
            }
        }
        Ok(RemoteStream::Open { opened })
    }

    /// Open a locally-initiated stream if the peer's limit allows
    pub fn open(
        &mut self,
        side: Side,
        direction: Directionality,
        recv_window: u64,
        send_window: u64,
    ) -> Option<StreamId> {
        let (id, stream) = match direction {
            Directionality::Uni if self.next_uni < self.max_uni => {
                self.next_uni += 1;
                (
                    StreamId::new(side, direction, self.next_uni - 1),
                    Stream::new_send(send_window),
                )
            }
            Directionality::Bi if self.next_bi < self.max_bi => {
                self.next_bi += 1;
                (
                    StreamId::new(side, direction, self.next_bi - 1),
                    Stream::new_bi(recv_window, send_window),
                )
            }
            _ => {
                return None;
            }
        };
        let old = self.streams.insert(id, stream);
        debug_assert!(old.is_none());
        Some(id)
    }

    pub fn get_recv_mut(&mut self, id: &StreamId) -> Option<&mut Recv> {
        self.streams.get_mut(id)?.recv.as_mut()
    }

    pub fn get_send_mut(&mut self, id: &StreamId) -> Option<&mut Send> {
        self.streams.get_mut(id)?.send.as_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assembler_reorders() {
        // Out-of-order segments drain identically to in-order delivery
        let mut x = Assembler::new();
        x.insert(30, Bytes::from(&[2u8; 20][..]));
        assert_eq!(x.buffered(), 20);
        assert!(x.next(usize::max_value()).is_none());
        x.insert(0, Bytes::from(&[1u8; 30][..]));
        let mut out = Vec::new();
        while let Some(chunk) = x.next(usize::max_value()) {
            out.extend_from_slice(&chunk);
        }
        assert_eq!(out.len(), 50);
        assert_eq!(&out[..30], &[1u8; 30][..]);
        assert_eq!(&out[30..], &[2u8; 20][..]);
        assert_eq!(x.buffered(), 0);
        assert_eq!(x.offset(), 50);
    }

    #[test]
    fn assembler_trims_duplicates() {
        let mut x = Assembler::new();
        x.insert(0, Bytes::from(&b"abcd"[..]));
        assert_eq!(&x.next(100).unwrap()[..], b"abcd");
        // Fully duplicate data is dropped
        x.insert(0, Bytes::from(&b"abcd"[..]));
        assert_eq!(x.buffered(), 0);
        // Partial overlap keeps only the tail
        x.insert(2, Bytes::from(&b"cdef"[..]));
        assert_eq!(&x.next(100).unwrap()[..], b"ef");
        // Overlap with a buffered segment
        x.insert(8, Bytes::from(&b"xy"[..]));
        x.insert(8, Bytes::from(&b"xyz"[..]));
        assert_eq!(x.buffered(), 3);
        x.insert(6, Bytes::from(&b"vw"[..]));
        assert_eq!(&x.next(100).unwrap()[..], b"vw");
        assert_eq!(&x.next(100).unwrap()[..], b"xy");
        assert_eq!(&x.next(100).unwrap()[..], b"z");
    }

    #[test]
    fn assembler_bounded_pop() {
        let mut x = Assembler::new();
        x.insert(0, Bytes::from(&[7u8; 10][..]));
        assert_eq!(x.next(4).unwrap().len(), 4);
        assert_eq!(x.offset(), 4);
        assert_eq!(x.next(100).unwrap().len(), 6);
    }

    #[test]
    fn ring_wraps() {
        let mut ring = RecvRing::new(8);
        assert_eq!(ring.write(b"abcdef"), 6);
        let mut out = [0; 4];
        assert_eq!(ring.read(&mut out), 4);
        assert_eq!(&out, b"abcd");
        // Write crosses the wrap point
        assert_eq!(ring.write(b"ghijkl"), 6);
        assert_eq!(ring.free(), 0);
        let mut out = [0; 8];
        assert_eq!(ring.read(&mut out), 8);
        assert_eq!(&out, b"efghijkl");
    }

    #[test]
    fn recv_in_order_and_fin() {
        let mut rs = Recv::new(1024);
        rs.ingest(0, Bytes::from(&b"hello "[..]), false).unwrap();
        rs.ingest(6, Bytes::from(&b"world"[..]), true).unwrap();
        assert_eq!(rs.final_offset(), Some(11));
        let mut buf = [0; 64];
        let n = rs.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello world");
        // FIN surfaces only after all data is consumed
        assert_eq!(rs.read(&mut buf), Err(ReadError::Finished));
        assert!(rs.is_closed());
    }

    #[test]
    fn recv_fin_not_surfaced_early() {
        let mut rs = Recv::new(1024);
        rs.ingest(6, Bytes::from(&b"world"[..]), true).unwrap();
        let mut buf = [0; 64];
        assert_eq!(rs.read(&mut buf), Err(ReadError::Blocked));
        rs.ingest(0, Bytes::from(&b"hello "[..]), false).unwrap();
        assert_eq!(rs.read(&mut buf).unwrap(), 11);
        assert_eq!(rs.read(&mut buf), Err(ReadError::Finished));
    }

    #[test]
    fn recv_stream_window_enforced() {
        let mut rs = Recv::new(16);
        assert_matches!(
            rs.ingest(0, Bytes::from(&[0u8; 17][..]), false),
            Err(TransportError::FLOW_CONTROL_ERROR)
        );
        // Reading frees window
        rs.ingest(0, Bytes::from(&[0u8; 16][..]), false).unwrap();
        let mut buf = [0; 8];
        rs.read(&mut buf).unwrap();
        assert_eq!(rs.max_data, 24);
        rs.ingest(16, Bytes::from(&[0u8; 8][..]), false).unwrap();
    }

    #[test]
    fn recv_final_size_violations() {
        let mut rs = Recv::new(1024);
        rs.ingest(0, Bytes::from(&b"1234"[..]), true).unwrap();
        assert_matches!(
            rs.ingest(4, Bytes::from(&b"5"[..]), false),
            Err(TransportError::FINAL_SIZE_ERROR)
        );
        let mut rs = Recv::new(1024);
        rs.ingest(0, Bytes::from(&b"12"[..]), true).unwrap();
        assert_matches!(
            rs.ingest(0, Bytes::from(&b"1"[..]), true),
            Err(TransportError::FINAL_SIZE_ERROR)
        );
    }

    #[test]
    fn send_budget() {
        let mut ss = Send::new(10);
        assert_eq!(ss.write_budget(), Ok(10));
        ss.offset = 10;
        assert_eq!(ss.write_budget(), Err(WriteError::Blocked));
        ss.max_data = UNACKED_BUDGET + 100;
        // Unacknowledged bytes cap the budget even with window to spare
        ss.offset = UNACKED_BUDGET;
        assert_eq!(ss.write_budget(), Err(WriteError::Blocked));
        ss.acked = 64;
        assert_eq!(ss.write_budget(), Ok(64));
        ss.state = SendState::ResetSent {
            stop_reason: Some(9),
        };
        assert_eq!(ss.write_budget(), Err(WriteError::Stopped { error_code: 9 }));
    }

    #[test]
    fn remote_gap_opens_intermediates() {
        let mut streams = Streams::new(10, 10);
        // Receiving bidi index 2 opens 0 and 1 first
        let id = StreamId::new(Side::Client, Directionality::Bi, 2);
        match streams
            .ensure_remote(Side::Server, id, 1024, 1024)
            .unwrap()
        {
            RemoteStream::Open { opened } => {
                let indexes = opened.iter().map(|x| x.index()).collect::<Vec<_>>();
                assert_eq!(indexes, &[0, 1, 2]);
            }
            _ => panic!("expected newly opened streams"),
        }
        assert_eq!(streams.next_remote_bi, 3);
        // Re-reference is a plain lookup
        match streams
            .ensure_remote(Side::Server, id, 1024, 1024)
            .unwrap()
        {
            RemoteStream::Open { opened } => assert!(opened.is_empty()),
            _ => panic!("stream should still be open"),
        }
    }

    #[test]
    fn remote_limit_enforced() {
        let mut streams = Streams::new(2, 0);
        let id = StreamId::new(Side::Client, Directionality::Bi, 2);
        assert_matches!(
            streams.ensure_remote(Side::Server, id, 1024, 1024),
            Err(TransportError::STREAM_LIMIT_ERROR)
        );
        let id = StreamId::new(Side::Client, Directionality::Uni, 0);
        assert_matches!(
            streams.ensure_remote(Side::Server, id, 1024, 1024),
            Err(TransportError::STREAM_LIMIT_ERROR)
        );
    }

    #[test]
    fn peer_cannot_create_local_streams() {
        let mut streams = Streams::new(10, 10);
        let id = StreamId::new(Side::Server, Directionality::Bi, 0);
        assert_matches!(
            streams.ensure_remote(Side::Server, id, 1024, 1024),
            Err(TransportError::STREAM_STATE_ERROR)
        );
        // But may reference ones we opened
        streams.max_bi = 1;
        let opened = streams
            .open(Side::Server, Directionality::Bi, 1024, 1024)
            .unwrap();
        assert_matches!(
            streams.ensure_remote(Side::Server, opened, 1024, 1024),
            Ok(RemoteStream::Open { .. })
        );
    }

    #[test]
    fn reaped_stream_is_gone() {
        let mut streams = Streams::new(10, 10);
        let id = StreamId::new(Side::Client, Directionality::Bi, 0);
        streams.ensure_remote(Side::Server, id, 1024, 1024).unwrap();
        streams.streams.remove(&id);
        assert_matches!(
            streams.ensure_remote(Side::Server, id, 1024, 1024),
            Ok(RemoteStream::Gone)
        );
    }

    #[test]
    fn local_open_respects_peer_limit() {
        let mut streams = Streams::new(0, 0);
        assert!(streams.open(Side::Server, Directionality::Bi, 1024, 1024).is_none());
        streams.max_bi = 1;
        let id = streams
            .open(Side::Server, Directionality::Bi, 1024, 1024)
            .unwrap();
        assert_eq!(id, StreamId::new(Side::Server, Directionality::Bi, 0));
        assert!(streams.open(Side::Server, Directionality::Bi, 1024, 1024).is_none());
    }
}
