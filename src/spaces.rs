//! Per-packet-number-space state: send queues, sent-packet records, and acknowledgement
//! tracking for the Initial, Handshake, and Application (1-RTT) spaces.

use std::cmp;
use std::collections::{BTreeMap, VecDeque};

use bytes::Bytes;
use fnv::FnvHashSet;
use slog;

use crypto::Crypto;
use frame;
use range_set::RangeSet;
use stream::Assembler;
use StreamId;

/// Ranges retained per received-packet tracker; the oldest is evicted beyond this
pub const MAX_ACK_RANGES: usize = 32;
/// Ack-eliciting packets received before an ACK is sent without further delay
pub const MAX_ACK_GAP: u32 = 2;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum SpaceId {
    Initial = 0,
    Handshake = 1,
    Data = 2,
}

static SPACE_IDS: [SpaceId; 3] = [SpaceId::Initial, SpaceId::Handshake, SpaceId::Data];

impl SpaceId {
    /// All spaces, in the order packets are built
    pub fn iter() -> ::std::iter::Cloned<::std::slice::Iter<'static, SpaceId>> {
        SPACE_IDS.iter().cloned()
    }
}

impl slog::Value for SpaceId {
    fn serialize(
        &self,
        _: &slog::Record,
        key: slog::Key,
        serializer: &mut slog::Serializer,
    ) -> slog::Result {
        serializer.emit_arguments(key, &format_args!("{:?}", self))
    }
}

/// Frames awaiting (re)transmission at one encryption level
///
/// Loss reinjects a sent packet's frames here rather than retransmitting the packet itself;
/// window-bearing frames are reduced to flags so that fresh limits are encoded at send time.
#[derive(Debug, Clone)]
pub struct Retransmits {
    pub ping: bool,
    pub handshake_done: bool,
    pub max_data: bool,
    pub max_uni_streams: bool,
    pub max_bi_streams: bool,
    pub crypto: VecDeque<frame::Crypto>,
    pub stream: VecDeque<frame::Stream>,
    pub reset_stream: Vec<(StreamId, u64)>,
    pub stop_sending: Vec<(StreamId, u64)>,
    pub max_stream_data: FnvHashSet<StreamId>,
    pub new_cids: Vec<frame::NewConnectionId>,
    pub retire_cids: Vec<u64>,
    pub new_tokens: Vec<Bytes>,
    /// Packet number the challenge arrived in, and its value
    pub path_response: Option<(u64, u64)>,
}

impl Retransmits {
    pub fn is_empty(&self) -> bool {
        !self.ping
            && !self.handshake_done
            && !self.max_data
            && !self.max_uni_streams
            && !self.max_bi_streams
            && self.crypto.is_empty()
            && self.stream.is_empty()
            && self.reset_stream.is_empty()
            && self.stop_sending.is_empty()
            && self.max_stream_data.is_empty()
            && self.new_cids.is_empty()
            && self.retire_cids.is_empty()
            && self.new_tokens.is_empty()
            && self.path_response.is_none()
    }

    /// Record a PATH_CHALLENGE, retaining only the most recent one
    pub fn path_challenge(&mut self, packet: u64, token: u64) {
        match self.path_response {
            Some((existing, _)) if existing >= packet => {}
            _ => {
                self.path_response = Some((packet, token));
            }
        }
    }
}

impl Default for Retransmits {
    fn default() -> Self {
        Retransmits {
            ping: false,
            handshake_done: false,
            max_data: false,
            max_uni_streams: false,
            max_bi_streams: false,
            crypto: VecDeque::new(),
            stream: VecDeque::new(),
            reset_stream: Vec::new(),
            stop_sending: Vec::new(),
            max_stream_data: FnvHashSet::default(),
            new_cids: Vec::new(),
            retire_cids: Vec::new(),
            new_tokens: Vec::new(),
            path_response: None,
        }
    }
}

impl ::std::ops::AddAssign for Retransmits {
    fn add_assign(&mut self, rhs: Self) {
        self.ping |= rhs.ping;
        self.handshake_done |= rhs.handshake_done;
        self.max_data |= rhs.max_data;
        self.max_uni_streams |= rhs.max_uni_streams;
        self.max_bi_streams |= rhs.max_bi_streams;
        self.crypto.extend(rhs.crypto.into_iter());
        self.stream.extend(rhs.stream.into_iter());
        self.reset_stream.extend_from_slice(&rhs.reset_stream);
        self.stop_sending.extend_from_slice(&rhs.stop_sending);
        self.max_stream_data.extend(&rhs.max_stream_data);
        self.new_cids.extend_from_slice(&rhs.new_cids);
        self.retire_cids.extend_from_slice(&rhs.retire_cids);
        self.new_tokens.extend(rhs.new_tokens.into_iter());
        if let Some((packet, token)) = rhs.path_response {
            self.path_challenge(packet, token);
        }
    }
}

/// Record of a transmitted packet awaiting acknowledgement
#[derive(Debug, Clone)]
pub struct SentPacket {
    pub time: u64,
    /// Bytes counted against the congestion window; 0 iff the packet is not ack-eliciting
    pub size: u16,
    pub ack_eliciting: bool,
    /// Ranges this packet acknowledged, for ack-of-ack pruning
    pub acks: RangeSet,
    pub retransmits: Retransmits,
}

/// Received-packet bookkeeping for ACK generation at one level
#[derive(Debug, Default)]
pub struct AckTracker {
    pub ranges: RangeSet,
    pub largest: Option<u64>,
    pub largest_recv_time: u64,
    /// When the oldest unacknowledged ack-eliciting packet arrived
    pub delay_start: u64,
    /// Ack-eliciting packets received since the last ACK went out
    pub unacked: u32,
    /// Send an ACK at the next opportunity regardless of thresholds
    pub immediate: bool,
    /// Snapshots to emit as standalone ACK frames, ahead of the live ranges
    pub oneshot: Vec<RangeSet>,
}

impl AckTracker {
    /// Track receipt of `pn`. Returns whether the packet was already represented (a duplicate).
    pub fn packet_received(&mut self, now: u64, pn: u64, ack_eliciting: bool) -> bool {
        let out_of_order = match self.largest {
            Some(largest) => pn < largest,
            None => false,
        };
        if self.largest.map_or(true, |x| pn > x) {
            self.largest = Some(pn);
            self.largest_recv_time = now;
        }
        if let Some(min) = self.ranges.min() {
            // Older than the oldest tracked range: acknowledge it on its own and move on,
            // rather than reviving evicted state
            if pn + 1 < min {
                if ack_eliciting {
                    let mut single = RangeSet::new();
                    single.insert_one(pn);
                    self.oneshot.push(single);
                    self.immediate = true;
                }
                return false;
            }
        }
        if !self.ranges.insert_one(pn) {
            return true;
        }
        if self.ranges.len() > MAX_ACK_RANGES {
            // Flush the full set before dropping the oldest range, so every tracked packet
            // is acknowledged at least once
            self.oneshot.push(self.ranges.clone());
            self.ranges.pop_min();
            self.immediate = true;
        }
        if ack_eliciting {
            if self.unacked == 0 {
                self.delay_start = now;
            }
            self.unacked += 1;
            if out_of_order {
                self.unacked = cmp::max(self.unacked, MAX_ACK_GAP);
            }
        }
        false
    }

    /// Whether an ACK should be bundled into the next packet without waiting on the delay timer
    pub fn should_send(&self) -> bool {
        self.immediate || self.unacked >= MAX_ACK_GAP || !self.oneshot.is_empty()
    }

    pub fn delay_exceeded(&self, now: u64, max_ack_delay: u64) -> bool {
        self.unacked > 0 && now.saturating_sub(self.delay_start) >= max_ack_delay
    }

    pub fn has_pending(&self) -> bool {
        self.unacked > 0 || self.immediate || !self.oneshot.is_empty()
    }

    /// Reset counters after the live ranges were encoded into an outgoing ACK
    pub fn sent(&mut self) {
        self.unacked = 0;
        self.immediate = false;
    }

    /// The peer acknowledged an ACK of ours with this largest packet number; stop re-acking
    /// everything at or below it
    pub fn acknowledged(&mut self, largest: u64) {
        self.ranges.remove(0..largest + 1);
    }
}

/// State specific to one packet-number space
pub struct PacketSpace {
    /// Packet protection for this space's level, absent until keys are installed
    pub crypto: Option<Crypto>,
    pub next_packet_number: u64,
    /// Highest packet number the peer has acknowledged
    pub largest_acked: Option<u64>,
    /// Transmitted but neither acknowledged nor declared lost
    pub sent: BTreeMap<u64, SentPacket>,
    pub pending: Retransmits,
    pub acks: AckTracker,
    /// Inbound CRYPTO stream reassembly
    pub crypto_stream: Assembler,
    /// Next outbound CRYPTO offset
    pub crypto_sent: u64,
    /// Sum of in-flight sizes of `sent`
    pub in_flight: u64,
    pub time_of_last_ack_eliciting: u64,
    /// Deadline at which the earliest unacknowledged packet is declared lost
    pub loss_time: Option<u64>,
}

impl PacketSpace {
    pub fn new() -> Self {
        PacketSpace {
            crypto: None,
            next_packet_number: 0,
            largest_acked: None,
            sent: BTreeMap::new(),
            pending: Retransmits::default(),
            acks: AckTracker::default(),
            crypto_stream: Assembler::new(),
            crypto_sent: 0,
            in_flight: 0,
            time_of_last_ack_eliciting: 0,
            loss_time: None,
        }
    }

    pub fn has_keys(&self) -> bool {
        self.crypto.is_some()
    }

    /// Queue handshake bytes for transmission at this level
    pub fn queue_crypto(&mut self, data: Bytes) {
        let offset = self.crypto_sent;
        self.crypto_sent += data.len() as u64;
        self.pending
            .crypto
            .push_back(frame::Crypto { offset, data });
    }

    /// Drop this space's keys and transmission state, e.g. once the handshake confirms.
    /// Returns the bytes that were still counted in flight.
    pub fn discard(&mut self) -> u64 {
        let freed = self.in_flight;
        self.crypto = None;
        self.sent.clear();
        self.pending = Retransmits::default();
        self.in_flight = 0;
        self.loss_time = None;
        freed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_matches_union_of_any_insertion_order() {
        let pns = [5u64, 1, 3, 2, 9, 8, 0, 4];
        let mut a = AckTracker::default();
        let mut b = AckTracker::default();
        for &pn in &pns {
            a.packet_received(0, pn, true);
        }
        for &pn in pns.iter().rev() {
            b.packet_received(0, pn, true);
        }
        assert_eq!(a.ranges, b.ranges);
        assert_eq!(a.ranges.iter().collect::<Vec<_>>(), &[0..6, 8..10]);
        assert_eq!(a.largest, Some(9));
    }

    #[test]
    fn tracker_detects_duplicates() {
        let mut t = AckTracker::default();
        assert!(!t.packet_received(0, 3, true));
        assert!(t.packet_received(1, 3, true));
        assert_eq!(t.unacked, 1);
    }

    #[test]
    fn tracker_bounded_ranges() {
        let mut t = AckTracker::default();
        // Insert only even packet numbers so every insertion opens a new range
        for pn in 0..(MAX_ACK_RANGES as u64 + 4) {
            t.packet_received(0, pn * 2, true);
        }
        assert!(t.ranges.len() <= MAX_ACK_RANGES);
        // Each eviction flushed a snapshot first
        assert_eq!(t.oneshot.len(), 4);
        assert!(t.immediate);
        // The newest range is retained, the oldest evicted
        assert!(t.ranges.contains((MAX_ACK_RANGES as u64 + 3) * 2));
        assert!(!t.ranges.contains(0));
    }

    #[test]
    fn tracker_old_packet_acked_once() {
        let mut t = AckTracker::default();
        for pn in 10..20 {
            t.packet_received(0, pn, true);
        }
        t.sent();
        // A long-delayed ack-eliciting packet below everything tracked
        t.packet_received(0, 2, true);
        assert_eq!(t.oneshot.len(), 1);
        assert_eq!(t.oneshot[0].iter().collect::<Vec<_>>(), &[2..3]);
        assert!(!t.ranges.contains(2));
        // Non-eliciting old packets are ignored entirely
        t.oneshot.clear();
        t.immediate = false;
        t.packet_received(0, 3, false);
        assert!(t.oneshot.is_empty());
        assert!(!t.immediate);
    }

    #[test]
    fn tracker_out_of_order_forces_ack() {
        let mut t = AckTracker::default();
        t.packet_received(0, 5, true);
        assert!(!t.should_send());
        // Reordered arrival jumps the counter to the threshold
        t.packet_received(1, 3, true);
        assert!(t.should_send());
    }

    #[test]
    fn tracker_ack_of_ack() {
        let mut t = AckTracker::default();
        for pn in 0..8 {
            t.packet_received(0, pn, true);
        }
        t.acknowledged(5);
        assert_eq!(t.ranges.iter().collect::<Vec<_>>(), &[6..8]);
    }

    #[test]
    fn delay_clock_starts_at_first_unacked() {
        let mut t = AckTracker::default();
        t.packet_received(100, 0, true);
        t.packet_received(200, 1, true);
        assert_eq!(t.delay_start, 100);
        assert!(!t.delay_exceeded(120, 25));
        assert!(t.delay_exceeded(125, 25));
        t.sent();
        t.packet_received(300, 2, true);
        assert_eq!(t.delay_start, 300);
    }
}
