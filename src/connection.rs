//! The per-connection state machine: packet handling, handshake orchestration, reliability,
//! congestion control, streams, and the close/drain lifecycle.

use std::net::SocketAddrV6;
use std::{cmp, mem};

use bytes::Bytes;
use fnv::FnvHashSet;
use slog::{self, Logger};

use cid::CidMap;
use coding::BufMutExt;
use crypto::{self, Crypto, HandshakeSink, Session, AEAD_TAG_SIZE};
use endpoint::{Config, Context, Event, Io};
use frame::{self, Frame};
use packet::{
    reserved_bits, set_payload_length, ConnectionId, Header, LongType, Packet, PacketNumber,
    PartialDecode,
};
use range_set::RangeSet;
use spaces::{PacketSpace, Retransmits, SentPacket, SpaceId};
use stream::{self, ReadError, RemoteStream, Streams, WriteError};
use transport_parameters::TransportParameters;
use {
    Directionality, Side, StreamId, TransportError, LOC_CID_SIZE, MAX_MTU, MIN_INITIAL_SIZE,
    MIN_MTU, REORDER_BUFFER_SIZE, RESET_TOKEN_SIZE,
};

/// Additional connection IDs issued to the peer when stateless resets are enabled
const ISSUED_CID_COUNT: u64 = 4;
/// Cap on backoff shifts, keeping timer arithmetic well-defined under persistent loss
const MAX_BACKOFF_EXPONENT: u32 = 16;
/// Closes the connection when ALPN is required but the handshake selected no protocol
const NO_APPLICATION_PROTOCOL: u64 = 0x178;

pub struct Connection {
    log: Logger,
    tls: Box<Session>,
    pub handle: ConnectionHandle,
    pub remote: SocketAddrV6,
    pub side: Side,
    /// DCID of the client's first Initial, used for initial keys and transport parameters
    pub init_cid: ConnectionId,
    /// CID the peer currently addresses us by
    pub loc_cid: ConnectionId,
    /// SCID of the Retry we sent, if any
    pub retry_cid: Option<ConnectionId>,
    /// Preferred CID for addressing the peer
    pub rem_cid: ConnectionId,
    /// The peer's SCID from the handshake, fixed for parameter validation
    orig_rem_cid: ConnectionId,
    rem_cids: CidMap,
    /// CIDs we have issued that the endpoint has not yet routed
    pub issued_cids: Vec<ConnectionId>,
    /// CIDs the peer retired, for the endpoint to stop routing
    pub retired_loc_cids: Vec<ConnectionId>,
    local_cids: Vec<(u64, ConnectionId)>,
    local_cid_seq: u64,
    pub state: Option<State>,
    pub app_closed: bool,
    /// First fatal error; later errors do not displace it
    pub error: Option<ConnectionError>,
    mtu: u16,
    spaces: [PacketSpace; 3],
    /// Highest level with keys installed; closes are sent here
    highest_space: SpaceId,
    /// Keys of the previous phase, with the first packet number of the current one
    prev_crypto: Option<(u64, Crypto)>,
    /// Pre-generated keys for the next phase
    next_crypto: Option<Crypto>,
    /// Early-data keys are installed but never used to surface data
    zero_rtt_crypto: Option<Crypto>,
    key_phase: bool,
    params: TransportParameters,
    peer_params: Option<TransportParameters>,
    /// Peer address ownership proven, lifting the amplification limit
    pub validated: bool,
    pub in_retry: bool,
    retry_token_checked: bool,
    handshake_done: bool,
    bytes_received: u64,
    bytes_sent: u64,

    /// Limit on outgoing data, dictated by peer
    pub max_data: u64,
    pub data_sent: u64,
    /// Sum of stream high-water marks. Includes gaps, so it's an upper bound.
    pub data_recvd: u64,
    /// Limit on incoming data
    pub local_max_data: u64,

    //
    // Loss detection and RTT (μs)
    //
    latest_rtt: u64,
    smoothed_rtt: u64,
    rttvar: u64,
    min_rtt: u64,
    pto_count: u32,

    //
    // Congestion control
    //
    /// Bytes of ack-eliciting packets transmitted but not acked or declared lost
    pub in_flight: u64,
    pub congestion_window: u64,
    ssthresh: u64,
    /// Packets sent at or before this instant do not open a new recovery epoch
    recovery_start_time: u64,

    /// Streams with data buffered for reading by the application
    readable_streams: FnvHashSet<StreamId>,
    /// Streams blocked on connection-level limits or their own window
    pub blocked_streams: FnvHashSet<StreamId>,
    streams: Streams,

    // Timer updates: None if no change, Some(None) to stop, Some(Some(_)) to reset
    pub set_idle: Option<Option<u64>>,
    pub set_loss_detection: Option<Option<u64>>,
    pub set_push: Option<Option<u64>>,
    pub set_close: Option<Option<u64>>,
    /// When a CONNECTION_CLOSE last went out, for rate-limiting re-emission
    close_sent: Option<u64>,
}

impl Connection {
    pub fn new(
        log: Logger,
        ctx: &mut Context,
        handle: ConnectionHandle,
        init_cid: ConnectionId,
        loc_cid: ConnectionId,
        rem_cid: ConnectionId,
        remote: SocketAddrV6,
        params: TransportParameters,
        tls: Box<Session>,
    ) -> Self {
        let mut spaces = [PacketSpace::new(), PacketSpace::new(), PacketSpace::new()];
        spaces[SpaceId::Initial as usize].crypto =
            Some(Crypto::new_initial(&init_cid, Side::Server));
        let config = &ctx.config;
        Connection {
            log,
            tls,
            handle,
            remote,
            side: Side::Server,
            init_cid,
            loc_cid,
            retry_cid: None,
            rem_cid,
            orig_rem_cid: rem_cid,
            rem_cids: CidMap::new(rem_cid),
            issued_cids: Vec::new(),
            retired_loc_cids: Vec::new(),
            local_cids: vec![(0, loc_cid)],
            local_cid_seq: 1,
            state: Some(State::Handshake),
            app_closed: false,
            error: None,
            mtu: MIN_MTU,
            spaces,
            highest_space: SpaceId::Initial,
            prev_crypto: None,
            next_crypto: None,
            zero_rtt_crypto: None,
            key_phase: false,
            params,
            peer_params: None,
            validated: false,
            in_retry: false,
            retry_token_checked: false,
            handshake_done: false,
            bytes_received: 0,
            bytes_sent: 0,

            max_data: 0,
            data_sent: 0,
            data_recvd: 0,
            local_max_data: config.receive_window,

            latest_rtt: 0,
            smoothed_rtt: 0,
            rttvar: 0,
            min_rtt: u64::max_value(),
            pto_count: 0,

            in_flight: 0,
            congestion_window: config.initial_window,
            ssthresh: u64::max_value(),
            recovery_start_time: 0,

            readable_streams: FnvHashSet::default(),
            blocked_streams: FnvHashSet::default(),
            streams: Streams::new(config.max_remote_bi_streams, config.max_remote_uni_streams),

            set_idle: None,
            set_loss_detection: None,
            set_push: None,
            set_close: None,
            close_sent: None,
        }
    }

    /// Account an inbound datagram before its packets are processed
    pub fn on_datagram(&mut self, config: &Config, now: u64, len: usize) {
        self.bytes_received += len as u64;
        self.reset_idle_timeout(config, now);
    }

    /// Process one packet out of a datagram
    pub fn handle_decode(
        &mut self,
        ctx: &mut Context,
        now: u64,
        partial_decode: PartialDecode,
        reset_tail: Option<[u8; RESET_TOKEN_SIZE]>,
    ) {
        if partial_decode.is_0rtt() {
            trace!(self.log, "dropping 0-RTT packet (not surfaced)");
            return;
        }
        if partial_decode.is_initial()
            && self.in_retry
            && !self.retry_token_checked
            && !self.check_retry_initial(ctx, now, &partial_decode)
        {
            return;
        }
        let space_id = partial_decode.space();
        let result = {
            let space = &self.spaces[space_id as usize];
            let crypto = match space.crypto {
                Some(ref x) => x,
                None => {
                    trace!(self.log, "dropping packet for level without keys"; "space" => space_id);
                    return;
                }
            };
            partial_decode.finish(crypto.header_decrypt_key(), space.acks.largest)
        };
        match result {
            Ok((packet, number)) => {
                self.handle_packet(ctx, now, packet, number, space_id, reset_tail);
            }
            Err(e) => {
                trace!(self.log, "unable to complete packet decoding"; "reason" => %e);
                self.check_stateless_reset(ctx, reset_tail);
            }
        }
    }

    /// Validate the token in a post-Retry Initial and rebase initial keys on the Retry CID
    fn check_retry_initial(
        &mut self,
        ctx: &mut Context,
        now: u64,
        partial_decode: &PartialDecode,
    ) -> bool {
        let retry_cid = self.retry_cid.expect("in_retry implies a Retry CID");
        if partial_decode.dst_cid() != retry_cid {
            trace!(self.log, "dropping pre-retry Initial");
            return false;
        }
        self.spaces[SpaceId::Initial as usize].crypto =
            Some(Crypto::new_initial(&retry_cid, Side::Server));
        let valid = match ctx.token_key {
            Some(ref key) => key.check(
                &self.remote,
                partial_decode.token(),
                now / 1000,
                ctx.config.retry_lifetime / 1000,
            ),
            None => false,
        };
        if !valid {
            debug!(self.log, "post-retry Initial carried an invalid token");
            self.fail(ctx, now, TransportError::INVALID_TOKEN);
            return false;
        }
        trace!(self.log, "retry token validated");
        self.retry_token_checked = true;
        self.validated = true;
        true
    }

    fn handle_packet(
        &mut self,
        ctx: &mut Context,
        now: u64,
        mut packet: Packet,
        number: u64,
        space_id: SpaceId,
        reset_tail: Option<[u8; RESET_TOKEN_SIZE]>,
    ) {
        match *self.state.as_ref().unwrap() {
            State::Draining | State::Drained => {
                return;
            }
            State::Closed(_) => {
                if self.decrypt_packet(space_id, number, &mut packet).is_err() {
                    return;
                }
                for frame in frame::Iter::new(packet.payload.freeze()) {
                    match frame {
                        Frame::ConnectionClose(_) | Frame::ApplicationClose(_) => {
                            trace!(self.log, "draining");
                            self.state = Some(State::Draining);
                            return;
                        }
                        _ => {}
                    }
                }
                // Answer with another close, rate-limited
                let interval = ctx.config.cc_min_interval;
                if self
                    .close_sent
                    .map_or(true, |t| now.saturating_sub(t) >= interval)
                {
                    self.transmit_close(ctx, now);
                }
                return;
            }
            _ => {}
        }

        if self.decrypt_packet(space_id, number, &mut packet).is_err() {
            debug!(self.log, "failed to authenticate packet"; "pn" => number);
            self.check_stateless_reset(ctx, reset_tail);
            return;
        }
        if reserved_bits(packet.header_data[0]) != 0 {
            warn!(self.log, "reserved bits set after decryption");
            self.fail(ctx, now, TransportError::PROTOCOL_VIOLATION);
            return;
        }
        trace!(self.log, "packet authenticated"; "pn" => number, "space" => space_id);
        if space_id != SpaceId::Initial && !self.validated {
            // The peer is using keys only we could have sent it
            self.validated = true;
        }
        if space_id == SpaceId::Handshake && self.spaces[SpaceId::Initial as usize].has_keys() {
            let freed = self.spaces[SpaceId::Initial as usize].discard();
            self.in_flight -= freed;
        }

        let payload = packet.payload.freeze();
        let mut ack_eliciting = false;
        let result = self.process_payload(ctx, now, number, space_id, payload, &mut ack_eliciting);
        self.spaces[space_id as usize]
            .acks
            .packet_received(now, number, ack_eliciting);
        match result {
            Ok(false) => {}
            Ok(true) => {
                self.enter_draining(ctx, now);
            }
            Err(e) => {
                self.fail(ctx, now, e);
            }
        }
        ctx.dirty_conns.insert(self.handle);
    }

    fn decrypt_packet(
        &mut self,
        space_id: SpaceId,
        number: u64,
        packet: &mut Packet,
    ) -> Result<(), ()> {
        if !packet.header.is_short() {
            let crypto = self.spaces[space_id as usize]
                .crypto
                .as_ref()
                .expect("keys were checked before decoding");
            return crypto.decrypt(number, &packet.header_data, &mut packet.payload);
        }
        let key_phase = packet.header.key_phase();
        if key_phase == self.key_phase {
            let crypto = match self.prev_crypto {
                Some((boundary, ref prev)) if number < boundary => prev,
                _ => self.spaces[space_id as usize]
                    .crypto
                    .as_ref()
                    .expect("keys were checked before decoding"),
            };
            return crypto.decrypt(number, &packet.header_data, &mut packet.payload);
        }
        if let Some((boundary, ref prev)) = self.prev_crypto {
            if number < boundary {
                return prev.decrypt(number, &packet.header_data, &mut packet.payload);
            }
        }
        // Alternate phase: accept only if it authenticates under the next generation
        let next = match self.next_crypto.take() {
            Some(x) => x,
            None => {
                return Err(());
            }
        };
        match next.decrypt(number, &packet.header_data, &mut packet.payload) {
            Ok(()) => {
                trace!(self.log, "key update"; "pn" => number);
                let old = mem::replace(
                    self.spaces[space_id as usize].crypto.as_mut().unwrap(),
                    next,
                );
                self.prev_crypto = Some((number, old));
                self.key_phase = !self.key_phase;
                self.next_crypto = Some(
                    self.spaces[space_id as usize]
                        .crypto
                        .as_ref()
                        .unwrap()
                        .update(),
                );
                Ok(())
            }
            Err(()) => {
                self.next_crypto = Some(next);
                Err(())
            }
        }
    }

    fn check_stateless_reset(
        &mut self,
        ctx: &mut Context,
        reset_tail: Option<[u8; RESET_TOKEN_SIZE]>,
    ) {
        let tail = match reset_tail {
            Some(x) => x,
            None => return,
        };
        if !self.rem_cids.matches_reset_token(&tail) {
            return;
        }
        if self.state.as_ref().unwrap().is_drained() {
            return;
        }
        debug!(self.log, "got stateless reset");
        self.set_loss_detection = Some(None);
        self.set_push = Some(None);
        self.set_idle = Some(None);
        ctx.events.push_back((
            self.handle,
            Event::ConnectionLost {
                reason: ConnectionError::Reset,
            },
        ));
        self.state = Some(State::Draining);
        ctx.dirty_conns.insert(self.handle);
    }

    fn process_payload(
        &mut self,
        ctx: &mut Context,
        now: u64,
        number: u64,
        space_id: SpaceId,
        payload: Bytes,
        ack_eliciting: &mut bool,
    ) -> Result<bool, TransportError> {
        for frame in frame::Iter::new(payload) {
            match frame {
                Frame::Padding => {}
                _ => {
                    trace!(self.log, "got frame"; "type" => frame.ty());
                }
            }
            if let Frame::Invalid(ty) = frame {
                debug!(self.log, "received malformed frame"; "type" => ty);
                return Err(TransportError::FRAME_ENCODING_ERROR.in_frame(ty.0));
            }
            if !frame.allowed_in(space_id) {
                debug!(self.log, "frame not permitted at this level";
                       "type" => frame.ty(), "space" => space_id);
                return Err(TransportError::PROTOCOL_VIOLATION.in_frame(frame.ty().0));
            }
            *ack_eliciting |= frame.is_ack_eliciting();
            match frame {
                Frame::Padding | Frame::Ping => {}
                Frame::Invalid(_) => unreachable!("rejected above"),
                Frame::Crypto(f) => {
                    self.handle_crypto(ctx, now, space_id, f)?;
                }
                Frame::Ack(ack) => {
                    self.on_ack_received(ctx, now, space_id, ack)?;
                }
                Frame::Stream(f) => {
                    self.handle_stream(ctx, f)?;
                }
                Frame::ResetStream(f) => {
                    self.handle_reset_stream(ctx, f)?;
                }
                Frame::StopSending { id, error_code } => {
                    self.handle_stop_sending(ctx, id, error_code)?;
                }
                Frame::MaxData(offset) => {
                    let was_blocked = self.blocked();
                    self.max_data = cmp::max(self.max_data, offset);
                    if was_blocked && !self.blocked() {
                        self.unblock_streams(ctx);
                    }
                }
                Frame::MaxStreamData { id, offset } => {
                    self.handle_max_stream_data(ctx, id, offset)?;
                }
                Frame::MaxStreams {
                    directionality,
                    count,
                } => {
                    if count > 1 << 60 {
                        return Err(TransportError::FRAME_ENCODING_ERROR);
                    }
                    let limit = match directionality {
                        Directionality::Uni => &mut self.streams.max_uni,
                        Directionality::Bi => &mut self.streams.max_bi,
                    };
                    if count > *limit {
                        *limit = count;
                        ctx.events
                            .push_back((self.handle, Event::StreamAvailable { directionality }));
                    }
                }
                Frame::DataBlocked { offset } => {
                    debug!(self.log, "peer blocked at connection level"; "offset" => offset);
                }
                Frame::StreamDataBlocked { id, offset } => {
                    debug!(self.log, "peer blocked at stream level"; "stream" => id, "offset" => offset);
                }
                Frame::StreamsBlocked {
                    directionality,
                    limit,
                } => {
                    debug!(self.log, "peer blocked on stream count";
                           "dir" => ?directionality, "limit" => limit);
                }
                Frame::NewConnectionId(f) => {
                    if self.orig_rem_cid.is_empty() {
                        debug!(self.log, "got NEW_CONNECTION_ID with zero-length remote CID");
                        return Err(TransportError::PROTOCOL_VIOLATION);
                    }
                    let update = self.rem_cids.insert(
                        f.sequence,
                        f.retire_prior_to,
                        f.id,
                        f.reset_token,
                        self.params.active_connection_id_limit,
                    )?;
                    for seq in update.retired {
                        self.spaces[SpaceId::Data as usize]
                            .pending
                            .retire_cids
                            .push(seq);
                    }
                    if let Some(id) = update.preferred {
                        trace!(self.log, "adopting new remote CID"; "cid" => %id);
                        self.rem_cid = id;
                    }
                }
                Frame::RetireConnectionId { sequence } => {
                    self.handle_retire_cid(ctx, sequence)?;
                }
                Frame::PathChallenge(token) => {
                    self.spaces[SpaceId::Data as usize]
                        .pending
                        .path_challenge(number, token);
                }
                Frame::PathResponse(_) => {
                    debug!(self.log, "unsolicited PATH_RESPONSE");
                    return Err(TransportError::PROTOCOL_VIOLATION);
                }
                Frame::NewToken { .. } | Frame::HandshakeDone => {
                    // Only servers send these
                    return Err(TransportError::PROTOCOL_VIOLATION.in_frame(frame.ty().0));
                }
                Frame::ConnectionClose(reason) => {
                    ctx.events.push_back((
                        self.handle,
                        Event::ConnectionLost {
                            reason: ConnectionError::ConnectionClosed { reason },
                        },
                    ));
                    return Ok(true);
                }
                Frame::ApplicationClose(reason) => {
                    ctx.events.push_back((
                        self.handle,
                        Event::ConnectionLost {
                            reason: ConnectionError::ApplicationClosed { reason },
                        },
                    ));
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    fn handle_crypto(
        &mut self,
        ctx: &mut Context,
        now: u64,
        space_id: SpaceId,
        frame: frame::Crypto,
    ) -> Result<(), TransportError> {
        {
            let assembler = &mut self.spaces[space_id as usize].crypto_stream;
            let fresh = (frame.offset + frame.data.len() as u64).saturating_sub(assembler.offset());
            if assembler.buffered() as u64 + fresh > REORDER_BUFFER_SIZE as u64 {
                debug!(self.log, "crypto reassembly over budget"; "space" => space_id);
                return Err(TransportError::CRYPTO_BUFFER_EXCEEDED);
            }
            assembler.insert(frame.offset, frame.data);
        }
        let mut sink = HandshakeSink::default();
        loop {
            let chunk = match self.spaces[space_id as usize]
                .crypto_stream
                .next(usize::max_value())
            {
                Some(x) => x,
                None => break,
            };
            self.tls.read_handshake(space_id, &chunk, &mut sink)?;
        }
        self.drain_sink(ctx, now, sink)
    }

    /// Apply everything the handshake session staged
    fn drain_sink(
        &mut self,
        ctx: &mut Context,
        now: u64,
        sink: HandshakeSink,
    ) -> Result<(), TransportError> {
        let HandshakeSink {
            outgoing,
            secrets,
            zero_rtt_secret,
            transport_parameters,
        } = sink;
        for (space_id, secrets) in secrets {
            trace!(self.log, "keys installed"; "space" => space_id);
            let crypto = Crypto::new(secrets)?;
            self.spaces[space_id as usize].crypto = Some(crypto);
            if space_id > self.highest_space {
                self.highest_space = space_id;
            }
            if space_id == SpaceId::Data {
                self.state = Some(State::Established);
            }
        }
        if let Some(secrets) = zero_rtt_secret {
            self.zero_rtt_crypto = Crypto::new(secrets).ok();
        }
        for (space_id, data) in outgoing {
            self.spaces[space_id as usize].queue_crypto(data.into());
        }
        if let Some(raw) = transport_parameters {
            self.handle_peer_params(&raw)?;
        }
        if !self.tls.is_handshaking() && !self.handshake_done {
            self.on_handshake_complete(ctx, now)?;
        }
        Ok(())
    }

    fn handle_peer_params(&mut self, raw: &[u8]) -> Result<(), TransportError> {
        let params = TransportParameters::read(Side::Server, &mut ::std::io::Cursor::new(raw))?;
        if params.initial_source_connection_id != Some(self.orig_rem_cid) {
            debug!(self.log, "initial_source_connection_id mismatch");
            return Err(TransportError::TRANSPORT_PARAMETER_ERROR);
        }
        self.mtu = cmp::max(
            MIN_MTU,
            cmp::min(MAX_MTU, params.max_udp_payload_size as u16),
        );
        self.max_data = params.initial_max_data;
        self.streams.max_bi = params.initial_max_streams_bidi;
        self.streams.max_uni = params.initial_max_streams_uni;
        // Streams the peer opened before its parameters were applied
        for (id, stream) in &mut self.streams.streams {
            if let Some(ref mut send) = stream.send {
                send.max_data = match (id.initiator(), id.directionality()) {
                    (Side::Client, Directionality::Bi) => params.initial_max_stream_data_bidi_local,
                    (Side::Server, Directionality::Bi) => {
                        params.initial_max_stream_data_bidi_remote
                    }
                    _ => params.initial_max_stream_data_uni,
                };
            }
        }
        trace!(self.log, "peer transport parameters applied");
        self.peer_params = Some(params);
        Ok(())
    }

    fn on_handshake_complete(&mut self, ctx: &mut Context, now: u64) -> Result<(), TransportError> {
        if ctx.config.require_alpn && self.tls.alpn_protocol().is_none() {
            debug!(self.log, "handshake completed without an application protocol");
            return Err(TransportError {
                code: NO_APPLICATION_PROTOCOL,
                frame: None,
            });
        }
        debug!(self.log, "handshake complete");
        self.handshake_done = true;
        self.spaces[SpaceId::Data as usize].pending.handshake_done = true;
        if let Some(ref key) = ctx.token_key {
            let token = key.generate(&mut ctx.rng, &self.remote, now / 1000);
            self.spaces[SpaceId::Data as usize]
                .pending
                .new_tokens
                .push(token.into());
        }
        self.next_crypto = self.spaces[SpaceId::Data as usize]
            .crypto
            .as_ref()
            .map(|x| x.update());
        let freed = self.spaces[SpaceId::Handshake as usize].discard();
        self.in_flight -= freed;
        self.issue_cids(ctx);
        let protocol = self.tls.alpn_protocol().map(|x| x.to_vec());
        ctx.events
            .push_back((self.handle, Event::Connected { protocol }));
        ctx.incoming.push_back(self.handle);
        ctx.incoming_handshakes -= 1;
        Ok(())
    }

    /// Issue additional CIDs, each advertising a stateless-reset token
    fn issue_cids(&mut self, ctx: &mut Context) {
        let limit = self
            .peer_params
            .as_ref()
            .map_or(2, |p| p.active_connection_id_limit);
        let target = cmp::min(limit, ISSUED_CID_COUNT + 1);
        while self.local_cid_seq < target {
            let reset_token = {
                let reset_key = match ctx.reset_key {
                    Some(ref x) => x,
                    None => return,
                };
                let id = ConnectionId::random(&mut ctx.rng, LOC_CID_SIZE);
                (id, crypto::reset_token_for(reset_key, &id))
            };
            let (id, token) = reset_token;
            let sequence = self.local_cid_seq;
            self.local_cid_seq += 1;
            self.local_cids.push((sequence, id));
            self.issued_cids.push(id);
            self.spaces[SpaceId::Data as usize]
                .pending
                .new_cids
                .push(frame::NewConnectionId {
                    sequence,
                    retire_prior_to: 0,
                    id,
                    reset_token: token,
                });
        }
    }

    fn handle_retire_cid(
        &mut self,
        ctx: &mut Context,
        sequence: u64,
    ) -> Result<(), TransportError> {
        if sequence >= self.local_cid_seq {
            debug!(self.log, "peer retired an unissued CID"; "seq" => sequence);
            return Err(TransportError::PROTOCOL_VIOLATION.in_frame(
                frame::Type::RETIRE_CONNECTION_ID.0,
            ));
        }
        if let Some(pos) = self.local_cids.iter().position(|&(seq, _)| seq == sequence) {
            let (_, id) = self.local_cids.remove(pos);
            self.retired_loc_cids.push(id);
            // Keep the peer supplied with replacements
            self.issue_cids(ctx);
        }
        Ok(())
    }

    //
    // ACK processing, RTT, loss detection
    //

    fn on_ack_received(
        &mut self,
        ctx: &mut Context,
        now: u64,
        space_id: SpaceId,
        ack: frame::Ack,
    ) -> Result<(), TransportError> {
        if ack.largest >= self.spaces[space_id as usize].next_packet_number {
            debug!(self.log, "got ACK for unsent packet"; "pn" => ack.largest);
            return Err(TransportError::PROTOCOL_VIOLATION.in_frame(frame::Type::ACK.0));
        }
        trace!(self.log, "got ack"; "largest" => ack.largest, "space" => space_id);
        let config = ctx.config.clone();
        let was_blocked = self.blocked();
        let largest_send_time = self.spaces[space_id as usize]
            .sent
            .get(&ack.largest)
            .map(|info| info.time);
        {
            let space = &mut self.spaces[space_id as usize];
            space.largest_acked = cmp::max(space.largest_acked, Some(ack.largest));
        }
        let newly_acked = {
            let space = &self.spaces[space_id as usize];
            let mut pns = Vec::new();
            for range in &ack {
                pns.extend(space.sent.range(range).map(|(&pn, _)| pn));
            }
            pns
        };
        if !newly_acked.is_empty() {
            let mut ack_eliciting_acked = false;
            let largest_newly = *newly_acked.iter().max().unwrap();
            for &pn in &newly_acked {
                self.on_packet_acked(ctx, &config, space_id, pn, &mut ack_eliciting_acked);
            }
            if largest_newly == ack.largest && ack_eliciting_acked {
                if let Some(send_time) = largest_send_time {
                    self.latest_rtt = now.saturating_sub(send_time);
                    let ack_delay = if space_id == SpaceId::Data {
                        let exp = self
                            .peer_params
                            .as_ref()
                            .map_or(3, |p| u32::from(p.ack_delay_exponent));
                        cmp::min(ack.delay << exp, self.peer_max_ack_delay())
                    } else {
                        0
                    };
                    self.update_rtt(ack_delay);
                }
            }
            self.pto_count = 0;
        }
        self.detect_lost_packets(&config, now, space_id);
        self.set_loss_detection_alarm(&config);
        for id in self.streams.finished.drain(..) {
            ctx.events
                .push_back((self.handle, Event::StreamFinished { stream: id }));
        }
        if was_blocked && !self.blocked() {
            self.unblock_streams(ctx);
        }
        Ok(())
    }

    // Not timing-aware; safe for inferred acknowledgements such as space discards
    fn on_packet_acked(
        &mut self,
        ctx: &mut Context,
        config: &Config,
        space_id: SpaceId,
        pn: u64,
        ack_eliciting_acked: &mut bool,
    ) {
        let info = match self.spaces[space_id as usize].sent.remove(&pn) {
            Some(x) => x,
            None => return,
        };
        if info.size != 0 {
            self.spaces[space_id as usize].in_flight -= u64::from(info.size);
            self.in_flight -= u64::from(info.size);
            if !self.in_recovery(info.time) {
                if self.congestion_window < self.ssthresh {
                    // Slow start
                    self.congestion_window += u64::from(info.size);
                } else {
                    // Congestion avoidance
                    self.congestion_window +=
                        config.default_mss * u64::from(info.size) / self.congestion_window;
                }
            }
        }
        *ack_eliciting_acked |= info.ack_eliciting;

        // The peer saw this ACK of ours; nothing it covered needs re-acknowledgement
        if let Some(largest) = info.acks.max() {
            self.spaces[space_id as usize].acks.acknowledged(largest);
        }

        // Delivery confirmation
        for frame in info.retransmits.stream {
            let id = frame.id;
            let len = frame.data.len() as u64;
            let done = {
                let ss = match self.streams.get_send_mut(&id) {
                    Some(x) => x,
                    None => continue,
                };
                ss.bytes_in_flight -= len;
                ss.acked += len;
                ss.state == stream::SendState::DataSent && ss.acked == ss.offset
            };
            if done {
                self.streams.get_send_mut(&id).unwrap().state = stream::SendState::DataRecvd;
                self.streams.finished.push(id);
                self.maybe_cleanup(id);
            } else if self.blocked_streams.contains(&id) {
                let unblocked = self
                    .streams
                    .get_send_mut(&id)
                    .map_or(false, |ss| ss.write_budget().is_ok());
                if unblocked {
                    self.blocked_streams.remove(&id);
                    ctx.events
                        .push_back((self.handle, Event::StreamWritable { stream: id }));
                }
            }
        }
        for (id, _) in info.retransmits.reset_stream {
            let confirmed = match self.streams.get_send_mut(&id) {
                Some(ss) => match ss.state {
                    stream::SendState::ResetSent { stop_reason } => {
                        ss.state = stream::SendState::ResetRecvd { stop_reason };
                        true
                    }
                    _ => false,
                },
                None => false,
            };
            if confirmed {
                self.maybe_cleanup(id);
            }
        }
    }

    fn update_rtt(&mut self, ack_delay: u64) {
        self.min_rtt = cmp::min(self.min_rtt, self.latest_rtt);
        let adjusted = if self.min_rtt + ack_delay < self.latest_rtt {
            self.latest_rtt - ack_delay
        } else {
            self.latest_rtt
        };
        if self.smoothed_rtt == 0 {
            self.smoothed_rtt = adjusted;
            self.rttvar = adjusted / 2;
        } else {
            let var_sample = (self.smoothed_rtt as i64 - adjusted as i64).abs() as u64;
            self.rttvar = (3 * self.rttvar + var_sample) / 4;
            self.smoothed_rtt = (7 * self.smoothed_rtt + adjusted) / 8;
        }
    }

    fn detect_lost_packets(&mut self, config: &Config, now: u64, space_id: SpaceId) {
        let largest_acked = match self.spaces[space_id as usize].largest_acked {
            Some(x) => x,
            None => return,
        };
        self.spaces[space_id as usize].loss_time = None;
        let rtt = cmp::max(self.latest_rtt, self.smoothed_rtt);
        let delay_until_lost = rtt + ((rtt * u64::from(config.time_reordering_fraction)) >> 16);
        let mut lost = Vec::new();
        {
            let space = &mut self.spaces[space_id as usize];
            for (&pn, info) in space.sent.range(..largest_acked) {
                let time_since_sent = now.saturating_sub(info.time);
                // >= for the time comparison so loss is detected in tests where rtt = 0
                if pn + u64::from(config.packet_threshold) <= largest_acked
                    || time_since_sent >= delay_until_lost
                {
                    lost.push(pn);
                } else if space.loss_time.is_none() {
                    space.loss_time = Some(info.time + delay_until_lost);
                }
            }
        }
        if lost.is_empty() {
            return;
        }
        trace!(self.log, "packets lost"; "count" => lost.len(), "space" => space_id);
        let mut latest_loss_sent = 0;
        let mut lost_nonack = false;
        for pn in lost {
            let mut info = self.spaces[space_id as usize].sent.remove(&pn).unwrap();
            if info.size != 0 {
                self.spaces[space_id as usize].in_flight -= u64::from(info.size);
                self.in_flight -= u64::from(info.size);
                lost_nonack = true;
                latest_loss_sent = cmp::max(latest_loss_sent, info.time);
            }
            self.reinject(space_id, &mut info);
        }
        // A loss after the last recovery epoch began shrinks the window anew
        if lost_nonack && latest_loss_sent > self.recovery_start_time {
            self.recovery_start_time = now;
            self.congestion_window =
                (self.congestion_window * u64::from(config.loss_reduction_factor)) >> 16;
            self.congestion_window = cmp::max(self.congestion_window, config.minimum_window);
            self.ssthresh = self.congestion_window;
        }
    }

    /// Return a lost packet's frames to the send queue, per retransmission policy
    fn reinject(&mut self, space_id: SpaceId, info: &mut SentPacket) {
        let mut retransmits = mem::replace(&mut info.retransmits, Retransmits::default());
        // Probes and path responses are regenerated, never replayed; ACK state lives in the
        // tracker; window updates re-encode from fresh limits via their flags
        retransmits.ping = false;
        retransmits.path_response = None;
        self.spaces[space_id as usize].pending += retransmits;
    }

    fn in_recovery(&self, sent_time: u64) -> bool {
        sent_time <= self.recovery_start_time
    }

    /// Probe timeout for a space, backed off by the number of unanswered probes
    fn pto(&self, config: &Config, space_id: SpaceId) -> u64 {
        let srtt = if self.smoothed_rtt == 0 {
            config.default_initial_rtt
        } else {
            self.smoothed_rtt
        };
        let backoff = cmp::min(self.pto_count, MAX_BACKOFF_EXPONENT);
        let mut timeout = (srtt + cmp::max(4 * self.rttvar, config.time_granularity)) << backoff;
        if space_id == SpaceId::Data && self.handshake_done {
            timeout += self.peer_max_ack_delay() << backoff;
        }
        timeout
    }

    fn set_loss_detection_alarm(&mut self, config: &Config) {
        if let Some((time, _)) = self.earliest_loss_time() {
            self.set_loss_detection = Some(Some(time));
            return;
        }
        if self.in_flight == 0 {
            self.set_loss_detection = Some(None);
            return;
        }
        let mut next = None;
        for space_id in SpaceId::iter() {
            let space = &self.spaces[space_id as usize];
            if space.in_flight == 0 {
                continue;
            }
            let t = space.time_of_last_ack_eliciting + self.pto(config, space_id);
            next = Some(match next {
                None => t,
                Some(x) => cmp::min(x, t),
            });
        }
        self.set_loss_detection = Some(next);
    }

    fn earliest_loss_time(&self) -> Option<(u64, SpaceId)> {
        let mut result: Option<(u64, SpaceId)> = None;
        for space_id in SpaceId::iter() {
            if let Some(time) = self.spaces[space_id as usize].loss_time {
                result = Some(match result {
                    Some((t, s)) if t <= time => (t, s),
                    _ => (time, space_id),
                });
            }
        }
        result
    }

    /// Loss-detection timer fired. The loss path runs first; PTO only when no loss is armed.
    pub fn check_packet_loss(&mut self, ctx: &mut Context, now: u64) {
        let config = ctx.config.clone();
        if let Some((_, space_id)) = self.earliest_loss_time() {
            self.detect_lost_packets(&config, now, space_id);
        } else {
            self.pto_fired(&config);
        }
        self.set_loss_detection_alarm(&config);
        ctx.dirty_conns.insert(self.handle);
    }

    fn pto_fired(&mut self, config: &Config) {
        self.pto_count += 1;
        // The space whose probe timer expired: earliest deadline with data in flight
        let mut target = None;
        for space_id in SpaceId::iter() {
            let space = &self.spaces[space_id as usize];
            if space.in_flight == 0 {
                continue;
            }
            let t = space.time_of_last_ack_eliciting + self.pto(config, space_id);
            target = Some(match target {
                Some((prev, s)) if prev <= t => (prev, s),
                _ => (t, space_id),
            });
        }
        let space_id = match target {
            Some((_, s)) => s,
            None => return,
        };
        trace!(self.log, "PTO fired"; "count" => self.pto_count, "space" => space_id);
        let oldest = self.spaces[space_id as usize].sent.keys().next().cloned();
        let probed = match oldest {
            Some(pn) => {
                let mut info = self.spaces[space_id as usize].sent.remove(&pn).unwrap();
                if info.size != 0 {
                    self.spaces[space_id as usize].in_flight -= u64::from(info.size);
                    self.in_flight -= u64::from(info.size);
                }
                let had_frames = !info.retransmits.is_empty();
                self.reinject(space_id, &mut info);
                had_frames
            }
            None => false,
        };
        if !probed {
            self.spaces[space_id as usize].pending.ping = true;
        }
    }

    //
    // Stream frame handlers
    //

    fn ensure_remote_stream(
        &mut self,
        ctx: &mut Context,
        id: StreamId,
    ) -> Result<RemoteStream, TransportError> {
        let send_window = match self.peer_params {
            Some(ref p) if id.directionality() == Directionality::Bi => {
                p.initial_max_stream_data_bidi_local
            }
            _ => 0,
        };
        let result = self.streams.ensure_remote(
            self.side,
            id,
            ctx.config.stream_receive_window,
            send_window,
        )?;
        if let RemoteStream::Open { ref opened } = result {
            for &new_id in opened {
                trace!(self.log, "peer stream opened"; "id" => new_id);
                ctx.events
                    .push_back((self.handle, Event::StreamOpened { stream: new_id }));
            }
        }
        Ok(result)
    }

    fn handle_stream(
        &mut self,
        ctx: &mut Context,
        frame: frame::Stream,
    ) -> Result<(), TransportError> {
        let id = frame.id;
        trace!(self.log, "got stream"; "id" => id, "offset" => frame.offset,
               "len" => frame.data.len(), "fin" => frame.fin);
        if id.initiator() == self.side && id.directionality() == Directionality::Uni {
            return Err(TransportError::STREAM_STATE_ERROR);
        }
        match self.ensure_remote_stream(ctx, id)? {
            RemoteStream::Gone => {
                trace!(self.log, "dropping frame for closed stream");
                return Ok(());
            }
            RemoteStream::Open { .. } => {}
        }
        let end = frame.offset + frame.data.len() as u64;
        let added = {
            let rs = self.streams.get_recv_mut(&id).unwrap();
            let fresh = end.saturating_sub(rs.limit());
            if self.data_recvd + fresh > self.local_max_data {
                debug!(self.log, "connection flow control exceeded";
                       "stream" => id, "recvd" => self.data_recvd, "max" => self.local_max_data);
                return Err(TransportError::FLOW_CONTROL_ERROR);
            }
            rs.ingest(frame.offset, frame.data, frame.fin)?
        };
        self.data_recvd += added;
        if self.data_recvd >= self.local_max_data / 2 {
            // Grow the connection window ahead of demand
            self.local_max_data *= 2;
            self.spaces[SpaceId::Data as usize].pending.max_data = true;
        }
        self.readable_streams.insert(id);
        ctx.readable_conns.insert(self.handle);
        Ok(())
    }

    fn handle_reset_stream(
        &mut self,
        ctx: &mut Context,
        frame: frame::ResetStream,
    ) -> Result<(), TransportError> {
        let id = frame.id;
        if id.initiator() == self.side && id.directionality() == Directionality::Uni {
            return Err(TransportError::STREAM_STATE_ERROR.in_frame(frame::Type::RESET_STREAM.0));
        }
        match self.ensure_remote_stream(ctx, id)? {
            RemoteStream::Gone => {
                trace!(self.log, "got RESET_STREAM on closed stream");
                return Ok(());
            }
            RemoteStream::Open { .. } => {}
        }
        let fresh = {
            let rs = self.streams.get_recv_mut(&id).unwrap();
            if let Some(offset) = rs.final_offset() {
                if offset != frame.final_offset {
                    return Err(TransportError::FINAL_SIZE_ERROR);
                }
            }
            if frame.final_offset < rs.limit() {
                return Err(TransportError::FINAL_SIZE_ERROR);
            }
            let fresh = frame.final_offset - rs.limit();
            if self.data_recvd + fresh > self.local_max_data {
                return Err(TransportError::FLOW_CONTROL_ERROR);
            }
            rs.reset(frame.final_offset, frame.error_code);
            fresh
        };
        self.data_recvd += fresh;
        self.readable_streams.insert(id);
        ctx.readable_conns.insert(self.handle);
        Ok(())
    }

    fn handle_stop_sending(
        &mut self,
        ctx: &mut Context,
        id: StreamId,
        error_code: u64,
    ) -> Result<(), TransportError> {
        if id.initiator() != self.side && id.directionality() == Directionality::Uni {
            // We never send on the peer's unidirectional streams
            return Err(TransportError::STREAM_STATE_ERROR.in_frame(frame::Type::STOP_SENDING.0));
        }
        if let RemoteStream::Gone = self.ensure_remote_stream(ctx, id)? {
            return Ok(());
        }
        {
            let ss = match self.streams.get_send_mut(&id) {
                Some(x) => x,
                None => return Ok(()),
            };
            if ss.state.was_reset() {
                return Ok(());
            }
            ss.state = stream::SendState::ResetSent {
                stop_reason: Some(error_code),
            };
        }
        self.spaces[SpaceId::Data as usize]
            .pending
            .reset_stream
            .push((id, error_code));
        ctx.dirty_conns.insert(self.handle);
        Ok(())
    }

    fn handle_max_stream_data(
        &mut self,
        ctx: &mut Context,
        id: StreamId,
        offset: u64,
    ) -> Result<(), TransportError> {
        if id.initiator() != self.side && id.directionality() == Directionality::Uni {
            debug!(self.log, "got MAX_STREAM_DATA on recv-only stream");
            return Err(
                TransportError::PROTOCOL_VIOLATION.in_frame(frame::Type::MAX_STREAM_DATA.0)
            );
        }
        if let RemoteStream::Gone = self.ensure_remote_stream(ctx, id)? {
            return Ok(());
        }
        let newly_writable = {
            let ss = match self.streams.get_send_mut(&id) {
                Some(x) => x,
                None => return Ok(()),
            };
            if offset <= ss.max_data {
                return Ok(());
            }
            trace!(self.log, "stream limit increased"; "stream" => id, "new" => offset);
            let at_limit = ss.offset == ss.max_data;
            ss.max_data = offset;
            at_limit
        };
        if newly_writable {
            self.blocked_streams.remove(&id);
            ctx.events
                .push_back((self.handle, Event::StreamWritable { stream: id }));
        }
        Ok(())
    }

    fn unblock_streams(&mut self, ctx: &mut Context) {
        for stream in self.blocked_streams.drain() {
            ctx.events
                .push_back((self.handle, Event::StreamWritable { stream }));
        }
    }

    //
    // Application-facing stream operations
    //

    pub fn open(&mut self, config: &Config, direction: Directionality) -> Option<StreamId> {
        let send_window = match self.peer_params {
            Some(ref p) => match direction {
                Directionality::Bi => p.initial_max_stream_data_bidi_remote,
                Directionality::Uni => p.initial_max_stream_data_uni,
            },
            None => 0,
        };
        self.streams
            .open(self.side, direction, config.stream_receive_window, send_window)
    }

    pub fn write(
        &mut self,
        ctx: &mut Context,
        stream: StreamId,
        data: &[u8],
    ) -> Result<usize, WriteError> {
        assert!(stream.directionality() == Directionality::Bi || stream.initiator() == self.side);
        if self.state.as_ref().unwrap().is_closed() {
            trace!(self.log, "write blocked; connection closed"; "stream" => stream);
            return Err(WriteError::Blocked);
        }
        if self.blocked() {
            trace!(self.log, "write blocked by connection limits"; "stream" => stream);
            self.blocked_streams.insert(stream);
            return Err(WriteError::Blocked);
        }
        let budget = {
            let ss = self
                .streams
                .get_send_mut(&stream)
                .expect("write on unopened or recv-only stream");
            ss.write_budget()
        };
        let budget = match budget {
            Ok(x) => x,
            Err(e) => {
                if let WriteError::Blocked = e {
                    self.blocked_streams.insert(stream);
                }
                return Err(e);
            }
        };
        let conn_budget = self.max_data - self.data_sent;
        let n = cmp::min(cmp::min(budget, conn_budget), data.len() as u64) as usize;
        self.queue_stream_data(stream, Bytes::from(&data[..n]));
        ctx.dirty_conns.insert(self.handle);
        trace!(self.log, "write"; "stream" => stream, "len" => n);
        Ok(n)
    }

    fn queue_stream_data(&mut self, stream: StreamId, data: Bytes) {
        let offset = {
            let ss = self.streams.get_send_mut(&stream).unwrap();
            debug_assert_eq!(ss.state, stream::SendState::Ready);
            let x = ss.offset;
            ss.offset += data.len() as u64;
            ss.bytes_in_flight += data.len() as u64;
            x
        };
        self.data_sent += data.len() as u64;
        self.spaces[SpaceId::Data as usize]
            .pending
            .stream
            .push_back(frame::Stream {
                id: stream,
                offset,
                fin: false,
                data,
            });
    }

    /// Signal that no further data will be written to `stream`
    pub fn finish(&mut self, id: StreamId) {
        let offset = {
            let ss = self
                .streams
                .get_send_mut(&id)
                .expect("unknown or recv-only stream");
            assert_eq!(ss.state, stream::SendState::Ready);
            ss.state = stream::SendState::DataSent;
            ss.offset
        };
        let pending = &mut self.spaces[SpaceId::Data as usize].pending;
        for frame in &mut pending.stream {
            if frame.id == id && frame.offset + frame.data.len() as u64 == offset {
                frame.fin = true;
                return;
            }
        }
        pending.stream.push_back(frame::Stream {
            id,
            data: Bytes::new(),
            offset,
            fin: true,
        });
    }

    pub fn read(&mut self, id: StreamId, buf: &mut [u8]) -> Result<usize, ReadError> {
        if self.state.as_ref().unwrap().is_closed() {
            return Err(ReadError::Reset { error_code: 0 });
        }
        let result = {
            let advertise = {
                let rs = match self.streams.get_recv_mut(&id) {
                    Some(x) => x,
                    None => return Err(ReadError::Finished),
                };
                let result = rs.read(buf);
                (result, result.is_ok() && rs.receiving_unknown_size())
            };
            if advertise.1 {
                // Reading freed window; advertise the new limit
                self.spaces[SpaceId::Data as usize]
                    .pending
                    .max_stream_data
                    .insert(id);
            }
            advertise.0
        };
        match result {
            Err(ReadError::Finished) | Err(ReadError::Reset { .. }) => {
                self.maybe_cleanup(id);
            }
            _ => {}
        }
        result
    }

    /// Abandon transmission on `stream`
    pub fn reset(&mut self, ctx: &mut Context, stream: StreamId, error_code: u64) {
        assert!(
            stream.directionality() == Directionality::Bi || stream.initiator() == self.side,
            "only streams supporting outgoing data may be reset"
        );
        {
            let ss = match self.streams.get_send_mut(&stream) {
                Some(x) => x,
                None => return,
            };
            match ss.state {
                stream::SendState::DataRecvd
                | stream::SendState::ResetSent { .. }
                | stream::SendState::ResetRecvd { .. } => return,
                _ => {}
            }
            ss.state = stream::SendState::ResetSent { stop_reason: None };
        }
        self.spaces[SpaceId::Data as usize]
            .pending
            .reset_stream
            .push((stream, error_code));
        ctx.dirty_conns.insert(self.handle);
    }

    /// Ask the peer to stop transmitting on a stream we no longer read
    pub fn stop_sending(&mut self, id: StreamId, error_code: u64) {
        assert!(
            id.directionality() == Directionality::Bi || id.initiator() != self.side,
            "only streams with incoming data may be stopped"
        );
        let finished = self
            .streams
            .get_recv_mut(&id)
            .map_or(true, |rs| rs.is_finished());
        if !finished {
            self.spaces[SpaceId::Data as usize]
                .pending
                .stop_sending
                .push((id, error_code));
        }
    }

    /// Discard a fully-closed stream, crediting the peer's stream limit
    pub fn maybe_cleanup(&mut self, id: StreamId) {
        let closed = self
            .streams
            .streams
            .get(&id)
            .map_or(false, |x| x.is_closed());
        if !closed {
            return;
        }
        self.streams.streams.remove(&id);
        if id.initiator() != self.side {
            let pending = &mut self.spaces[SpaceId::Data as usize].pending;
            match id.directionality() {
                Directionality::Uni => {
                    self.streams.max_remote_uni += 1;
                    pending.max_uni_streams = true;
                }
                Directionality::Bi => {
                    self.streams.max_remote_bi += 1;
                    pending.max_bi_streams = true;
                }
            }
        }
    }

    pub fn poll(&mut self) -> Option<Event> {
        if let Some(&stream) = self.readable_streams.iter().next() {
            self.readable_streams.remove(&stream);
            let fresh = self
                .streams
                .get_recv_mut(&stream)
                .map_or(false, |rs| mem::replace(&mut rs.fresh, false));
            return Some(Event::StreamReadable { stream, fresh });
        }
        None
    }

    //
    // Flow and congestion gates
    //

    fn congestion_blocked(&self) -> bool {
        self.congestion_window.saturating_sub(self.in_flight) < u64::from(self.mtu)
    }

    fn blocked(&self) -> bool {
        self.data_sent >= self.max_data || self.congestion_blocked()
    }

    /// Bytes we may still transmit under the pre-validation amplification limit
    fn send_budget(&self) -> u64 {
        if self.validated {
            u64::max_value()
        } else {
            (3 * self.bytes_received).saturating_sub(self.bytes_sent)
        }
    }

    //
    // Packetization
    //

    /// Build the next outgoing packet, if any work is pending
    pub fn next_packet(&mut self, config: &Config, now: u64) -> Option<Vec<u8>> {
        match *self.state.as_ref().unwrap() {
            State::Handshake | State::Established => {}
            _ => return None,
        }
        let budget = self.send_budget();
        if budget < 64 {
            return None;
        }
        let max_ack_delay = self.peer_max_ack_delay();
        let congestion_blocked = self.congestion_blocked();
        let space_id = SpaceId::iter().find(|&id| {
            let space = &self.spaces[id as usize];
            if !space.has_keys() {
                return false;
            }
            let acks = space.acks.should_send() || space.acks.delay_exceeded(now, max_ack_delay);
            if congestion_blocked {
                return acks;
            }
            acks || !space.pending.is_empty()
        })?;

        // Padded Initial packets must fit the amplification budget whole
        if space_id == SpaceId::Initial && budget < MIN_INITIAL_SIZE as u64 {
            return None;
        }
        let rem_cid = self.rem_cid;
        let loc_cid = self.loc_cid;
        let key_phase = self.key_phase;
        let mtu = cmp::min(u64::from(self.mtu), budget) as usize;
        let max_size = mtu - AEAD_TAG_SIZE;
        let ack_delay_exponent = self.params.ack_delay_exponent;

        let mut buf = Vec::with_capacity(mtu);
        let mut sent = Retransmits::default();
        let mut acks = RangeSet::new();
        let mut ack_eliciting = false;

        let (number, header_len, pn_len, partial_encode) = {
            let space = &mut self.spaces[space_id as usize];
            let number = space.next_packet_number;
            space.next_packet_number += 1;
            let pn = PacketNumber::new(number, space.largest_acked.unwrap_or(0));
            let header = match space_id {
                SpaceId::Initial => Header::Initial {
                    dst_cid: rem_cid,
                    src_cid: loc_cid,
                    token: Bytes::new(),
                    number: pn,
                },
                SpaceId::Handshake => Header::Long {
                    ty: LongType::Handshake,
                    dst_cid: rem_cid,
                    src_cid: loc_cid,
                    number: pn,
                },
                SpaceId::Data => Header::Short {
                    dst_cid: rem_cid,
                    number: pn,
                    key_phase,
                },
            };
            let partial_encode = header.encode(&mut buf);
            (number, buf.len(), pn.len(), partial_encode)
        };

        {
            let space = &mut self.spaces[space_id as usize];

            // One-shot ACK snapshots go out ahead of the live ranges
            while !space.acks.oneshot.is_empty() {
                let estimate = 16 + space.acks.oneshot[0].len() * 16;
                if buf.len() + estimate >= max_size {
                    break;
                }
                let snapshot = space.acks.oneshot.remove(0);
                frame::Ack::encode(0, &snapshot, &mut buf);
            }

            // ACK
            if !space.acks.ranges.is_empty()
                && (space.acks.has_pending() || !space.pending.is_empty())
            {
                let delay = if space_id == SpaceId::Data {
                    now.saturating_sub(space.acks.largest_recv_time) >> ack_delay_exponent
                } else {
                    0
                };
                trace!(self.log, "ACK"; "delay" => delay, "space" => space_id);
                frame::Ack::encode(delay, &space.acks.ranges, &mut buf);
                acks = space.acks.ranges.clone();
                space.acks.sent();
            }

            // PING
            if space.pending.ping && buf.len() + 1 < max_size {
                trace!(self.log, "PING");
                space.pending.ping = false;
                ack_eliciting = true;
                buf.push(frame::Type::PING.into());
            }

            // PATH_RESPONSE
            if buf.len() + 9 < max_size {
                // Not retransmitted on loss; a fresh challenge will come if it matters
                if let Some((_, token)) = space.pending.path_response.take() {
                    trace!(self.log, "PATH_RESPONSE"; "value" => format!("{:016x}", token));
                    buf.write(frame::Type::PATH_RESPONSE);
                    buf.write(token);
                    ack_eliciting = true;
                }
            }

            // HANDSHAKE_DONE
            if space.pending.handshake_done && buf.len() + 1 < max_size {
                trace!(self.log, "HANDSHAKE_DONE");
                space.pending.handshake_done = false;
                sent.handshake_done = true;
                ack_eliciting = true;
                buf.push(frame::Type::HANDSHAKE_DONE.into());
            }

            // CRYPTO
            while buf.len() + frame::Crypto::SIZE_BOUND < max_size {
                let mut frame = match space.pending.crypto.pop_front() {
                    Some(x) => x,
                    None => break,
                };
                let len = cmp::min(
                    frame.data.len(),
                    max_size - buf.len() - frame::Crypto::SIZE_BOUND,
                );
                let data = frame.data.split_to(len);
                let chunk = frame::Crypto {
                    offset: frame.offset,
                    data,
                };
                trace!(self.log, "CRYPTO"; "off" => chunk.offset, "len" => len);
                chunk.encode(&mut buf);
                sent.crypto.push_back(chunk);
                ack_eliciting = true;
                if !frame.data.is_empty() {
                    frame.offset += len as u64;
                    space.pending.crypto.push_front(frame);
                }
            }
        }

        if space_id == SpaceId::Data {
            self.populate_data_frames(max_size, &mut buf, &mut sent, &mut ack_eliciting);
        }

        // Nothing made it in; roll the number back and report idle
        if buf.len() == header_len {
            self.spaces[space_id as usize].next_packet_number -= 1;
            return None;
        }

        let ack_only = !ack_eliciting;
        // Ack-eliciting Initial packets ride in 1200-byte datagrams
        if space_id == SpaceId::Initial
            && ack_eliciting
            && buf.len() < MIN_INITIAL_SIZE - AEAD_TAG_SIZE
        {
            buf.resize(MIN_INITIAL_SIZE - AEAD_TAG_SIZE, frame::Type::PADDING.into());
        }
        // Header protection samples ciphertext 4 bytes past the packet-number start
        if buf.len() - header_len + pn_len < 4 {
            let pad = 4 - pn_len - (buf.len() - header_len);
            let target = buf.len() + pad;
            buf.resize(target, frame::Type::PADDING.into());
        }
        if space_id != SpaceId::Data {
            set_payload_length(&mut buf, header_len, pn_len, AEAD_TAG_SIZE);
        }
        {
            let crypto = self.spaces[space_id as usize].crypto.as_ref().unwrap();
            crypto.encrypt(number, &mut buf, header_len);
            partial_encode.finish(&mut buf, crypto.header_encrypt_key(), header_len - pn_len);
        }

        self.bytes_sent += buf.len() as u64;
        let size = if ack_only { 0 } else { buf.len() as u16 };
        {
            let space = &mut self.spaces[space_id as usize];
            space.sent.insert(
                number,
                SentPacket {
                    time: now,
                    size,
                    ack_eliciting: !ack_only,
                    acks,
                    retransmits: sent,
                },
            );
            if !ack_only {
                space.in_flight += u64::from(size);
                space.time_of_last_ack_eliciting = now;
            }
        }
        if !ack_only {
            self.in_flight += u64::from(size);
            self.set_loss_detection_alarm(config);
        }
        trace!(self.log, "sending packet"; "pn" => number, "space" => space_id, "len" => buf.len());
        Some(buf)
    }

    /// Application-space frames: stream management, flow-control updates, stream data
    fn populate_data_frames(
        &mut self,
        max_size: usize,
        buf: &mut Vec<u8>,
        sent: &mut Retransmits,
        ack_eliciting: &mut bool,
    ) {
        // RESET_STREAM
        while buf.len() + 19 < max_size {
            let (id, error_code) = {
                let pending = &mut self.spaces[SpaceId::Data as usize].pending;
                match pending.reset_stream.pop() {
                    Some(x) => x,
                    None => break,
                }
            };
            let final_offset = match self.streams.get_send_mut(&id) {
                Some(ss) => ss.offset,
                None => continue,
            };
            trace!(self.log, "RESET_STREAM"; "stream" => id);
            sent.reset_stream.push((id, error_code));
            *ack_eliciting = true;
            frame::ResetStream {
                id,
                error_code,
                final_offset,
            }.encode(buf);
        }

        // STOP_SENDING
        while buf.len() + 11 < max_size {
            let (id, error_code) = {
                let pending = &mut self.spaces[SpaceId::Data as usize].pending;
                match pending.stop_sending.pop() {
                    Some(x) => x,
                    None => break,
                }
            };
            let finished = self
                .streams
                .get_recv_mut(&id)
                .map_or(true, |rs| rs.is_finished());
            if finished {
                continue;
            }
            trace!(self.log, "STOP_SENDING"; "stream" => id);
            sent.stop_sending.push((id, error_code));
            *ack_eliciting = true;
            buf.write(frame::Type::STOP_SENDING);
            buf.write(id);
            buf.write_var(error_code);
        }

        // MAX_DATA
        if self.spaces[SpaceId::Data as usize].pending.max_data && buf.len() + 9 < max_size {
            trace!(self.log, "MAX_DATA"; "value" => self.local_max_data);
            self.spaces[SpaceId::Data as usize].pending.max_data = false;
            sent.max_data = true;
            *ack_eliciting = true;
            buf.write(frame::Type::MAX_DATA);
            buf.write_var(self.local_max_data);
        }

        // MAX_STREAM_DATA
        while buf.len() + 17 < max_size {
            let id = {
                let pending = &mut self.spaces[SpaceId::Data as usize].pending;
                match pending.max_stream_data.iter().next().cloned() {
                    Some(x) => {
                        pending.max_stream_data.remove(&x);
                        x
                    }
                    None => break,
                }
            };
            let max = match self.streams.get_recv_mut(&id) {
                Some(rs) => {
                    if rs.is_finished() {
                        continue;
                    }
                    rs.max_data
                }
                None => continue,
            };
            trace!(self.log, "MAX_STREAM_DATA"; "stream" => id, "value" => max);
            sent.max_stream_data.insert(id);
            *ack_eliciting = true;
            buf.write(frame::Type::MAX_STREAM_DATA);
            buf.write(id);
            buf.write_var(max);
        }

        // MAX_STREAMS
        for &uni in &[true, false] {
            let queued = {
                let pending = &mut self.spaces[SpaceId::Data as usize].pending;
                let flag = if uni {
                    &mut pending.max_uni_streams
                } else {
                    &mut pending.max_bi_streams
                };
                mem::replace(flag, false)
            };
            if !queued || buf.len() + 9 >= max_size {
                continue;
            }
            let (ty, count) = if uni {
                sent.max_uni_streams = true;
                (frame::Type::MAX_STREAMS_UNI, self.streams.max_remote_uni)
            } else {
                sent.max_bi_streams = true;
                (frame::Type::MAX_STREAMS_BIDI, self.streams.max_remote_bi)
            };
            trace!(self.log, "MAX_STREAMS"; "uni" => uni, "value" => count);
            *ack_eliciting = true;
            buf.write(ty);
            buf.write_var(count);
        }

        // NEW_CONNECTION_ID
        while buf.len() + 44 < max_size {
            let frame = {
                let pending = &mut self.spaces[SpaceId::Data as usize].pending;
                match pending.new_cids.pop() {
                    Some(x) => x,
                    None => break,
                }
            };
            trace!(self.log, "NEW_CONNECTION_ID"; "seq" => frame.sequence);
            frame.encode(buf);
            sent.new_cids.push(frame);
            *ack_eliciting = true;
        }

        // RETIRE_CONNECTION_ID
        while buf.len() + 10 < max_size {
            let seq = {
                let pending = &mut self.spaces[SpaceId::Data as usize].pending;
                match pending.retire_cids.pop() {
                    Some(x) => x,
                    None => break,
                }
            };
            trace!(self.log, "RETIRE_CONNECTION_ID"; "seq" => seq);
            buf.write(frame::Type::RETIRE_CONNECTION_ID);
            buf.write_var(seq);
            sent.retire_cids.push(seq);
            *ack_eliciting = true;
        }

        // NEW_TOKEN
        loop {
            let token = {
                let pending = &mut self.spaces[SpaceId::Data as usize].pending;
                match pending.new_tokens.last() {
                    Some(x) if buf.len() + 10 + x.len() < max_size => {}
                    _ => break,
                }
                pending.new_tokens.pop().unwrap()
            };
            trace!(self.log, "NEW_TOKEN"; "len" => token.len());
            buf.write(frame::Type::NEW_TOKEN);
            buf.write_var(token.len() as u64);
            buf.extend_from_slice(&token);
            sent.new_tokens.push(token);
            *ack_eliciting = true;
        }

        // STREAM
        while buf.len() + frame::Stream::SIZE_BOUND < max_size {
            let mut frame = {
                let pending = &mut self.spaces[SpaceId::Data as usize].pending;
                match pending.stream.pop_front() {
                    Some(x) => x,
                    None => break,
                }
            };
            // Data for streams reset after queueing is not sent
            let reset = self
                .streams
                .get_send_mut(&frame.id)
                .map_or(true, |ss| ss.state.was_reset());
            if reset {
                continue;
            }
            let len = cmp::min(
                frame.data.len(),
                max_size - buf.len() - frame::Stream::SIZE_BOUND,
            );
            let data = frame.data.split_to(len);
            let fin = frame.fin && frame.data.is_empty();
            trace!(self.log, "STREAM"; "id" => frame.id, "off" => frame.offset,
                   "len" => len, "fin" => fin);
            let chunk = frame::Stream {
                id: frame.id,
                offset: frame.offset,
                fin,
                data,
            };
            chunk.encode(true, buf);
            sent.stream.push_back(chunk);
            *ack_eliciting = true;
            if !frame.data.is_empty() {
                frame.offset += len as u64;
                let pending = &mut self.spaces[SpaceId::Data as usize].pending;
                pending.stream.push_front(frame);
            }
        }
    }

    //
    // Close, drain, timers
    //

    /// Close initiated by the application
    pub fn close(&mut self, ctx: &mut Context, now: u64, error_code: u64, reason: Bytes) {
        self.app_closed = true;
        match *self.state.as_ref().unwrap() {
            State::Draining | State::Drained | State::Closed(_) => return,
            _ => {}
        }
        let reason =
            state::CloseReason::Application(frame::ApplicationClose { error_code, reason });
        self.enter_closing(ctx, now, reason);
    }

    /// Fatal protocol error: record it, notify the application, and begin closing
    fn fail(&mut self, ctx: &mut Context, now: u64, error: TransportError) {
        if self.error.is_none() {
            self.error = Some(ConnectionError::TransportError { error_code: error });
        }
        ctx.events.push_back((
            self.handle,
            Event::ConnectionLost {
                reason: ConnectionError::TransportError { error_code: error },
            },
        ));
        // Readers of every open stream must observe the failure
        let open: Vec<StreamId> = self.streams.streams.keys().cloned().collect();
        for id in open {
            self.readable_streams.insert(id);
        }
        ctx.readable_conns.insert(self.handle);
        let reason = state::CloseReason::Connection(frame::ConnectionClose {
            error_code: error.code,
            frame_type: error.frame.map(frame::Type),
            reason: Bytes::new(),
        });
        self.enter_closing(ctx, now, reason);
    }

    fn enter_closing(&mut self, ctx: &mut Context, now: u64, reason: state::CloseReason) {
        if self.state.as_ref().unwrap().is_closed() {
            return;
        }
        trace!(self.log, "connection closing");
        let config = ctx.config.clone();
        self.state = Some(State::Closed(state::Closed { reason }));
        self.set_loss_detection = Some(None);
        self.set_push = Some(None);
        self.set_close = Some(Some(now + 3 * self.pto(&config, SpaceId::Data)));
        self.transmit_close(ctx, now);
        ctx.dirty_conns.insert(self.handle);
    }

    fn enter_draining(&mut self, ctx: &mut Context, now: u64) {
        if let State::Draining = *self.state.as_ref().unwrap() {
            return;
        }
        trace!(self.log, "draining");
        let config = ctx.config.clone();
        self.state = Some(State::Draining);
        self.set_loss_detection = Some(None);
        self.set_push = Some(None);
        self.set_close = Some(Some(now + 3 * self.pto(&config, SpaceId::Data)));
        ctx.dirty_conns.insert(self.handle);
    }

    /// Emit CONNECTION_CLOSE at the current write level; when that level is Handshake a
    /// second copy goes out at Initial in case the peer has not progressed
    fn transmit_close(&mut self, ctx: &mut Context, now: u64) {
        let reason = match *self.state.as_ref().unwrap() {
            State::Closed(ref x) => x.reason.clone(),
            _ => return,
        };
        self.close_sent = Some(now);
        let mut levels = vec![self.highest_space];
        if self.highest_space == SpaceId::Handshake {
            levels.push(SpaceId::Initial);
        }
        for space_id in levels {
            if let Some(packet) = self.make_close(space_id, &reason) {
                self.bytes_sent += packet.len() as u64;
                ctx.io.push_back(Io::Transmit {
                    destination: self.remote,
                    packet: packet.into(),
                });
            }
        }
    }

    fn make_close(&mut self, space_id: SpaceId, reason: &state::CloseReason) -> Option<Vec<u8>> {
        if !self.spaces[space_id as usize].has_keys() {
            return None;
        }
        let number = self.spaces[space_id as usize].next_packet_number;
        self.spaces[space_id as usize].next_packet_number += 1;
        let pn = PacketNumber::new(
            number,
            self.spaces[space_id as usize].largest_acked.unwrap_or(0),
        );
        let header = match space_id {
            SpaceId::Initial => Header::Initial {
                dst_cid: self.rem_cid,
                src_cid: self.loc_cid,
                token: Bytes::new(),
                number: pn,
            },
            SpaceId::Handshake => Header::Long {
                ty: LongType::Handshake,
                dst_cid: self.rem_cid,
                src_cid: self.loc_cid,
                number: pn,
            },
            SpaceId::Data => Header::Short {
                dst_cid: self.rem_cid,
                number: pn,
                key_phase: self.key_phase,
            },
        };
        let mut buf = Vec::new();
        let partial_encode = header.encode(&mut buf);
        let header_len = buf.len();
        let max_len = self.mtu as usize - header_len - AEAD_TAG_SIZE;
        // Application close details must not leak before the peer is authenticated
        match *reason {
            state::CloseReason::Application(ref x) if space_id == SpaceId::Data => {
                x.encode(&mut buf, max_len)
            }
            state::CloseReason::Application(_) => frame::ConnectionClose {
                error_code: TransportError::APPLICATION_ERROR.code,
                frame_type: None,
                reason: Bytes::new(),
            }.encode(&mut buf, max_len),
            state::CloseReason::Connection(ref x) => x.encode(&mut buf, max_len),
        }
        if buf.len() - header_len + pn.len() < 4 {
            let pad = 4 - pn.len() - (buf.len() - header_len);
            let target = buf.len() + pad;
            buf.resize(target, frame::Type::PADDING.into());
        }
        if space_id != SpaceId::Data {
            set_payload_length(&mut buf, header_len, pn.len(), AEAD_TAG_SIZE);
        }
        let crypto = self.spaces[space_id as usize].crypto.as_ref().unwrap();
        crypto.encrypt(number, &mut buf, header_len);
        partial_encode.finish(&mut buf, crypto.header_encrypt_key(), header_len - pn.len());
        Some(buf)
    }

    pub fn reset_idle_timeout(&mut self, config: &Config, now: u64) {
        let peer = self
            .peer_params
            .as_ref()
            .map_or(0, |p| p.max_idle_timeout * 1000);
        let dt = if config.idle_timeout == 0 || peer == 0 {
            cmp::max(config.idle_timeout, peer)
        } else {
            cmp::min(config.idle_timeout, peer)
        };
        if dt == 0 {
            return;
        }
        self.set_idle = Some(Some(now + dt));
    }

    /// Idle expiry: terminate without emitting CONNECTION_CLOSE
    pub fn idle_timeout(&mut self, ctx: &mut Context, now: u64) {
        trace!(self.log, "idle timeout");
        ctx.events.push_back((
            self.handle,
            Event::ConnectionLost {
                reason: ConnectionError::TimedOut,
            },
        ));
        self.enter_draining(ctx, now);
    }

    /// Ack-delay timer: force out any ACKs still waiting on the coalescing window
    pub fn push_timeout(&mut self, ctx: &mut Context) {
        for space_id in SpaceId::iter() {
            let acks = &mut self.spaces[space_id as usize].acks;
            if acks.unacked > 0 {
                acks.immediate = true;
            }
        }
        ctx.dirty_conns.insert(self.handle);
    }

    /// Next ack-delay deadline, for arming the push timer after a flush
    pub fn next_ack_deadline(&self) -> Option<u64> {
        let max_ack_delay = self.peer_max_ack_delay();
        let mut next: Option<u64> = None;
        for space_id in SpaceId::iter() {
            let acks = &self.spaces[space_id as usize].acks;
            if acks.unacked == 0 {
                continue;
            }
            let t = acks.delay_start + max_ack_delay;
            next = Some(match next {
                Some(x) => cmp::min(x, t),
                None => t,
            });
        }
        next
    }

    /// Queue a PING, e.g. to keep an otherwise idle connection alive
    pub fn ping(&mut self) {
        self.spaces[SpaceId::Data as usize].pending.ping = true;
    }

    pub fn alpn_protocol(&self) -> Option<&[u8]> {
        self.tls.alpn_protocol()
    }

    pub fn sni_hostname(&self) -> Option<&str> {
        self.tls.sni_hostname()
    }

    fn peer_max_ack_delay(&self) -> u64 {
        self.peer_params
            .as_ref()
            .map_or(25_000, |p| p.max_ack_delay * 1000)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ConnectionHandle(pub usize);

impl From<ConnectionHandle> for usize {
    fn from(x: ConnectionHandle) -> usize {
        x.0
    }
}

/// Reasons why a connection might be lost
#[derive(Debug, Clone, Fail)]
pub enum ConnectionError {
    /// The peer doesn't implement any supported version
    #[fail(display = "peer doesn't implement any supported version")]
    VersionMismatch,
    /// The peer violated the QUIC specification as understood by this implementation
    #[fail(display = "{}", error_code)]
    TransportError { error_code: TransportError },
    /// The peer's QUIC stack aborted the connection automatically
    #[fail(display = "aborted by peer: {}", reason)]
    ConnectionClosed { reason: frame::ConnectionClose },
    /// The peer closed the connection
    #[fail(display = "closed by peer: {}", reason)]
    ApplicationClosed { reason: frame::ApplicationClose },
    /// The peer is unable to continue processing this connection, usually due to having
    /// restarted
    #[fail(display = "reset by peer")]
    Reset,
    /// The peer has become unreachable
    #[fail(display = "timed out")]
    TimedOut,
}

impl From<TransportError> for ConnectionError {
    fn from(x: TransportError) -> Self {
        ConnectionError::TransportError { error_code: x }
    }
}

pub enum State {
    Handshake,
    Established,
    Closed(state::Closed),
    Draining,
    /// Waiting for the application to observe termination so resources can be dropped
    Drained,
}

impl State {
    pub fn is_closed(&self) -> bool {
        match *self {
            State::Closed(_) | State::Draining | State::Drained => true,
            _ => false,
        }
    }

    pub fn is_drained(&self) -> bool {
        if let State::Drained = *self {
            true
        } else {
            false
        }
    }
}

pub mod state {
    use super::*;

    pub struct Closed {
        pub reason: CloseReason,
    }

    #[derive(Clone)]
    pub enum CloseReason {
        Connection(frame::ConnectionClose),
        Application(frame::ApplicationClose),
    }

    impl From<TransportError> for CloseReason {
        fn from(x: TransportError) -> Self {
            CloseReason::Connection(frame::ConnectionClose {
                error_code: x.code,
                frame_type: x.frame.map(frame::Type),
                reason: Bytes::new(),
            })
        }
    }
    impl From<frame::ConnectionClose> for CloseReason {
        fn from(x: frame::ConnectionClose) -> Self {
            CloseReason::Connection(x)
        }
    }
    impl From<frame::ApplicationClose> for CloseReason {
        fn from(x: frame::ApplicationClose) -> Self {
            CloseReason::Application(x)
        }
    }
}

/// Build a close packet outside any connection, for refusing handshakes
pub fn initial_close(
    crypto: &Crypto,
    remote_id: &ConnectionId,
    local_id: &ConnectionId,
    packet_number: u8,
    error: TransportError,
) -> Box<[u8]> {
    let number = PacketNumber::U8(packet_number);
    let header = Header::Initial {
        dst_cid: *remote_id,
        src_cid: *local_id,
        token: Bytes::new(),
        number,
    };
    let mut buf = Vec::<u8>::new();
    let partial_encode = header.encode(&mut buf);
    let header_len = buf.len();
    frame::ConnectionClose {
        error_code: error.code,
        frame_type: None,
        reason: Bytes::new(),
    }.encode(&mut buf, MIN_MTU as usize - header_len - AEAD_TAG_SIZE);
    set_payload_length(&mut buf, header_len, number.len(), AEAD_TAG_SIZE);
    crypto.encrypt(u64::from(packet_number), &mut buf, header_len);
    partial_encode.finish(&mut buf, crypto.header_encrypt_key(), header_len - number.len());
    buf.into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;
    use std::sync::Arc;

    use crypto::testing::{MockSession, MockSessionFactory};
    use endpoint::Config;

    fn logger() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    fn remote_addr() -> SocketAddrV6 {
        SocketAddrV6::new(Ipv6Addr::new(0, 0, 0, 0, 0, 0xffff, 0x7f00, 1), 4433, 0, 0)
    }

    fn client_params(scid: ConnectionId) -> TransportParameters {
        TransportParameters {
            initial_source_connection_id: Some(scid),
            initial_max_data: 1 << 20,
            initial_max_stream_data_bidi_local: 1 << 16,
            initial_max_stream_data_bidi_remote: 1 << 16,
            initial_max_stream_data_uni: 1 << 16,
            initial_max_streams_bidi: 16,
            initial_max_streams_uni: 16,
            ..TransportParameters::default()
        }
    }

    struct Fixture {
        ctx: Context,
        conn: Connection,
    }

    fn fixture() -> Fixture {
        let config = Arc::new(Config::new(Arc::new(MockSessionFactory(Vec::new()))));
        let mut ctx = Context::new(config);
        let odcid = ConnectionId::new(&[9; 8]);
        let loc_cid = ConnectionId::new(&[1; LOC_CID_SIZE]);
        let rem_cid = ConnectionId::new(&[2; 8]);
        let mut peer_params = Vec::new();
        client_params(rem_cid).write(&mut peer_params);
        let tls = Box::new(MockSession::new(peer_params));
        let conn = Connection::new(
            logger(),
            &mut ctx,
            ConnectionHandle(0),
            odcid,
            loc_cid,
            rem_cid,
            remote_addr(),
            TransportParameters::default(),
            tls,
        );
        Fixture { ctx, conn }
    }

    /// Drive the handshake by feeding a CRYPTO frame the way a decrypted Initial would
    fn complete_handshake(f: &mut Fixture) {
        f.ctx.incoming_handshakes = 1;
        let mut eliciting = false;
        f.conn
            .process_payload(
                &mut f.ctx,
                0,
                0,
                SpaceId::Initial,
                crypto_frame_payload(0, b"client-hello"),
                &mut eliciting,
            )
            .unwrap();
        let mut eliciting = false;
        f.conn
            .process_payload(
                &mut f.ctx,
                1000,
                0,
                SpaceId::Handshake,
                crypto_frame_payload(0, b"client-finished"),
                &mut eliciting,
            )
            .unwrap();
        assert!(f.conn.handshake_done);
    }

    fn crypto_frame_payload(offset: u64, data: &[u8]) -> Bytes {
        let mut buf = Vec::new();
        frame::Crypto {
            offset,
            data: Bytes::from(data),
        }.encode(&mut buf);
        buf.into()
    }

    fn queue_dummy_sent(conn: &mut Connection, space_id: SpaceId, pn: u64, time: u64, size: u16) {
        let space = &mut conn.spaces[space_id as usize];
        space.next_packet_number = cmp::max(space.next_packet_number, pn + 1);
        space.sent.insert(
            pn,
            SentPacket {
                time,
                size,
                ack_eliciting: size != 0,
                acks: RangeSet::new(),
                retransmits: Retransmits::default(),
            },
        );
        if size != 0 {
            space.in_flight += u64::from(size);
            space.time_of_last_ack_eliciting = time;
        }
        conn.in_flight += u64::from(size);
    }

    #[test]
    fn rtt_smoothing_integer_weights() {
        let mut f = fixture();
        f.conn.latest_rtt = 100_000;
        f.conn.update_rtt(0);
        assert_eq!(f.conn.smoothed_rtt, 100_000);
        assert_eq!(f.conn.rttvar, 50_000);
        f.conn.latest_rtt = 180_000;
        f.conn.update_rtt(0);
        // (7*100000 + 180000) / 8, (3*50000 + 80000) / 4
        assert_eq!(f.conn.smoothed_rtt, 110_000);
        assert_eq!(f.conn.rttvar, 57_500);
        // Ack delay is subtracted only when min_rtt would still be respected
        f.conn.latest_rtt = 120_000;
        f.conn.update_rtt(10_000);
        assert_eq!(f.conn.min_rtt, 100_000);
        assert_eq!(f.conn.smoothed_rtt, (7 * 110_000 + 110_000) / 8);
    }

    #[test]
    fn handshake_completion_side_effects() {
        let mut f = fixture();
        complete_handshake(&mut f);
        // HANDSHAKE_DONE queued, handshake space discarded, next keys pre-generated
        assert!(f.conn.spaces[SpaceId::Data as usize].pending.handshake_done);
        assert!(!f.conn.spaces[SpaceId::Handshake as usize].has_keys());
        assert!(f.conn.next_crypto.is_some());
        assert!(f.conn.peer_params.is_some());
        assert_eq!(f.conn.max_data, 1 << 20);
        // The mock's flight was queued as CRYPTO data
        assert!(!f.conn.spaces[SpaceId::Initial as usize].pending.crypto.is_empty());
    }

    #[test]
    fn ack_for_unsent_packet_is_protocol_violation() {
        let mut f = fixture();
        let ack = frame::Ack {
            largest: 17,
            delay: 0,
            ranges: vec![17..18],
            ecn: None,
        };
        let err = f
            .conn
            .on_ack_received(&mut f.ctx, 0, SpaceId::Initial, ack)
            .unwrap_err();
        assert_eq!(err.code, TransportError::PROTOCOL_VIOLATION.code);
    }

    #[test]
    fn duplicate_ack_is_noop() {
        let mut f = fixture();
        queue_dummy_sent(&mut f.conn, SpaceId::Initial, 0, 0, 1200);
        let ack = frame::Ack {
            largest: 0,
            delay: 0,
            ranges: vec![0..1],
            ecn: None,
        };
        f.conn
            .on_ack_received(&mut f.ctx, 1000, SpaceId::Initial, ack.clone())
            .unwrap();
        assert_eq!(f.conn.in_flight, 0);
        let window = f.conn.congestion_window;
        let srtt = f.conn.smoothed_rtt;
        // Same ACK again: no credit, no RTT sample, no error
        f.conn
            .on_ack_received(&mut f.ctx, 2000, SpaceId::Initial, ack)
            .unwrap();
        assert_eq!(f.conn.congestion_window, window);
        assert_eq!(f.conn.smoothed_rtt, srtt);
    }

    #[test]
    fn loss_by_packet_threshold() {
        let mut f = fixture();
        // Packets 0..=4 in flight; an ACK of 4 alone leaves 0 and 1 beyond the threshold
        for pn in 0..5 {
            queue_dummy_sent(&mut f.conn, SpaceId::Data, pn, 5, 1000);
        }
        let ack = frame::Ack {
            largest: 4,
            delay: 0,
            ranges: vec![4..5],
            ecn: None,
        };
        f.conn
            .on_ack_received(&mut f.ctx, 15, SpaceId::Data, ack)
            .unwrap();
        let space = &f.conn.spaces[SpaceId::Data as usize];
        assert!(!space.sent.contains_key(&0));
        assert!(!space.sent.contains_key(&1));
        // 2 and 3 are within the reordering threshold and not yet lost
        assert!(space.sent.contains_key(&2));
        assert!(space.sent.contains_key(&3));
        assert!(space.loss_time.is_some());
        // The loss shrank the congestion window
        assert!(f.conn.ssthresh < u64::max_value());
    }

    #[test]
    fn loss_by_time_threshold() {
        let mut f = fixture();
        f.conn.latest_rtt = 8_000;
        f.conn.smoothed_rtt = 8_000;
        queue_dummy_sent(&mut f.conn, SpaceId::Data, 0, 0, 1000);
        queue_dummy_sent(&mut f.conn, SpaceId::Data, 1, 8_000, 1000);
        queue_dummy_sent(&mut f.conn, SpaceId::Data, 2, 9_000, 1000);
        let ack = frame::Ack {
            largest: 2,
            delay: 0,
            ranges: vec![2..3],
            ecn: None,
        };
        // 9/8 of rtt = 9000: at now=9000 packet 0 is stale, packet 1 is not
        f.conn
            .on_ack_received(&mut f.ctx, 9_000, SpaceId::Data, ack)
            .unwrap();
        let space = &f.conn.spaces[SpaceId::Data as usize];
        assert!(!space.sent.contains_key(&0));
        assert!(space.sent.contains_key(&1));
    }

    #[test]
    fn lost_frames_are_reinjected_per_policy() {
        let mut f = fixture();
        let mut retransmits = Retransmits::default();
        retransmits.ping = true;
        retransmits.path_response = Some((3, 0xdead));
        retransmits.handshake_done = true;
        retransmits.stream.push_back(frame::Stream {
            id: StreamId(0),
            offset: 0,
            fin: false,
            data: Bytes::from(&b"payload"[..]),
        });
        {
            let space = &mut f.conn.spaces[SpaceId::Data as usize];
            space.next_packet_number = 2;
            space.largest_acked = Some(1);
            space.sent.insert(
                0,
                SentPacket {
                    time: 0,
                    size: 100,
                    ack_eliciting: true,
                    acks: RangeSet::new(),
                    retransmits,
                },
            );
            space.in_flight += 100;
        }
        f.conn.in_flight += 100;
        let config = f.ctx.config.clone();
        f.conn.detect_lost_packets(&config, 1_000_000, SpaceId::Data);
        let pending = &f.conn.spaces[SpaceId::Data as usize].pending;
        // Probes and path responses are dropped; everything else requeues
        assert!(!pending.ping);
        assert!(pending.path_response.is_none());
        assert!(pending.handshake_done);
        assert_eq!(pending.stream.len(), 1);
    }

    #[test]
    fn amplification_limit_pre_validation() {
        let mut f = fixture();
        let config = f.ctx.config.clone();
        f.conn.on_datagram(&config, 0, 1200);
        // Make something sendable without marking the address validated
        f.conn.spaces[SpaceId::Initial as usize].pending.ping = true;
        let mut total = 0;
        while let Some(packet) = f.conn.next_packet(&config, 0) {
            total += packet.len() as u64;
            f.conn.spaces[SpaceId::Initial as usize].pending.ping = true;
        }
        assert!(total <= 3 * 1200);
        // Validation lifts the limit
        f.conn.validated = true;
        assert!(f.conn.next_packet(&config, 0).is_some());
    }

    #[test]
    fn connection_flow_control_violation() {
        let mut f = fixture();
        complete_handshake(&mut f);
        f.conn.local_max_data = 1000;
        let id = StreamId::new(Side::Client, Directionality::Bi, 0);
        let err = f
            .conn
            .handle_stream(
                &mut f.ctx,
                frame::Stream {
                    id,
                    offset: 0,
                    fin: false,
                    data: Bytes::from(&[0u8; 1001][..]),
                },
            )
            .unwrap_err();
        assert_eq!(err, TransportError::FLOW_CONTROL_ERROR);
        // The receive side never observed the excess
        assert_eq!(f.conn.data_recvd, 0);
    }

    #[test]
    fn stream_gap_open_events() {
        let mut f = fixture();
        complete_handshake(&mut f);
        f.ctx.events.clear();
        let id = StreamId::new(Side::Client, Directionality::Bi, 2);
        f.conn
            .handle_stream(
                &mut f.ctx,
                frame::Stream {
                    id,
                    offset: 0,
                    fin: false,
                    data: Bytes::from(&b"x"[..]),
                },
            )
            .unwrap();
        let opened: Vec<u64> = f
            .ctx
            .events
            .iter()
            .filter_map(|&(_, ref e)| match *e {
                Event::StreamOpened { stream } => Some(stream.index()),
                _ => None,
            })
            .collect();
        assert_eq!(opened, &[0, 1, 2]);
    }

    #[test]
    fn peer_cannot_use_server_streams() {
        let mut f = fixture();
        complete_handshake(&mut f);
        let id = StreamId::new(Side::Server, Directionality::Bi, 0);
        let err = f
            .conn
            .handle_stream(
                &mut f.ctx,
                frame::Stream {
                    id,
                    offset: 0,
                    fin: false,
                    data: Bytes::new(),
                },
            )
            .unwrap_err();
        assert_eq!(err.code, TransportError::STREAM_STATE_ERROR.code);
    }

    #[test]
    fn first_error_wins() {
        let mut f = fixture();
        f.conn.fail(&mut f.ctx, 0, TransportError::FLOW_CONTROL_ERROR);
        f.conn.fail(&mut f.ctx, 0, TransportError::PROTOCOL_VIOLATION);
        match f.conn.error {
            Some(ConnectionError::TransportError { error_code }) => {
                assert_eq!(error_code.code, TransportError::FLOW_CONTROL_ERROR.code);
            }
            _ => panic!("expected recorded transport error"),
        }
        assert!(f.conn.state.as_ref().unwrap().is_closed());
        // Close timer armed at 3×PTO, loss detection cancelled
        assert_matches!(f.conn.set_close, Some(Some(_)));
        assert_eq!(f.conn.set_loss_detection, Some(None));
        // A close packet was emitted
        assert!(f.ctx.io.iter().any(|io| match *io {
            Io::Transmit { .. } => true,
            _ => false,
        }));
    }

    #[test]
    fn echo_bookkeeping_over_bidi_stream() {
        // Receive 4096 bytes with FIN, read them, write 4096 back with FIN
        let mut f = fixture();
        complete_handshake(&mut f);
        let id = StreamId::new(Side::Client, Directionality::Bi, 0);
        // Arbitrary fragmentation, delivered out of order
        f.conn
            .handle_stream(
                &mut f.ctx,
                frame::Stream {
                    id,
                    offset: 1000,
                    fin: true,
                    data: Bytes::from(&[2u8; 3096][..]),
                },
            )
            .unwrap();
        f.conn
            .handle_stream(
                &mut f.ctx,
                frame::Stream {
                    id,
                    offset: 0,
                    fin: false,
                    data: Bytes::from(&[1u8; 1000][..]),
                },
            )
            .unwrap();
        let mut buf = vec![0; 8192];
        let n = f.conn.read(id, &mut buf).unwrap();
        assert_eq!(n, 4096);
        assert_eq!(&buf[..1000], &[1u8; 1000][..]);
        assert_eq!(&buf[1000..4096], &[2u8; 3096][..]);
        assert_eq!(f.conn.read(id, &mut buf), Err(ReadError::Finished));
        // Echo back
        let wrote = f.conn.write(&mut f.ctx, id, &[3; 4096]).unwrap();
        assert_eq!(wrote, 4096);
        f.conn.finish(id);
        let queued: usize = f.conn.spaces[SpaceId::Data as usize]
            .pending
            .stream
            .iter()
            .map(|s| s.data.len())
            .sum();
        assert_eq!(queued, 4096);
        assert!(f.conn.spaces[SpaceId::Data as usize]
            .pending
            .stream
            .iter()
            .any(|s| s.fin));
    }

    #[test]
    fn out_of_order_crypto() {
        let mut f = fixture();
        f.ctx.incoming_handshakes = 1;
        // The tail of the hello arrives first and sits in the reassembly buffer
        let mut eliciting = false;
        f.conn
            .process_payload(
                &mut f.ctx,
                0,
                0,
                SpaceId::Initial,
                crypto_frame_payload(30, &[2; 20]),
                &mut eliciting,
            )
            .unwrap();
        assert_eq!(
            f.conn.spaces[SpaceId::Initial as usize].crypto_stream.buffered(),
            20
        );
        assert!(!f.conn.spaces[SpaceId::Handshake as usize].has_keys());
        // The head arrives; the handshake progresses as if delivery had been in order
        let mut eliciting = false;
        f.conn
            .process_payload(
                &mut f.ctx,
                1,
                1,
                SpaceId::Initial,
                crypto_frame_payload(0, &[1; 30]),
                &mut eliciting,
            )
            .unwrap();
        assert_eq!(
            f.conn.spaces[SpaceId::Initial as usize].crypto_stream.buffered(),
            0
        );
        assert!(f.conn.spaces[SpaceId::Handshake as usize].has_keys());
        assert!(f.conn.peer_params.is_some());
    }

    #[test]
    fn crypto_buffer_bounded() {
        let mut f = fixture();
        let mut eliciting = false;
        // Far-future offset forces buffering; past the cap the connection closes
        let err = f
            .conn
            .process_payload(
                &mut f.ctx,
                0,
                0,
                SpaceId::Initial,
                crypto_frame_payload(1 << 20, &[0; 1024]),
                &mut eliciting,
            )
            .unwrap_err();
        assert_eq!(err.code, TransportError::CRYPTO_BUFFER_EXCEEDED.code);
    }

    #[test]
    fn idle_timeout_is_silent() {
        let mut f = fixture();
        complete_handshake(&mut f);
        f.ctx.io.clear();
        f.conn.idle_timeout(&mut f.ctx, 5_000_000);
        // Draining, with no CONNECTION_CLOSE emitted
        match *f.conn.state.as_ref().unwrap() {
            State::Draining => {}
            _ => panic!("expected draining state"),
        }
        assert!(f.ctx.io.iter().all(|io| match *io {
            Io::Transmit { .. } => false,
            _ => true,
        }));
        let lost = f.ctx.events.iter().any(|&(_, ref e)| match *e {
            Event::ConnectionLost {
                reason: ConnectionError::TimedOut,
            } => true,
            _ => false,
        });
        assert!(lost);
    }

    #[test]
    fn stateless_reset_detection_drains() {
        let mut f = fixture();
        complete_handshake(&mut f);
        let token = [0xab; RESET_TOKEN_SIZE];
        f.conn
            .rem_cids
            .insert(1, 0, ConnectionId::new(&[7; 8]), token, 8)
            .unwrap();
        f.conn.check_stateless_reset(&mut f.ctx, Some(token));
        match *f.conn.state.as_ref().unwrap() {
            State::Draining => {}
            _ => panic!("expected draining state"),
        }
        let reset = f.ctx.events.iter().any(|&(_, ref e)| match *e {
            Event::ConnectionLost {
                reason: ConnectionError::Reset,
            } => true,
            _ => false,
        });
        assert!(reset);
        // An unknown token is ignored
        let mut f = fixture();
        complete_handshake(&mut f);
        f.conn.check_stateless_reset(&mut f.ctx, Some([0xcd; RESET_TOKEN_SIZE]));
        assert!(!f.conn.state.as_ref().unwrap().is_closed());
    }

    #[test]
    fn retire_unissued_cid_is_violation() {
        let mut f = fixture();
        let err = f.conn.handle_retire_cid(&mut f.ctx, 17).unwrap_err();
        assert_eq!(err.code, TransportError::PROTOCOL_VIOLATION.code);
    }

    #[test]
    fn initial_packet_padded_and_protected() {
        let mut f = fixture();
        f.conn.validated = true;
        f.conn.spaces[SpaceId::Initial as usize].pending.ping = true;
        let config = f.ctx.config.clone();
        let packet = f.conn.next_packet(&config, 0).unwrap();
        assert_eq!(packet.len(), MIN_INITIAL_SIZE);
        // Record kept for retransmission accounting
        assert!(f.conn.spaces[SpaceId::Initial as usize].sent.contains_key(&0));
        assert_eq!(f.conn.in_flight, packet.len() as u64);
    }
}
