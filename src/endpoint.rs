//! The endpoint: routes datagrams to connections by destination CID, accepts new handshakes
//! (optionally behind Retry address validation), and answers unroutable packets with version
//! negotiation or stateless resets.
//!
//! This object performs no I/O. It generates a stream of I/O operations for a backend to
//! perform via `poll_io`, and consumes incoming datagrams and timer expirations via `handle`
//! and `timeout`.

use std::collections::VecDeque;
use std::net::SocketAddrV6;
use std::sync::Arc;
use std::{cmp, fmt};

use bytes::{Bytes, BytesMut};
use fnv::{FnvHashMap, FnvHashSet};
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use ring::digest;
use ring::hmac::SigningKey;
use slab::Slab;
use slog::{self, Logger};

use coding::BufMutExt;
use connection::{initial_close, Connection, ConnectionHandle, State};
use crypto::{self, Crypto, SessionFactory};
use packet::{ConnectionId, Header, PacketDecodeError, PartialDecode};
use stream::{ReadError, WriteError};
use token::TokenKey;
use transport_parameters::TransportParameters;
use {
    Directionality, Side, StreamId, TransportError, DRAFT_VERSION, LOC_CID_SIZE, MAX_MTU,
    MIN_INITIAL_DST_CID_SIZE, MIN_INITIAL_SIZE, REORDER_BUFFER_SIZE, RESET_TOKEN_SIZE, VERSION,
};

pub use connection::ConnectionError;

/// Parameters governing the core QUIC state machine
pub struct Config {
    /// Maximum number of peer-initiated bidirectional streams that may exist at one time
    pub max_remote_bi_streams: u64,
    /// Maximum number of peer-initiated unidirectional streams that may exist at one time
    pub max_remote_uni_streams: u64,
    /// Maximum duration of inactivity to accept before timing out the connection (μs)
    ///
    /// The actual value used is the minimum of this and the peer's own idle timeout. 0 for
    /// none.
    pub idle_timeout: u64,
    /// Maximum number of bytes the peer may transmit on any one stream before becoming
    /// blocked; sizes the per-stream receive ring
    pub stream_receive_window: u64,
    /// Maximum number of bytes the peer may transmit across all streams of a connection
    /// before becoming blocked. Grows by doubling whenever receipt crosses the half-way
    /// mark.
    pub receive_window: u64,
    /// Maximum number of incoming connections to buffer
    ///
    /// Calling `Endpoint::accept` removes a connection from the buffer, so this does not
    /// need to be large.
    pub accept_buffer: u32,

    /// Whether clients must prove source-address ownership via Retry before a handshake is
    /// admitted
    pub retry: bool,
    /// Age limit on Retry and NEW_TOKEN tokens (μs)
    pub retry_lifetime: u64,
    /// Key under which address-validation tokens are encrypted; required when `retry` is
    /// set
    pub token_key: Option<[u8; 32]>,
    /// When nonempty, enables stateless-reset emission and per-CID reset-token
    /// advertisement
    pub sr_token_key: Option<Vec<u8>>,
    /// Close with NO_APPLICATION_PROTOCOL when the handshake selects no ALPN
    pub require_alpn: bool,

    /// Minimum interval between CONNECTION_CLOSE re-emissions while closing (μs)
    pub cc_min_interval: u64,
    /// Timer resolution floor used in probe-timeout computation (μs)
    pub time_granularity: u64,
    /// Packet-number reordering tolerated before a packet is declared lost
    pub packet_threshold: u32,
    /// Extra fraction of an RTT tolerated before time-based loss detection fires. 0.16
    /// format
    pub time_reordering_fraction: u16,
    /// The RTT assumed before a sample is taken (μs)
    pub default_initial_rtt: u64,

    /// The default max packet size used for calculating congestion windows
    pub default_mss: u64,
    /// Starting congestion window, in bytes
    pub initial_window: u64,
    /// Floor the congestion window never shrinks below
    pub minimum_window: u64,
    /// Reduction in congestion window when a new loss event is detected. 0.16 format
    pub loss_reduction_factor: u16,

    /// Longest we may sit on an ACK before sending it (μs; millisecond granularity on the
    /// wire)
    pub max_ack_delay: u64,
    /// Exponent applied to our ACK delay fields
    pub ack_delay_exponent: u8,
    /// How many connection IDs from the peer we are willing to hold
    pub active_connection_id_limit: u64,

    /// Constructor for per-connection TLS sessions; the handshake provider
    pub session_factory: Arc<SessionFactory>,
}

impl Config {
    pub fn new(session_factory: Arc<SessionFactory>) -> Self {
        Config {
            max_remote_bi_streams: 32,
            max_remote_uni_streams: 32,
            idle_timeout: 10_000_000,
            stream_receive_window: REORDER_BUFFER_SIZE as u64,
            receive_window: 1024 * 1024,
            accept_buffer: 1024,

            retry: false,
            retry_lifetime: 15_000_000,
            token_key: None,
            sr_token_key: None,
            require_alpn: false,

            cc_min_interval: 100_000,
            time_granularity: 1_000,
            packet_threshold: 3,
            time_reordering_fraction: 0x2000, // 1/8
            default_initial_rtt: 100_000,

            default_mss: 1460,
            initial_window: 10 * 1460,
            minimum_window: 2 * 1460,
            loss_reduction_factor: 0x8000, // 1/2

            max_ack_delay: 25_000,
            ack_delay_exponent: 3,
            active_connection_id_limit: 8,

            session_factory,
        }
    }
}

pub struct Context {
    pub rng: OsRng,
    pub config: Arc<Config>,
    pub io: VecDeque<Io>,
    pub events: VecDeque<(ConnectionHandle, Event)>,
    pub incoming: VecDeque<ConnectionHandle>,
    pub incoming_handshakes: usize,
    pub dirty_conns: FnvHashSet<ConnectionHandle>,
    pub readable_conns: FnvHashSet<ConnectionHandle>,
    /// Key for stateless-reset tokens; immutable after startup
    pub reset_key: Option<SigningKey>,
    /// Key for Retry/NEW_TOKEN address-validation tokens; immutable after startup
    pub token_key: Option<TokenKey>,
}

impl Context {
    pub(crate) fn new(config: Arc<Config>) -> Self {
        let reset_key = match config.sr_token_key {
            Some(ref k) if !k.is_empty() => Some(SigningKey::new(&digest::SHA256, k)),
            _ => None,
        };
        let token_key = config.token_key.map(TokenKey::new);
        Context {
            rng: OsRng::new().expect("system entropy source"),
            config,
            io: VecDeque::new(),
            events: VecDeque::new(),
            incoming: VecDeque::new(),
            incoming_handshakes: 0,
            dirty_conns: FnvHashSet::default(),
            readable_conns: FnvHashSet::default(),
            reset_key,
            token_key,
        }
    }
}

#[derive(Debug, Fail)]
pub enum EndpointError {
    #[fail(display = "address validation via Retry requires a token key")]
    MissingTokenKey,
}

/// The main entry point to the library
pub struct Endpoint {
    log: Logger,
    pub(crate) ctx: Context,
    /// Original destination CIDs, for routing retransmitted first flights
    connection_ids_initial: FnvHashMap<ConnectionId, ConnectionHandle>,
    /// Every CID we have issued, including Retry and NEW_CONNECTION_ID ones
    connection_ids: FnvHashMap<ConnectionId, ConnectionHandle>,
    connection_remotes: FnvHashMap<SocketAddrV6, ConnectionHandle>,
    pub(crate) connections: Slab<Connection>,
}

impl Endpoint {
    pub fn new(log: Logger, config: Config) -> Result<Self, EndpointError> {
        if config.retry && config.token_key.is_none() {
            return Err(EndpointError::MissingTokenKey);
        }
        Ok(Endpoint {
            ctx: Context::new(Arc::new(config)),
            log,
            connection_ids_initial: FnvHashMap::default(),
            connection_ids: FnvHashMap::default(),
            connection_remotes: FnvHashMap::default(),
            connections: Slab::new(),
        })
    }

    /// Get an application-facing event
    pub fn poll(&mut self) -> Option<(ConnectionHandle, Event)> {
        if let Some(x) = self.ctx.events.pop_front() {
            return Some(x);
        }
        loop {
            let &conn = self.ctx.readable_conns.iter().next()?;
            if let Some(x) = self.connections[conn.0].poll() {
                return Some((conn, x));
            }
            self.ctx.readable_conns.remove(&conn);
        }
    }

    /// Get a pending IO operation
    pub fn poll_io(&mut self, now: u64) -> Option<Io> {
        loop {
            if let Some(x) = self.ctx.io.pop_front() {
                return Some(x);
            }
            let &conn = self.ctx.dirty_conns.iter().next()?;
            self.flush_pending(now, conn);
            self.ctx.dirty_conns.remove(&conn);
        }
    }

    /// Process an incoming UDP datagram
    pub fn handle(&mut self, now: u64, remote: SocketAddrV6, mut data: BytesMut) {
        let datagram_len = data.len();
        let reset_tail = if datagram_len > RESET_TOKEN_SIZE + 4 {
            let mut tail = [0; RESET_TOKEN_SIZE];
            tail.copy_from_slice(&data[datagram_len - RESET_TOKEN_SIZE..]);
            Some(tail)
        } else {
            None
        };
        let mut accounted = None;
        loop {
            match PartialDecode::new(data, LOC_CID_SIZE) {
                Ok((partial_decode, rest)) => {
                    self.handle_decode(
                        now,
                        remote,
                        partial_decode,
                        datagram_len,
                        reset_tail,
                        &mut accounted,
                    );
                    match rest {
                        Some(x) => {
                            data = x;
                        }
                        None => {
                            return;
                        }
                    }
                }
                Err(PacketDecodeError::UnsupportedVersion {
                    source,
                    destination,
                }) => {
                    if datagram_len < MIN_INITIAL_SIZE {
                        debug!(self.log, "dropping undersized packet with unsupported version");
                        return;
                    }
                    trace!(self.log, "sending version negotiation");
                    let mut buf = Vec::<u8>::new();
                    Header::VersionNegotiate {
                        random: self.ctx.rng.gen::<u8>() & 0x7f,
                        dst_cid: source,
                        src_cid: destination,
                    }.encode(&mut buf);
                    buf.write::<u32>(0x0a1a_2a3a); // reserved, exercises version tolerance
                    buf.write(VERSION);
                    buf.write(DRAFT_VERSION);
                    self.ctx.io.push_back(Io::Transmit {
                        destination: remote,
                        packet: buf.into(),
                    });
                    return;
                }
                Err(e) => {
                    // Reception is best-effort; the rest of the datagram is abandoned
                    trace!(self.log, "unable to decode packet header"; "reason" => %e);
                    return;
                }
            }
        }
    }

    fn handle_decode(
        &mut self,
        now: u64,
        remote: SocketAddrV6,
        partial_decode: PartialDecode,
        datagram_len: usize,
        reset_tail: Option<[u8; RESET_TOKEN_SIZE]>,
        accounted: &mut Option<ConnectionHandle>,
    ) {
        let dst_cid = partial_decode.dst_cid();
        let conn = self
            .connection_ids
            .get(&dst_cid)
            .or_else(|| self.connection_ids_initial.get(&dst_cid))
            .or_else(|| self.connection_remotes.get(&remote))
            .cloned();
        if let Some(conn) = conn {
            if *accounted != Some(conn) {
                let config = self.ctx.config.clone();
                self.connections[conn.0].on_datagram(&config, now, datagram_len);
                *accounted = Some(conn);
            }
            self.connections[conn.0].handle_decode(&mut self.ctx, now, partial_decode, reset_tail);
            return;
        }

        if !partial_decode.has_long_header() {
            self.send_stateless_reset(remote, dst_cid, datagram_len);
            return;
        }
        if partial_decode.is_initial() {
            self.handle_first_initial(now, remote, partial_decode, datagram_len, accounted);
        } else {
            debug!(
                self.log,
                "ignoring non-initial packet for unknown connection {connection}",
                connection = dst_cid
            );
        }
    }

    /// An Initial for no known connection: refuse, Retry, or admit a new handshake
    fn handle_first_initial(
        &mut self,
        now: u64,
        remote: SocketAddrV6,
        partial_decode: PartialDecode,
        datagram_len: usize,
        accounted: &mut Option<ConnectionHandle>,
    ) {
        let dst_cid = partial_decode.dst_cid();
        let src_cid = partial_decode.src_cid();
        if datagram_len < MIN_INITIAL_SIZE {
            debug!(self.log, "ignoring short initial"; "connection" => %dst_cid);
            return;
        }
        if dst_cid.len() < MIN_INITIAL_DST_CID_SIZE {
            debug!(self.log, "ignoring initial with short destination CID");
            return;
        }

        if self.ctx.incoming.len() + self.ctx.incoming_handshakes
            >= self.ctx.config.accept_buffer as usize
        {
            debug!(self.log, "rejecting connection due to full accept buffer");
            self.respond_with_close(remote, &dst_cid, &src_cid, TransportError::CONNECTION_REFUSED);
            return;
        }

        if self.ctx.config.retry && partial_decode.token().is_empty() {
            // Commit only routing state and challenge the source address
            let retry_scid = self.new_cid();
            let loc_cid = self.new_cid();
            let conn =
                self.add_connection(now, dst_cid, loc_cid, src_cid, remote, Some(retry_scid));
            self.connection_ids.insert(retry_scid, conn);
            self.connections[conn.0].in_retry = true;
            self.connections[conn.0].retry_cid = Some(retry_scid);
            {
                let config = self.ctx.config.clone();
                self.connections[conn.0].on_datagram(&config, now, datagram_len);
            }
            *accounted = Some(conn);
            let token = self
                .ctx
                .token_key
                .as_ref()
                .expect("retry requires a token key")
                .generate(&mut self.ctx.rng, &remote, now / 1000);
            trace!(self.log, "sending retry"; "odcid" => %dst_cid, "scid" => %retry_scid);
            let mut buf = Vec::new();
            Header::Retry {
                dst_cid: src_cid,
                src_cid: retry_scid,
                token: token.into(),
            }.encode(&mut buf);
            let tag = crypto::retry_tag(&dst_cid, &buf);
            buf.extend_from_slice(&tag);
            self.ctx.io.push_back(Io::Transmit {
                destination: remote,
                packet: buf.into(),
            });
            return;
        }

        // Tokens are validated even when Retry is off, for NEW_TOKEN reuse
        let mut validated = false;
        if !partial_decode.token().is_empty() {
            let ok = self.ctx.token_key.as_ref().map_or(false, |key| {
                key.check(
                    &remote,
                    partial_decode.token(),
                    now / 1000,
                    self.ctx.config.retry_lifetime / 1000,
                )
            });
            if !ok {
                debug!(self.log, "initial carried an invalid token");
                self.respond_with_close(remote, &dst_cid, &src_cid, TransportError::INVALID_TOKEN);
                return;
            }
            validated = true;
        }

        let loc_cid = self.new_cid();
        let conn = self.add_connection(now, dst_cid, loc_cid, src_cid, remote, None);
        self.connections[conn.0].validated |= validated;
        {
            let config = self.ctx.config.clone();
            self.connections[conn.0].on_datagram(&config, now, datagram_len);
        }
        *accounted = Some(conn);
        self.connections[conn.0].handle_decode(&mut self.ctx, now, partial_decode, None);
    }

    /// Refuse a handshake with an Initial-level CONNECTION_CLOSE
    fn respond_with_close(
        &mut self,
        remote: SocketAddrV6,
        dst_cid: &ConnectionId,
        src_cid: &ConnectionId,
        error: TransportError,
    ) {
        let crypto = Crypto::new_initial(dst_cid, Side::Server);
        let loc_cid = ConnectionId::random(&mut self.ctx.rng, LOC_CID_SIZE);
        self.ctx.io.push_back(Io::Transmit {
            destination: remote,
            packet: initial_close(&crypto, src_cid, &loc_cid, 0, error),
        });
    }

    /// Answer an unroutable short-header packet so the peer notices the connection is gone
    fn send_stateless_reset(
        &mut self,
        remote: SocketAddrV6,
        dst_cid: ConnectionId,
        datagram_len: usize,
    ) {
        let token = {
            let key = match self.ctx.reset_key {
                Some(ref x) => x,
                None => {
                    trace!(self.log, "dropping unrecognized short packet (resets disabled)");
                    return;
                }
            };
            if dst_cid.is_empty() {
                trace!(self.log, "dropping unrecognized short packet without ID");
                return;
            }
            crypto::reset_token_for(key, &dst_cid)
        };
        debug!(self.log, "sending stateless reset");
        // Random length, sized against the offending datagram to bound amplification
        let ceiling = cmp::max(
            RESET_TOKEN_SIZE + 6,
            cmp::min(1200, datagram_len.saturating_mul(3)),
        );
        let total = self.ctx.rng.gen_range(RESET_TOKEN_SIZE + 5, ceiling + 1);
        let mut buf = Vec::with_capacity(total);
        buf.push(0b0100_0000 | self.ctx.rng.gen::<u8>() >> 2);
        buf.resize(total - RESET_TOKEN_SIZE, 0);
        {
            let len = buf.len();
            self.ctx.rng.fill_bytes(&mut buf[1..len]);
        }
        buf.extend_from_slice(&token);
        self.ctx.io.push_back(Io::Transmit {
            destination: remote,
            packet: buf.into(),
        });
    }

    fn new_cid(&mut self) -> ConnectionId {
        loop {
            let cid = ConnectionId::random(&mut self.ctx.rng, LOC_CID_SIZE);
            if !self.connection_ids.contains_key(&cid) {
                break cid;
            }
        }
    }

    fn add_connection(
        &mut self,
        now: u64,
        init_cid: ConnectionId,
        loc_cid: ConnectionId,
        rem_cid: ConnectionId,
        remote: SocketAddrV6,
        retry_scid: Option<ConnectionId>,
    ) -> ConnectionHandle {
        let params = TransportParameters {
            original_destination_connection_id: Some(init_cid),
            initial_source_connection_id: Some(loc_cid),
            retry_source_connection_id: retry_scid,
            max_idle_timeout: self.ctx.config.idle_timeout / 1000,
            max_udp_payload_size: u64::from(MAX_MTU),
            initial_max_data: self.ctx.config.receive_window,
            initial_max_stream_data_bidi_local: self.ctx.config.stream_receive_window,
            initial_max_stream_data_bidi_remote: self.ctx.config.stream_receive_window,
            initial_max_stream_data_uni: self.ctx.config.stream_receive_window,
            initial_max_streams_bidi: self.ctx.config.max_remote_bi_streams,
            initial_max_streams_uni: self.ctx.config.max_remote_uni_streams,
            ack_delay_exponent: self.ctx.config.ack_delay_exponent,
            max_ack_delay: self.ctx.config.max_ack_delay / 1000,
            active_connection_id_limit: self.ctx.config.active_connection_id_limit,
            stateless_reset_token: self
                .ctx
                .reset_key
                .as_ref()
                .map(|key| crypto::reset_token_for(key, &loc_cid)),
        };
        let mut raw_params = Vec::new();
        params.write(&mut raw_params);
        let tls = self.ctx.config.session_factory.start_session(&raw_params);
        let conn = {
            let entry = self.connections.vacant_entry();
            let conn = ConnectionHandle(entry.key());
            let mut connection = Connection::new(
                self.log.new(o!("connection" => loc_cid)),
                &mut self.ctx,
                conn,
                init_cid,
                loc_cid,
                rem_cid,
                remote,
                params,
                tls,
            );
            connection.reset_idle_timeout(&self.ctx.config, now);
            entry.insert(connection);
            conn
        };
        self.connection_ids_initial.insert(init_cid, conn);
        self.connection_ids.insert(loc_cid, conn);
        self.connection_remotes.insert(remote, conn);
        self.ctx.incoming_handshakes += 1;
        conn
    }

    fn flush_pending(&mut self, now: u64, conn: ConnectionHandle) {
        let config = self.ctx.config.clone();
        let mut sent = false;
        while let Some(packet) = self.connections[conn.0].next_packet(&config, now) {
            self.ctx.io.push_back(Io::Transmit {
                destination: self.connections[conn.0].remote,
                packet: packet.into(),
            });
            sent = true;
        }
        if sent {
            self.connections[conn.0].reset_idle_timeout(&config, now);
        }
        // Route freshly issued CIDs, drop retired ones
        let issued: Vec<ConnectionId> = self.connections[conn.0].issued_cids.drain(..).collect();
        for id in issued {
            self.connection_ids.insert(id, conn);
        }
        let retired: Vec<ConnectionId> =
            self.connections[conn.0].retired_loc_cids.drain(..).collect();
        for id in retired {
            self.connection_ids.remove(&id);
        }
        // The ack-delay timer tracks the oldest unacknowledged ack-eliciting packet
        if !self.connections[conn.0].state.as_ref().unwrap().is_closed() {
            let deadline = self.connections[conn.0].next_ack_deadline();
            self.connections[conn.0].set_push = Some(deadline);
        }
        {
            let c = &mut self.connections[conn.0];
            let updates = [
                (Timer::Idle, c.set_idle.take()),
                (Timer::LossDetection, c.set_loss_detection.take()),
                (Timer::Push, c.set_push.take()),
                (Timer::Close, c.set_close.take()),
            ];
            for &(timer, ref update) in &updates {
                match *update {
                    Some(Some(time)) => {
                        self.ctx.io.push_back(Io::TimerStart {
                            connection: conn,
                            timer,
                            time,
                        });
                    }
                    Some(None) => {
                        self.ctx.io.push_back(Io::TimerStop {
                            connection: conn,
                            timer,
                        });
                    }
                    None => {}
                }
            }
        }
    }

    fn forget(&mut self, conn: ConnectionHandle) {
        self.connection_ids_initial
            .remove(&self.connections[conn.0].init_cid);
        self.connection_ids.retain(|_, &mut v| v != conn);
        self.connection_remotes
            .remove(&self.connections[conn.0].remote);
        self.ctx.dirty_conns.remove(&conn);
        self.ctx.readable_conns.remove(&conn);
        self.connections.remove(conn.0);
    }

    /// Handle a timer expiring
    pub fn timeout(&mut self, now: u64, conn: ConnectionHandle, timer: Timer) {
        match timer {
            Timer::Close => {
                self.ctx.io.push_back(Io::TimerStop {
                    connection: conn,
                    timer: Timer::Idle,
                });
                self.ctx.events.push_back((conn, Event::ConnectionDrained));
                if self.connections[conn.0].app_closed {
                    self.forget(conn);
                } else {
                    self.connections[conn.0].state = Some(State::Drained);
                }
            }
            Timer::Idle => {
                self.connections[conn.0].idle_timeout(&mut self.ctx, now);
            }
            Timer::LossDetection => {
                self.connections[conn.0].check_packet_loss(&mut self.ctx, now);
            }
            Timer::Push => {
                self.connections[conn.0].push_timeout(&mut self.ctx);
            }
        }
    }

    /// Transmit data on a stream
    ///
    /// Returns the number of bytes written on success.
    ///
    /// # Panics
    /// - when applied to a stream that does not have an active outgoing channel
    pub fn write(
        &mut self,
        conn: ConnectionHandle,
        stream: StreamId,
        data: &[u8],
    ) -> Result<usize, WriteError> {
        self.connections[conn.0].write(&mut self.ctx, stream, data)
    }

    /// Indicate that no more data will be sent on a stream
    ///
    /// All previously transmitted data will still be delivered. Incoming data on
    /// bidirectional streams is unaffected.
    ///
    /// # Panics
    /// - when applied to a stream that does not have an active outgoing channel
    pub fn finish(&mut self, conn: ConnectionHandle, stream: StreamId) {
        self.connections[conn.0].finish(stream);
        self.ctx.dirty_conns.insert(conn);
    }

    /// Read data from a stream
    ///
    /// Bytes are delivered strictly in order; the FIN is surfaced only once all preceding
    /// bytes have been consumed.
    ///
    /// # Panics
    /// - when applied to a stream that does not have an active incoming channel
    pub fn read(
        &mut self,
        conn: ConnectionHandle,
        stream: StreamId,
        buf: &mut [u8],
    ) -> Result<usize, ReadError> {
        self.ctx.dirty_conns.insert(conn); // May need to send flow control frames after reading
        self.connections[conn.0].read(stream, buf)
    }

    /// Abandon transmitting data on a stream
    ///
    /// # Panics
    /// - when applied to a receive stream or an unopened send stream
    pub fn reset(&mut self, conn: ConnectionHandle, stream: StreamId, error_code: u64) {
        self.connections[conn.0].reset(&mut self.ctx, stream, error_code)
    }

    /// Instruct the peer to abandon transmitting data on a stream
    pub fn stop_sending(&mut self, conn: ConnectionHandle, stream: StreamId, error_code: u64) {
        self.connections[conn.0].stop_sending(stream, error_code);
        self.ctx.dirty_conns.insert(conn);
    }

    /// Create a new stream
    ///
    /// Returns `None` if the maximum number of streams currently permitted by the remote
    /// endpoint are already open.
    pub fn open(&mut self, conn: ConnectionHandle, direction: Directionality) -> Option<StreamId> {
        self.connections[conn.0].open(&self.ctx.config, direction)
    }

    /// Ping the remote endpoint
    ///
    /// Useful for preventing an otherwise idle connection from timing out.
    pub fn ping(&mut self, conn: ConnectionHandle) {
        self.connections[conn.0].ping();
        self.ctx.dirty_conns.insert(conn);
    }

    /// Close a connection immediately
    ///
    /// This does not ensure delivery of outstanding data. It is the application's
    /// responsibility to call this only when all important communications have been
    /// completed.
    pub fn close(&mut self, now: u64, conn: ConnectionHandle, error_code: u64, reason: Bytes) {
        if self.connections[conn.0]
            .state
            .as_ref()
            .unwrap()
            .is_drained()
        {
            self.forget(conn);
            return;
        }
        self.connections[conn.0].close(&mut self.ctx, now, error_code, reason);
        self.ctx.dirty_conns.insert(conn);
    }

    /// Take the next connection whose handshake has completed
    pub fn accept(&mut self) -> Option<ConnectionHandle> {
        self.ctx.incoming.pop_front()
    }

    /// The CID the peer currently addresses `conn` by
    pub fn get_local_id(&self, conn: ConnectionHandle) -> ConnectionId {
        self.connections[conn.0].loc_cid
    }
    /// The CID we currently address the peer by
    pub fn get_remote_id(&self, conn: ConnectionHandle) -> ConnectionId {
        self.connections[conn.0].rem_cid
    }
    pub fn get_remote_address(&self, conn: ConnectionHandle) -> &SocketAddrV6 {
        &self.connections[conn.0].remote
    }
    pub fn get_protocol(&self, conn: ConnectionHandle) -> Option<&[u8]> {
        self.connections[conn.0].alpn_protocol()
    }
    /// The name a client supplied via SNI, if any
    pub fn get_server_name(&self, conn: ConnectionHandle) -> Option<&str> {
        self.connections[conn.0].sni_hostname()
    }
    /// Bytes of ack-eliciting packets that have not been acknowledged or declared lost
    pub fn get_bytes_in_flight(&self, conn: ConnectionHandle) -> u64 {
        self.connections[conn.0].in_flight
    }
    /// Number of bytes worth of non-ack-only packets that may be sent
    pub fn get_congestion_state(&self, conn: ConnectionHandle) -> u64 {
        let c = &self.connections[conn.0];
        c.congestion_window.saturating_sub(c.in_flight)
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("connections", &self.connections.len())
            .finish()
    }
}

/// Events of interest to the application
#[derive(Debug)]
pub enum Event {
    /// A connection was successfully established
    Connected { protocol: Option<Vec<u8>> },
    /// A connection was lost
    ConnectionLost { reason: ConnectionError },
    /// A closed connection finished draining and was dropped
    ConnectionDrained,
    /// The peer (or an id gap) opened a stream
    StreamOpened { stream: StreamId },
    /// A stream has data or errors waiting to be read
    StreamReadable {
        stream: StreamId,
        /// Whether this is the first event on the stream
        fresh: bool,
    },
    /// A formerly write-blocked stream might now accept a write
    StreamWritable { stream: StreamId },
    /// All data sent on `stream` has been received by the peer
    StreamFinished { stream: StreamId },
    /// At least one new stream of a certain directionality may be opened
    StreamAvailable { directionality: Directionality },
}

/// I/O operations to be immediately executed by the backend
#[derive(Debug)]
pub enum Io {
    Transmit {
        destination: SocketAddrV6,
        packet: Box<[u8]>,
    },
    /// Start or reset a timer
    TimerStart {
        connection: ConnectionHandle,
        timer: Timer,
        /// Absolute μs
        time: u64,
    },
    TimerStop {
        connection: ConnectionHandle,
        timer: Timer,
    },
}

#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq)]
pub enum Timer {
    Close,
    /// Doubles as the probe timer: its handler runs loss detection first and probes only
    /// when no loss deadline is armed
    LossDetection,
    Idle,
    /// Flush coalescing for delayed ACKs
    Push,
}

impl slog::Value for Timer {
    fn serialize(
        &self,
        _: &slog::Record,
        key: slog::Key,
        serializer: &mut slog::Serializer,
    ) -> slog::Result {
        serializer.emit_arguments(key, &format_args!("{:?}", self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    use crypto::testing::{peer_secrets, MockSessionFactory};
    use crypto::AEAD_TAG_SIZE;
    use frame;
    use packet::{set_payload_length, LongType, PacketNumber};

    fn logger() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    fn remote() -> SocketAddrV6 {
        SocketAddrV6::new(Ipv6Addr::new(0, 0, 0, 0, 0, 0xffff, 0x7f00, 1), 4433, 0, 0)
    }

    fn cid(x: u8, len: usize) -> ConnectionId {
        ConnectionId::new(&vec![x; len])
    }

    fn client_scid() -> ConnectionId {
        cid(2, 8)
    }

    fn client_transport_params() -> Vec<u8> {
        let params = TransportParameters {
            initial_source_connection_id: Some(client_scid()),
            initial_max_data: 1 << 20,
            initial_max_stream_data_bidi_local: 1 << 16,
            initial_max_stream_data_bidi_remote: 1 << 16,
            initial_max_stream_data_uni: 1 << 16,
            initial_max_streams_bidi: 16,
            initial_max_streams_uni: 16,
            ..TransportParameters::default()
        };
        let mut raw = Vec::new();
        params.write(&mut raw);
        raw
    }

    fn endpoint<F: FnMut(&mut Config)>(mut configure: F) -> Endpoint {
        let factory = Arc::new(MockSessionFactory(client_transport_params()));
        let mut config = Config::new(factory);
        configure(&mut config);
        Endpoint::new(logger(), config).unwrap()
    }

    /// Seal a client Initial datagram carrying one CRYPTO frame
    fn client_initial(dcid: ConnectionId, token: &[u8], pn: u64) -> BytesMut {
        let crypto = Crypto::new_initial(&dcid, Side::Client);
        let number = PacketNumber::new(pn, 0);
        let header = Header::Initial {
            dst_cid: dcid,
            src_cid: client_scid(),
            token: Bytes::from(token),
            number,
        };
        let mut buf = Vec::new();
        let partial_encode = header.encode(&mut buf);
        let header_len = buf.len();
        frame::Crypto {
            offset: 0,
            data: Bytes::from(&b"client-hello"[..]),
        }.encode(&mut buf);
        buf.resize(MIN_INITIAL_SIZE - AEAD_TAG_SIZE, 0);
        set_payload_length(&mut buf, header_len, number.len(), AEAD_TAG_SIZE);
        crypto.encrypt(pn, &mut buf, header_len);
        partial_encode.finish(
            &mut buf,
            crypto.header_encrypt_key(),
            header_len - number.len(),
        );
        BytesMut::from(&buf[..])
    }

    /// Seal a client Handshake packet under the mock session's handshake secrets
    fn client_handshake(dcid: ConnectionId, pn: u64) -> Vec<u8> {
        let crypto = Crypto::new(peer_secrets(0x10)).unwrap();
        let number = PacketNumber::new(pn, 0);
        let header = Header::Long {
            ty: LongType::Handshake,
            dst_cid: dcid,
            src_cid: client_scid(),
            number,
        };
        let mut buf = Vec::new();
        let partial_encode = header.encode(&mut buf);
        let header_len = buf.len();
        frame::Crypto {
            offset: 0,
            data: Bytes::from(&b"client-finished"[..]),
        }.encode(&mut buf);
        set_payload_length(&mut buf, header_len, number.len(), AEAD_TAG_SIZE);
        crypto.encrypt(pn, &mut buf, header_len);
        partial_encode.finish(
            &mut buf,
            crypto.header_encrypt_key(),
            header_len - number.len(),
        );
        buf
    }

    fn transmits(endpoint: &mut Endpoint, now: u64) -> Vec<Box<[u8]>> {
        let mut packets = Vec::new();
        while let Some(io) = endpoint.poll_io(now) {
            if let Io::Transmit { packet, .. } = io {
                packets.push(packet);
            }
        }
        packets
    }

    #[test]
    fn version_negotiation() {
        let mut server = endpoint(|_| {});
        let mut datagram = vec![0b1100_0000u8];
        datagram.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]); // unknown version
        datagram.push(8);
        datagram.extend_from_slice(&[1; 8]);
        datagram.push(8);
        datagram.extend_from_slice(&[2; 8]);
        datagram.extend_from_slice(&[0; 1200]);
        server.handle(0, remote(), BytesMut::from(&datagram[..]));
        let packets = transmits(&mut server, 0);
        assert_eq!(packets.len(), 1);
        let vn = &packets[0];
        assert_eq!(&vn[1..5], &[0u8, 0, 0, 0][..]); // version 0 marks negotiation
        let tail = &vn[1 + 4 + 1 + 8 + 1 + 8..];
        let mut versions = Vec::new();
        for chunk in tail.chunks(4) {
            versions.push(
                u32::from(chunk[0]) << 24
                    | u32::from(chunk[1]) << 16
                    | u32::from(chunk[2]) << 8
                    | u32::from(chunk[3]),
            );
        }
        assert!(versions.contains(&VERSION));
        assert!(versions.contains(&DRAFT_VERSION));
        assert_eq!(server.connections.len(), 0);
    }

    #[test]
    fn undersized_initial_ignored() {
        let mut server = endpoint(|_| {});
        let mut datagram = client_initial(cid(9, 8), &[], 0);
        datagram.truncate(600);
        server.handle(0, remote(), datagram);
        assert_eq!(server.connections.len(), 0);
    }

    #[test]
    fn handshake_completes_and_accepts() {
        let mut server = endpoint(|_| {});
        server.handle(0, remote(), client_initial(cid(9, 8), &[], 0));
        assert_eq!(server.connections.len(), 1);
        // The server flight goes out
        let flight = transmits(&mut server, 0);
        assert!(!flight.is_empty());
        // Client finishes
        let loc_cid = server.connections[0].loc_cid;
        server.handle(
            1000,
            remote(),
            BytesMut::from(&client_handshake(loc_cid, 0)[..]),
        );
        let mut connected = false;
        while let Some((_, event)) = server.poll() {
            if let Event::Connected { ref protocol } = event {
                connected = true;
                assert_eq!(protocol.as_ref().map(|x| &x[..]), Some(&b"test"[..]));
            }
        }
        assert!(connected);
        assert!(server.accept().is_some());
    }

    #[test]
    fn coalesced_initial_and_handshake() {
        // Both packets in one datagram; the second decrypts only if keys were installed
        // while the first was processed
        let mut server = endpoint(|_| {});
        let odcid = cid(9, 8);
        let mut datagram = client_initial(odcid, &[], 0);
        // Addressed by the ODCID; routing falls back to the source address
        datagram.extend_from_slice(&client_handshake(odcid, 0));
        server.handle(0, remote(), datagram);
        let mut connected = false;
        while let Some((_, event)) = server.poll() {
            if let Event::Connected { .. } = event {
                connected = true;
            }
        }
        assert!(connected);
    }

    #[test]
    fn retry_round_trip() {
        let mut server = endpoint(|config| {
            config.retry = true;
            config.token_key = Some([0x33; 32]);
        });
        let odcid = cid(9, 8);
        server.handle(0, remote(), client_initial(odcid, &[], 0));
        let packets = transmits(&mut server, 0);
        assert_eq!(packets.len(), 1);
        let retry = &packets[0];
        // Long header, type retry, version 1
        assert_eq!(retry[0] >> 4, 0b1111);
        assert_eq!(&retry[1..5], &[0u8, 0, 0, 1][..]);
        // DCID echoes the client SCID
        assert_eq!(retry[5] as usize, client_scid().len());
        assert_eq!(&retry[6..14], &client_scid()[..]);
        let retry_scid_len = retry[14] as usize;
        assert_eq!(retry_scid_len, LOC_CID_SIZE);
        let retry_scid = ConnectionId::new(&retry[15..15 + retry_scid_len]);
        let token = &retry[15 + retry_scid_len..retry.len() - AEAD_TAG_SIZE];
        // The token binds the client's address and the issue time
        let key = TokenKey::new([0x33; 32]);
        assert!(key.check(&remote(), token, 0, 1000));
        let other_addr =
            SocketAddrV6::new(Ipv6Addr::new(0, 0, 0, 0, 0, 0xffff, 0x7f00, 9), 4433, 0, 0);
        assert!(!key.check(&other_addr, token, 0, 1000));
        // Integrity tag verifies against the original DCID
        let tag = crypto::retry_tag(&odcid, &retry[..retry.len() - AEAD_TAG_SIZE]);
        assert_eq!(&retry[retry.len() - AEAD_TAG_SIZE..], &tag[..]);

        // Client retries with the token, addressed to the Retry SCID
        server.handle(10_000, remote(), client_initial(retry_scid, token, 1));
        assert!(server.connections[0].validated);
        let flight = transmits(&mut server, 10_000);
        assert!(!flight.is_empty());
        // Finish the handshake
        let loc_cid = server.connections[0].loc_cid;
        server.handle(
            20_000,
            remote(),
            BytesMut::from(&client_handshake(loc_cid, 0)[..]),
        );
        let mut connected = false;
        while let Some((_, event)) = server.poll() {
            if let Event::Connected { .. } = event {
                connected = true;
            }
        }
        assert!(connected);
    }

    #[test]
    fn retry_with_bad_token_rejected() {
        let mut server = endpoint(|config| {
            config.retry = true;
            config.token_key = Some([0x33; 32]);
        });
        server.handle(0, remote(), client_initial(cid(9, 8), &[], 0));
        let packets = transmits(&mut server, 0);
        let retry = &packets[0];
        let retry_scid = ConnectionId::new(&retry[15..15 + LOC_CID_SIZE]);
        let mut token = retry[15 + LOC_CID_SIZE..retry.len() - AEAD_TAG_SIZE].to_vec();
        token[0] ^= 0xff;
        server.handle(10_000, remote(), client_initial(retry_scid, &token, 1));
        let rejected = server.ctx.events.iter().any(|&(_, ref e)| match *e {
            Event::ConnectionLost {
                reason: ConnectionError::TransportError { error_code },
            } => error_code.code == TransportError::INVALID_TOKEN.code,
            _ => false,
        });
        assert!(rejected);
    }

    #[test]
    fn stateless_reset_emission_round_trips() {
        let mut server = endpoint(|config| {
            config.sr_token_key = Some(vec![0x44; 32]);
        });
        // A short-header packet for an unknown DCID
        let dcid = cid(5, LOC_CID_SIZE);
        let mut datagram = vec![0b0100_0000u8];
        datagram.extend_from_slice(&dcid);
        datagram.extend_from_slice(&[0xaa; 200]);
        let original_len = datagram.len();
        server.handle(0, remote(), BytesMut::from(&datagram[..]));
        let packets = transmits(&mut server, 0);
        assert_eq!(packets.len(), 1);
        let reset = &packets[0];
        assert!(reset.len() >= RESET_TOKEN_SIZE + 5);
        assert!(reset.len() <= cmp::min(1200, original_len * 3));
        assert_eq!(reset[0] & 0b1100_0000, 0b0100_0000);
        // The trailing token re-derives from the DCID
        let expected = crypto::reset_token_for(server.ctx.reset_key.as_ref().unwrap(), &dcid);
        assert_eq!(&reset[reset.len() - RESET_TOKEN_SIZE..], &expected[..]);
    }

    #[test]
    fn no_reset_without_key() {
        let mut server = endpoint(|_| {});
        let mut datagram = vec![0b0100_0000u8];
        datagram.extend_from_slice(&cid(5, LOC_CID_SIZE));
        datagram.extend_from_slice(&[0xaa; 64]);
        server.handle(0, remote(), BytesMut::from(&datagram[..]));
        assert!(transmits(&mut server, 0).is_empty());
    }

    #[test]
    fn accept_buffer_refusal() {
        let mut server = endpoint(|config| {
            config.accept_buffer = 0;
        });
        server.handle(0, remote(), client_initial(cid(9, 8), &[], 0));
        assert_eq!(server.connections.len(), 0);
        // The refusal is a protected Initial close
        let packets = transmits(&mut server, 0);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0][0] >> 4, 0b1100);
    }

    #[test]
    fn idle_timer_armed_and_silent_on_expiry() {
        let mut server = endpoint(|_| {});
        server.handle(0, remote(), client_initial(cid(9, 8), &[], 0));
        let mut armed = false;
        while let Some(io) = server.poll_io(0) {
            if let Io::TimerStart {
                timer: Timer::Idle,
                time,
                ..
            } = io
            {
                assert!(time > 0);
                armed = true;
            }
        }
        assert!(armed);
        // Expiry terminates without a CONNECTION_CLOSE
        server.timeout(20_000_000, ConnectionHandle(0), Timer::Idle);
        let closes = transmits(&mut server, 20_000_000);
        assert!(closes.is_empty());
        let timed_out = server.ctx.events.iter().any(|&(_, ref e)| match *e {
            Event::ConnectionLost {
                reason: ConnectionError::TimedOut,
            } => true,
            _ => false,
        });
        assert!(timed_out);
    }

    #[test]
    fn retry_requires_token_key() {
        let factory = Arc::new(MockSessionFactory(Vec::new()));
        let mut config = Config::new(factory);
        config.retry = true;
        assert!(Endpoint::new(logger(), config).is_err());
    }
}
