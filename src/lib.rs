//! Server-side state machine for the QUIC transport protocol.
//!
//! This crate performs no I/O. An [`Endpoint`] consumes incoming UDP datagrams and timer
//! expirations and emits `Io` operations (datagrams to transmit, timers to set) together with
//! application-facing `Event`s. The TLS 1.3 stack is supplied by the caller through the
//! [`crypto::Session`] trait; everything else — packet protection, acknowledgement and loss
//! state, congestion control, streams and flow control, connection IDs, Retry and stateless
//! resets — lives here.
//!
//! [`Endpoint`]: endpoint/struct.Endpoint.html
//! [`crypto::Session`]: crypto/trait.Session.html

extern crate aes;
extern crate block_modes;
extern crate bytes;
extern crate constant_time_eq;
#[macro_use]
extern crate failure;
extern crate fnv;
#[macro_use]
extern crate lazy_static;
extern crate rand;
extern crate ring;
extern crate slab;
#[macro_use]
extern crate slog;

#[cfg(test)]
#[macro_use]
extern crate assert_matches;
#[cfg(test)]
#[macro_use]
extern crate hex_literal;
#[cfg(test)]
extern crate slog_term;

use std::fmt;

mod cid;
mod coding;
mod range_set;
mod spaces;
mod token;

pub mod connection;
pub mod crypto;
pub mod endpoint;
pub mod frame;
pub mod packet;
pub mod stream;
pub mod transport_parameters;

pub use connection::{Connection, ConnectionError, ConnectionHandle};
pub use endpoint::{Config, Endpoint, Event, Io, Timer};
pub use frame::Frame;
pub use packet::ConnectionId;
pub use spaces::SpaceId;
pub use stream::{ReadError, WriteError};
pub use token::TokenKey;

/// The QUIC protocol version implemented.
pub const VERSION: u32 = 0x0000_0001;
/// Late draft compatible with version 1 on the wire.
pub const DRAFT_VERSION: u32 = 0xff00_001d;

pub fn version_supported(x: u32) -> bool {
    x == VERSION || x == DRAFT_VERSION
}

/// Whether an endpoint is the initiator of a connection
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Side {
    /// The initiator of a connection
    Client = 0,
    /// The acceptor of a connection
    Server = 1,
}

impl ::std::ops::Not for Side {
    type Output = Side;
    fn not(self) -> Side {
        match self {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }
}

/// Whether or not a stream may be used for two-way communication
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Directionality {
    /// Two-way stream
    Bi = 0,
    /// One-way stream
    Uni = 1,
}

/// Identifier for a stream within a particular connection
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct StreamId(pub u64);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let initiator = match self.initiator() {
            Side::Client => "client",
            Side::Server => "server",
        };
        let directionality = match self.directionality() {
            Directionality::Uni => "uni",
            Directionality::Bi => "bi",
        };
        write!(
            f,
            "{} {}directional stream {}",
            initiator,
            directionality,
            self.index()
        )
    }
}

impl StreamId {
    pub fn new(initiator: Side, directionality: Directionality, index: u64) -> Self {
        StreamId(index << 2 | (directionality as u64) << 1 | initiator as u64)
    }
    /// Which side of a connection initiated the stream
    pub fn initiator(self) -> Side {
        if self.0 & 0x1 == 0 {
            Side::Client
        } else {
            Side::Server
        }
    }
    /// Which directions data flows in
    pub fn directionality(self) -> Directionality {
        if self.0 & 0x2 == 0 {
            Directionality::Bi
        } else {
            Directionality::Uni
        }
    }
    /// Distinguishes streams of the same initiator and directionality
    pub fn index(self) -> u64 {
        self.0 >> 2
    }
}

impl slog::Value for StreamId {
    fn serialize(
        &self,
        _: &slog::Record,
        key: slog::Key,
        serializer: &mut slog::Serializer,
    ) -> slog::Result {
        serializer.emit_arguments(key, &format_args!("{}", self))
    }
}

impl coding::Codec for StreamId {
    fn decode<B: bytes::Buf>(buf: &mut B) -> coding::Result<StreamId> {
        coding::BufExt::get_var(buf).map(StreamId)
    }
    fn encode<B: bytes::BufMut>(&self, buf: &mut B) {
        coding::BufMutExt::write_var(buf, self.0);
    }
}

/// Transport-level errors as defined by the protocol, plus the frame they were provoked by
#[derive(Debug, Copy, Clone, Eq, PartialEq, Fail)]
pub struct TransportError {
    pub code: u64,
    /// Type of the frame that was being processed when the error occurred
    pub frame: Option<u64>,
}

macro_rules! transport_errors {
    {$($name:ident($val:expr), $desc:expr;)*} => {
        impl TransportError {
            $(pub const $name: TransportError = TransportError { code: $val, frame: None };)*

            fn description(&self) -> &'static str {
                match self.code {
                    $($val => $desc,)*
                    x if x >= 0x100 && x < 0x200 => "TLS alert",
                    _ => "unknown error code",
                }
            }
        }
    }
}

transport_errors! {
    NO_ERROR(0x0), "the connection is being closed abruptly in the absence of any error";
    INTERNAL_ERROR(0x1), "the endpoint encountered an internal error and cannot continue with the connection";
    CONNECTION_REFUSED(0x2), "the server refused to accept a new connection";
    FLOW_CONTROL_ERROR(0x3), "received more data than permitted in advertised data limits";
    STREAM_LIMIT_ERROR(0x4), "received a frame for a stream identifier that exceeded advertised the stream limit for the corresponding stream type";
    STREAM_STATE_ERROR(0x5), "received a frame for a stream that was not in a state that permitted that frame";
    FINAL_SIZE_ERROR(0x6), "received a STREAM frame or a RESET_STREAM frame containing a different final size to the one already established";
    FRAME_ENCODING_ERROR(0x7), "received a frame that was badly formatted";
    TRANSPORT_PARAMETER_ERROR(0x8), "received transport parameters that were badly formatted, included an invalid value, or omitted a mandatory parameter";
    CONNECTION_ID_LIMIT_ERROR(0x9), "the number of connection IDs provided by the peer exceeds the advertised limit";
    PROTOCOL_VIOLATION(0xA), "detected an error with protocol compliance that was not covered by more specific error codes";
    INVALID_TOKEN(0xB), "received an Initial packet containing an invalid token";
    APPLICATION_ERROR(0xC), "the application or application protocol caused the connection to be closed";
    CRYPTO_BUFFER_EXCEEDED(0xD), "received more data in CRYPTO frames than can be buffered";
    KEY_UPDATE_ERROR(0xE), "key update error";
    AEAD_LIMIT_REACHED(0xF), "the endpoint has reached the confidentiality or integrity limit for the AEAD algorithm";
}

impl TransportError {
    /// An error arising from the TLS layer: `0x100` plus the alert code
    pub fn crypto(alert: u8) -> Self {
        TransportError {
            code: 0x100 | u64::from(alert),
            frame: None,
        }
    }

    /// Attribute this error to the frame that provoked it
    pub fn in_frame(self, ty: u64) -> Self {
        TransportError {
            frame: Some(ty),
            ..self
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

impl slog::Value for TransportError {
    fn serialize(
        &self,
        _: &slog::Record,
        key: slog::Key,
        serializer: &mut slog::Serializer,
    ) -> slog::Result {
        serializer.emit_arguments(key, &format_args!("{}", self))
    }
}

/// Smallest datagram a peer may send an ack-eliciting Initial packet in
pub const MIN_INITIAL_SIZE: usize = 1200;
/// UDP payload size every QUIC path supports
pub const MIN_MTU: u16 = 1200;
/// Largest UDP payload we will produce without a larger peer limit
pub const MAX_MTU: u16 = 1452;
pub const MAX_CID_SIZE: usize = 20;
pub const MIN_INITIAL_DST_CID_SIZE: usize = 8;
/// Length of the connection IDs this endpoint issues
pub const LOC_CID_SIZE: usize = 16;
pub const RESET_TOKEN_SIZE: usize = 16;
/// Out-of-order data retained per CRYPTO stream or application stream
pub const REORDER_BUFFER_SIZE: usize = 64 * 1024;
