//! Codec and validation for the transport parameters carried in the TLS handshake.

use bytes::{Buf, BufMut};

use coding::{self, BufExt, BufMutExt};
use packet::ConnectionId;
use {Side, TransportError, MAX_CID_SIZE, RESET_TOKEN_SIZE};

/// Default exponent applied to ACK delay fields when none is negotiated
pub const ACK_DELAY_EXPONENT: u8 = 3;

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TransportParameters {
    pub original_destination_connection_id: Option<ConnectionId>,
    pub initial_source_connection_id: Option<ConnectionId>,
    pub retry_source_connection_id: Option<ConnectionId>,
    /// Milliseconds, 0 for none
    pub max_idle_timeout: u64,
    pub max_udp_payload_size: u64,
    pub initial_max_data: u64,
    pub initial_max_stream_data_bidi_local: u64,
    pub initial_max_stream_data_bidi_remote: u64,
    pub initial_max_stream_data_uni: u64,
    pub initial_max_streams_bidi: u64,
    pub initial_max_streams_uni: u64,
    pub ack_delay_exponent: u8,
    /// Milliseconds
    pub max_ack_delay: u64,
    pub active_connection_id_limit: u64,
    pub stateless_reset_token: Option<[u8; RESET_TOKEN_SIZE]>,
}

impl Default for TransportParameters {
    fn default() -> Self {
        TransportParameters {
            original_destination_connection_id: None,
            initial_source_connection_id: None,
            retry_source_connection_id: None,
            max_idle_timeout: 0,
            max_udp_payload_size: 65527,
            initial_max_data: 0,
            initial_max_stream_data_bidi_local: 0,
            initial_max_stream_data_bidi_remote: 0,
            initial_max_stream_data_uni: 0,
            initial_max_streams_bidi: 0,
            initial_max_streams_uni: 0,
            ack_delay_exponent: ACK_DELAY_EXPONENT,
            max_ack_delay: 25,
            active_connection_id_limit: 2,
            stateless_reset_token: None,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Fail)]
pub enum Error {
    #[fail(display = "parameter had illegal value")]
    IllegalValue,
    #[fail(display = "parameters were malformed")]
    Malformed,
}

impl From<Error> for TransportError {
    fn from(_: Error) -> Self {
        TransportError::TRANSPORT_PARAMETER_ERROR
    }
}

impl From<coding::UnexpectedEnd> for Error {
    fn from(_: coding::UnexpectedEnd) -> Self {
        Error::Malformed
    }
}

const ORIGINAL_DESTINATION_CONNECTION_ID: u64 = 0x00;
const MAX_IDLE_TIMEOUT: u64 = 0x01;
const STATELESS_RESET_TOKEN: u64 = 0x02;
const MAX_UDP_PAYLOAD_SIZE: u64 = 0x03;
const INITIAL_MAX_DATA: u64 = 0x04;
const INITIAL_MAX_STREAM_DATA_BIDI_LOCAL: u64 = 0x05;
const INITIAL_MAX_STREAM_DATA_BIDI_REMOTE: u64 = 0x06;
const INITIAL_MAX_STREAM_DATA_UNI: u64 = 0x07;
const INITIAL_MAX_STREAMS_BIDI: u64 = 0x08;
const INITIAL_MAX_STREAMS_UNI: u64 = 0x09;
const ACK_DELAY_EXPONENT_ID: u64 = 0x0a;
const MAX_ACK_DELAY: u64 = 0x0b;
const ACTIVE_CONNECTION_ID_LIMIT: u64 = 0x0e;
const INITIAL_SOURCE_CONNECTION_ID: u64 = 0x0f;
const RETRY_SOURCE_CONNECTION_ID: u64 = 0x10;

impl TransportParameters {
    pub fn write<W: BufMut>(&self, w: &mut W) {
        if let Some(ref id) = self.original_destination_connection_id {
            write_cid(w, ORIGINAL_DESTINATION_CONNECTION_ID, id);
        }
        if let Some(ref id) = self.initial_source_connection_id {
            write_cid(w, INITIAL_SOURCE_CONNECTION_ID, id);
        }
        if let Some(ref id) = self.retry_source_connection_id {
            write_cid(w, RETRY_SOURCE_CONNECTION_ID, id);
        }
        write_int(w, MAX_IDLE_TIMEOUT, self.max_idle_timeout);
        write_int(w, MAX_UDP_PAYLOAD_SIZE, self.max_udp_payload_size);
        write_int(w, INITIAL_MAX_DATA, self.initial_max_data);
        write_int(
            w,
            INITIAL_MAX_STREAM_DATA_BIDI_LOCAL,
            self.initial_max_stream_data_bidi_local,
        );
        write_int(
            w,
            INITIAL_MAX_STREAM_DATA_BIDI_REMOTE,
            self.initial_max_stream_data_bidi_remote,
        );
        write_int(w, INITIAL_MAX_STREAM_DATA_UNI, self.initial_max_stream_data_uni);
        write_int(w, INITIAL_MAX_STREAMS_BIDI, self.initial_max_streams_bidi);
        write_int(w, INITIAL_MAX_STREAMS_UNI, self.initial_max_streams_uni);
        write_int(w, ACK_DELAY_EXPONENT_ID, u64::from(self.ack_delay_exponent));
        write_int(w, MAX_ACK_DELAY, self.max_ack_delay);
        write_int(w, ACTIVE_CONNECTION_ID_LIMIT, self.active_connection_id_limit);
        if let Some(ref token) = self.stateless_reset_token {
            w.write_var(STATELESS_RESET_TOKEN);
            w.write_var(RESET_TOKEN_SIZE as u64);
            w.put_slice(token);
        }
    }

    /// Decode the parameters sent by `side`'s peer
    pub fn read<R: Buf>(side: Side, r: &mut R) -> Result<Self, Error> {
        let mut params = TransportParameters::default();
        // Sixteen low-numbered parameters, tracked against duplication
        let mut seen = [false; 17];
        while r.has_remaining() {
            let id = r.get_var()?;
            let len = r.get_var()? as usize;
            if len > r.remaining() {
                return Err(Error::Malformed);
            }
            if let Some(flag) = seen.get_mut(id as usize) {
                if *flag {
                    return Err(Error::Malformed);
                }
                *flag = true;
            }
            if side == Side::Server {
                // Parameters only a server may send
                match id {
                    ORIGINAL_DESTINATION_CONNECTION_ID
                    | RETRY_SOURCE_CONNECTION_ID
                    | STATELESS_RESET_TOKEN => {
                        return Err(Error::IllegalValue);
                    }
                    _ => {}
                }
            }
            match id {
                ORIGINAL_DESTINATION_CONNECTION_ID => {
                    params.original_destination_connection_id = Some(read_cid(r, len)?);
                }
                INITIAL_SOURCE_CONNECTION_ID => {
                    params.initial_source_connection_id = Some(read_cid(r, len)?);
                }
                RETRY_SOURCE_CONNECTION_ID => {
                    params.retry_source_connection_id = Some(read_cid(r, len)?);
                }
                MAX_IDLE_TIMEOUT => {
                    params.max_idle_timeout = read_int(r, len)?;
                }
                MAX_UDP_PAYLOAD_SIZE => {
                    params.max_udp_payload_size = read_int(r, len)?;
                    if params.max_udp_payload_size < 1200 {
                        return Err(Error::IllegalValue);
                    }
                }
                INITIAL_MAX_DATA => {
                    params.initial_max_data = read_int(r, len)?;
                }
                INITIAL_MAX_STREAM_DATA_BIDI_LOCAL => {
                    params.initial_max_stream_data_bidi_local = read_int(r, len)?;
                }
                INITIAL_MAX_STREAM_DATA_BIDI_REMOTE => {
                    params.initial_max_stream_data_bidi_remote = read_int(r, len)?;
                }
                INITIAL_MAX_STREAM_DATA_UNI => {
                    params.initial_max_stream_data_uni = read_int(r, len)?;
                }
                INITIAL_MAX_STREAMS_BIDI => {
                    params.initial_max_streams_bidi = read_int(r, len)?;
                    if params.initial_max_streams_bidi > 1 << 60 {
                        return Err(Error::IllegalValue);
                    }
                }
                INITIAL_MAX_STREAMS_UNI => {
                    params.initial_max_streams_uni = read_int(r, len)?;
                    if params.initial_max_streams_uni > 1 << 60 {
                        return Err(Error::IllegalValue);
                    }
                }
                ACK_DELAY_EXPONENT_ID => {
                    let x = read_int(r, len)?;
                    if x > 20 {
                        return Err(Error::IllegalValue);
                    }
                    params.ack_delay_exponent = x as u8;
                }
                MAX_ACK_DELAY => {
                    params.max_ack_delay = read_int(r, len)?;
                    if params.max_ack_delay >= 1 << 14 {
                        return Err(Error::IllegalValue);
                    }
                }
                ACTIVE_CONNECTION_ID_LIMIT => {
                    params.active_connection_id_limit = read_int(r, len)?;
                    if params.active_connection_id_limit < 2 {
                        return Err(Error::IllegalValue);
                    }
                }
                STATELESS_RESET_TOKEN => {
                    if len != RESET_TOKEN_SIZE {
                        return Err(Error::Malformed);
                    }
                    let mut token = [0; RESET_TOKEN_SIZE];
                    r.copy_to_slice(&mut token);
                    params.stateless_reset_token = Some(token);
                }
                _ => {
                    // Unknown parameters are ignored for forward compatibility
                    r.advance(len);
                }
            }
        }
        Ok(params)
    }
}

fn write_cid<W: BufMut>(w: &mut W, id: u64, cid: &ConnectionId) {
    w.write_var(id);
    w.write_var(cid.len() as u64);
    w.put_slice(cid);
}

fn read_cid<R: Buf>(r: &mut R, len: usize) -> Result<ConnectionId, Error> {
    if len > MAX_CID_SIZE {
        return Err(Error::Malformed);
    }
    let mut bytes = [0; MAX_CID_SIZE];
    r.copy_to_slice(&mut bytes[..len]);
    Ok(ConnectionId::new(&bytes[..len]))
}

fn write_int<W: BufMut>(w: &mut W, id: u64, value: u64) {
    w.write_var(id);
    w.write_var(coding::varint_size(value) as u64);
    w.write_var(value);
}

fn read_int<R: Buf>(r: &mut R, len: usize) -> Result<u64, Error> {
    let before = r.remaining();
    let value = r.get_var()?;
    if before - r.remaining() != len {
        return Err(Error::Malformed);
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn round_trip_as_seen_by_client() {
        let params = TransportParameters {
            original_destination_connection_id: Some(ConnectionId::new(&[1; 8])),
            initial_source_connection_id: Some(ConnectionId::new(&[2; 16])),
            retry_source_connection_id: Some(ConnectionId::new(&[3; 16])),
            max_idle_timeout: 30_000,
            initial_max_data: 1 << 20,
            initial_max_stream_data_bidi_local: 1 << 16,
            initial_max_stream_data_bidi_remote: 1 << 16,
            initial_max_stream_data_uni: 1 << 16,
            initial_max_streams_bidi: 32,
            initial_max_streams_uni: 8,
            max_ack_delay: 25,
            active_connection_id_limit: 4,
            stateless_reset_token: Some([0xaa; RESET_TOKEN_SIZE]),
            ..TransportParameters::default()
        };
        let mut buf = Vec::new();
        params.write(&mut buf);
        let decoded = TransportParameters::read(Side::Client, &mut Cursor::new(&buf)).unwrap();
        assert_eq!(decoded, params);
    }

    #[test]
    fn server_only_parameters_rejected_from_client() {
        let params = TransportParameters {
            stateless_reset_token: Some([0xaa; RESET_TOKEN_SIZE]),
            ..TransportParameters::default()
        };
        let mut buf = Vec::new();
        params.write(&mut buf);
        assert_eq!(
            TransportParameters::read(Side::Server, &mut Cursor::new(&buf)),
            Err(Error::IllegalValue)
        );
    }

    #[test]
    fn duplicates_rejected() {
        let mut buf = Vec::new();
        write_int(&mut buf, INITIAL_MAX_DATA, 100);
        write_int(&mut buf, INITIAL_MAX_DATA, 100);
        assert_eq!(
            TransportParameters::read(Side::Server, &mut Cursor::new(&buf)),
            Err(Error::Malformed)
        );
    }

    #[test]
    fn unknown_parameters_skipped() {
        let mut buf = Vec::new();
        buf.write_var(0x31);
        buf.write_var(3);
        buf.extend_from_slice(&[1, 2, 3]);
        write_int(&mut buf, INITIAL_MAX_DATA, 7);
        let params = TransportParameters::read(Side::Server, &mut Cursor::new(&buf)).unwrap();
        assert_eq!(params.initial_max_data, 7);
    }

    #[test]
    fn illegal_values_rejected() {
        let mut buf = Vec::new();
        write_int(&mut buf, MAX_UDP_PAYLOAD_SIZE, 100);
        assert_eq!(
            TransportParameters::read(Side::Server, &mut Cursor::new(&buf)),
            Err(Error::IllegalValue)
        );
        let mut buf = Vec::new();
        write_int(&mut buf, ACK_DELAY_EXPONENT_ID, 21);
        assert_eq!(
            TransportParameters::read(Side::Server, &mut Cursor::new(&buf)),
            Err(Error::IllegalValue)
        );
    }
}
