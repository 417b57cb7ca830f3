//! Packet headers: parsing, construction, and header protection plumbing.
//!
//! Inbound datagrams pass through `PartialDecode`, which splits coalesced packets and defers
//! header-protection removal until the caller has located keys for the packet's encryption
//! level. Outbound headers are written with `Header::encode`, which returns a `PartialEncode`
//! to apply header protection after the payload has been sealed.

use std::fmt;
use std::io::Cursor;

use bytes::{BigEndian, Buf, BufMut, ByteOrder, Bytes, BytesMut};
use rand::Rng;
use slog;

use coding::{self, BufExt, BufMutExt};
use crypto::HeaderKey;
use spaces::SpaceId;
use {version_supported, MAX_CID_SIZE, VERSION};

/// Sample length used for header protection
pub const SAMPLE_SIZE: usize = 16;
/// Offset from the start of the packet number at which the sample is taken
const SAMPLE_OFFSET: usize = 4;

/// An opaque, variable-length connection identifier, at most 20 bytes
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ConnectionId {
    pub len: u8,
    pub bytes: [u8; MAX_CID_SIZE],
}

impl ConnectionId {
    pub fn new(data: &[u8]) -> Self {
        debug_assert!(data.len() <= MAX_CID_SIZE);
        let mut x = ConnectionId {
            len: data.len() as u8,
            bytes: [0; MAX_CID_SIZE],
        };
        x.bytes[..data.len()].copy_from_slice(data);
        x
    }

    pub fn random<R: Rng>(rng: &mut R, len: usize) -> Self {
        debug_assert!(len <= MAX_CID_SIZE);
        let mut x = ConnectionId {
            len: len as u8,
            bytes: [0; MAX_CID_SIZE],
        };
        rng.fill_bytes(&mut x.bytes[..len]);
        x
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl ::std::ops::Deref for ConnectionId {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.bytes[0..self.len as usize]
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.bytes[0..self.len as usize].fmt(f)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for byte in self.iter() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl slog::Value for ConnectionId {
    fn serialize(
        &self,
        _: &slog::Record,
        key: slog::Key,
        serializer: &mut slog::Serializer,
    ) -> slog::Result {
        serializer.emit_arguments(key, &format_args!("{}", self))
    }
}

/// A packet number, pre-truncation
///
/// The variant records how many low-order bytes appear on the wire.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PacketNumber {
    U8(u8),
    U16(u16),
    U24(u32),
    U32(u32),
}

impl PacketNumber {
    pub fn new(n: u64, largest_acked: u64) -> Self {
        let range = (n - largest_acked) * 2;
        if range < 1 << 8 {
            PacketNumber::U8(n as u8)
        } else if range < 1 << 16 {
            PacketNumber::U16(n as u16)
        } else if range < 1 << 24 {
            PacketNumber::U24(n as u32)
        } else {
            PacketNumber::U32(n as u32)
        }
    }

    pub fn len(self) -> usize {
        use self::PacketNumber::*;
        match self {
            U8(_) => 1,
            U16(_) => 2,
            U24(_) => 3,
            U32(_) => 4,
        }
    }

    pub fn encode<W: BufMut>(self, w: &mut W) {
        use self::PacketNumber::*;
        match self {
            U8(x) => w.write(x),
            U16(x) => w.write(x),
            U24(x) => {
                w.put_u8((x >> 16) as u8);
                w.put_u16_be(x as u16);
            }
            U32(x) => w.write(x),
        }
    }

    pub fn decode<R: Buf>(len: usize, r: &mut R) -> coding::Result<Self> {
        use self::PacketNumber::*;
        Ok(match len {
            1 => U8(r.get()?),
            2 => U16(r.get()?),
            3 => {
                let hi = u32::from(r.get::<u8>()?);
                let lo = u32::from(r.get::<u16>()?);
                U24(hi << 16 | lo)
            }
            4 => U32(r.get()?),
            _ => unreachable!("packet number lengths are 1-4 bytes"),
        })
    }

    fn truncated(self) -> u64 {
        use self::PacketNumber::*;
        match self {
            U8(x) => u64::from(x),
            U16(x) => u64::from(x),
            U24(x) => u64::from(x),
            U32(x) => u64::from(x),
        }
    }

    /// Recover the full packet number given the largest number received in its space
    pub fn expand(self, largest: Option<u64>) -> u64 {
        let truncated = self.truncated();
        let nbits = self.len() as u64 * 8;
        let expected = largest.map_or(0, |x| x + 1);
        let win = 1u64 << nbits;
        let hwin = win / 2;
        let mask = win - 1;
        let candidate = (expected & !mask) | truncated;
        if candidate.wrapping_add(hwin) <= expected {
            candidate + win
        } else if candidate > expected.wrapping_add(hwin) && candidate >= win {
            candidate - win
        } else {
            candidate
        }
    }
}

/// Types of long-header packets other than Initial and Retry
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LongType {
    Handshake,
    ZeroRtt,
}

#[derive(Debug, Clone)]
pub enum Header {
    Initial {
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        token: Bytes,
        number: PacketNumber,
    },
    Long {
        ty: LongType,
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        number: PacketNumber,
    },
    Retry {
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        token: Bytes,
    },
    Short {
        dst_cid: ConnectionId,
        number: PacketNumber,
        key_phase: bool,
    },
    VersionNegotiate {
        random: u8,
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
    },
}

impl Header {
    /// Write the header, leaving packet-number bytes unprotected
    ///
    /// Long headers are written with a two-byte length placeholder to be patched by
    /// `set_payload_length` once the payload size is known.
    pub fn encode<W: BufMut>(&self, w: &mut W) -> PartialEncode {
        use self::Header::*;
        match *self {
            Initial {
                ref dst_cid,
                ref src_cid,
                ref token,
                number,
            } => {
                w.write(0b1100_0000u8 | number.len() as u8 - 1);
                w.write(VERSION);
                Self::encode_cids(w, dst_cid, src_cid);
                w.write_var(token.len() as u64);
                w.put_slice(token);
                w.write::<u16>(0); // length, patched later
                number.encode(w);
                PartialEncode {
                    pn: Some(number.len()),
                }
            }
            Long {
                ty,
                ref dst_cid,
                ref src_cid,
                number,
            } => {
                let ty_bits = match ty {
                    LongType::ZeroRtt => 0b01,
                    LongType::Handshake => 0b10,
                };
                w.write(0b1100_0000u8 | ty_bits << 4 | number.len() as u8 - 1);
                w.write(VERSION);
                Self::encode_cids(w, dst_cid, src_cid);
                w.write::<u16>(0); // length, patched later
                number.encode(w);
                PartialEncode {
                    pn: Some(number.len()),
                }
            }
            Retry {
                ref dst_cid,
                ref src_cid,
                ref token,
            } => {
                w.write(0b1111_0000u8);
                w.write(VERSION);
                Self::encode_cids(w, dst_cid, src_cid);
                w.put_slice(token);
                PartialEncode { pn: None }
            }
            Short {
                ref dst_cid,
                number,
                key_phase,
            } => {
                w.write(
                    0b0100_0000u8
                        | if key_phase { 0b100 } else { 0 }
                        | number.len() as u8 - 1,
                );
                w.put_slice(dst_cid);
                number.encode(w);
                PartialEncode {
                    pn: Some(number.len()),
                }
            }
            VersionNegotiate {
                random,
                ref dst_cid,
                ref src_cid,
            } => {
                w.write(0b1000_0000u8 | random);
                w.write::<u32>(0);
                Self::encode_cids(w, dst_cid, src_cid);
                PartialEncode { pn: None }
            }
        }
    }

    fn encode_cids<W: BufMut>(w: &mut W, dst_cid: &ConnectionId, src_cid: &ConnectionId) {
        w.write(dst_cid.len);
        w.put_slice(dst_cid);
        w.write(src_cid.len);
        w.put_slice(src_cid);
    }

    pub fn number(&self) -> Option<PacketNumber> {
        use self::Header::*;
        match *self {
            Initial { number, .. } | Long { number, .. } | Short { number, .. } => Some(number),
            _ => None,
        }
    }

    pub fn space(&self) -> SpaceId {
        use self::Header::*;
        match *self {
            Initial { .. } => SpaceId::Initial,
            Long {
                ty: LongType::Handshake,
                ..
            } => SpaceId::Handshake,
            _ => SpaceId::Data,
        }
    }

    pub fn key_phase(&self) -> bool {
        match *self {
            Header::Short { key_phase, .. } => key_phase,
            _ => false,
        }
    }

    pub fn is_short(&self) -> bool {
        match *self {
            Header::Short { .. } => true,
            _ => false,
        }
    }
}

/// Handle for protecting a header once its packet's payload has been sealed
pub struct PartialEncode {
    pn: Option<usize>,
}

impl PartialEncode {
    /// Apply header protection
    ///
    /// `buf` must contain the complete sealed packet; `pn_offset` is where the packet number
    /// begins, and at least `SAMPLE_OFFSET + SAMPLE_SIZE` bytes of ciphertext must follow it.
    pub fn finish(self, buf: &mut [u8], header_key: &HeaderKey, pn_offset: usize) {
        let pn_len = match self.pn {
            Some(len) => len,
            None => return,
        };
        debug_assert!(buf.len() >= pn_offset + SAMPLE_OFFSET + SAMPLE_SIZE);
        let mut sample = [0; SAMPLE_SIZE];
        sample.copy_from_slice(&buf[pn_offset + SAMPLE_OFFSET..pn_offset + SAMPLE_OFFSET + SAMPLE_SIZE]);
        let mask = header_key.mask(&sample);
        if buf[0] & LONG_HEADER_FORM == 0 {
            buf[0] ^= mask[0] & 0x1f;
        } else {
            buf[0] ^= mask[0] & 0x0f;
        }
        for (out, &m) in buf[pn_offset..pn_offset + pn_len].iter_mut().zip(&mask[1..]) {
            *out ^= m;
        }
    }
}

/// Patch the length field of a long header
///
/// The length covers the packet number, payload, and AEAD tag.
pub fn set_payload_length(packet: &mut [u8], header_len: usize, pn_len: usize, tag_len: usize) {
    let len = packet.len() - header_len + pn_len + tag_len;
    assert!(len < 2usize.pow(14)); // Fits in 2-byte varint
    BigEndian::write_u16(
        &mut packet[header_len - pn_len - 2..],
        len as u16 | 0b01 << 14,
    );
}

/// A packet with its header fully decoded and protection removed, payload still sealed
pub struct Packet {
    pub header: Header,
    /// Bytes covered by the header, fed to the AEAD as associated data
    pub header_data: Bytes,
    pub payload: BytesMut,
}

#[derive(Debug, Clone, Fail)]
pub enum PacketDecodeError {
    #[fail(display = "unsupported version")]
    UnsupportedVersion {
        source: ConnectionId,
        destination: ConnectionId,
    },
    #[fail(display = "invalid header: {}", _0)]
    InvalidHeader(&'static str),
}

impl From<coding::UnexpectedEnd> for PacketDecodeError {
    fn from(_: coding::UnexpectedEnd) -> Self {
        PacketDecodeError::InvalidHeader("unexpected end of packet")
    }
}

const LONG_HEADER_FORM: u8 = 0x80;
const FIXED_BIT: u8 = 0x40;

/// The type of an inbound packet, known before header protection is removed
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum PlainType {
    Initial,
    Handshake,
    ZeroRtt,
    Retry,
    Short,
}

/// A packet whose invariant header has been parsed, pending header-protection removal
///
/// Splitting decoding in two lets the caller route on the destination CID and look up (or
/// derive) keys before the protected fields are touched.
pub struct PartialDecode {
    ty: PlainType,
    dst_cid: ConnectionId,
    src_cid: ConnectionId,
    token: Bytes,
    /// Bytes of this packet only; the cursor rests at the packet number
    data: Cursor<BytesMut>,
}

impl PartialDecode {
    /// Parse the invariant header, splitting off any coalesced packets that follow
    pub fn new(
        data: BytesMut,
        local_cid_len: usize,
    ) -> Result<(Self, Option<BytesMut>), PacketDecodeError> {
        let mut buf = Cursor::new(data);
        let first = buf.get::<u8>()?;
        if first & LONG_HEADER_FORM == 0 {
            // Short header
            if first & FIXED_BIT == 0 {
                return Err(PacketDecodeError::InvalidHeader("fixed bit unset"));
            }
            if buf.remaining() < local_cid_len {
                return Err(PacketDecodeError::InvalidHeader("destination id too short"));
            }
            let dst_cid = Self::get_cid_of(&mut buf, local_cid_len);
            return Ok((
                PartialDecode {
                    ty: PlainType::Short,
                    dst_cid,
                    src_cid: ConnectionId::new(&[]),
                    token: Bytes::new(),
                    data: buf,
                },
                None,
            ));
        }

        let version = buf.get::<u32>()?;
        let dst_cid = Self::get_cid(&mut buf)?;
        let src_cid = Self::get_cid(&mut buf)?;
        if version == 0 {
            // Version negotiation packets are only meaningful to clients
            return Err(PacketDecodeError::InvalidHeader("version negotiation"));
        }
        if !version_supported(version) {
            return Err(PacketDecodeError::UnsupportedVersion {
                source: src_cid,
                destination: dst_cid,
            });
        }
        if first & FIXED_BIT == 0 {
            return Err(PacketDecodeError::InvalidHeader("fixed bit unset"));
        }
        let ty = match (first >> 4) & 0b11 {
            0b00 => PlainType::Initial,
            0b01 => PlainType::ZeroRtt,
            0b10 => PlainType::Handshake,
            _ => PlainType::Retry,
        };
        if ty == PlainType::Retry {
            return Err(PacketDecodeError::InvalidHeader("retry sent to a server"));
        }
        let token = if ty == PlainType::Initial {
            let token_len = buf.get_var()? as usize;
            if token_len > buf.remaining() {
                return Err(PacketDecodeError::InvalidHeader("token out of bounds"));
            }
            let start = buf.position() as usize;
            let token = Bytes::from(&buf.get_ref()[start..start + token_len]);
            buf.advance(token_len);
            token
        } else {
            Bytes::new()
        };
        let len = buf.get_var()? as usize;
        if len > buf.remaining() {
            return Err(PacketDecodeError::InvalidHeader("payload longer than packet"));
        }
        // Split off any coalesced packets that follow
        let rest = {
            let boundary = buf.position() as usize + len;
            let mut data = buf.into_inner();
            let rest = if data.len() > boundary {
                Some(data.split_off(boundary))
            } else {
                None
            };
            buf = Cursor::new(data);
            buf.advance(boundary - len);
            rest
        };
        Ok((
            PartialDecode {
                ty,
                dst_cid,
                src_cid,
                token,
                data: buf,
            },
            rest,
        ))
    }

    pub fn space(&self) -> SpaceId {
        match self.ty {
            PlainType::Initial => SpaceId::Initial,
            PlainType::Handshake => SpaceId::Handshake,
            _ => SpaceId::Data,
        }
    }

    pub fn is_initial(&self) -> bool {
        self.ty == PlainType::Initial
    }

    pub fn is_0rtt(&self) -> bool {
        self.ty == PlainType::ZeroRtt
    }

    pub fn has_long_header(&self) -> bool {
        self.ty != PlainType::Short
    }

    pub fn dst_cid(&self) -> ConnectionId {
        self.dst_cid
    }

    pub fn src_cid(&self) -> ConnectionId {
        self.src_cid
    }

    pub fn token(&self) -> &Bytes {
        &self.token
    }

    /// Remove header protection and decode the packet number
    ///
    /// `largest` is the largest packet number received in this packet's space, used to expand
    /// the truncated wire encoding.
    pub fn finish(
        self,
        header_key: &HeaderKey,
        largest: Option<u64>,
    ) -> Result<(Packet, u64), PacketDecodeError> {
        let PartialDecode {
            ty,
            dst_cid,
            src_cid,
            token,
            data,
        } = self;
        let pn_offset = data.position() as usize;
        let mut data = data.into_inner();
        if data.len() < pn_offset + SAMPLE_OFFSET + SAMPLE_SIZE {
            return Err(PacketDecodeError::InvalidHeader("packet too short to sample"));
        }
        let mut sample = [0; SAMPLE_SIZE];
        sample.copy_from_slice(&data[pn_offset + SAMPLE_OFFSET..pn_offset + SAMPLE_OFFSET + SAMPLE_SIZE]);
        let mask = header_key.mask(&sample);
        if ty == PlainType::Short {
            data[0] ^= mask[0] & 0x1f;
        } else {
            data[0] ^= mask[0] & 0x0f;
        }
        let first = data[0];
        let pn_len = (first & 0b11) as usize + 1;
        for (out, &m) in data[pn_offset..pn_offset + pn_len].iter_mut().zip(&mask[1..]) {
            *out ^= m;
        }
        let number = {
            let mut pn = Cursor::new(&data[pn_offset..pn_offset + pn_len]);
            PacketNumber::decode(pn_len, &mut pn)?
        };
        let header = match ty {
            PlainType::Initial => Header::Initial {
                dst_cid,
                src_cid,
                token,
                number,
            },
            PlainType::Handshake => Header::Long {
                ty: LongType::Handshake,
                dst_cid,
                src_cid,
                number,
            },
            PlainType::ZeroRtt => Header::Long {
                ty: LongType::ZeroRtt,
                dst_cid,
                src_cid,
                number,
            },
            PlainType::Short => Header::Short {
                dst_cid,
                number,
                key_phase: first & 0b100 != 0,
            },
            PlainType::Retry => unreachable!("rejected in PartialDecode::new"),
        };
        let header_len = pn_offset + pn_len;
        let payload = data.split_off(header_len);
        let number = number.expand(largest);
        Ok((
            Packet {
                header,
                header_data: data.freeze(),
                payload,
            },
            number,
        ))
    }

    fn get_cid<B: Buf>(buf: &mut B) -> Result<ConnectionId, PacketDecodeError> {
        let len = buf.get::<u8>()? as usize;
        if len > MAX_CID_SIZE {
            return Err(PacketDecodeError::InvalidHeader("connection id too long"));
        }
        if len > buf.remaining() {
            return Err(PacketDecodeError::InvalidHeader("connection id out of bounds"));
        }
        Ok(Self::get_cid_of(buf, len))
    }

    fn get_cid_of<B: Buf>(buf: &mut B, len: usize) -> ConnectionId {
        let mut bytes = [0; MAX_CID_SIZE];
        buf.copy_to_slice(&mut bytes[..len]);
        let mut cid = ConnectionId {
            len: len as u8,
            bytes: [0; MAX_CID_SIZE],
        };
        cid.bytes[..len].copy_from_slice(&bytes[..len]);
        cid
    }
}

/// Reserved bits of an unprotected first byte, which must be zero post-decryption
pub fn reserved_bits(first: u8) -> u8 {
    if first & LONG_HEADER_FORM == 0 {
        first & 0b0001_1000
    } else {
        first & 0b0000_1100
    }
}
