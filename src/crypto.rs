//! Packet protection and the handshake-provider interface.
//!
//! The TLS 1.3 stack lives outside this crate. It is driven through [`Session`]: the connection
//! feeds it contiguous CRYPTO-stream bytes per encryption level, and the session pushes its
//! output — handshake bytes to transmit, packet-protection secrets, the peer's transport
//! parameters — into a [`HandshakeSink`] that the connection drains synchronously after each
//! call. Everything below the secrets (key schedules, AEAD, header protection, key updates) is
//! implemented here.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockCipher, NewBlockCipher};
use aes::{Aes128, Aes256};
use bytes::{BigEndian, ByteOrder, BytesMut};
use ring::aead::{self, OpeningKey, SealingKey};
use ring::digest;
use ring::hkdf;
use ring::hmac::{self, SigningKey};

use packet::{ConnectionId, SAMPLE_SIZE};
use spaces::SpaceId;
use {Side, TransportError, RESET_TOKEN_SIZE};

pub const AEAD_TAG_SIZE: usize = 16;

/// One direction's secret for a single encryption level, as exported by the TLS stack
pub struct Secrets {
    pub local: Vec<u8>,
    pub remote: Vec<u8>,
}

/// Output staged by a [`Session`] for the connection to drain
///
/// Push-only by design: the session never re-enters the connection, it only appends here.
#[derive(Default)]
pub struct HandshakeSink {
    /// Handshake bytes to frame into CRYPTO frames at the given level, in order
    pub outgoing: Vec<(SpaceId, Vec<u8>)>,
    /// Packet-protection secrets that became available, in handshake order
    pub secrets: Vec<(SpaceId, Secrets)>,
    /// Early-data secret, if the client's 0-RTT was accepted. Keys are installed but packets
    /// at that level are not surfaced to the application.
    pub zero_rtt_secret: Option<Secrets>,
    /// The peer's raw transport parameters, once seen
    pub transport_parameters: Option<Vec<u8>>,
}

/// Handshake progression for one connection, implemented by an external TLS 1.3 stack
pub trait Session: Send {
    /// Feed contiguous CRYPTO bytes received at `space`, staging any output in `sink`
    ///
    /// A TLS alert is reported as `TransportError::crypto(alert)`.
    fn read_handshake(
        &mut self,
        space: SpaceId,
        data: &[u8],
        sink: &mut HandshakeSink,
    ) -> Result<(), TransportError>;

    /// Whether the handshake has yet to complete
    fn is_handshaking(&self) -> bool;

    /// The application protocol negotiated via ALPN, once the handshake completes
    fn alpn_protocol(&self) -> Option<&[u8]>;

    /// The server name indicated by the client, if any
    fn sni_hostname(&self) -> Option<&str> {
        None
    }
}

/// Constructor for [`Session`]s, supplied by the host
pub trait SessionFactory: Send + Sync {
    /// Begin a server-side session advertising `params` as the local transport parameters
    fn start_session(&self, params: &[u8]) -> Box<Session>;
}

/// Packet protection keys for a single encryption level and direction pair
pub struct Crypto {
    digest: &'static digest::Algorithm,
    aead: &'static aead::Algorithm,
    local_secret: Vec<u8>,
    remote_secret: Vec<u8>,
    local_iv: [u8; 12],
    remote_iv: [u8; 12],
    sealing_key: SealingKey,
    opening_key: OpeningKey,
    local_header: HeaderKey,
    remote_header: HeaderKey,
}

impl Crypto {
    /// Keys for Initial packets, derived from the client's destination CID
    pub fn new_initial(id: &ConnectionId, side: Side) -> Self {
        let initial_secret = hkdf::extract(&INITIAL_SALT_KEY, id);
        let client = expand_label(&initial_secret, b"client in", digest::SHA256.output_len);
        let server = expand_label(&initial_secret, b"server in", digest::SHA256.output_len);
        let (local, remote) = match side {
            Side::Client => (client, server),
            Side::Server => (server, client),
        };
        Self::new(Secrets {
            local,
            remote,
        }).expect("initial secrets are well-formed by construction")
    }

    /// Keys from TLS-exported secrets; the cipher suite is implied by the hash length
    pub fn new(secrets: Secrets) -> Result<Self, TransportError> {
        let Secrets { local, remote } = secrets;
        if local.len() != remote.len() {
            return Err(TransportError::PROTOCOL_VIOLATION);
        }
        let (digest, aead) = match local.len() {
            32 => (&digest::SHA256, &aead::AES_128_GCM),
            48 => (&digest::SHA384, &aead::AES_256_GCM),
            // ChaCha20 suites are not wired up
            _ => return Err(TransportError::crypto(HANDSHAKE_FAILURE_ALERT)),
        };
        let (local_key, local_iv, local_hp) = key_material(digest, aead, &local);
        let (remote_key, remote_iv, remote_hp) = key_material(digest, aead, &remote);
        Ok(Crypto {
            digest,
            aead,
            sealing_key: SealingKey::new(aead, &local_key)
                .expect("key length fixed by algorithm"),
            opening_key: OpeningKey::new(aead, &remote_key)
                .expect("key length fixed by algorithm"),
            local_secret: local,
            remote_secret: remote,
            local_iv,
            remote_iv,
            local_header: local_hp,
            remote_header: remote_hp,
        })
    }

    /// The next key generation, for key-phase rotation. Header keys are unchanged.
    pub fn update(&self) -> Self {
        let local = expand_label(
            &SigningKey::new(self.digest, &self.local_secret),
            b"quic ku",
            self.digest.output_len,
        );
        let remote = expand_label(
            &SigningKey::new(self.digest, &self.remote_secret),
            b"quic ku",
            self.digest.output_len,
        );
        let (local_key, local_iv, _) = key_material(self.digest, self.aead, &local);
        let (remote_key, remote_iv, _) = key_material(self.digest, self.aead, &remote);
        Crypto {
            digest: self.digest,
            aead: self.aead,
            sealing_key: SealingKey::new(self.aead, &local_key).unwrap(),
            opening_key: OpeningKey::new(self.aead, &remote_key).unwrap(),
            local_secret: local,
            remote_secret: remote,
            local_iv,
            remote_iv,
            local_header: self.local_header.clone(),
            remote_header: self.remote_header.clone(),
        }
    }

    /// Seal `buf[header_len..]` in place, appending the AEAD tag
    pub fn encrypt(&self, number: u64, buf: &mut Vec<u8>, header_len: usize) {
        let nonce = nonce_for(number, &self.local_iv);
        let tag_start = buf.len();
        buf.resize(tag_start + AEAD_TAG_SIZE, 0);
        let (header, payload) = buf.split_at_mut(header_len);
        let len = aead::seal_in_place(&self.sealing_key, &nonce, header, payload, AEAD_TAG_SIZE)
            .expect("packet payload always fits the AEAD's limits");
        debug_assert_eq!(len, payload.len());
    }

    /// Open `payload` in place, trimming the tag on success
    pub fn decrypt(&self, number: u64, header: &[u8], payload: &mut BytesMut) -> Result<(), ()> {
        if payload.len() < AEAD_TAG_SIZE {
            return Err(());
        }
        let nonce = nonce_for(number, &self.remote_iv);
        let plain_len = {
            let plain = aead::open_in_place(&self.opening_key, &nonce, header, 0, payload.as_mut())
                .map_err(|_| ())?;
            plain.len()
        };
        payload.truncate(plain_len);
        Ok(())
    }

    pub fn header_encrypt_key(&self) -> &HeaderKey {
        &self.local_header
    }

    pub fn header_decrypt_key(&self) -> &HeaderKey {
        &self.remote_header
    }

    #[cfg(test)]
    fn local_secret(&self) -> &[u8] {
        &self.local_secret
    }
}

fn nonce_for(number: u64, iv: &[u8; 12]) -> [u8; 12] {
    let mut nonce = [0; 12];
    BigEndian::write_u64(&mut nonce[4..], number);
    for (b, &x) in nonce.iter_mut().zip(iv.iter()) {
        *b ^= x;
    }
    nonce
}

fn key_material(
    digest: &'static digest::Algorithm,
    aead: &'static aead::Algorithm,
    secret: &[u8],
) -> (Vec<u8>, [u8; 12], HeaderKey) {
    let prk = SigningKey::new(digest, secret);
    let key = expand_label(&prk, b"quic key", aead.key_len());
    let mut iv = [0; 12];
    iv.copy_from_slice(&expand_label(&prk, b"quic iv", 12));
    let hp = HeaderKey::from_expanded(&expand_label(&prk, b"quic hp", aead.key_len()));
    (key, iv, hp)
}

/// HKDF-Expand-Label from TLS 1.3, with an empty context
fn expand_label(prk: &SigningKey, label: &[u8], len: usize) -> Vec<u8> {
    debug_assert!(len <= u16::max_value() as usize);
    let mut info = Vec::with_capacity(2 + 1 + 6 + label.len() + 1);
    info.push((len >> 8) as u8);
    info.push(len as u8);
    info.push(6 + label.len() as u8);
    info.extend_from_slice(b"tls13 ");
    info.extend_from_slice(label);
    info.push(0);
    let mut out = vec![0; len];
    hkdf::expand(prk, &info, &mut out);
    out
}

/// Header protection key: AES-ECB over a ciphertext sample yields a 5-byte mask
#[derive(Clone)]
pub enum HeaderKey {
    Aes128([u8; 16]),
    Aes256([u8; 32]),
}

impl HeaderKey {
    fn from_expanded(key: &[u8]) -> Self {
        match key.len() {
            16 => {
                let mut x = [0; 16];
                x.copy_from_slice(key);
                HeaderKey::Aes128(x)
            }
            32 => {
                let mut x = [0; 32];
                x.copy_from_slice(key);
                HeaderKey::Aes256(x)
            }
            _ => unreachable!("hp key length matches the AEAD key length"),
        }
    }

    pub fn mask(&self, sample: &[u8; SAMPLE_SIZE]) -> [u8; 5] {
        let mut block = GenericArray::clone_from_slice(sample);
        match *self {
            HeaderKey::Aes128(ref key) => {
                Aes128::new(GenericArray::from_slice(key)).encrypt_block(&mut block);
            }
            HeaderKey::Aes256(ref key) => {
                Aes256::new(GenericArray::from_slice(key)).encrypt_block(&mut block);
            }
        }
        let mut mask = [0; 5];
        mask.copy_from_slice(&block[..5]);
        mask
    }
}

/// Stateless-reset token for a connection ID, derived under the endpoint's reset key
pub fn reset_token_for(key: &SigningKey, id: &ConnectionId) -> [u8; RESET_TOKEN_SIZE] {
    let signature = hmac::sign(key, id);
    let mut result = [0; RESET_TOKEN_SIZE];
    result.copy_from_slice(&signature.as_ref()[..RESET_TOKEN_SIZE]);
    result
}

/// The integrity tag appended to Retry packets
pub fn retry_tag(odcid: &ConnectionId, packet: &[u8]) -> [u8; AEAD_TAG_SIZE] {
    let key = SealingKey::new(&aead::AES_128_GCM, &RETRY_KEY).unwrap();
    let mut pseudo = Vec::with_capacity(1 + odcid.len() + packet.len());
    pseudo.push(odcid.len() as u8);
    pseudo.extend_from_slice(odcid);
    pseudo.extend_from_slice(packet);
    let mut tag = [0; AEAD_TAG_SIZE];
    let len = aead::seal_in_place(&key, &RETRY_NONCE, &pseudo, &mut tag, AEAD_TAG_SIZE).unwrap();
    debug_assert_eq!(len, AEAD_TAG_SIZE);
    tag
}

const INITIAL_SALT: [u8; 20] = [
    0x38, 0x76, 0x2c, 0xf7, 0xf5, 0x59, 0x34, 0xb3, 0x4d, 0x17, 0x9a, 0xe6, 0xa4, 0xc8, 0x0c,
    0xad, 0xcc, 0xbb, 0x7f, 0x0a,
];
const RETRY_KEY: [u8; 16] = [
    0xbe, 0x0c, 0x69, 0x0b, 0x9f, 0x66, 0x57, 0x5a, 0x1d, 0x76, 0x6b, 0x54, 0xe3, 0x68, 0xc8,
    0x4e,
];
const RETRY_NONCE: [u8; 12] = [
    0x46, 0x15, 0x99, 0xd3, 0x5d, 0x63, 0x2b, 0xf2, 0x23, 0x98, 0x25, 0xbb,
];
const HANDSHAKE_FAILURE_ALERT: u8 = 40;

lazy_static! {
    static ref INITIAL_SALT_KEY: SigningKey = SigningKey::new(&digest::SHA256, &INITIAL_SALT);
}
