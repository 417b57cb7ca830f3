//! Address-validation tokens carried in Retry packets and NEW_TOKEN frames.
//!
//! A token binds the peer's address to its moment of issue: a fresh 16-byte IV followed by
//! AES-256-CBC over the peer's IP octets and a millisecond timestamp. Validation decrypts
//! under the same endpoint-scoped key, compares the address, and bounds the token's age.

use std::net::SocketAddrV6;

use aes::Aes256;
use block_modes::block_padding::Pkcs7;
use block_modes::{BlockMode, Cbc};
use bytes::{BigEndian, ByteOrder};
use rand::Rng;

type Aes256Cbc = Cbc<Aes256, Pkcs7>;

const IV_SIZE: usize = 16;
const PLAIN_SIZE: usize = 16 + 8; // ip octets, timestamp

/// Key for minting and validating address-validation tokens
pub struct TokenKey([u8; 32]);

impl TokenKey {
    pub fn new(key: [u8; 32]) -> Self {
        TokenKey(key)
    }

    pub fn generate<R: Rng>(
        &self,
        rng: &mut R,
        address: &SocketAddrV6,
        issued_ms: u64,
    ) -> Vec<u8> {
        let mut iv = [0; IV_SIZE];
        rng.fill_bytes(&mut iv);
        let mut plain = [0; PLAIN_SIZE];
        plain[..16].copy_from_slice(&address.ip().octets());
        BigEndian::write_u64(&mut plain[16..], issued_ms);
        let cipher =
            Aes256Cbc::new_var(&self.0, &iv).expect("key and iv lengths are fixed");
        let sealed = cipher.encrypt_vec(&plain);
        let mut token = Vec::with_capacity(IV_SIZE + sealed.len());
        token.extend_from_slice(&iv);
        token.extend_from_slice(&sealed);
        token
    }

    /// Whether `token` was issued by us for `address` within the last `lifetime_ms`
    pub fn check(
        &self,
        address: &SocketAddrV6,
        token: &[u8],
        now_ms: u64,
        lifetime_ms: u64,
    ) -> bool {
        if token.len() <= IV_SIZE {
            return false;
        }
        let cipher = Aes256Cbc::new_var(&self.0, &token[..IV_SIZE])
            .expect("key and iv lengths are fixed");
        let plain = match cipher.decrypt_vec(&token[IV_SIZE..]) {
            Ok(x) => x,
            Err(_) => {
                return false;
            }
        };
        if plain.len() != PLAIN_SIZE || plain[..16] != address.ip().octets() {
            return false;
        }
        let issued = BigEndian::read_u64(&plain[16..]);
        now_ms
            .checked_sub(issued)
            .map_or(false, |age| age <= lifetime_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    use rand::rngs::OsRng;

    fn addr(a: u16) -> SocketAddrV6 {
        SocketAddrV6::new(Ipv6Addr::new(0, 0, 0, 0, 0, 0xffff, 0xc0a8, a), 4433, 0, 0)
    }

    #[test]
    fn round_trip() {
        let mut rng = OsRng::new().unwrap();
        let key = TokenKey::new([0x42; 32]);
        let token = key.generate(&mut rng, &addr(1), 10_000);
        assert!(key.check(&addr(1), &token, 10_500, 1000));
    }

    #[test]
    fn wrong_address_rejected() {
        let mut rng = OsRng::new().unwrap();
        let key = TokenKey::new([0x42; 32]);
        let token = key.generate(&mut rng, &addr(1), 10_000);
        assert!(!key.check(&addr(2), &token, 10_500, 1000));
    }

    #[test]
    fn expired_rejected() {
        let mut rng = OsRng::new().unwrap();
        let key = TokenKey::new([0x42; 32]);
        let token = key.generate(&mut rng, &addr(1), 10_000);
        assert!(!key.check(&addr(1), &token, 12_000, 1000));
        // Tokens from the future are likewise invalid
        assert!(!key.check(&addr(1), &token, 9_000, 1000));
    }

    #[test]
    fn garbage_rejected() {
        let mut rng = OsRng::new().unwrap();
        let key = TokenKey::new([0x42; 32]);
        let mut token = key.generate(&mut rng, &addr(1), 10_000);
        assert!(!key.check(&addr(1), &token[..IV_SIZE], 10_500, 1000));
        let last = token.len() - 1;
        token[last] ^= 1;
        assert!(!key.check(&addr(1), &token, 10_500, 1000));
        // A token minted under a different key never validates
        let other = TokenKey::new([0x43; 32]);
        let token = key.generate(&mut rng, &addr(1), 10_000);
        assert!(!other.check(&addr(1), &token, 10_500, 1000));
    }
}
