//! AEAD sealing of data-plane packets.
//!
//! Cipher: XSalsa20-Poly1305 via the dedicated `xsalsa20poly1305` crate
//! (not `chacha20poly1305`'s XChaCha20 variant; see DESIGN.md for the
//! reasoning behind that choice).
//!
//! Nonce discipline: each direction (client->server, server->client) owns
//! an independent strictly-monotonic counter. The first byte of the
//! 24-byte nonce is a direction tag so the two counter spaces can never
//! collide even though both directions share one derived key.

use crate::error::{CoreError, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use xsalsa20poly1305::aead::{Aead, KeyInit, Payload};
use xsalsa20poly1305::{Nonce, XSalsa20Poly1305};

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 24;
pub const MAC_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToServer = 0,
    ServerToClient = 1,
}

/// Per-direction send-half of a session's crypto state: owns the monotonic
/// nonce counter. Cheap to clone a handle to (the counter is shared via the
/// `Arc` the caller wraps this in) so inbound/outbound tasks can each hold
/// one.
pub struct NonceCounter {
    direction: Direction,
    counter: AtomicU64,
}

impl NonceCounter {
    pub fn new(direction: Direction) -> Self {
        Self { direction, counter: AtomicU64::new(0) }
    }

    /// Allocates the next nonce for this direction. Never reused: the
    /// counter only increments.
    pub fn next_nonce(&self) -> [u8; NONCE_LEN] {
        let value = self.counter.fetch_add(1, Ordering::Relaxed);
        let mut nonce = [0u8; NONCE_LEN];
        nonce[0] = self.direction as u8;
        nonce[1..9].copy_from_slice(&value.to_be_bytes());
        nonce
    }
}

/// Receive-side nonce replay guard: a direction's counter is accepted only
/// if it is strictly greater than every counter previously accepted on
/// that direction. This is sufficient (not just necessary) to guarantee no
/// two accepted nonces for a direction are ever equal.
#[derive(Default)]
pub struct NonceGuard {
    last_accepted: Option<u64>,
}

impl NonceGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the counter embedded in `nonce` if it is fresh, or a
    /// `SecurityError` if it reuses or goes backwards.
    pub fn check_and_advance(&mut self, nonce: &[u8; NONCE_LEN]) -> Result<()> {
        let value = u64::from_be_bytes(nonce[1..9].try_into().unwrap());
        if let Some(last) = self.last_accepted {
            if value <= last {
                return Err(CoreError::security("nonce reuse or replay detected"));
            }
        }
        self.last_accepted = Some(value);
        Ok(())
    }
}

#[derive(Clone)]
pub struct SessionKey {
    key: [u8; KEY_LEN],
}

impl SessionKey {
    pub fn new(key: [u8; KEY_LEN]) -> Self {
        Self { key }
    }

    /// Derives the data-plane key by hashing `shared_secret || context_label`.
    pub fn from_shared_secret(shared_secret: &[u8; 32], context_label: &[u8]) -> Self {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(shared_secret);
        hasher.update(context_label);
        let digest = hasher.finalize();
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&digest[..KEY_LEN]);
        Self { key }
    }

    fn cipher(&self) -> XSalsa20Poly1305 {
        XSalsa20Poly1305::new((&self.key).into())
    }

    /// Seals `plaintext` (an encoded inner packet: header + payload) and
    /// returns `ciphertext || mac`. The caller prepends the nonce on the
    /// wire per the `ENCRYPTED` envelope layout.
    pub fn seal(&self, nonce: &[u8; NONCE_LEN], plaintext: &[u8]) -> Result<Vec<u8>> {
        self.cipher()
            .encrypt(Nonce::from_slice(nonce), Payload { msg: plaintext, aad: &[] })
            .map_err(|_| CoreError::security("AEAD seal failure"))
    }

    /// Opens `ciphertext_and_mac` (`ciphertext || mac`) using `nonce`.
    pub fn open(&self, nonce: &[u8; NONCE_LEN], ciphertext_and_mac: &[u8]) -> Result<Vec<u8>> {
        self.cipher()
            .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext_and_mac, aad: &[] })
            .map_err(|_| CoreError::security("AEAD open failure"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_then_open_round_trips() {
        let key = SessionKey::new([9u8; KEY_LEN]);
        let counter = NonceCounter::new(Direction::ClientToServer);
        let nonce = counter.next_nonce();
        let ct = key.seal(&nonce, b"hello").unwrap();
        let pt = key.open(&nonce, &ct).unwrap();
        assert_eq!(pt, b"hello");
    }

    #[test]
    fn nonce_counter_never_repeats_within_a_session() {
        // I-NONCE-UNIQUENESS
        let counter = NonceCounter::new(Direction::ServerToClient);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            let n = counter.next_nonce();
            assert!(seen.insert(n), "nonce repeated");
        }
    }

    #[test]
    fn directions_never_collide() {
        let c2s = NonceCounter::new(Direction::ClientToServer);
        let s2c = NonceCounter::new(Direction::ServerToClient);
        for _ in 0..100 {
            assert_ne!(c2s.next_nonce(), s2c.next_nonce());
        }
    }

    #[test]
    fn replayed_nonce_is_rejected() {
        let mut guard = NonceGuard::new();
        let counter = NonceCounter::new(Direction::ClientToServer);
        let n1 = counter.next_nonce();
        let n2 = counter.next_nonce();
        guard.check_and_advance(&n1).unwrap();
        guard.check_and_advance(&n2).unwrap();
        assert!(guard.check_and_advance(&n1).is_err());
    }

    #[test]
    fn tampered_ciphertext_fails_to_open() {
        let key = SessionKey::new([3u8; KEY_LEN]);
        let counter = NonceCounter::new(Direction::ClientToServer);
        let nonce = counter.next_nonce();
        let mut ct = key.seal(&nonce, b"payload bytes").unwrap();
        let last = ct.len() - 1;
        ct[last] ^= 0xFF;
        assert!(key.open(&nonce, &ct).is_err());
    }
}
