//! Handshake payload layouts and pure helper logic.
//!
//! The actual state transitions driven by these payloads live in
//! [`crate::session`] (component D); this module only knows how to encode,
//! decode, and validate the bytes that cross the wire during the
//! handshake, plus the HMAC challenge-response check.

use crate::error::{CoreError, Result};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct KexAlgos: u8 { const X25519 = 0x01; }
}
bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AuthAlgos: u8 {
        const NONE      = 0x00;
        const PASSWORD  = 0x01;
        const PRESHARED = 0x02;
        const SIGNATURE = 0x04;
    }
}
bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CipherAlgos: u8 { const XSALSA20_POLY1305 = 0x01; }
}

fn need(buf: &[u8], n: usize, what: &str) -> Result<()> {
    if buf.len() < n {
        Err(CoreError::protocol(format!("truncated {what}")))
    } else {
        Ok(())
    }
}

/// Step 1: protocol version exchange.
pub struct ProtocolVersionPayload {
    pub major: u8,
    pub minor: u8,
    pub supports_encryption: bool,
    pub compression_algos_bitmap: u8,
    pub compression_threshold_pct: u8,
    pub feature_flags: u32,
}

impl ProtocolVersionPayload {
    pub const LEN: usize = 1 + 1 + 1 + 1 + 1 + 4;

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.major);
        out.push(self.minor);
        out.push(self.supports_encryption as u8);
        out.push(self.compression_algos_bitmap);
        out.push(self.compression_threshold_pct);
        out.extend_from_slice(&self.feature_flags.to_be_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        need(buf, Self::LEN, "PROTOCOL_VERSION")?;
        Ok(Self {
            major: buf[0],
            minor: buf[1],
            supports_encryption: buf[2] != 0,
            compression_algos_bitmap: buf[3],
            compression_threshold_pct: buf[4],
            feature_flags: u32::from_be_bytes(buf[5..9].try_into().unwrap()),
        })
    }
}

/// Current mandatory protocol major version; a mismatch is fatal.
pub const PROTOCOL_MAJOR: u8 = 1;
pub const PROTOCOL_MINOR: u8 = 0;

/// Step 2 (client -> server): advertised algorithm bitmaps.
pub struct CryptoCapabilitiesPayload {
    pub kex: KexAlgos,
    pub auth: AuthAlgos,
    pub cipher: CipherAlgos,
}

impl CryptoCapabilitiesPayload {
    pub const LEN: usize = 3;
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.kex.bits());
        out.push(self.auth.bits());
        out.push(self.cipher.bits());
    }
    pub fn decode(buf: &[u8]) -> Result<Self> {
        need(buf, Self::LEN, "CRYPTO_CAPABILITIES")?;
        Ok(Self {
            kex: KexAlgos::from_bits_truncate(buf[0]),
            auth: AuthAlgos::from_bits_truncate(buf[1]),
            cipher: CipherAlgos::from_bits_truncate(buf[2]),
        })
    }
}

/// Step 2 (server -> client): the selected suite plus the argon2id
/// parameters both peers will use to derive the symmetric key.
pub struct CryptoParametersPayload {
    pub kex: KexAlgos,
    pub auth: AuthAlgos,
    pub cipher: CipherAlgos,
    pub public_key_size: u16,
    pub signature_size: u16,
    pub shared_secret_size: u16,
    pub nonce_size: u16,
    pub mac_size: u16,
    pub hmac_size: u16,
    pub argon2_m_cost_kib: u32,
    pub argon2_t_cost: u32,
    pub argon2_p_cost: u32,
    pub salt: [u8; crate::crypto::kdf::SALT_LEN],
}

impl CryptoParametersPayload {
    pub const LEN: usize = 3 + 2 * 6 + 4 * 3 + crate::crypto::kdf::SALT_LEN;

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.kex.bits());
        out.push(self.auth.bits());
        out.push(self.cipher.bits());
        out.extend_from_slice(&self.public_key_size.to_be_bytes());
        out.extend_from_slice(&self.signature_size.to_be_bytes());
        out.extend_from_slice(&self.shared_secret_size.to_be_bytes());
        out.extend_from_slice(&self.nonce_size.to_be_bytes());
        out.extend_from_slice(&self.mac_size.to_be_bytes());
        out.extend_from_slice(&self.hmac_size.to_be_bytes());
        out.extend_from_slice(&self.argon2_m_cost_kib.to_be_bytes());
        out.extend_from_slice(&self.argon2_t_cost.to_be_bytes());
        out.extend_from_slice(&self.argon2_p_cost.to_be_bytes());
        out.extend_from_slice(&self.salt);
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        need(buf, Self::LEN, "CRYPTO_PARAMETERS")?;
        let mut i = 0;
        let kex = KexAlgos::from_bits_truncate(buf[i]);
        i += 1;
        let auth = AuthAlgos::from_bits_truncate(buf[i]);
        i += 1;
        let cipher = CipherAlgos::from_bits_truncate(buf[i]);
        i += 1;
        macro_rules! u16_field {
            () => {{
                let v = u16::from_be_bytes(buf[i..i + 2].try_into().unwrap());
                i += 2;
                v
            }};
        }
        let public_key_size = u16_field!();
        let signature_size = u16_field!();
        let shared_secret_size = u16_field!();
        let nonce_size = u16_field!();
        let mac_size = u16_field!();
        let hmac_size = u16_field!();
        macro_rules! u32_field {
            () => {{
                let v = u32::from_be_bytes(buf[i..i + 4].try_into().unwrap());
                i += 4;
                v
            }};
        }
        let argon2_m_cost_kib = u32_field!();
        let argon2_t_cost = u32_field!();
        let argon2_p_cost = u32_field!();
        let mut salt = [0u8; crate::crypto::kdf::SALT_LEN];
        salt.copy_from_slice(&buf[i..i + crate::crypto::kdf::SALT_LEN]);
        Ok(Self {
            kex,
            auth,
            cipher,
            public_key_size,
            signature_size,
            shared_secret_size,
            nonce_size,
            mac_size,
            hmac_size,
            argon2_m_cost_kib,
            argon2_t_cost,
            argon2_p_cost,
            salt,
        })
    }
}

/// Step 3: ephemeral X25519 public key, sent by both peers.
pub struct KeyExchangePayload {
    pub public_key: [u8; 32],
}

impl KeyExchangePayload {
    pub const LEN: usize = 32;
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.public_key);
    }
    pub fn decode(buf: &[u8]) -> Result<Self> {
        need(buf, Self::LEN, "KEY_EXCHANGE")?;
        let mut public_key = [0u8; 32];
        public_key.copy_from_slice(&buf[..32]);
        Ok(Self { public_key })
    }
}

/// Step 4: server -> client 32-byte nonce the responder must HMAC.
pub struct AuthChallengePayload {
    pub nonce: [u8; 32],
}

impl AuthChallengePayload {
    pub const LEN: usize = 32;
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.nonce);
    }
    pub fn decode(buf: &[u8]) -> Result<Self> {
        need(buf, Self::LEN, "AUTH_CHALLENGE")?;
        let mut nonce = [0u8; 32];
        nonce.copy_from_slice(&buf[..32]);
        Ok(Self { nonce })
    }
}

/// Step 4: HMAC-SHA-256(challenge) keyed on the password-derived key (or
/// shared secret, or a signature — this payload carries whichever the
/// negotiated `auth` algorithm selected).
pub struct AuthResponsePayload {
    pub proof: Vec<u8>, // 32-byte HMAC, or a 64-byte Ed25519 signature
}

impl AuthResponsePayload {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.proof.len() as u8);
        out.extend_from_slice(&self.proof);
    }
    pub fn decode(buf: &[u8]) -> Result<Self> {
        need(buf, 1, "AUTH_RESPONSE")?;
        let len = buf[0] as usize;
        need(buf, 1 + len, "AUTH_RESPONSE proof")?;
        Ok(Self { proof: buf[1..1 + len].to_vec() })
    }
}

pub type ServerAuthResponsePayload = AuthResponsePayload;

/// Step 4 failure: `AUTH_FAILED` reason bitmask.
pub struct AuthFailedPayload {
    pub reason: crate::packet::AuthFailReason,
}

impl AuthFailedPayload {
    pub const LEN: usize = 4;
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.reason.bits().to_be_bytes());
    }
    pub fn decode(buf: &[u8]) -> Result<Self> {
        need(buf, Self::LEN, "AUTH_FAILED")?;
        Ok(Self { reason: crate::packet::AuthFailReason::from_bits_truncate(u32::from_be_bytes(buf[0..4].try_into().unwrap())) })
    }
}

/// HMAC-SHA-256 over `challenge`, keyed on `key`.
pub fn hmac_challenge(key: &[u8], challenge: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(challenge);
    mac.finalize().into_bytes().to_vec()
}

/// Constant-time comparison of the client's claimed proof against the
/// expected HMAC.
pub fn verify_hmac_proof(key: &[u8], challenge: &[u8], proof: &[u8]) -> bool {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(challenge);
    mac.verify_slice(proof).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crypto_parameters_round_trip() {
        let p = CryptoParametersPayload {
            kex: KexAlgos::X25519,
            auth: AuthAlgos::PASSWORD,
            cipher: CipherAlgos::XSALSA20_POLY1305,
            public_key_size: 32,
            signature_size: 64,
            shared_secret_size: 32,
            nonce_size: 24,
            mac_size: 16,
            hmac_size: 32,
            argon2_m_cost_kib: 19 * 1024,
            argon2_t_cost: 2,
            argon2_p_cost: 1,
            salt: [5u8; crate::crypto::kdf::SALT_LEN],
        };
        let mut buf = Vec::new();
        p.encode(&mut buf);
        let decoded = CryptoParametersPayload::decode(&buf).unwrap();
        assert_eq!(decoded.kex, KexAlgos::X25519);
        assert_eq!(decoded.argon2_t_cost, 2);
        assert_eq!(decoded.salt, [5u8; crate::crypto::kdf::SALT_LEN]);
    }

    #[test]
    fn correct_hmac_verifies_incorrect_does_not() {
        let key = b"a password derived key material";
        let challenge = b"0123456789012345678901234567890";
        let proof = hmac_challenge(key, challenge);
        assert!(verify_hmac_proof(key, challenge, &proof));
        let mut bad = proof.clone();
        bad[0] ^= 1;
        assert!(!verify_hmac_proof(key, challenge, &bad));
    }
}
