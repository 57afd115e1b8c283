//! The optional authenticated-encryption handshake and data-plane AEAD.
//!
//! [`kdf`] derives symmetric keys from passwords, [`cipher`] seals and
//! opens data-plane packets once a session goes live, and [`handshake`]
//! defines the wire payloads exchanged to get there. None of these modules
//! touch sockets; [`crate::session`] drives the actual exchange.

pub mod cipher;
pub mod handshake;
pub mod kdf;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use x25519_dalek::{EphemeralSecret, PublicKey};

pub use cipher::{Direction, NonceCounter, NonceGuard, SessionKey, KEY_LEN, MAC_LEN, NONCE_LEN};
pub use handshake::*;
pub use kdf::{derive_key, Argon2Params, SALT_LEN};

use crate::error::{CoreError, Result};

/// An ephemeral X25519 keypair generated fresh for a single handshake.
/// `EphemeralSecret` is consumed on use (`diffie_hellman`), matching the
/// "never reuse an ephemeral secret" invariant the crate enforces at the
/// type level.
pub struct EphemeralKeyPair {
    secret: EphemeralSecret,
    pub public: [u8; 32],
}

impl EphemeralKeyPair {
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret).to_bytes();
        Self { secret, public }
    }

    /// Consumes this keypair's secret half and the peer's public key to
    /// produce the shared secret.
    pub fn diffie_hellman(self, peer_public: &[u8; 32]) -> [u8; 32] {
        self.secret.diffie_hellman(&PublicKey::from(*peer_public)).to_bytes()
    }
}

/// A long-lived Ed25519 identity keypair, used only when the negotiated
/// auth algorithm is `SIGNATURE` for signature-based client authentication.
pub struct IdentityKeyPair {
    signing_key: SigningKey,
    pub verifying_key: [u8; 32],
}

impl IdentityKeyPair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key().to_bytes();
        Self { signing_key, verifying_key }
    }

    pub fn from_bytes(secret: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(secret);
        let verifying_key = signing_key.verifying_key().to_bytes();
        Self { signing_key, verifying_key }
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }
}

/// Verifies an Ed25519 signature against a known public key.
pub fn verify_signature(public_key: &[u8; 32], message: &[u8], signature: &[u8]) -> Result<()> {
    let verifying_key = VerifyingKey::from_bytes(public_key)
        .map_err(|e| CoreError::security(format!("malformed public key: {e}")))?;
    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| CoreError::security("signature must be 64 bytes"))?;
    let signature = Signature::from_bytes(&sig_bytes);
    verifying_key
        .verify(message, &signature)
        .map_err(|_| CoreError::security("signature verification failed"))
}

/// The algorithm suite agreed on during the handshake. Only one variant of
/// each category currently exists, but the struct keeps the negotiation
/// path generic in case a future cipher suite adds more.
#[derive(Debug, Clone, Copy)]
pub struct NegotiatedSuite {
    pub kex: handshake::KexAlgos,
    pub auth: handshake::AuthAlgos,
    pub cipher: handshake::CipherAlgos,
}

impl NegotiatedSuite {
    /// Picks the strongest mutually-supported algorithm in each category,
    /// or an error if the client offered nothing this server accepts.
    pub fn negotiate(offered: &handshake::CryptoCapabilitiesPayload, server_supports_auth: handshake::AuthAlgos) -> Result<Self> {
        if !offered.kex.contains(handshake::KexAlgos::X25519) {
            return Err(CoreError::security("client offered no supported key-exchange algorithm"));
        }
        if !offered.cipher.contains(handshake::CipherAlgos::XSALSA20_POLY1305) {
            return Err(CoreError::security("client offered no supported cipher"));
        }
        let auth = offered.auth & server_supports_auth;
        if auth.is_empty() && !server_supports_auth.is_empty() {
            return Err(CoreError::security("client offered no mutually supported auth method"));
        }
        Ok(Self { kex: handshake::KexAlgos::X25519, auth, cipher: handshake::CipherAlgos::XSALSA20_POLY1305 })
    }
}
