//! Server-wide handshake policy resolved once at startup from
//! [`crate::config::ServerConfig`] plus a [`crate::config::KeyResolver`].
//! Each [`super::Session`] holds an `Arc` to one of these; none of it is
//! mutated after the server starts listening.

use crate::config::{EncryptionPolicy, KeyMaterial, ServerConfig};
use crate::crypto::{handshake::AuthAlgos, kdf, IdentityKeyPair};
use crate::error::Result;

pub struct HandshakePolicy {
    pub encryption_policy: EncryptionPolicy,
    pub auth_algos: AuthAlgos,
    /// Pre-derived from the configured password using a fixed per-server
    /// salt, so every connecting client derives the same key without an
    /// extra round trip to exchange the salt out of band (the salt itself
    /// still travels in `CRYPTO_PARAMETERS`).
    pub password_key: Option<[u8; 32]>,
    pub salt: [u8; kdf::SALT_LEN],
    pub argon2_params: kdf::Argon2Params,
    pub allowed_client_keys: Option<Vec<[u8; 32]>>,
    pub server_identity: Option<IdentityKeyPair>,
}

impl HandshakePolicy {
    pub fn from_config(config: &ServerConfig, resolver: &dyn crate::config::KeyResolver) -> Result<Self> {
        let argon2_params = kdf::Argon2Params::default();
        let mut salt = [0u8; kdf::SALT_LEN];
        rand::Rng::fill(&mut rand::thread_rng(), &mut salt);

        let mut auth_algos = AuthAlgos::NONE;
        let mut password_key = None;
        let mut server_identity = None;
        let mut allowed_client_keys = None;

        match &config.key_material {
            None => {}
            Some(KeyMaterial::Password(password)) => {
                password_key = Some(kdf::derive_key(password, &salt, argon2_params)?);
                auth_algos |= AuthAlgos::PASSWORD;
            }
            Some(KeyMaterial::PrivateKeyFile(path)) => {
                let resolved = resolver.resolve(&path.to_string_lossy())?;
                if let Some(secret) = resolved.private_key {
                    server_identity = Some(IdentityKeyPair::from_bytes(&secret));
                    auth_algos |= AuthAlgos::SIGNATURE;
                }
                if !resolved.public_keys.is_empty() {
                    allowed_client_keys = Some(resolved.public_keys);
                }
            }
            Some(KeyMaterial::Resolver(selector)) => {
                let resolved = resolver.resolve(selector)?;
                if let Some(secret) = resolved.private_key {
                    server_identity = Some(IdentityKeyPair::from_bytes(&secret));
                    auth_algos |= AuthAlgos::SIGNATURE;
                }
                if !resolved.public_keys.is_empty() {
                    allowed_client_keys = Some(resolved.public_keys);
                }
            }
        }

        if let Some(path) = &config.allowed_client_keys {
            let resolved = resolver.resolve(&path.to_string_lossy())?;
            if !resolved.public_keys.is_empty() {
                let mut keys = allowed_client_keys.take().unwrap_or_default();
                keys.extend(resolved.public_keys);
                allowed_client_keys = Some(keys);
                auth_algos |= AuthAlgos::SIGNATURE;
            }
        }

        Ok(Self {
            encryption_policy: config.encryption_policy,
            auth_algos,
            password_key,
            salt,
            argon2_params,
            allowed_client_keys,
            server_identity,
        })
    }

    pub fn requires_encryption(&self) -> bool {
        matches!(self.encryption_policy, EncryptionPolicy::Required)
    }

    pub fn requires_auth(&self) -> bool {
        !self.auth_algos.is_empty()
    }
}
