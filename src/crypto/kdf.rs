//! Password -> symmetric key derivation. Uses argon2id — memory-hard,
//! deterministic across peers given the same password and salt — with
//! parameters published to the peer in the crypto-parameters packet so
//! both sides agree on the cost factors (see DESIGN.md).

use crate::error::{CoreError, Result};
use argon2::{Algorithm, Argon2, Params, Version};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Argon2Params {
    pub m_cost_kib: u32,
    pub t_cost: u32,
    pub p_cost: u32,
}

impl Default for Argon2Params {
    /// Conservative interactive-login parameters; OWASP-recommended floor
    /// for argon2id as of this writing.
    fn default() -> Self {
        Self { m_cost_kib: 19 * 1024, t_cost: 2, p_cost: 1 }
    }
}

pub const SALT_LEN: usize = 16;

/// Derives a 32-byte symmetric key from `password` and `salt` using
/// argon2id. Deterministic: same inputs always produce the same key, which
/// is what lets both peers derive the data-plane key independently.
pub fn derive_key(password: &str, salt: &[u8; SALT_LEN], params: Argon2Params) -> Result<[u8; 32]> {
    let argon2_params = Params::new(params.m_cost_kib, params.t_cost, params.p_cost, Some(32))
        .map_err(|e| CoreError::config(format!("invalid argon2 params: {e}")))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params);
    let mut out = [0u8; 32];
    argon2
        .hash_password_into(password.as_bytes(), salt, &mut out)
        .map_err(|e| CoreError::security(format!("key derivation failed: {e}")))?;
    Ok(out)
}
