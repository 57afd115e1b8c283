//! Server configuration surface.
//!
//! Everything in this module is data the core *reads*; parsing it out of CLI
//! args or a TOML file is an external collaborator's job. Tests and the
//! binary both just construct a [`ServerConfig`] directly.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;

/// Palette selector advertised by a client / configured server-wide default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PaletteSelector {
    Standard,
    Blocks,
    Digital,
    Minimal,
    Cool,
    Custom,
}

impl PaletteSelector {
    /// The built-in glyph ramps, light -> dark. `Custom` has no built-in
    /// string; callers must supply one via `ServerConfig::custom_palette`.
    pub fn builtin_ramp(self) -> Option<&'static str> {
        match self {
            PaletteSelector::Standard => Some(" .:-=+*#%@"),
            PaletteSelector::Blocks => Some(" ░▒▓█"),
            PaletteSelector::Digital => Some(" .'`,:;\"~^-_+<>i!lI?/\\|()1{}[]rcvunxzjftLCJUYXZO0Qoahkbdpqwm*WMB8&%$#@"),
            PaletteSelector::Minimal => Some(" .*#"),
            PaletteSelector::Cool => Some(" ·:+*%#@"),
            PaletteSelector::Custom => None,
        }
    }
}

/// Whether the server requires, permits, or rejects encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionPolicy {
    Off,
    OptIn,
    Required,
}

/// One of the three ways the operator may supply key material.
/// The `Resolver` variant is resolved externally via [`KeyResolver`]; the
/// core does not know how to fetch a `github:user` / `gpg:keyid` style
/// selector itself.
#[derive(Debug, Clone)]
pub enum KeyMaterial {
    Password(String),
    PrivateKeyFile(PathBuf),
    Resolver(String),
}

/// Resolved key material: an optional long-term private key (for signing
/// auth responses) and a list of public keys this party is willing to
/// present or accept.
#[derive(Debug, Clone, Default)]
pub struct ResolvedKeys {
    pub private_key: Option<[u8; 32]>,
    pub public_keys: Vec<[u8; 32]>,
}

/// The single external seam for resolving `KeyMaterial::Resolver` selectors
/// (SSH/GPG/HTTP fetchers in the original system). The core depends only on
/// this trait, never on a concrete fetcher.
pub trait KeyResolver: Send + Sync {
    fn resolve(&self, selector: &str) -> crate::error::Result<ResolvedKeys>;
}

/// A resolver that resolves nothing — used by tests and as a safe default
/// when no external key-material backend is wired up.
pub struct NullKeyResolver;

impl KeyResolver for NullKeyResolver {
    fn resolve(&self, selector: &str) -> crate::error::Result<ResolvedKeys> {
        Err(crate::error::CoreError::config(format!(
            "no key resolver backend configured for selector {selector:?}"
        )))
    }
}

/// Server-wide configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_v4: (Ipv4Addr, u16),
    pub bind_v6: Option<(Ipv6Addr, u16)>,
    pub palette: PaletteSelector,
    pub custom_palette: Option<String>,
    /// Read-only from the core's perspective; the external logging
    /// collaborator decides what to do with it.
    pub log_destination: Option<PathBuf>,
    pub encryption_policy: EncryptionPolicy,
    pub key_material: Option<KeyMaterial>,
    pub allowed_client_keys: Option<PathBuf>,
    pub max_clients: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_v4: (Ipv4Addr::UNSPECIFIED, 7474),
            bind_v6: None,
            palette: PaletteSelector::Standard,
            custom_palette: None,
            log_destination: None,
            encryption_policy: EncryptionPolicy::OptIn,
            key_material: None,
            allowed_client_keys: None,
            max_clients: 10,
        }
    }
}

impl ServerConfig {
    pub fn effective_palette_string(&self) -> String {
        match self.palette.builtin_ramp() {
            Some(ramp) => ramp.to_string(),
            None => self
                .custom_palette
                .clone()
                .unwrap_or_else(|| PaletteSelector::Standard.builtin_ramp().unwrap().to_string()),
        }
    }
}
