//! Mesh key material
//!
//! Curve25519 keypairs encoded the way WireGuard tooling expects them
//! (standard base64 of the 32 raw bytes).

use crate::error::{Error, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use x25519_dalek::{PublicKey, StaticSecret};

/// WireGuard key length (32 bytes for Curve25519)
pub const MESH_KEY_LEN: usize = 32;

/// Base64-encoded mesh keypair
#[derive(Clone, PartialEq, Eq)]
pub struct MeshKeyPair {
    pub private_key: String,
    pub public_key: String,
}

impl std::fmt::Debug for MeshKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshKeyPair")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

impl MeshKeyPair {
    /// Fresh random keypair
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::thread_rng());
        let public = PublicKey::from(&secret);
        Self {
            private_key: STANDARD.encode(secret.as_bytes()),
            public_key: STANDARD.encode(public.as_bytes()),
        }
    }

    /// Rebuild the pair from a configured private key
    pub fn from_private_key(private_key: &str) -> Result<Self> {
        let bytes = decode_key(private_key)?;
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Ok(Self {
            private_key: private_key.trim().to_string(),
            public_key: STANDARD.encode(public.as_bytes()),
        })
    }
}

/// Decode and length-check a base64 key
pub fn decode_key(key: &str) -> Result<[u8; MESH_KEY_LEN]> {
    let raw = STANDARD
        .decode(key.trim())
        .map_err(|e| Error::InvalidKey(e.to_string()))?;
    raw.try_into()
        .map_err(|raw: Vec<u8>| Error::InvalidKey(format!("expected 32 bytes, got {}", raw.len())))
}
