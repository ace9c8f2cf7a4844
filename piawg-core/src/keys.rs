//! WireGuard key management
//!
//! X25519 keypair generation and persistence. The private key is stored
//! base64-encoded in the state directory with restrictive permissions and
//! never appears in logs or debug output.

use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use crate::state::{StateDir, STATE_VERSION};

/// State file holding the persisted private key
const KEY_FILE: &str = "key.json";

/// WireGuard private key (Curve25519)
#[derive(Clone)]
pub struct PrivateKey {
    secret: StaticSecret,
}

impl PrivateKey {
    /// Generate a new random private key
    pub fn generate() -> Self {
        Self {
            secret: StaticSecret::random_from_rng(OsRng),
        }
    }

    /// Decode from the base64 form used by WireGuard tooling
    pub fn from_base64(s: &str) -> Result<Self, KeyError> {
        let bytes = decode_key_bytes(s)?;
        Ok(Self {
            secret: StaticSecret::from(bytes),
        })
    }

    /// Derive the corresponding public key
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            key: X25519Public::from(&self.secret),
        }
    }

    /// Encode as base64 (only for the key file and the wg-quick config
    /// artifact, both written with mode 0600)
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.secret.to_bytes())
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateKey([redacted])")
    }
}

/// WireGuard public key (Curve25519)
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey {
    key: X25519Public,
}

impl PublicKey {
    pub fn from_base64(s: &str) -> Result<Self, KeyError> {
        let bytes = decode_key_bytes(s)?;
        Ok(Self {
            key: X25519Public::from(bytes),
        })
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.key.to_bytes())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}...)", &self.to_base64()[..8])
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base64())
    }
}

fn decode_key_bytes(s: &str) -> Result<[u8; 32], KeyError> {
    let bytes = BASE64.decode(s).map_err(|_| KeyError::InvalidBase64)?;
    let arr: [u8; 32] = bytes.try_into().map_err(|_| KeyError::InvalidLength)?;
    Ok(arr)
}

/// A key pair (private + public)
#[derive(Clone, Debug)]
pub struct KeyPair {
    pub private: PrivateKey,
    pub public: PublicKey,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        let private = PrivateKey::generate();
        let public = private.public_key();
        Self { private, public }
    }

    /// Load the persisted keypair, or generate and persist a new one.
    ///
    /// An unreadable or malformed key file is replaced with a fresh
    /// keypair; the provider simply sees a new registration.
    pub fn load_or_generate(state: &StateDir) -> std::io::Result<Self> {
        if let Some(file) = state.load::<KeyFile>(KEY_FILE) {
            if file.version == STATE_VERSION {
                match PrivateKey::from_base64(&file.private_key) {
                    Ok(private) => {
                        debug!("loaded persisted keypair");
                        let public = private.public_key();
                        return Ok(Self { private, public });
                    }
                    Err(e) => warn!(error = %e, "stored private key invalid, regenerating"),
                }
            } else {
                warn!(version = file.version, "key file format changed, regenerating");
            }
        }

        let pair = Self::generate();
        state.store(
            KEY_FILE,
            &KeyFile {
                version: STATE_VERSION,
                private_key: pair.private.to_base64(),
            },
        )?;
        info!(public_key = %pair.public, "generated a new keypair");
        Ok(pair)
    }
}

#[derive(Serialize, Deserialize)]
struct KeyFile {
    version: u32,
    private_key: String,
}

/// Key parsing errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum KeyError {
    #[error("invalid base64 encoding")]
    InvalidBase64,

    #[error("invalid key length (expected 32 bytes)")]
    InvalidLength,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base64_roundtrip() {
        let pair = KeyPair::generate();
        let restored = PrivateKey::from_base64(&pair.private.to_base64()).unwrap();
        assert_eq!(restored.public_key(), pair.public);
    }

    #[test]
    fn debug_output_redacts_private_key() {
        let pair = KeyPair::generate();
        let debug = format!("{:?}", pair.private);
        assert!(!debug.contains(&pair.private.to_base64()));
        assert!(debug.contains("redacted"));
    }

    #[test]
    fn invalid_encodings_are_rejected() {
        assert!(PublicKey::from_base64("not-valid-base64!!!").is_err());
        assert!(PrivateKey::from_base64(&BASE64.encode([0u8; 16])).is_err());
    }

    #[test]
    fn load_or_generate_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateDir::new(dir.path());

        let first = KeyPair::load_or_generate(&state).unwrap();
        let second = KeyPair::load_or_generate(&state).unwrap();
        assert_eq!(first.public, second.public);
    }

    #[test]
    fn corrupt_key_file_regenerates() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateDir::new(dir.path());
        state
            .store(
                "key.json",
                &KeyFile {
                    version: STATE_VERSION,
                    private_key: "garbage".to_string(),
                },
            )
            .unwrap();

        let pair = KeyPair::load_or_generate(&state).unwrap();
        // The replacement key must round-trip through the store
        let again = KeyPair::load_or_generate(&state).unwrap();
        assert_eq!(pair.public, again.public);
    }
}
