//! Ed25519 key types and operations.
//!
//! Keys travel as lowercase hex: 32 bytes for both halves. The public half
//! doubles as the identity's public id on the endpoints.

use crate::error::{SignerError, SignerResult};
use ed25519_dalek::{SigningKey, VerifyingKey};
use std::fmt;

fn decode_hex32(s: &str, what: &str) -> SignerResult<[u8; 32]> {
    decode_hex(s.trim())
        .and_then(|bytes| <[u8; 32]>::try_from(bytes).ok())
        .ok_or_else(|| SignerError::KeyParsing(format!("{what}: expected 64 hex characters")))
}

pub(crate) fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

pub(crate) fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// A secret (private) key for signing.
pub struct SecretKey {
    inner: SigningKey,
}

impl SecretKey {
    /// Generate a new random secret key.
    pub fn generate() -> Self {
        let mut rng = rand_core::OsRng;
        Self {
            inner: SigningKey::generate(&mut rng),
        }
    }

    /// Parse a hex-encoded 32-byte seed.
    pub fn from_hex(s: &str) -> SignerResult<Self> {
        let seed = decode_hex32(s, "secret key")?;
        Ok(Self {
            inner: SigningKey::from_bytes(&seed),
        })
    }

    /// Encode the seed as hex.
    pub fn to_hex(&self) -> String {
        encode_hex(self.inner.as_bytes())
    }

    /// Get the corresponding public key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            inner: self.inner.verifying_key(),
        }
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.inner
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey([REDACTED])")
    }
}

/// A public key for verification.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey {
    inner: VerifyingKey,
}

impl PublicKey {
    /// Parse a hex-encoded public key.
    pub fn from_hex(s: &str) -> SignerResult<Self> {
        let bytes = decode_hex32(s, "public key")?;
        let inner = VerifyingKey::from_bytes(&bytes)
            .map_err(|e| SignerError::KeyParsing(format!("invalid public key: {e}")))?;
        Ok(Self { inner })
    }

    /// Encode as hex.
    pub fn to_hex(&self) -> String {
        encode_hex(self.inner.as_bytes())
    }

    pub(crate) fn verifying_key(&self) -> &VerifyingKey {
        &self.inner
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}...)", &self.to_hex()[..8])
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// A key pair containing both secret and public keys.
pub struct KeyPair {
    /// The secret key.
    pub secret: SecretKey,
    /// The public key.
    pub public: PublicKey,
}

impl KeyPair {
    /// Generate a new key pair.
    pub fn generate() -> Self {
        Self::from_secret(SecretKey::generate())
    }

    /// Build the pair from its secret half.
    pub fn from_secret(secret: SecretKey) -> Self {
        let public = secret.public_key();
        Self { secret, public }
    }

    /// Parse from a hex secret key.
    pub fn from_secret_hex(s: &str) -> SignerResult<Self> {
        SecretKey::from_hex(s).map(Self::from_secret)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_key_hex_roundtrip() {
        let keypair = KeyPair::generate();
        let hex = keypair.secret.to_hex();
        assert_eq!(hex.len(), 64);

        let parsed = KeyPair::from_secret_hex(&hex).unwrap();
        assert_eq!(parsed.public, keypair.public);
    }

    #[test]
    fn test_public_key_hex_roundtrip() {
        let keypair = KeyPair::generate();
        let parsed = PublicKey::from_hex(&keypair.public.to_hex()).unwrap();
        assert_eq!(parsed, keypair.public);
    }

    #[test]
    fn test_rejects_bad_hex() {
        assert!(SecretKey::from_hex("abcd").is_err());
        assert!(SecretKey::from_hex(&"zz".repeat(32)).is_err());
    }

    #[test]
    fn test_debug_does_not_leak_secret() {
        let keypair = KeyPair::generate();
        let debug = format!("{keypair:?} {:?}", keypair.secret);
        assert!(!debug.contains(&keypair.secret.to_hex()));
        assert!(debug.contains("REDACTED"));
    }
}
