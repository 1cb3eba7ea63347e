//! Ed25519 signing and verification for plugin packages.

use ed25519_dalek::{
    Signature as DalekSignature, Signer as _, SigningKey as DalekSigningKey, Verifier as _,
    VerifyingKey as DalekVerifyingKey,
};
use rand::rngs::OsRng;

use crate::{PackageError, Result};

/// Ed25519 secret key used to sign packages.
#[derive(Clone)]
pub struct SigningKey(DalekSigningKey);

/// Ed25519 public key. Hosts configure the keys they trust.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyingKey(DalekVerifyingKey);

/// Detached signature over a package content hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature(DalekSignature);

pub struct KeyPair {
    pub signing_key: SigningKey,
    pub verifying_key: VerifyingKey,
}

impl KeyPair {
    #[must_use]
    pub fn generate() -> Self {
        let signing = DalekSigningKey::generate(&mut OsRng);
        let verifying = signing.verifying_key();
        Self {
            signing_key: SigningKey(signing),
            verifying_key: VerifyingKey(verifying),
        }
    }
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SigningKey").field(&"<redacted>").finish()
    }
}

fn decode_hex<const N: usize>(s: &str) -> Result<[u8; N]> {
    let bytes = hex::decode(s.trim()).map_err(|e| PackageError::InvalidKey(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| PackageError::InvalidKey(format!("expected {N} bytes, got {}", b.len())))
}

impl SigningKey {
    #[must_use]
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self(DalekSigningKey::from_bytes(bytes))
    }

    /// Parses a hex-encoded 32-byte secret.
    pub fn from_hex(s: &str) -> Result<Self> {
        decode_hex::<32>(s).map(|b| Self::from_bytes(&b))
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    #[must_use]
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.0.sign(message))
    }

    #[must_use]
    pub fn verifying_key(&self) -> VerifyingKey {
        VerifyingKey(self.0.verifying_key())
    }
}

impl VerifyingKey {
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self> {
        DalekVerifyingKey::from_bytes(bytes)
            .map(Self)
            .map_err(|e| PackageError::InvalidKey(e.to_string()))
    }

    /// Parses a hex-encoded 32-byte public key, the form used in config.
    pub fn from_hex(s: &str) -> Result<Self> {
        Self::from_bytes(&decode_hex::<32>(s)?)
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<()> {
        self.0
            .verify(message, &signature.0)
            .map_err(|_| PackageError::SignatureInvalid)
    }
}

impl Signature {
    #[must_use]
    pub fn from_bytes(bytes: &[u8; 64]) -> Self {
        Self(DalekSignature::from_bytes(bytes))
    }

    /// Parses a raw signature entry; anything but 64 bytes is invalid.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let array: [u8; 64] = bytes.try_into().map_err(|_| PackageError::SignatureInvalid)?;
        Ok(Self::from_bytes(&array))
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; 64] {
        self.0.to_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrong_key_fails() {
        let kp1 = KeyPair::generate();
        let kp2 = KeyPair::generate();
        let sig = kp1.signing_key.sign(b"message");
        assert!(kp1.verifying_key.verify(b"message", &sig).is_ok());
        assert!(kp2.verifying_key.verify(b"message", &sig).is_err());
        assert!(kp1.verifying_key.verify(b"other", &sig).is_err());
    }

    #[test]
    fn hex_keys_restore() {
        let kp = KeyPair::generate();
        let sk = SigningKey::from_hex(&kp.signing_key.to_hex()).unwrap();
        let vk = VerifyingKey::from_hex(&kp.verifying_key.to_hex()).unwrap();
        assert_eq!(sk.verifying_key(), vk);

        let sig = sk.sign(b"test");
        assert!(kp.verifying_key.verify(b"test", &sig).is_ok());
    }

    #[test]
    fn malformed_hex_is_rejected() {
        assert!(matches!(VerifyingKey::from_hex("zz"), Err(PackageError::InvalidKey(_))));
        assert!(matches!(VerifyingKey::from_hex("abcd"), Err(PackageError::InvalidKey(_))));
    }

    #[test]
    fn short_signature_is_invalid() {
        assert!(matches!(Signature::from_slice(&[0u8; 10]), Err(PackageError::SignatureInvalid)));
    }
}
