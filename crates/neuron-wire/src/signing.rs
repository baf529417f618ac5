//! RSA signature service.
//!
//! Nodes prove their identity by signing nonces chosen by the counterparty.
//! Keys travel as base64 DER (SPKI for public keys, PKCS#8 for private
//! keys); signatures are SHA-256 with RSA (PKCS#1 v1.5), base64 on the wire.

use crate::error::WireError;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use std::fmt;

/// RSA modulus size for generated keys.
pub const KEY_BITS: usize = 2048;

/// A peer's public key, as published in the node directory.
#[derive(Clone)]
pub struct PublicKey {
    verifying: VerifyingKey<Sha256>,
    encoded: String,
}

impl PublicKey {
    /// Parse a base64-encoded SPKI DER public key.
    pub fn from_base64(encoded: &str) -> Result<Self, WireError> {
        let der = BASE64
            .decode(encoded.trim())
            .map_err(|e| WireError::Crypto(format!("public key is not base64: {e}")))?;
        let key = RsaPublicKey::from_public_key_der(&der)
            .map_err(|e| WireError::Crypto(format!("invalid public key: {e}")))?;
        Ok(Self::from_rsa(key, BASE64.encode(&der)))
    }

    fn from_rsa(key: RsaPublicKey, encoded: String) -> Self {
        Self {
            verifying: VerifyingKey::<Sha256>::new(key),
            encoded,
        }
    }

    /// The key as base64 SPKI DER.
    pub fn to_base64(&self) -> &str {
        &self.encoded
    }

    /// Check a base64 signature over `data`. Undecodable signatures fail.
    pub fn verify(&self, data: &[u8], signature: &str) -> bool {
        let Ok(raw) = BASE64.decode(signature) else {
            return false;
        };
        let Ok(signature) = Signature::try_from(raw.as_slice()) else {
            return false;
        };
        self.verifying.verify(data, &signature).is_ok()
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.encoded == other.encoded
    }
}

impl Eq for PublicKey {}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // base64 is ASCII, so byte slicing is safe.
        let tail = &self.encoded[self.encoded.len().saturating_sub(12)..];
        write!(f, "PublicKey(..{tail})")
    }
}

/// This node's key pair.
pub struct NodeKeys {
    private: RsaPrivateKey,
    signing: SigningKey<Sha256>,
    public: PublicKey,
}

impl NodeKeys {
    /// Generate a fresh 2048-bit key pair.
    pub fn generate() -> Result<Self, WireError> {
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, KEY_BITS)
            .map_err(|e| WireError::Crypto(format!("key generation failed: {e}")))?;
        Self::from_private(private)
    }

    /// Load a key pair from a base64-encoded PKCS#8 DER private key.
    pub fn from_base64(private_key: &str) -> Result<Self, WireError> {
        let der = BASE64
            .decode(private_key.trim())
            .map_err(|e| WireError::Crypto(format!("private key is not base64: {e}")))?;
        let private = RsaPrivateKey::from_pkcs8_der(&der)
            .map_err(|e| WireError::Crypto(format!("invalid private key: {e}")))?;
        Self::from_private(private)
    }

    fn from_private(private: RsaPrivateKey) -> Result<Self, WireError> {
        let public_key = private.to_public_key();
        let der = public_key
            .to_public_key_der()
            .map_err(|e| WireError::Crypto(format!("public key encoding failed: {e}")))?;
        let public = PublicKey::from_rsa(public_key, BASE64.encode(der.as_bytes()));
        Ok(Self {
            signing: SigningKey::<Sha256>::new(private.clone()),
            private,
            public,
        })
    }

    /// The public half.
    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// The private key as base64 PKCS#8 DER, for persisting.
    pub fn private_key_base64(&self) -> Result<String, WireError> {
        let der = self
            .private
            .to_pkcs8_der()
            .map_err(|e| WireError::Crypto(format!("private key encoding failed: {e}")))?;
        Ok(BASE64.encode(der.as_bytes()))
    }

    /// Sign `data`, returning a base64 signature.
    pub fn sign(&self, data: &[u8]) -> Result<String, WireError> {
        let signature = self
            .signing
            .try_sign(data)
            .map_err(|e| WireError::Crypto(format!("signing failed: {e}")))?;
        Ok(BASE64.encode(signature.to_bytes()))
    }
}

impl fmt::Debug for NodeKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeKeys")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

/// Key pairs shared across unit tests; RSA generation is slow.
#[cfg(test)]
pub(crate) mod test_keys {
    use super::NodeKeys;
    use std::sync::{Arc, OnceLock};

    static KEYS: OnceLock<Vec<Arc<NodeKeys>>> = OnceLock::new();

    /// The `n`th cached key pair (0..3).
    pub(crate) fn keys(n: usize) -> Arc<NodeKeys> {
        let keys = KEYS.get_or_init(|| {
            (0..3)
                .map(|_| Arc::new(NodeKeys::generate().unwrap()))
                .collect()
        });
        Arc::clone(&keys[n])
    }
}

#[cfg(test)]
mod tests {
    use super::test_keys::keys;
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let node = keys(0);
        let signature = node.sign(b"c1").unwrap();
        assert!(node.public_key().verify(b"c1", &signature));
        assert!(!node.public_key().verify(b"c2", &signature));
    }

    #[test]
    fn test_wrong_key_fails() {
        let signer = keys(0);
        let other = keys(1);
        let signature = signer.sign(b"nonce").unwrap();
        assert!(!other.public_key().verify(b"nonce", &signature));
    }

    #[test]
    fn test_garbage_signature_fails() {
        let node = keys(0);
        assert!(!node.public_key().verify(b"nonce", "not base64 !!"));
        assert!(!node.public_key().verify(b"nonce", "AAAA"));
        assert!(!node.public_key().verify(b"nonce", ""));
    }

    #[test]
    fn test_key_encoding_reload() {
        let node = keys(1);
        let private = node.private_key_base64().unwrap();
        let reloaded = NodeKeys::from_base64(&private).unwrap();
        assert_eq!(reloaded.public_key(), node.public_key());

        let public = PublicKey::from_base64(node.public_key().to_base64()).unwrap();
        let signature = reloaded.sign(b"s1").unwrap();
        assert!(public.verify(b"s1", &signature));
    }

    #[test]
    fn test_invalid_key_material() {
        assert!(matches!(
            PublicKey::from_base64("%%%"),
            Err(WireError::Crypto(_))
        ));
        assert!(matches!(
            PublicKey::from_base64("AAAA"),
            Err(WireError::Crypto(_))
        ));
        assert!(matches!(
            NodeKeys::from_base64("AAAA"),
            Err(WireError::Crypto(_))
        ));
    }
}
