// signing.rs — The signing boundary for evidence attestations.
//
// The ledger never holds key material: it hands canonical payload bytes to a
// `Signer`. `LocalKeySigner` is an in-process Ed25519 signer for development
// and the CLI; deployments inject their own implementation.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ring::rand::SystemRandom;
use ring::signature::{Ed25519KeyPair, KeyPair, UnparsedPublicKey, ED25519};
use thiserror::Error;

use crate::pack::EvidencePack;

#[derive(Debug, Error)]
pub enum SignError {
    #[error("invalid key material: {0}")]
    Key(String),

    #[error("signer unavailable: {0}")]
    Unavailable(String),

    #[error("signature does not verify: {0}")]
    Invalid(String),
}

/// External signing collaborator.
pub trait Signer: Send + Sync {
    /// Identity recorded in the attestation's `signed_by`.
    fn signer_id(&self) -> &str;

    /// Sign `bytes`, returning a base64-encoded signature.
    fn sign(&self, bytes: &[u8]) -> Result<String, SignError>;
}

/// Ed25519 signer backed by an in-memory PKCS#8 key.
pub struct LocalKeySigner {
    id: String,
    pkcs8: Vec<u8>,
    key_pair: Ed25519KeyPair,
}

impl LocalKeySigner {
    /// Generate a fresh key pair.
    pub fn generate(id: impl Into<String>) -> Result<Self, SignError> {
        let rng = SystemRandom::new();
        let document = Ed25519KeyPair::generate_pkcs8(&rng)
            .map_err(|_| SignError::Key("key generation failed".to_string()))?;
        Self::from_pkcs8(id, document.as_ref())
    }

    pub fn from_pkcs8(id: impl Into<String>, pkcs8: &[u8]) -> Result<Self, SignError> {
        let key_pair = Ed25519KeyPair::from_pkcs8(pkcs8)
            .map_err(|e| SignError::Key(format!("not an Ed25519 PKCS#8 document: {e}")))?;
        Ok(Self {
            id: id.into(),
            pkcs8: pkcs8.to_vec(),
            key_pair,
        })
    }

    /// PKCS#8 document, for persisting the key.
    pub fn pkcs8(&self) -> &[u8] {
        &self.pkcs8
    }

    pub fn public_key_base64(&self) -> String {
        STANDARD.encode(self.key_pair.public_key().as_ref())
    }
}

impl Signer for LocalKeySigner {
    fn signer_id(&self) -> &str {
        &self.id
    }

    fn sign(&self, bytes: &[u8]) -> Result<String, SignError> {
        Ok(STANDARD.encode(self.key_pair.sign(bytes).as_ref()))
    }
}

impl std::fmt::Debug for LocalKeySigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalKeySigner")
            .field("id", &self.id)
            .field("public_key", &self.public_key_base64())
            .finish_non_exhaustive()
    }
}

/// Check a pack's attestation signature against a base64 Ed25519 public key.
///
/// Only the signature is checked here; chain integrity is [`crate::replay::verify`].
pub fn verify_signature(pack: &EvidencePack, public_key_b64: &str) -> Result<(), SignError> {
    let public_key = STANDARD
        .decode(public_key_b64.trim())
        .map_err(|e| SignError::Key(format!("public key is not base64: {e}")))?;
    let signature = STANDARD
        .decode(&pack.attestation.signature)
        .map_err(|e| SignError::Invalid(format!("signature is not base64: {e}")))?;
    let payload = pack
        .attestation_payload()
        .and_then(|p| p.canonical_bytes())
        .map_err(|e| SignError::Invalid(format!("cannot rebuild payload: {e}")))?;
    UnparsedPublicKey::new(&ED25519, public_key)
        .verify(payload.as_bytes(), &signature)
        .map_err(|_| SignError::Invalid(format!("signed_by {}", pack.attestation.signed_by)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_raw_bytes() {
        let signer = LocalKeySigner::generate("ops-signer").unwrap();
        let sig = STANDARD.decode(signer.sign(b"payload").unwrap()).unwrap();
        let pk = STANDARD.decode(signer.public_key_base64()).unwrap();
        assert!(UnparsedPublicKey::new(&ED25519, &pk).verify(b"payload", &sig).is_ok());
        assert!(UnparsedPublicKey::new(&ED25519, &pk).verify(b"other", &sig).is_err());
    }

    #[test]
    fn pkcs8_round_trip_keeps_identity() {
        let signer = LocalKeySigner::generate("a").unwrap();
        let reloaded = LocalKeySigner::from_pkcs8("a", signer.pkcs8()).unwrap();
        assert_eq!(reloaded.public_key_base64(), signer.public_key_base64());
    }

    #[test]
    fn garbage_key_is_rejected() {
        assert!(matches!(
            LocalKeySigner::from_pkcs8("x", b"not a key"),
            Err(SignError::Key(_))
        ));
    }

    #[test]
    fn debug_does_not_leak_private_key() {
        let signer = LocalKeySigner::generate("dbg").unwrap();
        let debug = format!("{signer:?}");
        assert!(debug.contains("dbg"));
        assert!(!debug.contains(&STANDARD.encode(signer.pkcs8())));
    }
}
