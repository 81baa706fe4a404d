// hasher.rs — SHA-256 hashing utilities and the ledger chain rule.
//
// All hashes are SHA-256, lowercase hex (64 characters).
//
// Chain rule:
//   hash_0 = seed = SHA-256("agent-mesh/evidence-ledger/v1")
//   hash_n = SHA-256(hex(hash_{n-1}) ∥ canonical(entry_n))

use sha2::{Digest, Sha256};

use crate::canonical::CanonicalBytes;

const CHAIN_SEED_LABEL: &str = "agent-mesh/evidence-ledger/v1";

/// Hash arbitrary bytes, returning a lowercase hex-encoded SHA-256 string.
pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

pub fn hash_str(s: &str) -> String {
    hash_bytes(s.as_bytes())
}

/// Hash of canonical bytes (digests of summaries and attestation payloads).
pub fn digest(canonical: &CanonicalBytes) -> String {
    hash_bytes(canonical.as_bytes())
}

/// Root of every evidence chain.
pub fn chain_seed() -> String {
    hash_str(CHAIN_SEED_LABEL)
}

/// Next chain hash after `previous` for an entry with the given canonical bytes.
pub fn chain_next(previous: &str, entry: &CanonicalBytes) -> String {
    let mut hasher = Sha256::new();
    hasher.update(previous.as_bytes());
    hasher.update(entry.as_bytes());
    format!("{:x}", hasher.finalize())
}
