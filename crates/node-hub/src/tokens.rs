use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Deterministic peppered SHA-256, hex encoded; used as the lookup key for node tokens.
pub fn hash_token(token: &str, pepper: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.update(pepper.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Constant-time comparison for equal-length secrets.
pub fn tokens_match(expected: &str, candidate: &str) -> bool {
    expected.len() == candidate.len() && expected.as_bytes().ct_eq(candidate.as_bytes()).into()
}
