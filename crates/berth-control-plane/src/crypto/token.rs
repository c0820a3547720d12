//! Secret token generation and comparison.
//!
//! Agent tokens and webhook path tokens are 256-bit random values encoded
//! as URL-safe base64. Agent tokens are stored only as their SHA-256 hash.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Generate a new random token.
///
/// Returns a tuple of (plaintext_token, token_hash).
/// The plaintext token is shown to the operator once.
/// The token_hash is what gets stored.
pub fn generate_token() -> (String, String) {
    let mut token_bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut token_bytes);

    let plaintext = URL_SAFE_NO_PAD.encode(token_bytes);
    let token_hash = hash_token(&plaintext);

    (plaintext, token_hash)
}

/// Hash a token using SHA-256.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    let result = hasher.finalize();
    hex::encode(result)
}

/// Compare two secrets without leaking the position of the first mismatch.
///
/// Length differences still return early; lengths are not secret here.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}
