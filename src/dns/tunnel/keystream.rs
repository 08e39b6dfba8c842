//! Per-page XOR keystream derivation.
//!
//! The keystream for a page is SHA-256 iterated over
//! `shared_secret || context || block_counter`, one hash per 32-byte block,
//! concatenated and truncated to the requested length. The construction is
//! symmetric: encrypting and decrypting are the same XOR, and the length
//! follows the plaintext, so there is no per-page ciphertext overhead.

use sha2::{Digest, Sha256};

/// Derive `len` keystream bytes for `context` under `secret`.
pub fn derive(secret: &[u8], context: &str, len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len.next_multiple_of(32));
    let mut block: u8 = 0;
    while out.len() < len {
        let mut hasher = Sha256::new();
        hasher.update(secret);
        hasher.update(context.as_bytes());
        hasher.update([block]);
        out.extend_from_slice(&hasher.finalize());
        block = block.wrapping_add(1);
    }
    out.truncate(len);
    out
}

/// XOR `data` in place with `key`. Caller guarantees equal lengths.
pub fn xor_in_place(data: &mut [u8], key: &[u8]) {
    debug_assert_eq!(data.len(), key.len());
    for (byte, k) in data.iter_mut().zip(key) {
        *byte ^= k;
    }
}

/// Context string for query page `index`.
pub fn query_context(index: u8) -> String {
    format!("query:page:{index}")
}

/// Context string for response page `index` (0-based internally).
pub fn response_context(index: usize) -> String {
    format!("response:page:{index}")
}
