//! BLAKE3 content hashing for block ciphertext
//!
//! The hash of an encrypted block is what the server keys the block by, so
//! it is declared up front and recomputed before the block is trusted.

use anyhow::Result;

/// A BLAKE3 hash digest (32 bytes), displayed as 64 hex chars
pub type Hash = blake3::Hash;

/// Hash a byte slice in memory.
pub fn hash_bytes(data: &[u8]) -> Hash {
    blake3::hash(data)
}

/// Format a hash as lowercase hex string (64 chars)
pub fn hash_to_hex(hash: &Hash) -> String {
    hash.to_hex().to_string()
}

/// Parse a 64-char hex string into a Hash
pub fn hash_from_hex(hex: &str) -> Result<Hash> {
    blake3::Hash::from_hex(hex).map_err(|e| anyhow::anyhow!("invalid BLAKE3 hex '{}': {}", hex, e))
}

/// Check that `data` still hashes to the hex digest declared for it.
pub fn matches_hex(data: &[u8], expected_hex: &str) -> bool {
    match hash_from_hex(expected_hex) {
        Ok(expected) => hash_bytes(data) == expected,
        Err(_) => false,
    }
}
