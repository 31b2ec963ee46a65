//! Per-block XChaCha20-Poly1305 encryption/decryption
//!
//! Encrypted block format (binary):
//! ```text
//! [24 bytes: random nonce][N bytes: ciphertext][16 bytes: Poly1305 tag]
//! AAD = block_index (8 bytes, big-endian) || BLAKE3(file_id) (32 bytes)
//! ```
//!
//! The nonce is the envelope; everything after it is the block body whose
//! prefix feeds the verification token.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;

use crate::keys::{ContentKey, KeyMaterial};
use crate::{NONCE_SIZE, TAG_SIZE};

/// Encrypt one plaintext block.
///
/// - `index`: 0-based block index within the revision
/// - `file_id`: remote file identifier the block belongs to
///
/// Returns: `[24-byte nonce][ciphertext][16-byte tag]`
pub fn encrypt_block(
    key: &ContentKey,
    index: u32,
    file_id: &str,
    plaintext: &[u8],
) -> anyhow::Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from_slice(&nonce_bytes);

    let aad = build_aad(index, file_id);

    let ciphertext = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad: &aad,
            },
        )
        .map_err(|e| anyhow::anyhow!("block {index} encryption failed: {e}"))?;

    let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

/// Decrypt one block produced by [`encrypt_block`].
pub fn decrypt_block(
    key: &ContentKey,
    index: u32,
    file_id: &str,
    encrypted: &[u8],
) -> anyhow::Result<Vec<u8>> {
    let body = block_body(encrypted)?;
    let nonce = XNonce::from_slice(&encrypted[..NONCE_SIZE]);
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());

    let aad = build_aad(index, file_id);

    cipher
        .decrypt(nonce, Payload { msg: body, aad: &aad })
        .map_err(|_| {
            anyhow::anyhow!("block {index} decryption failed: invalid key, corrupted data, or wrong index/file")
        })
}

/// The block with its nonce envelope stripped.
pub fn block_body(encrypted: &[u8]) -> anyhow::Result<&[u8]> {
    if encrypted.len() < NONCE_SIZE + TAG_SIZE {
        anyhow::bail!(
            "encrypted block too short: {} bytes (minimum {})",
            encrypted.len(),
            NONCE_SIZE + TAG_SIZE
        );
    }
    Ok(&encrypted[NONCE_SIZE..])
}

/// Build AAD: block_index (8 bytes BE) || BLAKE3(file_id) (32 bytes)
fn build_aad(index: u32, file_id: &str) -> Vec<u8> {
    let mut aad = Vec::with_capacity(8 + 32);
    aad.extend_from_slice(&u64::from(index).to_be_bytes());
    aad.extend_from_slice(blake3::hash(file_id.as_bytes()).as_bytes());
    aad
}
