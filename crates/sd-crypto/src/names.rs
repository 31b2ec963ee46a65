//! Armored file names and collision-probing name hashes
//!
//! Names are encrypted with AES-256-SIV under a key derived from the parent
//! folder's node key and carried base64-armored. The name hash is a keyed
//! BLAKE3 of the plaintext name under the folder's hash key, so the server
//! can detect sibling collisions without learning names.

use aes_siv::{
    aead::{Aead, KeyInit},
    Aes256SivAead, Nonce,
};
use base64::{engine::general_purpose::STANDARD as B64, Engine};

use crate::keys::{hkdf_derive, HashKey, KeyMaterial, NodeKey};

/// Encrypt a filename for storage under `parent`.
pub fn encrypt_name(parent: &NodeKey, name: &str) -> anyhow::Result<String> {
    let cipher = name_cipher(parent)?;
    // AES-SIV uses a zero nonce for deterministic encryption
    let nonce = Nonce::default();

    let ciphertext = cipher
        .encrypt(&nonce, name.as_bytes())
        .map_err(|e| anyhow::anyhow!("filename encryption failed: {e}"))?;

    Ok(B64.encode(ciphertext))
}

/// Decrypt an armored name produced by [`encrypt_name`].
pub fn decrypt_name(parent: &NodeKey, armored: &str) -> anyhow::Result<String> {
    let ciphertext = B64
        .decode(armored)
        .map_err(|e| anyhow::anyhow!("armored name is not base64: {e}"))?;

    let cipher = name_cipher(parent)?;
    let nonce = Nonce::default();

    let plaintext = cipher
        .decrypt(&nonce, ciphertext.as_ref())
        .map_err(|_| anyhow::anyhow!("filename decryption failed: wrong key or corrupted data"))?;

    String::from_utf8(plaintext).map_err(|e| anyhow::anyhow!("decrypted name is not UTF-8: {e}"))
}

/// Hex name hash of `name` within the folder owning `hash_key`.
pub fn name_hash(hash_key: &HashKey, name: &str) -> String {
    blake3::keyed_hash(hash_key.as_bytes(), name.as_bytes())
        .to_hex()
        .to_string()
}

fn name_cipher(parent: &NodeKey) -> anyhow::Result<Aes256SivAead> {
    // AES-256-SIV requires a 64-byte key (two 32-byte sub-keys)
    let first = hkdf_derive(parent.as_bytes(), b"sdrive-names-siv-1")?;
    let second = hkdf_derive(parent.as_bytes(), b"sdrive-names-siv-2")?;
    let mut double_key = [0u8; 64];
    double_key[..32].copy_from_slice(&first);
    double_key[32..].copy_from_slice(&second);
    let cipher = Aes256SivAead::new((&double_key).into());
    zeroize::Zeroize::zeroize(&mut double_key);
    Ok(cipher)
}
