//! Detached signatures under the uploader's address key
//!
//! A signature is the base64 keyed BLAKE3 of the signed bytes under a
//! signing subkey derived from the address key.

use base64::{engine::general_purpose::STANDARD as B64, Engine};

use crate::keys::{hkdf_derive, AddressKey, KeyMaterial};

/// Sign `data`, returning a base64 detached signature.
pub fn sign_detached(key: &AddressKey, data: &[u8]) -> anyhow::Result<String> {
    let subkey = hkdf_derive(key.as_bytes(), b"sdrive-signing")?;
    Ok(B64.encode(blake3::keyed_hash(&subkey, data).as_bytes()))
}

/// Check a signature produced by [`sign_detached`].
pub fn verify_detached(key: &AddressKey, data: &[u8], signature: &str) -> anyhow::Result<bool> {
    let raw = B64
        .decode(signature)
        .map_err(|e| anyhow::anyhow!("signature is not base64: {e}"))?;
    let Ok(raw): Result<[u8; 32], _> = raw.try_into() else {
        return Ok(false);
    };
    let subkey = hkdf_derive(key.as_bytes(), b"sdrive-signing")?;
    // blake3::Hash equality is constant-time
    Ok(blake3::keyed_hash(&subkey, data) == blake3::Hash::from(raw))
}

/// Sign the block manifest: the raw ciphertext hashes concatenated in index order.
pub fn manifest_signature<'a, I>(key: &AddressKey, hashes_hex: I) -> anyhow::Result<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut manifest = Vec::new();
    for hex in hashes_hex {
        let hash = blake3::Hash::from_hex(hex)
            .map_err(|e| anyhow::anyhow!("invalid block hash '{hex}' in manifest: {e}"))?;
        manifest.extend_from_slice(hash.as_bytes());
    }
    sign_detached(key, &manifest)
}
