//! Key material, key wrapping, and small-message encryption

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::{KEY_SIZE, NONCE_SIZE, TAG_SIZE};

/// Raw access shared by every 256-bit key type.
pub trait KeyMaterial: Sized {
    fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self;
    fn as_bytes(&self) -> &[u8; KEY_SIZE];
}

macro_rules! secret_key {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone)]
        pub struct $name {
            bytes: [u8; KEY_SIZE],
        }

        impl KeyMaterial for $name {
            fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
                Self { bytes }
            }

            fn as_bytes(&self) -> &[u8; KEY_SIZE] {
                &self.bytes
            }
        }

        impl Drop for $name {
            fn drop(&mut self) {
                self.bytes.zeroize();
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("bytes", &"[REDACTED]")
                    .finish()
            }
        }
    };
}

secret_key!(
    /// Per-node key. Encrypts child names and extended attributes, wraps content keys.
    NodeKey
);
secret_key!(
    /// Per-revision session key for block encryption. Zeroized on drop.
    ContentKey
);
secret_key!(
    /// Uploader identity key used for detached signatures.
    AddressKey
);
secret_key!(
    /// Folder key for collision-probing name hashes.
    HashKey
);
secret_key!(
    /// Random passphrase locking a node key; itself wrapped under the parent key.
    Passphrase
);

/// Generate a random 256-bit key of any kind.
pub fn generate_key<K: KeyMaterial>() -> K {
    let mut bytes = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut bytes);
    K::from_bytes(bytes)
}

/// Derive the name-hash key of a folder from its node key.
pub fn derive_hash_key(folder: &NodeKey) -> anyhow::Result<HashKey> {
    hkdf_derive(folder.as_bytes(), b"sdrive-name-hash").map(HashKey::from_bytes)
}

/// HKDF-SHA256 key derivation with a domain-specific info string.
pub(crate) fn hkdf_derive(ikm: &[u8; KEY_SIZE], info: &[u8]) -> anyhow::Result<[u8; KEY_SIZE]> {
    let hkdf = Hkdf::<Sha256>::new(None, ikm);
    let mut okm = [0u8; KEY_SIZE];
    hkdf.expand(info, &mut okm)
        .map_err(|e| anyhow::anyhow!("HKDF expand failed: {e}"))?;
    Ok(okm)
}

/// Encrypt a short message under any key.
///
/// Output: `[24-byte nonce][ciphertext + 16-byte tag]`
pub fn encrypt_message<K: KeyMaterial>(key: &K, plaintext: &[u8]) -> anyhow::Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| anyhow::anyhow!("message encryption failed: {e}"))?;

    let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

/// Decrypt the output of [`encrypt_message`].
pub fn decrypt_message<K: KeyMaterial>(key: &K, sealed: &[u8]) -> anyhow::Result<Vec<u8>> {
    if sealed.len() < NONCE_SIZE + TAG_SIZE {
        anyhow::bail!(
            "encrypted message too short: {} bytes (minimum {})",
            sealed.len(),
            NONCE_SIZE + TAG_SIZE
        );
    }

    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_SIZE);
    let nonce = XNonce::from_slice(nonce_bytes);
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| anyhow::anyhow!("message decryption failed: wrong key or corrupted data"))
}

/// Wrap (encrypt) one key under another.
///
/// Used for the node passphrase (passphrase under the parent key), the
/// locked node key, and the content key packet (content key under the node key).
pub fn wrap_key<W: KeyMaterial, K: KeyMaterial>(wrapping: &W, key: &K) -> anyhow::Result<Vec<u8>> {
    encrypt_message(wrapping, key.as_bytes())
        .map_err(|e| anyhow::anyhow!("key wrapping failed: {e}"))
}

/// Unwrap a key produced by [`wrap_key`].
pub fn unwrap_key<W: KeyMaterial, K: KeyMaterial>(wrapping: &W, wrapped: &[u8]) -> anyhow::Result<K> {
    if wrapped.len() != NONCE_SIZE + KEY_SIZE + TAG_SIZE {
        anyhow::bail!(
            "wrapped key has wrong size: {} bytes (expected {})",
            wrapped.len(),
            NONCE_SIZE + KEY_SIZE + TAG_SIZE
        );
    }

    let mut plaintext = decrypt_message(wrapping, wrapped)
        .map_err(|_| anyhow::anyhow!("key unwrapping failed: invalid wrapping key or corrupted data"))?;

    let mut key_bytes = [0u8; KEY_SIZE];
    key_bytes.copy_from_slice(&plaintext);
    plaintext.zeroize();

    Ok(K::from_bytes(key_bytes))
}
