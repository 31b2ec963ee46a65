//! sd-crypto: client-side encryption for the sdrive upload pipeline
//!
//! Pipeline: plaintext → fixed-size block → encrypt → BLAKE3 hash ciphertext → upload
//!
//! Key hierarchy:
//! ```text
//! Parent Node Key (folder)
//!   ├── Name: AES-SIV armored (key=HKDF(parent, "sdrive-names-siv-*"))
//!   ├── Name Hash Key (HKDF(parent, "sdrive-name-hash")), keyed BLAKE3 of the name
//!   └── Passphrase (random, wrapped by parent = node passphrase)
//!       └── Node Key (per-file, 256-bit random, wrapped by passphrase)
//!           ├── Content Key (per-revision session key, wrapped by node key = content key packet)
//!           │   └── Block AEAD: XChaCha20-Poly1305 (nonce=random_192bit, AAD=block_idx||BLAKE3(file_id))
//!           └── Extended attributes (XChaCha20-Poly1305 under the node key)
//! Address Key (uploader identity): detached signatures over names, packets, manifests
//! ```

pub mod block;
pub mod keys;
pub mod names;
pub mod sign;
pub mod verification;

pub use block::{block_body, decrypt_block, encrypt_block};
pub use keys::{
    decrypt_message, derive_hash_key, encrypt_message, generate_key, unwrap_key, wrap_key,
    AddressKey, ContentKey, HashKey, KeyMaterial, NodeKey, Passphrase,
};
pub use names::{decrypt_name, encrypt_name, name_hash};
pub use sign::{manifest_signature, sign_detached, verify_detached};
pub use verification::{verification_token, xor_prefix};

/// Size of every symmetric key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of an XChaCha20-Poly1305 nonce (192-bit)
pub const NONCE_SIZE: usize = 24;

/// Size of a Poly1305 authentication tag
pub const TAG_SIZE: usize = 16;
