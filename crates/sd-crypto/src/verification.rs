//! Block possession proof
//!
//! The server hands out a random code of `k` bytes. The client proves it can
//! decrypt the uploaded block by XOR-ing the code with the first `k` bytes
//! of the block body (ciphertext after the nonce envelope).

use crate::block::{block_body, decrypt_block};
use crate::keys::ContentKey;

/// `prefix XOR code`, byte-wise; a prefix shorter than the code is zero-padded.
pub fn xor_prefix(prefix: &[u8], code: &[u8]) -> Vec<u8> {
    code.iter()
        .enumerate()
        .map(|(i, c)| c ^ prefix.get(i).copied().unwrap_or(0))
        .collect()
}

/// Compute the raw verification token for one uploaded block.
///
/// Decryption validates that `key` really opens the block; the plaintext is
/// dropped immediately.
pub fn verification_token(
    key: &ContentKey,
    index: u32,
    file_id: &str,
    encrypted: &[u8],
    code: &[u8],
) -> anyhow::Result<Vec<u8>> {
    let body = block_body(encrypted)?;
    let mut plaintext = decrypt_block(key, index, file_id, encrypted)?;
    zeroize::Zeroize::zeroize(&mut plaintext);

    tracing::trace!(block = index, code_len = code.len(), "computing verification token");
    Ok(xor_prefix(body, code))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::encrypt_block;
    use crate::keys::generate_key;
    use proptest::prelude::*;

    #[test]
    fn short_prefix_is_zero_padded() {
        assert_eq!(xor_prefix(&[0xFF], &[0x0F, 0xAA, 0x01]), vec![0xF0, 0xAA, 0x01]);
        assert!(xor_prefix(&[1, 2, 3], &[]).is_empty());
    }

    #[test]
    fn token_uses_block_body_prefix() {
        let key: ContentKey = generate_key();
        let encrypted = encrypt_block(&key, 0, "F1", b"plaintext of block zero").unwrap();
        let code = [0x5Au8; 16];

        let token = verification_token(&key, 0, "F1", &encrypted, &code).unwrap();
        let body = block_body(&encrypted).unwrap();
        let expected: Vec<u8> = body[..16].iter().zip(code).map(|(p, c)| p ^ c).collect();
        assert_eq!(token, expected);

        // idempotent
        assert_eq!(token, verification_token(&key, 0, "F1", &encrypted, &code).unwrap());
    }

    #[test]
    fn token_requires_decryptable_block() {
        let key: ContentKey = generate_key();
        let other: ContentKey = generate_key();
        let encrypted = encrypt_block(&key, 0, "F1", b"data").unwrap();
        assert!(verification_token(&other, 0, "F1", &encrypted, &[1u8; 8]).is_err());
    }

    proptest! {
        #[test]
        fn xor_with_code_is_involutive(
            prefix in proptest::collection::vec(any::<u8>(), 0..=64),
            code in proptest::collection::vec(any::<u8>(), 0..=64),
        ) {
            let token = xor_prefix(&prefix, &code);
            prop_assert_eq!(token.len(), code.len());
            let back = xor_prefix(&token, &code);
            let padded: Vec<u8> = (0..code.len()).map(|i| prefix.get(i).copied().unwrap_or(0)).collect();
            prop_assert_eq!(back, padded);
        }
    }
}
