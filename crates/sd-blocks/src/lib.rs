//! sd-blocks: fixed-size block splitting and content hashing
//!
//! # Overview
//! - `blake3`: ciphertext hashing (the block's remote key)
//! - `splitter`: bounded-size, index-ordered plaintext blocks
//! - `digest`: SHA-1 of the whole plaintext, recorded in extended attributes

pub mod blake3;
pub mod digest;
pub mod splitter;

pub use blake3::{hash_bytes, hash_from_hex, hash_to_hex, Hash};
pub use digest::Sha1Digest;
pub use splitter::{block_count, expected_block_sizes, BlockReader, PlainBlock};
