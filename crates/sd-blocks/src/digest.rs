//! SHA-1 digest of the whole plaintext
//!
//! Stored in the revision's extended attributes and compared when the
//! server reports a revision as already committed.

use sha1::{Digest, Sha1};

/// Incremental SHA-1 over plaintext blocks, fed in index order.
#[derive(Clone, Default)]
pub struct Sha1Digest {
    inner: Sha1,
}

impl Sha1Digest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    /// Lowercase hex of the final digest
    pub fn finalize_hex(self) -> String {
        hex_lower(&self.inner.finalize())
    }
}

pub fn sha1_hex(data: &[u8]) -> String {
    let mut d = Sha1Digest::new();
    d.update(data);
    d.finalize_hex()
}

fn hex_lower(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vector() {
        assert_eq!(sha1_hex(b"abc"), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }

    #[test]
    fn incremental_equals_one_shot() {
        let mut d = Sha1Digest::new();
        d.update(b"hello ");
        d.update(b"world");
        assert_eq!(d.finalize_hex(), sha1_hex(b"hello world"));
    }
}
