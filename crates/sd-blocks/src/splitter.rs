//! Fixed-size block splitting
//!
//! Content is cut into blocks of exactly `max_size` bytes, the last one
//! possibly shorter. Block `i` always covers bytes
//! `[i * max_size, i * max_size + len)`, so the index alone determines
//! reassembly order. An empty input produces no blocks.

use anyhow::{bail, Context, Result};
use std::io::Read;

/// One plaintext block cut from the source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlainBlock {
    /// 0-based position in the file
    pub index: u32,
    /// Byte offset within the source
    pub offset: u64,
    pub data: Vec<u8>,
}

/// Number of blocks a `size`-byte file splits into.
pub fn block_count(size: u64, max_size: usize) -> u64 {
    if max_size == 0 {
        return 0;
    }
    size.div_ceil(max_size as u64)
}

/// Plaintext sizes the splitter produces for a `size`-byte file.
pub fn expected_block_sizes(size: u64, max_size: usize) -> Vec<u64> {
    let count = block_count(size, max_size);
    let max = max_size as u64;
    (0..count)
        .map(|i| {
            let remaining = size - i * max;
            remaining.min(max)
        })
        .collect()
}

/// Streaming splitter over any reader.
///
/// Fills each block completely before yielding it, so short reads from the
/// underlying source never produce undersized middle blocks.
pub struct BlockReader<R> {
    inner: R,
    max_size: usize,
    next_index: u32,
    offset: u64,
    done: bool,
}

impl<R: Read> BlockReader<R> {
    pub fn new(inner: R, max_size: usize) -> Result<Self> {
        if max_size == 0 {
            bail!("block size must be non-zero");
        }
        Ok(Self {
            inner,
            max_size,
            next_index: 0,
            offset: 0,
            done: false,
        })
    }

    fn fill(&mut self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.max_size];
        let mut filled = 0;
        while filled < self.max_size {
            let n = self
                .inner
                .read(&mut buf[filled..])
                .with_context(|| format!("reading block {}", self.next_index))?;
            if n == 0 {
                self.done = true;
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }
}

impl<R: Read> Iterator for BlockReader<R> {
    type Item = Result<PlainBlock>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let data = match self.fill() {
            Ok(d) => d,
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        };
        if data.is_empty() {
            return None;
        }
        let block = PlainBlock {
            index: self.next_index,
            offset: self.offset,
            data,
        };
        self.next_index += 1;
        self.offset += block.data.len() as u64;
        tracing::trace!(index = block.index, len = block.data.len(), "split block");
        Some(Ok(block))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Reader that hands out at most `step` bytes per call
    struct Trickle<'a> {
        data: &'a [u8],
        step: usize,
    }

    /// Reference split of an in-memory buffer
    fn split_slice(data: &[u8], max_size: usize) -> Result<Vec<PlainBlock>> {
        if max_size == 0 {
            bail!("block size must be non-zero");
        }
        Ok(data
            .chunks(max_size)
            .enumerate()
            .map(|(i, chunk)| PlainBlock {
                index: i as u32,
                offset: (i * max_size) as u64,
                data: chunk.to_vec(),
            })
            .collect())
    }

    impl Read for Trickle<'_> {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = self.step.min(buf.len()).min(self.data.len());
            buf[..n].copy_from_slice(&self.data[..n]);
            self.data = &self.data[n..];
            Ok(n)
        }
    }

    #[test]
    fn empty_input_has_no_blocks() {
        assert!(split_slice(b"", 4).unwrap().is_empty());
        assert_eq!(BlockReader::new(std::io::empty(), 4).unwrap().count(), 0);
        assert!(expected_block_sizes(0, 4).is_empty());
    }

    #[test]
    fn exact_multiple_has_no_trailing_block() {
        let blocks = split_slice(&[1u8; 8], 4).unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(expected_block_sizes(8, 4), vec![4, 4]);
    }

    #[test]
    fn last_block_is_short() {
        assert_eq!(expected_block_sizes(10, 4), vec![4, 4, 2]);
        assert_eq!(block_count(10, 4), 3);
    }

    #[test]
    fn zero_block_size_is_rejected() {
        assert!(split_slice(b"abc", 0).is_err());
        assert!(BlockReader::new(std::io::empty(), 0).is_err());
    }

    #[test]
    fn short_reads_still_fill_blocks() {
        let data: Vec<u8> = (0..=255).collect();
        let reader = Trickle { data: &data, step: 3 };
        let blocks: Vec<_> = BlockReader::new(reader, 100)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        let sizes: Vec<_> = blocks.iter().map(|b| b.data.len()).collect();
        assert_eq!(sizes, vec![100, 100, 56]);
        assert_eq!(blocks[2].offset, 200);
    }

    proptest! {
        #[test]
        fn reader_agrees_with_slice_split(
            data in proptest::collection::vec(any::<u8>(), 0..=2048),
            max in 1usize..=300,
        ) {
            let from_slice = split_slice(&data, max).unwrap();
            let from_reader: Vec<_> = BlockReader::new(std::io::Cursor::new(&data), max)
                .unwrap()
                .collect::<Result<_>>()
                .unwrap();
            prop_assert_eq!(&from_slice, &from_reader);

            let sizes: Vec<u64> = from_slice.iter().map(|b| b.data.len() as u64).collect();
            prop_assert_eq!(sizes, expected_block_sizes(data.len() as u64, max));

            let joined: Vec<u8> = from_slice.iter().flat_map(|b| b.data.clone()).collect();
            prop_assert_eq!(joined, data);
        }
    }
}
