/// Streaming MD5 over the bytes published as chunks.

use md5::{Digest, Md5};

/// Incremental digest of the logical byte stream, independent of chunk framing.
pub struct ChunkHasher {
    inner: Md5,
    bytes_hashed: u64,
}

impl ChunkHasher {
    pub fn new() -> Self {
        Self {
            inner: Md5::new(),
            bytes_hashed: 0,
        }
    }

    /// Feed the next chunk, in send order.
    pub fn update(&mut self, chunk: &[u8]) {
        self.inner.update(chunk);
        self.bytes_hashed += chunk.len() as u64;
    }

    #[inline]
    pub fn bytes_hashed(&self) -> u64 {
        self.bytes_hashed
    }

    /// Lowercase hex digest.
    pub fn finalize_hex(self) -> String {
        hex::encode(self.inner.finalize())
    }
}

impl Default for ChunkHasher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input() {
        let h = ChunkHasher::new();
        assert_eq!(h.finalize_hex(), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn known_vector() {
        let mut h = ChunkHasher::new();
        h.update(b"The quick brown fox jumps over the lazy dog");
        assert_eq!(h.finalize_hex(), "9e107d9d372bb6826bd81d3542a419d6");
    }

    #[test]
    fn chunk_boundaries_do_not_matter() {
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();

        let mut one_pass = ChunkHasher::new();
        one_pass.update(&data);
        let expected = one_pass.finalize_hex();

        for size in [1usize, 7, 256, 700, 4999] {
            let mut h = ChunkHasher::new();
            for chunk in data.chunks(size) {
                h.update(chunk);
            }
            assert_eq!(h.bytes_hashed(), data.len() as u64);
            assert_eq!(h.finalize_hex(), expected, "chunk size {}", size);
        }
    }
}
