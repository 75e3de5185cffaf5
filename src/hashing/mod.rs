//! # Streaming Digest Pipeline
//!
//! Incremental SHA-256 over byte sources in fixed-size chunks. Memory use is
//! one chunk buffer regardless of input size, which keeps multi-gigabyte
//! artifacts cheap to hash. The algorithm is fixed at compile time; digests
//! are always lower-case hex.

use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Default chunk size for hashing and copying (1 MiB)
pub const DEFAULT_CHUNK_BYTES: usize = 1024 * 1024;

/// SHA-256 of the empty input, as produced for zero-byte files
pub const EMPTY_DIGEST: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// Incremental hasher fed one chunk at a time
pub struct StreamingHasher {
    inner: Sha256,
    bytes_hashed: u64,
}

impl StreamingHasher {
    /// Create a fresh hasher
    pub fn new() -> Self {
        Self {
            inner: Sha256::new(),
            bytes_hashed: 0,
        }
    }

    /// Feed one chunk
    pub fn update(&mut self, chunk: &[u8]) {
        self.inner.update(chunk);
        self.bytes_hashed += chunk.len() as u64;
    }

    /// Total bytes fed so far
    pub fn bytes_hashed(&self) -> u64 {
        self.bytes_hashed
    }

    /// Consume the hasher and produce the lower-case hex digest
    pub fn finalize(self) -> String {
        hex::encode(self.inner.finalize())
    }
}

impl Default for StreamingHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Hash an async byte source to completion
///
/// The chunk buffer is allocated once and reused across iterations.
pub async fn hash_reader<R>(reader: &mut R, chunk_bytes: usize) -> std::io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut hasher = StreamingHasher::new();
    let mut buffer = vec![0u8; chunk_bytes.max(1)];

    loop {
        let read = reader.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(hasher.finalize())
}

/// Hash a file on disk to completion
pub async fn hash_file(path: &std::path::Path, chunk_bytes: usize) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    hash_reader(&mut file, chunk_bytes).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_empty_input_yields_well_known_digest() {
        let mut reader = Cursor::new(Vec::<u8>::new());
        let digest = hash_reader(&mut reader, 4096).await.unwrap();
        assert_eq!(digest, EMPTY_DIGEST);
    }

    #[tokio::test]
    async fn test_known_vector() {
        // SHA-256("abc")
        let mut reader = Cursor::new(b"abc".to_vec());
        let digest = hash_reader(&mut reader, 4096).await.unwrap();
        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_chunked_equals_one_shot() {
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();

        let mut small_chunks = Cursor::new(data.clone());
        let small = hash_reader(&mut small_chunks, 7).await.unwrap();

        let mut one_shot = Cursor::new(data);
        let large = hash_reader(&mut one_shot, 1 << 20).await.unwrap();

        assert_eq!(small, large);
    }

    #[test]
    fn test_incremental_tracks_bytes() {
        let mut hasher = StreamingHasher::new();
        hasher.update(b"ab");
        hasher.update(b"c");
        assert_eq!(hasher.bytes_hashed(), 3);
        assert_eq!(
            hasher.finalize(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_digest_is_lower_case() {
        let mut hasher = StreamingHasher::new();
        hasher.update(b"FORKER");
        let digest = hasher.finalize();
        assert_eq!(digest, digest.to_lowercase());
        assert_eq!(digest.len(), 64);
    }
}
