//! SHA-256 checksum engine for chunk files and byte slices
//!
//! Input is always treated as raw bytes. Files are streamed in fixed-size
//! blocks so multi-GiB chunks never need to fit in memory.

use anyhow::{Context, Result};
use relay_core::Digest;
use sha2::{Digest as _, Sha256};
use std::io::{self, Read, Write};
use std::path::Path;

/// Read block size for streaming hashes
pub const HASH_BLOCK_SIZE: usize = 64 * 1024;

/// Hash a byte slice in memory.
pub fn digest_bytes(data: &[u8]) -> Digest {
    let bytes: [u8; 32] = Sha256::digest(data).into();
    Digest::from(bytes)
}

/// Hash everything `reader` yields, `HASH_BLOCK_SIZE` bytes at a time.
pub fn digest_reader<R: Read>(mut reader: R) -> io::Result<Digest> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BLOCK_SIZE];

    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..n]);
    }

    let bytes: [u8; 32] = hasher.finalize().into();
    Ok(Digest::from(bytes))
}

/// Hash a file from disk using the streaming interface.
pub fn digest_file(path: &Path) -> Result<Digest> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("opening file for hashing: {}", path.display()))?;
    digest_reader(file).with_context(|| format!("reading for hash: {}", path.display()))
}

/// `Write` adapter that hashes every byte passed through to the inner writer.
pub struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    /// Consume the adapter, returning the inner writer and the digest.
    pub fn finish(self) -> (W, Digest) {
        let bytes: [u8; 32] = self.hasher.finalize().into();
        (self.inner, Digest::from(bytes))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        // Only hash what the inner writer accepted
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn empty_digest_is_known_value() {
        assert_eq!(
            digest_bytes(b"").as_str(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn abc_digest_is_known_value() {
        assert_eq!(
            digest_bytes(b"abc").as_str(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn file_digest_matches_slice_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.bin");
        // Larger than one block so the streaming loop runs more than once
        let data: Vec<u8> = (0..(HASH_BLOCK_SIZE * 3 + 17)).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        assert_eq!(digest_file(&path).unwrap(), digest_bytes(&data));
    }

    #[test]
    fn missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(digest_file(&dir.path().join("nope")).is_err());
    }

    #[test]
    fn hashing_writer_matches_digest() {
        let mut w = HashingWriter::new(Vec::new());
        w.write_all(b"hello ").unwrap();
        w.write_all(b"chunks").unwrap();
        let (inner, digest) = w.finish();
        assert_eq!(inner, b"hello chunks");
        assert_eq!(digest, digest_bytes(b"hello chunks"));
    }

    proptest! {
        #[test]
        fn digest_is_deterministic(data in proptest::collection::vec(any::<u8>(), 0..=4096)) {
            prop_assert_eq!(digest_bytes(&data), digest_bytes(&data));
        }

        #[test]
        fn single_byte_flip_changes_digest(
            data in proptest::collection::vec(any::<u8>(), 1..=2048),
            pos in any::<prop::sample::Index>(),
            mask in 1u8..=255,
        ) {
            let mut flipped = data.clone();
            let i = pos.index(flipped.len());
            flipped[i] ^= mask;
            prop_assert_ne!(digest_bytes(&data), digest_bytes(&flipped));
        }

        #[test]
        fn reader_matches_slice(data in proptest::collection::vec(any::<u8>(), 0..=8192)) {
            let streamed = digest_reader(std::io::Cursor::new(&data)).unwrap();
            prop_assert_eq!(streamed, digest_bytes(&data));
        }
    }
}
