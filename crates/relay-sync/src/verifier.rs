//! Chunk verification against manifest entries
//!
//! Verification only reads. Deleting a bad or surplus chunk is always the
//! caller's decision.

use anyhow::Context;
use relay_chunks::{digest_bytes, digest_reader};
use relay_core::{ChunkEntry, RelayResult, VerificationResult};
use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;

fn compare(entry: &ChunkEntry, actual: relay_core::Digest) -> VerificationResult {
    if entry.digest().matches(actual.as_str()) {
        VerificationResult::Verified
    } else {
        VerificationResult::Corrupt {
            expected: entry.digest().clone(),
            actual,
        }
    }
}

/// Verify in-memory chunk bytes; `None` means the chunk could not be located.
pub fn verify_bytes(entry: &ChunkEntry, data: Option<&[u8]>) -> VerificationResult {
    match data {
        None => VerificationResult::Missing,
        Some(bytes) => compare(entry, digest_bytes(bytes)),
    }
}

/// Verify the chunk file at `path`, streaming it through the checksum engine.
///
/// A file that does not exist is `Missing`. Any other I/O failure is an error,
/// not a verdict about the chunk.
pub fn verify_file(entry: &ChunkEntry, path: &Path) -> RelayResult<VerificationResult> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(VerificationResult::Missing),
        Err(e) => {
            return Err(anyhow::Error::new(e)
                .context(format!("opening chunk for verify: {}", path.display()))
                .into())
        }
    };
    let actual = digest_reader(BufReader::new(file))
        .with_context(|| format!("hashing chunk: {}", path.display()))?;
    Ok(compare(entry, actual))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn entry_for(data: &[u8], name: &str) -> ChunkEntry {
        ChunkEntry::new(digest_bytes(data), name).unwrap()
    }

    #[test]
    fn matching_bytes_verify() {
        let e = entry_for(b"AB", "a.part000");
        assert_eq!(verify_bytes(&e, Some(b"AB")), VerificationResult::Verified);
    }

    #[test]
    fn absent_bytes_are_missing() {
        let e = entry_for(b"AB", "a.part000");
        assert_eq!(verify_bytes(&e, None), VerificationResult::Missing);
    }

    #[test]
    fn mismatch_reports_both_digests() {
        let e = entry_for(b"AB", "a.part000");
        match verify_bytes(&e, Some(b"AX")) {
            VerificationResult::Corrupt { expected, actual } => {
                assert_eq!(&expected, e.digest());
                assert_eq!(actual, digest_bytes(b"AX"));
            }
            other => panic!("expected Corrupt, got {other:?}"),
        }
    }

    #[test]
    fn file_verify_is_idempotent_and_read_only() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("a.part000");
        std::fs::write(&path, b"payload").unwrap();
        let e = entry_for(b"payload", "a.part000");

        let first = verify_file(&e, &path).unwrap();
        let second = verify_file(&e, &path).unwrap();
        assert_eq!(first, VerificationResult::Verified);
        assert_eq!(first, second);
        assert_eq!(std::fs::read(&path).unwrap(), b"payload");
    }

    #[test]
    fn corrupt_file_is_left_in_place() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("a.part000");
        std::fs::write(&path, b"tampered").unwrap();
        let e = entry_for(b"payload", "a.part000");

        assert!(matches!(
            verify_file(&e, &path).unwrap(),
            VerificationResult::Corrupt { .. }
        ));
        assert!(path.exists());
    }

    #[test]
    fn missing_file_is_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let e = entry_for(b"x", "gone.part000");
        assert_eq!(
            verify_file(&e, &tmp.path().join("gone.part000")).unwrap(),
            VerificationResult::Missing
        );
    }

    proptest! {
        #[test]
        fn any_single_byte_flip_is_corrupt(
            data in proptest::collection::vec(any::<u8>(), 1..512),
            pos in any::<proptest::sample::Index>(),
            mask in 1u8..=255,
        ) {
            let e = entry_for(&data, "p.part000");
            let mut flipped = data.clone();
            let i = pos.index(flipped.len());
            flipped[i] ^= mask;
            let is_corrupt = matches!(verify_bytes(&e, Some(&flipped)), VerificationResult::Corrupt { .. });
            prop_assert!(is_corrupt);
        }
    }
}
