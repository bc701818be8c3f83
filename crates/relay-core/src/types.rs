use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{RelayError, RelayResult};

/// Hex length of a SHA-256 digest
pub const DIGEST_HEX_LEN: usize = 64;

/// A content digest: exactly `DIGEST_HEX_LEN` lowercase hex chars
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DigestError {
    /// Empty or contains non-hex characters
    NotHex,
    /// Valid hex of the wrong length
    Length { actual: usize },
}

impl fmt::Display for DigestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DigestError::NotHex => write!(f, "digest is not a hex string"),
            DigestError::Length { actual } => {
                write!(f, "digest has {actual} hex chars, expected {DIGEST_HEX_LEN}")
            }
        }
    }
}

impl std::error::Error for DigestError {}

impl Digest {
    /// Parse a hex digest. Uppercase input is accepted and normalized.
    pub fn from_hex(hex: &str) -> Result<Self, DigestError> {
        if hex.is_empty() || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(DigestError::NotHex);
        }
        if hex.len() != DIGEST_HEX_LEN {
            return Err(DigestError::Length { actual: hex.len() });
        }
        Ok(Digest(hex.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Case-insensitive comparison against a digest string from any source.
    pub fn matches(&self, other: &str) -> bool {
        self.0.eq_ignore_ascii_case(other)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<[u8; 32]> for Digest {
    fn from(bytes: [u8; 32]) -> Self {
        use std::fmt::Write;
        let mut hex = String::with_capacity(DIGEST_HEX_LEN);
        for b in bytes {
            let _ = write!(hex, "{b:02x}");
        }
        Digest(hex)
    }
}

impl FromStr for Digest {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Digest::from_hex(s)
    }
}

impl TryFrom<String> for Digest {
    type Error = DigestError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Digest::from_hex(&value)
    }
}

impl From<Digest> for String {
    fn from(d: Digest) -> Self {
        d.0
    }
}

/// True if `name` is a bare filename that cannot escape the chunks directory.
pub fn is_safe_chunk_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0', '\n', '\r'])
}

/// One manifest line: a chunk's digest and its filename.
///
/// Immutable once constructed; the filename is checked with
/// [`is_safe_chunk_name`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChunkEntry {
    digest: Digest,
    filename: String,
}

impl ChunkEntry {
    pub fn new(digest: Digest, filename: impl Into<String>) -> RelayResult<Self> {
        let filename = filename.into();
        if !is_safe_chunk_name(&filename) {
            return Err(RelayError::UnsafeChunkName(filename));
        }
        Ok(ChunkEntry { digest, filename })
    }

    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }
}

/// Outcome of checking one chunk file against its manifest entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerificationResult {
    /// Present and digest matches
    Verified,
    /// No local file
    Missing,
    /// Present but digest differs
    Corrupt { expected: Digest, actual: Digest },
}

impl VerificationResult {
    pub fn is_verified(&self) -> bool {
        matches!(self, VerificationResult::Verified)
    }
}

impl fmt::Display for VerificationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerificationResult::Verified => write!(f, "verified"),
            VerificationResult::Missing => write!(f, "missing"),
            VerificationResult::Corrupt { expected, actual } => {
                write!(f, "checksum mismatch (expected {expected}, got {actual})")
            }
        }
    }
}
