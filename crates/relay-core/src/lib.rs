pub mod config;
pub mod error;
pub mod types;

pub use error::{RelayError, RelayResult};
pub use types::{
    is_safe_chunk_name, ChunkEntry, Digest, DigestError, VerificationResult, DIGEST_HEX_LEN,
};
