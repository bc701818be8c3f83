//! relay-chunks: chunk identity and production
//!
//! # Overview
//! - `digest`: SHA-256 checksum engine (streaming, byte-exact)
//! - `naming`: the `<base>.part<NNN>` filename convention
//! - `split`: sequential fixed-size splitter that hashes while it writes

pub mod digest;
pub mod naming;
pub mod split;

// Convenience re-exports for the most common operations
pub use digest::{digest_bytes, digest_file, digest_reader, HashingWriter};
pub use naming::{chunk_name, parse_chunk_name, ChunkName, FIRST_PART_INDEX, PART_SEPARATOR};
pub use split::{SplitChunk, Splitter};
