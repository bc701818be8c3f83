//! Reassemble an origin file from its verified chunks
//!
//! Merging is all-or-nothing per group. Every member is re-verified before a
//! single output byte is written, the bytes are hashed again while they are
//! copied, and the result only appears under its final name after a
//! successful fsync + rename.

use anyhow::Context;
use relay_chunks::HashingWriter;
use relay_core::{ChunkEntry, RelayError, RelayResult, VerificationResult};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::grouper::OriginGroup;
use crate::verifier::verify_file;

/// Locates the local file holding a chunk.
pub trait ChunkResolver {
    fn resolve(&self, entry: &ChunkEntry) -> PathBuf;
}

/// Chunks live side by side in one directory under their manifest filename
#[derive(Debug, Clone)]
pub struct DirResolver {
    dir: PathBuf,
}

impl DirResolver {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl ChunkResolver for DirResolver {
    fn resolve(&self, entry: &ChunkEntry) -> PathBuf {
        self.dir.join(entry.filename())
    }
}

/// Result of one successful group merge
#[derive(Debug, Clone)]
pub struct MergeReport {
    pub base_name: String,
    pub output: PathBuf,
    pub bytes: u64,
    pub chunks: usize,
}

/// Name of the in-progress output file for `base`
fn merging_name(base: &str) -> String {
    format!(".{base}.merging")
}

/// Merge `group` into `output_dir/<base_name>`.
///
/// Fails with `IncompleteGroup` on a gap and with `ChunkRejected` naming the
/// first member that is missing, corrupt, or changed while being copied. On
/// failure no file named after the origin is created or modified.
pub fn merge_group<R>(group: &OriginGroup, resolver: &R, output_dir: &Path) -> RelayResult<MergeReport>
where
    R: ChunkResolver + ?Sized,
{
    group.check_complete()?;

    let base = group.base_name();
    let mut sources = Vec::with_capacity(group.members().len());
    for member in group.members() {
        let path = resolver.resolve(&member.entry);
        match verify_file(&member.entry, &path)? {
            VerificationResult::Verified => sources.push((&member.entry, path)),
            other => {
                return Err(RelayError::ChunkRejected {
                    base: base.to_string(),
                    chunk: member.entry.filename().to_string(),
                    reason: other.to_string(),
                })
            }
        }
    }

    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("creating output dir: {}", output_dir.display()))?;
    let output = output_dir.join(base);
    let tmp = output_dir.join(merging_name(base));

    let bytes = match write_merged(base, &sources, &tmp) {
        Ok(bytes) => bytes,
        Err(e) => {
            let _ = std::fs::remove_file(&tmp);
            return Err(e);
        }
    };

    if let Err(e) = std::fs::rename(&tmp, &output) {
        let _ = std::fs::remove_file(&tmp);
        return Err(anyhow::Error::new(e)
            .context(format!("renaming merged output to {}", output.display()))
            .into());
    }

    info!(
        origin = %base,
        output = %output.display(),
        chunks = sources.len(),
        bytes,
        "merged"
    );

    Ok(MergeReport {
        base_name: base.to_string(),
        output,
        bytes,
        chunks: sources.len(),
    })
}

fn write_merged(base: &str, sources: &[(&ChunkEntry, PathBuf)], tmp: &Path) -> RelayResult<u64> {
    let file = File::create(tmp).with_context(|| format!("creating {}", tmp.display()))?;
    let mut out = BufWriter::new(file);
    let mut total = 0u64;

    for (entry, path) in sources {
        let src = File::open(path).with_context(|| format!("opening chunk: {}", path.display()))?;
        let mut hashing = HashingWriter::new(&mut out);
        let copied = io::copy(&mut BufReader::new(src), &mut hashing)
            .with_context(|| format!("copying chunk: {}", path.display()))?;
        let (_, digest) = hashing.finish();

        if !entry.digest().matches(digest.as_str()) {
            return Err(RelayError::ChunkRejected {
                base: base.to_string(),
                chunk: entry.filename().to_string(),
                reason: format!("changed during merge (expected {}, got {digest})", entry.digest()),
            });
        }
        debug!(chunk = %entry.filename(), bytes = copied, "appended");
        total += copied;
    }

    out.flush().with_context(|| format!("flushing {}", tmp.display()))?;
    let file = out
        .into_inner()
        .map_err(|e| e.into_error())
        .with_context(|| format!("flushing {}", tmp.display()))?;
    file.sync_all()
        .with_context(|| format!("syncing {}", tmp.display()))?;
    Ok(total)
}
