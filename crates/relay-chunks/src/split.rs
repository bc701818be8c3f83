//! Sequential fixed-size splitting of an origin file into chunk files
//!
//! Each chunk is hashed while it is written, so the digest always describes
//! exactly the bytes that landed on disk. Chunk files are fsynced before they
//! are handed to the caller.

use anyhow::{bail, Context, Result};
use relay_core::{is_safe_chunk_name, Digest};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::digest::HashingWriter;
use crate::naming::{chunk_name, FIRST_PART_INDEX};

/// One chunk file written by the splitter
#[derive(Debug, Clone)]
pub struct SplitChunk {
    pub index: u32,
    pub filename: String,
    pub path: PathBuf,
    pub len: u64,
    pub digest: Digest,
}

/// Iterator over the chunks of one origin file.
///
/// An empty origin still yields one (empty) chunk so it can be reassembled.
pub struct Splitter {
    reader: BufReader<File>,
    origin: PathBuf,
    base: String,
    chunks_dir: PathBuf,
    chunk_size: u64,
    total: u64,
    remaining: u64,
    next_index: u32,
    started: bool,
}

impl Splitter {
    pub fn open(origin: &Path, chunks_dir: &Path, chunk_size: u64) -> Result<Self> {
        if chunk_size == 0 {
            bail!("chunk size must be > 0");
        }
        let base = origin
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .with_context(|| format!("origin has no UTF-8 file name: {}", origin.display()))?;
        if !is_safe_chunk_name(&base) {
            bail!("origin file name cannot be used for chunks: {base:?}");
        }

        let file = File::open(origin)
            .with_context(|| format!("opening origin: {}", origin.display()))?;
        let total = file
            .metadata()
            .with_context(|| format!("stat origin: {}", origin.display()))?
            .len();

        std::fs::create_dir_all(chunks_dir)
            .with_context(|| format!("creating chunks dir: {}", chunks_dir.display()))?;

        Ok(Self {
            reader: BufReader::new(file),
            origin: origin.to_path_buf(),
            base,
            chunks_dir: chunks_dir.to_path_buf(),
            chunk_size,
            total,
            remaining: total,
            next_index: FIRST_PART_INDEX,
            started: false,
        })
    }

    /// Origin name every chunk filename is derived from
    pub fn base_name(&self) -> &str {
        &self.base
    }

    pub fn total_bytes(&self) -> u64 {
        self.total
    }

    /// Number of chunks this origin will produce
    pub fn chunk_count(&self) -> u64 {
        self.total.div_ceil(self.chunk_size).max(1)
    }

    fn write_next(&mut self) -> Result<SplitChunk> {
        let filename = chunk_name(&self.base, self.next_index);
        let path = self.chunks_dir.join(&filename);
        let want = self.remaining.min(self.chunk_size);

        let file = File::create(&path)
            .with_context(|| format!("creating chunk: {}", path.display()))?;
        let mut writer = HashingWriter::new(BufWriter::new(file));
        let copied = io::copy(&mut (&mut self.reader).take(want), &mut writer)
            .with_context(|| format!("writing chunk: {}", path.display()))?;
        if copied != want {
            bail!(
                "origin {} shrank while splitting ({} of {} bytes read for {})",
                self.origin.display(),
                copied,
                want,
                filename
            );
        }

        let (buffered, digest) = writer.finish();
        let file = buffered
            .into_inner()
            .map_err(|e| e.into_error())
            .with_context(|| format!("flushing chunk: {}", path.display()))?;
        file.sync_all()
            .with_context(|| format!("syncing chunk: {}", path.display()))?;

        debug!(chunk = %filename, bytes = copied, digest = %digest, "chunk written");

        let chunk = SplitChunk {
            index: self.next_index,
            filename,
            path,
            len: copied,
            digest,
        };
        self.remaining -= copied;
        self.next_index += 1;
        Ok(chunk)
    }
}

impl Iterator for Splitter {
    type Item = Result<SplitChunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.started && self.remaining == 0 {
            return None;
        }
        self.started = true;
        let result = self.write_next();
        if result.is_err() {
            // Stop after the first failure
            self.remaining = 0;
        }
        Some(result)
    }
}
