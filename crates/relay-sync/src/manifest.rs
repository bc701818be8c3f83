//! Chunk manifest: one `<hex-digest>  <filename>` line per chunk
//!
//! The text format is the one `sha256sum` emits, so a chunks directory can
//! also be checked with `sha256sum -c manifest.txt`. Line order is the order
//! chunks were produced; it seeds transfer order but never merge order.

use anyhow::Context;
use relay_core::{ChunkEntry, Digest, DigestError, RelayError, RelayResult, DIGEST_HEX_LEN};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Separator between digest and filename
pub const FIELD_SEPARATOR: &str = "  ";

/// Ordered list of chunk entries. Append-only while producing, read-only after.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    entries: Vec<ChunkEntry>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<ChunkEntry>) -> Self {
        Self { entries }
    }

    /// Parse manifest text. Blank lines are skipped; any other line that is
    /// not `<digest>  <filename>` fails the whole parse.
    pub fn parse(text: &str) -> RelayResult<Self> {
        let mut entries = Vec::new();
        for (i, raw) in text.split('\n').enumerate() {
            let line = raw.strip_suffix('\r').unwrap_or(raw);
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_line(i + 1, line)?);
        }
        Ok(Self { entries })
    }

    /// Parse raw manifest bytes. Invalid UTF-8 fails with
    /// `MalformedManifestLine` on the offending line.
    pub fn parse_bytes(bytes: &[u8]) -> RelayResult<Self> {
        match std::str::from_utf8(bytes) {
            Ok(text) => Self::parse(text),
            Err(e) => {
                let valid = &bytes[..e.valid_up_to()];
                let start = valid.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
                let end = bytes[start..]
                    .iter()
                    .position(|b| *b == b'\n')
                    .map_or(bytes.len(), |i| start + i);
                Err(RelayError::MalformedManifestLine {
                    line: valid.iter().filter(|b| **b == b'\n').count() + 1,
                    content: String::from_utf8_lossy(&bytes[start..end]).into_owned(),
                })
            }
        }
    }

    /// Inverse of [`Manifest::parse`]; every line ends with `\n`.
    pub fn serialize(&self) -> String {
        self.entries.iter().map(format_line).collect()
    }

    /// Read and parse a manifest file.
    pub fn load(path: &Path) -> RelayResult<Self> {
        let bytes = std::fs::read(path).with_context(|| format!("reading manifest: {}", path.display()))?;
        Self::parse_bytes(&bytes)
    }

    /// Append in memory (see [`ManifestWriter`] for the durable variant).
    pub fn push(&mut self, entry: ChunkEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[ChunkEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Parse a single non-blank line; `line_no` is 1-based and used in errors.
pub fn parse_line(line_no: usize, line: &str) -> RelayResult<ChunkEntry> {
    let malformed = || RelayError::MalformedManifestLine {
        line: line_no,
        content: line.to_string(),
    };

    let (hex, filename) = line.split_once(FIELD_SEPARATOR).ok_or_else(malformed)?;
    if filename.is_empty() {
        return Err(malformed());
    }
    let digest = match Digest::from_hex(hex) {
        Ok(d) => d,
        Err(DigestError::NotHex) => return Err(malformed()),
        Err(DigestError::Length { actual }) => {
            return Err(RelayError::InvalidDigestLength {
                line: line_no,
                expected: DIGEST_HEX_LEN,
                actual,
            })
        }
    };
    ChunkEntry::new(digest, filename)
}

/// Format one entry as a manifest line, including the trailing newline.
pub fn format_line(entry: &ChunkEntry) -> String {
    format!("{}{}{}\n", entry.digest(), FIELD_SEPARATOR, entry.filename())
}

/// Durable, append-only manifest file writer.
///
/// Every `append` is flushed and fsynced before it returns, so a recorded
/// entry survives a crash that happens during the following upload.
pub struct ManifestWriter {
    file: File,
    path: PathBuf,
}

impl ManifestWriter {
    /// Start a new manifest, truncating any previous run's file.
    pub fn create(path: &Path) -> RelayResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating manifest dir: {}", parent.display()))?;
        }
        let file = File::create(path)
            .with_context(|| format!("creating manifest: {}", path.display()))?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn append(&mut self, entry: &ChunkEntry) -> RelayResult<()> {
        self.file
            .write_all(format_line(entry).as_bytes())
            .with_context(|| format!("appending to manifest: {}", self.path.display()))?;
        self.file
            .sync_data()
            .with_context(|| format!("syncing manifest: {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use relay_chunks::digest_bytes;

    fn entry(data: &[u8], name: &str) -> ChunkEntry {
        ChunkEntry::new(digest_bytes(data), name).unwrap()
    }

    #[test]
    fn parses_sha256sum_output() {
        let text = "\
ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad  super.zip.part000

e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855  show.zip.part000
";
        let m = Manifest::parse(text).unwrap();
        assert_eq!(m.len(), 2);
        assert_eq!(m.entries()[0].filename(), "super.zip.part000");
        assert_eq!(m.entries()[1].digest(), &digest_bytes(b""));
    }

    #[test]
    fn accepts_crlf_and_missing_trailing_newline() {
        let d = digest_bytes(b"x");
        let text = format!("{d}  a.part000\r\n{d}  a.part001");
        let m = Manifest::parse(&text).unwrap();
        assert_eq!(m.entries()[0].filename(), "a.part000");
        assert_eq!(m.entries()[1].filename(), "a.part001");
    }

    #[test]
    fn filename_may_contain_spaces() {
        let d = digest_bytes(b"x");
        let m = Manifest::parse(&format!("{d}  my movie.mkv.part000\n")).unwrap();
        assert_eq!(m.entries()[0].filename(), "my movie.mkv.part000");
    }

    #[test]
    fn single_space_is_malformed() {
        let d = digest_bytes(b"x");
        let err = Manifest::parse(&format!("{d} a.part000\n")).unwrap_err();
        assert!(matches!(err, RelayError::MalformedManifestLine { line: 1, .. }), "{err}");
    }

    #[test]
    fn non_hex_digest_is_malformed() {
        let err = Manifest::parse("\nnot-a-digest  a.part000\n").unwrap_err();
        assert!(matches!(err, RelayError::MalformedManifestLine { line: 2, .. }), "{err}");
    }

    #[test]
    fn missing_filename_is_malformed() {
        let d = digest_bytes(b"x");
        let err = Manifest::parse(&format!("{d}  \n")).unwrap_err();
        assert!(matches!(err, RelayError::MalformedManifestLine { .. }), "{err}");
    }

    #[test]
    fn short_digest_is_invalid_length() {
        let err = Manifest::parse("abcdef  a.part000\n").unwrap_err();
        assert!(
            matches!(
                err,
                RelayError::InvalidDigestLength { line: 1, expected: 64, actual: 6 }
            ),
            "{err}"
        );
    }

    #[test]
    fn traversal_filename_is_rejected() {
        let d = digest_bytes(b"x");
        let err = Manifest::parse(&format!("{d}  ../../etc/passwd\n")).unwrap_err();
        assert!(matches!(err, RelayError::UnsafeChunkName(_)), "{err}");
    }

    #[test]
    fn uppercase_digest_is_normalized() {
        let d = digest_bytes(b"x");
        let upper = d.as_str().to_uppercase();
        let m = Manifest::parse(&format!("{upper}  a.part000\n")).unwrap();
        assert_eq!(m.entries()[0].digest(), &d);
    }

    #[test]
    fn writer_appends_durably() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested/manifest.txt");

        let mut w = ManifestWriter::create(&path).unwrap();
        w.append(&entry(b"AB", "a.part000")).unwrap();
        // Visible on disk before the writer is dropped
        assert_eq!(Manifest::load(&path).unwrap().len(), 1);
        w.append(&entry(b"CD", "a.part001")).unwrap();

        let m = Manifest::load(&path).unwrap();
        assert_eq!(
            m,
            Manifest::from_entries(vec![entry(b"AB", "a.part000"), entry(b"CD", "a.part001")])
        );
    }

    #[test]
    fn invalid_utf8_names_the_offending_line() {
        let d = digest_bytes(b"x");
        let mut bytes = format!("{d}  a.part000\n{d}  b").into_bytes();
        bytes.extend_from_slice(&[0xff, 0xfe]);
        bytes.extend_from_slice(b".part000\n");

        let err = Manifest::parse_bytes(&bytes).unwrap_err();
        assert!(matches!(err, RelayError::MalformedManifestLine { line: 2, .. }), "{err}");
        let ok = Manifest::parse_bytes(format!("{d}  a.part000\n").as_bytes()).unwrap();
        assert_eq!(ok.len(), 1);
    }

    #[test]
    fn create_truncates_previous_run() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("manifest.txt");
        ManifestWriter::create(&path).unwrap().append(&entry(b"old", "old.part000")).unwrap();
        let mut w = ManifestWriter::create(&path).unwrap();
        w.append(&entry(b"new", "new.part000")).unwrap();

        let m = Manifest::load(&path).unwrap();
        assert_eq!(m.len(), 1);
        assert_eq!(m.entries()[0].filename(), "new.part000");
    }

    fn arb_entry() -> impl Strategy<Value = ChunkEntry> {
        (
            proptest::collection::vec(any::<u8>(), 0..64),
            "[a-zA-Z0-9_][a-zA-Z0-9_. -]{0,30}",
        )
            .prop_map(|(data, name)| ChunkEntry::new(digest_bytes(&data), name).unwrap())
    }

    proptest! {
        #[test]
        fn parse_serialize_roundtrip(entries in proptest::collection::vec(arb_entry(), 0..40)) {
            let m = Manifest::from_entries(entries);
            let parsed = Manifest::parse(&m.serialize()).unwrap();
            prop_assert_eq!(parsed, m);
        }
    }
}
