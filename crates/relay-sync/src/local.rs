//! Verify and merge runs over a local chunks directory, no remote involved

use relay_core::{ChunkEntry, RelayResult, VerificationResult};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, warn};

use crate::consumer::GroupOutcome;
use crate::grouper::group;
use crate::manifest::Manifest;
use crate::merger::{merge_group, ChunkResolver, DirResolver, MergeReport};
use crate::verifier::verify_file;

/// Per-origin results of a local merge run
#[derive(Debug, Default)]
pub struct MergeRunReport {
    pub groups: BTreeMap<String, GroupOutcome>,
}

impl MergeRunReport {
    pub fn all_merged(&self) -> bool {
        self.groups.values().all(GroupOutcome::is_merged)
    }

    pub fn merged(&self) -> impl Iterator<Item = &MergeReport> {
        self.groups.values().filter_map(|g| match g {
            GroupOutcome::Merged(r) => Some(r),
            GroupOutcome::NotMerged(_) => None,
        })
    }
}

/// Merge every origin listed in the manifest, each group on its own.
///
/// Manifest and grouping errors abort; a broken group is reported and the
/// remaining groups are still merged.
pub fn merge_local(manifest_path: &Path, chunks_dir: &Path, output_dir: &Path) -> RelayResult<MergeRunReport> {
    let manifest = Manifest::load(manifest_path)?;
    let groups = group(manifest.entries())?;
    let resolver = DirResolver::new(chunks_dir);

    let mut report = MergeRunReport::default();
    for (base, g) in groups {
        let outcome = match merge_group(&g, &resolver, output_dir) {
            Ok(r) => GroupOutcome::Merged(r),
            Err(e) => {
                warn!(origin = %base, error = %e, "origin not merged");
                GroupOutcome::NotMerged(e)
            }
        };
        report.groups.insert(base, outcome);
    }

    info!(
        merged = report.merged().count(),
        groups = report.groups.len(),
        output = %output_dir.display(),
        "local merge finished"
    );
    Ok(report)
}

/// Check every manifest entry against the chunks directory, in manifest order.
pub fn verify_local(manifest_path: &Path, chunks_dir: &Path) -> RelayResult<Vec<(ChunkEntry, VerificationResult)>> {
    let manifest = Manifest::load(manifest_path)?;
    let resolver = DirResolver::new(chunks_dir);
    manifest
        .entries()
        .iter()
        .map(|e| -> RelayResult<_> { Ok((e.clone(), verify_file(e, &resolver.resolve(e))?)) })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ManifestWriter;
    use relay_chunks::digest_bytes;
    use relay_core::RelayError;

    /// `(name, bytes on disk, bytes the manifest expects)`
    fn setup(chunks: &[(&str, &str, &str)]) -> tempfile::TempDir {
        let tmp = tempfile::tempdir().unwrap();
        let mut w = ManifestWriter::create(&tmp.path().join("manifest.txt")).unwrap();
        for (name, on_disk, expected) in chunks {
            std::fs::write(tmp.path().join(name), on_disk).unwrap();
            w.append(&ChunkEntry::new(digest_bytes(expected.as_bytes()), *name).unwrap())
                .unwrap();
        }
        tmp
    }

    #[test]
    fn broken_group_does_not_block_others() {
        let tmp = setup(&[
            ("super.zip.part000", "AB", "AB"),
            ("super.zip.part001", "XX", "CD"),
            ("show.zip.part000", "12", "12"),
            ("show.zip.part001", "34", "34"),
        ]);
        let out = tmp.path().join("out");

        let report = merge_local(&tmp.path().join("manifest.txt"), tmp.path(), &out).unwrap();
        assert!(!report.all_merged());
        assert!(report.groups["show.zip"].is_merged());
        assert!(matches!(
            &report.groups["super.zip"],
            GroupOutcome::NotMerged(RelayError::ChunkRejected { chunk, .. }) if chunk == "super.zip.part001"
        ));
        assert_eq!(std::fs::read(out.join("show.zip")).unwrap(), b"1234");
        assert!(!out.join("super.zip").exists());
    }

    #[test]
    fn verify_reports_each_chunk() {
        let tmp = setup(&[("a.part000", "AB", "AB"), ("a.part001", "XX", "CD")]);
        std::fs::remove_file(tmp.path().join("a.part000")).unwrap();

        let results = verify_local(&tmp.path().join("manifest.txt"), tmp.path()).unwrap();
        assert_eq!(results[0].1, VerificationResult::Missing);
        assert!(matches!(results[1].1, VerificationResult::Corrupt { .. }));
    }

    #[test]
    fn malformed_manifest_aborts() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("manifest.txt"), "garbage\n").unwrap();
        let err = merge_local(&tmp.path().join("manifest.txt"), tmp.path(), tmp.path()).unwrap_err();
        assert!(matches!(err, RelayError::MalformedManifestLine { .. }), "{err}");
    }
}
