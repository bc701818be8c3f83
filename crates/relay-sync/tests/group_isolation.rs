//! Integration test: one broken origin never blocks another
//!
//! A manifest with a gap in one group and a corrupt remote chunk in another
//! still merges the healthy group in the same consume run, and reports the
//! broken ones with an actionable reason.

use relay_chunks::digest_bytes;
use relay_core::config::RelayConfig;
use relay_core::{ChunkEntry, RelayError};
use relay_storage::{memory_operator, OpendalStore, RemoteStore, MANIFEST_NAME};
use relay_sync::{merge_local, ChunkState, Consumer, GroupOutcome, Manifest};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn config(root: &std::path::Path) -> RelayConfig {
    let mut c = RelayConfig::default();
    c.paths.manifest = root.join("manifest.txt");
    c.paths.chunks_dir = root.join("chunks");
    c.paths.output_dir = Some(root.join("merged"));
    c.transfer.retry_delay_ms = 1;
    c.transfer.poll_interval_ms = 2;
    c.transfer.wait_timeout_secs = 2;
    c.transfer.op_timeout_secs = 5;
    c
}

async fn seed_remote(store: &OpendalStore) {
    // (name, bytes in the manifest, bytes actually on the remote)
    let chunks: [(&str, &str, &str); 6] = [
        ("super.zip.part000", "AB", "AB"),
        ("super.zip.part002", "EF", "EF"),
        ("show.zip.part000", "12", "12"),
        ("show.zip.part001", "34", "34"),
        ("notes.txt.part000", "no", "no"),
        ("notes.txt.part001", "te", "XX"),
    ];
    let mut manifest = Manifest::new();
    for (name, recorded, remote) in chunks {
        manifest.push(ChunkEntry::new(digest_bytes(recorded.as_bytes()), name).unwrap());
        store.put(name, remote.as_bytes().to_vec()).await.unwrap();
    }
    store
        .put(MANIFEST_NAME, manifest.serialize().into_bytes())
        .await
        .unwrap();
}

#[tokio::test]
async fn gap_and_corruption_stay_in_their_groups() {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(OpendalStore::new(memory_operator().unwrap(), "chunks"));
    seed_remote(&store).await;
    let cfg = config(tmp.path());

    let report = Consumer::new(Arc::clone(&store), &cfg)
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert!(!report.all_merged());
    assert!(report.groups["show.zip"].is_merged());
    assert_eq!(std::fs::read(tmp.path().join("merged/show.zip")).unwrap(), b"1234");

    match &report.groups["super.zip"] {
        GroupOutcome::NotMerged(RelayError::IncompleteGroup { missing, .. }) => {
            assert_eq!(missing, &[1])
        }
        other => panic!("expected IncompleteGroup, got {other:?}"),
    }
    match &report.groups["notes.txt"] {
        GroupOutcome::NotMerged(e) => {
            assert!(
                matches!(e, RelayError::ChunkRejected { chunk, .. } if chunk == "notes.txt.part001"),
                "{e}"
            );
            assert!(e.to_string().contains("re-fetch"));
        }
        other => panic!("expected ChunkRejected, got {other:?}"),
    }

    // Verified members of the gapped group were released remotely but kept
    // locally so a later run can merge them
    assert_eq!(report.chunks["super.zip.part000"], ChunkState::RemoteDeleted);
    assert!(!store.exists("super.zip.part000").await.unwrap());
    assert!(cfg.paths.chunks_dir.join("super.zip.part000").exists());

    // The corrupt chunk is still on the remote for a re-fetch
    assert_eq!(report.chunks["notes.txt.part001"], ChunkState::Corrupt);
    assert!(store.exists("notes.txt.part001").await.unwrap());
    assert!(!tmp.path().join("merged/notes.txt").exists());
}

#[tokio::test]
async fn later_local_merge_completes_the_repaired_group() {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(OpendalStore::new(memory_operator().unwrap(), "chunks"));
    seed_remote(&store).await;
    let cfg = config(tmp.path());

    Consumer::new(Arc::clone(&store), &cfg)
        .run(CancellationToken::new())
        .await
        .unwrap();

    // The operator fixes the corrupt chunk by hand and merges offline
    std::fs::write(cfg.paths.chunks_dir.join("notes.txt.part001"), b"te").unwrap();
    std::fs::write(cfg.paths.chunks_dir.join("notes.txt.part000"), b"no").unwrap();
    let report = merge_local(
        &cfg.paths.manifest,
        &cfg.paths.chunks_dir,
        &tmp.path().join("merged"),
    )
    .unwrap();

    assert!(report.groups["notes.txt"].is_merged());
    assert_eq!(std::fs::read(tmp.path().join("merged/notes.txt")).unwrap(), b"note");
    assert!(!report.groups["super.zip"].is_merged());
}
