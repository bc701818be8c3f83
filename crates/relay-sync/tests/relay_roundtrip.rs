//! Integration test: produce → consume → merge round trip
//!
//! Producer and consumer run concurrently against one remote folder, the
//! producer waiting for every chunk to be taken before it uploads the next.
//! Uses OpenDAL's in-memory and fs backends so no WebDAV server is required.

use relay_core::config::{RelayConfig, RemoteBackend, RemoteConfig};
use relay_storage::{build_operator, memory_operator, OpendalStore, RemoteStore, MANIFEST_NAME};
use relay_sync::{Consumer, Producer};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn write_origin(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
    std::fs::create_dir_all(dir).unwrap();
    let path = dir.join(name);
    std::fs::write(&path, content).expect("write origin");
    path
}

fn side_config(root: &Path, chunk_size: u64) -> RelayConfig {
    let mut c = RelayConfig::default();
    c.paths.manifest = root.join("chunks/manifest.txt");
    c.paths.chunks_dir = root.join("chunks");
    c.paths.output_dir = Some(root.join("merged"));
    c.transfer.chunk_size_bytes = chunk_size;
    c.transfer.retry_delay_ms = 1;
    c.transfer.poll_interval_ms = 2;
    c.transfer.wait_timeout_secs = 10;
    c.transfer.op_timeout_secs = 10;
    c
}

async fn relay<S: RemoteStore>(store: Arc<S>, tmp: &TempDir, origins: &[(&str, Vec<u8>)], chunk_size: u64) {
    let producer_root = tmp.path().join("vps");
    let consumer_root = tmp.path().join("laptop");
    let paths: Vec<PathBuf> = origins
        .iter()
        .map(|(name, data)| write_origin(&producer_root.join("downloads"), name, data))
        .collect();

    let producer = Producer::new(Arc::clone(&store), &side_config(&producer_root, chunk_size));
    let consumer_cfg = side_config(&consumer_root, chunk_size);
    let consumer = Consumer::new(Arc::clone(&store), &consumer_cfg);

    let cancel = CancellationToken::new();
    let (produced, consumed) = tokio::join!(
        producer.produce(&paths, cancel.clone()),
        consumer.run(cancel.clone())
    );
    let produced = produced.expect("produce should succeed");
    let consumed = consumed.expect("consume should succeed");

    assert!(consumed.all_merged(), "failures: {:?}", consumed.failures().collect::<Vec<_>>());
    assert_eq!(produced.acknowledged, produced.chunks);
    for (name, data) in origins {
        let merged = std::fs::read(consumer_root.join("merged").join(name)).unwrap();
        assert_eq!(&merged, data, "{name} must match its origin byte for byte");
    }

    // Only the manifest is left behind on the remote
    assert_eq!(store.list().await.unwrap(), vec![MANIFEST_NAME.to_string()]);
    // Both sides cleaned up their chunk files
    for (name, _) in origins {
        assert!(!producer_root.join("chunks").join(format!("{name}.part000")).exists());
        assert!(!consumer_root.join("chunks").join(format!("{name}.part000")).exists());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn roundtrip_multiple_origins_in_memory() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(OpendalStore::new(memory_operator().unwrap(), "chunks"));

    let binary: Vec<u8> = (0..=255u8).cycle().take(5000).collect();
    let origins = vec![
        ("super.zip", binary),
        ("show.mkv", b"a short episode".to_vec()),
        ("empty.txt", Vec::new()),
    ];
    relay(store, &tmp, &origins, 512).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn roundtrip_over_fs_backend() {
    let tmp = TempDir::new().unwrap();
    let remote_root = tmp.path().join("remote");
    std::fs::create_dir_all(&remote_root).unwrap();
    let remote = RemoteConfig {
        backend: RemoteBackend::Fs,
        root: remote_root.to_string_lossy().into_owned(),
        ..Default::default()
    };
    let store = Arc::new(OpendalStore::new(build_operator(&remote, None).unwrap(), "relay"));

    let data: Vec<u8> = (0..3000u32).map(|i| (i * 7 % 251) as u8).collect();
    relay(store, &tmp, &[("disk.img", data)], 1000).await;
}
