//! Producer side of the relay: split, record, upload
//!
//! Every chunk's manifest line is fsynced before any upload starts, so the
//! remote never holds a chunk the manifest does not describe. The manifest is
//! uploaded first; chunks follow in manifest order. With `wait_for_ack` the
//! producer keeps at most one chunk on the remote at a time and waits for the
//! consumer to delete it, which keeps quota-limited intermediate storage from
//! filling up.

use relay_chunks::Splitter;
use relay_core::config::RelayConfig;
use relay_core::{ChunkEntry, RelayError, RelayResult};
use relay_storage::{RemoteStore, StoreError, MANIFEST_NAME};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::{EventFn, TransferEvent};
use crate::manifest::ManifestWriter;
use crate::transfer::{pause, wait_for_presence, Pacing, Wait};

/// What a produce run achieved
#[derive(Debug, Clone, Default)]
pub struct ProduceReport {
    pub manifest: PathBuf,
    pub origins: usize,
    pub chunks: usize,
    pub bytes: u64,
    /// Chunks the consumer deleted from the remote before the run moved on
    pub acknowledged: usize,
}

/// A recorded chunk waiting to be uploaded
#[derive(Debug, Clone)]
struct Pending {
    name: String,
    path: PathBuf,
    len: u64,
}

pub struct Producer<S> {
    store: Arc<S>,
    manifest_path: PathBuf,
    chunks_dir: PathBuf,
    chunk_size: u64,
    wait_for_ack: bool,
    cleanup_local_chunks: bool,
    pacing: Pacing,
    events: Option<EventFn>,
}

impl<S: RemoteStore> Producer<S> {
    pub fn new(store: Arc<S>, config: &RelayConfig) -> Self {
        Self {
            store,
            manifest_path: config.paths.manifest.clone(),
            chunks_dir: config.paths.chunks_dir.clone(),
            chunk_size: config.transfer.chunk_size_bytes,
            wait_for_ack: config.producer.wait_for_ack,
            cleanup_local_chunks: config.producer.cleanup_local_chunks,
            pacing: Pacing::from_config(&config.transfer),
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventFn) -> Self {
        self.events = Some(events);
        self
    }

    fn emit(&self, event: TransferEvent) {
        if let Some(cb) = &self.events {
            cb(&event);
        }
    }

    /// Split `origins`, write the manifest, then upload manifest and chunks.
    pub async fn produce(&self, origins: &[PathBuf], cancel: CancellationToken) -> RelayResult<ProduceReport> {
        if origins.is_empty() {
            return Err(RelayError::Config("no origin files given".into()));
        }

        let pending = {
            let origins = origins.to_vec();
            let manifest_path = self.manifest_path.clone();
            let chunks_dir = self.chunks_dir.clone();
            let chunk_size = self.chunk_size;
            tokio::task::spawn_blocking(move || {
                record_chunks(&origins, &manifest_path, &chunks_dir, chunk_size)
            })
            .await
            .map_err(|e| anyhow::anyhow!("split task failed: {e}"))??
        };
        for p in &pending {
            self.emit(TransferEvent::ChunkRecorded {
                name: p.name.clone(),
                bytes: p.len,
            });
        }
        let bytes: u64 = pending.iter().map(|p| p.len).sum();
        info!(
            origins = origins.len(),
            chunks = pending.len(),
            bytes,
            manifest = %self.manifest_path.display(),
            "manifest written"
        );

        let manifest = tokio::fs::read(&self.manifest_path).await?;
        self.upload(MANIFEST_NAME, manifest, &cancel).await?;

        let mut acknowledged = 0;
        for p in &pending {
            let data = tokio::fs::read(&p.path).await?;
            self.upload(&p.name, data, &cancel).await?;
            self.emit(TransferEvent::Uploaded {
                name: p.name.clone(),
                bytes: p.len,
            });

            if self.wait_for_ack {
                debug!(chunk = %p.name, "waiting for consumer to take chunk");
                match wait_for_presence(self.store.as_ref(), &p.name, false, &self.pacing, &cancel).await? {
                    Wait::Reached => {
                        acknowledged += 1;
                        self.emit(TransferEvent::Acknowledged { name: p.name.clone() });
                    }
                    Wait::TimedOut => {
                        return Err(anyhow::anyhow!(
                            "consumer did not take {} within {:?}",
                            p.name,
                            self.pacing.wait_timeout.unwrap_or_default()
                        )
                        .into())
                    }
                }
            }

            if self.cleanup_local_chunks {
                if let Err(e) = tokio::fs::remove_file(&p.path).await {
                    warn!(chunk = %p.path.display(), error = %e, "failed to remove local chunk");
                }
            }
        }

        info!(chunks = pending.len(), acknowledged, "produce run finished");
        Ok(ProduceReport {
            manifest: self.manifest_path.clone(),
            origins: origins.len(),
            chunks: pending.len(),
            bytes,
            acknowledged,
        })
    }

    /// `put` with retries; `Auth` is never retried.
    async fn upload(&self, name: &str, data: Vec<u8>, cancel: &CancellationToken) -> RelayResult<()> {
        let mut reason = String::new();
        for attempt in 1..=self.pacing.max_attempts {
            if attempt > 1 {
                pause(self.pacing.retry_delay, cancel).await?;
            }
            let res = tokio::select! {
                r = tokio::time::timeout(self.pacing.op_timeout, self.store.put(name, data.clone())) => r,
                _ = cancel.cancelled() => return Err(RelayError::Cancelled),
            };
            match res {
                Ok(Ok(())) => {
                    debug!(object = %name, bytes = data.len(), "uploaded");
                    return Ok(());
                }
                Ok(Err(StoreError::Auth(msg))) => return Err(RelayError::AuthFailed(msg)),
                Ok(Err(e)) => reason = e.to_string(),
                Err(_) => reason = format!("timed out after {:?}", self.pacing.op_timeout),
            }
            warn!(object = %name, attempt, reason = %reason, "upload failed");
        }
        Err(anyhow::anyhow!(
            "upload of {name} failed after {} attempts: {reason}",
            self.pacing.max_attempts
        )
        .into())
    }
}

/// Split every origin and append each chunk to a fresh manifest.
fn record_chunks(
    origins: &[PathBuf],
    manifest_path: &Path,
    chunks_dir: &Path,
    chunk_size: u64,
) -> RelayResult<Vec<Pending>> {
    let mut writer = ManifestWriter::create(manifest_path)?;
    let mut seen = HashSet::new();
    let mut pending = Vec::new();

    for origin in origins {
        let splitter = Splitter::open(origin, chunks_dir, chunk_size)?;
        if !seen.insert(splitter.base_name().to_string()) {
            return Err(RelayError::Config(format!(
                "two origin files share the name {:?}",
                splitter.base_name()
            )));
        }
        info!(
            origin = %origin.display(),
            bytes = splitter.total_bytes(),
            chunks = splitter.chunk_count(),
            "splitting"
        );
        for chunk in splitter {
            let chunk = chunk?;
            writer.append(&ChunkEntry::new(chunk.digest, chunk.filename.clone())?)?;
            pending.push(Pending {
                name: chunk.filename,
                path: chunk.path,
                len: chunk.len,
            });
        }
    }
    Ok(pending)
}
