//! Consumer side of the relay: fetch, verify, delete, merge
//!
//! Per chunk:
//!
//! ```text
//! Pending -> Fetched -> Verified -> RemoteDeleted -> MergeEligible
//! Pending -> Fetched -> Corrupt      (retried up to max_attempts)
//! Pending -> FetchFailed             (retried up to max_attempts)
//! ```
//!
//! A remote chunk is only ever deleted after its local copy has been written,
//! fsynced and re-hashed from disk. Each origin group runs as its own task
//! with one task per member; the group merges once every member task has
//! finished (a join barrier), so a broken group never holds up another.

use relay_core::config::RelayConfig;
use relay_core::{ChunkEntry, RelayError, RelayResult, VerificationResult};
use relay_storage::{RemoteStore, StoreError, MANIFEST_NAME};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::{ChunkState, EventFn, TransferEvent};
use crate::grouper::{group, OriginGroup};
use crate::manifest::Manifest;
use crate::merger::{merge_group, DirResolver, MergeReport};
use crate::transfer::{pause, wait_for_presence, write_durably, Pacing, Wait};
use crate::verifier::verify_file;

/// Final state of one origin group
#[derive(Debug)]
pub enum GroupOutcome {
    Merged(MergeReport),
    /// The reason is actionable: which part is missing, or which chunk to re-fetch
    NotMerged(RelayError),
}

impl GroupOutcome {
    pub fn is_merged(&self) -> bool {
        matches!(self, GroupOutcome::Merged(_))
    }
}

/// What a consume run achieved
#[derive(Debug, Default)]
pub struct ConsumeReport {
    pub groups: BTreeMap<String, GroupOutcome>,
    /// Last transfer state of every chunk (before merging)
    pub chunks: BTreeMap<String, ChunkState>,
}

impl ConsumeReport {
    /// True when every origin group was written; drives the exit status.
    pub fn all_merged(&self) -> bool {
        self.groups.values().all(GroupOutcome::is_merged)
    }

    pub fn merged(&self) -> impl Iterator<Item = &MergeReport> {
        self.groups.values().filter_map(|g| match g {
            GroupOutcome::Merged(r) => Some(r),
            GroupOutcome::NotMerged(_) => None,
        })
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &RelayError)> {
        self.groups.iter().filter_map(|(base, g)| match g {
            GroupOutcome::NotMerged(e) => Some((base.as_str(), e)),
            GroupOutcome::Merged(_) => None,
        })
    }

    /// Chunks that verified locally but whose remote copy could not be deleted
    pub fn delete_failures(&self) -> usize {
        self.chunks
            .values()
            .filter(|s| **s == ChunkState::Verified)
            .count()
    }
}

#[derive(Debug, Clone)]
struct Settings {
    manifest_path: PathBuf,
    chunks_dir: PathBuf,
    output_dir: PathBuf,
    concurrency: usize,
    cleanup_local_chunks: bool,
    pacing: Pacing,
}

/// State shared by every task of one run
struct Shared<S> {
    store: Arc<S>,
    settings: Settings,
    events: Option<EventFn>,
    permits: Semaphore,
    cancel: CancellationToken,
    auth_error: OnceLock<String>,
}

impl<S: RemoteStore> Shared<S> {
    fn emit(&self, event: TransferEvent) {
        if let Some(cb) = &self.events {
            cb(&event);
        }
    }

    fn chunk_state(&self, name: &str, state: ChunkState) {
        self.emit(TransferEvent::Chunk {
            name: name.to_string(),
            state,
        });
    }

    /// Record an authentication failure and stop the whole run.
    fn auth_failed(&self, msg: String) -> RelayError {
        let _ = self.auth_error.set(msg.clone());
        self.cancel.cancel();
        RelayError::AuthFailed(msg)
    }

    fn fatal(&self, e: RelayError) -> RelayError {
        match e {
            RelayError::AuthFailed(msg) => self.auth_failed(msg),
            other => other,
        }
    }

    /// A network slot; waiting for one is cancellable.
    async fn permit(&self) -> RelayResult<SemaphorePermit<'_>> {
        tokio::select! {
            p = self.permits.acquire() => p.map_err(|_| RelayError::Cancelled),
            _ = self.cancel.cancelled() => Err(RelayError::Cancelled),
        }
    }

    /// `get` under the op timeout and a network permit.
    async fn get(&self, name: &str) -> RelayResult<Result<Vec<u8>, String>> {
        let _permit = self.permit().await?;
        let op_timeout = self.settings.pacing.op_timeout;
        let res = tokio::select! {
            r = tokio::time::timeout(op_timeout, self.store.get(name)) => r,
            _ = self.cancel.cancelled() => return Err(RelayError::Cancelled),
        };
        match res {
            Ok(Ok(bytes)) => Ok(Ok(bytes)),
            Ok(Err(StoreError::Auth(msg))) => Err(self.auth_failed(msg)),
            Ok(Err(e)) => Ok(Err(e.to_string())),
            Err(_) => Ok(Err(format!("timed out after {op_timeout:?}"))),
        }
    }

    async fn wait_for(&self, name: &str) -> RelayResult<Wait> {
        wait_for_presence(self.store.as_ref(), name, true, &self.settings.pacing, &self.cancel)
            .await
            .map_err(|e| self.fatal(e))
    }
}

/// Drives one consume run against a remote store.
pub struct Consumer<S> {
    store: Arc<S>,
    settings: Settings,
    events: Option<EventFn>,
}

impl<S: RemoteStore> Consumer<S> {
    pub fn new(store: Arc<S>, config: &RelayConfig) -> Self {
        Self {
            store,
            settings: Settings {
                manifest_path: config.paths.manifest.clone(),
                chunks_dir: config.paths.chunks_dir.clone(),
                output_dir: config.paths.resolved_output_dir(),
                concurrency: config.transfer.concurrency.max(1),
                cleanup_local_chunks: config.consumer.cleanup_local_chunks,
                pacing: Pacing::from_config(&config.transfer),
            },
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventFn) -> Self {
        self.events = Some(events);
        self
    }

    /// Fetch the manifest, then every chunk, merging each group as it completes.
    ///
    /// Returns `Err` only for run-level failures: manifest errors,
    /// `AuthFailed`, `Cancelled`. Per-group failures are in the report.
    /// Cancellation leaves verified chunks and the local manifest in place.
    pub async fn run(&self, cancel: CancellationToken) -> RelayResult<ConsumeReport> {
        let shared = Arc::new(Shared {
            store: Arc::clone(&self.store),
            settings: self.settings.clone(),
            events: self.events.clone(),
            permits: Semaphore::new(self.settings.concurrency),
            cancel: cancel.child_token(),
            auth_error: OnceLock::new(),
        });

        let result = run_inner(&shared).await;
        if let Some(msg) = shared.auth_error.get() {
            return Err(RelayError::AuthFailed(msg.clone()));
        }
        result
    }
}

async fn run_inner<S: RemoteStore>(shared: &Arc<Shared<S>>) -> RelayResult<ConsumeReport> {
    let manifest = fetch_manifest(shared).await?;
    let groups = group(manifest.entries())?;

    info!(
        chunks = manifest.len(),
        groups = groups.len(),
        manifest = %shared.settings.manifest_path.display(),
        "manifest fetched"
    );
    shared.emit(TransferEvent::ManifestFetched {
        chunks: manifest.len(),
        groups: groups.len(),
    });

    tokio::fs::create_dir_all(&shared.settings.chunks_dir)
        .await
        .map_err(RelayError::Io)?;

    let mut tasks = JoinSet::new();
    for (_, g) in groups {
        tasks.spawn(run_group(Arc::clone(shared), g));
    }

    let mut report = ConsumeReport::default();
    let mut first_err: Option<RelayError> = None;
    while let Some(joined) = tasks.join_next().await {
        let res = joined.unwrap_or_else(|e| Err(anyhow::anyhow!("group task failed: {e}").into()));
        match res {
            Ok((base, outcome, chunks)) => {
                report.chunks.extend(chunks);
                report.groups.insert(base, outcome);
            }
            Err(e) => {
                shared.cancel.cancel();
                first_err.get_or_insert(e);
            }
        }
    }

    match first_err {
        Some(e) => Err(e),
        None => {
            info!(
                merged = report.merged().count(),
                groups = report.groups.len(),
                "consume run finished"
            );
            Ok(report)
        }
    }
}

/// Wait for, download and persist the remote manifest.
async fn fetch_manifest<S: RemoteStore>(shared: &Shared<S>) -> RelayResult<Manifest> {
    let pacing = &shared.settings.pacing;
    info!(object = MANIFEST_NAME, "waiting for manifest");
    if shared.wait_for(MANIFEST_NAME).await? == Wait::TimedOut {
        return Err(RelayError::FetchFailed {
            name: MANIFEST_NAME.to_string(),
            reason: "timed out waiting for the manifest to appear".to_string(),
        });
    }

    let mut last_reason = String::new();
    for attempt in 1..=pacing.max_attempts {
        if attempt > 1 {
            pause(pacing.retry_delay, &shared.cancel).await?;
        }
        match shared.get(MANIFEST_NAME).await? {
            Ok(bytes) => {
                let manifest = Manifest::parse_bytes(&bytes)?;
                write_durably(&shared.settings.manifest_path, &bytes).await?;
                return Ok(manifest);
            }
            Err(reason) => {
                warn!(attempt, reason = %reason, "manifest download failed");
                last_reason = reason;
            }
        }
    }
    Err(RelayError::FetchFailed {
        name: MANIFEST_NAME.to_string(),
        reason: last_reason,
    })
}

type GroupResult = (String, GroupOutcome, Vec<(String, ChunkState)>);

async fn run_group<S: RemoteStore>(shared: Arc<Shared<S>>, group: OriginGroup) -> RelayResult<GroupResult> {
    let base = group.base_name().to_string();

    // Members of an incomplete group are still fetched so their remote
    // copies are released.
    let mut members = JoinSet::new();
    for m in group.members() {
        members.spawn(run_member(Arc::clone(&shared), m.entry.clone()));
    }

    let mut states = Vec::with_capacity(group.members().len());
    let mut first_err: Option<RelayError> = None;
    while let Some(joined) = members.join_next().await {
        match joined {
            Ok(Ok(s)) => states.push(s),
            Ok(Err(e)) => {
                first_err.get_or_insert(e);
            }
            Err(e) => {
                first_err.get_or_insert(anyhow::anyhow!("chunk task failed: {e}").into());
            }
        }
    }
    if let Some(e) = first_err {
        return Err(e);
    }
    states.sort();

    let outcome = match barrier_check(&group, &states) {
        Err(e) => GroupOutcome::NotMerged(e),
        Ok(()) => {
            for (name, _) in &states {
                shared.chunk_state(name, ChunkState::MergeEligible);
            }
            merge_and_cleanup(&shared, group).await
        }
    };

    match &outcome {
        GroupOutcome::Merged(r) => shared.emit(TransferEvent::GroupMerged {
            base: base.clone(),
            bytes: r.bytes,
        }),
        GroupOutcome::NotMerged(e) => {
            warn!(origin = %base, error = %e, "origin not merged");
            shared.emit(TransferEvent::GroupNotMerged {
                base: base.clone(),
                reason: e.to_string(),
            });
        }
    }
    Ok((base, outcome, states))
}

/// The group may merge only if it has no gaps and every member verified.
fn barrier_check(group: &OriginGroup, states: &[(String, ChunkState)]) -> RelayResult<()> {
    group.check_complete()?;
    match states.iter().find(|(_, s)| !s.is_verified()) {
        None => Ok(()),
        Some((name, state)) => Err(RelayError::ChunkRejected {
            base: group.base_name().to_string(),
            chunk: name.clone(),
            reason: match state {
                ChunkState::Corrupt => "checksum mismatch on every attempt".to_string(),
                _ => "could not be fetched".to_string(),
            },
        }),
    }
}

async fn merge_and_cleanup<S: RemoteStore>(shared: &Shared<S>, group: OriginGroup) -> GroupOutcome {
    let chunks_dir = shared.settings.chunks_dir.clone();
    let output_dir = shared.settings.output_dir.clone();
    let cleanup = shared.settings.cleanup_local_chunks;

    let merged = tokio::task::spawn_blocking(move || {
        let report = merge_group(&group, &DirResolver::new(&chunks_dir), &output_dir)?;
        if cleanup {
            remove_local_chunks(&group, &chunks_dir, &report.output);
        }
        Ok::<_, RelayError>(report)
    })
    .await;

    match merged {
        Ok(Ok(report)) => GroupOutcome::Merged(report),
        Ok(Err(e)) => GroupOutcome::NotMerged(e),
        Err(e) => GroupOutcome::NotMerged(anyhow::anyhow!("merge task failed: {e}").into()),
    }
}

fn remove_local_chunks(group: &OriginGroup, chunks_dir: &Path, output: &Path) {
    // Compare resolved paths: an unsplit origin merged into the chunks dir
    // is its own chunk, however either directory was spelled
    let output = match std::fs::canonicalize(output) {
        Ok(p) => p,
        Err(e) => {
            warn!(output = %output.display(), error = %e, "cannot resolve merged output, keeping local chunks");
            return;
        }
    };
    for m in group.members() {
        let path = chunks_dir.join(m.entry.filename());
        match std::fs::canonicalize(&path) {
            Ok(resolved) if resolved == output => continue,
            Ok(_) => {}
            Err(e) => {
                warn!(chunk = %path.display(), error = %e, "cannot resolve local chunk, keeping it");
                continue;
            }
        }
        if let Err(e) = std::fs::remove_file(&path) {
            warn!(chunk = %path.display(), error = %e, "failed to remove local chunk");
        }
    }
}

/// Bring one chunk to a terminal state.
async fn run_member<S: RemoteStore>(shared: Arc<Shared<S>>, entry: ChunkEntry) -> RelayResult<(String, ChunkState)> {
    let name = entry.filename().to_string();
    let path = shared.settings.chunks_dir.join(&name);
    let pacing = shared.settings.pacing.clone();
    shared.chunk_state(&name, ChunkState::Pending);

    // Resume: a verified local copy from an earlier run is not fetched again
    let resumable = match verify_on_disk(&entry, &path).await {
        Ok(v) => v == VerificationResult::Verified,
        Err(e) => {
            debug!(chunk = %name, error = %e, "local copy unreadable, fetching again");
            false
        }
    };
    if resumable {
        debug!(chunk = %name, "local copy already verified");
        shared.chunk_state(&name, ChunkState::Verified);
        let state = delete_remote(&shared, &name).await?;
        return Ok((name, state));
    }

    let mut state = ChunkState::FetchFailed;
    for attempt in 1..=pacing.max_attempts {
        if attempt > 1 {
            pause(pacing.retry_delay, &shared.cancel).await?;
        }

        if shared.wait_for(&name).await? == Wait::TimedOut {
            warn!(chunk = %name, "gave up waiting for chunk to appear");
            shared.chunk_state(&name, ChunkState::FetchFailed);
            return Ok((name, ChunkState::FetchFailed));
        }

        let bytes = match shared.get(&name).await? {
            Ok(bytes) => bytes,
            Err(reason) => {
                warn!(chunk = %name, attempt, reason = %reason, "fetch failed");
                state = ChunkState::FetchFailed;
                shared.chunk_state(&name, state);
                continue;
            }
        };

        if let Err(e) = write_durably(&path, &bytes).await {
            warn!(chunk = %name, attempt, error = %e, "storing chunk failed");
            state = ChunkState::FetchFailed;
            shared.chunk_state(&name, state);
            continue;
        }
        shared.chunk_state(&name, ChunkState::Fetched);

        let verified = match verify_on_disk(&entry, &path).await {
            Ok(v) => v,
            Err(e) => {
                warn!(chunk = %name, attempt, error = %e, "reading back chunk failed");
                state = ChunkState::FetchFailed;
                shared.chunk_state(&name, state);
                continue;
            }
        };
        match verified {
            VerificationResult::Verified => {
                info!(chunk = %name, bytes = bytes.len(), "verified");
                shared.chunk_state(&name, ChunkState::Verified);
                let state = delete_remote(&shared, &name).await?;
                return Ok((name, state));
            }
            VerificationResult::Corrupt { expected, actual } => {
                warn!(chunk = %name, attempt, %expected, %actual, "checksum mismatch");
                let _ = tokio::fs::remove_file(&path).await;
                state = ChunkState::Corrupt;
                shared.chunk_state(&name, state);
            }
            VerificationResult::Missing => {
                warn!(chunk = %name, attempt, "chunk vanished after write");
                state = ChunkState::FetchFailed;
                shared.chunk_state(&name, state);
            }
        }
    }

    warn!(chunk = %name, attempts = pacing.max_attempts, ?state, "giving up on chunk");
    Ok((name, state))
}

async fn verify_on_disk(entry: &ChunkEntry, path: &Path) -> RelayResult<VerificationResult> {
    let entry = entry.clone();
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || verify_file(&entry, &path))
        .await
        .map_err(|e| anyhow::anyhow!("verify task failed: {e}"))?
}

/// Delete the remote copy of a verified chunk.
///
/// Failures are retried, then logged; the local copy is already safe, so
/// they never fail the chunk.
async fn delete_remote<S: RemoteStore>(shared: &Shared<S>, name: &str) -> RelayResult<ChunkState> {
    let pacing = &shared.settings.pacing;
    let mut reason = String::new();
    for attempt in 1..=pacing.max_attempts {
        if attempt > 1 {
            pause(pacing.retry_delay, &shared.cancel).await?;
        }
        let res = {
            let _permit = shared.permit().await?;
            tokio::time::timeout(pacing.op_timeout, shared.store.delete(name)).await
        };
        match res {
            Ok(Ok(())) => {
                debug!(chunk = %name, "remote copy deleted");
                shared.chunk_state(name, ChunkState::RemoteDeleted);
                return Ok(ChunkState::RemoteDeleted);
            }
            Ok(Err(StoreError::Auth(msg))) => return Err(shared.auth_failed(msg)),
            Ok(Err(e)) => reason = e.to_string(),
            Err(_) => reason = format!("timed out after {:?}", pacing.op_timeout),
        }
    }

    let err = RelayError::DeleteFailed {
        name: name.to_string(),
        reason: reason.clone(),
    };
    warn!(chunk = %name, error = %err, "remote delete failed; local copy is verified");
    shared.emit(TransferEvent::DeleteFailed {
        name: name.to_string(),
        reason,
    });
    Ok(ChunkState::Verified)
}
