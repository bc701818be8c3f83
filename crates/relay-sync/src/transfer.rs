//! Pacing, polling and durable-write helpers shared by producer and consumer

use anyhow::Context;
use relay_core::config::TransferConfig;
use relay_core::{RelayError, RelayResult};
use relay_storage::{RemoteStore, StoreError};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Timing knobs copied out of `TransferConfig`
#[derive(Debug, Clone)]
pub(crate) struct Pacing {
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub op_timeout: Duration,
    pub poll_interval: Duration,
    pub wait_timeout: Option<Duration>,
}

impl Pacing {
    pub fn from_config(t: &TransferConfig) -> Self {
        Self {
            max_attempts: t.max_attempts.max(1),
            retry_delay: t.retry_delay(),
            op_timeout: t.op_timeout(),
            poll_interval: t.poll_interval(),
            wait_timeout: t.wait_timeout(),
        }
    }
}

/// Sleep for `d` unless the run is cancelled first.
pub(crate) async fn pause(d: Duration, cancel: &CancellationToken) -> RelayResult<()> {
    tokio::select! {
        _ = tokio::time::sleep(d) => Ok(()),
        _ = cancel.cancelled() => Err(RelayError::Cancelled),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wait {
    Reached,
    TimedOut,
}

/// Poll `exists(name)` until it equals `present`.
///
/// Transient errors are logged and polled through; `Auth` is returned as
/// `AuthFailed`.
pub(crate) async fn wait_for_presence<S: RemoteStore>(
    store: &S,
    name: &str,
    present: bool,
    pacing: &Pacing,
    cancel: &CancellationToken,
) -> RelayResult<Wait> {
    let deadline = pacing.wait_timeout.map(|t| Instant::now() + t);
    loop {
        if cancel.is_cancelled() {
            return Err(RelayError::Cancelled);
        }
        match tokio::time::timeout(pacing.op_timeout, store.exists(name)).await {
            Ok(Ok(found)) if found == present => return Ok(Wait::Reached),
            Ok(Ok(_)) => {}
            Ok(Err(StoreError::Auth(msg))) => return Err(RelayError::AuthFailed(msg)),
            Ok(Err(e)) => debug!(object = %name, error = %e, "existence check failed, polling again"),
            Err(_) => warn!(object = %name, "existence check timed out, polling again"),
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Ok(Wait::TimedOut);
        }
        pause(pacing.poll_interval, cancel).await?;
    }
}

/// `<path>.partial`, the name a file is written under before it is renamed
pub(crate) fn partial_path(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".partial");
    PathBuf::from(s)
}

/// Write `data` to a sibling `.partial` file, fsync, then rename over `path`.
pub(crate) async fn write_durably(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating dir: {}", parent.display()))?;
    }
    let tmp = partial_path(path);
    let mut file = tokio::fs::File::create(&tmp)
        .await
        .with_context(|| format!("creating {}", tmp.display()))?;
    file.write_all(data)
        .await
        .with_context(|| format!("writing {}", tmp.display()))?;
    file.sync_all()
        .await
        .with_context(|| format!("syncing {}", tmp.display()))?;
    drop(file);
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("renaming to: {}", path.display()))?;
    Ok(())
}
