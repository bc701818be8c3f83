use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{RelayError, RelayResult};

/// Top-level configuration (loaded from chunkrelay.toml)
///
/// Passed explicitly to every component; nothing reads process-wide state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub paths: PathsConfig,
    pub remote: RemoteConfig,
    pub transfer: TransferConfig,
    pub producer: ProducerConfig,
    pub consumer: ConsumerConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Local manifest file
    pub manifest: PathBuf,
    /// Local directory holding chunk files
    pub chunks_dir: PathBuf,
    /// Where merged files are written (default: the manifest's directory)
    pub output_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteBackend {
    /// WebDAV server (Nextcloud/ownCloud style)
    Webdav,
    /// Local or network-mounted directory
    Fs,
    /// Process-local, for tests and dry runs
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub backend: RemoteBackend,
    /// WebDAV endpoint, e.g. https://dav.example.org
    pub endpoint: String,
    /// Root path on the endpoint (WebDAV path prefix or fs directory)
    pub root: String,
    /// Folder under root that holds the manifest and chunks
    pub folder: String,
    /// Refuse plaintext HTTP endpoints
    pub enforce_tls: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Producer chunk size in bytes
    pub chunk_size_bytes: u64,
    /// Maximum simultaneous network transfers
    pub concurrency: usize,
    /// Attempts per chunk before giving up
    pub max_attempts: u32,
    /// Delay between attempts
    pub retry_delay_ms: u64,
    /// Timeout for a single get/put
    pub op_timeout_secs: u64,
    /// Polling interval while waiting for remote objects to appear/disappear
    pub poll_interval_ms: u64,
    /// Give up waiting after this long (0 = wait forever)
    pub wait_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    /// Wait for the consumer to delete each chunk before uploading the next
    pub wait_for_ack: bool,
    /// Remove local chunk files once they are handed off
    pub cleanup_local_chunks: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Remove local chunk files of a group after it merged successfully
    pub cleanup_local_chunks: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            manifest: PathBuf::from("chunks/manifest.txt"),
            chunks_dir: PathBuf::from("chunks"),
            output_dir: None,
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            backend: RemoteBackend::Webdav,
            endpoint: "http://localhost:8080".into(),
            root: "/remote.php/webdav/".into(),
            folder: "chunks".into(),
            enforce_tls: false,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size_bytes: 1024 * 1024 * 1024,
            concurrency: 4,
            max_attempts: 3,
            retry_delay_ms: 3000,
            op_timeout_secs: 600,
            poll_interval_ms: 5000,
            wait_timeout_secs: 0,
        }
    }
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            wait_for_ack: true,
            cleanup_local_chunks: true,
        }
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            cleanup_local_chunks: true,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl PathsConfig {
    /// Output directory, falling back to the manifest's parent directory.
    pub fn resolved_output_dir(&self) -> PathBuf {
        if let Some(dir) = &self.output_dir {
            return dir.clone();
        }
        match self.manifest.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }
}

impl TransferConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_secs(self.op_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// `None` means wait indefinitely.
    pub fn wait_timeout(&self) -> Option<Duration> {
        (self.wait_timeout_secs > 0).then(|| Duration::from_secs(self.wait_timeout_secs))
    }
}

impl RelayConfig {
    /// Parse a TOML document and check value ranges.
    pub fn from_toml(text: &str) -> RelayResult<Self> {
        let config: RelayConfig =
            toml::from_str(text).map_err(|e| RelayError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`, or defaults when the file does not exist.
    pub fn load(path: &Path) -> RelayResult<Self> {
        if !path.exists() {
            return Ok(RelayConfig::default());
        }
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
            .map_err(|e| RelayError::Config(format!("{}: {e}", path.display())))
    }

    pub fn validate(&self) -> RelayResult<()> {
        if self.transfer.chunk_size_bytes == 0 {
            return Err(RelayError::Config("transfer.chunk_size_bytes must be > 0".into()));
        }
        if self.transfer.concurrency == 0 {
            return Err(RelayError::Config("transfer.concurrency must be > 0".into()));
        }
        if self.transfer.max_attempts == 0 {
            return Err(RelayError::Config("transfer.max_attempts must be > 0".into()));
        }
        if self.transfer.op_timeout_secs == 0 {
            return Err(RelayError::Config("transfer.op_timeout_secs must be > 0".into()));
        }
        if self.remote.folder.contains("..") {
            return Err(RelayError::Config("remote.folder must not contain '..'".into()));
        }
        Ok(())
    }
}
