//! OpenDAL Operator factory for chunkrelay remote backends

use anyhow::{Context, Result};
use opendal::Operator;
use relay_core::config::{RemoteBackend, RemoteConfig};

/// Remote login. Never read from the config file.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Build an operator for the configured backend.
///
/// WebDAV operators get logging and retry layers; transient failures are
/// retried with jitter before they ever reach the transfer coordinator.
pub fn build_operator(remote: &RemoteConfig, creds: Option<&Credentials>) -> Result<Operator> {
    match remote.backend {
        RemoteBackend::Webdav => build_webdav(remote, creds),
        RemoteBackend::Fs => {
            let builder = opendal::services::Fs::default().root(&remote.root);
            let op = Operator::new(builder)
                .context("creating OpenDAL fs operator")?
                .layer(opendal::layers::LoggingLayer::default())
                .finish();
            Ok(op)
        }
        RemoteBackend::Memory => memory_operator(),
    }
}

/// Process-local operator (tests, dry runs)
pub fn memory_operator() -> Result<Operator> {
    Ok(Operator::new(opendal::services::Memory::default())
        .context("creating OpenDAL memory operator")?
        .finish())
}

fn build_webdav(remote: &RemoteConfig, creds: Option<&Credentials>) -> Result<Operator> {
    if remote.endpoint.starts_with("http://") {
        if remote.enforce_tls {
            anyhow::bail!(
                "WebDAV endpoint uses plaintext HTTP ({}), but enforce_tls is enabled. \
                 Use an HTTPS endpoint or set remote.enforce_tls = false for local testing.",
                remote.endpoint
            );
        }
        tracing::warn!(
            endpoint = %remote.endpoint,
            "WebDAV endpoint uses plaintext HTTP; credentials are transmitted unencrypted"
        );
    }

    // opendal 0.55: builders use the consuming pattern
    let mut builder = opendal::services::Webdav::default()
        .endpoint(&remote.endpoint)
        .root(&remote.root);
    if let Some(c) = creds {
        builder = builder.username(&c.username).password(&c.password);
    }

    let op = Operator::new(builder)
        .context("creating OpenDAL WebDAV operator")?
        .layer(opendal::layers::LoggingLayer::default())
        .layer(
            opendal::layers::RetryLayer::new()
                .with_max_times(5)
                .with_jitter(),
        )
        .finish();

    Ok(op)
}
