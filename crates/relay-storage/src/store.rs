//! Folder-scoped remote store used by producer and consumer
//!
//! Names are flat (`manifest.txt`, `movie.mkv.part003`); the store maps them
//! under its folder. `RemoteStore` is the seam the transfer coordinator is
//! generic over, so tests can substitute an instrumented store.

use opendal::{ErrorKind, Operator};
use std::future::Future;
use thiserror::Error;

/// Remote object name of the manifest
pub const MANIFEST_NAME: &str = "manifest.txt";

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("remote object not found: {0}")]
    NotFound(String),

    /// Credentials rejected; never retried automatically
    #[error("remote authentication failed: {0}")]
    Auth(String),

    /// Network or server hiccup; safe to retry
    #[error("remote transient error: {0}")]
    Transient(String),
}

impl From<opendal::Error> for StoreError {
    fn from(e: opendal::Error) -> Self {
        match e.kind() {
            ErrorKind::NotFound => StoreError::NotFound(e.to_string()),
            ErrorKind::PermissionDenied | ErrorKind::ConfigInvalid => {
                StoreError::Auth(e.to_string())
            }
            _ => StoreError::Transient(e.to_string()),
        }
    }
}

/// list / exists / get / put / delete over one remote folder.
pub trait RemoteStore: Send + Sync + 'static {
    /// Names of the files currently in the folder
    fn list(&self) -> impl Future<Output = StoreResult<Vec<String>>> + Send;

    fn exists(&self, name: &str) -> impl Future<Output = StoreResult<bool>> + Send;

    fn get(&self, name: &str) -> impl Future<Output = StoreResult<Vec<u8>>> + Send;

    fn put(&self, name: &str, data: Vec<u8>) -> impl Future<Output = StoreResult<()>> + Send;

    /// Deleting an object that is already gone is not an error.
    fn delete(&self, name: &str) -> impl Future<Output = StoreResult<()>> + Send;
}

/// `RemoteStore` backed by an OpenDAL operator
#[derive(Clone, Debug)]
pub struct OpendalStore {
    op: Operator,
    folder: String,
}

impl OpendalStore {
    pub fn new(op: Operator, folder: &str) -> Self {
        Self {
            op,
            folder: folder.trim_matches('/').to_string(),
        }
    }

    fn key(&self, name: &str) -> String {
        if self.folder.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.folder, name)
        }
    }

    fn dir(&self) -> String {
        if self.folder.is_empty() {
            "/".to_string()
        } else {
            format!("{}/", self.folder)
        }
    }
}

impl RemoteStore for OpendalStore {
    async fn list(&self) -> StoreResult<Vec<String>> {
        let entries = match self.op.list(&self.dir()).await {
            Ok(entries) => entries,
            // A folder that was never created is simply empty
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(entries
            .into_iter()
            .filter(|e| e.metadata().is_file())
            .map(|e| e.name().to_string())
            .collect())
    }

    async fn exists(&self, name: &str) -> StoreResult<bool> {
        Ok(self.op.exists(&self.key(name)).await?)
    }

    async fn get(&self, name: &str) -> StoreResult<Vec<u8>> {
        let buf = self.op.read(&self.key(name)).await?;
        Ok(buf.to_vec())
    }

    async fn put(&self, name: &str, data: Vec<u8>) -> StoreResult<()> {
        self.op.write(&self.key(name), data).await?;
        Ok(())
    }

    async fn delete(&self, name: &str) -> StoreResult<()> {
        match self.op.delete(&self.key(name)).await {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_operator;

    #[tokio::test]
    async fn put_get_delete_cycle() {
        let store = OpendalStore::new(memory_operator().unwrap(), "chunks");

        store.put("a.part000", b"AB".to_vec()).await.unwrap();
        assert!(store.exists("a.part000").await.unwrap());
        assert_eq!(store.get("a.part000").await.unwrap(), b"AB");

        store.delete("a.part000").await.unwrap();
        assert!(!store.exists("a.part000").await.unwrap());
        // Second delete is a no-op
        store.delete("a.part000").await.unwrap();
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let store = OpendalStore::new(memory_operator().unwrap(), "chunks");
        let err = store.get("ghost.part000").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn list_is_scoped_to_folder() {
        let op = memory_operator().unwrap();
        let store = OpendalStore::new(op.clone(), "/chunks/");
        let other = OpendalStore::new(op, "elsewhere");

        assert!(store.list().await.unwrap().is_empty());
        store.put(MANIFEST_NAME, b"".to_vec()).await.unwrap();
        store.put("b.part001", b"x".to_vec()).await.unwrap();
        other.put("c.part000", b"y".to_vec()).await.unwrap();

        let mut names = store.list().await.unwrap();
        names.sort();
        assert_eq!(names, vec!["b.part001".to_string(), MANIFEST_NAME.to_string()]);
    }

    #[test]
    fn classifies_opendal_errors() {
        let auth: StoreError =
            opendal::Error::new(ErrorKind::PermissionDenied, "401 Unauthorized").into();
        assert!(matches!(auth, StoreError::Auth(_)));
        let nf: StoreError = opendal::Error::new(ErrorKind::NotFound, "404").into();
        assert!(matches!(nf, StoreError::NotFound(_)));
        let t: StoreError = opendal::Error::new(ErrorKind::Unexpected, "reset").into();
        assert!(matches!(t, StoreError::Transient(_)));
    }
}
