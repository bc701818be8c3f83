//! Storage health check

use crate::store::{RemoteStore, StoreResult};

/// Verify the remote folder is reachable and the credentials are accepted
pub async fn check_health<S: RemoteStore>(store: &S) -> StoreResult<()> {
    // Listing the folder is the lightest call that exercises auth
    store.list().await.map(|_| ())
}
