//! relay-storage: the intermediate remote folder chunks pass through

pub mod health;
pub mod operator;
pub mod store;

pub use health::check_health;
pub use operator::{build_operator, memory_operator, Credentials};
pub use store::{OpendalStore, RemoteStore, StoreError, StoreResult, MANIFEST_NAME};
