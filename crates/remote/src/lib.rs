pub mod error;
pub mod models;
pub mod store;

#[cfg(feature = "mock")]
pub use crate::store::MockStore;
pub use crate::store::{PostgrestStore, RemoteStore, RetryPolicy, RetryingStore};
use std::sync::Arc;

pub type StoreHandle = Arc<dyn RemoteStore + Send + Sync>;
