use std::sync::Arc;
use async_trait::async_trait;

use crate::core::state::runtime::k8s::watch_state::WatchState;

#[async_trait]
pub trait WatchStateRepositoryTrait: Send + Sync {

    /// Return the current state as an Arc, so readers never copy the summary.
    async fn get(&self) -> Arc<WatchState>;

    /// Mutate the state using a closure. The closure runs under the write lock.
    async fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut WatchState) + Send + Sync;
}
