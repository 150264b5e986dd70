use std::sync::Arc;
use tokio::sync::RwLock;

use crate::core::state::runtime::k8s::watch_state::WatchState;
use crate::core::state::runtime::k8s::watch_state_repository_trait::WatchStateRepositoryTrait;

/// Single-writer, many-reader holder of one watch's published state.
pub struct WatchStateRepository {
    state: RwLock<Arc<WatchState>>,
}

impl WatchStateRepository {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(Arc::new(WatchState::default())),
        }
    }
}

impl Default for WatchStateRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl WatchStateRepositoryTrait for WatchStateRepository {
    async fn get(&self) -> Arc<WatchState> {
        self.state.read().await.clone()
    }

    async fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut WatchState) + Send + Sync,
    {
        let mut guard = self.state.write().await;

        // Readers holding the old Arc keep a consistent view.
        let mut new_state = (**guard).clone();
        f(&mut new_state);

        *guard = Arc::new(new_state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::runtime::k8s::watch_state::WatchPhase;

    #[tokio::test]
    async fn test_update_does_not_touch_held_snapshot() {
        let repo = WatchStateRepository::new();
        let before = repo.get().await;

        repo.update(|s| {
            s.phase = WatchPhase::Synced;
            s.revision += 1;
        })
        .await;

        assert_eq!(before.phase, WatchPhase::Uninitialized);
        let after = repo.get().await;
        assert_eq!(after.phase, WatchPhase::Synced);
        assert_eq!(after.revision, 1);
    }
}
