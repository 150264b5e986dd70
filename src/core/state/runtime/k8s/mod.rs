pub mod resource_snapshot;
pub mod watch_state;
pub mod watch_state_repository;
pub mod watch_state_repository_trait;
