//! Live resource streaming: shared watches and their subscribers

pub mod resource_service;
pub mod subscription_broker;
pub mod watch_hub;
