//! Controllers: thin adapters from HTTP extractors to the engine's services.

pub mod context;
pub mod resource;
pub mod session;
pub mod stream;
pub mod system;
