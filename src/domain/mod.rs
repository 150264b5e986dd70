pub mod cluster;
pub mod session;
pub mod system;
pub mod watch;
