pub mod client;
pub mod logging;
pub mod state;
pub mod util;
