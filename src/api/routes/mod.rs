//! API route declarations (e.g., /api/v1/*)

pub mod context_routes;
pub mod resource_routes;
pub mod session_routes;
pub mod system_routes;
