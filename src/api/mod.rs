//! HTTP surface: controllers, DTOs and route tables under `/api/v1`.

pub mod controller;
pub mod dto;
pub mod routes;
pub mod util;
