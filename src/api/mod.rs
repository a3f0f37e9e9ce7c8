//! HTTP layer.

pub mod routes;
pub mod upload;

pub use routes::{router, AppState};
