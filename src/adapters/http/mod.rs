//! HTTP surface adapters.

pub mod api;

pub use api::{build_router, serve, AppState};
