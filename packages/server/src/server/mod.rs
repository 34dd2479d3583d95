pub mod app;
pub mod routes;

pub use app::{build_app, ApiError, AppState};
