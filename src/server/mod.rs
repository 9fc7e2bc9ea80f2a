//! HTTP control surface
//!
//! Thin translation from HTTP requests to [`crate::cluster::ClusterController`]
//! operations. Errors are rendered as `{"error": <tag>, "message": ...}`.

pub mod handlers;
pub mod shutdown;
pub mod state;

pub use handlers::{create_router, ApiError, ErrorResponse};
pub use shutdown::{shutdown_signal, wait_for_shutdown};
pub use state::AppState;
