//! HTTP status and routing API

pub mod handlers;
pub mod server;

pub use handlers::ApiResponse;
pub use server::{ApiServer, AppState};
