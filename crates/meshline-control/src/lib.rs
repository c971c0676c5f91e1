//! HTTP transport for provider callbacks and read-only task lookups.

pub mod config;
pub mod routes;
pub mod security;
pub mod state;

pub use config::ControlConfig;
pub use routes::router;
pub use state::AppState;
