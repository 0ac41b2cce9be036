//! GigMatch API Server library
//!
//! Exposes the router, state, and configuration for the API binary and for
//! integration tests.

pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use routes::create_router;
pub use state::AppState;
