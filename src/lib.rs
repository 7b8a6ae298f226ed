pub mod admission;
pub mod app;
pub mod artifacts;
pub mod client_identity;
pub mod config;
pub mod engine;
pub mod error;
pub mod extraction;
pub mod filename;
pub mod handlers;
pub mod verification;

pub use app::{AppState, build_cors_layer, router};
pub use config::Config;
