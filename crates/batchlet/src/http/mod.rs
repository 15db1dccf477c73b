//! HTTP transport: route handlers and server lifecycle.

pub mod routes;
pub mod server;

pub use routes::{AppState, ModelMetadata, routes};
pub use server::{ServerConfig, serve};
