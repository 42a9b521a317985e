//! REST API module: the tick/oauth-callback/admin surface, built on
//! `axum`. Trimmed to the four files this crate's narrower surface needs.

pub mod cors;
pub mod middleware;
pub mod server;
pub mod types;

pub use server::RestApiServer;
pub use types::AppState;
