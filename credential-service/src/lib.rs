pub mod app;
pub mod config;
pub mod cookies;
pub mod gateway;
pub mod handlers;
pub mod metrics;
pub mod sessions;
pub mod tls;
pub mod tokens;

pub use app::AppState;
