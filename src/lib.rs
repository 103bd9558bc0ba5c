pub mod config;
pub mod gateway;
pub mod monitoring;
pub mod security;
pub mod transport;
pub mod utils;
pub mod waf;

// Crate version exposed for runtime queries
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
