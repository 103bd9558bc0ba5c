pub mod audit_log;
pub mod auth;
pub mod key_sweeper;
pub mod keys;
pub mod rate_limit;
pub mod scopes;
pub mod secrets;
pub mod signing;
pub mod token;
pub mod vault_client;
