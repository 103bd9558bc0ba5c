pub mod admin;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod proxy;
pub mod server;

pub use dispatcher::{Dispatcher, RouteTable};
pub use error::GatewayError;
pub use server::{create_admin_router, create_router, serve, GatewayState, SharedState};
