mod auth;
mod connection;
mod lane;
mod middleware;
mod protocol;
mod routes;
mod server;
mod state;
mod transport;

pub use auth::{mint_token, verify_token};
pub use server::GatewayServer;
pub use transport::{OutputRecorder, ProviderTransport};
