//! HTTP surface of the proxy: token minting and request relay

pub mod authorize;
pub mod engine;
pub mod mint;
pub mod router;
pub mod server;
pub mod tee;

pub use router::{AppState, create_router};
pub use server::Gateway;
