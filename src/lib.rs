pub mod admission;
pub mod aggregator;
pub mod cache;
pub mod config;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod server;
pub mod upstream;
pub mod webhook;

pub use config::Config;
pub use error::{GatewayError, Result};
pub use server::{create_app, Server};
