pub mod config;
pub mod error;
pub mod limiter;
pub mod metrics;
pub mod plugin;
pub mod proxy;
pub mod routing;
pub mod server;
pub mod upstream;
