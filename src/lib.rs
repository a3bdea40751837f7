pub mod auth;
pub mod catalog;
pub mod config;
pub mod error;
pub mod models;
pub mod protocol;
pub mod proxy;
pub mod relay;
pub mod router;
pub mod server;
pub mod telemetry;
pub mod usage_collector;

pub use error::{Error, Result};
