pub mod aggregator;
pub mod api;
pub mod backend;
pub mod config;
pub mod error;
pub mod inventory;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod proto;
pub mod tap;

#[cfg(test)]
mod testing;

pub use error::{GatewayError, Result};
