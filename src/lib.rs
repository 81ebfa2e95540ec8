//! # trainwatch
//!
//! Train detection telemetry: an MQTT bridge that relays device messages to
//! an HTTP collector, and the collector's event store with query and
//! statistics endpoints.

pub mod bridge;
pub mod codec;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod models;
pub mod mqtt;
pub mod relay;
pub mod repositories;
pub mod server;
pub mod stats;
pub mod store;
pub mod subscription;
pub mod telemetry;
pub use migration;

#[cfg(test)]
mod test_support;
