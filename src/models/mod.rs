//! # Data Models
//!
//! This module contains the data models used throughout trainwatch: the
//! SeaORM entities backing the collector's tables and the domain event that
//! travels from the bridge to the collector.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub mod datetime_record;
pub mod detection_event;
pub mod train_detection;

pub use datetime_record::Entity as DateTimeRecord;
pub use detection_event::{DetectionEvent, NewDetection, RELAY_ACTIVATED};
pub use train_detection::Entity as TrainDetection;

/// Basic service information response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    /// The name of the service
    pub service: String,
    /// The version of the service
    pub version: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            service: "trainwatch".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
