//! Detection event domain type
//!
//! A [`DetectionEvent`] is one observed state transition reported by the
//! trackside device. The same type is decoded from MQTT payloads, forwarded
//! to the collector, and returned by the collector's query endpoints.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::train_detection::Model as TrainDetectionModel;

/// Relay value counted as "activated" in detection statistics.
pub const RELAY_ACTIVATED: &str = "activated";

/// One observed state transition of the monitored track section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DetectionEvent {
    /// Identifier assigned by the event store (absent before insertion)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(example = 42)]
    pub id: Option<i32>,
    /// Short classification of the detection
    #[schema(example = "approaching")]
    pub state: String,
    /// Detection cycle counter
    #[schema(example = 7)]
    pub rounds: u32,
    /// Relay state reported by the device
    #[schema(example = "activated")]
    pub relay: String,
    /// Device-supplied observation time (local, no offset)
    #[serde(rename = "timestamp")]
    #[schema(value_type = String, example = "2024-01-15T10:30:00")]
    pub observed_at: NaiveDateTime,
    /// Time the event store accepted the event
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<String>, example = "2024-01-15T10:30:02Z")]
    pub recorded_at: Option<DateTime<Utc>>,
}

impl DetectionEvent {
    /// Build an event that has not been stored yet.
    pub fn new(
        state: impl Into<String>,
        rounds: u32,
        relay: impl Into<String>,
        observed_at: NaiveDateTime,
    ) -> Self {
        Self {
            id: None,
            state: state.into(),
            rounds,
            relay: relay.into(),
            observed_at,
            recorded_at: None,
        }
    }

    pub fn is_activated(&self) -> bool {
        self.relay == RELAY_ACTIVATED
    }
}

impl From<TrainDetectionModel> for DetectionEvent {
    fn from(model: TrainDetectionModel) -> Self {
        Self {
            id: Some(model.id),
            state: model.state,
            rounds: u32::try_from(model.rounds).unwrap_or_default(),
            relay: model.relay,
            observed_at: model.observed_at,
            recorded_at: Some(model.recorded_at.with_timezone(&Utc)),
        }
    }
}

/// Insert request for the event store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDetection {
    pub event: DetectionEvent,
    /// Idempotency key; repeated inserts with the same key return the first row
    pub dedupe_key: Option<String>,
}

impl NewDetection {
    pub fn new(event: DetectionEvent) -> Self {
        Self {
            event,
            dedupe_key: None,
        }
    }

    pub fn with_dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }
}
