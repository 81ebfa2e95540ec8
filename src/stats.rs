//! Read-side queries over the event store.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::StoreError;
use crate::models::DetectionEvent;
use crate::store::EventStore;

/// Aggregate figures over every stored detection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct DetectionStats {
    #[serde(rename = "totalDetections")]
    #[schema(example = 3)]
    pub total: u64,
    #[serde(rename = "activatedCount")]
    #[schema(example = 2)]
    pub activated: u64,
    #[serde(rename = "notActivatedCount")]
    #[schema(example = 1)]
    pub not_activated: u64,
    #[serde(rename = "maxRounds")]
    #[schema(example = 7)]
    pub max_rounds: u32,
}

impl DetectionStats {
    pub fn from_events(events: &[DetectionEvent]) -> Self {
        let total = events.len() as u64;
        let activated = events.iter().filter(|e| e.is_activated()).count() as u64;
        let max_rounds = events.iter().map(|e| e.rounds).max().unwrap_or(0);

        Self {
            total,
            activated,
            not_activated: total - activated,
            max_rounds,
        }
    }
}

/// Latest event, history, lookups and statistics for HTTP readers.
#[derive(Clone)]
pub struct DetectionQueryService {
    store: Arc<dyn EventStore>,
}

impl DetectionQueryService {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    pub async fn latest(&self) -> Result<Option<DetectionEvent>, StoreError> {
        Ok(self.store.list_recent(1).await?.into_iter().next())
    }

    pub async fn history(&self) -> Result<Vec<DetectionEvent>, StoreError> {
        self.store.list_all().await
    }

    pub async fn get(&self, id: i32) -> Result<Option<DetectionEvent>, StoreError> {
        self.store.get_by_id(id).await
    }

    pub async fn stats(&self) -> Result<DetectionStats, StoreError> {
        let events = self.store.list_all().await?;
        Ok(DetectionStats::from_events(&events))
    }
}
