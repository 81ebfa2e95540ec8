//! # Event Store
//!
//! Append-only persistence for detection events. Events are ordered by the
//! device-supplied observation time, newest first, with ties broken by
//! ascending id so listings are reproducible.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, NotSet, QueryFilter,
    QueryOrder, QuerySelect, Select, Set,
};
use tokio::sync::Mutex;

use crate::error::{StoreError, is_unique_violation};
use crate::models::train_detection::{ActiveModel, Column, Entity, Model};
use crate::models::{DetectionEvent, NewDetection};

/// Storage contract shared by the collector handlers and the query service.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Assign `id` and `recorded_at` and append the event.
    ///
    /// Inserting again with a known dedupe key returns the stored event
    /// unchanged.
    async fn insert(&self, detection: NewDetection) -> Result<DetectionEvent, StoreError>;

    async fn get_by_id(&self, id: i32) -> Result<Option<DetectionEvent>, StoreError>;

    /// Every stored event, newest observation first.
    async fn list_all(&self) -> Result<Vec<DetectionEvent>, StoreError>;

    /// At most `limit` events, in the same order as [`EventStore::list_all`].
    async fn list_recent(&self, limit: u64) -> Result<Vec<DetectionEvent>, StoreError>;
}

/// SeaORM-backed event store.
///
/// Inserts go through a single writer lock so the dedupe lookup and the
/// append are not interleaved with another insert. Reads take no lock.
#[derive(Clone)]
pub struct DetectionStore {
    db: DatabaseConnection,
    write_lock: Arc<Mutex<()>>,
}

impl DetectionStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self {
            db,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    fn ordered() -> Select<Entity> {
        Entity::find()
            .order_by_desc(Column::ObservedAt)
            .order_by_asc(Column::Id)
    }

    async fn find_by_dedupe_key(&self, key: &str) -> Result<Option<Model>, StoreError> {
        Entity::find()
            .filter(Column::DedupeKey.eq(key))
            .one(&self.db)
            .await
            .map_err(StoreError::database_error)
    }
}

fn validate(event: &DetectionEvent) -> Result<i32, StoreError> {
    if event.state.trim().is_empty() {
        return Err(StoreError::validation_error("state must not be empty"));
    }
    i32::try_from(event.rounds)
        .map_err(|_| StoreError::validation_error("rounds exceeds the storable range"))
}

#[async_trait]
impl EventStore for DetectionStore {
    async fn insert(&self, detection: NewDetection) -> Result<DetectionEvent, StoreError> {
        let NewDetection { event, dedupe_key } = detection;
        let rounds = validate(&event)?;

        let _writer = self.write_lock.lock().await;

        if let Some(key) = dedupe_key.as_deref()
            && let Some(existing) = self.find_by_dedupe_key(key).await?
        {
            tracing::info!(id = existing.id, dedupe_key = %key, "Duplicate detection ignored");
            return Ok(existing.into());
        }

        let model = ActiveModel {
            id: NotSet,
            state: Set(event.state),
            rounds: Set(rounds),
            relay: Set(event.relay),
            observed_at: Set(event.observed_at),
            recorded_at: Set(Utc::now().fixed_offset()),
            dedupe_key: Set(dedupe_key.clone()),
        };

        match model.insert(&self.db).await {
            Ok(stored) => {
                tracing::debug!(id = stored.id, observed_at = %stored.observed_at, "Detection stored");
                Ok(stored.into())
            }
            // Another collector process sharing the database won the race.
            Err(err) if is_unique_violation(&err) => {
                let key = dedupe_key.unwrap_or_default();
                match self.find_by_dedupe_key(&key).await? {
                    Some(existing) => Ok(existing.into()),
                    None => Err(StoreError::database_error(err)),
                }
            }
            Err(err) => {
                tracing::error!(error = %err, "Failed to store detection");
                Err(StoreError::database_error(err))
            }
        }
    }

    async fn get_by_id(&self, id: i32) -> Result<Option<DetectionEvent>, StoreError> {
        let model = Entity::find_by_id(id)
            .one(&self.db)
            .await
            .map_err(StoreError::database_error)?;
        Ok(model.map(DetectionEvent::from))
    }

    async fn list_all(&self) -> Result<Vec<DetectionEvent>, StoreError> {
        let models = Self::ordered()
            .all(&self.db)
            .await
            .map_err(StoreError::database_error)?;
        Ok(models.into_iter().map(DetectionEvent::from).collect())
    }

    async fn list_recent(&self, limit: u64) -> Result<Vec<DetectionEvent>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let models = Self::ordered()
            .limit(limit)
            .all(&self.db)
            .await
            .map_err(StoreError::database_error)?;
        Ok(models.into_iter().map(DetectionEvent::from).collect())
    }
}
