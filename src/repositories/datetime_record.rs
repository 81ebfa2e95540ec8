//! # DateTime Record Repository
//!
//! CRUD operations for the `datetime_records` table (operator-defined time
//! windows stored alongside the detections).

use chrono::{NaiveDateTime, Utc};
use sea_orm::{
    ActiveModelTrait, DatabaseConnection, EntityTrait, IntoActiveModel, NotSet, QueryOrder,
    QuerySelect, Set,
};

use crate::error::StoreError;
use crate::models::datetime_record::{ActiveModel, Column, Entity, Model};

/// Repository for time window records
pub struct DateTimeRecordRepository {
    db: DatabaseConnection,
}

fn validate_window(begin: NaiveDateTime, end: NaiveDateTime) -> Result<(), StoreError> {
    if end < begin {
        return Err(StoreError::validation_error(
            "endDateTime must not precede beginDateTime",
        ));
    }
    Ok(())
}

impl DateTimeRecordRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Create a new time window
    pub async fn create(
        &self,
        begin: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<Model, StoreError> {
        validate_window(begin, end)?;

        let record = ActiveModel {
            id: NotSet,
            begin_datetime: Set(begin),
            end_datetime: Set(end),
            created_at: Set(Utc::now().fixed_offset()),
        };

        let created = record
            .insert(&self.db)
            .await
            .map_err(StoreError::database_error)?;

        tracing::info!(id = created.id, "DateTime record created");
        Ok(created)
    }

    pub async fn find_by_id(&self, id: i32) -> Result<Option<Model>, StoreError> {
        Entity::find_by_id(id)
            .one(&self.db)
            .await
            .map_err(StoreError::database_error)
    }

    /// All records, most recently created first
    pub async fn list(&self) -> Result<Vec<Model>, StoreError> {
        Entity::find()
            .order_by_desc(Column::CreatedAt)
            .order_by_desc(Column::Id)
            .all(&self.db)
            .await
            .map_err(StoreError::database_error)
    }

    pub async fn latest(&self) -> Result<Option<Model>, StoreError> {
        Entity::find()
            .order_by_desc(Column::CreatedAt)
            .order_by_desc(Column::Id)
            .limit(1)
            .one(&self.db)
            .await
            .map_err(StoreError::database_error)
    }

    /// Replace both bounds; `None` when the record does not exist
    pub async fn update(
        &self,
        id: i32,
        begin: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<Option<Model>, StoreError> {
        validate_window(begin, end)?;

        let Some(existing) = self.find_by_id(id).await? else {
            return Ok(None);
        };

        let mut record = existing.into_active_model();
        record.begin_datetime = Set(begin);
        record.end_datetime = Set(end);

        let updated = record
            .update(&self.db)
            .await
            .map_err(StoreError::database_error)?;

        tracing::info!(id, "DateTime record updated");
        Ok(Some(updated))
    }

    /// Returns `false` when nothing was deleted
    pub async fn delete(&self, id: i32) -> Result<bool, StoreError> {
        let result = Entity::delete_by_id(id)
            .exec(&self.db)
            .await
            .map_err(StoreError::database_error)?;

        Ok(result.rows_affected > 0)
    }
}
